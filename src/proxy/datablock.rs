//! Proxy of one standalone or embedded datablock.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::SyncError;
use crate::ident::DatablockId;
use crate::path::PathStep;
use crate::specifics::Registry;
use crate::state::Context;
use crate::store::entity::{Datablock, EntityKind};
use crate::store::value::LiveValue;
use crate::Store;

use super::attributes;
use super::delta::{BulkUpdate, Delta, DeltaValue, StructDelta};
use super::struct_proxy::StructProxy;
use super::Proxy;

/// Snapshot of one datablock: its stable id, bucket, kind and attribute
/// tree. The name rides in `data` under the `"name"` member so that two
/// replicas holding the same snapshot compare equal, but names are only
/// ever written through the rename protocol, never through `save`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatablockProxy {
    pub uuid: DatablockId,
    /// Store bucket. Empty for embedded datablocks, which live inside
    /// their owner rather than in a bucket.
    pub bucket: String,
    pub kind: EntityKind,
    pub data: StructProxy,
}

impl DatablockProxy {
    /// Snapshot a standalone datablock. Records the visited id so that
    /// nested bulk updates and unresolved references attach to it, and
    /// feeds the data-usage index when the datablock is a container.
    pub fn load(block: &Datablock, ctx: &mut Context, store: &Store) -> Result<Self, SyncError> {
        ctx.visit.datablock = Some(block.id);
        let proxy = Self::load_any(block, ctx, store)?;
        if block.kind == EntityKind::Object {
            if let Some(data) = block.data_ref() {
                ctx.state.objects.entry(data).or_default().insert(block.id);
            }
        }
        Ok(proxy)
    }

    /// Snapshot a datablock owned by its parent attribute.
    pub fn load_embedded(
        block: &Datablock,
        ctx: &mut Context,
        store: &Store,
    ) -> Result<Self, SyncError> {
        Self::load_any(block, ctx, store)
    }

    fn load_any(block: &Datablock, ctx: &mut Context, store: &Store) -> Result<Self, SyncError> {
        let mut data = StructProxy::default();
        for (name, value) in &block.attrs {
            if !ctx.filter.eligible(block.kind, name)
                || ctx.filter.conditionally_skipped(block, name)
            {
                continue;
            }
            if let Err(err) = ctx.enter_field(name) {
                warn!(attr = %name, %err, "skipping over-deep attribute");
                continue;
            }
            let result = attributes::read_attribute(value, ctx, store);
            ctx.exit_field();
            data.members.insert(name.clone(), result?);
        }
        data.members.insert(
            "name".to_string(),
            Proxy::Scalar(super::ScalarValue::Str(block.name.clone())),
        );
        Ok(Self {
            uuid: block.id,
            bucket: if block.embedded {
                String::new()
            } else {
                block.kind.bucket().unwrap_or_default().to_string()
            },
            kind: block.kind,
            data,
        })
    }

    pub fn is_embedded(&self) -> bool {
        self.bucket.is_empty()
    }

    pub fn name(&self) -> &str {
        self.data
            .member("name")
            .and_then(Proxy::as_str)
            .unwrap_or_default()
    }

    pub fn rename(&mut self, name: &str) {
        self.data.members.insert(
            "name".to_string(),
            Proxy::Scalar(super::ScalarValue::Str(name.to_string())),
        );
    }

    pub fn attr_str(&self, name: &str) -> Option<&str> {
        self.data.member(name).and_then(Proxy::as_str)
    }

    pub fn attr_int(&self, name: &str) -> Option<i64> {
        self.data.member(name).and_then(Proxy::as_int)
    }

    pub fn ref_target(&self, name: &str) -> Option<DatablockId> {
        self.data.member(name).and_then(Proxy::ref_target)
    }

    /// Write every captured attribute into the live datablock. The
    /// constructor has already produced a block of the right kind; this
    /// fills in the rest. The name is excluded, renames have their own
    /// protocol.
    pub fn save(&self, block: &mut Datablock, ctx: &mut Context) -> Result<(), SyncError> {
        ctx.visit.datablock = Some(block.id);
        self.save_any(block, ctx)
    }

    /// Write into an embedded datablock. The embedded id is adopted from
    /// the proxy so both replicas hold structurally identical owners.
    pub fn save_embedded(&self, block: &mut Datablock, ctx: &mut Context) -> Result<(), SyncError> {
        block.id = self.uuid;
        block.kind = self.kind;
        block.name = self.name().to_string();
        self.save_any(block, ctx)
    }

    fn save_any(&self, block: &mut Datablock, ctx: &mut Context) -> Result<(), SyncError> {
        for (name, member) in &self.data.members {
            if name == "name" {
                continue;
            }
            if let Err(err) = ctx.enter_field(name) {
                warn!(attr = %name, %err, "skipping over-deep attribute");
                continue;
            }
            // set_attr quirks (a light's kind reset) must see writes go
            // through the datablock, so top-level slots are staged
            let mut slot = block.attr(name).cloned().unwrap_or(LiveValue::None);
            let result = attributes::write_attribute(&mut slot, member, ctx);
            ctx.exit_field();
            result?;
            block.set_attr(name, slot);
        }
        Ok(())
    }

    /// Produce an embedded block shell this proxy can be saved into.
    pub fn make_embedded_block(&self) -> Datablock {
        let mut block = Datablock::new_embedded(self.kind, self.name());
        block.id = self.uuid;
        block
    }

    /// Compare the live datablock against this snapshot. Renames are
    /// detected at the collection level, so the name member is excluded
    /// here. Bulk buffer changes end up in the visit state, not in the
    /// returned delta.
    pub fn diff(
        &self,
        block: &Datablock,
        ctx: &mut Context,
        store: &Store,
    ) -> Result<Option<Delta>, SyncError> {
        ctx.visit.datablock = Some(block.id);
        self.diff_any(block, ctx, store).map(|delta| {
            delta.map(|d| Delta::Update(DeltaValue::Struct(d)))
        })
    }

    pub fn diff_embedded(
        &self,
        block: &Datablock,
        ctx: &mut Context,
        store: &Store,
    ) -> Result<Option<StructDelta>, SyncError> {
        self.diff_any(block, ctx, store)
    }

    fn diff_any(
        &self,
        block: &Datablock,
        ctx: &mut Context,
        store: &Store,
    ) -> Result<Option<StructDelta>, SyncError> {
        let mut delta = StructDelta::default();
        for (name, value) in &block.attrs {
            if !ctx.filter.eligible(block.kind, name)
                || ctx.filter.conditionally_skipped(block, name)
            {
                continue;
            }
            if let Err(err) = ctx.enter_field(name) {
                warn!(attr = %name, %err, "skipping over-deep attribute");
                continue;
            }
            let result = match self.data.member(name) {
                Some(member) => attributes::diff_attribute(value, member, ctx, store),
                None => attributes::read_attribute(value, ctx, store)
                    .map(|p| Some(Delta::Update(DeltaValue::Set(p)))),
            };
            ctx.exit_field();
            if let Some(d) = result? {
                delta.members.insert(name.clone(), d);
            }
        }
        Ok(if delta.is_empty() { None } else { Some(delta) })
    }

    /// Merge an incoming delta into this proxy and, when the live block
    /// is present, into live state. With no live block the proxy still
    /// advances, which is how a receiver keeps proxies for datablocks it
    /// could not materialize.
    pub fn apply(&mut self, block: Option<&mut Datablock>, delta: &Delta, ctx: &mut Context) {
        let struct_delta = match delta {
            Delta::Update(DeltaValue::Struct(d)) => d,
            Delta::Replace(Proxy::Struct(data)) => {
                self.data = data.clone();
                if let Some(block) = block {
                    ctx.visit.datablock = Some(block.id);
                    if let Err(err) = self.save_any(block, ctx) {
                        warn!(uuid = %self.uuid, %err, "could not save replacement");
                    }
                }
                return;
            }
            _ => {
                warn!(uuid = %self.uuid, "malformed datablock delta, ignoring");
                return;
            }
        };
        self.apply_struct(block, struct_delta, ctx);
    }

    pub fn apply_embedded(
        &mut self,
        block: Option<&mut Datablock>,
        delta: &StructDelta,
        ctx: &mut Context,
    ) {
        self.apply_struct(block, delta, ctx);
    }

    fn apply_struct(&mut self, block: Option<&mut Datablock>, delta: &StructDelta, ctx: &mut Context) {
        match block {
            Some(block) => {
                if !block.embedded {
                    ctx.visit.datablock = Some(block.id);
                }
                for (name, member_delta) in &delta.members {
                    if name == "name" {
                        continue;
                    }
                    let current = self.data.members.remove(name).unwrap_or(Proxy::None);
                    let mut slot = block.attr(name).cloned().unwrap_or(LiveValue::None);
                    if let Err(err) = ctx.enter_field(name) {
                        warn!(attr = %name, %err, "skipping over-deep attribute");
                        self.data.members.insert(name.clone(), current);
                        continue;
                    }
                    let updated =
                        attributes::apply_attribute(Some(&mut slot), current, member_delta, ctx);
                    ctx.exit_field();
                    block.set_attr(name, slot);
                    self.data.members.insert(name.clone(), updated);
                }
            }
            None => {
                let mut pruned = delta.clone();
                pruned.members.remove("name");
                self.data.apply(None, &pruned, ctx);
            }
        }
    }

    /// Apply a path-keyed bulk update to the buffers under `path`.
    /// Growing or shrinking a non-empty live buffer is refused unless
    /// the kind is registered as resizable.
    pub fn apply_bulk(
        &mut self,
        mut block: Option<&mut Datablock>,
        update: &BulkUpdate,
        registry: &Registry,
    ) -> Result<(), SyncError> {
        for member in &update.members {
            let mut steps: Vec<PathStep> = update.path.steps().to_vec();
            steps.push(member.step.clone());

            let target = match proxy_at_path_mut(&mut self.data, &steps) {
                Some(Proxy::Bulk(bulk)) => bulk,
                Some(other) => {
                    warn!(path = %update.path, member = %member.step,
                        found = other.kind_name(), "bulk update against a non-buffer, ignoring");
                    continue;
                }
                None => {
                    warn!(path = %update.path, member = %member.step,
                        "bulk update path not found, ignoring");
                    continue;
                }
            };

            let live = block
                .as_deref_mut()
                .and_then(|b| b.value_at_path_mut(&steps));
            let buffer = match live {
                Some(LiveValue::Buffer(buffer)) => {
                    let live_count = buffer.element_count();
                    let incoming_count = if member.dim == 0 {
                        0
                    } else {
                        member.data.len() / member.dim
                    };
                    if live_count != incoming_count
                        && live_count != 0
                        && !registry.can_resize(self.kind)
                    {
                        let mut full = update.path.clone();
                        full.push(member.step.clone());
                        return Err(SyncError::GeometryResize {
                            path: full.to_string(),
                            live: live_count,
                            incoming: incoming_count,
                        });
                    }
                    Some(buffer)
                }
                _ => None,
            };
            target.apply_member(buffer, member);
        }
        Ok(())
    }
}

/// Walk a proxy tree along a path of fields and indices.
fn proxy_at_path_mut<'a>(root: &'a mut StructProxy, steps: &[PathStep]) -> Option<&'a mut Proxy> {
    let (first, rest) = steps.split_first()?;
    let mut proxy = match first {
        PathStep::Field(name) => root.members.get_mut(name)?,
        PathStep::Index(_) => return None,
    };
    for step in rest {
        proxy = match (proxy, step) {
            (Proxy::Struct(s), PathStep::Field(name)) => s.members.get_mut(name)?,
            (Proxy::Sequence(s), PathStep::Index(i)) => s.items.get_mut(*i)?,
            (Proxy::Embedded(e), PathStep::Field(name)) => e.data.members.get_mut(name)?,
            _ => return None,
        };
    }
    Some(proxy)
}
