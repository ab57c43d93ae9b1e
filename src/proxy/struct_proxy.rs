//! Proxy of a plain struct value: a name-keyed map of member proxies.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::SyncError;
use crate::state::Context;
use crate::store::value::LiveValue;
use crate::Store;

use super::attributes;
use super::delta::{Delta, DeltaValue, StructDelta};
use super::Proxy;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructProxy {
    pub members: BTreeMap<String, Proxy>,
}

impl StructProxy {
    pub fn member(&self, name: &str) -> Option<&Proxy> {
        self.members.get(name)
    }

    /// Snapshot the eligible members of a live struct.
    pub fn load(
        fields: &BTreeMap<String, LiveValue>,
        ctx: &mut Context,
        store: &Store,
    ) -> Result<Self, SyncError> {
        let mut proxy = StructProxy::default();
        for (name, value) in fields {
            if !ctx.filter.eligible_nested(name) {
                continue;
            }
            if let Err(err) = ctx.enter_field(name) {
                warn!(member = %name, %err, "skipping over-deep attribute");
                continue;
            }
            let result = attributes::read_attribute(value, ctx, store);
            ctx.exit_field();
            proxy.members.insert(name.clone(), result?);
        }
        Ok(proxy)
    }

    /// Write every member into the live struct, creating missing slots.
    pub fn save(
        &self,
        fields: &mut BTreeMap<String, LiveValue>,
        ctx: &mut Context,
    ) -> Result<(), SyncError> {
        for (name, member) in &self.members {
            let slot = fields
                .entry(name.clone())
                .or_insert(LiveValue::None);
            if let Err(err) = ctx.enter_field(name) {
                warn!(member = %name, %err, "skipping over-deep attribute");
                continue;
            }
            let result = attributes::write_attribute(slot, member, ctx);
            ctx.exit_field();
            result?;
        }
        Ok(())
    }

    /// Compare against live, member by member. Live drives the walk: a
    /// member the proxy never captured is reported as a fresh set.
    pub fn diff(
        &self,
        fields: &BTreeMap<String, LiveValue>,
        ctx: &mut Context,
        store: &Store,
    ) -> Result<Option<StructDelta>, SyncError> {
        let mut delta = StructDelta::default();
        for (name, value) in fields {
            if !ctx.filter.eligible_nested(name) {
                continue;
            }
            if let Err(err) = ctx.enter_field(name) {
                warn!(member = %name, %err, "skipping over-deep attribute");
                continue;
            }
            let result = match self.members.get(name) {
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

    /// Merge a struct delta into this proxy and, when present, into the
    /// live struct. A member that fails to write is logged and skipped
    /// so one bad attribute cannot poison its siblings.
    pub fn apply(
        &mut self,
        mut fields: Option<&mut BTreeMap<String, LiveValue>>,
        delta: &StructDelta,
        ctx: &mut Context,
    ) {
        for (name, member_delta) in &delta.members {
            let current = self.members.remove(name).unwrap_or(Proxy::None);
            let slot = fields
                .as_deref_mut()
                .map(|f| f.entry(name.clone()).or_insert(LiveValue::None));
            if ctx.enter_field(name).is_err() {
                warn!(member = %name, "attribute nesting too deep, skipping");
                self.members.insert(name.clone(), current);
                continue;
            }
            let updated = attributes::apply_attribute(slot, current, member_delta, ctx);
            ctx.exit_field();
            self.members.insert(name.clone(), updated);
        }
    }
}
