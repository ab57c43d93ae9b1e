//! The synchronization session.
//!
//! One `SyncSession` pairs a live [`Store`] with the proxy state that
//! mirrors it. On the sending side, [`SyncSession::update`] diffs live
//! state against the snapshot and produces an ordered [`Changeset`]. On
//! the receiving side, the `create_datablock` / `update_datablock` /
//! `remove_datablock` / `rename_datablocks` / `update_bulk` family
//! applies inbound commands and keeps the snapshot in lockstep, so both
//! replicas hold identical proxy state even when live state diverges
//! (a datablock that could not be materialized, an untrusted update).

mod collection;

pub use collection::CollectionProxy;

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::changeset::{Changeset, Removal, Rename};
use crate::error::SyncError;
use crate::filter::SyncFilter;
use crate::ident::DatablockId;
use crate::proxy::datablock::DatablockProxy;
use crate::proxy::delta::{BulkUpdate, DatablockDelta};
use crate::specifics::{pre_save, Registry};
use crate::state::{Context, ProxyState};
use crate::store::entity::EntityKind;
use crate::store::{Store, BUCKET_NAMES};

pub struct SyncSession {
    pub state: ProxyState,
    collections: BTreeMap<String, CollectionProxy>,
    /// Creations whose constructor could not run yet, typically a shape
    /// key arriving before any object uses its keyed data. Retried when
    /// later creations land.
    delayed: Vec<DatablockProxy>,
    filter: SyncFilter,
    registry: Registry,
}

impl Default for SyncSession {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncSession {
    pub fn new() -> Self {
        Self::with_parts(SyncFilter::standard(), Registry::standard())
    }

    pub fn with_parts(filter: SyncFilter, registry: Registry) -> Self {
        let collections = BUCKET_NAMES
            .iter()
            .map(|name| (name.to_string(), CollectionProxy::default()))
            .collect();
        Self {
            state: ProxyState::default(),
            collections,
            delayed: Vec::new(),
            filter,
            registry,
        }
    }

    pub fn filter(&self) -> &SyncFilter {
        &self.filter
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Snapshot the whole store. A datablock that fails to load is
    /// logged and skipped; the rest of the store still loads.
    pub fn load(&mut self, store: &Store) {
        for bucket in BUCKET_NAMES {
            let Some(blocks) = store.bucket(bucket) else {
                continue;
            };
            for block in blocks {
                let mut ctx = Context::new(&mut self.state, &self.filter, &self.registry);
                match DatablockProxy::load(block, &mut ctx, store) {
                    Ok(proxy) => self.register(proxy),
                    Err(err) => {
                        warn!(bucket = %bucket, name = %block.name, %err, "could not snapshot datablock")
                    }
                }
            }
        }
        info!(proxies = self.state.proxies.len(), "store snapshot loaded");
    }

    pub fn clear(&mut self) {
        self.state.clear();
        for collection in self.collections.values_mut() {
            *collection = CollectionProxy::default();
        }
        self.delayed.clear();
    }

    fn register(&mut self, proxy: DatablockProxy) {
        let uuid = proxy.uuid;
        self.state.datablocks.insert(uuid, proxy.kind);
        if let Some(collection) = self.collections.get_mut(&proxy.bucket) {
            collection.claim(proxy.name(), uuid);
        }
        self.state.proxies.insert(uuid, proxy);
    }

    fn unregister(&mut self, uuid: DatablockId) {
        if let Some(proxy) = self.state.proxies.remove(&uuid) {
            if let Some(collection) = self.collections.get_mut(&proxy.bucket) {
                collection.release(proxy.name());
            }
        }
        self.state.datablocks.remove(&uuid);
        self.state.objects.remove(&uuid);
        for users in self.state.objects.values_mut() {
            users.remove(&uuid);
        }
    }

    // ----- sending side -----------------------------------------------

    /// Diff live state against the snapshot and produce the ordered
    /// changeset of everything that happened since the last cycle.
    pub fn update(&mut self, store: &mut Store) -> Changeset {
        let mut changeset = Changeset::default();

        for bucket in BUCKET_NAMES {
            let diff = crate::diff::CollectionDiff::compute(bucket, store, &self.state);
            for (uuid, kind) in diff.removed {
                self.unregister(uuid);
                changeset.removals.push(Removal { uuid, kind });
            }
            for (uuid, old_name, new_name) in diff.renamed {
                if let Some(proxy) = self.state.proxies.get_mut(&uuid) {
                    proxy.rename(&new_name);
                }
                if let Some(collection) = self.collections.get_mut(*bucket) {
                    collection.rename(&old_name, &new_name, uuid);
                }
                changeset.renames.push(Rename {
                    uuid,
                    old_name,
                    new_name,
                    reason: String::new(),
                });
            }
            for uuid in diff.created {
                let Some(block) = store.get(uuid) else {
                    continue;
                };
                let mut ctx = Context::new(&mut self.state, &self.filter, &self.registry);
                match DatablockProxy::load(block, &mut ctx, store) {
                    Ok(proxy) => {
                        changeset.creations.push(proxy.clone());
                        self.register(proxy);
                    }
                    Err(err) => {
                        warn!(bucket = %bucket, name = %block.name, %err, "could not snapshot creation")
                    }
                }
            }
        }

        let ids: Vec<DatablockId> = self.state.proxies.keys().copied().collect();
        for uuid in ids {
            if let Err(err) = self.diff_datablock(store, uuid, &mut changeset) {
                warn!(%uuid, %err, "diff failed, datablock left unsynchronized");
            }
        }

        changeset.sort();
        changeset
    }

    /// Diff one datablock, advancing its proxy so the next cycle starts
    /// from the state just reported.
    fn diff_datablock(
        &mut self,
        store: &Store,
        uuid: DatablockId,
        changeset: &mut Changeset,
    ) -> Result<(), SyncError> {
        let Some(mut proxy) = self.state.proxies.remove(&uuid) else {
            return Ok(());
        };
        // kinds with untrusted change notifications never diff after
        // creation; their contents are refreshed by out-of-band means
        if !self.filter.trusted_update(proxy.kind) {
            self.state.proxies.insert(uuid, proxy);
            return Ok(());
        }
        let Some(block) = store.get(uuid) else {
            self.state.proxies.insert(uuid, proxy);
            return Ok(());
        };

        let mut ctx = Context::new(&mut self.state, &self.filter, &self.registry);
        let result = proxy.diff(block, &mut ctx, store);
        let bulk = std::mem::take(&mut ctx.visit.bulk_updates);
        let delta = match result {
            Ok(delta) => delta,
            Err(err) => {
                self.state.proxies.insert(uuid, proxy);
                return Err(err);
            }
        };

        if let Some(delta) = delta {
            let mut ctx = Context::new(&mut self.state, &self.filter, &self.registry);
            proxy.apply(None, &delta, &mut ctx);
            changeset.updates.push(DatablockDelta {
                uuid,
                bucket: proxy.bucket.clone(),
                kind: proxy.kind,
                delta,
            });
        }
        for update in bulk {
            if let Err(err) = proxy.apply_bulk(None, &update, &self.registry) {
                warn!(%uuid, %err, "could not advance proxy buffers");
            }
            changeset.bulk_updates.push((uuid, update));
        }

        self.state.proxies.insert(uuid, proxy);
        Ok(())
    }

    // ----- receiving side ---------------------------------------------

    /// Materialize an inbound creation. When the requested name is
    /// already claimed by a synchronized datablock, the local holder
    /// yields it: the holder moves to a name derived from its own id
    /// and that rename is returned for broadcast. Both peers of a
    /// concurrent creation do this symmetrically, their renames cross,
    /// and every replica ends up with the same name per id. A creation
    /// whose constructor cannot run yet is parked and retried by
    /// [`SyncSession::flush_delayed`].
    pub fn create_datablock(
        &mut self,
        store: &mut Store,
        proxy: DatablockProxy,
    ) -> Result<Option<Rename>, SyncError> {
        let uuid = proxy.uuid;
        if self.state.proxies.contains_key(&uuid) {
            debug!(%uuid, "creation for a known datablock, ignoring");
            return Ok(None);
        }
        if !BUCKET_NAMES.contains(&proxy.bucket.as_str()) {
            return Err(SyncError::UnknownCollection(proxy.bucket.clone()));
        }

        // a synchronized datablock already claiming the name means two
        // peers created a same-named entity concurrently
        let mut conflict = None;
        let holder = self
            .collections
            .get(&proxy.bucket)
            .and_then(|c| c.holder(proxy.name()));
        if let Some(existing) = holder {
            let wanted = proxy.name().to_string();
            let derived = format!("{}_{}", wanted, existing.as_uuid());
            if let Some(applied) = store.rename(existing, &derived) {
                info!(
                    %existing,
                    old = %wanted,
                    new = %applied,
                    "local datablock yields its name to an inbound creation"
                );
                if let Some(p) = self.state.proxies.get_mut(&existing) {
                    p.rename(&applied);
                }
                if let Some(c) = self.collections.get_mut(&proxy.bucket) {
                    c.rename(&wanted, &applied, existing);
                }
                conflict = Some(Rename {
                    uuid: existing,
                    old_name: wanted,
                    new_name: applied,
                    reason: format!("name claimed by inbound creation {}", uuid),
                });
            }
        }

        // an unsynchronized local datablock with the same name and kind
        // is adopted instead of duplicated
        let adopted = store
            .get_by_name(&proxy.bucket, proxy.name())
            .filter(|block| block.kind == proxy.kind && !self.state.proxies.contains_key(&block.id))
            .map(|block| block.id);
        let created = match adopted {
            Some(local) => {
                debug!(%uuid, name = %proxy.name(), "adopting local datablock");
                local
            }
            None => {
                let ctor = self
                    .registry
                    .ctor(proxy.kind)
                    .ok_or_else(|| SyncError::ConstructionFailed {
                        collection: proxy.bucket.clone(),
                        name: proxy.name().to_string(),
                        reason: "no constructor for this kind".to_string(),
                    })?;
                match ctor(store, &proxy, &self.state) {
                    Ok(id) => id,
                    Err(err) => {
                        info!(%uuid, %err, "creation delayed");
                        self.delayed.push(proxy);
                        return Ok(conflict);
                    }
                }
            }
        };
        store.rebind_id(created, uuid);

        let name = {
            let mut ctx = Context::new(&mut self.state, &self.filter, &self.registry);
            let block = store
                .get_mut(uuid)
                .ok_or(SyncError::MissingDatablock(uuid))?;
            pre_save(block, &proxy);
            proxy.save(block, &mut ctx)?;
            if block.kind == EntityKind::Object {
                if let Some(data) = block.data_ref() {
                    ctx.state.objects.entry(data).or_default().insert(uuid);
                }
            }
            block.name.clone()
        };
        if name != proxy.name() {
            // the store had to uniquify against unsynchronized locals
            debug!(%uuid, wanted = %proxy.name(), got = %name, "created under a different name");
        }

        self.register(proxy);
        let resolved = self.state.unresolved_refs.resolve(uuid, store);
        for slot in resolved {
            // a late-bound data payload makes its owner a user of the
            // target, which the shape key constructor relies on
            let owner_kind = self.state.datablocks.get(&slot.owner).copied();
            let is_data = matches!(
                slot.path.steps(),
                [crate::path::PathStep::Field(field)] if field == "data"
            );
            if owner_kind == Some(EntityKind::Object) && is_data {
                self.state.objects.entry(uuid).or_default().insert(slot.owner);
            }
        }
        Ok(conflict)
    }

    /// Retry parked creations. Called after a batch of creations so a
    /// dependency arriving later in the stream unblocks them. Returns
    /// the renames of local datablocks that yielded their names, for
    /// broadcast.
    pub fn flush_delayed(&mut self, store: &mut Store) -> Vec<Rename> {
        let parked = std::mem::take(&mut self.delayed);
        let mut yielded = Vec::new();
        for proxy in parked {
            let uuid = proxy.uuid;
            match self.create_datablock(store, proxy) {
                Ok(Some(rename)) => yielded.push(rename),
                Ok(None) => {}
                Err(err) => warn!(%uuid, %err, "delayed creation failed"),
            }
        }
        yielded
    }

    /// Merge an inbound attribute delta. The proxy advances even when
    /// the live datablock is missing, so this replica can still relay
    /// and diff consistently.
    pub fn update_datablock(
        &mut self,
        store: &mut Store,
        update: &DatablockDelta,
    ) -> Result<(), SyncError> {
        let mut proxy = self
            .state
            .proxies
            .remove(&update.uuid)
            .ok_or(SyncError::MissingDatablock(update.uuid))?;
        let mut ctx = Context::new(&mut self.state, &self.filter, &self.registry);
        proxy.apply(store.get_mut(update.uuid), &update.delta, &mut ctx);
        self.state.proxies.insert(update.uuid, proxy);
        Ok(())
    }

    /// Apply an inbound bulk buffer update.
    pub fn update_bulk(
        &mut self,
        store: &mut Store,
        uuid: DatablockId,
        update: &BulkUpdate,
    ) -> Result<(), SyncError> {
        let mut proxy = self
            .state
            .proxies
            .remove(&uuid)
            .ok_or(SyncError::MissingDatablock(uuid))?;
        let result = proxy.apply_bulk(store.get_mut(uuid), update, &self.registry);
        self.state.proxies.insert(uuid, proxy);
        result
    }

    /// Apply an inbound removal. Cascaded victims (an object's orphaned
    /// data) are unregistered too; their own removal commands, which the
    /// sender also emits, then find nothing left to do.
    pub fn remove_datablock(&mut self, store: &mut Store, uuid: DatablockId) {
        if !self.state.proxies.contains_key(&uuid) {
            debug!(%uuid, "removal for an unknown datablock, ignoring");
            return;
        }
        let removed = store.remove(uuid);
        if removed.is_empty() {
            self.unregister(uuid);
            return;
        }
        for victim in removed {
            self.unregister(victim);
        }
    }

    /// Apply a batch of inbound renames in two phases so swapped names
    /// cannot collide mid-batch. A datablock renamed concurrently on
    /// this replica (its live name matches neither side of the inbound
    /// rename) is moved to a name derived from its id; the same
    /// decision is taken on every replica, and the resulting rename is
    /// returned so it can be broadcast.
    pub fn rename_datablocks(&mut self, store: &mut Store, renames: &[Rename]) -> Vec<Rename> {
        let mut conflicts = Vec::new();
        let mut batch: Vec<(DatablockId, String)> = Vec::new();

        for rename in renames {
            let Some(block) = store.get(rename.uuid) else {
                warn!(uuid = %rename.uuid, "rename for a missing datablock, ignoring");
                continue;
            };
            let live_name = block.name.clone();
            if live_name != rename.old_name && live_name != rename.new_name {
                let resolved = rename.uuid.conflict_name();
                warn!(
                    uuid = %rename.uuid,
                    inbound = %rename.new_name,
                    local = %live_name,
                    resolved = %resolved,
                    "conflicting renames"
                );
                conflicts.push(Rename {
                    uuid: rename.uuid,
                    old_name: live_name,
                    new_name: resolved.clone(),
                    reason: format!("conflicts with inbound rename to {}", rename.new_name),
                });
                batch.push((rename.uuid, resolved));
            } else {
                batch.push((rename.uuid, rename.new_name.clone()));
            }
        }

        // phase one: move every target out of the way
        for (uuid, _) in &batch {
            store.rename(*uuid, &uuid.placeholder_name());
        }
        // phase two: final names, now free
        for (uuid, final_name) in &batch {
            let Some(applied) = store.rename(*uuid, final_name) else {
                continue;
            };
            if &applied != final_name {
                debug!(%uuid, wanted = %final_name, got = %applied, "rename was uniquified");
            }
            let old = self
                .state
                .proxies
                .get(uuid)
                .map(|p| p.name().to_string())
                .unwrap_or_default();
            if let Some(proxy) = self.state.proxies.get_mut(uuid) {
                proxy.rename(&applied);
            }
            let bucket = self
                .state
                .proxies
                .get(uuid)
                .map(|p| p.bucket.clone())
                .unwrap_or_default();
            if let Some(collection) = self.collections.get_mut(&bucket) {
                collection.rename(&old, &applied, *uuid);
            }
        }
        conflicts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::codec::{apply_messages, encode_changeset, SyncMessage};
    use crate::store::entity::Datablock;
    use crate::store::value::{BulkBuffer, LiveValue};

    struct Replica {
        session: SyncSession,
        store: Store,
    }

    impl Replica {
        fn new() -> Self {
            let store = Store::new();
            let mut session = SyncSession::new();
            session.load(&store);
            Self { session, store }
        }
    }

    /// Diff `from`, ship the changeset through the codec, apply it to
    /// `to`. Returns what `to` must broadcast in turn.
    fn sync(from: &mut Replica, to: &mut Replica) -> Vec<SyncMessage> {
        let changeset = from.session.update(&mut from.store);
        let messages: Vec<SyncMessage> = encode_changeset(&changeset)
            .iter()
            .map(|m| SyncMessage::decode(&m.encode().unwrap()).unwrap())
            .collect();
        apply_messages(&mut to.session, &mut to.store, &messages).unwrap()
    }

    fn assert_converged(a: &Replica, b: &Replica) {
        for bucket in BUCKET_NAMES {
            let by_name = |store: &Store| -> BTreeMap<String, Datablock> {
                store
                    .bucket(bucket)
                    .unwrap_or(&[])
                    .iter()
                    .map(|block| (block.name.clone(), block.clone()))
                    .collect()
            };
            assert_eq!(
                by_name(&a.store),
                by_name(&b.store),
                "bucket {bucket} diverged"
            );
        }
        assert_eq!(
            a.session.state.proxies.len(),
            b.session.state.proxies.len()
        );
        for (uuid, proxy) in &a.session.state.proxies {
            assert_eq!(Some(proxy), b.session.state.proxies.get(uuid));
        }
    }

    fn populate(store: &mut Store) -> (DatablockId, DatablockId) {
        let grouping = store.new_grouping("Root");
        let scene = store.new_scene("Scene");
        if let Some(block) = store.get_mut(scene) {
            block.set_attr("root_grouping", LiveValue::Ref(Some(grouping)));
        }
        let mesh = store.new_mesh("Cube");
        let object = store.new_object("Cube", Some(mesh));
        store.new_light("Lamp", "SUN");
        store.new_material("Steel");
        (object, mesh)
    }

    #[test]
    fn test_snapshot_then_idempotent_diff() {
        let mut a = Replica::new();
        populate(&mut a.store);
        a.session.load(&a.store);
        let changeset = a.session.update(&mut a.store);
        assert!(changeset.is_empty(), "unchanged store produced {changeset:?}");
    }

    #[test]
    fn test_initial_convergence() {
        let mut a = Replica::new();
        let mut b = Replica::new();
        populate(&mut a.store);
        sync(&mut a, &mut b);
        assert_converged(&a, &b);

        // neither side has anything left to report
        assert!(a.session.update(&mut a.store).is_empty());
        assert!(b.session.update(&mut b.store).is_empty());
    }

    #[test]
    fn test_creations_ship_data_before_containers() {
        let mut a = Replica::new();
        populate(&mut a.store);
        let changeset = a.session.update(&mut a.store);
        let buckets: Vec<&str> = changeset
            .creations
            .iter()
            .map(|c| c.bucket.as_str())
            .collect();
        let mesh_at = buckets.iter().position(|b| *b == "meshes").unwrap();
        let object_at = buckets.iter().position(|b| *b == "objects").unwrap();
        let grouping_at = buckets.iter().position(|b| *b == "groupings").unwrap();
        let scene_at = buckets.iter().position(|b| *b == "scenes").unwrap();
        assert!(mesh_at < object_at);
        assert!(grouping_at < scene_at);
    }

    #[test]
    fn test_removal_cascade_converges() {
        let mut a = Replica::new();
        let mut b = Replica::new();
        let (object, mesh) = populate(&mut a.store);
        sync(&mut a, &mut b);

        a.store.remove(object);
        assert!(a.store.get(mesh).is_none(), "sole-user data must cascade");
        let changeset = a.session.update(&mut a.store);
        assert_eq!(changeset.removals.len(), 2);
        assert_eq!(changeset.removals[0].kind, EntityKind::Object);

        let messages = encode_changeset(&changeset);
        apply_messages(&mut b.session, &mut b.store, &messages).unwrap();
        assert!(b.store.get(object).is_none());
        assert!(b.store.get(mesh).is_none());
        assert_converged(&a, &b);
    }

    #[test]
    fn test_attribute_updates_converge() {
        let mut a = Replica::new();
        let mut b = Replica::new();
        let (object, _) = populate(&mut a.store);
        sync(&mut a, &mut b);

        if let Some(block) = a.store.get_mut(object) {
            block.set_attr("location", LiveValue::Vector(vec![1.0, 2.0, 3.0]));
            if let Some(LiveValue::Sequence(modifiers)) = block.attr_mut("modifiers") {
                let mut fields = BTreeMap::new();
                fields.insert("name".to_string(), LiveValue::Str("Solidify".to_string()));
                fields.insert("kind".to_string(), LiveValue::Str("SOLIDIFY".to_string()));
                fields.insert("enabled".to_string(), LiveValue::Bool(true));
                fields.insert("thickness".to_string(), LiveValue::Float(0.02));
                modifiers.items.push(LiveValue::Struct(fields));
            }
        }
        sync(&mut a, &mut b);
        assert_converged(&a, &b);

        let object_b = b.store.get(object).unwrap();
        assert_eq!(
            object_b.attr("location"),
            Some(&LiveValue::Vector(vec![1.0, 2.0, 3.0]))
        );
        match object_b.attr("modifiers") {
            Some(LiveValue::Sequence(modifiers)) => {
                assert_eq!(modifiers.items.len(), 1);
                assert_eq!(modifiers.items[0].field_str("kind"), Some("SOLIDIFY"));
            }
            other => panic!("modifiers missing: {other:?}"),
        }
    }

    #[test]
    fn test_rename_swap_needs_no_uniquify() {
        let mut a = Replica::new();
        let mut b = Replica::new();
        let left = a.store.new_object("Left", None);
        let right = a.store.new_object("Right", None);
        sync(&mut a, &mut b);

        // interactive swap on the sender
        a.store.rename(left, "swap tmp");
        a.store.rename(right, "Left");
        a.store.rename(left, "Right");
        sync(&mut a, &mut b);

        assert_eq!(b.store.get(left).unwrap().name, "Right");
        assert_eq!(b.store.get(right).unwrap().name, "Left");
        assert_converged(&a, &b);
    }

    #[test]
    fn test_concurrent_rename_resolves_deterministically() {
        let mut a = Replica::new();
        let mut b = Replica::new();
        let (object, _) = populate(&mut a.store);
        sync(&mut a, &mut b);

        a.store.rename(object, "AlphaCube");
        b.store.rename(object, "BetaCube");

        let outbound = sync(&mut a, &mut b);
        let expected = object.conflict_name();
        assert_eq!(b.store.get(object).unwrap().name, expected);
        assert_eq!(outbound.len(), 1);
        match &outbound[0] {
            SyncMessage::Rename { reason, .. } => {
                assert!(reason.contains("AlphaCube"), "conflict reason was {reason:?}");
            }
            other => panic!("expected a rename, got {other:?}"),
        }

        // the conflict rename travels back and lands on the same name
        apply_messages(&mut a.session, &mut a.store, &outbound).unwrap();
        assert_eq!(a.store.get(object).unwrap().name, expected);
    }

    #[test]
    fn test_bulk_fill_and_resize() {
        let mut a = Replica::new();
        let mut b = Replica::new();
        let (_, mesh) = populate(&mut a.store);
        sync(&mut a, &mut b);

        // fill an empty buffer
        if let Some(LiveValue::Buffer(positions)) =
            a.store.get_mut(mesh).unwrap().attr_mut("positions")
        {
            positions.data = vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
        }
        let changeset = a.session.update(&mut a.store);
        assert!(changeset.updates.is_empty(), "buffers must not ride deltas");
        assert_eq!(changeset.bulk_updates.len(), 1);
        apply_messages(&mut b.session, &mut b.store, &encode_changeset(&changeset)).unwrap();

        // grow a non-empty buffer: geometry may resize
        if let Some(LiveValue::Buffer(positions)) =
            a.store.get_mut(mesh).unwrap().attr_mut("positions")
        {
            positions.resize_elements(4);
        }
        sync(&mut a, &mut b);
        assert_converged(&a, &b);

        match b.store.get(mesh).unwrap().attr("positions") {
            Some(LiveValue::Buffer(positions)) => assert_eq!(positions.element_count(), 4),
            other => panic!("positions missing: {other:?}"),
        }
    }

    fn spline_point(x: f64) -> LiveValue {
        let mut fields = BTreeMap::new();
        fields.insert("co".to_string(), LiveValue::Vector(vec![x, 0.0, 0.0]));
        fields.insert("radius".to_string(), LiveValue::Float(1.0));
        LiveValue::Struct(fields)
    }

    #[test]
    fn test_spline_edit_ships_a_full_replace() {
        let mut a = Replica::new();
        let mut b = Replica::new();
        let curve = a.store.new_curve("Path");
        if let Some(LiveValue::Sequence(points)) =
            a.store.get_mut(curve).unwrap().attr_mut("spline_points")
        {
            points.items.push(spline_point(0.0));
            points.items.push(spline_point(1.0));
        }
        sync(&mut a, &mut b);
        // forced-replace sequences still diff quietly while unchanged
        assert!(a.session.update(&mut a.store).is_empty());

        if let Some(LiveValue::Sequence(points)) =
            a.store.get_mut(curve).unwrap().attr_mut("spline_points")
        {
            points.items[0] = spline_point(2.0);
        }
        let changeset = a.session.update(&mut a.store);
        assert_eq!(changeset.updates.len(), 1);
        apply_messages(&mut b.session, &mut b.store, &encode_changeset(&changeset)).unwrap();
        assert_converged(&a, &b);
    }

    fn key_block(name: &str, points: Vec<f64>) -> LiveValue {
        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), LiveValue::Str(name.to_string()));
        fields.insert("value".to_string(), LiveValue::Float(0.0));
        fields.insert(
            "points".to_string(),
            LiveValue::Buffer(BulkBuffer { dim: 3, data: points }),
        );
        LiveValue::Struct(fields)
    }

    #[test]
    fn test_bulk_resize_refused_outside_geometry() {
        let mut a = Replica::new();
        let (object, _) = populate(&mut a.store);
        let key = a.store.add_shape_key(object).unwrap();
        if let Some(LiveValue::Sequence(blocks)) =
            a.store.get_mut(key).unwrap().attr_mut("key_blocks")
        {
            blocks.items.push(key_block("Basis", vec![0.0; 6]));
        }
        a.session.load(&a.store);

        let mut path = crate::path::AttrPath::new();
        path.push("key_blocks");
        path.push(0usize);
        let update = BulkUpdate {
            path,
            members: vec![crate::proxy::delta::SoaMember {
                step: crate::path::PathStep::Field("points".to_string()),
                dim: 3,
                data: vec![0.0; 12],
            }],
        };
        let result = a.session.update_bulk(&mut a.store, key, &update);
        assert!(matches!(result, Err(SyncError::GeometryResize { .. })));
    }

    #[test]
    fn test_shape_key_creation_goes_through_owner() {
        let mut a = Replica::new();
        let mut b = Replica::new();
        let (object, mesh) = populate(&mut a.store);
        sync(&mut a, &mut b);

        let key = a.store.add_shape_key(object).unwrap();
        sync(&mut a, &mut b);
        assert_converged(&a, &b);

        let key_b = b.store.get(key).unwrap();
        assert_eq!(key_b.kind, EntityKind::ShapeKey);
        assert_eq!(
            b.store.get(mesh).unwrap().attr("shape_keys"),
            Some(&LiveValue::Ref(Some(key)))
        );
    }

    #[test]
    fn test_delayed_creation_retries_after_batch() {
        let mut a = Replica::new();
        let mut b = Replica::new();
        let (object, _) = populate(&mut a.store);
        a.store.add_shape_key(object).unwrap();

        let changeset = a.session.update(&mut a.store);
        let mut messages = encode_changeset(&changeset);
        // adversarial arrival order: the shape key first, its
        // dependencies afterwards
        messages.reverse();
        apply_messages(&mut b.session, &mut b.store, &messages).unwrap();
        assert_converged(&a, &b);
        assert_eq!(b.store.bucket("shape_keys").unwrap().len(), 1);
    }

    #[test]
    fn test_unresolved_reference_binds_late() {
        let mut a = Replica::new();
        let mut b = Replica::new();
        let alpha = a.store.new_grouping("Alpha");
        let zeta = a.store.new_grouping("Zeta");
        if let Some(LiveValue::Sequence(children)) =
            a.store.get_mut(alpha).unwrap().attr_mut("children")
        {
            children.items.push(LiveValue::Ref(Some(zeta)));
        }
        // name order makes the referencing grouping arrive first
        sync(&mut a, &mut b);
        assert_converged(&a, &b);

        match b.store.get(alpha).unwrap().attr("children") {
            Some(LiveValue::Sequence(children)) => {
                assert_eq!(children.items, vec![LiveValue::Ref(Some(zeta))]);
            }
            other => panic!("children missing: {other:?}"),
        }
        assert!(b.session.state.unresolved_refs.is_empty());
    }

    #[test]
    fn test_duplicate_syncs_as_fresh_creation() {
        let mut a = Replica::new();
        let mut b = Replica::new();
        let mesh = a.store.new_mesh("Sphere");
        sync(&mut a, &mut b);

        let copy_name = a.store.duplicate(mesh).unwrap();
        sync(&mut a, &mut b);
        assert_converged(&a, &b);

        let copy = b.store.get_by_name("meshes", &copy_name).unwrap();
        assert_ne!(copy.id, mesh);
    }

    #[test]
    fn test_construction_failure_is_isolated() {
        let mut a = Replica::new();
        let mut b = Replica::new();
        // an unloadable image: no source path, no dimensions
        let image = a.store.new_image("Broken", 0, 0);
        let mesh = a.store.new_mesh("Fine");
        sync(&mut a, &mut b);

        assert!(b.store.get(image).is_none());
        assert!(b.store.get(mesh).is_some());
    }

    #[test]
    fn test_adopts_unsynchronized_local_twin() {
        let mut a = Replica::new();
        let mut b = Replica::new();
        let local = b.store.new_mesh("Cube");
        let remote = a.store.new_mesh("Cube");
        sync(&mut a, &mut b);

        let bucket = b.store.bucket("meshes").unwrap();
        assert_eq!(bucket.len(), 1);
        assert_eq!(bucket[0].id, remote);
        assert!(b.store.get(local).is_none(), "the twin takes the sender's id");
    }

    #[test]
    fn test_creation_name_conflict_local_holder_yields() {
        let mut a = Replica::new();
        let mut b = Replica::new();
        let theirs = b.store.new_object("Cube", None);
        // b considers its own Cube synchronized before a's arrives
        b.session.update(&mut b.store);
        let ours = a.store.new_object("Cube", None);
        let outbound = sync(&mut a, &mut b);

        // the inbound creation keeps its name; the local holder moves
        // aside and broadcasts the move
        assert_eq!(b.store.get(ours).unwrap().name, "Cube");
        let yielded = format!("Cube_{}", theirs.as_uuid());
        assert_eq!(b.store.get(theirs).unwrap().name, yielded);
        assert_eq!(outbound.len(), 1);
        match &outbound[0] {
            SyncMessage::Rename { uuid, old_name, new_name, .. } => {
                assert_eq!(*uuid, theirs);
                assert_eq!(old_name, "Cube");
                assert_eq!(new_name, &yielded);
            }
            other => panic!("expected a rename, got {other:?}"),
        }
    }

    #[test]
    fn test_concurrent_creations_converge_through_crossed_renames() {
        let mut a = Replica::new();
        let mut b = Replica::new();
        let ours = a.store.new_mesh("Cube");
        let theirs = b.store.new_mesh("Cube");

        let from_a = encode_changeset(&a.session.update(&mut a.store));
        let from_b = encode_changeset(&b.session.update(&mut b.store));
        let out_b = apply_messages(&mut b.session, &mut b.store, &from_a).unwrap();
        let out_a = apply_messages(&mut a.session, &mut a.store, &from_b).unwrap();
        // each side renamed its own datablock; the renames cross
        apply_messages(&mut a.session, &mut a.store, &out_b).unwrap();
        apply_messages(&mut b.session, &mut b.store, &out_a).unwrap();

        assert_converged(&a, &b);
        assert_eq!(
            a.store.get(ours).unwrap().name,
            format!("Cube_{}", ours.as_uuid())
        );
        assert_eq!(
            a.store.get(theirs).unwrap().name,
            format!("Cube_{}", theirs.as_uuid())
        );
    }

    #[test]
    fn test_deep_attribute_branch_is_skipped_consistently() {
        let mut a = Replica::new();
        let grouping = a.store.new_grouping("Root");
        let mut deep = LiveValue::Str("bottom".to_string());
        for _ in 0..35 {
            let mut fields = BTreeMap::new();
            fields.insert("inner".to_string(), deep);
            deep = LiveValue::Struct(fields);
        }
        a.store.get_mut(grouping).unwrap().set_attr("deep", deep);

        a.session.load(&a.store);
        // the over-deep tail is dropped from the snapshot the same way
        // on every pass, so nothing oscillates
        let changeset = a.session.update(&mut a.store);
        assert!(changeset.is_empty(), "deep branch must diff quietly: {changeset:?}");
    }

    #[test]
    fn test_untrusted_kind_never_diffs_after_creation() {
        let mut a = Replica::new();
        let mut b = Replica::new();
        let image = a.store.new_image("Tex", 64, 64);
        sync(&mut a, &mut b);
        assert!(b.store.get(image).is_some());

        a.store
            .get_mut(image)
            .unwrap()
            .set_attr("width", LiveValue::Int(128));
        let changeset = a.session.update(&mut a.store);
        assert!(changeset.is_empty(), "image updates are untrusted");
    }

    #[test]
    fn test_embedded_graph_syncs_inside_owner() {
        let mut a = Replica::new();
        let mut b = Replica::new();
        let material = a.store.new_material("Steel");
        sync(&mut a, &mut b);

        if let Some(LiveValue::Embedded(graph)) =
            a.store.get_mut(material).unwrap().attr_mut("shader_graph")
        {
            if let Some(LiveValue::Sequence(nodes)) = graph.attrs.get_mut("nodes") {
                let mut fields = BTreeMap::new();
                fields.insert("name".to_string(), LiveValue::Str("Output".to_string()));
                fields.insert("node_kind".to_string(), LiveValue::Str("OUTPUT".to_string()));
                fields.insert("inputs".to_string(), LiveValue::Struct(BTreeMap::new()));
                nodes.items.push(LiveValue::Struct(fields));
            }
        }
        sync(&mut a, &mut b);
        assert_converged(&a, &b);

        // the graph never shows up as its own synchronized entity
        assert!(b.store.bucket("materials").unwrap().len() == 1);
        assert_eq!(b.session.state.proxies.len(), 1);
    }
}
