//! Store-level diff: which datablocks appeared, vanished or were
//! renamed since the last snapshot.
//!
//! Attribute-level changes are the proxies' business; this layer only
//! reconciles bucket membership by stable id. It also repairs the one
//! way live state can lie about ids: an interactive duplicate clones
//! the source id, so a second occurrence of a known id is given a fresh
//! one and then reported as a creation.

use std::collections::HashSet;

use tracing::debug;

use crate::ident::DatablockId;
use crate::state::ProxyState;
use crate::store::entity::EntityKind;
use crate::Store;

/// Membership changes of one bucket.
#[derive(Debug, Default)]
pub struct CollectionDiff {
    pub created: Vec<DatablockId>,
    pub removed: Vec<(DatablockId, EntityKind)>,
    /// (id, old name, new name)
    pub renamed: Vec<(DatablockId, String, String)>,
}

impl CollectionDiff {
    /// Compare the live bucket against the proxies known for it.
    pub fn compute(bucket: &str, store: &mut Store, state: &ProxyState) -> Self {
        let mut diff = CollectionDiff::default();

        reset_duplicate_ids(bucket, store, state);

        let Some(blocks) = store.bucket(bucket) else {
            return diff;
        };
        let mut live_ids = HashSet::new();
        for block in blocks {
            live_ids.insert(block.id);
            match state.proxies.get(&block.id) {
                None => diff.created.push(block.id),
                Some(proxy) => {
                    if proxy.name() != block.name {
                        diff.renamed.push((
                            block.id,
                            proxy.name().to_string(),
                            block.name.clone(),
                        ));
                    }
                }
            }
        }
        for (id, proxy) in &state.proxies {
            if proxy.bucket == bucket && !live_ids.contains(id) {
                diff.removed.push((*id, proxy.kind));
            }
        }
        diff
    }
}

/// An interactive duplicate keeps the source's id until the next diff
/// cycle. Any id occurring twice in a bucket, or occurring on a block
/// that does not carry the name its proxy knows while another block
/// does, marks the copy; the copy gets a fresh id and shows up as a
/// creation.
fn reset_duplicate_ids(bucket: &str, store: &mut Store, state: &ProxyState) {
    let Some(blocks) = store.bucket_mut(bucket) else {
        return;
    };
    let mut seen: HashSet<DatablockId> = HashSet::new();
    for block in blocks.iter_mut() {
        let keeps_known_name = state
            .proxies
            .get(&block.id)
            .map(|proxy| proxy.name() == block.name)
            .unwrap_or(true);
        if seen.contains(&block.id) && !keeps_known_name {
            let fresh = DatablockId::new();
            debug!(old = %block.id, new = %fresh, name = %block.name, "resetting duplicated id");
            block.id = fresh;
        }
        seen.insert(block.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_created_and_removed() {
        let mut store = Store::new();
        let kept = store.new_mesh("Kept");
        let added = store.new_mesh("Added");

        let mut state = ProxyState::default();
        // pretend the snapshot knew "Kept" and a mesh that is now gone
        let filter = crate::filter::SyncFilter::standard();
        let registry = crate::specifics::Registry::standard();
        let mut ctx = crate::state::Context::new(&mut state, &filter, &registry);
        let block = store.get(kept).unwrap();
        let proxy = crate::proxy::datablock::DatablockProxy::load(block, &mut ctx, &store).unwrap();
        state.proxies.insert(kept, proxy);
        let gone = DatablockId::new();
        let mut ghost = crate::store::entity::Datablock::new(EntityKind::Mesh, "Ghost");
        ghost.id = gone;
        let ghost_proxy = {
            let mut ctx = crate::state::Context::new(&mut state, &filter, &registry);
            crate::proxy::datablock::DatablockProxy::load(&ghost, &mut ctx, &store).unwrap()
        };
        state.proxies.insert(gone, ghost_proxy);

        let diff = CollectionDiff::compute("meshes", &mut store, &state);
        assert_eq!(diff.created, vec![added]);
        assert_eq!(diff.removed, vec![(gone, EntityKind::Mesh)]);
        assert!(diff.renamed.is_empty());
    }

    #[test]
    fn test_duplicate_gets_fresh_id() {
        let mut store = Store::new();
        let original = store.new_mesh("Sphere");

        let mut state = ProxyState::default();
        let filter = crate::filter::SyncFilter::standard();
        let registry = crate::specifics::Registry::standard();
        let mut ctx = crate::state::Context::new(&mut state, &filter, &registry);
        let block = store.get(original).unwrap();
        let proxy = crate::proxy::datablock::DatablockProxy::load(block, &mut ctx, &store).unwrap();
        state.proxies.insert(original, proxy);

        let copy_name = store.duplicate(original).unwrap();
        assert_eq!(copy_name, "Sphere.001");

        let diff = CollectionDiff::compute("meshes", &mut store, &state);
        assert_eq!(diff.created.len(), 1);
        assert_ne!(diff.created[0], original);
        assert!(diff.removed.is_empty());
        // the original still answers to its id
        assert_eq!(store.get(original).unwrap().name, "Sphere");
    }
}
