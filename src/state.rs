//! Session-wide proxy state and per-operation visit state.

use std::collections::{HashMap, HashSet};

use tracing::info;

use crate::error::SyncError;
use crate::filter::SyncFilter;
use crate::ident::DatablockId;
use crate::path::{AttrPath, PathStep};
use crate::proxy::datablock::DatablockProxy;
use crate::proxy::delta::BulkUpdate;
use crate::specifics::Registry;
use crate::store::entity::EntityKind;
use crate::store::value::LiveValue;
use crate::store::Store;

/// Limits attribute depth and guards against recursion caused by
/// unfiltered circular references.
#[derive(Debug, Default)]
pub struct RecursionGuard {
    stack: Vec<String>,
}

impl RecursionGuard {
    pub const MAX_DEPTH: usize = 30;

    pub fn push(&mut self, name: &str) -> Result<(), SyncError> {
        self.stack.push(name.to_string());
        if self.stack.len() > Self::MAX_DEPTH {
            let path = self.stack.join(".");
            return Err(SyncError::MaxDepthExceeded(path));
        }
        Ok(())
    }

    pub fn pop(&mut self) {
        self.stack.pop();
    }
}

/// One pending reference slot: the attribute at `path` inside the
/// datablock `owner` wants to point at a target that has not been
/// created yet.
#[derive(Debug, Clone)]
pub struct RefSlot {
    pub owner: DatablockId,
    pub path: AttrPath,
}

/// References whose target id has not yet appeared. Not an error: peers
/// cannot always order creations so that every reference resolves
/// immediately (groupings reference other groupings, scenes reference
/// scenes). Slots are resolved opportunistically as targets are created.
#[derive(Debug, Default)]
pub struct UnresolvedRefs {
    refs: HashMap<DatablockId, Vec<RefSlot>>,
}

impl UnresolvedRefs {
    pub fn append(&mut self, target: DatablockId, slot: RefSlot) {
        self.refs.entry(target).or_default().push(slot);
    }

    /// Point every waiting slot at the newly created target. Returns
    /// the slots actually written, so the caller can maintain whatever
    /// indexes hang off the now-bound references.
    pub fn resolve(&mut self, target: DatablockId, store: &mut Store) -> Vec<RefSlot> {
        let Some(slots) = self.refs.remove(&target) else {
            return Vec::new();
        };
        let mut resolved = Vec::new();
        for slot in slots {
            let Some(owner) = store.get_mut(slot.owner) else {
                continue;
            };
            if let Some(value) = owner.value_at_path_mut(slot.path.steps()) {
                *value = LiveValue::Ref(Some(target));
                info!("resolved reference to {} at {}", target, slot.path);
                resolved.push(slot);
            }
        }
        resolved
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    pub fn clear(&mut self) {
        self.refs.clear();
    }
}

/// State of one synchronization session, owned by the session and
/// mutated by the diff engine (sending side) or the apply engine
/// (receiving side), never both within one cycle.
#[derive(Debug, Default)]
pub struct ProxyState {
    /// Known proxies.
    pub proxies: HashMap<DatablockId, DatablockProxy>,
    /// Known live datablocks, as id to type-tag handles.
    pub datablocks: HashMap<DatablockId, EntityKind>,
    /// data id -> ids of the objects using that data. Mostly used for
    /// shape keys, whose construction goes through an owning object.
    pub objects: HashMap<DatablockId, HashSet<DatablockId>>,
    pub unresolved_refs: UnresolvedRefs,
}

impl ProxyState {
    pub fn clear(&mut self) {
        self.proxies.clear();
        self.datablocks.clear();
        self.objects.clear();
        self.unresolved_refs.clear();
    }
}

/// Per-operation traversal state: the current path relative to the
/// datablock root, the recursion guard, the standalone datablock being
/// visited, and the bulk updates collected along the way.
#[derive(Debug, Default)]
pub struct VisitState {
    pub path: AttrPath,
    pub guard: RecursionGuard,
    /// Id of the standalone datablock currently visited. Embedded
    /// datablocks do not replace it: their bulk updates and reference
    /// slots belong to the standalone owner.
    pub datablock: Option<DatablockId>,
    /// Bulk buffer updates discovered during a diff, keyed by path.
    pub bulk_updates: Vec<BulkUpdate>,
}

impl VisitState {
    pub fn push_step(&mut self, step: impl Into<PathStep>) {
        self.path.push(step);
    }

    pub fn pop_step(&mut self) {
        self.path.pop();
    }
}

/// Everything an attribute-level operation needs: proxy state, the
/// property filter, the strategy registry and the visit state. Built by
/// the session for each operation; never ambient.
pub struct Context<'a> {
    pub state: &'a mut ProxyState,
    pub filter: &'a SyncFilter,
    pub registry: &'a Registry,
    pub visit: VisitState,
}

impl<'a> Context<'a> {
    pub fn new(state: &'a mut ProxyState, filter: &'a SyncFilter, registry: &'a Registry) -> Self {
        Self {
            state,
            filter,
            registry,
            visit: VisitState::default(),
        }
    }

    /// Descend into a named member. Pushes both the visit path and the
    /// recursion guard; on a depth overflow nothing stays pushed and the
    /// caller must skip the branch.
    pub fn enter_field(&mut self, name: &str) -> Result<(), SyncError> {
        if let Err(err) = self.visit.guard.push(name) {
            self.visit.guard.pop();
            return Err(err);
        }
        self.visit.push_step(name);
        Ok(())
    }

    pub fn exit_field(&mut self) {
        self.visit.pop_step();
        self.visit.guard.pop();
    }

    /// Descend into a sequence item. Indices extend the path but do not
    /// count against the recursion guard.
    pub fn enter_index(&mut self, index: usize) {
        self.visit.push_step(index);
    }

    pub fn exit_index(&mut self) {
        self.visit.pop_step();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recursion_guard_depth() {
        let mut guard = RecursionGuard::default();
        for depth in 0..RecursionGuard::MAX_DEPTH {
            assert!(guard.push(&format!("level{}", depth)).is_ok());
        }
        let err = guard.push("too_deep").unwrap_err();
        match err {
            SyncError::MaxDepthExceeded(path) => {
                assert!(path.starts_with("level0."));
                assert!(path.ends_with(".too_deep"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_unresolved_refs_resolve() {
        let mut store = Store::new();
        let scene = store.new_scene("Scene");
        let grouping = store.new_grouping("Root");

        // simulate the scene arriving before the grouping it references
        let mut refs = UnresolvedRefs::default();
        refs.append(
            grouping,
            RefSlot {
                owner: scene,
                path: ["root_grouping"].into_iter().collect(),
            },
        );
        refs.resolve(grouping, &mut store);
        assert!(refs.is_empty());
        assert_eq!(
            store.get(scene).unwrap().attr("root_grouping"),
            Some(&LiveValue::Ref(Some(grouping)))
        );
    }
}
