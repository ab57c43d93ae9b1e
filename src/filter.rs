//! Synchronized-property filtering.
//!
//! The engine does not decide which attributes are safe to synchronize;
//! it consumes a static predicate set. `SyncFilter` carries per-kind
//! attribute exclusions, a global exclusion list applied at any depth,
//! and the set of kinds whose live-update notifications can be trusted.
//! The standard contents are data, not engine logic, and are expected to
//! be tuned against the target store.

use std::collections::{BTreeMap, BTreeSet};

use crate::store::entity::{Datablock, EntityKind};
use crate::store::value::LiveValue;

/// Which attributes of which kinds are eligible for synchronization, and
/// which update notifications are safe to trust.
#[derive(Debug, Clone, Default)]
pub struct SyncFilter {
    /// Attribute names excluded for a specific kind.
    skipped: BTreeMap<EntityKind, BTreeSet<String>>,
    /// Attribute names excluded at any depth, for any kind.
    skipped_everywhere: BTreeSet<String>,
    /// Kinds whose live-update notifications must be ignored.
    untrusted_updates: BTreeSet<EntityKind>,
}

impl SyncFilter {
    /// The default safe filter.
    pub fn standard() -> Self {
        let mut filter = SyncFilter::default();
        // runtime-only state, never meaningful on another peer
        filter.skip_everywhere("select");
        filter.skip_everywhere("runtime_cache");
        // image contents travel at creation; later pixel updates are
        // driven by file reloads outside the engine
        filter.untrusted_updates.insert(EntityKind::Image);
        filter
    }

    pub fn skip(&mut self, kind: EntityKind, attr: &str) {
        self.skipped.entry(kind).or_default().insert(attr.to_string());
    }

    pub fn skip_everywhere(&mut self, attr: &str) {
        self.skipped_everywhere.insert(attr.to_string());
    }

    /// Is `attr` of a `kind` datablock eligible for synchronization?
    pub fn eligible(&self, kind: EntityKind, attr: &str) -> bool {
        if self.skipped_everywhere.contains(attr) {
            return false;
        }
        !self
            .skipped
            .get(&kind)
            .map(|set| set.contains(attr))
            .unwrap_or(false)
    }

    /// Is `attr` eligible at nested depth, independent of the kind?
    pub fn eligible_nested(&self, attr: &str) -> bool {
        !self.skipped_everywhere.contains(attr)
    }

    /// Can a live-update notification for this kind be trusted?
    pub fn trusted_update(&self, kind: EntityKind) -> bool {
        !self.untrusted_updates.contains(&kind)
    }

    /// Attributes that are only writable under a sibling attribute's
    /// value are excluded from load and diff while that condition does
    /// not hold: an object's instance grouping is only valid while it
    /// has no data payload.
    pub fn conditionally_skipped(&self, block: &Datablock, attr: &str) -> bool {
        if block.kind == EntityKind::Object && attr == "instance_grouping" {
            return !matches!(block.attr("data"), Some(LiveValue::Ref(None)) | None);
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[test]
    fn test_global_skip_applies_to_all_kinds() {
        let filter = SyncFilter::standard();
        assert!(!filter.eligible(EntityKind::Mesh, "select"));
        assert!(!filter.eligible(EntityKind::Scene, "select"));
        assert!(filter.eligible(EntityKind::Mesh, "positions"));
    }

    #[test]
    fn test_per_kind_skip() {
        let mut filter = SyncFilter::standard();
        filter.skip(EntityKind::Scene, "fps");
        assert!(!filter.eligible(EntityKind::Scene, "fps"));
        assert!(filter.eligible(EntityKind::Object, "fps"));
    }

    #[test]
    fn test_instance_grouping_conditional() {
        let mut store = Store::new();
        let mesh = store.new_mesh("Cube");
        let with_data = store.new_object("Cube", Some(mesh));
        let without_data = store.new_object("Empty", None);
        let filter = SyncFilter::standard();

        let with_data = store.get(with_data).unwrap();
        let without_data = store.get(without_data).unwrap();
        assert!(filter.conditionally_skipped(with_data, "instance_grouping"));
        assert!(!filter.conditionally_skipped(without_data, "instance_grouping"));
    }
}
