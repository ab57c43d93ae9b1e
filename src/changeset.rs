//! The ordered result of one diff cycle.
//!
//! Creations, removals and updates each have their own dependency
//! ordering, expressed as rank tables rather than logic: an entity is
//! created after what it references, removed before what it uses, and
//! updated after the entities its update reads.

use serde::{Deserialize, Serialize};

use crate::ident::DatablockId;
use crate::proxy::datablock::DatablockProxy;
use crate::proxy::delta::{BulkUpdate, DatablockDelta};
use crate::store::entity::EntityKind;

/// A datablock disappeared from its bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Removal {
    pub uuid: DatablockId,
    pub kind: EntityKind,
}

/// A datablock changed names. `old_name` lets the receiver detect
/// conflicts with concurrent local renames; `reason` says what forced
/// the rename, and surfaces in conflict logs on the far side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rename {
    pub uuid: DatablockId,
    pub old_name: String,
    pub new_name: String,
    pub reason: String,
}

/// Everything one diff cycle produced, ready for encoding.
#[derive(Debug, Default)]
pub struct Changeset {
    pub creations: Vec<DatablockProxy>,
    pub removals: Vec<Removal>,
    pub renames: Vec<Rename>,
    pub updates: Vec<DatablockDelta>,
    pub bulk_updates: Vec<(DatablockId, BulkUpdate)>,
}

/// Creation rank of a bucket. Buckets without an entry rank first:
/// nothing references them at creation time. Groupings come before the
/// scenes pointing at them, objects after the data they carry, shape
/// keys last since their construction goes through an existing object.
pub fn creation_order(bucket: &str) -> u32 {
    match bucket {
        "groupings" => 10,
        "scenes" => 20,
        "objects" => 30,
        "shape_keys" => 40,
        _ => 0,
    }
}

/// Update rank of a kind. Shape keys are applied before the meshes
/// whose geometry they deform; unranked kinds follow in any order.
pub fn update_order(kind: EntityKind) -> u32 {
    match kind {
        EntityKind::ShapeKey => 5,
        EntityKind::Mesh => 10,
        _ => u32::MAX,
    }
}

/// Removal rank of a kind. Objects go first so that removing them
/// releases the data they use; everything else follows.
pub fn removal_order(kind: EntityKind) -> u32 {
    match kind {
        EntityKind::Object => 10,
        _ => u32::MAX,
    }
}

impl Changeset {
    pub fn is_empty(&self) -> bool {
        self.creations.is_empty()
            && self.removals.is_empty()
            && self.renames.is_empty()
            && self.updates.is_empty()
            && self.bulk_updates.is_empty()
    }

    /// Sort every section into its dependency order. Ties break on name
    /// or id so two senders of the same changes emit the same stream.
    pub fn sort(&mut self) {
        self.creations.sort_by(|a, b| {
            creation_order(&a.bucket)
                .cmp(&creation_order(&b.bucket))
                .then_with(|| a.name().cmp(b.name()))
        });
        self.removals
            .sort_by_key(|removal| (removal_order(removal.kind), removal.uuid.as_uuid()));
        self.updates
            .sort_by_key(|update| (update_order(update.kind), update.uuid.as_uuid()));
        self.renames.sort_by(|a, b| a.old_name.cmp(&b.old_name));
    }
}
