//! Delta types produced by the diff engine and consumed by apply.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ident::DatablockId;
use crate::path::{AttrPath, PathStep};
use crate::store::entity::EntityKind;

use super::Proxy;

/// What to do to one attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delta {
    /// Merge the nested changes into the current value.
    Update(DeltaValue),
    /// Discard the current value and install the carried snapshot.
    Replace(Proxy),
}

/// The payload of an in-place update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaValue {
    /// Overwrite a leaf with a new proxy value.
    Set(Proxy),
    Struct(StructDelta),
    Sequence(SequenceDelta),
}

/// Per-member deltas of a struct. Members without changes are absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructDelta {
    pub members: BTreeMap<String, Delta>,
}

impl StructDelta {
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// A minimal edit of an ordered sequence: in-place item updates over
/// the surviving prefix, a count of tail deletions, and appended items.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SequenceDelta {
    pub updates: Vec<(usize, Delta)>,
    pub deletions: usize,
    pub additions: Vec<Proxy>,
}

impl SequenceDelta {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.deletions == 0 && self.additions.is_empty()
    }
}

/// A delta addressed to one datablock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatablockDelta {
    pub uuid: DatablockId,
    pub bucket: String,
    pub kind: EntityKind,
    pub delta: Delta,
}

/// One flat array of a bulk update. `step` is the final path step
/// addressing the buffer inside the struct the update is scoped to,
/// kept typed so index-addressed buffers route correctly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoaMember {
    pub step: PathStep,
    pub dim: usize,
    pub data: Vec<f64>,
}

/// An out-of-band buffer update, scoped by the path of the struct that
/// owns the buffers. Travels outside the attribute delta tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkUpdate {
    pub path: AttrPath,
    pub members: Vec<SoaMember>,
}
