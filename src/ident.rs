//! Stable datablock identity.
//!
//! Every synchronized datablock carries a `DatablockId`, assigned at
//! creation and never reused. Names are mutable and may collide across
//! peers; the id is the only stable key, so conflict resolution derives
//! replacement names from it.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a datablock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatablockId(Uuid);

impl DatablockId {
    /// Generate a new random id.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Deterministic name applied when divergent rename histories are
    /// detected. Every peer computes the same name from the id alone, so
    /// all replicas converge regardless of message arrival order.
    pub fn conflict_name(&self) -> String {
        format!("__conflict_{}", self.0)
    }

    /// Temporary unique name used during the first pass of a rename
    /// batch, so that entities swapping names never collide.
    pub fn placeholder_name(&self) -> String {
        format!("__tmp_{}", self.0)
    }
}

impl fmt::Display for DatablockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
