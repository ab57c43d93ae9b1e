//! Proxy of a pointer to a standalone datablock.
//!
//! Only the stable id crosses the wire. The bucket and name captured at
//! load time are diagnostics; resolution on the receiving side goes
//! through the session's datablock index, and a reference whose target
//! has not been created yet is parked as an unresolved slot.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ident::DatablockId;
use crate::state::{Context, RefSlot};
use crate::store::value::LiveValue;
use crate::Store;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefProxy {
    pub target: DatablockId,
    pub bucket: String,
    pub initial_name: String,
}

impl RefProxy {
    pub fn load(target: DatablockId, store: &Store) -> Self {
        match store.get(target) {
            Some(block) => Self {
                target,
                bucket: block.kind.bucket().unwrap_or_default().to_string(),
                initial_name: block.name.clone(),
            },
            None => Self {
                target,
                bucket: String::new(),
                initial_name: String::new(),
            },
        }
    }

    /// Write the reference into a live slot. An unknown target leaves
    /// the slot unset and registers it for late binding.
    pub fn save(&self, slot: &mut LiveValue, ctx: &mut Context) {
        if ctx.state.datablocks.contains_key(&self.target) {
            *slot = LiveValue::Ref(Some(self.target));
            return;
        }
        *slot = LiveValue::Ref(None);
        if let Some(owner) = ctx.visit.datablock {
            debug!(target = %self.target, path = %ctx.visit.path, "reference target not yet created");
            ctx.state.unresolved_refs.append(
                self.target,
                RefSlot { owner, path: ctx.visit.path.clone() },
            );
        }
    }
}
