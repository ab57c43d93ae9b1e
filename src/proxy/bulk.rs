//! Proxy of a flat numeric buffer (positions, indices, point arrays).
//!
//! Buffer contents never travel inside attribute deltas. A changed
//! buffer is emitted as a path-keyed bulk update so large payloads stay
//! out of the structural diff; the receiving side applies it subject to
//! the geometry resize rules.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::SyncError;
use crate::state::Context;
use crate::store::value::BulkBuffer;
use crate::Store;

use super::delta::{BulkUpdate, SoaMember};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkProxy {
    pub dim: usize,
    pub data: Vec<f64>,
}

impl BulkProxy {
    pub fn load(buffer: &BulkBuffer) -> Self {
        Self { dim: buffer.dim, data: buffer.data.clone() }
    }

    pub fn save(&self, buffer: &mut BulkBuffer) {
        buffer.dim = self.dim;
        buffer.data = self.data.clone();
    }

    /// Record a bulk update when the live buffer differs. Returns no
    /// attribute delta; the payload rides in the visit state instead.
    pub fn diff(&self, buffer: &BulkBuffer, ctx: &mut Context, _store: &Store) -> Result<(), SyncError> {
        if self.dim == buffer.dim && self.data == buffer.data {
            return Ok(());
        }
        let mut path = ctx.visit.path.clone();
        let Some(step) = path.pop() else {
            warn!("bulk buffer at the datablock root, ignoring");
            return Ok(());
        };
        ctx.visit.bulk_updates.push(BulkUpdate {
            path,
            members: vec![SoaMember {
                step,
                dim: buffer.dim,
                data: buffer.data.clone(),
            }],
        });
        Ok(())
    }

    /// Install one incoming array, updating both the proxy and, when
    /// present, the live buffer.
    pub fn apply_member(&mut self, buffer: Option<&mut BulkBuffer>, member: &SoaMember) {
        self.dim = member.dim;
        self.data = member.data.clone();
        if let Some(buffer) = buffer {
            buffer.dim = member.dim;
            buffer.data = member.data.clone();
        }
    }
}
