//! Synchronization error types.

use thiserror::Error;

use crate::ident::DatablockId;

/// Errors raised by the proxy, diff and apply engines.
///
/// Per-entity failures are isolated by the session: an error for one
/// datablock is logged and the rest of the batch keeps processing.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The attribute graph is deeper than the recursion guard allows,
    /// most likely because of an unfiltered circular reference.
    #[error("max attribute depth exceeded at {0}")]
    MaxDepthExceeded(String),

    /// A type-specific constructor could not build a live element.
    #[error("cannot construct {collection}[{name}]: {reason}")]
    ConstructionFailed {
        collection: String,
        name: String,
        reason: String,
    },

    /// A bulk buffer update does not match the live length and the
    /// target type does not allow implicit resizing.
    #[error("buffer length mismatch at {path}: live {live}, incoming {incoming}")]
    GeometryResize {
        path: String,
        live: usize,
        incoming: usize,
    },

    /// A message referenced a bucket the store does not carry.
    #[error("unknown collection {0}")]
    UnknownCollection(String),

    /// A command referenced a datablock unknown to the session.
    #[error("no datablock registered for {0}")]
    MissingDatablock(DatablockId),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),
}
