//! Scenelink Core
//!
//! Replicated synchronization of a mutable, strongly-typed scene store.
//! Each participant snapshots its store into proxies, diffs live state
//! against the snapshot, and ships the resulting changesets to its
//! peers, who replay them against their own stores.

pub mod changeset;
pub mod codec;
pub mod diff;
pub mod error;
pub mod filter;
pub mod ident;
pub mod path;
pub mod proxy;
pub mod session;
pub mod specifics;
pub mod state;
pub mod store;

pub use changeset::{Changeset, Removal, Rename};
pub use codec::{apply_messages, encode_changeset, SyncMessage};
pub use diff::CollectionDiff;
pub use error::SyncError;
pub use filter::SyncFilter;
pub use ident::DatablockId;
pub use path::{AttrPath, PathStep};
pub use proxy::{DatablockProxy, Proxy, ScalarValue};
pub use session::SyncSession;
pub use specifics::Registry;
pub use state::ProxyState;
pub use store::{Datablock, EntityKind, LiveValue, Store};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
