//! Wire encoding of changesets.
//!
//! Changesets travel as a stream of CBOR messages, one command per
//! message. Field names use camelCase on the wire. Bulk buffer payloads
//! are packed as raw little-endian bytes rather than CBOR arrays so a
//! large geometry update stays a single contiguous blob.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::changeset::{Changeset, Rename};
use crate::error::SyncError;
use crate::ident::DatablockId;
use crate::path::{AttrPath, PathStep};
use crate::proxy::datablock::DatablockProxy;
use crate::proxy::delta::{BulkUpdate, DatablockDelta, SoaMember};
use crate::session::SyncSession;
use crate::store::entity::EntityKind;
use crate::Store;

/// One synchronization command on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncMessage {
    #[serde(rename = "create")]
    Create { proxy: DatablockProxy },
    #[serde(rename = "remove")]
    Remove { uuid: DatablockId, kind: EntityKind },
    #[serde(rename = "rename")]
    Rename {
        uuid: DatablockId,
        #[serde(rename = "oldName")]
        old_name: String,
        #[serde(rename = "newName")]
        new_name: String,
        reason: String,
    },
    #[serde(rename = "update")]
    Update { delta: DatablockDelta },
    #[serde(rename = "bulk")]
    Bulk {
        uuid: DatablockId,
        path: AttrPath,
        members: Vec<SoaMemberWire>,
    },
}

/// Wire form of one bulk array: the payload is little-endian f64 bytes.
/// `step` keeps the member's path step typed, so a buffer sitting under
/// a sequence index routes the same way on both sides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoaMemberWire {
    pub step: PathStep,
    pub dim: usize,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl From<&SoaMember> for SoaMemberWire {
    fn from(member: &SoaMember) -> Self {
        let mut data = Vec::with_capacity(member.data.len() * 8);
        for value in &member.data {
            data.extend_from_slice(&value.to_le_bytes());
        }
        Self {
            step: member.step.clone(),
            dim: member.dim,
            data,
        }
    }
}

impl SoaMemberWire {
    fn unpack(&self) -> Result<SoaMember, SyncError> {
        if self.data.len() % 8 != 0 {
            return Err(SyncError::Decode(format!(
                "bulk member {} carries {} bytes, not a multiple of 8",
                self.step,
                self.data.len()
            )));
        }
        let data = self
            .data
            .chunks_exact(8)
            .map(|chunk| {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(chunk);
                f64::from_le_bytes(bytes)
            })
            .collect();
        Ok(SoaMember {
            step: self.step.clone(),
            dim: self.dim,
            data,
        })
    }
}

impl SyncMessage {
    /// Encode as CBOR bytes.
    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| SyncError::Encode(e.to_string()))?;
        Ok(buf)
    }

    /// Decode from CBOR bytes.
    pub fn decode(data: &[u8]) -> Result<Self, SyncError> {
        ciborium::from_reader(data).map_err(|e: ciborium::de::Error<std::io::Error>| {
            SyncError::Decode(e.to_string())
        })
    }
}

/// Flatten a changeset into its wire messages. Each section is already
/// dependency-sorted; the section order puts creations first so updates
/// and bulk payloads always address existing datablocks.
pub fn encode_changeset(changeset: &Changeset) -> Vec<SyncMessage> {
    let mut messages = Vec::new();
    for proxy in &changeset.creations {
        messages.push(SyncMessage::Create { proxy: proxy.clone() });
    }
    for removal in &changeset.removals {
        messages.push(SyncMessage::Remove {
            uuid: removal.uuid,
            kind: removal.kind,
        });
    }
    for rename in &changeset.renames {
        messages.push(SyncMessage::Rename {
            uuid: rename.uuid,
            old_name: rename.old_name.clone(),
            new_name: rename.new_name.clone(),
            reason: rename.reason.clone(),
        });
    }
    for update in &changeset.updates {
        messages.push(SyncMessage::Update { delta: update.clone() });
    }
    for (uuid, update) in &changeset.bulk_updates {
        messages.push(SyncMessage::Bulk {
            uuid: *uuid,
            path: update.path.clone(),
            members: update.members.iter().map(SoaMemberWire::from).collect(),
        });
    }
    messages
}

fn push_renames(outbound: &mut Vec<SyncMessage>, renames: Vec<Rename>) {
    for rename in renames {
        outbound.push(SyncMessage::Rename {
            uuid: rename.uuid,
            old_name: rename.old_name,
            new_name: rename.new_name,
            reason: rename.reason,
        });
    }
}

/// Apply a batch of inbound messages to a session. Renames are batched
/// so that the two-phase rename sees swapped names together. Returns
/// the messages this replica must broadcast in turn: conflict renames,
/// and the renames of local datablocks that yielded their name to an
/// inbound creation.
pub fn apply_messages(
    session: &mut SyncSession,
    store: &mut Store,
    messages: &[SyncMessage],
) -> Result<Vec<SyncMessage>, SyncError> {
    let mut outbound = Vec::new();
    let mut renames: Vec<Rename> = Vec::new();
    let mut created = false;

    let mut flush_renames =
        |session: &mut SyncSession, store: &mut Store, renames: &mut Vec<Rename>, outbound: &mut Vec<SyncMessage>| {
            if renames.is_empty() {
                return;
            }
            let conflicts = session.rename_datablocks(store, renames);
            renames.clear();
            push_renames(outbound, conflicts);
        };

    for message in messages {
        match message {
            SyncMessage::Rename { uuid, old_name, new_name, reason } => {
                renames.push(Rename {
                    uuid: *uuid,
                    old_name: old_name.clone(),
                    new_name: new_name.clone(),
                    reason: reason.clone(),
                });
                continue;
            }
            _ => flush_renames(session, store, &mut renames, &mut outbound),
        }
        // per-command failures are isolated: one refused command must
        // not take the rest of the batch down with it
        match message {
            SyncMessage::Create { proxy } => {
                match session.create_datablock(store, proxy.clone()) {
                    Ok(Some(yielded)) => push_renames(&mut outbound, vec![yielded]),
                    Ok(None) => {}
                    Err(err) => warn!(uuid = %proxy.uuid, %err, "inbound creation refused"),
                }
                created = true;
            }
            SyncMessage::Remove { uuid, .. } => {
                if created {
                    push_renames(&mut outbound, session.flush_delayed(store));
                    created = false;
                }
                session.remove_datablock(store, *uuid);
            }
            SyncMessage::Update { delta } => {
                if created {
                    push_renames(&mut outbound, session.flush_delayed(store));
                    created = false;
                }
                if let Err(err) = session.update_datablock(store, delta) {
                    warn!(uuid = %delta.uuid, %err, "inbound update refused");
                }
            }
            SyncMessage::Bulk { uuid, path, members } => {
                if created {
                    push_renames(&mut outbound, session.flush_delayed(store));
                    created = false;
                }
                let update = BulkUpdate {
                    path: path.clone(),
                    members: members
                        .iter()
                        .map(SoaMemberWire::unpack)
                        .collect::<Result<_, _>>()?,
                };
                if let Err(err) = session.update_bulk(store, *uuid, &update) {
                    warn!(%uuid, %err, "inbound bulk update refused");
                }
            }
            SyncMessage::Rename { .. } => unreachable!(),
        }
    }
    flush_renames(session, store, &mut renames, &mut outbound);
    if created {
        push_renames(&mut outbound, session.flush_delayed(store));
    }
    Ok(outbound)
}
