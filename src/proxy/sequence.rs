//! Proxy of an ordered sequence of structured elements.
//!
//! Sequences never receive positional splices: the diff engine keeps a
//! shared prefix (in-place updates), drops the live-removed tail and
//! appends new elements. How far the prefix extends, and whether the
//! whole sequence must instead be replaced, is decided by the
//! type-specific strategy registered for the sequence kind.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::SyncError;
use crate::state::Context;
use crate::store::value::{LiveSeq, SeqKind};
use crate::Store;

use super::attributes;
use super::delta::{Delta, SequenceDelta};
use super::Proxy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceProxy {
    pub kind: SeqKind,
    pub items: Vec<Proxy>,
}

impl SequenceProxy {
    pub fn new(kind: SeqKind) -> Self {
        Self { kind, items: Vec::new() }
    }

    /// Snapshot every item of a live sequence.
    pub fn load(seq: &LiveSeq, ctx: &mut Context, store: &Store) -> Result<Self, SyncError> {
        let mut proxy = SequenceProxy::new(seq.kind);
        for (i, item) in seq.items.iter().enumerate() {
            ctx.enter_index(i);
            let result = attributes::read_attribute(item, ctx, store);
            ctx.exit_index();
            proxy.items.push(result?);
        }
        Ok(proxy)
    }

    /// Rebuild the live sequence to match this proxy: truncate or grow
    /// it with the kind's strategy, then write every item.
    pub fn save(&self, seq: &mut LiveSeq, ctx: &mut Context) -> Result<(), SyncError> {
        let strategy = ctx.registry.sequence(self.kind);
        if seq.items.len() > self.items.len() {
            (strategy.truncate)(seq, self.items.len());
        }
        while seq.items.len() < self.items.len() {
            let template = &self.items[seq.items.len()];
            let element = (strategy.add_element)(template)?;
            seq.items.push(element);
        }
        for (i, item) in self.items.iter().enumerate() {
            ctx.enter_index(i);
            let result = attributes::write_attribute(&mut seq.items[i], item, ctx);
            ctx.exit_index();
            result?;
        }
        Ok(())
    }

    /// Compare against live. The kind's strategy decides between a full
    /// replacement and a prefix-preserving incremental delta.
    pub fn diff(
        &self,
        seq: &LiveSeq,
        ctx: &mut Context,
        store: &Store,
    ) -> Result<Option<Delta>, SyncError> {
        let strategy = ctx.registry.sequence(self.kind);
        if (strategy.must_replace)(seq, self) {
            // an unchanged sequence still diffs to nothing, so repeated
            // scans over forced-replace kinds stay quiet
            let fresh = SequenceProxy::load(seq, ctx, store)?;
            if fresh == *self {
                return Ok(None);
            }
            return Ok(Some(Delta::Replace(Proxy::Sequence(fresh))));
        }

        // a strategy may not report a prefix longer than either side
        let clear_from = (strategy.clear_from)(seq, self)
            .min(seq.items.len())
            .min(self.items.len());
        let mut delta = SequenceDelta::default();
        for i in 0..clear_from {
            ctx.enter_index(i);
            let result = attributes::diff_attribute(&seq.items[i], &self.items[i], ctx, store);
            ctx.exit_index();
            if let Some(d) = result? {
                delta.updates.push((i, d));
            }
        }
        delta.deletions = self.items.len() - clear_from;
        for (i, item) in seq.items.iter().enumerate().skip(clear_from) {
            ctx.enter_index(i);
            let result = attributes::read_attribute(item, ctx, store);
            ctx.exit_index();
            delta.additions.push(result?);
        }
        Ok(if delta.is_empty() {
            None
        } else {
            Some(Delta::Update(super::delta::DeltaValue::Sequence(delta)))
        })
    }

    /// Merge a sequence delta: deletions first, then in-place updates in
    /// reverse index order, then appends.
    pub fn apply(&mut self, mut seq: Option<&mut LiveSeq>, delta: &SequenceDelta, ctx: &mut Context) {
        let strategy = ctx.registry.sequence(self.kind);
        if delta.deletions > 0 {
            let keep = self.items.len().saturating_sub(delta.deletions);
            self.items.truncate(keep);
            if let Some(live) = seq.as_deref_mut() {
                if live.items.len() > keep {
                    (strategy.truncate)(live, keep);
                }
            }
        }
        for (i, item_delta) in delta.updates.iter().rev() {
            let Some(current) = self.items.get_mut(*i) else {
                warn!(index = i, "sequence update past the end, ignoring");
                continue;
            };
            let taken = std::mem::replace(current, Proxy::None);
            let slot = seq.as_deref_mut().and_then(|s| s.items.get_mut(*i));
            ctx.enter_index(*i);
            *current = attributes::apply_attribute(slot, taken, item_delta, ctx);
            ctx.exit_index();
        }
        for addition in &delta.additions {
            if let Some(live) = seq.as_deref_mut() {
                match (strategy.add_element)(addition) {
                    Ok(element) => {
                        live.items.push(element);
                        let i = live.items.len() - 1;
                        ctx.enter_index(i);
                        if let Err(err) =
                            attributes::write_attribute(&mut live.items[i], addition, ctx)
                        {
                            warn!(index = i, %err, "could not write appended element");
                        }
                        ctx.exit_index();
                    }
                    Err(err) => {
                        warn!(%err, "could not add sequence element");
                        continue;
                    }
                }
            }
            self.items.push(addition.clone());
        }
    }
}
