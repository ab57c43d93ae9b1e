//! Attribute-level dispatch between live values and proxies.
//!
//! Every load, save, diff and apply funnels through these four
//! functions, which pick the proxy variant matching the live value's
//! shape and recurse through the variant modules.

use tracing::warn;

use crate::error::SyncError;
use crate::state::Context;
use crate::store::value::LiveValue;
use crate::Store;

use super::datablock::DatablockProxy;
use super::delta::{Delta, DeltaValue};
use super::reference::RefProxy;
use super::sequence::SequenceProxy;
use super::struct_proxy::StructProxy;
use super::{BulkProxy, Proxy, ScalarValue};

/// Snapshot one live value.
pub fn read_attribute(value: &LiveValue, ctx: &mut Context, store: &Store) -> Result<Proxy, SyncError> {
    Ok(match value {
        LiveValue::Bool(b) => Proxy::Scalar(ScalarValue::Bool(*b)),
        LiveValue::Int(i) => Proxy::Scalar(ScalarValue::Int(*i)),
        LiveValue::Float(f) => Proxy::Scalar(ScalarValue::Float(*f)),
        LiveValue::Str(s) => Proxy::Scalar(ScalarValue::Str(s.clone())),
        LiveValue::Vector(v) => Proxy::Scalar(ScalarValue::Vector(v.clone())),
        LiveValue::Struct(fields) => Proxy::Struct(StructProxy::load(fields, ctx, store)?),
        LiveValue::Sequence(seq) => Proxy::Sequence(SequenceProxy::load(seq, ctx, store)?),
        LiveValue::Buffer(buffer) => Proxy::Bulk(BulkProxy::load(buffer)),
        LiveValue::Ref(Some(target)) => Proxy::Ref(RefProxy::load(*target, store)),
        LiveValue::Ref(None) | LiveValue::None => Proxy::None,
        LiveValue::Embedded(block) => {
            Proxy::Embedded(Box::new(DatablockProxy::load_embedded(block, ctx, store)?))
        }
    })
}

/// Write one proxy into a live slot, replacing whatever shape the slot
/// holds when it does not match.
pub fn write_attribute(slot: &mut LiveValue, proxy: &Proxy, ctx: &mut Context) -> Result<(), SyncError> {
    match proxy {
        Proxy::Scalar(ScalarValue::Bool(b)) => *slot = LiveValue::Bool(*b),
        Proxy::Scalar(ScalarValue::Int(i)) => *slot = LiveValue::Int(*i),
        Proxy::Scalar(ScalarValue::Float(f)) => *slot = LiveValue::Float(*f),
        Proxy::Scalar(ScalarValue::Str(s)) => *slot = LiveValue::Str(s.clone()),
        Proxy::Scalar(ScalarValue::Vector(v)) => *slot = LiveValue::Vector(v.clone()),
        Proxy::Struct(s) => {
            if !matches!(slot, LiveValue::Struct(_)) {
                *slot = LiveValue::Struct(Default::default());
            }
            if let LiveValue::Struct(fields) = slot {
                s.save(fields, ctx)?;
            }
        }
        Proxy::Sequence(s) => {
            let replace = match slot {
                LiveValue::Sequence(live) => live.kind != s.kind,
                _ => true,
            };
            if replace {
                *slot = LiveValue::Sequence(crate::store::value::LiveSeq::new(s.kind));
            }
            if let LiveValue::Sequence(live) = slot {
                s.save(live, ctx)?;
            }
        }
        Proxy::Bulk(b) => {
            if !matches!(slot, LiveValue::Buffer(_)) {
                *slot = LiveValue::Buffer(crate::store::value::BulkBuffer::new(b.dim));
            }
            if let LiveValue::Buffer(buffer) = slot {
                b.save(buffer);
            }
        }
        Proxy::Ref(r) => r.save(slot, ctx),
        Proxy::Embedded(e) => {
            if !matches!(slot, LiveValue::Embedded(_)) {
                *slot = LiveValue::Embedded(Box::new(e.make_embedded_block()));
            }
            if let LiveValue::Embedded(block) = slot {
                e.save_embedded(block, ctx)?;
            }
        }
        Proxy::None => *slot = LiveValue::Ref(None),
    }
    Ok(())
}

/// Compare a live value against its proxy. A shape mismatch yields a
/// full set of the freshly read live value.
pub fn diff_attribute(
    value: &LiveValue,
    proxy: &Proxy,
    ctx: &mut Context,
    store: &Store,
) -> Result<Option<Delta>, SyncError> {
    match (value, proxy) {
        (LiveValue::Bool(b), Proxy::Scalar(ScalarValue::Bool(p))) if b == p => Ok(None),
        (LiveValue::Int(i), Proxy::Scalar(ScalarValue::Int(p))) if i == p => Ok(None),
        (LiveValue::Float(f), Proxy::Scalar(ScalarValue::Float(p))) if f == p => Ok(None),
        (LiveValue::Str(s), Proxy::Scalar(ScalarValue::Str(p))) if s == p => Ok(None),
        (LiveValue::Vector(v), Proxy::Scalar(ScalarValue::Vector(p))) if v == p => Ok(None),
        (LiveValue::Struct(fields), Proxy::Struct(p)) => Ok(p
            .diff(fields, ctx, store)?
            .map(|d| Delta::Update(DeltaValue::Struct(d)))),
        (LiveValue::Sequence(seq), Proxy::Sequence(p)) if seq.kind == p.kind => {
            p.diff(seq, ctx, store)
        }
        (LiveValue::Buffer(buffer), Proxy::Bulk(p)) => {
            p.diff(buffer, ctx, store)?;
            Ok(None)
        }
        (LiveValue::Ref(Some(target)), Proxy::Ref(p)) if *target == p.target => Ok(None),
        (LiveValue::Ref(None) | LiveValue::None, Proxy::None) => Ok(None),
        (LiveValue::Embedded(block), Proxy::Embedded(p)) => Ok(p
            .diff_embedded(block, ctx, store)?
            .map(|d| Delta::Update(DeltaValue::Struct(d)))),
        (live, _) => Ok(Some(Delta::Update(DeltaValue::Set(read_attribute(
            live, ctx, store,
        )?)))),
    }
}

/// Merge a delta into a proxy and, when a live slot is given, into the
/// live value. Returns the updated proxy. Write failures are logged and
/// do not abort the merge; the proxy always advances so both replicas
/// keep identical proxy state.
pub fn apply_attribute(
    slot: Option<&mut LiveValue>,
    current: Proxy,
    delta: &Delta,
    ctx: &mut Context,
) -> Proxy {
    match delta {
        Delta::Replace(proxy) | Delta::Update(DeltaValue::Set(proxy)) => {
            if let Some(slot) = slot {
                if let Err(err) = write_attribute(slot, proxy, ctx) {
                    warn!(path = %ctx.visit.path, %err, "could not write attribute");
                }
            }
            proxy.clone()
        }
        Delta::Update(DeltaValue::Struct(struct_delta)) => {
            let mut proxy = match current {
                Proxy::Struct(p) => p,
                Proxy::Embedded(mut e) => {
                    let block = match slot {
                        Some(LiveValue::Embedded(block)) => Some(block.as_mut()),
                        _ => None,
                    };
                    e.apply_embedded(block, struct_delta, ctx);
                    return Proxy::Embedded(e);
                }
                _ => StructProxy::default(),
            };
            let fields = match slot {
                Some(LiveValue::Struct(fields)) => Some(fields),
                Some(other) => {
                    *other = LiveValue::Struct(Default::default());
                    match other {
                        LiveValue::Struct(fields) => Some(fields),
                        _ => None,
                    }
                }
                None => None,
            };
            proxy.apply(fields, struct_delta, ctx);
            Proxy::Struct(proxy)
        }
        Delta::Update(DeltaValue::Sequence(seq_delta)) => {
            let mut proxy = match current {
                Proxy::Sequence(p) => p,
                _ => {
                    warn!(path = %ctx.visit.path, "sequence delta against a non-sequence, ignoring");
                    return current;
                }
            };
            let live = match slot {
                Some(LiveValue::Sequence(seq)) => Some(seq),
                _ => None,
            };
            proxy.apply(live, seq_delta, ctx);
            Proxy::Sequence(proxy)
        }
    }
}
