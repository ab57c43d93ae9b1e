//! The structured proxy model.
//!
//! A proxy is the comparable, serializable mirror of a datablock or
//! nested value. The diff engine compares proxies against live state;
//! the apply engine saves proxies and deltas back into live state. Both
//! go through the attribute-level dispatch in [`attributes`].

pub mod attributes;
pub mod bulk;
pub mod datablock;
pub mod delta;
pub mod reference;
pub mod sequence;
pub mod struct_proxy;

use serde::{Deserialize, Serialize};

pub use bulk::BulkProxy;
pub use datablock::DatablockProxy;
pub use reference::RefProxy;
pub use sequence::SequenceProxy;
pub use struct_proxy::StructProxy;

use crate::ident::DatablockId;

/// A primitive proxied value. Vectors compare component-wise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Vector(Vec<f64>),
}

/// The proxy of one attribute value.
///
/// `None` is explicit absence (an unset pointer), distinct from an
/// attribute not being present in a struct proxy at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Proxy {
    Scalar(ScalarValue),
    Struct(StructProxy),
    Sequence(SequenceProxy),
    Bulk(BulkProxy),
    Ref(RefProxy),
    /// A datablock owned by its parent, mirrored in place. It never has
    /// its own entry in the session's datablock index.
    Embedded(Box<DatablockProxy>),
    None,
}

impl Proxy {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Proxy::Scalar(ScalarValue::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Proxy::Scalar(ScalarValue::Int(i)) => Some(*i),
            _ => None,
        }
    }

    /// Target of a reference proxy, if this is one.
    pub fn ref_target(&self) -> Option<DatablockId> {
        match self {
            Proxy::Ref(r) => Some(r.target),
            _ => None,
        }
    }

    /// Short name of the variant, for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Proxy::Scalar(_) => "scalar",
            Proxy::Struct(_) => "struct",
            Proxy::Sequence(_) => "sequence",
            Proxy::Bulk(_) => "bulk",
            Proxy::Ref(_) => "ref",
            Proxy::Embedded(_) => "embedded",
            Proxy::None => "none",
        }
    }
}
