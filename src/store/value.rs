//! Live attribute values.
//!
//! A datablock's attributes form a tree of `LiveValue`: primitives,
//! nested structs, kind-tagged element collections, flat numeric buffers
//! and references to other datablocks. Nested collections carry a
//! `SeqKind` tag because their mutation API is irregular per kind; the
//! strategy registry keys its add/replace/truncate rules on it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ident::DatablockId;
use crate::path::PathStep;
use crate::store::entity::Datablock;

/// Kind tag of a nested element collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeqKind {
    Modifiers,
    Nodes,
    VertexGroups,
    SplinePoints,
    KeyBlocks,
    Generic,
}

/// A kind-tagged collection of live elements.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveSeq {
    pub kind: SeqKind,
    pub items: Vec<LiveValue>,
}

impl LiveSeq {
    pub fn new(kind: SeqKind) -> Self {
        Self {
            kind,
            items: Vec::new(),
        }
    }
}

/// A flat numeric buffer with an element dimension, e.g. vertex
/// positions (dim 3) or face indices (dim 1). Proxied and transferred as
/// a block rather than per element.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BulkBuffer {
    pub dim: usize,
    pub data: Vec<f64>,
}

impl BulkBuffer {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            data: Vec::new(),
        }
    }

    /// Number of elements (not scalars).
    pub fn element_count(&self) -> usize {
        if self.dim == 0 {
            0
        } else {
            self.data.len() / self.dim
        }
    }

    /// Resize to `count` elements, zero-filling new slots.
    pub fn resize_elements(&mut self, count: usize) {
        self.data.resize(count * self.dim.max(1), 0.0);
    }
}

/// One live attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Vector(Vec<f64>),
    Struct(BTreeMap<String, LiveValue>),
    Sequence(LiveSeq),
    Buffer(BulkBuffer),
    /// Reference to another standalone datablock by id. `None` models an
    /// unset pointer; the target may also not exist yet on this replica.
    Ref(Option<DatablockId>),
    /// A datablock owned exclusively by its parent, never addressable at
    /// top level (e.g. a material's shader graph).
    Embedded(Box<Datablock>),
    None,
}

impl LiveValue {
    /// String field of a struct element, used for kind tags.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        match self {
            LiveValue::Struct(fields) => match fields.get(name) {
                Some(LiveValue::Str(s)) => Some(s.as_str()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Descend one path step.
    pub fn step(&self, step: &PathStep) -> Option<&LiveValue> {
        match (self, step) {
            (LiveValue::Struct(fields), PathStep::Field(name)) => fields.get(name),
            (LiveValue::Sequence(seq), PathStep::Index(index)) => seq.items.get(*index),
            (LiveValue::Embedded(block), PathStep::Field(name)) => block.attrs.get(name),
            _ => None,
        }
    }

    pub fn step_mut(&mut self, step: &PathStep) -> Option<&mut LiveValue> {
        match (self, step) {
            (LiveValue::Struct(fields), PathStep::Field(name)) => fields.get_mut(name),
            (LiveValue::Sequence(seq), PathStep::Index(index)) => seq.items.get_mut(*index),
            (LiveValue::Embedded(block), PathStep::Field(name)) => block.attrs.get_mut(name),
            _ => None,
        }
    }
}
