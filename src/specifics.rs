//! Type-specific behavior, looked up by kind.
//!
//! The engine core is type-agnostic; everything a particular entity
//! kind needs done differently is registered here as data. Lookups walk
//! the kind's ancestor chain, so a strategy registered for the abstract
//! `Geometry` also serves `Mesh` and `Curve`.

use std::collections::{HashMap, HashSet};

use crate::error::SyncError;
use crate::ident::DatablockId;
use crate::proxy::datablock::DatablockProxy;
use crate::proxy::sequence::SequenceProxy;
use crate::proxy::{Proxy, ScalarValue};
use crate::state::ProxyState;
use crate::store::entity::EntityKind;
use crate::store::value::{LiveSeq, LiveValue, SeqKind};
use crate::Store;

/// Builds the live datablock for an inbound creation, from the incoming
/// proxy. Returns the id of the created entity; the generic save pass
/// fills in the attributes afterwards.
pub type CtorFn = fn(&mut Store, &DatablockProxy, &ProxyState) -> Result<DatablockId, SyncError>;

/// How one sequence kind diffs and mutates.
#[derive(Clone, Copy)]
pub struct SequenceStrategy {
    /// When true, the diff ships a full replacement instead of an
    /// incremental delta. Sequences whose elements cannot be mutated in
    /// place after structural changes must replace.
    pub must_replace: fn(&LiveSeq, &SequenceProxy) -> bool,
    /// Length of the reusable prefix; everything past it is dropped and
    /// re-read.
    pub clear_from: fn(&LiveSeq, &SequenceProxy) -> usize,
    /// Build a new live element from its incoming proxy. Fails when the
    /// proxy lacks the data construction needs.
    pub add_element: fn(&Proxy) -> Result<LiveValue, SyncError>,
    /// Shrink the live sequence to `len` elements.
    pub truncate: fn(&mut LiveSeq, usize),
}

/// Registry of per-kind constructors, per-sequence-kind strategies and
/// the kinds whose buffers may change length on a non-empty target.
pub struct Registry {
    ctors: HashMap<EntityKind, CtorFn>,
    sequences: HashMap<SeqKind, SequenceStrategy>,
    resizable: HashSet<EntityKind>,
}

const GENERIC_SEQUENCE: SequenceStrategy = SequenceStrategy {
    must_replace: must_replace_never,
    clear_from: clear_from_min,
    add_element: add_generic,
    truncate: truncate_tail,
};

impl Registry {
    /// The standard registry for the scene store.
    pub fn standard() -> Self {
        let mut registry = Registry {
            ctors: HashMap::new(),
            sequences: HashMap::new(),
            resizable: HashSet::new(),
        };
        registry.register_ctor(EntityKind::Grouping, ctor_grouping);
        registry.register_ctor(EntityKind::Scene, ctor_scene);
        registry.register_ctor(EntityKind::Object, ctor_object);
        registry.register_ctor(EntityKind::Mesh, ctor_mesh);
        registry.register_ctor(EntityKind::Curve, ctor_curve);
        registry.register_ctor(EntityKind::Light, ctor_light);
        registry.register_ctor(EntityKind::Image, ctor_image);
        registry.register_ctor(EntityKind::Material, ctor_material);
        registry.register_ctor(EntityKind::ShapeKey, ctor_shape_key);

        registry.register_sequence(
            SeqKind::Modifiers,
            SequenceStrategy {
                must_replace: must_replace_never,
                clear_from: clear_from_same_kind,
                add_element: add_modifier,
                truncate: truncate_tail,
            },
        );
        registry.register_sequence(
            SeqKind::Nodes,
            SequenceStrategy {
                must_replace: must_replace_never,
                clear_from: clear_from_same_node_kind,
                add_element: add_node,
                truncate: truncate_tail,
            },
        );
        registry.register_sequence(
            SeqKind::VertexGroups,
            SequenceStrategy {
                // group membership weights hang off the group order, so
                // any structural change rebuilds the whole list
                must_replace: must_replace_on_length_or_name_change,
                clear_from: clear_from_none,
                add_element: add_vertex_group,
                truncate: truncate_all_or_tail,
            },
        );
        registry.register_sequence(
            SeqKind::SplinePoints,
            SequenceStrategy {
                // spline points cannot be edited in place: any change
                // rebuilds the whole spline
                must_replace: must_replace_always,
                clear_from: clear_from_none,
                add_element: add_spline_point,
                truncate: truncate_tail,
            },
        );
        registry.register_sequence(
            SeqKind::KeyBlocks,
            SequenceStrategy {
                // blocks relate by name; adding, removing or renaming
                // one rebuilds the whole set
                must_replace: must_replace_on_length_or_name_change,
                clear_from: clear_from_min,
                add_element: add_key_block,
                truncate: truncate_tail,
            },
        );

        registry.resizable.insert(EntityKind::Geometry);
        registry
    }

    pub fn register_ctor(&mut self, kind: EntityKind, ctor: CtorFn) {
        self.ctors.insert(kind, ctor);
    }

    pub fn register_sequence(&mut self, kind: SeqKind, strategy: SequenceStrategy) {
        self.sequences.insert(kind, strategy);
    }

    pub fn register_resizable(&mut self, kind: EntityKind) {
        self.resizable.insert(kind);
    }

    /// Constructor for a kind, walking the ancestor chain.
    pub fn ctor(&self, kind: EntityKind) -> Option<CtorFn> {
        kind.ancestors().find_map(|k| self.ctors.get(&k).copied())
    }

    /// Strategy for a sequence kind, falling back to the generic one.
    pub fn sequence(&self, kind: SeqKind) -> SequenceStrategy {
        self.sequences.get(&kind).copied().unwrap_or(GENERIC_SEQUENCE)
    }

    /// May buffers of this kind change length while non-empty?
    pub fn can_resize(&self, kind: EntityKind) -> bool {
        kind.ancestors().any(|k| self.resizable.contains(&k))
    }
}

/// Kind-dependent fixups that must run before the generic attribute
/// save. A light's kind resets its kind-specific attributes, so it has
/// to land before any of them do.
pub fn pre_save(block: &mut crate::store::entity::Datablock, proxy: &DatablockProxy) {
    if block.kind == EntityKind::Light {
        if let Some(kind) = proxy.attr_str("kind") {
            block.set_attr("kind", LiveValue::Str(kind.to_string()));
        }
    }
}

fn construction_failed(proxy: &DatablockProxy, reason: &str) -> SyncError {
    SyncError::ConstructionFailed {
        collection: proxy.bucket.clone(),
        name: proxy.name().to_string(),
        reason: reason.to_string(),
    }
}

fn ctor_grouping(store: &mut Store, proxy: &DatablockProxy, _state: &ProxyState) -> Result<DatablockId, SyncError> {
    Ok(store.new_grouping(proxy.name()))
}

fn ctor_scene(store: &mut Store, proxy: &DatablockProxy, _state: &ProxyState) -> Result<DatablockId, SyncError> {
    Ok(store.new_scene(proxy.name()))
}

fn ctor_object(store: &mut Store, proxy: &DatablockProxy, state: &ProxyState) -> Result<DatablockId, SyncError> {
    // the payload must exist at construction; a still-missing target is
    // handled later through the unresolved reference slots
    let data = proxy
        .ref_target("data")
        .filter(|target| state.datablocks.contains_key(target));
    Ok(store.new_object(proxy.name(), data))
}

fn ctor_mesh(store: &mut Store, proxy: &DatablockProxy, _state: &ProxyState) -> Result<DatablockId, SyncError> {
    Ok(store.new_mesh(proxy.name()))
}

fn ctor_curve(store: &mut Store, proxy: &DatablockProxy, _state: &ProxyState) -> Result<DatablockId, SyncError> {
    Ok(store.new_curve(proxy.name()))
}

fn ctor_light(store: &mut Store, proxy: &DatablockProxy, _state: &ProxyState) -> Result<DatablockId, SyncError> {
    let kind = proxy
        .attr_str("kind")
        .ok_or_else(|| construction_failed(proxy, "light without a kind"))?;
    Ok(store.new_light(proxy.name(), kind))
}

fn ctor_image(store: &mut Store, proxy: &DatablockProxy, _state: &ProxyState) -> Result<DatablockId, SyncError> {
    let path = proxy.attr_str("source_path").unwrap_or_default();
    if !path.is_empty() {
        return Ok(store.load_image(proxy.name(), path));
    }
    let width = proxy.attr_int("width").unwrap_or(0);
    let height = proxy.attr_int("height").unwrap_or(0);
    if width <= 0 || height <= 0 {
        return Err(construction_failed(
            proxy,
            "image with neither a source path nor dimensions",
        ));
    }
    Ok(store.new_image(proxy.name(), width, height))
}

fn ctor_material(store: &mut Store, proxy: &DatablockProxy, _state: &ProxyState) -> Result<DatablockId, SyncError> {
    Ok(store.new_material(proxy.name()))
}

/// Shape keys have no direct constructor: they are built through an
/// object using the keyed data, found via the data-usage index.
fn ctor_shape_key(store: &mut Store, proxy: &DatablockProxy, state: &ProxyState) -> Result<DatablockId, SyncError> {
    let owner = proxy
        .ref_target("owner")
        .ok_or_else(|| construction_failed(proxy, "shape key without an owner"))?;
    let object = state
        .objects
        .get(&owner)
        .and_then(|users| users.iter().next().copied())
        .ok_or_else(|| construction_failed(proxy, "no object uses the keyed data yet"))?;
    store
        .add_shape_key(object)
        .ok_or_else(|| construction_failed(proxy, "owning object cannot carry shape keys"))
}

fn must_replace_never(_live: &LiveSeq, _proxy: &SequenceProxy) -> bool {
    false
}

fn must_replace_always(_live: &LiveSeq, _proxy: &SequenceProxy) -> bool {
    true
}

fn clear_from_min(live: &LiveSeq, proxy: &SequenceProxy) -> usize {
    live.items.len().min(proxy.items.len())
}

fn clear_from_none(_live: &LiveSeq, _proxy: &SequenceProxy) -> usize {
    0
}

/// Reusable prefix of elements whose kind tag is unchanged. An element
/// cannot morph in place into another kind; the first mismatch ends the
/// prefix.
fn clear_from_tagged(live: &LiveSeq, proxy: &SequenceProxy, tag: &str) -> usize {
    let max = live.items.len().min(proxy.items.len());
    for i in 0..max {
        let live_tag = live.items[i].field_str(tag);
        let proxy_tag = match &proxy.items[i] {
            Proxy::Struct(s) => s.member(tag).and_then(Proxy::as_str),
            _ => None,
        };
        if live_tag.is_none() || live_tag != proxy_tag {
            return i;
        }
    }
    max
}

fn clear_from_same_kind(live: &LiveSeq, proxy: &SequenceProxy) -> usize {
    clear_from_tagged(live, proxy, "kind")
}

fn clear_from_same_node_kind(live: &LiveSeq, proxy: &SequenceProxy) -> usize {
    clear_from_tagged(live, proxy, "node_kind")
}

fn must_replace_on_length_or_name_change(live: &LiveSeq, proxy: &SequenceProxy) -> bool {
    if live.items.len() != proxy.items.len() {
        return true;
    }
    live.items.iter().zip(&proxy.items).any(|(l, p)| {
        let proxy_name = match p {
            Proxy::Struct(s) => s.member("name").and_then(Proxy::as_str),
            _ => None,
        };
        l.field_str("name") != proxy_name
    })
}

fn proxy_member_str<'a>(proxy: &'a Proxy, name: &str) -> Option<&'a str> {
    match proxy {
        Proxy::Struct(s) => s.member(name).and_then(Proxy::as_str),
        _ => None,
    }
}

fn struct_with(fields: Vec<(&str, LiveValue)>) -> LiveValue {
    LiveValue::Struct(
        fields
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect(),
    )
}

fn add_generic(proxy: &Proxy) -> Result<LiveValue, SyncError> {
    Ok(match proxy {
        Proxy::Ref(_) | Proxy::None => LiveValue::Ref(None),
        Proxy::Struct(_) => LiveValue::Struct(Default::default()),
        Proxy::Scalar(ScalarValue::Bool(_)) => LiveValue::Bool(false),
        Proxy::Scalar(ScalarValue::Int(_)) => LiveValue::Int(0),
        Proxy::Scalar(ScalarValue::Float(_)) => LiveValue::Float(0.0),
        Proxy::Scalar(ScalarValue::Str(_)) => LiveValue::Str(String::new()),
        Proxy::Scalar(ScalarValue::Vector(v)) => LiveValue::Vector(vec![0.0; v.len()]),
        _ => LiveValue::None,
    })
}

/// A modifier element is created from its name and kind; the remaining
/// settings are written by the generic pass.
fn add_modifier(proxy: &Proxy) -> Result<LiveValue, SyncError> {
    let kind = proxy_member_str(proxy, "kind").ok_or_else(|| SyncError::ConstructionFailed {
        collection: "modifiers".to_string(),
        name: proxy_member_str(proxy, "name").unwrap_or_default().to_string(),
        reason: "modifier without a kind".to_string(),
    })?;
    let name = proxy_member_str(proxy, "name").unwrap_or_default();
    Ok(struct_with(vec![
        ("name", LiveValue::Str(name.to_string())),
        ("kind", LiveValue::Str(kind.to_string())),
        ("enabled", LiveValue::Bool(true)),
    ]))
}

fn add_node(proxy: &Proxy) -> Result<LiveValue, SyncError> {
    let kind = proxy_member_str(proxy, "node_kind").ok_or_else(|| SyncError::ConstructionFailed {
        collection: "nodes".to_string(),
        name: proxy_member_str(proxy, "name").unwrap_or_default().to_string(),
        reason: "node without a node_kind".to_string(),
    })?;
    Ok(struct_with(vec![
        ("name", LiveValue::Str(
            proxy_member_str(proxy, "name").unwrap_or_default().to_string(),
        )),
        ("node_kind", LiveValue::Str(kind.to_string())),
        ("inputs", LiveValue::Struct(Default::default())),
    ]))
}

fn add_vertex_group(proxy: &Proxy) -> Result<LiveValue, SyncError> {
    let name = proxy_member_str(proxy, "name").unwrap_or_default();
    Ok(struct_with(vec![
        ("name", LiveValue::Str(name.to_string())),
        ("locked", LiveValue::Bool(false)),
    ]))
}

fn add_spline_point(_proxy: &Proxy) -> Result<LiveValue, SyncError> {
    Ok(struct_with(vec![
        ("co", LiveValue::Vector(vec![0.0; 3])),
        ("radius", LiveValue::Float(1.0)),
    ]))
}

fn add_key_block(proxy: &Proxy) -> Result<LiveValue, SyncError> {
    let name = proxy_member_str(proxy, "name").unwrap_or_default();
    Ok(struct_with(vec![
        ("name", LiveValue::Str(name.to_string())),
        ("value", LiveValue::Float(0.0)),
        ("points", LiveValue::Buffer(crate::store::value::BulkBuffer::new(3))),
    ]))
}

fn truncate_tail(seq: &mut LiveSeq, len: usize) {
    seq.items.truncate(len);
}

/// Vertex groups are cleared wholesale when emptied; a partial truncate
/// keeps the prefix like everywhere else.
fn truncate_all_or_tail(seq: &mut LiveSeq, len: usize) {
    if len == 0 {
        seq.items.clear();
    } else {
        seq.items.truncate(len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ctor_lookup_walks_ancestors() {
        let mut registry = Registry::standard();
        assert!(registry.ctor(EntityKind::Mesh).is_some());
        // a ctor registered for the abstract ancestor serves kinds
        // without a direct entry
        registry.ctors.remove(&EntityKind::Mesh);
        assert!(registry.ctor(EntityKind::Mesh).is_none());
        registry.register_ctor(EntityKind::Geometry, ctor_mesh);
        assert!(registry.ctor(EntityKind::Mesh).is_some());
        assert!(registry.ctor(EntityKind::Curve).is_some());
    }

    #[test]
    fn test_resize_permission_follows_ancestors() {
        let mut registry = Registry::standard();
        assert!(registry.can_resize(EntityKind::Mesh));
        assert!(registry.can_resize(EntityKind::Curve));
        assert!(!registry.can_resize(EntityKind::Light));

        registry.register_resizable(EntityKind::Light);
        assert!(registry.can_resize(EntityKind::Light));
    }

    #[test]
    fn test_tagged_prefix_stops_at_kind_change() {
        let mut live = LiveSeq::new(SeqKind::Modifiers);
        live.items.push(struct_with(vec![
            ("name", LiveValue::Str("Solidify".into())),
            ("kind", LiveValue::Str("SOLIDIFY".into())),
        ]));
        live.items.push(struct_with(vec![
            ("name", LiveValue::Str("Bevel".into())),
            ("kind", LiveValue::Str("BEVEL".into())),
        ]));

        let mut proxy = SequenceProxy::new(SeqKind::Modifiers);
        let mut first = crate::proxy::struct_proxy::StructProxy::default();
        first.members.insert(
            "kind".into(),
            Proxy::Scalar(ScalarValue::Str("SOLIDIFY".into())),
        );
        let mut second = crate::proxy::struct_proxy::StructProxy::default();
        second.members.insert(
            "kind".into(),
            Proxy::Scalar(ScalarValue::Str("SUBSURF".into())),
        );
        proxy.items.push(Proxy::Struct(first));
        proxy.items.push(Proxy::Struct(second));

        assert_eq!(clear_from_same_kind(&live, &proxy), 1);
    }

    #[test]
    fn test_spline_points_always_force_replace() {
        let registry = Registry::standard();
        let strategy = registry.sequence(SeqKind::SplinePoints);
        let live = LiveSeq::new(SeqKind::SplinePoints);
        let proxy = SequenceProxy::new(SeqKind::SplinePoints);
        assert!((strategy.must_replace)(&live, &proxy));
    }

    #[test]
    fn test_key_blocks_replace_on_rename_or_length_change() {
        let registry = Registry::standard();
        let strategy = registry.sequence(SeqKind::KeyBlocks);

        let mut live = LiveSeq::new(SeqKind::KeyBlocks);
        live.items
            .push(struct_with(vec![("name", LiveValue::Str("Basis".into()))]));
        let mut proxy = SequenceProxy::new(SeqKind::KeyBlocks);
        let mut block = crate::proxy::struct_proxy::StructProxy::default();
        block
            .members
            .insert("name".into(), Proxy::Scalar(ScalarValue::Str("Basis".into())));
        proxy.items.push(Proxy::Struct(block));
        assert!(!(strategy.must_replace)(&live, &proxy));

        live.items[0] = struct_with(vec![("name", LiveValue::Str("Smile".into()))]);
        assert!((strategy.must_replace)(&live, &proxy));

        live.items[0] = struct_with(vec![("name", LiveValue::Str("Basis".into()))]);
        live.items
            .push(struct_with(vec![("name", LiveValue::Str("Smile".into()))]));
        assert!((strategy.must_replace)(&live, &proxy));
    }

    #[test]
    fn test_light_ctor_requires_kind() {
        let mut store = Store::new();
        let proxy = DatablockProxy {
            uuid: DatablockId::new(),
            bucket: "lights".to_string(),
            kind: EntityKind::Light,
            data: Default::default(),
        };
        let state = ProxyState::default();
        assert!(matches!(
            ctor_light(&mut store, &proxy, &state),
            Err(SyncError::ConstructionFailed { .. })
        ));
    }
}
