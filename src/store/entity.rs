//! Datablocks and their type tags.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ident::DatablockId;
use crate::path::PathStep;
use crate::store::value::LiveValue;

/// Type tag of a live entity.
///
/// Kinds form a small ancestor chain (`Mesh` and `Curve` descend from the
/// abstract `Geometry`), which the strategy registry walks when looking
/// up a handler for a kind it has no direct entry for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Grouping,
    Scene,
    Object,
    Geometry,
    Mesh,
    Curve,
    Light,
    Image,
    Material,
    ShapeKey,
    ShaderGraph,
}

impl EntityKind {
    /// Direct ancestor in the type hierarchy, if any.
    pub fn parent(self) -> Option<EntityKind> {
        match self {
            EntityKind::Mesh | EntityKind::Curve => Some(EntityKind::Geometry),
            _ => None,
        }
    }

    /// The kind itself followed by its ancestors, closest first.
    pub fn ancestors(self) -> impl Iterator<Item = EntityKind> {
        std::iter::successors(Some(self), |kind| kind.parent())
    }

    /// Name of the store bucket this kind lives in, `None` for abstract
    /// kinds and kinds that only occur embedded.
    pub fn bucket(self) -> Option<&'static str> {
        match self {
            EntityKind::Grouping => Some("groupings"),
            EntityKind::Scene => Some("scenes"),
            EntityKind::Object => Some("objects"),
            EntityKind::Mesh => Some("meshes"),
            EntityKind::Curve => Some("curves"),
            EntityKind::Light => Some("lights"),
            EntityKind::Image => Some("images"),
            EntityKind::Material => Some("materials"),
            EntityKind::ShapeKey => Some("shape_keys"),
            EntityKind::Geometry | EntityKind::ShaderGraph => None,
        }
    }
}

/// Light kinds and the attributes only valid for each of them. Setting a
/// light's "kind" discards attributes of the previous kind, which is why
/// the kind must be applied before any other attribute.
const LIGHT_KIND_ATTRS: &[(&str, &[&str])] = &[
    ("POINT", &["radius"]),
    ("SUN", &["angle"]),
    ("SPOT", &["spot_size", "spot_blend"]),
    ("AREA", &["size_x", "size_y"]),
];

fn light_kind_defaults(kind: &str) -> Vec<(&'static str, LiveValue)> {
    match kind {
        "POINT" => vec![("radius", LiveValue::Float(0.1))],
        "SUN" => vec![("angle", LiveValue::Float(0.009))],
        "SPOT" => vec![
            ("spot_size", LiveValue::Float(0.785)),
            ("spot_blend", LiveValue::Float(0.15)),
        ],
        "AREA" => vec![
            ("size_x", LiveValue::Float(1.0)),
            ("size_y", LiveValue::Float(1.0)),
        ],
        _ => Vec::new(),
    }
}

/// One live entity: a named, typed attribute tree with a stable id.
#[derive(Debug, Clone, PartialEq)]
pub struct Datablock {
    pub id: DatablockId,
    pub name: String,
    pub kind: EntityKind,
    pub embedded: bool,
    pub attrs: BTreeMap<String, LiveValue>,
}

impl Datablock {
    pub fn new(kind: EntityKind, name: impl Into<String>) -> Self {
        Self {
            id: DatablockId::new(),
            name: name.into(),
            kind,
            embedded: false,
            attrs: BTreeMap::new(),
        }
    }

    pub fn new_embedded(kind: EntityKind, name: impl Into<String>) -> Self {
        let mut block = Self::new(kind, name);
        block.embedded = true;
        block
    }

    pub fn attr(&self, name: &str) -> Option<&LiveValue> {
        self.attrs.get(name)
    }

    pub fn attr_mut(&mut self, name: &str) -> Option<&mut LiveValue> {
        self.attrs.get_mut(name)
    }

    /// Set an attribute, honoring the kind-change quirk of lights: when
    /// a light's "kind" changes, attributes of the previous kind are
    /// discarded and the new kind's attributes appear with defaults.
    pub fn set_attr(&mut self, name: &str, value: LiveValue) {
        if self.kind == EntityKind::Light && name == "kind" {
            if let LiveValue::Str(new_kind) = &value {
                let changed = self.attrs.get("kind").map(|current| match current {
                    LiveValue::Str(kind) => kind != new_kind,
                    _ => true,
                });
                if changed != Some(false) {
                    for (_, attrs) in LIGHT_KIND_ATTRS {
                        for attr in *attrs {
                            self.attrs.remove(*attr);
                        }
                    }
                    for (attr, default) in light_kind_defaults(new_kind) {
                        self.attrs.insert(attr.to_string(), default);
                    }
                }
            }
        }
        self.attrs.insert(name.to_string(), value);
    }

    /// The "data" reference of a container entity, if any.
    pub fn data_ref(&self) -> Option<DatablockId> {
        match self.attrs.get("data") {
            Some(LiveValue::Ref(target)) => *target,
            _ => None,
        }
    }

    /// Resolve a path from this datablock's root to a nested value.
    pub fn value_at_path_mut(&mut self, steps: &[PathStep]) -> Option<&mut LiveValue> {
        let (first, rest) = steps.split_first()?;
        let mut value = match first {
            PathStep::Field(name) => self.attrs.get_mut(name)?,
            PathStep::Index(_) => return None,
        };
        for step in rest {
            value = value.step_mut(step)?;
        }
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ancestor_chain() {
        let chain: Vec<_> = EntityKind::Mesh.ancestors().collect();
        assert_eq!(chain, vec![EntityKind::Mesh, EntityKind::Geometry]);
        let chain: Vec<_> = EntityKind::Scene.ancestors().collect();
        assert_eq!(chain, vec![EntityKind::Scene]);
    }

    #[test]
    fn test_light_kind_change_resets_kind_attrs() {
        let mut light = Datablock::new(EntityKind::Light, "Sun");
        light.set_attr("kind", LiveValue::Str("SUN".to_string()));
        light.set_attr("angle", LiveValue::Float(0.5));
        assert!(light.attr("angle").is_some());

        light.set_attr("kind", LiveValue::Str("SPOT".to_string()));
        assert!(light.attr("angle").is_none());
        assert!(light.attr("spot_size").is_some());
        assert!(light.attr("spot_blend").is_some());
    }

    #[test]
    fn test_same_kind_keeps_attrs() {
        let mut light = Datablock::new(EntityKind::Light, "Spot");
        light.set_attr("kind", LiveValue::Str("SPOT".to_string()));
        light.set_attr("spot_size", LiveValue::Float(1.2));
        light.set_attr("kind", LiveValue::Str("SPOT".to_string()));
        assert_eq!(light.attr("spot_size"), Some(&LiveValue::Float(1.2)));
    }
}
