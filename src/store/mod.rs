//! The live object store.
//!
//! Each participant owns one `Store`: named buckets of typed datablocks
//! with nested attributes, bulk buffers and cross-entity references. The
//! store's construction and mutation API is deliberately irregular per
//! kind (objects need their data payload up front, lights need their
//! kind, images their dimensions, shape keys their owning object); the
//! strategy registry in `specifics` centralizes these quirks so the diff
//! and apply engines stay uniform.
//!
//! Names are unique per bucket; inserting or renaming onto a taken name
//! uniquifies with a numeric suffix, which is why batch renames must go
//! through a placeholder pass first.

pub mod entity;
pub mod value;

use std::collections::BTreeMap;

use tracing::warn;

pub use entity::{Datablock, EntityKind};
pub use value::{BulkBuffer, LiveSeq, LiveValue, SeqKind};

use crate::ident::DatablockId;
use crate::store::value::SeqKind as Sk;

/// Buckets every store carries. The order is not meaningful; dependency
/// ordering lives in `changeset`.
pub const BUCKET_NAMES: &[&str] = &[
    "groupings",
    "scenes",
    "objects",
    "meshes",
    "curves",
    "lights",
    "images",
    "materials",
    "shape_keys",
];

/// The live, in-process object store.
#[derive(Debug)]
pub struct Store {
    buckets: BTreeMap<String, Vec<Datablock>>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        let mut buckets = BTreeMap::new();
        for name in BUCKET_NAMES {
            buckets.insert(name.to_string(), Vec::new());
        }
        Self { buckets }
    }

    pub fn bucket(&self, name: &str) -> Option<&[Datablock]> {
        self.buckets.get(name).map(|bucket| bucket.as_slice())
    }

    pub fn get(&self, id: DatablockId) -> Option<&Datablock> {
        self.buckets
            .values()
            .flatten()
            .find(|block| block.id == id)
    }

    pub fn get_mut(&mut self, id: DatablockId) -> Option<&mut Datablock> {
        self.buckets
            .values_mut()
            .flatten()
            .find(|block| block.id == id)
    }

    pub fn get_by_name(&self, bucket: &str, name: &str) -> Option<&Datablock> {
        self.buckets.get(bucket)?.iter().find(|block| block.name == name)
    }

    fn unique_name(&self, bucket: &str, want: &str) -> String {
        if self.get_by_name(bucket, want).is_none() {
            return want.to_string();
        }
        let mut counter = 1;
        loop {
            let candidate = format!("{}.{:03}", want, counter);
            if self.get_by_name(bucket, &candidate).is_none() {
                return candidate;
            }
            counter += 1;
        }
    }

    /// Insert a datablock into the bucket of its kind, uniquifying the
    /// name on collision. Returns the id. An embedded-only kind has no
    /// bucket and is not inserted.
    pub fn insert(&mut self, mut block: Datablock) -> DatablockId {
        let id = block.id;
        let Some(bucket) = block.kind.bucket() else {
            warn!(kind = ?block.kind, name = %block.name, "kind has no bucket, not inserted");
            return id;
        };
        block.name = self.unique_name(bucket, &block.name);
        if let Some(entries) = self.buckets.get_mut(bucket) {
            entries.push(block);
        }
        id
    }

    pub fn new_grouping(&mut self, name: &str) -> DatablockId {
        let mut block = Datablock::new(EntityKind::Grouping, name);
        block.attrs.insert(
            "children".to_string(),
            LiveValue::Sequence(LiveSeq::new(Sk::Generic)),
        );
        block
            .attrs
            .insert("instance_offset".to_string(), LiveValue::Vector(vec![0.0; 3]));
        self.insert(block)
    }

    pub fn new_scene(&mut self, name: &str) -> DatablockId {
        let mut block = Datablock::new(EntityKind::Scene, name);
        block.attrs.insert("root_grouping".to_string(), LiveValue::Ref(None));
        block.attrs.insert("frame_start".to_string(), LiveValue::Int(1));
        block.attrs.insert("frame_end".to_string(), LiveValue::Int(250));
        block.attrs.insert("fps".to_string(), LiveValue::Float(24.0));
        self.insert(block)
    }

    /// Create an object. The data payload reference is part of the
    /// construction signature and cannot be set afterwards from nothing.
    pub fn new_object(&mut self, name: &str, data: Option<DatablockId>) -> DatablockId {
        let mut block = Datablock::new(EntityKind::Object, name);
        block.attrs.insert("data".to_string(), LiveValue::Ref(data));
        block
            .attrs
            .insert("location".to_string(), LiveValue::Vector(vec![0.0; 3]));
        block.attrs.insert("hide".to_string(), LiveValue::Bool(false));
        block
            .attrs
            .insert("instance_grouping".to_string(), LiveValue::Ref(None));
        block.attrs.insert(
            "modifiers".to_string(),
            LiveValue::Sequence(LiveSeq::new(Sk::Modifiers)),
        );
        self.insert(block)
    }

    pub fn new_mesh(&mut self, name: &str) -> DatablockId {
        let mut block = Datablock::new(EntityKind::Mesh, name);
        block
            .attrs
            .insert("positions".to_string(), LiveValue::Buffer(BulkBuffer::new(3)));
        block
            .attrs
            .insert("indices".to_string(), LiveValue::Buffer(BulkBuffer::new(1)));
        block.attrs.insert(
            "vertex_groups".to_string(),
            LiveValue::Sequence(LiveSeq::new(Sk::VertexGroups)),
        );
        block.attrs.insert("shape_keys".to_string(), LiveValue::Ref(None));
        block
            .attrs
            .insert("auto_smooth".to_string(), LiveValue::Bool(false));
        self.insert(block)
    }

    pub fn new_curve(&mut self, name: &str) -> DatablockId {
        let mut block = Datablock::new(EntityKind::Curve, name);
        block.attrs.insert("resolution".to_string(), LiveValue::Int(12));
        block.attrs.insert(
            "spline_points".to_string(),
            LiveValue::Sequence(LiveSeq::new(Sk::SplinePoints)),
        );
        block.attrs.insert("shape_keys".to_string(), LiveValue::Ref(None));
        self.insert(block)
    }

    /// Create a light. The kind must be known up front: attributes of a
    /// light are only valid for its kind.
    pub fn new_light(&mut self, name: &str, kind: &str) -> DatablockId {
        let mut block = Datablock::new(EntityKind::Light, name);
        block.attrs.insert("energy".to_string(), LiveValue::Float(10.0));
        block
            .attrs
            .insert("color".to_string(), LiveValue::Vector(vec![1.0; 3]));
        block.set_attr("kind", LiveValue::Str(kind.to_string()));
        self.insert(block)
    }

    /// Create a packed image with explicit dimensions.
    pub fn new_image(&mut self, name: &str, width: i64, height: i64) -> DatablockId {
        let mut block = Datablock::new(EntityKind::Image, name);
        block.attrs.insert("width".to_string(), LiveValue::Int(width));
        block.attrs.insert("height".to_string(), LiveValue::Int(height));
        block.attrs.insert("packed".to_string(), LiveValue::Bool(true));
        block
            .attrs
            .insert("source_path".to_string(), LiveValue::Str(String::new()));
        self.insert(block)
    }

    /// Load an image from a source path.
    pub fn load_image(&mut self, name: &str, path: &str) -> DatablockId {
        let mut block = Datablock::new(EntityKind::Image, name);
        block.attrs.insert("width".to_string(), LiveValue::Int(0));
        block.attrs.insert("height".to_string(), LiveValue::Int(0));
        block.attrs.insert("packed".to_string(), LiveValue::Bool(false));
        block
            .attrs
            .insert("source_path".to_string(), LiveValue::Str(path.to_string()));
        self.insert(block)
    }

    pub fn new_material(&mut self, name: &str) -> DatablockId {
        let mut block = Datablock::new(EntityKind::Material, name);
        block
            .attrs
            .insert("base_color".to_string(), LiveValue::Vector(vec![0.8, 0.8, 0.8]));
        block.attrs.insert("roughness".to_string(), LiveValue::Float(0.5));

        let mut graph = Datablock::new_embedded(EntityKind::ShaderGraph, format!("{} Graph", name));
        graph.attrs.insert(
            "nodes".to_string(),
            LiveValue::Sequence(LiveSeq::new(Sk::Nodes)),
        );
        block
            .attrs
            .insert("shader_graph".to_string(), LiveValue::Embedded(Box::new(graph)));
        self.insert(block)
    }

    /// Create a shape key datablock for the geometry used by `object`.
    /// Shape keys can only be built through an object using the keyed
    /// data; there is no direct constructor in the shape_keys bucket.
    pub fn add_shape_key(&mut self, object: DatablockId) -> Option<DatablockId> {
        let data_id = self.get(object)?.data_ref()?;
        let data = self.get(data_id)?;
        if !matches!(data.kind, EntityKind::Mesh | EntityKind::Curve) {
            return None;
        }
        if let Some(LiveValue::Ref(Some(existing))) = data.attr("shape_keys") {
            return Some(*existing);
        }
        let key_name = format!("{} Keys", data.name);

        let mut block = Datablock::new(EntityKind::ShapeKey, key_name);
        block
            .attrs
            .insert("owner".to_string(), LiveValue::Ref(Some(data_id)));
        block.attrs.insert(
            "key_blocks".to_string(),
            LiveValue::Sequence(LiveSeq::new(Sk::KeyBlocks)),
        );
        block.attrs.insert("eval_time".to_string(), LiveValue::Float(0.0));
        let key_id = self.insert(block);

        if let Some(data) = self.get_mut(data_id) {
            data.attrs
                .insert("shape_keys".to_string(), LiveValue::Ref(Some(key_id)));
        }
        Some(key_id)
    }

    /// Duplicate a datablock the way an interactive user would: the copy
    /// gets a uniquified name but keeps the same id until the next diff
    /// cycle notices and resets it.
    pub fn duplicate(&mut self, id: DatablockId) -> Option<String> {
        let block = self.get(id)?.clone();
        let bucket = block.kind.bucket()?;
        let mut copy = block;
        copy.name = self.unique_name(bucket, &copy.name);
        let name = copy.name.clone();
        self.buckets.get_mut(bucket)?.push(copy);
        Some(name)
    }

    /// Rename a datablock, uniquifying on collision. Returns the name
    /// actually applied.
    pub fn rename(&mut self, id: DatablockId, new_name: &str) -> Option<String> {
        let bucket = self.get(id)?.kind.bucket()?.to_string();
        let current = self.get(id)?.name.clone();
        if current == new_name {
            return Some(current);
        }
        let actual = self.unique_name(&bucket, new_name);
        self.get_mut(id)?.name = actual.clone();
        Some(actual)
    }

    /// Remove a datablock and everything its removal implies: removing
    /// geometry removes the objects using it; removing an object removes
    /// its data when no other object still uses it; removing keyed data
    /// removes its shape keys. Returns every id actually removed.
    pub fn remove(&mut self, id: DatablockId) -> Vec<DatablockId> {
        let mut removed = Vec::new();
        let Some(block) = self.get(id) else {
            return removed;
        };
        match block.kind {
            EntityKind::Object => {
                let data = block.data_ref();
                self.detach(id, &mut removed);
                if let Some(data_id) = data {
                    let still_used = self
                        .buckets
                        .get("objects")
                        .map(|objects| objects.iter().any(|o| o.data_ref() == Some(data_id)))
                        .unwrap_or(false);
                    if !still_used {
                        let cascade = self.remove(data_id);
                        removed.extend(cascade);
                    }
                }
            }
            EntityKind::Mesh | EntityKind::Curve => {
                let users: Vec<DatablockId> = self
                    .buckets
                    .get("objects")
                    .map(|objects| {
                        objects
                            .iter()
                            .filter(|o| o.data_ref() == Some(id))
                            .map(|o| o.id)
                            .collect()
                    })
                    .unwrap_or_default();
                let shape_key = match self.get(id).and_then(|b| b.attr("shape_keys")) {
                    Some(LiveValue::Ref(target)) => *target,
                    _ => None,
                };
                for user in users {
                    self.detach(user, &mut removed);
                }
                self.detach(id, &mut removed);
                if let Some(key_id) = shape_key {
                    self.detach(key_id, &mut removed);
                }
            }
            _ => self.detach(id, &mut removed),
        }
        removed
    }

    fn detach(&mut self, id: DatablockId, removed: &mut Vec<DatablockId>) {
        for bucket in self.buckets.values_mut() {
            if let Some(index) = bucket.iter().position(|block| block.id == id) {
                bucket.remove(index);
                removed.push(id);
                return;
            }
        }
    }

    /// Rewrite a datablock's id and every reference to it. Used when an
    /// inbound creation adopts a locally constructed entity under the
    /// sender's id.
    pub fn rebind_id(&mut self, old: DatablockId, new: DatablockId) {
        for bucket in self.buckets.values_mut() {
            for block in bucket.iter_mut() {
                if block.id == old {
                    block.id = new;
                }
                for value in block.attrs.values_mut() {
                    rebind_value(value, old, new);
                }
            }
        }
    }

    /// Mutable access to a bucket, for the collection diff's duplicate
    /// id reset.
    pub fn bucket_mut(&mut self, name: &str) -> Option<&mut Vec<Datablock>> {
        self.buckets.get_mut(name)
    }
}

fn rebind_value(value: &mut LiveValue, old: DatablockId, new: DatablockId) {
    match value {
        LiveValue::Ref(Some(target)) if *target == old => *value = LiveValue::Ref(Some(new)),
        LiveValue::Struct(fields) => {
            for field in fields.values_mut() {
                rebind_value(field, old, new);
            }
        }
        LiveValue::Sequence(seq) => {
            for item in seq.items.iter_mut() {
                rebind_value(item, old, new);
            }
        }
        LiveValue::Embedded(block) => {
            for field in block.attrs.values_mut() {
                rebind_value(field, old, new);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_uniquifies_names() {
        let mut store = Store::new();
        store.new_mesh("Cube");
        store.new_mesh("Cube");
        let bucket = store.bucket("meshes").unwrap();
        assert_eq!(bucket[0].name, "Cube");
        assert_eq!(bucket[1].name, "Cube.001");
    }

    #[test]
    fn test_remove_object_cascades_to_unused_data() {
        let mut store = Store::new();
        let mesh = store.new_mesh("Cube");
        let object = store.new_object("Cube", Some(mesh));

        let removed = store.remove(object);
        assert!(removed.contains(&object));
        assert!(removed.contains(&mesh));
        assert!(store.get(mesh).is_none());
    }

    #[test]
    fn test_remove_object_keeps_shared_data() {
        let mut store = Store::new();
        let mesh = store.new_mesh("Cube");
        let a = store.new_object("A", Some(mesh));
        store.new_object("B", Some(mesh));

        let removed = store.remove(a);
        assert_eq!(removed, vec![a]);
        assert!(store.get(mesh).is_some());
    }

    #[test]
    fn test_remove_mesh_cascades_to_users() {
        let mut store = Store::new();
        let mesh = store.new_mesh("Cube");
        let object = store.new_object("Cube", Some(mesh));

        let removed = store.remove(mesh);
        assert!(removed.contains(&mesh));
        assert!(removed.contains(&object));
    }

    #[test]
    fn test_shape_key_requires_keyed_data() {
        let mut store = Store::new();
        let empty = store.new_object("Empty", None);
        assert!(store.add_shape_key(empty).is_none());

        let mesh = store.new_mesh("Cube");
        let object = store.new_object("Cube", Some(mesh));
        let key = store.add_shape_key(object).unwrap();
        assert_eq!(
            store.get(mesh).unwrap().attr("shape_keys"),
            Some(&LiveValue::Ref(Some(key)))
        );
        // a second call reuses the existing key
        assert_eq!(store.add_shape_key(object), Some(key));
    }

    #[test]
    fn test_duplicate_keeps_id() {
        let mut store = Store::new();
        let mesh = store.new_mesh("Cube");
        let copy_name = store.duplicate(mesh).unwrap();
        assert_eq!(copy_name, "Cube.001");
        let bucket = store.bucket("meshes").unwrap();
        assert_eq!(bucket[0].id, bucket[1].id);
    }

    #[test]
    fn test_rebind_id_rewrites_refs() {
        let mut store = Store::new();
        let mesh = store.new_mesh("Cube");
        let object = store.new_object("Cube", Some(mesh));
        let new_id = DatablockId::new();
        store.rebind_id(mesh, new_id);
        assert!(store.get(mesh).is_none());
        assert_eq!(store.get(object).unwrap().data_ref(), Some(new_id));
    }
}
