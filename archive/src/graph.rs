//! Graph linearization.
//!
//! Computes the closure of images and layers needed to rebuild a set of
//! requested images, ordered so that every node follows its parent.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use a3s_image_core::error::{ImageError, Result};
use a3s_image_core::{ImageId, ImageLinks, LayerRecord};

use crate::store::ImageStore;

/// An image in the closure, with its metadata document kept verbatim.
#[derive(Debug, Clone)]
pub struct ImageNode {
    pub id: ImageId,
    pub metadata: Vec<u8>,
    pub links: ImageLinks,
}

/// A requested name and the image it resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedReference {
    pub name: String,
    pub id: ImageId,
}

/// Deduplicated, topologically ordered node list.
///
/// All layers come before all images; within each list a parent always
/// precedes its children.
#[derive(Debug, Clone, Default)]
pub struct Closure {
    pub layers: Vec<LayerRecord>,
    pub images: Vec<ImageNode>,
    pub roots: Vec<ResolvedReference>,
}

impl Closure {
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty() && self.images.is_empty()
    }
}

/// Resolve `references` and collect everything they depend on.
///
/// Every reference is resolved before the walk starts, so an unknown name
/// fails with `ReferenceNotFound` without touching any node.
pub fn linearize(store: &dyn ImageStore, references: &[String]) -> Result<Closure> {
    let mut roots = Vec::with_capacity(references.len());
    for name in references {
        let id = store
            .resolve_reference(name)?
            .ok_or_else(|| ImageError::reference_not_found(name.as_str()))?;
        roots.push(ResolvedReference {
            name: name.clone(),
            id,
        });
    }

    let mut walker = Walker::new(store);
    for root in &roots {
        walker.visit_image(&root.id)?;
    }
    let layer_roots: Vec<ImageId> = walker
        .image_order
        .iter()
        .filter_map(|id| walker.images.get(id).and_then(|n| n.links.layer.clone()))
        .collect();
    for layer in &layer_roots {
        walker.visit_layer(layer)?;
    }

    let Walker {
        mut images,
        image_order,
        mut layers,
        layer_order,
        ..
    } = walker;

    let closure = Closure {
        layers: layer_order
            .iter()
            .filter_map(|id| layers.remove(id))
            .collect(),
        images: image_order
            .iter()
            .filter_map(|id| images.remove(id))
            .collect(),
        roots,
    };
    debug!(
        references = references.len(),
        layers = closure.layers.len(),
        images = closure.images.len(),
        "Linearized image graph"
    );
    Ok(closure)
}

/// Arena of visited nodes keyed by identifier, plus their emission order.
struct Walker<'s> {
    store: &'s dyn ImageStore,
    images: HashMap<ImageId, ImageNode>,
    image_order: Vec<ImageId>,
    layers: HashMap<ImageId, LayerRecord>,
    layer_order: Vec<ImageId>,
}

impl<'s> Walker<'s> {
    fn new(store: &'s dyn ImageStore) -> Self {
        Self {
            store,
            images: HashMap::new(),
            image_order: Vec::new(),
            layers: HashMap::new(),
            layer_order: Vec::new(),
        }
    }

    /// Walk up the parent chain of `start` until a visited image or a root,
    /// then append the new part of the chain oldest first.
    fn visit_image(&mut self, start: &ImageId) -> Result<()> {
        let mut chain: Vec<ImageNode> = Vec::new();
        let mut on_chain: HashSet<ImageId> = HashSet::new();
        let mut cursor = Some(start.clone());

        while let Some(id) = cursor {
            if self.images.contains_key(&id) {
                break;
            }
            if !on_chain.insert(id.clone()) {
                return Err(ImageError::StoreFailure(format!(
                    "Image {} is its own ancestor",
                    id.short()
                )));
            }
            let metadata = self.store.image_metadata(&id)?.ok_or_else(|| {
                ImageError::StoreFailure(format!("Image {id} is missing from the store"))
            })?;
            let links = ImageLinks::from_document(&metadata).map_err(|e| {
                ImageError::StoreFailure(format!("Invalid metadata for image {id}: {e}"))
            })?;
            cursor = links.parent.clone();
            chain.push(ImageNode {
                id,
                metadata,
                links,
            });
        }

        for node in chain.into_iter().rev() {
            self.image_order.push(node.id.clone());
            self.images.insert(node.id.clone(), node);
        }
        Ok(())
    }

    fn visit_layer(&mut self, start: &ImageId) -> Result<()> {
        let mut chain: Vec<LayerRecord> = Vec::new();
        let mut on_chain: HashSet<ImageId> = HashSet::new();
        let mut cursor = Some(start.clone());

        while let Some(id) = cursor {
            if self.layers.contains_key(&id) {
                break;
            }
            if !on_chain.insert(id.clone()) {
                return Err(ImageError::StoreFailure(format!(
                    "Layer {} is its own ancestor",
                    id.short()
                )));
            }
            let parent = self.store.layer_parent(&id)?.ok_or_else(|| {
                ImageError::StoreFailure(format!("Layer {id} is missing from the store"))
            })?;
            cursor = parent.clone();
            chain.push(LayerRecord { id, parent });
        }

        for record in chain.into_iter().rev() {
            self.layer_order.push(record.id.clone());
            self.layers.insert(record.id.clone(), record);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn doc(layer: Option<&ImageId>, parent: Option<&ImageId>, comment: &str) -> Vec<u8> {
        let mut doc = serde_json::json!({ "comment": comment });
        if let Some(layer) = layer {
            doc["layer"] = serde_json::json!(layer);
        }
        if let Some(parent) = parent {
            doc["parent"] = serde_json::json!(parent);
        }
        serde_json::to_vec(&doc).unwrap()
    }

    fn position<T, F: Fn(&T) -> bool>(items: &[T], f: F) -> usize {
        items.iter().position(f).unwrap()
    }

    /// base <- mid <- (app-a, app-b) with layers following the same shape.
    fn diamond() -> (MemoryStore, ImageId, ImageId) {
        let store = MemoryStore::new();
        let l_base = store.add_layer(None, b"base").unwrap();
        let l_mid = store.add_layer(Some(&l_base), b"mid").unwrap();
        let l_a = store.add_layer(Some(&l_mid), b"a").unwrap();
        let l_b = store.add_layer(Some(&l_mid), b"b").unwrap();

        let base = store.add_image(&doc(Some(&l_base), None, "base")).unwrap();
        let mid = store
            .add_image(&doc(Some(&l_mid), Some(&base), "mid"))
            .unwrap();
        let a = store.add_image(&doc(Some(&l_a), Some(&mid), "a")).unwrap();
        let b = store.add_image(&doc(Some(&l_b), Some(&mid), "b")).unwrap();
        store.set_tag("app", "a", &a).unwrap();
        store.set_tag("app", "b", &b).unwrap();
        (store, a, b)
    }

    #[test]
    fn test_shared_ancestors_appear_once() {
        let (store, _, _) = diamond();
        let closure =
            linearize(&store, &["app:a".to_string(), "app:b".to_string()]).unwrap();
        assert_eq!(closure.layers.len(), 4);
        assert_eq!(closure.images.len(), 4);

        let unique: HashSet<_> = closure.layers.iter().map(|l| l.id.clone()).collect();
        assert_eq!(unique.len(), closure.layers.len());
    }

    #[test]
    fn test_parents_precede_children() {
        let (store, _, _) = diamond();
        let closure =
            linearize(&store, &["app:b".to_string(), "app:a".to_string()]).unwrap();

        for (i, layer) in closure.layers.iter().enumerate() {
            if let Some(parent) = &layer.parent {
                assert!(position(&closure.layers, |l| &l.id == parent) < i);
            }
        }
        for (i, image) in closure.images.iter().enumerate() {
            if let Some(parent) = &image.links.parent {
                assert!(position(&closure.images, |n| &n.id == parent) < i);
            }
        }
    }

    #[test]
    fn test_single_reference_closure() {
        let (store, a, _) = diamond();
        let closure = linearize(&store, &[a.to_string()]).unwrap();
        assert_eq!(closure.images.len(), 3);
        assert_eq!(closure.layers.len(), 3);
        assert_eq!(closure.images.last().unwrap().id, a);
        assert_eq!(closure.roots[0].id, a);
    }

    #[test]
    fn test_image_without_layer() {
        let store = MemoryStore::new();
        let id = store.add_image(br#"{"comment":"scratch"}"#).unwrap();
        let closure = linearize(&store, &[id.to_string()]).unwrap();
        assert!(closure.layers.is_empty());
        assert_eq!(closure.images.len(), 1);
        assert_eq!(closure.images[0].metadata, br#"{"comment":"scratch"}"#);
    }

    #[test]
    fn test_unknown_reference() {
        let (store, _, _) = diamond();
        let err = linearize(&store, &["app:a".to_string(), "ghost".to_string()]).unwrap_err();
        match err {
            ImageError::ReferenceNotFound { reference } => assert_eq!(reference, "ghost"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_layer_is_store_failure() {
        let store = MemoryStore::new();
        let ghost = ImageId::digest_of(b"ghost");
        let id = store.add_image(&doc(Some(&ghost), None, "broken")).unwrap();
        let err = linearize(&store, &[id.to_string()]).unwrap_err();
        assert!(matches!(err, ImageError::StoreFailure(_)));
    }

    /// Store whose images point at each other.
    struct CyclicStore {
        images: HashMap<ImageId, Vec<u8>>,
    }

    impl ImageStore for CyclicStore {
        fn image_metadata(&self, id: &ImageId) -> Result<Option<Vec<u8>>> {
            Ok(self.images.get(id).cloned())
        }
        fn layer_parent(&self, _: &ImageId) -> Result<Option<Option<ImageId>>> {
            Ok(None)
        }
        fn open_layer(&self, id: &ImageId) -> Result<crate::store::LayerPayload> {
            Err(ImageError::StoreFailure(format!("no layer {id}")))
        }
        fn has_image(&self, id: &ImageId) -> Result<bool> {
            Ok(self.images.contains_key(id))
        }
        fn has_layer(&self, _: &ImageId) -> Result<bool> {
            Ok(false)
        }
        fn register_image(&self, _: &ImageId, _: &[u8]) -> Result<()> {
            Ok(())
        }
        fn register_layer(
            &self,
            _: &ImageId,
            _: Option<&ImageId>,
            _: &mut dyn std::io::Read,
        ) -> Result<()> {
            Ok(())
        }
        fn set_tag(&self, _: &str, _: &str, _: &ImageId) -> Result<Option<ImageId>> {
            Ok(None)
        }
        fn remove_tag(&self, _: &str, _: &str) -> Result<Option<ImageId>> {
            Ok(None)
        }
        fn list_tags(&self, _: Option<&str>) -> Result<Vec<a3s_image_core::TagEntry>> {
            Ok(Vec::new())
        }
        fn list_images(&self) -> Result<Vec<ImageId>> {
            Ok(self.images.keys().cloned().collect())
        }
        fn remove_image(&self, _: &ImageId) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_cycle_is_store_failure() {
        let a = ImageId::digest_of(b"a");
        let b = ImageId::digest_of(b"b");
        let mut images = HashMap::new();
        images.insert(a.clone(), doc(None, Some(&b), "a"));
        images.insert(b.clone(), doc(None, Some(&a), "b"));
        let store = CyclicStore { images };

        let err = linearize(&store, &[a.to_string()]).unwrap_err();
        assert!(err.to_string().contains("own ancestor"), "{err}");
    }
}
