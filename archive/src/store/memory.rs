//! In-memory image store.

use std::collections::HashMap;
use std::io::{Cursor, Read};

use parking_lot::RwLock;

use a3s_image_core::error::{ImageError, Result};
use a3s_image_core::{ImageId, TagEntry};

use super::{reachable_layers, stored_links, ImageStore, LayerPayload};
use crate::tags::TagIndex;

#[derive(Debug, Clone)]
struct MemoryLayer {
    parent: Option<ImageId>,
    payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct Inner {
    images: HashMap<ImageId, Vec<u8>>,
    layers: HashMap<ImageId, MemoryLayer>,
    tags: TagIndex,
}

/// Image store held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a layer whose identifier is the digest of `payload`.
    pub fn add_layer(&self, parent: Option<&ImageId>, payload: &[u8]) -> Result<ImageId> {
        let id = ImageId::digest_of(payload);
        self.register_layer(&id, parent, &mut Cursor::new(payload))?;
        Ok(id)
    }

    /// Add an image whose identifier is the digest of `metadata`.
    pub fn add_image(&self, metadata: &[u8]) -> Result<ImageId> {
        let id = ImageId::digest_of(metadata);
        self.register_image(&id, metadata)?;
        Ok(id)
    }

    pub fn layer_count(&self) -> usize {
        self.inner.read().layers.len()
    }

    pub fn image_count(&self) -> usize {
        self.inner.read().images.len()
    }

    /// Copy of a layer's payload.
    pub fn layer_payload(&self, id: &ImageId) -> Option<Vec<u8>> {
        self.inner.read().layers.get(id).map(|l| l.payload.clone())
    }
}

impl ImageStore for MemoryStore {
    fn image_metadata(&self, id: &ImageId) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.read().images.get(id).cloned())
    }

    fn layer_parent(&self, id: &ImageId) -> Result<Option<Option<ImageId>>> {
        Ok(self.inner.read().layers.get(id).map(|l| l.parent.clone()))
    }

    fn open_layer(&self, id: &ImageId) -> Result<LayerPayload> {
        let inner = self.inner.read();
        let layer = inner
            .layers
            .get(id)
            .ok_or_else(|| ImageError::StoreFailure(format!("Layer not found: {id}")))?;
        Ok(LayerPayload {
            size: layer.payload.len() as u64,
            reader: Box::new(Cursor::new(layer.payload.clone())),
        })
    }

    fn has_image(&self, id: &ImageId) -> Result<bool> {
        Ok(self.inner.read().images.contains_key(id))
    }

    fn has_layer(&self, id: &ImageId) -> Result<bool> {
        Ok(self.inner.read().layers.contains_key(id))
    }

    fn register_image(&self, id: &ImageId, metadata: &[u8]) -> Result<()> {
        let mut inner = self.inner.write();
        inner
            .images
            .entry(id.clone())
            .or_insert_with(|| metadata.to_vec());
        Ok(())
    }

    fn register_layer(
        &self,
        id: &ImageId,
        parent: Option<&ImageId>,
        payload: &mut dyn Read,
    ) -> Result<()> {
        let mut buf = Vec::new();
        payload.read_to_end(&mut buf)?;

        let mut inner = self.inner.write();
        if let Some(parent) = parent {
            if !inner.layers.contains_key(parent) {
                return Err(ImageError::StoreFailure(format!(
                    "Parent layer {parent} of {id} is not registered"
                )));
            }
        }
        inner.layers.entry(id.clone()).or_insert(MemoryLayer {
            parent: parent.cloned(),
            payload: buf,
        });
        Ok(())
    }

    fn set_tag(&self, repository: &str, tag: &str, id: &ImageId) -> Result<Option<ImageId>> {
        let mut inner = self.inner.write();
        if !inner.images.contains_key(id) {
            return Err(ImageError::StoreFailure(format!(
                "Cannot tag {repository}:{tag}: image {id} is not registered"
            )));
        }
        Ok(inner.tags.insert(repository, tag, id.clone()))
    }

    fn remove_tag(&self, repository: &str, tag: &str) -> Result<Option<ImageId>> {
        Ok(self.inner.write().tags.remove(repository, tag))
    }

    fn list_tags(&self, repository: Option<&str>) -> Result<Vec<TagEntry>> {
        Ok(self.inner.read().tags.entries(repository))
    }

    fn list_images(&self) -> Result<Vec<ImageId>> {
        let mut images: Vec<ImageId> = self.inner.read().images.keys().cloned().collect();
        images.sort();
        Ok(images)
    }

    fn remove_image(&self, id: &ImageId) -> Result<()> {
        let mut inner = self.inner.write();
        let Inner {
            images,
            layers,
            tags,
        } = &mut *inner;
        if !images.contains_key(id) {
            return Err(ImageError::StoreFailure(format!("Image not found: {id}")));
        }
        for (other, document) in images.iter() {
            if other != id && stored_links(other, document)?.parent.as_ref() == Some(id) {
                return Err(ImageError::StoreFailure(format!(
                    "Image {} has dependent child images",
                    id.short()
                )));
            }
        }

        let keep = reachable_layers(images.iter().filter(|(other, _)| *other != id), |layer| {
            Ok(layers.get(layer).and_then(|l| l.parent.clone()))
        })?;
        images.remove(id);
        tags.remove_image(id);
        layers.retain(|layer, _| keep.contains(layer));
        Ok(())
    }
}
