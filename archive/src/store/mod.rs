//! Image/layer store capability consumed by the archive engine.
//!
//! The engine only ever talks to a `&dyn ImageStore`. Two implementations
//! ship with the crate: [`MemoryStore`] for tests and embedding, and
//! [`DiskStore`] for the CLI.

mod disk;
mod memory;

pub use disk::DiskStore;
pub use memory::MemoryStore;

use std::collections::HashSet;
use std::io::Read;

use a3s_image_core::error::{ImageError, Result};
use a3s_image_core::{ImageId, ImageLinks, TagEntry};

use crate::reference::{id_prefix, Reference};

/// A readable layer payload with its exact length.
pub struct LayerPayload {
    pub size: u64,
    pub reader: Box<dyn Read + Send>,
}

impl std::fmt::Debug for LayerPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerPayload")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Content-addressed persistence of layers, images and tags.
///
/// Every method is an atomic call from the engine's point of view; the
/// implementation owns its own locking.
pub trait ImageStore: Send + Sync {
    /// Raw metadata document of an image.
    fn image_metadata(&self, id: &ImageId) -> Result<Option<Vec<u8>>>;

    /// Parent of a layer: `None` if the layer is unknown, `Some(None)` for a root layer.
    fn layer_parent(&self, id: &ImageId) -> Result<Option<Option<ImageId>>>;

    /// Open a layer payload for reading.
    fn open_layer(&self, id: &ImageId) -> Result<LayerPayload>;

    fn has_image(&self, id: &ImageId) -> Result<bool>;

    fn has_layer(&self, id: &ImageId) -> Result<bool>;

    /// Persist an image. Registering an existing image is a no-op.
    fn register_image(&self, id: &ImageId, metadata: &[u8]) -> Result<()>;

    /// Persist a layer, consuming `payload`. Registering an existing layer is a no-op.
    fn register_layer(
        &self,
        id: &ImageId,
        parent: Option<&ImageId>,
        payload: &mut dyn Read,
    ) -> Result<()>;

    /// Bind `repository:tag` to `id`, returning the previous binding.
    fn set_tag(&self, repository: &str, tag: &str, id: &ImageId) -> Result<Option<ImageId>>;

    /// Unbind `repository:tag`; returns the image it pointed at.
    fn remove_tag(&self, repository: &str, tag: &str) -> Result<Option<ImageId>>;

    fn list_tags(&self, repository: Option<&str>) -> Result<Vec<TagEntry>>;

    fn list_images(&self) -> Result<Vec<ImageId>>;

    /// Delete an image and its tags, then any layer no remaining image needs.
    fn remove_image(&self, id: &ImageId) -> Result<()>;

    /// Whether the store holds an image or a layer with this identifier.
    fn has_node(&self, id: &ImageId) -> Result<bool> {
        Ok(self.has_image(id)? || self.has_layer(id)?)
    }

    /// Whether any other stored image names `id` as its parent.
    fn has_child_images(&self, id: &ImageId) -> Result<bool> {
        for other in self.list_images()? {
            if &other == id {
                continue;
            }
            if let Some(document) = self.image_metadata(&other)? {
                if stored_links(&other, &document)?.parent.as_ref() == Some(id) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn lookup_tag(&self, repository: &str, tag: &str) -> Result<Option<ImageId>> {
        Ok(self
            .list_tags(Some(repository))?
            .into_iter()
            .find(|entry| entry.tag == tag)
            .map(|entry| entry.id))
    }

    /// Resolve a user-supplied name to an image.
    ///
    /// Tried in order: full identifier, `name@sha256:` pin, `repository[:tag]`,
    /// then an unambiguous identifier prefix.
    fn resolve_reference(&self, name: &str) -> Result<Option<ImageId>> {
        let name = name.trim();
        if ImageId::is_valid(name) {
            let id = ImageId::parse(name)?;
            if self.has_image(&id)? {
                return Ok(Some(id));
            }
        }

        if let Ok(reference) = Reference::parse(name) {
            if let Some(digest) = reference.digest {
                return Ok(self.has_image(&digest)?.then_some(digest));
            }
            if let Some(id) = self.lookup_tag(&reference.repository, reference.tag_or_default())? {
                return Ok(Some(id));
            }
        }

        if let Some(prefix) = id_prefix(name) {
            let mut matches: Vec<ImageId> = self
                .list_images()?
                .into_iter()
                .filter(|id| id.as_str().starts_with(prefix))
                .collect();
            if matches.len() == 1 {
                return Ok(matches.pop());
            }
        }

        Ok(None)
    }
}

/// Links of a stored image document. A document the store cannot parse is a store failure.
pub(crate) fn stored_links(id: &ImageId, document: &[u8]) -> Result<ImageLinks> {
    ImageLinks::from_document(document).map_err(|e| {
        ImageError::StoreFailure(format!("Invalid metadata for stored image {id}: {e}"))
    })
}

/// Layers reachable from the given image documents through their leaf layer and its ancestors.
///
/// Any document or layer record that cannot be read fails the whole walk, so
/// callers never prune from an incomplete set.
pub(crate) fn reachable_layers<'a, I, F>(
    documents: I,
    mut parent_of: F,
) -> Result<HashSet<ImageId>>
where
    I: IntoIterator<Item = (&'a ImageId, &'a Vec<u8>)>,
    F: FnMut(&ImageId) -> Result<Option<ImageId>>,
{
    let mut reachable = HashSet::new();
    for (id, document) in documents {
        let mut cursor = stored_links(id, document)?.layer;
        while let Some(layer) = cursor {
            if !reachable.insert(layer.clone()) {
                break;
            }
            cursor = parent_of(&layer)?;
        }
    }
    Ok(reachable)
}
