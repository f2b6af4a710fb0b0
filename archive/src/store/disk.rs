//! Directory-backed image store.
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/
//! ├── layers/<id>/json        (layer record)
//! ├── layers/<id>/layer.tar   (payload, verbatim)
//! ├── images/<id>.json        (metadata document, verbatim)
//! ├── repositories.json       (tag index)
//! └── tmp/                    (staging for atomic renames)
//! ```
//!
//! Every write lands in `tmp/` first and is renamed into place, so a node
//! either exists completely or not at all.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tempfile::NamedTempFile;

use a3s_image_core::error::{ImageError, Result};
use a3s_image_core::{ImageId, LayerRecord, TagEntry};

use super::{reachable_layers, stored_links, ImageStore, LayerPayload};
use crate::tags::TagIndex;

const LAYERS_DIR: &str = "layers";
const IMAGES_DIR: &str = "images";
const TMP_DIR: &str = "tmp";
const TAGS_FILE: &str = "repositories.json";
const LAYER_RECORD_FILE: &str = "json";
const LAYER_PAYLOAD_FILE: &str = "layer.tar";

/// Image store persisted in a directory tree.
#[derive(Debug)]
pub struct DiskStore {
    /// Root directory for image storage
    root: PathBuf,
    /// In-memory copy of `repositories.json`
    tags: RwLock<TagIndex>,
}

impl DiskStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: &Path) -> Result<Self> {
        for dir in [LAYERS_DIR, IMAGES_DIR, TMP_DIR] {
            let path = root.join(dir);
            std::fs::create_dir_all(&path).map_err(|e| {
                ImageError::StoreFailure(format!(
                    "Failed to create image store directory {}: {}",
                    path.display(),
                    e
                ))
            })?;
        }

        let tags = load_tags(&root.join(TAGS_FILE))?;
        tracing::debug!(root = %root.display(), tags = tags.len(), "Opened image store");

        Ok(Self {
            root: root.to_path_buf(),
            tags: RwLock::new(tags),
        })
    }

    /// Get the store root path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn layer_dir(&self, id: &ImageId) -> PathBuf {
        self.root.join(LAYERS_DIR).join(id.as_str())
    }

    fn image_path(&self, id: &ImageId) -> PathBuf {
        self.root.join(IMAGES_DIR).join(format!("{id}.json"))
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join(TMP_DIR)
    }

    /// Apply `change` to a copy of the tag index, persist it, then publish it.
    ///
    /// The in-memory index only moves once `repositories.json` is written.
    fn update_tags<T>(&self, change: impl FnOnce(&mut TagIndex) -> T) -> Result<T> {
        let mut tags = self.tags.write();
        let mut updated = tags.clone();
        let outcome = change(&mut updated);
        if updated != *tags {
            let data = serde_json::to_vec_pretty(&updated)?;
            self.write_atomic(&self.root.join(TAGS_FILE), &data)?;
            *tags = updated;
        }
        Ok(outcome)
    }

    fn write_atomic(&self, target: &Path, data: &[u8]) -> Result<()> {
        let mut tmp = NamedTempFile::new_in(self.tmp_dir()).map_err(store_io("create temp file"))?;
        tmp.write_all(data).map_err(store_io("write temp file"))?;
        tmp.as_file().sync_all().map_err(store_io("sync temp file"))?;
        tmp.persist(target).map_err(|e| {
            ImageError::StoreFailure(format!("Failed to write {}: {}", target.display(), e.error))
        })?;
        Ok(())
    }

    fn read_layer_record(&self, id: &ImageId) -> Result<Option<LayerRecord>> {
        let path = self.layer_dir(id).join(LAYER_RECORD_FILE);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ImageError::StoreFailure(format!(
                    "Failed to read layer record {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        let record: LayerRecord = serde_json::from_slice(&data).map_err(|e| {
            ImageError::StoreFailure(format!("Invalid layer record {}: {}", path.display(), e))
        })?;
        Ok(Some(record))
    }
}

impl ImageStore for DiskStore {
    fn image_metadata(&self, id: &ImageId) -> Result<Option<Vec<u8>>> {
        match std::fs::read(self.image_path(id)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ImageError::StoreFailure(format!(
                "Failed to read image {id}: {e}"
            ))),
        }
    }

    fn layer_parent(&self, id: &ImageId) -> Result<Option<Option<ImageId>>> {
        Ok(self.read_layer_record(id)?.map(|record| record.parent))
    }

    fn open_layer(&self, id: &ImageId) -> Result<LayerPayload> {
        let path = self.layer_dir(id).join(LAYER_PAYLOAD_FILE);
        let file = File::open(&path).map_err(|e| {
            ImageError::StoreFailure(format!(
                "Failed to open layer {}: {}",
                path.display(),
                e
            ))
        })?;
        let size = file
            .metadata()
            .map_err(store_io("stat layer payload"))?
            .len();
        Ok(LayerPayload {
            size,
            reader: Box::new(file),
        })
    }

    fn has_image(&self, id: &ImageId) -> Result<bool> {
        Ok(self.image_path(id).is_file())
    }

    fn has_layer(&self, id: &ImageId) -> Result<bool> {
        Ok(self.layer_dir(id).join(LAYER_RECORD_FILE).is_file())
    }

    fn register_image(&self, id: &ImageId, metadata: &[u8]) -> Result<()> {
        if self.has_image(id)? {
            return Ok(());
        }
        self.write_atomic(&self.image_path(id), metadata)?;
        tracing::debug!(image = %id.short(), "Registered image");
        Ok(())
    }

    fn register_layer(
        &self,
        id: &ImageId,
        parent: Option<&ImageId>,
        payload: &mut dyn Read,
    ) -> Result<()> {
        if self.has_layer(id)? {
            return Ok(());
        }
        if let Some(parent) = parent {
            if !self.has_layer(parent)? {
                return Err(ImageError::StoreFailure(format!(
                    "Parent layer {parent} of {id} is not registered"
                )));
            }
        }

        // Stage the whole layer directory, then rename it into place.
        let staging = tempfile::Builder::new()
            .prefix(".layer-")
            .tempdir_in(self.tmp_dir())
            .map_err(store_io("create staging directory"))?;

        let mut out = File::create(staging.path().join(LAYER_PAYLOAD_FILE))
            .map_err(store_io("create layer payload"))?;
        let size = io::copy(payload, &mut out)?;
        out.sync_all().map_err(store_io("sync layer payload"))?;

        let record = LayerRecord {
            id: id.clone(),
            parent: parent.cloned(),
        };
        std::fs::write(
            staging.path().join(LAYER_RECORD_FILE),
            serde_json::to_vec(&record)?,
        )
        .map_err(store_io("write layer record"))?;

        let target = self.layer_dir(id);
        if let Err(e) = std::fs::rename(staging.path(), &target) {
            // Lost a race with another registration of the same layer.
            if self.has_layer(id)? {
                return Ok(());
            }
            return Err(ImageError::StoreFailure(format!(
                "Failed to move layer into {}: {}",
                target.display(),
                e
            )));
        }

        tracing::debug!(layer = %id.short(), size, "Registered layer");
        Ok(())
    }

    fn set_tag(&self, repository: &str, tag: &str, id: &ImageId) -> Result<Option<ImageId>> {
        if !self.has_image(id)? {
            return Err(ImageError::StoreFailure(format!(
                "Cannot tag {repository}:{tag}: image {id} is not registered"
            )));
        }
        self.update_tags(|tags| tags.insert(repository, tag, id.clone()))
    }

    fn remove_tag(&self, repository: &str, tag: &str) -> Result<Option<ImageId>> {
        self.update_tags(|tags| tags.remove(repository, tag))
    }

    fn list_tags(&self, repository: Option<&str>) -> Result<Vec<TagEntry>> {
        Ok(self.tags.read().entries(repository))
    }

    fn list_images(&self) -> Result<Vec<ImageId>> {
        let dir = self.root.join(IMAGES_DIR);
        let entries = std::fs::read_dir(&dir).map_err(|e| {
            ImageError::StoreFailure(format!("Failed to list {}: {}", dir.display(), e))
        })?;

        let mut images = Vec::new();
        for entry in entries {
            let entry = entry.map_err(store_io("list images"))?;
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if let Ok(id) = ImageId::parse(stem) {
                images.push(id);
            }
        }
        images.sort();
        Ok(images)
    }

    fn remove_image(&self, id: &ImageId) -> Result<()> {
        if !self.has_image(id)? {
            return Err(ImageError::StoreFailure(format!("Image not found: {id}")));
        }

        let mut documents = Vec::new();
        for other in self.list_images()? {
            if &other == id {
                continue;
            }
            if let Some(document) = self.image_metadata(&other)? {
                if stored_links(&other, &document)?.parent.as_ref() == Some(id) {
                    return Err(ImageError::StoreFailure(format!(
                        "Image {} has dependent child images",
                        id.short()
                    )));
                }
                documents.push((other, document));
            }
        }

        // Everything that can fail to read happens before the first deletion.
        let keep = reachable_layers(documents.iter().map(|(id, doc)| (id, doc)), |layer| {
            Ok(self.read_layer_record(layer)?.and_then(|record| record.parent))
        })?;

        self.update_tags(|tags| tags.remove_image(id))?;

        let path = self.image_path(id);
        std::fs::remove_file(&path).map_err(|e| {
            ImageError::StoreFailure(format!(
                "Failed to remove image {}: {}",
                path.display(),
                e
            ))
        })?;

        // Drop layers no remaining image reaches.
        let layers_dir = self.root.join(LAYERS_DIR);
        for entry in std::fs::read_dir(&layers_dir).map_err(store_io("list layers"))? {
            let entry = entry.map_err(store_io("list layers"))?;
            let Some(layer) = entry.file_name().to_str().and_then(|n| ImageId::parse(n).ok())
            else {
                continue;
            };
            if !keep.contains(&layer) {
                std::fs::remove_dir_all(entry.path()).map_err(|e| {
                    ImageError::StoreFailure(format!(
                        "Failed to remove layer directory {}: {}",
                        entry.path().display(),
                        e
                    ))
                })?;
                tracing::debug!(layer = %layer.short(), "Removed unreferenced layer");
            }
        }

        tracing::debug!(image = %id.short(), "Removed image");
        Ok(())
    }
}

fn load_tags(path: &Path) -> Result<TagIndex> {
    if !path.exists() {
        return Ok(TagIndex::new());
    }
    let data = std::fs::read_to_string(path).map_err(|e| {
        ImageError::StoreFailure(format!(
            "Failed to read tag index {}: {}",
            path.display(),
            e
        ))
    })?;
    serde_json::from_str(&data).map_err(|e| {
        ImageError::StoreFailure(format!("Failed to parse tag index {}: {}", path.display(), e))
    })
}

fn store_io(what: &'static str) -> impl Fn(io::Error) -> ImageError {
    move |e| ImageError::StoreFailure(format!("Failed to {what}: {e}"))
}
