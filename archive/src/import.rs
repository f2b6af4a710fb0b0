//! Import engine: archive stream to registered images.
//!
//! The whole stream is validated before anything reaches the store. New
//! layer payloads are appended to one anonymous spool file while they are
//! hashed, so open descriptors stay constant however many layers the archive
//! carries. Registration then runs layers first, images next, tags last.
//! A stream that fails validation therefore registers nothing.

use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use a3s_image_core::config::{DEFAULT_COPY_BUFFER_SIZE, DEFAULT_MAX_METADATA_SIZE};
use a3s_image_core::error::{ImageError, Result};
use a3s_image_core::{ArchiveConfig, ArchiveManifest, ImageId, ImageLinks, LayerRecord, TagEntry};

use crate::codec::{read_error, ArchiveEntry, ArchiveReader, EntryKind, LayerStream};
use crate::reference::{valid_repository, valid_tag};
use crate::store::ImageStore;
use crate::tags::TagIndex;

/// Import tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportOptions {
    /// Upper bound for any metadata entry
    pub max_metadata_size: u64,
    /// Buffer used while hashing and spooling layer payloads
    pub copy_buffer_size: usize,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            max_metadata_size: DEFAULT_MAX_METADATA_SIZE,
            copy_buffer_size: DEFAULT_COPY_BUFFER_SIZE,
        }
    }
}

impl From<&ArchiveConfig> for ImportOptions {
    fn from(config: &ArchiveConfig) -> Self {
        Self {
            max_metadata_size: config.max_metadata_size,
            copy_buffer_size: config.copy_buffer_size,
        }
    }
}

/// Outcome of a successful import.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    /// Every image carried by the archive, in stream order
    pub images: Vec<ImageId>,
    /// Tags applied to the store
    pub tags: Vec<TagEntry>,
    /// Layers that were not in the store before
    pub layers_registered: usize,
    /// Images that were not in the store before
    pub images_registered: usize,
}

/// Position of the importer in the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportPhase {
    ReadingLayers,
    ReadingImages,
    ReadingManifest,
    ReadingTags,
    Done,
}

impl ImportPhase {
    /// Phase in which an entry of `kind` is processed, or `CorruptArchive`
    /// if such an entry cannot appear here.
    pub fn accept(self, kind: EntryKind) -> Result<Self> {
        use EntryKind::*;
        use ImportPhase::*;

        match (self, kind) {
            (ReadingLayers, Layer) => Ok(ReadingLayers),
            (ReadingLayers | ReadingImages, Image) => Ok(ReadingImages),
            (ReadingLayers | ReadingImages, Manifest) => Ok(ReadingManifest),
            (ReadingManifest, Repositories) => Ok(ReadingTags),
            (phase, kind) => Err(ImageError::CorruptArchive(format!(
                "unexpected {kind} entry while {phase}"
            ))),
        }
    }

    /// Phase after the end of the stream.
    pub fn finish(self) -> Result<Self> {
        match self {
            Self::ReadingManifest | Self::ReadingTags => Ok(Self::Done),
            Self::Done => Ok(Self::Done),
            phase => Err(ImageError::CorruptArchive(format!(
                "archive ended while {phase}, manifest missing"
            ))),
        }
    }
}

impl fmt::Display for ImportPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ReadingLayers => "reading layers",
            Self::ReadingImages => "reading images",
            Self::ReadingManifest => "reading the manifest",
            Self::ReadingTags => "reading tags",
            Self::Done => "done",
        })
    }
}

/// Read an archive from `source` and register its content in `store`.
pub fn import<R: Read>(store: &dyn ImageStore, source: R) -> Result<ImportSummary> {
    import_with(store, source, &ImportOptions::default())
}

/// [`import`] with explicit options.
pub fn import_with<R: Read>(
    store: &dyn ImageStore,
    source: R,
    options: &ImportOptions,
) -> Result<ImportSummary> {
    let mut archive = tar::Archive::new(source);
    let reader = ArchiveReader::new(&mut archive, options.max_metadata_size)?;

    let mut staging = Staging::new(store, options);
    for entry in reader {
        staging.stage(entry?)?;
    }
    staging.finish()?;
    staging.commit()
}

/// Byte range of a payload inside the spool file.
#[derive(Debug, Clone, Copy)]
struct SpoolSpan {
    offset: u64,
    len: u64,
}

/// A validated layer. `span` is `None` when the store already has it.
struct StagedLayer {
    record: LayerRecord,
    span: Option<SpoolSpan>,
}

struct StagedImage {
    id: ImageId,
    metadata: Vec<u8>,
    known: bool,
}

/// Everything read from the stream so far, validated but not yet registered.
struct Staging<'s> {
    store: &'s dyn ImageStore,
    copy_buffer_size: usize,
    phase: ImportPhase,
    /// Payloads of new layers, back to back; created on first use
    spool: Option<File>,
    spool_len: u64,
    layers: Vec<StagedLayer>,
    layer_ids: HashSet<ImageId>,
    images: Vec<StagedImage>,
    image_ids: HashSet<ImageId>,
    manifest: Option<ArchiveManifest>,
    tags: TagIndex,
}

impl<'s> Staging<'s> {
    fn new(store: &'s dyn ImageStore, options: &ImportOptions) -> Self {
        Self {
            store,
            copy_buffer_size: options.copy_buffer_size.max(1),
            phase: ImportPhase::ReadingLayers,
            spool: None,
            spool_len: 0,
            layers: Vec::new(),
            layer_ids: HashSet::new(),
            images: Vec::new(),
            image_ids: HashSet::new(),
            manifest: None,
            tags: TagIndex::new(),
        }
    }

    fn stage<R: Read>(&mut self, entry: ArchiveEntry<'_, R>) -> Result<()> {
        self.phase = self.phase.accept(entry.kind())?;
        match entry {
            ArchiveEntry::Layer { record, payload } => self.stage_layer(record, payload),
            ArchiveEntry::Image { id, metadata } => self.stage_image(id, metadata),
            ArchiveEntry::Manifest(manifest) => {
                self.manifest = Some(manifest);
                Ok(())
            }
            ArchiveEntry::Repositories(tags) => {
                self.tags = tags;
                Ok(())
            }
        }
    }

    fn layer_available(&self, id: &ImageId) -> Result<bool> {
        Ok(self.layer_ids.contains(id) || self.store.has_layer(id)?)
    }

    fn image_available(&self, id: &ImageId) -> Result<bool> {
        Ok(self.image_ids.contains(id) || self.store.has_image(id)?)
    }

    fn stage_layer<R: Read>(
        &mut self,
        record: LayerRecord,
        mut payload: LayerStream<'_, R>,
    ) -> Result<()> {
        let id = record.id.clone();
        if self.layer_ids.contains(&id) {
            return Err(ImageError::CorruptArchive(format!("layer {id} appears twice")));
        }
        if let Some(parent) = &record.parent {
            if !self.layer_available(parent)? {
                return Err(ImageError::MissingDependency {
                    id: id.to_string(),
                    dependency: parent.to_string(),
                });
            }
        }

        let known = self.store.has_layer(&id)?;
        let offset = self.spool_len;
        let mut buf = vec![0u8; self.copy_buffer_size];
        let mut spool = if known {
            None
        } else {
            if self.spool.is_none() {
                self.spool = Some(tempfile::tempfile()?);
            }
            self.spool.as_mut()
        };

        let mut hasher = Sha256::new();
        let mut len = 0u64;
        loop {
            let n = match payload.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(read_error(&format!("failed to read layer {id}"), e)),
            };
            hasher.update(&buf[..n]);
            len += n as u64;
            if let Some(file) = spool.as_mut() {
                file.write_all(&buf[..n])?;
            }
        }
        if spool.is_some() {
            self.spool_len += len;
        }

        let digest = ImageId::from_hasher(hasher);
        if digest != id {
            return Err(ImageError::CorruptArchive(format!(
                "layer {id} payload digest mismatch: got {digest}"
            )));
        }
        let span = (!known).then_some(SpoolSpan { offset, len });

        debug!(layer = %id.short(), known, "Staged layer");
        self.layer_ids.insert(id);
        self.layers.push(StagedLayer { record, span });
        Ok(())
    }

    fn stage_image(&mut self, id: ImageId, metadata: Vec<u8>) -> Result<()> {
        if self.image_ids.contains(&id) {
            return Err(ImageError::CorruptArchive(format!("image {id} appears twice")));
        }
        let digest = ImageId::digest_of(&metadata);
        if digest != id {
            return Err(ImageError::CorruptArchive(format!(
                "image {id} metadata digest mismatch: got {digest}"
            )));
        }
        let links = ImageLinks::from_document(&metadata).map_err(|e| {
            ImageError::CorruptArchive(format!("invalid metadata for image {id}: {e}"))
        })?;
        if let Some(parent) = &links.parent {
            if !self.image_available(parent)? {
                return Err(ImageError::MissingDependency {
                    id: id.to_string(),
                    dependency: parent.to_string(),
                });
            }
        }
        if let Some(layer) = &links.layer {
            if !self.layer_available(layer)? {
                return Err(ImageError::MissingDependency {
                    id: id.to_string(),
                    dependency: layer.to_string(),
                });
            }
        }

        let known = self.store.has_image(&id)?;
        debug!(image = %id.short(), known, "Staged image");
        self.image_ids.insert(id.clone());
        self.images.push(StagedImage {
            id,
            metadata,
            known,
        });
        Ok(())
    }

    /// End-of-stream checks: manifest present and consistent, tags resolvable.
    fn finish(&mut self) -> Result<()> {
        self.phase = self.phase.finish()?;

        let manifest = self
            .manifest
            .as_ref()
            .ok_or_else(|| ImageError::CorruptArchive("archive has no manifest".to_string()))?;
        let listed_layers: HashSet<ImageId> = manifest.layers.iter().cloned().collect();
        if listed_layers != self.layer_ids {
            return Err(ImageError::CorruptArchive(format!(
                "manifest does not match the layers in the archive ({} listed, {} carried)",
                listed_layers.len(),
                self.layer_ids.len()
            )));
        }
        let listed_images: HashSet<ImageId> = manifest.images.iter().cloned().collect();
        if listed_images != self.image_ids {
            return Err(ImageError::CorruptArchive(format!(
                "manifest does not match the images in the archive ({} listed, {} carried)",
                listed_images.len(),
                self.image_ids.len()
            )));
        }

        for entry in self.tags.entries(None) {
            if !valid_repository(&entry.repository) || !valid_tag(&entry.tag) {
                return Err(ImageError::CorruptArchive(format!(
                    "invalid tag name {:?} in repositories",
                    entry.name()
                )));
            }
            if !self.image_available(&entry.id)? {
                return Err(ImageError::MissingDependency {
                    id: entry.name(),
                    dependency: entry.id.to_string(),
                });
            }
        }
        Ok(())
    }

    fn commit(self) -> Result<ImportSummary> {
        let mut summary = ImportSummary::default();

        let mut spool = self.spool;
        for layer in self.layers {
            let (Some(span), Some(file)) = (layer.span, spool.as_mut()) else {
                continue;
            };
            let record = layer.record;
            // Another writer may have registered it since staging.
            if self.store.has_layer(&record.id)? {
                continue;
            }
            file.seek(SeekFrom::Start(span.offset))?;
            let mut payload = file.take(span.len);
            self.store
                .register_layer(&record.id, record.parent.as_ref(), &mut payload)?;
            summary.layers_registered += 1;
        }

        for image in self.images {
            if !image.known && !self.store.has_image(&image.id)? {
                self.store.register_image(&image.id, &image.metadata)?;
                summary.images_registered += 1;
            }
            summary.images.push(image.id);
        }

        for entry in self.tags.entries(None) {
            let previous = self.store.set_tag(&entry.repository, &entry.tag, &entry.id)?;
            if let Some(previous) = previous.filter(|p| p != &entry.id) {
                warn!(
                    tag = %entry.name(),
                    previous = %previous.short(),
                    image = %entry.id.short(),
                    "Tag moved to imported image"
                );
            }
            summary.tags.push(entry);
        }

        info!(
            images = summary.images.len(),
            tags = summary.tags.len(),
            layers_registered = summary.layers_registered,
            images_registered = summary.images_registered,
            "Imported archive"
        );
        Ok(summary)
    }
}
