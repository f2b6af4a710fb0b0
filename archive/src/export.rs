//! Export engine: image graph to archive stream.

use std::io::Write;

use tracing::{debug, info};

use a3s_image_core::error::Result;
use a3s_image_core::{ArchiveManifest, ImageId};

use crate::codec::ArchiveWriter;
use crate::graph::{linearize, Closure};
use crate::reference::Reference;
use crate::store::ImageStore;
use crate::tags::TagIndex;

/// Write the images named by `references`, with everything they depend on,
/// to `destination`. Returns the number of bytes written.
///
/// Nothing is written unless every reference resolves.
pub fn export<W: Write>(
    store: &dyn ImageStore,
    references: &[String],
    destination: W,
) -> Result<u64> {
    let names = expand_references(store, references)?;
    let closure = linearize(store, &names)?;
    let tags = archive_tags(store, &closure)?;

    let mut writer = ArchiveWriter::new(destination);
    for record in &closure.layers {
        let mut payload = store.open_layer(&record.id)?;
        debug!(layer = %record.id.short(), size = payload.size, "Writing layer");
        writer.write_layer(record, &mut payload.reader, payload.size)?;
    }
    for image in &closure.images {
        debug!(image = %image.id.short(), "Writing image");
        writer.write_image(&image.id, &image.metadata)?;
    }
    writer.write_manifest(&ArchiveManifest {
        layers: closure.layers.iter().map(|l| l.id.clone()).collect(),
        images: closure.images.iter().map(|i| i.id.clone()).collect(),
    })?;
    if !tags.is_empty() {
        writer.write_repositories(&tags)?;
    }
    let (_, written) = writer.finish()?;

    info!(
        references = references.len(),
        layers = closure.layers.len(),
        images = closure.images.len(),
        tags = tags.len(),
        bytes = written,
        "Exported images"
    );
    Ok(written)
}

/// Replace each bare repository name that has tags with one `repo:tag` name
/// per tag. Other names pass through unchanged.
fn expand_references(store: &dyn ImageStore, references: &[String]) -> Result<Vec<String>> {
    let mut names = Vec::with_capacity(references.len());
    for name in references {
        if !ImageId::is_valid(name) {
            if let Ok(reference) = Reference::parse(name) {
                if reference.tag.is_none() && reference.digest.is_none() {
                    let entries = store.list_tags(Some(&reference.repository))?;
                    if !entries.is_empty() {
                        names.extend(entries.iter().map(|entry| entry.name()));
                        continue;
                    }
                }
            }
        }
        names.push(name.clone());
    }
    Ok(names)
}

/// Tags to carry in the archive: one per root that was named by a tag which
/// still points at the resolved image. Identifiers and digests carry none.
fn archive_tags(store: &dyn ImageStore, closure: &Closure) -> Result<TagIndex> {
    let mut tags = TagIndex::new();
    for root in &closure.roots {
        if ImageId::is_valid(&root.name) {
            continue;
        }
        let Ok(reference) = Reference::parse(&root.name) else {
            continue;
        };
        let (Some(tag), None) = (reference.tag.as_deref(), reference.digest.as_ref()) else {
            continue;
        };
        if store.lookup_tag(&reference.repository, tag)?.as_ref() == Some(&root.id) {
            tags.insert(&reference.repository, tag, root.id.clone());
        }
    }
    Ok(tags)
}
