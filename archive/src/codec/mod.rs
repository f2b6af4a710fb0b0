//! Archive wire format.
//!
//! An archive is a plain tar stream. Entries appear in this order:
//!
//! ```text
//! <layer-id>/              directory
//! <layer-id>/VERSION       "1.0"
//! <layer-id>/json          {"id": "<layer-id>", "parent": "<layer-id>"}
//! <layer-id>/layer.tar     payload, never interpreted
//! ...                      (one group per layer, parents first)
//! <image-id>.json          image metadata document, verbatim
//! ...                      (one per image, parents first)
//! manifest.json            {"layers": [...], "images": [...]}
//! repositories             {"<repository>": {"<tag>": "<image-id>"}}  (optional)
//! ```
//!
//! All headers are deterministic: uid/gid 0, mtime 0, mode 0644 (0755 for
//! directories). The tar end-of-archive marker ends the stream.

mod reader;
mod writer;

pub use reader::{ArchiveEntry, ArchiveReader, EntryKind, LayerStream};
pub use writer::ArchiveWriter;

use std::io;

use a3s_image_core::error::{ImageError, Result};
use a3s_image_core::ImageId;

/// Layer format version written to `<layer-id>/VERSION`.
pub const FORMAT_VERSION: &str = "1.0";

pub const VERSION_FILE: &str = "VERSION";
pub const LAYER_RECORD_FILE: &str = "json";
pub const LAYER_PAYLOAD_FILE: &str = "layer.tar";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const REPOSITORIES_FILE: &str = "repositories";

/// What an archive path names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EntryPath {
    LayerDir(ImageId),
    LayerVersion(ImageId),
    LayerRecord(ImageId),
    LayerPayload(ImageId),
    Image(ImageId),
    Manifest,
    Repositories,
}

impl EntryPath {
    /// Classify a path read from the archive. Anything unrecognized is corrupt.
    pub(crate) fn classify(path: &str) -> Result<Self> {
        let path = path.strip_prefix("./").unwrap_or(path);
        match path {
            MANIFEST_FILE => return Ok(Self::Manifest),
            REPOSITORIES_FILE => return Ok(Self::Repositories),
            _ => {}
        }

        let unknown = || ImageError::CorruptArchive(format!("unexpected entry '{path}'"));

        match path.split_once('/') {
            Some((dir, rest)) => {
                let id = ImageId::parse(dir).map_err(|_| unknown())?;
                match rest {
                    "" => Ok(Self::LayerDir(id)),
                    VERSION_FILE => Ok(Self::LayerVersion(id)),
                    LAYER_RECORD_FILE => Ok(Self::LayerRecord(id)),
                    LAYER_PAYLOAD_FILE => Ok(Self::LayerPayload(id)),
                    _ => Err(unknown()),
                }
            }
            None => {
                let stem = path.strip_suffix(".json").ok_or_else(unknown)?;
                let id = ImageId::parse(stem).map_err(|_| unknown())?;
                Ok(Self::Image(id))
            }
        }
    }
}

/// Map an error raised while reading the source.
///
/// The tar reader reports malformed or truncated input as `Other`,
/// `InvalidData` or `UnexpectedEof`; any other kind is a real I/O failure.
pub(crate) fn read_error(context: &str, err: io::Error) -> ImageError {
    match err.kind() {
        io::ErrorKind::Other | io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => {
            ImageError::CorruptArchive(format!("{context}: {err}"))
        }
        _ => ImageError::Io(err),
    }
}
