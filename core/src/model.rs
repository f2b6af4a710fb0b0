//! Image and layer data model shared by the store and the archive engine.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::id::ImageId;

/// Metadata record of a layer, as written to `<layer-id>/json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRecord {
    /// Layer identifier (SHA-256 of the payload)
    pub id: ImageId,
    /// Parent layer, absent for root layers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ImageId>,
}

/// The fields of an image metadata document that the engine interprets.
///
/// The document itself is kept as raw bytes everywhere so that its
/// identifier stays stable; this view is only used to follow links.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ImageLinks {
    /// Parent image
    #[serde(default)]
    pub parent: Option<ImageId>,
    /// Leaf layer; `None` for an image without filesystem content
    #[serde(default)]
    pub layer: Option<ImageId>,
}

impl ImageLinks {
    /// Extract the links from a metadata document. Unknown keys are ignored.
    pub fn from_document(document: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(document)?)
    }
}

/// A `(repository, tag)` binding to an image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TagEntry {
    pub repository: String,
    pub tag: String,
    pub id: ImageId,
}

impl TagEntry {
    pub fn new(repository: impl Into<String>, tag: impl Into<String>, id: ImageId) -> Self {
        Self {
            repository: repository.into(),
            tag: tag.into(),
            id,
        }
    }

    /// `repository:tag` form.
    pub fn name(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

impl fmt::Display for TagEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} -> {}", self.repository, self.tag, self.id.short())
    }
}

/// Identifiers carried by an archive, in emission order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub layers: Vec<ImageId>,
    pub images: Vec<ImageId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> ImageId {
        ImageId::digest_of(&[n])
    }

    #[test]
    fn test_layer_record_omits_missing_parent() {
        let record = LayerRecord {
            id: id(1),
            parent: None,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("parent"));

        let back: LayerRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_image_links_ignore_opaque_keys() {
        let doc = format!(
            r#"{{"config":{{"Cmd":["true"]}},"created":"2014-05-01T00:00:00Z","parent":"{}","layer":"{}"}}"#,
            id(1),
            id(2)
        );
        let links = ImageLinks::from_document(doc.as_bytes()).unwrap();
        assert_eq!(links.parent, Some(id(1)));
        assert_eq!(links.layer, Some(id(2)));
    }

    #[test]
    fn test_image_links_empty_object() {
        let links = ImageLinks::from_document(b"{}").unwrap();
        assert_eq!(links, ImageLinks::default());
    }

    #[test]
    fn test_image_links_rejects_non_object() {
        assert!(ImageLinks::from_document(b"[1,2]").is_err());
        assert!(ImageLinks::from_document(br#"{"parent":"xyz"}"#).is_err());
    }

    #[test]
    fn test_tag_entry_name() {
        let entry = TagEntry::new("foobar-save-load-test", "latest", id(3));
        assert_eq!(entry.name(), "foobar-save-load-test:latest");
    }
}
