//! Image reference parsing.
//!
//! Parses local image names like `foobar-save-load-test`, `busybox:1.36`,
//! `localhost:5000/team/app:v2` or `app@sha256:<hex>` into structured components.

use std::fmt;

use a3s_image_core::error::{ImageError, Result};
use a3s_image_core::id::{ImageId, ID_HEX_LEN, SHA256_PREFIX};

/// Default tag when none is specified.
pub const DEFAULT_TAG: &str = "latest";

/// Shortest identifier prefix accepted in place of a full identifier.
pub const MIN_ID_PREFIX_LEN: usize = 12;

/// Longest tag accepted.
const MAX_TAG_LEN: usize = 128;

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// Repository name, verbatim (e.g., "busybox", "localhost:5000/team/app")
    pub repository: String,
    /// Tag (e.g., "latest", "v2"); `None` when not given
    pub tag: Option<String>,
    /// Pinned image identifier
    pub digest: Option<ImageId>,
}

impl Reference {
    /// Parse an image reference string.
    ///
    /// Supports formats:
    /// - `busybox` → repository `busybox`, no tag
    /// - `busybox:1.36` → repository `busybox`, tag `1.36`
    /// - `localhost:5000/team/app:v2` → repository `localhost:5000/team/app`, tag `v2`
    /// - `app@sha256:abc...` → repository `app`, pinned identifier
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(ImageError::reference_not_found("<empty>"));
        }

        // Split off digest first (@ separator)
        let (name_tag, digest) = match reference.rsplit_once('@') {
            Some((name_tag, digest)) => {
                if !digest.starts_with(SHA256_PREFIX) {
                    return Err(ImageError::reference_not_found(format!(
                        "{reference} (expected sha256:<hex> after '@')"
                    )));
                }
                let digest = ImageId::parse(digest)
                    .map_err(|_| ImageError::reference_not_found(reference))?;
                (name_tag, Some(digest))
            }
            None => (reference, None),
        };

        // Split tag (: separator, but only after the last /)
        let tag_start = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
        let (repository, tag) = match name_tag[tag_start..].rfind(':') {
            Some(colon) => {
                let colon = tag_start + colon;
                (&name_tag[..colon], Some(name_tag[colon + 1..].to_string()))
            }
            None => (name_tag, None),
        };

        if !valid_repository(repository) {
            return Err(ImageError::reference_not_found(format!(
                "{reference} (invalid repository name)"
            )));
        }
        if let Some(ref tag) = tag {
            if !valid_tag(tag) {
                return Err(ImageError::reference_not_found(format!(
                    "{reference} (invalid tag)"
                )));
            }
        }

        Ok(Reference {
            repository: repository.to_string(),
            tag,
            digest,
        })
    }

    /// The tag, or `latest` when none was given.
    pub fn tag_or_default(&self) -> &str {
        self.tag.as_deref().unwrap_or(DEFAULT_TAG)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repository)?;
        if let Some(ref tag) = self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(ref digest) = self.digest {
            write!(f, "@{SHA256_PREFIX}{digest}")?;
        }
        Ok(())
    }
}

/// The hex part of `name` if it looks like an identifier prefix.
pub fn id_prefix(name: &str) -> Option<&str> {
    let hex_part = name.strip_prefix(SHA256_PREFIX).unwrap_or(name);
    let ok = (MIN_ID_PREFIX_LEN..=ID_HEX_LEN).contains(&hex_part.len())
        && hex_part
            .bytes()
            .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
    ok.then_some(hex_part)
}

pub(crate) fn valid_repository(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('/')
        && !name.ends_with('/')
        && !name.contains("//")
        && name.bytes().all(|b| {
            matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' | b'/' | b':')
        })
}

pub(crate) fn valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag.len() <= MAX_TAG_LEN
        && !tag.starts_with(['.', '-'])
        && tag
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890";

    #[test]
    fn test_parse_simple_name() {
        let r = Reference::parse("foobar-save-load-test").unwrap();
        assert_eq!(r.repository, "foobar-save-load-test");
        assert_eq!(r.tag, None);
        assert_eq!(r.digest, None);
        assert_eq!(r.tag_or_default(), "latest");
    }

    #[test]
    fn test_parse_name_with_tag() {
        let r = Reference::parse("busybox:1.36").unwrap();
        assert_eq!(r.repository, "busybox");
        assert_eq!(r.tag, Some("1.36".to_string()));
    }

    #[test]
    fn test_parse_user_repo_with_tag() {
        let r = Reference::parse("myuser/myimage:v1.0").unwrap();
        assert_eq!(r.repository, "myuser/myimage");
        assert_eq!(r.tag, Some("v1.0".to_string()));
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = Reference::parse("localhost:5000/team/app:v2").unwrap();
        assert_eq!(r.repository, "localhost:5000/team/app");
        assert_eq!(r.tag, Some("v2".to_string()));

        let r = Reference::parse("localhost:5000/team/app").unwrap();
        assert_eq!(r.repository, "localhost:5000/team/app");
        assert_eq!(r.tag, None);
    }

    #[test]
    fn test_parse_digest() {
        let r = Reference::parse(&format!("app@sha256:{HEX}")).unwrap();
        assert_eq!(r.repository, "app");
        assert_eq!(r.tag, None);
        assert_eq!(r.digest.unwrap().as_str(), HEX);
    }

    #[test]
    fn test_parse_tag_and_digest() {
        let r = Reference::parse(&format!("app:v1@sha256:{HEX}")).unwrap();
        assert_eq!(r.tag, Some("v1".to_string()));
        assert!(r.digest.is_some());
    }

    #[test]
    fn test_parse_invalid() {
        assert!(Reference::parse("").is_err());
        assert!(Reference::parse("   ").is_err());
        assert!(Reference::parse("app@md5:abc").is_err());
        assert!(Reference::parse("app@sha256:abc").is_err());
        assert!(Reference::parse("App:latest").is_err());
        assert!(Reference::parse("app:").is_err());
        assert!(Reference::parse("app:-bad").is_err());
        assert!(Reference::parse("/app").is_err());
    }

    #[test]
    fn test_parse_error_kind() {
        let err = Reference::parse("").unwrap_err();
        assert!(matches!(err, ImageError::ReferenceNotFound { .. }));
    }

    #[test]
    fn test_parse_whitespace_reference() {
        let r = Reference::parse("  busybox  ").unwrap();
        assert_eq!(r.repository, "busybox");
    }

    #[test]
    fn test_display() {
        let r = Reference::parse("localhost:5000/app:v2").unwrap();
        assert_eq!(r.to_string(), "localhost:5000/app:v2");

        let r = Reference::parse(&format!("app@sha256:{HEX}")).unwrap();
        assert_eq!(r.to_string(), format!("app@sha256:{HEX}"));
    }

    #[test]
    fn test_id_prefix() {
        assert_eq!(id_prefix(&HEX[..12]), Some(&HEX[..12]));
        assert_eq!(id_prefix(&format!("sha256:{}", &HEX[..20])), Some(&HEX[..20]));
        assert_eq!(id_prefix(HEX), Some(HEX));
        assert_eq!(id_prefix(&HEX[..11]), None);
        assert_eq!(id_prefix("busybox"), None);
    }
}
