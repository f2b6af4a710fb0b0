//! Content-addressed identifiers.
//!
//! Every layer and image is named by the SHA-256 digest of its content:
//! a layer by its payload bytes, an image by its metadata document bytes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::{ImageError, Result};

/// Prefix accepted (and stripped) on input.
pub const SHA256_PREFIX: &str = "sha256:";

/// Length of a hex-encoded SHA-256 digest.
pub const ID_HEX_LEN: usize = 64;

/// SHA-256 identifier of a layer or image, stored as 64 lowercase hex chars.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId(String);

impl ImageId {
    /// Parse an identifier, with or without the `sha256:` prefix.
    pub fn parse(s: &str) -> Result<Self> {
        let hex_part = s.strip_prefix(SHA256_PREFIX).unwrap_or(s);
        if !is_hex_id(hex_part) {
            return Err(ImageError::CorruptArchive(format!(
                "invalid identifier '{s}': expected {ID_HEX_LEN} lowercase hex characters"
            )));
        }
        Ok(Self(hex_part.to_string()))
    }

    /// Identifier of the given content.
    pub fn digest_of(content: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(content)))
    }

    /// Identifier from a finished hasher.
    pub fn from_hasher(hasher: Sha256) -> Self {
        Self(hex::encode(hasher.finalize()))
    }

    /// The bare hex form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, as shown in listings.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }

    /// Whether `s` is a bare 64-char lowercase hex digest.
    pub fn is_valid(s: &str) -> bool {
        is_hex_id(s.strip_prefix(SHA256_PREFIX).unwrap_or(s))
    }
}

fn is_hex_id(s: &str) -> bool {
    s.len() == ID_HEX_LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ImageId({})", self.short())
    }
}

impl FromStr for ImageId {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl AsRef<str> for ImageId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for ImageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ImageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ImageId::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_digest_of_empty() {
        assert_eq!(ImageId::digest_of(b"").as_str(), EMPTY_SHA256);
    }

    #[test]
    fn test_from_hasher_matches_digest_of() {
        let mut hasher = Sha256::new();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(
            ImageId::from_hasher(hasher),
            ImageId::digest_of(b"hello world")
        );
    }

    #[test]
    fn test_parse_with_prefix() {
        let id = ImageId::parse(&format!("sha256:{EMPTY_SHA256}")).unwrap();
        assert_eq!(id.as_str(), EMPTY_SHA256);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(ImageId::parse("abc").is_err());
        assert!(ImageId::parse(&EMPTY_SHA256.to_uppercase()).is_err());
        assert!(ImageId::parse(&format!("{}g", &EMPTY_SHA256[..63])).is_err());
        assert!(ImageId::parse(&format!("../{}", &EMPTY_SHA256[..61])).is_err());
    }

    #[test]
    fn test_short() {
        let id = ImageId::parse(EMPTY_SHA256).unwrap();
        assert_eq!(id.short(), "e3b0c44298fc");
    }

    #[test]
    fn test_serde_as_plain_string() {
        let id = ImageId::parse(EMPTY_SHA256).unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{EMPTY_SHA256}\""));
        let back: ImageId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<ImageId>("\"nope\"").is_err());
    }
}
