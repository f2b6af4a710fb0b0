//! A3S Image Core - identifiers, data model, errors and configuration
//! shared by the image archive engine and the CLI.

pub mod config;
pub mod error;
pub mod id;
pub mod model;

// Re-export commonly used types
pub use config::ArchiveConfig;
pub use error::{ImageError, Result};
pub use id::ImageId;
pub use model::{ArchiveManifest, ImageLinks, LayerRecord, TagEntry};

/// A3S Image version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
