//! A3S Image Archive - save and load container images as portable tar streams.
//!
//! This crate provides the archive engine: the wire codec, the graph
//! linearizer that orders an image closure parents-first, the export and
//! import engines, the repository/tag index, and the image stores the engine
//! runs against.

#![allow(clippy::result_large_err)]

pub mod codec;
pub mod export;
pub mod graph;
pub mod import;
pub mod reference;
pub mod store;
pub mod tags;

// Re-export common types
pub use codec::{ArchiveEntry, ArchiveReader, ArchiveWriter, EntryKind, LayerStream};
pub use export::export;
pub use graph::{linearize, Closure, ImageNode, ResolvedReference};
pub use import::{import, import_with, ImportOptions, ImportPhase, ImportSummary};
pub use reference::Reference;
pub use store::{DiskStore, ImageStore, LayerPayload, MemoryStore};
pub use tags::TagIndex;

/// A3S Image Archive version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
