//! A3S Image CLI - save, load and manage images in a local store.

pub mod commands;
pub mod output;
