//! CLI command definitions and dispatch.

mod commit;
mod image_inspect;
mod image_tag;
mod images;
mod load;
mod rmi;
mod save;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use a3s_image_archive::DiskStore;
use a3s_image_core::ArchiveConfig;

/// A3S Image: save and load container images as portable archives.
#[derive(Parser)]
#[command(name = "a3s-image", version, about)]
pub struct Cli {
    /// Image store directory (default: ~/.a3s/images, or $A3S_IMAGE_ROOT)
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// YAML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Save one or more images to a tar archive (streamed to stdout by default)
    Save(save::SaveArgs),
    /// Load images from a tar archive (read from stdin by default)
    Load(load::LoadArgs),
    /// Create an image from a filesystem diff
    Commit(commit::CommitArgs),
    /// Create a tag that refers to an existing image
    Tag(image_tag::ImageTagArgs),
    /// List images
    Images(images::ImagesArgs),
    /// Print an image's metadata document
    Inspect(image_inspect::ImageInspectArgs),
    /// Remove one or more images
    Rmi(rmi::RmiArgs),
}

/// Settings shared by every command.
pub(crate) struct Context {
    config: ArchiveConfig,
}

impl Context {
    /// Resolve configuration: file, then environment, then command-line flags.
    fn from_cli(cli: &Cli) -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = ArchiveConfig::load(cli.config.as_deref())?;
        if let Some(root) = &cli.root {
            config.root = root.clone();
        }
        tracing::debug!(root = %config.root.display(), "Using image store");
        Ok(Self { config })
    }

    pub(crate) fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    /// Open the image store.
    pub(crate) fn open_store(&self) -> Result<Arc<DiskStore>, Box<dyn std::error::Error>> {
        Ok(Arc::new(DiskStore::open(&self.config.root)?))
    }
}

/// Run blocking store or archive work off the async runtime.
pub(crate) async fn blocking<T, F>(work: F) -> Result<T, Box<dyn std::error::Error>>
where
    F: FnOnce() -> a3s_image_core::Result<T> + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(work).await??)
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = Context::from_cli(&cli)?;
    match cli.command {
        Command::Save(args) => save::execute(args, &ctx).await,
        Command::Load(args) => load::execute(args, &ctx).await,
        Command::Commit(args) => commit::execute(args, &ctx).await,
        Command::Tag(args) => image_tag::execute(args, &ctx).await,
        Command::Images(args) => images::execute(args, &ctx).await,
        Command::Inspect(args) => image_inspect::execute(args, &ctx).await,
        Command::Rmi(args) => rmi::execute(args, &ctx).await,
    }
}
