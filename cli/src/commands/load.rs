//! `a3s-image load` command: Load images from a tar archive.

use std::collections::HashSet;
use std::io::{BufReader, IsTerminal};
use std::path::PathBuf;

use clap::Args;

use a3s_image_archive::{import_with, ImageStore, ImportOptions, ImportSummary};
use a3s_image_core::{ImageId, ImageLinks};

use super::Context;

#[derive(Args)]
pub struct LoadArgs {
    /// Input tar file path (default: standard input)
    #[arg(short, long)]
    pub input: Option<PathBuf>,
}

pub async fn execute(args: LoadArgs, ctx: &Context) -> Result<(), Box<dyn std::error::Error>> {
    let store = ctx.open_store()?;
    let options = ImportOptions::from(ctx.config());
    let buffer_size = ctx.config().copy_buffer_size;

    let (summary, leaves) = match args.input {
        Some(path) => {
            let file = std::fs::File::open(&path)
                .map_err(|e| format!("Failed to open {}: {e}", path.display()))?;
            super::blocking(move || {
                let summary = import_with(
                    store.as_ref(),
                    BufReader::with_capacity(buffer_size, file),
                    &options,
                )?;
                let leaves = leaf_images(store.as_ref(), &summary)?;
                Ok((summary, leaves))
            })
            .await?
        }
        None => {
            if std::io::stdin().is_terminal() {
                return Err(
                    "Refusing to read an archive from a terminal; use -i or redirect stdin".into(),
                );
            }
            super::blocking(move || {
                let input = BufReader::with_capacity(buffer_size, std::io::stdin().lock());
                let summary = import_with(store.as_ref(), input, &options)?;
                let leaves = leaf_images(store.as_ref(), &summary)?;
                Ok((summary, leaves))
            })
            .await?
        }
    };

    for line in report(&summary, &leaves) {
        println!("{line}");
    }
    Ok(())
}

/// Loaded images that are not the parent of another loaded image.
fn leaf_images(
    store: &dyn ImageStore,
    summary: &ImportSummary,
) -> a3s_image_core::Result<Vec<ImageId>> {
    let mut parents = HashSet::new();
    for id in &summary.images {
        if let Some(document) = store.image_metadata(id)? {
            if let Ok(ImageLinks {
                parent: Some(parent),
                ..
            }) = ImageLinks::from_document(&document)
            {
                parents.insert(parent);
            }
        }
    }
    Ok(summary
        .images
        .iter()
        .filter(|id| !parents.contains(*id))
        .cloned()
        .collect())
}

/// Output lines: one per applied tag, then one per untagged leaf image.
fn report(summary: &ImportSummary, leaves: &[ImageId]) -> Vec<String> {
    let tagged: HashSet<&ImageId> = summary.tags.iter().map(|t| &t.id).collect();
    summary
        .tags
        .iter()
        .map(|tag| format!("Loaded image: {}", tag.name()))
        .chain(
            leaves
                .iter()
                .filter(|id| !tagged.contains(id))
                .map(|id| format!("Loaded image ID: sha256:{id}")),
        )
        .collect()
}
