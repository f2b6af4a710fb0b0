//! `a3s-image images` command.

use std::collections::HashSet;

use clap::Args;

use a3s_image_archive::ImageStore;
use a3s_image_core::{ImageId, ImageLinks};

use crate::output;

use super::Context;

#[derive(Args)]
pub struct ImagesArgs {
    /// Only show images of this repository
    pub repository: Option<String>,

    /// Also show untagged images
    #[arg(short, long)]
    pub all: bool,

    /// Only show image IDs (one per line)
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: ImagesArgs, ctx: &Context) -> Result<(), Box<dyn std::error::Error>> {
    let store = ctx.open_store()?;
    let repository = args.repository.clone();
    let all = args.all;
    let rows = super::blocking(move || collect_rows(store.as_ref(), repository.as_deref(), all))
        .await?;

    if args.quiet {
        let mut seen = HashSet::new();
        for row in &rows {
            if seen.insert(&row.id) {
                println!("{}", row.id.short());
            }
        }
        return Ok(());
    }

    let mut table = output::new_table(&["REPOSITORY", "TAG", "IMAGE ID", "CREATED", "SIZE"]);
    for row in &rows {
        table.add_row(&[
            row.repository.as_str(),
            row.tag.as_str(),
            row.id.short(),
            row.created.as_str(),
            row.size.as_str(),
        ]);
    }
    println!("{table}");
    Ok(())
}

/// Pre-computed display fields for a single image row.
#[derive(Debug)]
struct ImageRow {
    repository: String,
    tag: String,
    id: ImageId,
    created: String,
    size: String,
}

fn collect_rows(
    store: &dyn ImageStore,
    repository: Option<&str>,
    all: bool,
) -> a3s_image_core::Result<Vec<ImageRow>> {
    let tags = store.list_tags(repository)?;
    let mut rows = Vec::with_capacity(tags.len());
    for entry in tags {
        rows.push(ImageRow::load(store, entry.repository, entry.tag, entry.id)?);
    }

    if all && repository.is_none() {
        let tagged: HashSet<ImageId> = rows.iter().map(|r| r.id.clone()).collect();
        for id in store.list_images()? {
            if !tagged.contains(&id) {
                rows.push(ImageRow::load(
                    store,
                    "<none>".to_string(),
                    "<none>".to_string(),
                    id,
                )?);
            }
        }
    }
    Ok(rows)
}

impl ImageRow {
    fn load(
        store: &dyn ImageStore,
        repository: String,
        tag: String,
        id: ImageId,
    ) -> a3s_image_core::Result<Self> {
        let document = store.image_metadata(&id)?.unwrap_or_default();
        let created = serde_json::from_slice::<serde_json::Value>(&document)
            .ok()
            .and_then(|doc| doc["created"].as_str().map(str::to_string))
            .and_then(|created| chrono::DateTime::parse_from_rfc3339(&created).ok())
            .map(|created| output::format_ago(&created.with_timezone(&chrono::Utc)))
            .unwrap_or_else(|| "N/A".to_string());
        let size = match ImageLinks::from_document(&document) {
            Ok(links) => output::format_bytes(chain_size(store, links.layer)?),
            Err(_) => "N/A".to_string(),
        };

        Ok(Self {
            repository,
            tag,
            id,
            created,
            size,
        })
    }
}

/// Total payload size of a layer and its ancestors.
fn chain_size(store: &dyn ImageStore, leaf: Option<ImageId>) -> a3s_image_core::Result<u64> {
    let mut total = 0;
    let mut seen = HashSet::new();
    let mut cursor = leaf;
    while let Some(layer) = cursor {
        if !seen.insert(layer.clone()) {
            break;
        }
        total += store.open_layer(&layer)?.size;
        cursor = store.layer_parent(&layer)?.flatten();
    }
    Ok(total)
}
