//! `a3s-image commit` command: Create an image from a filesystem diff.
//!
//! Records the diff as a new layer on top of the parent image's layer and
//! writes a metadata document for it, similar to `docker commit`.

use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};

use clap::Args;
use sha2::{Digest, Sha256};

use a3s_image_archive::{ImageStore, Reference};
use a3s_image_core::{ImageError, ImageId, ImageLinks};

use super::Context;

#[derive(Args)]
pub struct CommitArgs {
    /// Repository name and optionally a tag (e.g., "myimage:latest")
    pub repository: String,

    /// Filesystem diff to record as the image's layer
    #[arg(long)]
    pub layer: PathBuf,

    /// Parent image
    #[arg(long)]
    pub parent: Option<String>,

    /// Commit message
    #[arg(short, long)]
    pub message: Option<String>,

    /// Author (e.g., "Name <email>")
    #[arg(short, long)]
    pub author: Option<String>,

    /// Apply Dockerfile instruction (e.g., "CMD /bin/sh")
    #[arg(short, long)]
    pub change: Vec<String>,
}

pub async fn execute(args: CommitArgs, ctx: &Context) -> Result<(), Box<dyn std::error::Error>> {
    let target = Reference::parse(&args.repository)?;
    if target.digest.is_some() {
        return Err(format!("Cannot commit to a digest reference: {}", args.repository).into());
    }

    let store = ctx.open_store()?;
    let id = super::blocking(move || commit(store.as_ref(), &target, &args)).await?;

    println!("sha256:{id}");
    Ok(())
}

fn commit(
    store: &dyn ImageStore,
    target: &Reference,
    args: &CommitArgs,
) -> a3s_image_core::Result<ImageId> {
    let parent = match &args.parent {
        Some(name) => Some(
            store
                .resolve_reference(name)?
                .ok_or_else(|| ImageError::reference_not_found(name.as_str()))?,
        ),
        None => None,
    };
    let parent_layer = match &parent {
        Some(parent) => {
            let document = store
                .image_metadata(parent)?
                .ok_or_else(|| ImageError::reference_not_found(parent.as_str()))?;
            ImageLinks::from_document(&document)?.layer
        }
        None => None,
    };

    let layer = register_diff(store, &args.layer, parent_layer.as_ref())?;

    let mut document = serde_json::json!({
        "created": chrono::Utc::now().to_rfc3339(),
        "architecture": std::env::consts::ARCH,
        "os": "linux",
        "comment": args.message.as_deref().unwrap_or(""),
        "author": args.author.as_deref().unwrap_or(""),
        "config": {},
        "layer": layer,
    });
    if let Some(parent) = &parent {
        document["parent"] = serde_json::json!(parent);
    }
    apply_changes(&mut document, &args.change);

    let metadata = serde_json::to_vec_pretty(&document)?;
    let id = ImageId::digest_of(&metadata);
    store.register_image(&id, &metadata)?;
    store.set_tag(&target.repository, target.tag_or_default(), &id)?;

    tracing::info!(image = %id.short(), reference = %target, layer = %layer.short(), "Committed image");
    Ok(id)
}

/// Hash the diff file, then register it as a layer.
fn register_diff(
    store: &dyn ImageStore,
    path: &Path,
    parent: Option<&ImageId>,
) -> a3s_image_core::Result<ImageId> {
    let mut file = File::open(path).map_err(|e| {
        ImageError::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to open {}: {e}", path.display()),
        ))
    })?;

    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    let id = ImageId::from_hasher(hasher);

    file.seek(SeekFrom::Start(0))?;
    store.register_layer(&id, parent, &mut file)?;
    Ok(id)
}

/// Apply Dockerfile-style change directives to the image's `config` object.
fn apply_changes(document: &mut serde_json::Value, changes: &[String]) {
    let config = &mut document["config"];
    for change in changes {
        let Some((instruction, rest)) = change.trim().split_once(' ') else {
            tracing::warn!(change = %change, "Ignoring malformed change");
            continue;
        };
        let rest = rest.trim();
        match instruction.to_ascii_uppercase().as_str() {
            "CMD" => config["Cmd"] = serde_json::json!(["/bin/sh", "-c", rest]),
            "ENTRYPOINT" => config["Entrypoint"] = serde_json::json!(["/bin/sh", "-c", rest]),
            "WORKDIR" => config["WorkingDir"] = serde_json::json!(rest),
            "USER" => config["User"] = serde_json::json!(rest),
            "ENV" => {
                if rest.contains('=') {
                    push_array(config, "Env", serde_json::json!(rest));
                }
            }
            "EXPOSE" => {
                let port = if rest.contains('/') {
                    rest.to_string()
                } else {
                    format!("{rest}/tcp")
                };
                config["ExposedPorts"][port] = serde_json::json!({});
            }
            "LABEL" => {
                if let Some((key, value)) = rest.split_once('=') {
                    config["Labels"][key] = serde_json::json!(value);
                }
            }
            _ => tracing::warn!(change = %change, "Ignoring unsupported change"),
        }
    }
}

fn push_array(config: &mut serde_json::Value, key: &str, value: serde_json::Value) {
    match config[key].as_array_mut() {
        Some(values) => values.push(value),
        None => config[key] = serde_json::json!([value]),
    }
}
