//! `a3s-image save` command: Save images to a tar archive.
//!
//! Writes the requested images, every ancestor they need, and the tags they
//! were named by, suitable for transferring to another machine and loading
//! with `a3s-image load`.

use std::fs::File;
use std::io::{BufWriter, IsTerminal, Write};
use std::path::{Path, PathBuf};

use clap::Args;

use a3s_image_archive::{export, ImageStore};
use a3s_image_core::ImageError;

use super::Context;

#[derive(Args)]
pub struct SaveArgs {
    /// Images to save (repository[:tag], image ID or ID prefix)
    #[arg(required = true)]
    pub images: Vec<String>,

    /// Output file path (default: standard output)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

pub async fn execute(args: SaveArgs, ctx: &Context) -> Result<(), Box<dyn std::error::Error>> {
    let store = ctx.open_store()?;
    let buffer_size = ctx.config().copy_buffer_size;
    let images = args.images.clone();

    match args.output {
        Some(path) => {
            let target = path.clone();
            let written = super::blocking(move || {
                save_to_file(store.as_ref(), &images, &target, buffer_size)
            })
            .await?;
            println!(
                "Saved {} to {} ({})",
                args.images.join(", "),
                path.display(),
                crate::output::format_bytes(written)
            );
        }
        None => {
            if std::io::stdout().is_terminal() {
                return Err(
                    "Refusing to write an archive to a terminal; use -o or redirect stdout".into(),
                );
            }
            super::blocking(move || {
                let mut out = BufWriter::with_capacity(buffer_size, std::io::stdout().lock());
                let written = export(store.as_ref(), &images, &mut out)?;
                out.flush()?;
                Ok(written)
            })
            .await?;
        }
    }
    Ok(())
}

/// Export to `path`. A partially written file is removed on failure.
fn save_to_file(
    store: &dyn ImageStore,
    images: &[String],
    path: &Path,
    buffer_size: usize,
) -> a3s_image_core::Result<u64> {
    let file = File::create(path).map_err(|e| {
        ImageError::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to create {}: {e}", path.display()),
        ))
    })?;

    let result = write_archive(store, images, file, buffer_size);
    if result.is_err() {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove partial archive");
        }
    }
    result
}

fn write_archive(
    store: &dyn ImageStore,
    images: &[String],
    file: File,
    buffer_size: usize,
) -> a3s_image_core::Result<u64> {
    let mut out = BufWriter::with_capacity(buffer_size, file);
    let written = export(store, images, &mut out)?;
    out.flush()?;
    out.get_ref().sync_all()?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use a3s_image_archive::MemoryStore;
    use tempfile::TempDir;

    fn store() -> MemoryStore {
        let store = MemoryStore::new();
        let layer = store.add_layer(None, b"diff").unwrap();
        let doc = serde_json::to_vec(&serde_json::json!({ "layer": layer })).unwrap();
        let id = store.add_image(&doc).unwrap();
        store.set_tag("app", "latest", &id).unwrap();
        store
    }

    #[test]
    fn test_save_to_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("app.tar");
        let written = save_to_file(&store(), &["app".to_string()], &path, 4096).unwrap();
        assert_eq!(written, std::fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn test_failed_save_removes_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("missing.tar");
        let err = save_to_file(&store(), &["missing".to_string()], &path, 4096).unwrap_err();
        assert!(matches!(err, ImageError::ReferenceNotFound { .. }));
        assert!(!path.exists());
    }

    #[test]
    fn test_save_to_invalid_path() {
        let result = save_to_file(
            &store(),
            &["app".to_string()],
            Path::new("/nonexistent/dir/app.tar"),
            4096,
        );
        assert!(result.is_err());
    }
}
