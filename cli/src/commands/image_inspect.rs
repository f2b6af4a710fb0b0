//! `a3s-image inspect` command: Print an image's metadata document verbatim.

use std::io::Write;

use clap::Args;

use a3s_image_archive::ImageStore;
use a3s_image_core::ImageError;

use super::Context;

#[derive(Args)]
pub struct ImageInspectArgs {
    /// Image reference to inspect
    pub image: String,
}

pub async fn execute(
    args: ImageInspectArgs,
    ctx: &Context,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = ctx.open_store()?;
    let name = args.image;
    let metadata = super::blocking(move || {
        let id = store
            .resolve_reference(&name)?
            .ok_or_else(|| ImageError::reference_not_found(name.as_str()))?;
        store
            .image_metadata(&id)?
            .ok_or_else(|| ImageError::reference_not_found(name.as_str()))
    })
    .await?;

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&metadata)?;
    stdout.flush()?;
    Ok(())
}
