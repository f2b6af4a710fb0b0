//! `a3s-image tag` command: Create a tag that refers to an existing image.

use clap::Args;

use a3s_image_archive::{ImageStore, Reference};
use a3s_image_core::ImageError;

use super::Context;

#[derive(Args)]
pub struct ImageTagArgs {
    /// Source image reference
    pub source: String,

    /// Target image reference (new tag)
    pub target: String,
}

pub async fn execute(args: ImageTagArgs, ctx: &Context) -> Result<(), Box<dyn std::error::Error>> {
    let target = Reference::parse(&args.target)?;
    if target.digest.is_some() {
        return Err(format!("Cannot tag with a digest reference: {}", args.target).into());
    }

    let store = ctx.open_store()?;
    let source = args.source.clone();
    let name = super::blocking(move || {
        let id = store
            .resolve_reference(&source)?
            .ok_or_else(|| ImageError::reference_not_found(source.as_str()))?;
        let tag = target.tag_or_default();
        let name = format!("{}:{tag}", target.repository);
        if let Some(previous) = store.set_tag(&target.repository, tag, &id)? {
            if previous != id {
                tracing::info!(tag = %name, previous = %previous.short(), "Tag moved");
            }
        }
        Ok(name)
    })
    .await?;

    println!("{name}");
    Ok(())
}
