//! `a3s-image rmi` command: Remove one or more images.
//!
//! Removing by `repository:tag` untags; the image itself is deleted once no
//! tag and no child image refers to it. Removing by ID deletes the image and
//! all of its tags, and is refused while child images depend on it.

use clap::Args;

use a3s_image_archive::{ImageStore, Reference};
use a3s_image_core::{ImageError, ImageId};

use super::Context;

#[derive(Args)]
pub struct RmiArgs {
    /// Image references to remove
    #[arg(required = true)]
    pub images: Vec<String>,

    /// Force removal (ignore not-found errors, delete images with several tags)
    #[arg(short, long)]
    pub force: bool,
}

pub async fn execute(args: RmiArgs, ctx: &Context) -> Result<(), Box<dyn std::error::Error>> {
    let store = ctx.open_store()?;
    let force = args.force;

    let mut errors: Vec<String> = Vec::new();
    for reference in args.images {
        let store = store.clone();
        let name = reference.clone();
        match super::blocking(move || remove(store.as_ref(), &name, force)).await {
            Ok(lines) => {
                for line in lines {
                    println!("{line}");
                }
            }
            Err(e) => errors.push(format!("{reference}: {e}")),
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        let msg = errors.join("\n");
        Err(format!("Failed to remove image(s):\n{msg}").into())
    }
}

/// Remove one image reference, returning the lines to print.
fn remove(store: &dyn ImageStore, name: &str, force: bool) -> a3s_image_core::Result<Vec<String>> {
    let Some(id) = store.resolve_reference(name)? else {
        if force {
            return Ok(Vec::new());
        }
        return Err(ImageError::reference_not_found(name));
    };

    let tags: Vec<_> = store
        .list_tags(None)?
        .into_iter()
        .filter(|entry| entry.id == id)
        .collect();

    if let Some((repository, tag)) = tag_reference(store, name, &id)? {
        // Other tags or child images still need the image: untag only.
        if tags.len() > 1 || store.has_child_images(&id)? {
            store.remove_tag(&repository, &tag)?;
            return Ok(vec![format!("Untagged: {repository}:{tag}")]);
        }
    } else {
        if tags.len() > 1 && !force {
            return Err(ImageError::StoreFailure(format!(
                "Image {} is referenced by {} tags, use -f to remove it",
                id.short(),
                tags.len()
            )));
        }
        if store.has_child_images(&id)? {
            return Err(ImageError::StoreFailure(format!(
                "Image {} has dependent child images",
                id.short()
            )));
        }
    }

    // Removing the image drops its tags in the same step.
    store.remove_image(&id)?;
    let mut lines: Vec<String> = tags
        .iter()
        .map(|entry| format!("Untagged: {}", entry.name()))
        .collect();
    lines.push(format!("Deleted: sha256:{id}"));
    Ok(lines)
}

/// `(repository, tag)` if `name` reached `id` through a tag.
fn tag_reference(
    store: &dyn ImageStore,
    name: &str,
    id: &ImageId,
) -> a3s_image_core::Result<Option<(String, String)>> {
    if ImageId::is_valid(name) {
        return Ok(None);
    }
    let Ok(reference) = Reference::parse(name) else {
        return Ok(None);
    };
    if reference.digest.is_some() {
        return Ok(None);
    }
    let tag = reference.tag_or_default().to_string();
    match store.lookup_tag(&reference.repository, &tag)? {
        Some(tagged) if &tagged == id => Ok(Some((reference.repository, tag))),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use a3s_image_archive::MemoryStore;

    fn store() -> (MemoryStore, ImageId) {
        let store = MemoryStore::new();
        let layer = store.add_layer(None, b"diff").unwrap();
        let doc = serde_json::to_vec(&serde_json::json!({ "layer": layer })).unwrap();
        let id = store.add_image(&doc).unwrap();
        store.set_tag("app", "latest", &id).unwrap();
        store.set_tag("app", "v1", &id).unwrap();
        (store, id)
    }

    #[test]
    fn test_remove_tag_keeps_image_with_other_tags() {
        let (store, id) = store();
        let lines = remove(&store, "app:v1", false).unwrap();
        assert_eq!(lines, vec!["Untagged: app:v1".to_string()]);
        assert!(store.has_image(&id).unwrap());

        let lines = remove(&store, "app", false).unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], format!("Deleted: sha256:{id}"));
        assert!(!store.has_image(&id).unwrap());
        assert_eq!(store.layer_count(), 0);
    }

    #[test]
    fn test_remove_by_id_requires_force_with_several_tags() {
        let (store, id) = store();
        assert!(remove(&store, id.as_str(), false).is_err());
        assert!(store.has_image(&id).unwrap());

        let lines = remove(&store, id.short(), true).unwrap();
        assert_eq!(lines.len(), 3);
        assert!(store.list_tags(None).unwrap().is_empty());
    }

    #[test]
    fn test_remove_missing() {
        let (store, _) = store();
        let err = remove(&store, "ghost", false).unwrap_err();
        assert!(matches!(err, ImageError::ReferenceNotFound { .. }));
        assert!(remove(&store, "ghost", true).unwrap().is_empty());
    }

    fn store_with_child() -> (MemoryStore, ImageId, ImageId) {
        let store = MemoryStore::new();
        let base_layer = store.add_layer(None, b"base").unwrap();
        let app_layer = store.add_layer(Some(&base_layer), b"app").unwrap();
        let base_doc = serde_json::json!({ "layer": base_layer });
        let base = store.add_image(&serde_json::to_vec(&base_doc).unwrap()).unwrap();
        let app_doc = serde_json::json!({ "layer": app_layer, "parent": base });
        let app = store.add_image(&serde_json::to_vec(&app_doc).unwrap()).unwrap();
        store.set_tag("base", "latest", &base).unwrap();
        store.set_tag("app", "latest", &app).unwrap();
        (store, base, app)
    }

    #[test]
    fn test_remove_only_tag_of_parent_untags() {
        let (store, base, app) = store_with_child();
        let lines = remove(&store, "base:latest", false).unwrap();
        assert_eq!(lines, vec!["Untagged: base:latest".to_string()]);
        assert!(store.has_image(&base).unwrap());
        assert!(store.has_image(&app).unwrap());
        assert_eq!(store.lookup_tag("base", "latest").unwrap(), None);
        assert_eq!(store.layer_count(), 2);
    }

    #[test]
    fn test_remove_parent_by_id_changes_nothing() {
        let (store, base, _) = store_with_child();
        let err = remove(&store, base.as_str(), true).unwrap_err();
        assert!(matches!(err, ImageError::StoreFailure(_)), "{err}");
        assert_eq!(store.lookup_tag("base", "latest").unwrap(), Some(base.clone()));
        assert!(store.has_image(&base).unwrap());
    }

    #[test]
    fn test_remove_child_then_parent() {
        let (store, base, app) = store_with_child();
        let lines = remove(&store, "app", false).unwrap();
        assert_eq!(
            lines,
            vec![
                "Untagged: app:latest".to_string(),
                format!("Deleted: sha256:{app}")
            ]
        );
        let lines = remove(&store, "base", false).unwrap();
        assert_eq!(lines[1], format!("Deleted: sha256:{base}"));
        assert_eq!(store.image_count(), 0);
        assert_eq!(store.layer_count(), 0);
    }
}
