//! Repository/tag index.
//!
//! Serializes to the `repositories` document carried in archives and to the
//! on-disk store's tag file:
//!
//! ```json
//! {"foobar-save-load-test": {"latest": "<image-id>"}}
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use a3s_image_core::{ImageId, TagEntry};

/// Ordered `repository → tag → image` map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagIndex {
    repositories: BTreeMap<String, BTreeMap<String, ImageId>>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `repository:tag` to `id`, returning the previous binding.
    pub fn insert(&mut self, repository: &str, tag: &str, id: ImageId) -> Option<ImageId> {
        self.repositories
            .entry(repository.to_string())
            .or_default()
            .insert(tag.to_string(), id)
    }

    pub fn get(&self, repository: &str, tag: &str) -> Option<&ImageId> {
        self.repositories.get(repository)?.get(tag)
    }

    /// Remove one binding. Empty repositories are dropped.
    pub fn remove(&mut self, repository: &str, tag: &str) -> Option<ImageId> {
        let tags = self.repositories.get_mut(repository)?;
        let removed = tags.remove(tag);
        if tags.is_empty() {
            self.repositories.remove(repository);
        }
        removed
    }

    /// Remove every binding that points at `id`.
    pub fn remove_image(&mut self, id: &ImageId) -> Vec<TagEntry> {
        let removed: Vec<TagEntry> = self
            .entries(None)
            .into_iter()
            .filter(|entry| &entry.id == id)
            .collect();
        for entry in &removed {
            self.remove(&entry.repository, &entry.tag);
        }
        removed
    }

    /// All bindings, optionally limited to one repository, sorted by name.
    pub fn entries(&self, repository: Option<&str>) -> Vec<TagEntry> {
        self.repositories
            .iter()
            .filter(|(repo, _)| repository.map_or(true, |r| r == repo.as_str()))
            .flat_map(|(repo, tags)| {
                tags.iter()
                    .map(move |(tag, id)| TagEntry::new(repo.as_str(), tag.as_str(), id.clone()))
            })
            .collect()
    }

    /// Tags that point at `id`.
    pub fn names_for(&self, id: &ImageId) -> Vec<String> {
        self.entries(None)
            .into_iter()
            .filter(|entry| &entry.id == id)
            .map(|entry| entry.name())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.repositories.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.repositories.is_empty()
    }
}

impl FromIterator<TagEntry> for TagIndex {
    fn from_iter<I: IntoIterator<Item = TagEntry>>(iter: I) -> Self {
        let mut index = TagIndex::new();
        for entry in iter {
            index.insert(&entry.repository, &entry.tag, entry.id);
        }
        index
    }
}
