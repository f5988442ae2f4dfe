//! Novel Aggregate Interface
//!
//! The novel being written is owned outside the engine. It is organised
//! into named groups (volumes), each holding one content set per
//! [`ContentKind`]. The engine reads presets and reference material from
//! it and proposes updated content sets.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Mutex;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::workflow::model::new_id;

/// Kinds of content set kept per group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    World,
    Characters,
    Outline,
    Inspiration,
    Chapters,
}

impl ContentKind {
    pub const ALL: [ContentKind; 5] = [
        ContentKind::World,
        ContentKind::Characters,
        ContentKind::Outline,
        ContentKind::Inspiration,
        ContentKind::Chapters,
    ];

    /// Sets whose items follow a numbered sequence.
    pub fn is_ordered(&self) -> bool {
        matches!(self, Self::Outline | Self::Chapters)
    }

    /// Heading used when the set is quoted as reference material.
    pub fn heading(&self) -> &'static str {
        match self {
            Self::World => "World reference",
            Self::Characters => "Character reference",
            Self::Outline => "Outline reference",
            Self::Inspiration => "Inspiration reference",
            Self::Chapters => "Chapter reference",
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::World => "world",
            Self::Characters => "characters",
            Self::Outline => "outline",
            Self::Inspiration => "inspiration",
            Self::Chapters => "chapters",
        };
        write!(f, "{}", name)
    }
}

/// One item of a content set, keyed by its title.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    pub title: String,
    pub content: String,
}

impl ContentItem {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
        }
    }
}

/// Access to the novel being written.
pub trait NovelPort: Send + Sync {
    /// Creates the group and its empty content sets if absent.
    ///
    /// Returns `true` when the group was created by this call.
    fn ensure_group(&self, name: &str) -> bool;

    fn has_group(&self, name: &str) -> bool;

    /// Current items of a group's content set (empty when absent).
    fn content_set(&self, group: &str, kind: ContentKind) -> Vec<ContentItem>;

    /// Replaces the items of a group's content set.
    fn replace_content_set(&self, group: &str, kind: ContentKind, items: Vec<ContentItem>);

    /// Renders the selected sets as reference text, if any resolve to content.
    fn reference_text(&self, kind: ContentKind, set_ids: &[String]) -> Option<String>;

    /// Prompt template text of a preset.
    fn preset(&self, preset_id: &str) -> Option<String>;
}

#[derive(Debug, Clone)]
struct ContentSet {
    id: String,
    items: Vec<ContentItem>,
}

#[derive(Debug, Clone)]
struct Group {
    name: String,
    sets: BTreeMap<ContentKind, ContentSet>,
}

impl Group {
    fn new(name: &str) -> Self {
        let sets = ContentKind::ALL
            .iter()
            .map(|kind| {
                (
                    *kind,
                    ContentSet {
                        id: new_id(),
                        items: Vec::new(),
                    },
                )
            })
            .collect();
        Self {
            name: name.to_string(),
            sets,
        }
    }
}

#[derive(Default)]
struct NovelData {
    groups: Vec<Group>,
    presets: HashMap<String, String>,
}

/// A complete in-process novel, used by the CLI and tests.
#[derive(Default)]
pub struct InMemoryNovel {
    data: Mutex<NovelData>,
}

impl InMemoryNovel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a prompt preset.
    pub fn add_preset(&self, id: impl Into<String>, template: impl Into<String>) {
        self.lock().presets.insert(id.into(), template.into());
    }

    /// Id of a group's content set, used to select reference material.
    pub fn set_id(&self, group: &str, kind: ContentKind) -> Option<String> {
        let data = self.lock();
        data.groups
            .iter()
            .find(|g| g.name == group)
            .and_then(|g| g.sets.get(&kind))
            .map(|set| set.id.clone())
    }

    /// Group names in creation order.
    pub fn group_names(&self) -> Vec<String> {
        self.lock().groups.iter().map(|g| g.name.clone()).collect()
    }

    /// One line per group listing the size of each non-empty set.
    pub fn summary(&self) -> String {
        let data = self.lock();
        let mut out = String::new();

        for group in &data.groups {
            let counts: Vec<String> = group
                .sets
                .iter()
                .filter(|(_, set)| !set.items.is_empty())
                .map(|(kind, set)| format!("{} {}", set.items.len(), kind))
                .collect();

            let detail = if counts.is_empty() {
                "empty".to_string()
            } else {
                counts.join(", ")
            };
            out.push_str(&format!("{}: {}\n", group.name, detail));
        }

        out
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NovelData> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl NovelPort for InMemoryNovel {
    fn ensure_group(&self, name: &str) -> bool {
        let mut data = self.lock();
        if data.groups.iter().any(|g| g.name == name) {
            return false;
        }
        debug!("Creating group '{}'", name);
        data.groups.push(Group::new(name));
        true
    }

    fn has_group(&self, name: &str) -> bool {
        self.lock().groups.iter().any(|g| g.name == name)
    }

    fn content_set(&self, group: &str, kind: ContentKind) -> Vec<ContentItem> {
        self.lock()
            .groups
            .iter()
            .find(|g| g.name == group)
            .and_then(|g| g.sets.get(&kind))
            .map(|set| set.items.clone())
            .unwrap_or_default()
    }

    fn replace_content_set(&self, group: &str, kind: ContentKind, items: Vec<ContentItem>) {
        let mut data = self.lock();
        if !data.groups.iter().any(|g| g.name == group) {
            data.groups.push(Group::new(group));
        }
        if let Some(set) = data
            .groups
            .iter_mut()
            .find(|g| g.name == group)
            .and_then(|g| g.sets.get_mut(&kind))
        {
            set.items = items;
        }
    }

    fn reference_text(&self, kind: ContentKind, set_ids: &[String]) -> Option<String> {
        let data = self.lock();
        let mut lines = Vec::new();

        for group in &data.groups {
            for (set_kind, set) in &group.sets {
                if *set_kind != kind || !set_ids.contains(&set.id) {
                    continue;
                }
                for item in &set.items {
                    if item.content.trim().is_empty() {
                        lines.push(item.title.clone());
                    } else {
                        lines.push(format!("{}: {}", item.title, item.content));
                    }
                }
            }
        }

        if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        }
    }

    fn preset(&self, preset_id: &str) -> Option<String> {
        self.lock().presets.get(preset_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_group_never_duplicates() {
        let novel = InMemoryNovel::new();

        assert!(novel.ensure_group("Volume One"));
        assert!(!novel.ensure_group("Volume One"));
        assert_eq!(novel.group_names(), vec!["Volume One".to_string()]);
    }

    #[test]
    fn test_replace_and_read_content_set() {
        let novel = InMemoryNovel::new();
        novel.ensure_group("v1");

        novel.replace_content_set(
            "v1",
            ContentKind::Characters,
            vec![ContentItem::new("Lin", "a swordsman")],
        );

        let items = novel.content_set("v1", ContentKind::Characters);
        assert_eq!(items.len(), 1);
        assert!(novel.content_set("v1", ContentKind::World).is_empty());
        assert!(novel.content_set("missing", ContentKind::World).is_empty());
    }

    #[test]
    fn test_reference_text_resolves_selected_sets() {
        let novel = InMemoryNovel::new();
        novel.ensure_group("v1");
        novel.replace_content_set(
            "v1",
            ContentKind::World,
            vec![
                ContentItem::new("Sky City", "floats above the sea"),
                ContentItem::new("Ashlands", ""),
            ],
        );
        let id = novel.set_id("v1", ContentKind::World).unwrap();

        let text = novel.reference_text(ContentKind::World, &[id]).unwrap();
        assert_eq!(text, "Sky City: floats above the sea\nAshlands");

        assert!(novel
            .reference_text(ContentKind::World, &["unknown".to_string()])
            .is_none());
    }

    #[test]
    fn test_summary_lists_groups() {
        let novel = InMemoryNovel::new();
        novel.ensure_group("v1");
        novel.replace_content_set("v1", ContentKind::Chapters, vec![ContentItem::new("1", "x")]);
        novel.ensure_group("v2");

        assert_eq!(novel.summary(), "v1: 1 chapters\nv2: empty\n");
    }

    #[test]
    fn test_presets() {
        let novel = InMemoryNovel::new();
        novel.add_preset("noir", "Write in a hardboiled voice.");

        assert_eq!(novel.preset("noir").as_deref(), Some("Write in a hardboiled voice."));
        assert!(novel.preset("other").is_none());
    }
}
