//! Output Merging
//!
//! Folds freshly generated entries into a node's outputs and into the
//! novel's content sets. Entries are matched by title: a match is updated
//! in place, anything else is appended.

use crate::ports::novel::ContentItem;
use crate::text::numerals::leading_index;
use crate::workflow::model::OutputEntry;

fn key(title: &str) -> Option<&str> {
    Some(title.trim()).filter(|t| !t.is_empty())
}

/// Merges generated entries into a node's output list.
///
/// Returns the number of entries that were appended.
pub fn merge_output_entries(existing: &mut Vec<OutputEntry>, incoming: Vec<OutputEntry>) -> usize {
    let mut appended = 0;

    for entry in incoming {
        let slot = key(&entry.title).and_then(|title| {
            existing
                .iter_mut()
                .find(|e| key(&e.title) == Some(title))
        });

        match slot {
            Some(current) => current.content = entry.content,
            None => {
                existing.push(entry);
                appended += 1;
            }
        }
    }

    appended
}

/// Merges generated entries into a content set.
///
/// Ordered sets are re-sorted by the index their titles start with;
/// untitled or unnumbered items keep their relative order after the
/// numbered ones.
pub fn merge_into_set(
    mut items: Vec<ContentItem>,
    incoming: &[OutputEntry],
    ordered: bool,
) -> Vec<ContentItem> {
    for entry in incoming.iter().filter(|e| !e.is_blank()) {
        let slot = key(&entry.title)
            .and_then(|title| items.iter_mut().find(|item| key(&item.title) == Some(title)));

        match slot {
            Some(item) => item.content = entry.content.clone(),
            None => items.push(ContentItem::new(entry.title.trim(), entry.content.clone())),
        }
    }

    if ordered {
        // stable: equal keys keep insertion order
        items.sort_by_key(|item| match leading_index(&item.title) {
            Some(index) => (0, index),
            None => (1, 0),
        });
    }

    items
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_output_updates_by_title() {
        let mut existing = vec![OutputEntry::new("Chapter 1", "draft")];
        let original_id = existing[0].id.clone();

        let appended = merge_output_entries(
            &mut existing,
            vec![
                OutputEntry::new("Chapter 1", "final"),
                OutputEntry::new("Chapter 2", "new"),
                OutputEntry::new("", "untitled"),
            ],
        );

        assert_eq!(appended, 2);
        assert_eq!(existing.len(), 3);
        assert_eq!(existing[0].content, "final");
        assert_eq!(existing[0].id, original_id);
    }

    #[test]
    fn test_untitled_entries_always_append() {
        let mut existing = vec![OutputEntry::new("", "a")];
        merge_output_entries(&mut existing, vec![OutputEntry::new("  ", "b")]);
        assert_eq!(existing.len(), 2);
    }

    #[test]
    fn test_merge_into_ordered_set_sorts_by_index() {
        let items = vec![
            ContentItem::new("Chapter 2", "two"),
            ContentItem::new("Notes", "misc"),
        ];
        let incoming = vec![
            OutputEntry::new("Chapter 10", "ten"),
            OutputEntry::new("Chapter 1", "one"),
            OutputEntry::new("Chapter 2", "two, revised"),
        ];

        let merged = merge_into_set(items, &incoming, true);
        let titles: Vec<&str> = merged.iter().map(|i| i.title.as_str()).collect();

        assert_eq!(titles, vec!["Chapter 1", "Chapter 2", "Chapter 10", "Notes"]);
        assert_eq!(merged[1].content, "two, revised");
    }

    #[test]
    fn test_merge_into_unordered_set_keeps_insertion_order() {
        let items = vec![ContentItem::new("Zed", "z")];
        let incoming = vec![OutputEntry::new("Amy", "a"), OutputEntry::new("", "")];

        let merged = merge_into_set(items, &incoming, false);
        let titles: Vec<&str> = merged.iter().map(|i| i.title.as_str()).collect();

        assert_eq!(titles, vec!["Zed", "Amy"]);
    }
}
