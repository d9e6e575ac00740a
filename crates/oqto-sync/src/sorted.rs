//! Binary search and insertion over vectors kept in ascending id order.
//!
//! Callers must keep the vector sorted by [`Keyed::key`]; nothing here checks
//! it. Lookups are O(log n), inserts and removals O(n) for the shift.

use oqto_sync_protocol::{Message, Part, Session, Todo};

/// Anything stored in a sorted collection.
pub trait Keyed {
    fn key(&self) -> &str;
}

impl Keyed for Session {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Keyed for Message {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Keyed for Part {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Keyed for Todo {
    fn key(&self) -> &str {
        &self.id
    }
}

/// Result of [`search`]. When `found` is false, `index` is the insertion
/// point that keeps the collection sorted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Search {
    pub found: bool,
    pub index: usize,
}

/// What [`upsert`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted(usize),
    Replaced(usize),
    /// An equal element was already there; nothing was written.
    Unchanged(usize),
}

impl Upsert {
    pub fn changed(self) -> bool {
        !matches!(self, Self::Unchanged(_))
    }
}

pub fn search<T: Keyed>(items: &[T], id: &str) -> Search {
    match items.binary_search_by(|item| item.key().cmp(id)) {
        Ok(index) => Search { found: true, index },
        Err(index) => Search {
            found: false,
            index,
        },
    }
}

/// Return a new vector with `item` at its insertion point. The input is left
/// untouched; an existing element with the same key is kept alongside.
pub fn insert<T: Keyed + Clone>(items: &[T], item: T) -> Vec<T> {
    let at = search(items, item.key()).index;
    let mut out = Vec::with_capacity(items.len() + 1);
    out.extend_from_slice(&items[..at]);
    out.push(item);
    out.extend_from_slice(&items[at..]);
    out
}

/// Replace the element with the same key, or insert at the insertion point.
pub fn upsert<T: Keyed + PartialEq>(items: &mut Vec<T>, item: T) -> Upsert {
    let hit = search(items, item.key());
    if hit.found {
        if items[hit.index] == item {
            return Upsert::Unchanged(hit.index);
        }
        items[hit.index] = item;
        Upsert::Replaced(hit.index)
    } else {
        items.insert(hit.index, item);
        Upsert::Inserted(hit.index)
    }
}

/// Whether `upsert` would change anything. Lets callers skip copy-on-write
/// clones for duplicate deliveries.
pub fn would_change<T: Keyed + PartialEq>(items: &[T], item: &T) -> bool {
    let hit = search(items, item.key());
    !hit.found || items[hit.index] != *item
}

pub fn get<'a, T: Keyed>(items: &'a [T], id: &str) -> Option<&'a T> {
    let hit = search(items, id);
    hit.found.then(|| &items[hit.index])
}

/// Remove the element with `id`, returning it if present.
pub fn remove<T: Keyed>(items: &mut Vec<T>, id: &str) -> Option<T> {
    let hit = search(items, id);
    hit.found.then(|| items.remove(hit.index))
}

/// Sort by key and drop duplicate keys, keeping the last occurrence.
pub fn sorted_unique<T: Keyed>(mut items: Vec<T>) -> Vec<T> {
    // Stable sort keeps arrival order within equal keys, so reversing first
    // makes dedup keep the latest one.
    items.reverse();
    items.sort_by(|a, b| a.key().cmp(b.key()));
    items.dedup_by(|a, b| a.key() == b.key());
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        id: String,
        value: u32,
    }

    impl Keyed for Item {
        fn key(&self) -> &str {
            &self.id
        }
    }

    fn item(id: &str, value: u32) -> Item {
        Item {
            id: id.to_string(),
            value,
        }
    }

    fn ids(items: &[Item]) -> Vec<&str> {
        items.iter().map(|i| i.id.as_str()).collect()
    }

    fn is_sorted(items: &[Item]) -> bool {
        items.windows(2).all(|w| w[0].id <= w[1].id)
    }

    #[test]
    fn test_search_found_and_insertion_points() {
        let items = vec![item("b", 0), item("d", 0), item("f", 0)];
        assert_eq!(
            search(&items, "d"),
            Search {
                found: true,
                index: 1
            }
        );
        assert_eq!(
            search(&items, "a"),
            Search {
                found: false,
                index: 0
            }
        );
        assert_eq!(
            search(&items, "e"),
            Search {
                found: false,
                index: 2
            }
        );
        assert_eq!(
            search(&items, "z"),
            Search {
                found: false,
                index: 3
            }
        );
        assert_eq!(
            search::<Item>(&[], "a"),
            Search {
                found: false,
                index: 0
            }
        );
    }

    #[test]
    fn test_search_agrees_with_linear_scan() {
        let items: Vec<Item> = ["a1", "a3", "b0", "b2", "c9", "d"]
            .iter()
            .map(|id| item(id, 0))
            .collect();
        for probe in ["a0", "a1", "a2", "a3", "b", "b0", "b1", "b2", "c", "c9", "d", "e"] {
            let hit = search(&items, probe);
            match items.iter().position(|i| i.id == probe) {
                Some(i) => assert_eq!(hit, Search { found: true, index: i }),
                None => {
                    assert!(!hit.found);
                    let mut copy = items.clone();
                    copy.insert(hit.index, item(probe, 0));
                    assert!(is_sorted(&copy), "inserting {probe} at {}", hit.index);
                }
            }
        }
    }

    #[test]
    fn test_insert_is_immutable_and_sorted() {
        let mut items: Vec<Item> = Vec::new();
        for id in ["m", "c", "x", "a", "q", "c2", "b"] {
            let next = insert(&items, item(id, 0));
            assert_eq!(next.len(), items.len() + 1);
            assert!(is_sorted(&next));
            items = next;
        }
        assert_eq!(ids(&items), vec!["a", "b", "c", "c2", "m", "q", "x"]);
    }

    #[test]
    fn test_upsert_replaces_or_inserts_never_both() {
        let mut items = vec![item("a", 1), item("c", 1)];
        assert_eq!(upsert(&mut items, item("b", 1)), Upsert::Inserted(1));
        assert_eq!(upsert(&mut items, item("b", 2)), Upsert::Replaced(1));
        assert_eq!(upsert(&mut items, item("b", 2)), Upsert::Unchanged(1));
        assert_eq!(ids(&items), vec!["a", "b", "c"]);
        assert_eq!(items[1].value, 2);
        assert!(!Upsert::Unchanged(0).changed());
    }

    #[test]
    fn test_would_change() {
        let items = vec![item("a", 1)];
        assert!(!would_change(&items, &item("a", 1)));
        assert!(would_change(&items, &item("a", 2)));
        assert!(would_change(&items, &item("b", 1)));
    }

    #[test]
    fn test_get_and_remove() {
        let mut items = vec![item("a", 1), item("b", 2)];
        assert_eq!(get(&items, "b").map(|i| i.value), Some(2));
        assert!(get(&items, "c").is_none());
        assert_eq!(remove(&mut items, "a").map(|i| i.id), Some("a".to_string()));
        assert!(remove(&mut items, "a").is_none());
        assert_eq!(ids(&items), vec!["b"]);
    }

    #[test]
    fn test_sorted_unique_keeps_latest() {
        let items = sorted_unique(vec![item("b", 1), item("a", 1), item("b", 2)]);
        assert_eq!(ids(&items), vec!["a", "b"]);
        assert_eq!(items[1].value, 2);
    }
}
