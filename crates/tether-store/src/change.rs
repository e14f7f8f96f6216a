//! Typed change records and the keyed list diff that produces them.

use std::collections::HashSet;
use std::hash::Hash;

/// One mutation of an observed ordered collection.
///
/// Indices refer to the collection as it stands when the record is applied,
/// so a list of records must be applied in order. `Move` carries the item's
/// new value and replaces it at the destination.
#[derive(Debug, Clone, PartialEq)]
pub enum ListChange<T> {
    Insert { item: T, index: usize },
    Move { item: T, from: usize, to: usize },
    Update { item: T, index: usize },
    Remove { item: T, index: usize },
}

impl<T> ListChange<T> {
    pub fn item(&self) -> &T {
        match self {
            ListChange::Insert { item, .. }
            | ListChange::Move { item, .. }
            | ListChange::Update { item, .. }
            | ListChange::Remove { item, .. } => item,
        }
    }

    pub fn is_insertion(&self) -> bool {
        matches!(self, ListChange::Insert { .. })
    }

    pub fn is_removal(&self) -> bool {
        matches!(self, ListChange::Remove { .. })
    }
}

/// One mutation of an observed single entity.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityChange<T> {
    Create(T),
    Update(T),
    Remove(T),
}

impl<T> EntityChange<T> {
    pub fn item(&self) -> &T {
        match self {
            EntityChange::Create(item) | EntityChange::Update(item) | EntityChange::Remove(item) => {
                item
            }
        }
    }
}

/// Apply `changes` in order to `items`.
pub fn apply_changes<T: Clone>(items: &mut Vec<T>, changes: &[ListChange<T>]) {
    for change in changes {
        match change {
            ListChange::Insert { item, index } => {
                let index = (*index).min(items.len());
                items.insert(index, item.clone());
            }
            ListChange::Remove { index, .. } => {
                if *index < items.len() {
                    items.remove(*index);
                }
            }
            ListChange::Update { item, index } => {
                if let Some(slot) = items.get_mut(*index) {
                    *slot = item.clone();
                }
            }
            ListChange::Move { item, from, to } => {
                if *from < items.len() {
                    items.remove(*from);
                    let to = (*to).min(items.len());
                    items.insert(to, item.clone());
                }
            }
        }
    }
}

/// Diff two keyed snapshots.
///
/// Keys must be unique within each snapshot. Removals come first, in
/// descending index order; then one forward pass places every target
/// element, emitting a move for a kept element found further down, an
/// insert for a new one and an update when the value changed in place.
pub fn diff<K, T>(old: &[(K, T)], new: &[(K, T)]) -> Vec<ListChange<T>>
where
    K: Eq + Hash + Clone,
    T: Clone + PartialEq,
{
    let mut changes = Vec::new();
    let new_keys: HashSet<&K> = new.iter().map(|(k, _)| k).collect();

    for (index, (key, item)) in old.iter().enumerate().rev() {
        if !new_keys.contains(key) {
            changes.push(ListChange::Remove {
                item: item.clone(),
                index,
            });
        }
    }

    let mut working: Vec<(&K, &T)> = old
        .iter()
        .filter(|(k, _)| new_keys.contains(k))
        .map(|(k, t)| (k, t))
        .collect();

    for (index, (key, item)) in new.iter().enumerate() {
        if working.get(index).map(|(k, _)| *k == key).unwrap_or(false) {
            if working[index].1 != item {
                changes.push(ListChange::Update {
                    item: item.clone(),
                    index,
                });
                working[index].1 = item;
            }
            continue;
        }

        match working[index.min(working.len())..]
            .iter()
            .position(|(k, _)| *k == key)
        {
            Some(offset) => {
                let from = index + offset;
                working.remove(from);
                working.insert(index, (key, item));
                changes.push(ListChange::Move {
                    item: item.clone(),
                    from,
                    to: index,
                });
            }
            None => {
                working.insert(index, (key, item));
                changes.push(ListChange::Insert {
                    item: item.clone(),
                    index,
                });
            }
        }
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyed(items: &[(&'static str, u32)]) -> Vec<(&'static str, u32)> {
        items.to_vec()
    }

    fn values(items: &[(&'static str, u32)]) -> Vec<u32> {
        items.iter().map(|(_, v)| *v).collect()
    }

    fn assert_round_trip(old: &[(&'static str, u32)], new: &[(&'static str, u32)]) -> Vec<ListChange<u32>> {
        let changes = diff(old, new);
        let mut applied = values(old);
        apply_changes(&mut applied, &changes);
        assert_eq!(applied, values(new), "changes: {changes:?}");
        changes
    }

    #[test]
    fn test_identical_snapshots_produce_nothing() {
        let items = keyed(&[("a", 1), ("b", 2)]);
        assert!(diff(&items, &items).is_empty());
    }

    #[test]
    fn test_insert_update_remove() {
        let old = keyed(&[("a", 1), ("b", 2), ("c", 3)]);
        let new = keyed(&[("a", 1), ("b", 20), ("d", 4)]);
        let changes = assert_round_trip(&old, &new);
        assert_eq!(
            changes,
            vec![
                ListChange::Remove { item: 3, index: 2 },
                ListChange::Update { item: 20, index: 1 },
                ListChange::Insert { item: 4, index: 2 },
            ]
        );
    }

    #[test]
    fn test_move_carries_new_value() {
        let old = keyed(&[("a", 1), ("b", 2), ("c", 3)]);
        let new = keyed(&[("c", 30), ("a", 1), ("b", 2)]);
        let changes = assert_round_trip(&old, &new);
        assert_eq!(
            changes,
            vec![ListChange::Move {
                item: 30,
                from: 2,
                to: 0
            }]
        );
    }

    #[test]
    fn test_removals_are_descending() {
        let old = keyed(&[("a", 1), ("b", 2), ("c", 3), ("d", 4)]);
        let new = keyed(&[("b", 2)]);
        let changes = assert_round_trip(&old, &new);
        let indexes: Vec<usize> = changes
            .iter()
            .map(|c| match c {
                ListChange::Remove { index, .. } => *index,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(indexes, vec![3, 2, 0]);
    }

    #[test]
    fn test_mixed_sequences_round_trip() {
        let cases: Vec<(Vec<(&'static str, u32)>, Vec<(&'static str, u32)>)> = vec![
            (keyed(&[]), keyed(&[("a", 1), ("b", 2)])),
            (keyed(&[("a", 1), ("b", 2)]), keyed(&[])),
            (
                keyed(&[("a", 1), ("b", 2), ("c", 3), ("d", 4)]),
                keyed(&[("d", 4), ("c", 3), ("b", 2), ("a", 1)]),
            ),
            (
                keyed(&[("a", 1), ("b", 2), ("c", 3), ("d", 4), ("e", 5)]),
                keyed(&[("x", 9), ("e", 50), ("b", 2), ("y", 8), ("a", 10)]),
            ),
            (
                keyed(&[("a", 1), ("b", 2), ("c", 3)]),
                keyed(&[("b", 2), ("c", 3), ("a", 1)]),
            ),
        ];
        for (old, new) in cases {
            assert_round_trip(&old, &new);
        }
    }

    #[test]
    fn test_entity_change_item() {
        assert_eq!(*EntityChange::Update(5).item(), 5);
        assert!(ListChange::Insert { item: 1, index: 0 }.is_insertion());
        assert!(ListChange::Remove { item: 1, index: 0 }.is_removal());
    }
}
