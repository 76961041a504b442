//! In-order traversal.
//!
//! All iterators stop after yielding their first error, which is how a
//! traversal reports that it reached a ghost.

use std::fmt::Debug;

use super::node::{NodeId, Slot};
use super::{BTree, BTreeError, Unloaded};

/// In-order traversal of `(key, slot)` pairs.
///
/// Does not require values to be loaded; fails only on ghost nodes.
pub struct Entries<'a, K, V> {
    tree: &'a BTree<K, V>,
    /// (node, index of the next entry to yield)
    stack: Vec<(NodeId, usize)>,
    started: bool,
    failed: bool,
}

impl<'a, K: Ord + Clone + Debug, V> Entries<'a, K, V> {
    fn descend(&mut self, mut id: NodeId) -> Result<(), BTreeError> {
        let tree = self.tree;
        loop {
            let node = tree.node(id)?;
            self.stack.push((id, 0));
            match node.children.first() {
                Some(&child) => id = child,
                None => return Ok(()),
            }
        }
    }

    /// Next entry together with the node holding it.
    fn advance(&mut self) -> Option<Result<(NodeId, &'a K, &'a Slot<V>), BTreeError>> {
        if self.failed {
            return None;
        }
        let tree = self.tree;
        if !self.started {
            self.started = true;
            if let Err(err) = self.descend(tree.root) {
                self.failed = true;
                return Some(Err(err));
            }
        }
        loop {
            let (id, i) = *self.stack.last()?;
            let node = match tree.node(id) {
                Ok(node) => node,
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            };
            let Some((key, slot)) = node.entries.get(i) else {
                self.stack.pop();
                continue;
            };
            if let Some(top) = self.stack.last_mut() {
                top.1 += 1;
            }
            if let Some(&child) = node.children.get(i + 1) {
                if let Err(err) = self.descend(child) {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
            return Some(Ok((id, key, slot)));
        }
    }
}

impl<'a, K: Ord + Clone + Debug, V> Iterator for Entries<'a, K, V> {
    type Item = Result<(&'a K, &'a Slot<V>), BTreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.advance()
            .map(|entry| entry.map(|(_, key, slot)| (key, slot)))
    }
}

/// In-order traversal of `(key, value)`; fails on ghost values too.
pub struct Iter<'a, K, V> {
    entries: Entries<'a, K, V>,
    failed: bool,
}

impl<'a, K: Ord + Clone + Debug, V> Iterator for Iter<'a, K, V> {
    type Item = Result<(&'a K, &'a V), BTreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let item = match self.entries.advance()? {
            Ok((_, key, Slot::Loaded(value))) => Ok((key, value)),
            Ok((id, _, Slot::Ghost(_))) => Err(BTreeError::NotLoaded {
                target: Unloaded::Values(id),
                range: self
                    .entries
                    .tree
                    .slot(id)
                    .map(|node| node.range().to_string())
                    .unwrap_or_default(),
            }),
            Err(err) => Err(err),
        };
        self.failed = item.is_err();
        Some(item)
    }
}

/// In-order traversal of keys.
pub struct Keys<'a, K, V> {
    entries: Entries<'a, K, V>,
}

impl<'a, K: Ord + Clone + Debug, V> Iterator for Keys<'a, K, V> {
    type Item = Result<&'a K, BTreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next().map(|entry| entry.map(|(key, _)| key))
    }
}

impl<K: Ord + Clone + Debug, V> BTree<K, V> {
    /// Traverse `(key, slot)` pairs in key order.
    #[must_use]
    pub const fn entries(&self) -> Entries<'_, K, V> {
        Entries {
            tree: self,
            stack: Vec::new(),
            started: false,
            failed: false,
        }
    }

    /// Traverse `(key, value)` pairs in key order.
    #[must_use]
    pub const fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            entries: self.entries(),
            failed: false,
        }
    }

    /// Traverse keys in key order. Values need not be loaded.
    #[must_use]
    pub const fn keys(&self) -> Keys<'_, K, V> {
        Keys {
            entries: self.entries(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::{Ghost, NodeRange, TreeNode};
    use crate::serial::Location;

    #[test]
    fn test_iteration_is_sorted() {
        let mut tree = BTree::new(2).expect("tree");
        for i in [8, 3, 5, 1, 9, 2, 7, 4, 6, 0] {
            tree.put(i, i * i).expect("put");
        }
        let pairs: Vec<(i32, i32)> = tree
            .iter()
            .map(|e| e.map(|(k, v)| (*k, *v)))
            .collect::<Result<_, _>>()
            .expect("iter");
        assert_eq!(pairs, (0..10).map(|i| (i, i * i)).collect::<Vec<_>>());
    }

    #[test]
    fn test_iteration_stops_at_ghost() {
        let mut tree = BTree::new(2).expect("tree");
        for i in 0..10 {
            tree.put(i, i).expect("put");
        }
        let root = tree.node(tree.root()).expect("root");
        let last = *root.children().last().expect("internal root");
        let range: NodeRange<i32> = tree.slot(last).expect("slot").range().clone();
        let size = tree.total_size(last).expect("size");
        tree.replace(
            last,
            TreeNode::Ghost(Ghost {
                range,
                size,
                location: Location::at("mem:0"),
            }),
        )
        .expect("replace");

        let mut keys = tree.keys();
        let mut seen = Vec::new();
        let mut errors = 0;
        for item in keys.by_ref() {
            match item {
                Ok(k) => seen.push(*k),
                Err(err) => {
                    assert!(err.is_not_loaded());
                    errors += 1;
                }
            }
        }
        assert_eq!(errors, 1);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert!(keys.next().is_none());
        assert_eq!(tree.len(), 10);
    }
}
