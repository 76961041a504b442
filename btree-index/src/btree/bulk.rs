//! Bottom-up bulk loading.

use std::collections::BTreeMap;
use std::fmt::Debug;

use super::node::{Node, NodeId, NodeRange, Slot, TreeNode};
use super::{BTree, BTreeError, Unloaded};

/// Split `total` items into `num` counts that differ by at most one.
///
/// The larger counts are spread evenly rather than bunched at one end.
#[must_use]
pub fn allocate_evenly(total: usize, num: usize) -> Vec<usize> {
    if num == 0 {
        return Vec::new();
    }
    let mut counts = vec![total / num; num];
    let extra = total % num;
    for j in 0..extra {
        counts[(2 * j + 1) * num / (2 * extra)] += 1;
    }
    counts
}

impl<K: Ord + Clone + Debug, V> BTree<K, V> {
    /// Insert every entry of `map`.
    ///
    /// An empty tree is built bottom-up in linear time; otherwise each entry
    /// is inserted in turn.
    pub fn put_all(&mut self, map: BTreeMap<K, V>) -> Result<(), BTreeError> {
        if map.is_empty() {
            return Ok(());
        }
        if self.is_empty() {
            self.build(
                map.into_iter()
                    .map(|(k, v)| (k, Slot::Loaded(v)))
                    .collect(),
            );
            return Ok(());
        }
        for (key, value) in map {
            self.put(key, value)?;
        }
        Ok(())
    }

    /// Rebuild the tree from its own entries, leaving every node as full as
    /// the bulk load makes it.
    ///
    /// # Errors
    ///
    /// Returns `NotLoaded` if any node is a ghost. The tree is unchanged.
    pub fn restructure(&mut self) -> Result<(), BTreeError> {
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            match self.slot(id)? {
                TreeNode::Loaded(node) => stack.extend(node.children.iter()),
                TreeNode::Ghost(ghost) => {
                    return Err(BTreeError::NotLoaded {
                        target: Unloaded::Node(id),
                        range: ghost.range.to_string(),
                    });
                }
            }
        }
        let mut entries = Vec::with_capacity(self.size);
        self.drain(self.root, &mut entries);
        self.build(entries);
        Ok(())
    }

    /// Move every entry under `id` into `out`, in key order.
    fn drain(&mut self, id: NodeId, out: &mut Vec<(K, Slot<V>)>) {
        let Some(Some(TreeNode::Loaded(node))) = self.slots.get_mut(id.0).map(Option::take) else {
            return;
        };
        let mut children = node.children.into_iter();
        for entry in node.entries {
            if let Some(child) = children.next() {
                self.drain(child, out);
            }
            out.push(entry);
        }
        if let Some(child) = children.next() {
            self.drain(child, out);
        }
    }

    /// Replace the whole tree with one built from sorted, unique entries.
    ///
    /// Each level uses the fewest nodes that can hold it; the keys between
    /// neighbouring nodes become the entries of the level above.
    pub(crate) fn build(&mut self, items: Vec<(K, Slot<V>)>) {
        self.clear();
        self.slots.clear();
        let total = items.len();
        let node_max = 2 * self.node_min();

        let mut items = items;
        let mut lower: Option<Vec<NodeId>> = None;
        loop {
            let n = items.len();
            let nodes = (n + node_max) / node_max;
            let mut entries = items.into_iter();
            let mut children = lower.map(Vec::into_iter);
            let mut level = Vec::with_capacity(nodes);
            let mut separators = Vec::with_capacity(nodes - 1);
            let mut lkey = None;

            for count in allocate_evenly(n + 1 - nodes, nodes) {
                let local: Vec<_> = entries.by_ref().take(count).collect();
                let kids: Vec<NodeId> = children
                    .as_mut()
                    .map(|c| c.by_ref().take(count + 1).collect())
                    .unwrap_or_default();
                let separator = entries.next();
                let rkey = separator.as_ref().map(|(k, _)| k.clone());
                let range = NodeRange::new(lkey.take(), rkey.clone());
                level.push(self.alloc(TreeNode::Loaded(Node::with_parts(range, local, kids))));
                lkey = rkey;
                separators.extend(separator);
            }

            if separators.is_empty() {
                if let Some(&root) = level.first() {
                    self.root = root;
                }
                break;
            }
            items = separators;
            lower = Some(level);
        }
        self.size = total;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_evenly_sums_and_spreads() {
        for total in 0..60 {
            for num in 1..12 {
                let counts = allocate_evenly(total, num);
                assert_eq!(counts.len(), num);
                assert_eq!(counts.iter().sum::<usize>(), total);
                let min = counts.iter().min().copied().unwrap_or_default();
                let max = counts.iter().max().copied().unwrap_or_default();
                assert!(max - min <= 1, "{counts:?}");
            }
        }
        assert_eq!(allocate_evenly(7, 4), vec![2, 1, 2, 2]);
        assert_eq!(allocate_evenly(5, 4), vec![1, 1, 2, 1]);
        assert!(allocate_evenly(3, 0).is_empty());
    }

    #[test]
    fn test_bulk_load_matches_single_inserts() {
        for node_min in [2, 3, 4, 8] {
            for n in [0, 1, 2, 3, 7, 8, 9, 31, 100, 257, 1000] {
                let map: BTreeMap<i32, i32> = (0..n).map(|i| (i, -i)).collect();

                let mut bulk = BTree::new(node_min).expect("tree");
                bulk.put_all(map.clone()).expect("put_all");
                bulk.verify().expect("verify bulk");

                let mut single = BTree::new(node_min).expect("tree");
                for (k, v) in &map {
                    single.put(*k, *v).expect("put");
                }

                let a: Vec<_> = bulk.iter().collect::<Result<_, _>>().expect("iter");
                let b: Vec<_> = single.iter().collect::<Result<_, _>>().expect("iter");
                assert_eq!(a, b);
                assert_eq!(bulk.len(), map.len());
            }
        }
    }

    #[test]
    fn test_put_all_into_non_empty_tree() {
        let mut tree = BTree::new(2).expect("tree");
        tree.put(100, 0).expect("put");
        tree.put_all((0..50).map(|i| (i, i)).collect())
            .expect("put_all");
        assert_eq!(tree.len(), 51);
        tree.verify().expect("verify");
    }

    #[test]
    fn test_restructure_keeps_contents() {
        let mut tree = BTree::new(3).expect("tree");
        for i in 0..500 {
            tree.put(i, i).expect("put");
        }
        for i in (0..500).step_by(3) {
            tree.remove(&i).expect("remove");
        }
        let before: Vec<_> = tree
            .keys()
            .map(|k| k.copied())
            .collect::<Result<_, _>>()
            .expect("keys");
        tree.restructure().expect("restructure");
        tree.verify().expect("verify");
        let after: Vec<_> = tree
            .keys()
            .map(|k| k.copied())
            .collect::<Result<_, _>>()
            .expect("keys");
        assert_eq!(before, after);
        assert_eq!(tree.len(), after.len());
    }
}
