//! Structural checks for the node graph.
//!
//! These catch bugs in the tree algorithms, not bad data; a failure here
//! means the tree itself is wrong.

use std::fmt::Debug;
use std::fmt::Write as _;

use super::node::{NodeId, TreeNode};
use super::{BTree, BTreeError};

impl<K: Ord + Clone + Debug, V> BTree<K, V> {
    /// Check every loaded node and the tree size.
    ///
    /// Returns the number of levels, or `None` if every path from the root
    /// ends in a ghost before reaching a leaf.
    pub fn verify(&self) -> Result<Option<usize>, BTreeError> {
        let depth = self.verify_subtree(self.root, true)?;
        let total = self.total_size(self.root)?;
        if total != self.size {
            return Err(BTreeError::Verification(format!(
                "tree size {} but nodes hold {total}",
                self.size
            )));
        }
        Ok(depth)
    }

    fn verify_subtree(&self, id: NodeId, is_root: bool) -> Result<Option<usize>, BTreeError> {
        if self.slot(id)?.is_ghost() {
            return Ok(None);
        }
        self.verify_node(id, is_root)?;
        let node = self.node(id)?;
        let mut depth = None;
        for &child in &node.children {
            if let Some(d) = self.verify_subtree(child, false)? {
                match depth {
                    None => depth = Some(d),
                    Some(expected) if expected != d => {
                        return Err(BTreeError::Verification(format!(
                            "leaves under {id} at depths {expected} and {d}"
                        )));
                    }
                    Some(_) => {}
                }
            }
        }
        if node.is_leaf() {
            return Ok(Some(1));
        }
        Ok(depth.map(|d| d + 1))
    }

    /// Check the shape of a single loaded node against its children.
    ///
    /// Ghost children are checked only for their range.
    pub fn verify_node(&self, id: NodeId, is_root: bool) -> Result<(), BTreeError> {
        let fail = |msg: String| Err(BTreeError::Verification(format!("node {id}: {msg}")));
        let node = self.node(id)?;
        let count = node.entries.len();

        if count > self.ent_max() {
            return fail(format!("{count} entries exceeds {}", self.ent_max()));
        }
        if is_root {
            if count == 0 && !node.is_leaf() {
                return fail("empty internal root".to_string());
            }
            if node.range.lkey.is_some() || node.range.rkey.is_some() {
                return fail(format!("root has bounds {}", node.range));
            }
        } else if count < self.ent_min() {
            return fail(format!("{count} entries below {}", self.ent_min()));
        }

        for pair in node.entries.windows(2) {
            if pair[0].0 >= pair[1].0 {
                return fail(format!("keys {:?} and {:?} out of order", pair[0].0, pair[1].0));
            }
        }
        for (key, _) in &node.entries {
            if !node.range.contains(key) {
                return fail(format!("key {key:?} outside {}", node.range));
            }
        }

        if node.is_leaf() {
            return self.verify_cached_size(id, count);
        }
        if node.children.len() != count + 1 {
            return fail(format!("{} children for {count} entries", node.children.len()));
        }
        let mut total = count;
        for (i, &child) in node.children.iter().enumerate() {
            let expected = node.child_range(i);
            let actual = self.slot(child)?.range();
            if *actual != expected {
                return fail(format!("child {i} covers {actual}, expected {expected}"));
            }
            total += self.total_size(child)?;
        }
        self.verify_cached_size(id, total)
    }

    fn verify_cached_size(&self, id: NodeId, total: usize) -> Result<(), BTreeError> {
        match self.node(id)?.size.get() {
            Some(cached) if cached != total => Err(BTreeError::Verification(format!(
                "node {id}: cached size {cached} but holds {total}"
            ))),
            _ => Ok(()),
        }
    }

    /// Render the tree one node per line, indented by depth.
    #[must_use]
    pub fn to_tree_string(&self) -> String {
        let mut out = String::new();
        let mut stack = vec![(self.root, 0usize)];
        while let Some((id, depth)) = stack.pop() {
            let indent = "  ".repeat(depth);
            match self.slot(id) {
                Ok(TreeNode::Loaded(node)) => {
                    let keys: Vec<&K> = node.entries.iter().map(|(k, _)| k).collect();
                    let _ = writeln!(out, "{indent}{} {keys:?}", node.range);
                    stack.extend(node.children.iter().rev().map(|&c| (c, depth + 1)));
                }
                Ok(TreeNode::Ghost(ghost)) => {
                    let _ = writeln!(
                        out,
                        "{indent}{} ghost of {} at {}",
                        ghost.range, ghost.size, ghost.location
                    );
                }
                Err(err) => {
                    let _ = writeln!(out, "{indent}{err}");
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::Slot;

    #[test]
    fn test_verify_catches_unordered_keys() {
        let mut tree = BTree::new(2).expect("tree");
        tree.put(1, ()).expect("put");
        tree.put(2, ()).expect("put");
        tree.node_mut(tree.root()).expect("root").entries.swap(0, 1);
        assert!(matches!(tree.verify(), Err(BTreeError::Verification(_))));
    }

    #[test]
    fn test_verify_catches_overfull_node() {
        let mut tree = BTree::new(2).expect("tree");
        for i in 0..3 {
            tree.put(i, ()).expect("put");
        }
        tree.node_mut(tree.root())
            .expect("root")
            .entries
            .push((10, Slot::Loaded(())));
        tree.size += 1;
        assert!(matches!(tree.verify(), Err(BTreeError::Verification(_))));
    }

    #[test]
    fn test_verify_catches_size_mismatch() {
        let mut tree = BTree::new(2).expect("tree");
        tree.put(1, ()).expect("put");
        tree.size = 5;
        assert!(matches!(tree.verify(), Err(BTreeError::Verification(_))));
    }

    #[test]
    fn test_tree_string_lists_every_node() {
        let mut tree = BTree::new(2).expect("tree");
        for i in 1..=7 {
            tree.put(i, ()).expect("put");
        }
        let rendered = tree.to_tree_string();
        assert_eq!(rendered.lines().count(), 4);
        assert!(rendered.starts_with("(*, *) [2, 4]"));
    }
}
