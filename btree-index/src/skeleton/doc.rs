//! Documents exchanged with the node serializer.
//!
//! A bare node becomes a [`NodeDoc`]: its bounds, its keys with the
//! locations of their values, and for an internal node the location and
//! size of every child. The root travels inside a [`TreeDoc`] that also
//! records the order and total size.

use std::fmt::Debug;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{SkeletonBTree, SkeletonError};
use crate::btree::{BTree, Ghost, Node, NodeId, NodeRange, Slot, TreeNode};
use crate::serial::Location;

/// Serialized form of a bare node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDoc<K> {
    pub lkey: Option<K>,
    pub rkey: Option<K>,
    /// Keys with the locations of their values.
    pub entries: Vec<(K, Location)>,
    /// Location and subtree size of each child; `None` for a leaf.
    pub subnodes: Option<Vec<(Location, usize)>>,
}

impl<K: Clone> NodeDoc<K> {
    #[must_use]
    pub fn range(&self) -> NodeRange<K> {
        NodeRange::new(self.lkey.clone(), self.rkey.clone())
    }
}

impl<K> NodeDoc<K> {
    /// Entries in the subtree this document describes.
    #[must_use]
    pub fn total_size(&self) -> usize {
        self.entries.len()
            + self
                .subnodes
                .iter()
                .flatten()
                .map(|(_, size)| size)
                .sum::<usize>()
    }
}

/// Serialized form of a whole bare tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeDoc<K> {
    pub node_min: usize,
    pub size: usize,
    pub root: NodeDoc<K>,
}

impl<K: Ord + Clone + Debug, V> SkeletonBTree<K, V> {
    /// Document for bare node `id`.
    ///
    /// # Errors
    ///
    /// Returns `IllegalState` if the node has a loaded child or value.
    pub fn node_doc(&self, id: NodeId) -> Result<NodeDoc<K>, SkeletonError> {
        let node = self.tree.node(id)?;
        let not_bare = || SkeletonError::IllegalState(format!("node {} is not bare", node.range()));

        let mut entries = Vec::with_capacity(node.entries().len());
        for (key, slot) in node.entries() {
            match slot {
                Slot::Ghost(location) => entries.push((key.clone(), location.clone())),
                Slot::Loaded(_) => return Err(not_bare()),
            }
        }
        let subnodes = if node.is_leaf() {
            None
        } else {
            let mut subnodes = Vec::with_capacity(node.children().len());
            for &child in node.children() {
                match self.tree.slot(child)? {
                    TreeNode::Ghost(ghost) => subnodes.push((ghost.location().clone(), ghost.size())),
                    TreeNode::Loaded(_) => return Err(not_bare()),
                }
            }
            Some(subnodes)
        };
        Ok(NodeDoc {
            lkey: node.range().lkey.clone(),
            rkey: node.range().rkey.clone(),
            entries,
            subnodes,
        })
    }

    /// Document for the whole tree, whose root must be bare.
    pub fn tree_doc(&self) -> Result<TreeDoc<K>, SkeletonError> {
        Ok(TreeDoc {
            node_min: self.tree.node_min(),
            size: self.tree.len(),
            root: self.node_doc(self.tree.root())?,
        })
    }

    /// Rebuild a bare tree from its document.
    ///
    /// # Errors
    ///
    /// Returns `DataFormat` if the root is bounded, malformed, or its
    /// subtree sizes disagree with the recorded size.
    pub fn from_tree_doc(doc: TreeDoc<K>) -> Result<Self, SkeletonError> {
        let mut skeleton = Self::new(doc.node_min)?;
        if doc.root.lkey.is_some() || doc.root.rkey.is_some() {
            return Err(SkeletonError::DataFormat(format!(
                "root document has bounds {}",
                doc.root.range()
            )));
        }
        if doc.root.total_size() != doc.size {
            return Err(SkeletonError::DataFormat(format!(
                "tree document records {} entries but its root holds {}",
                doc.size,
                doc.root.total_size()
            )));
        }
        let root = materialize(&mut skeleton.tree, doc.root)?;
        let id = skeleton.tree.root();
        skeleton.tree.replace(id, TreeNode::Loaded(root))?;
        skeleton.tree.size = doc.size;
        skeleton
            .tree
            .verify_node(id, true)
            .map_err(|e| SkeletonError::DataFormat(e.to_string()))?;
        Ok(skeleton)
    }

    /// Replace ghost `id` with the node described by `doc`.
    ///
    /// The document must report exactly the ghost's bounds and size. Its
    /// children arrive as ghosts, its values unloaded.
    pub(crate) fn attach(&mut self, id: NodeId, doc: NodeDoc<K>) -> Result<(), SkeletonError> {
        let ghost = self.tree.ghost(id)?.clone();
        if doc.lkey != ghost.range().lkey || doc.rkey != ghost.range().rkey {
            return Err(SkeletonError::DataFormat(format!(
                "node at {} has bounds {}, expected {}",
                ghost.location(),
                doc.range(),
                ghost.range()
            )));
        }
        if doc.total_size() != ghost.size() {
            return Err(SkeletonError::DataFormat(format!(
                "node at {} holds {} entries, expected {}",
                ghost.location(),
                doc.total_size(),
                ghost.size()
            )));
        }

        let node = materialize(&mut self.tree, doc)?;
        self.tree.replace(id, TreeNode::Loaded(node))?;
        if let Err(err) = self.tree.verify_node(id, false) {
            let location = ghost.location().clone();
            if let TreeNode::Loaded(node) = self.tree.replace(id, TreeNode::Ghost(ghost))? {
                for &child in node.children() {
                    self.tree.release(child)?;
                }
            }
            return Err(SkeletonError::DataFormat(format!("node at {location}: {err}")));
        }
        debug!(node = %id, "attached node");
        Ok(())
    }
}

/// Build a node from `doc`, allocating a ghost for every child.
fn materialize<K: Clone, V>(
    tree: &mut BTree<K, V>,
    doc: NodeDoc<K>,
) -> Result<Node<K, V>, SkeletonError> {
    let range = NodeRange::new(doc.lkey, doc.rkey);
    let entries: Vec<(K, Slot<V>)> = doc
        .entries
        .into_iter()
        .map(|(key, location)| (key, Slot::Ghost(location)))
        .collect();
    let mut node = Node::with_parts(range, entries, Vec::new());

    if let Some(subnodes) = doc.subnodes {
        if subnodes.len() != node.entries().len() + 1 {
            return Err(SkeletonError::DataFormat(format!(
                "{} subnodes for {} entries",
                subnodes.len(),
                node.entries().len()
            )));
        }
        let ghosts: Vec<Ghost<K>> = subnodes
            .into_iter()
            .enumerate()
            .map(|(i, (location, size))| Ghost {
                range: node.child_range(i),
                size,
                location,
            })
            .collect();
        node.children = ghosts
            .into_iter()
            .map(|ghost| tree.alloc(TreeNode::Ghost(ghost)))
            .collect();
    }
    Ok(node)
}
