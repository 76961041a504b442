//! B-tree whose subtrees and values can be moved out to a backing store.
//!
//! A [`SkeletonBTree`] wraps a [`BTree`] together with two serializers: one
//! for nodes and one for values. Deflating replaces loaded subtrees with
//! ghosts after pushing them; inflating pulls ghosts back and attaches
//! them in place.
//!
//! # Liveness
//!
//! - A node is *live* when nothing under it is a ghost and all its values
//!   are loaded
//! - A node is *bare* when every child is a ghost and none of its values
//!   are loaded
//!
//! A full deflate leaves the root bare; a full inflate leaves it live.
//!
//! # Automatic Loading
//!
//! `get`, `contains_key`, `put` and `remove` load whatever ghost blocks
//! them and retry. Serializer failures are returned to the caller; a
//! retryable one can simply be retried.

mod doc;
mod load;
mod schedule;

use std::fmt::Debug;

use crate::btree::{BTree, BTreeError, NodeId, NodeRange, TreeNode, Unloaded};
use crate::serial::{Serializer, TaskError};

pub use doc::{NodeDoc, TreeDoc};

/// Serializer for node documents, keyed by node range.
pub type NodeSerializer<K> = Box<dyn Serializer<NodeRange<K>, NodeDoc<K>> + Send>;

/// Serializer for values, keyed by entry key.
pub type ValueSerializer<K, V> = Box<dyn Serializer<K, V> + Send>;

/// Errors from skeleton tree operations.
#[derive(Debug)]
pub enum SkeletonError {
    /// The underlying tree failed.
    Tree(BTreeError),
    /// A serializer failed.
    Task(TaskError),
    /// Loaded data does not fit where it was loaded.
    DataFormat(String),
    /// The operation is not allowed in the tree's current state.
    IllegalState(String),
}

impl SkeletonError {
    /// Whether retrying the failed operation may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Task(err) => err.is_retryable(),
            _ => false,
        }
    }
}

impl std::fmt::Display for SkeletonError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tree(err) => write!(f, "{err}"),
            Self::Task(err) => write!(f, "{err}"),
            Self::DataFormat(msg) => write!(f, "data format error: {msg}"),
            Self::IllegalState(msg) => write!(f, "illegal state: {msg}"),
        }
    }
}

impl std::error::Error for SkeletonError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Tree(err) => Some(err),
            Self::Task(err) => Some(err),
            Self::DataFormat(_) | Self::IllegalState(_) => None,
        }
    }
}

impl From<BTreeError> for SkeletonError {
    fn from(err: BTreeError) -> Self {
        Self::Tree(err)
    }
}

impl From<TaskError> for SkeletonError {
    fn from(err: TaskError) -> Self {
        Self::Task(err)
    }
}

/// A B-tree map that loads and stores parts of itself on demand.
pub struct SkeletonBTree<K, V> {
    pub(crate) tree: BTree<K, V>,
    pub(crate) nodes: Option<NodeSerializer<K>>,
    pub(crate) values: Option<ValueSerializer<K, V>>,
    /// Tree-wide metadata passed to every serializer call.
    pub(crate) meta: Option<String>,
}

impl<K, V> SkeletonBTree<K, V> {
    /// Create an empty, live tree without serializers.
    ///
    /// # Errors
    ///
    /// Returns an error if `node_min < 2`.
    pub fn new(node_min: usize) -> Result<Self, SkeletonError> {
        Ok(Self {
            tree: BTree::new(node_min)?,
            nodes: None,
            values: None,
            meta: None,
        })
    }

    /// Attach tree-wide metadata that identifies this tree to its serializers.
    #[must_use]
    pub fn with_meta(mut self, meta: impl Into<String>) -> Self {
        self.meta = Some(meta.into());
        self
    }

    #[must_use]
    pub fn meta(&self) -> Option<&str> {
        self.meta.as_deref()
    }

    #[must_use]
    pub const fn tree(&self) -> &BTree<K, V> {
        &self.tree
    }

    /// Direct access to the tree, bypassing automatic loading.
    pub const fn tree_mut(&mut self) -> &mut BTree<K, V> {
        &mut self.tree
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.tree.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Whether node `id` is live: no ghost anywhere below it and every value
    /// loaded.
    #[must_use]
    pub fn is_node_live(&self, id: NodeId) -> bool {
        match self.tree.slot(id) {
            Ok(TreeNode::Loaded(node)) => {
                node.entries().iter().all(|(_, slot)| slot.is_loaded())
                    && node.children().iter().all(|&child| self.is_node_live(child))
            }
            _ => false,
        }
    }

    /// Whether node `id` is bare: every child a ghost and no value loaded.
    ///
    /// A ghost is trivially bare.
    #[must_use]
    pub fn is_node_bare(&self, id: NodeId) -> bool {
        match self.tree.slot(id) {
            Ok(TreeNode::Loaded(node)) => {
                node.entries().iter().all(|(_, slot)| !slot.is_loaded())
                    && node.children().iter().all(|&child| {
                        self.tree.slot(child).is_ok_and(TreeNode::is_ghost)
                    })
            }
            Ok(TreeNode::Ghost(_)) => true,
            Err(_) => false,
        }
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.is_node_live(self.tree.root())
    }

    #[must_use]
    pub fn is_bare(&self) -> bool {
        self.is_node_bare(self.tree.root())
    }

    /// Install the node and value serializers.
    ///
    /// # Errors
    ///
    /// Returns `IllegalState` unless the whole tree is live, since ghosts
    /// written by one serializer cannot be read by another.
    pub fn set_serializers(
        &mut self,
        nodes: NodeSerializer<K>,
        values: ValueSerializer<K, V>,
    ) -> Result<(), SkeletonError> {
        if !self.is_live() {
            return Err(SkeletonError::IllegalState(
                "serializers can only be changed while the tree is live".to_string(),
            ));
        }
        self.nodes = Some(nodes);
        self.values = Some(values);
        Ok(())
    }
}

impl<K: Ord + Clone + Debug, V> SkeletonBTree<K, V> {
    /// Load whatever `err` reports as missing.
    fn recover(&mut self, err: BTreeError) -> Result<(), SkeletonError> {
        match err {
            BTreeError::NotLoaded {
                target: Unloaded::Node(id),
                ..
            } => self.inflate_ghost(id),
            BTreeError::NotLoaded {
                target: Unloaded::Values(id),
                ..
            } => self.inflate_values(id),
            other => Err(other.into()),
        }
    }

    /// Look up `key`, loading the nodes and values on its path.
    pub fn get(&mut self, key: &K) -> Result<Option<&V>, SkeletonError> {
        self.inflate_key(key)?;
        Ok(self.tree.get(key)?)
    }

    /// Whether `key` is present. Loads nodes on its path but not values.
    pub fn contains_key(&mut self, key: &K) -> Result<bool, SkeletonError> {
        loop {
            match self.tree.contains_key(key) {
                Ok(found) => return Ok(found),
                Err(err) => self.recover(err)?,
            }
        }
    }

    /// Insert or overwrite `key`.
    ///
    /// Loads the nodes on the path of `key`, but not its old value.
    ///
    /// # Post-conditions
    ///
    /// - Returns `Some` with the previous value if it was loaded
    /// - Returns `None` both for a new key and for an overwritten value that
    ///   was only in the store; call [`Self::contains_key`] first to tell
    ///   the two apart
    /// - `len` grows by one only for a new key
    pub fn put(&mut self, key: K, value: V) -> Result<Option<V>, SkeletonError> {
        loop {
            match self.tree.make_room(&key) {
                Ok(target) => return Ok(self.tree.insert_at(target, key, value)?),
                Err(err) => self.recover(err)?,
            }
        }
    }

    /// Remove `key`, returning its value.
    pub fn remove(&mut self, key: &K) -> Result<Option<V>, SkeletonError> {
        self.inflate_key(key)?;
        loop {
            match self.tree.remove(key) {
                Ok(value) => return Ok(value),
                Err(err) => self.recover(err)?,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::{FaultConfig, MemoryArchive};
    use crate::testing::{self, Archived};

    fn archived(n: i32) -> (SkeletonBTree<i32, String>, MemoryArchive<NodeDoc<i32>>) {
        let Archived { skeleton, nodes, .. } = testing::archived(2, n);
        (skeleton, nodes)
    }

    #[test]
    fn test_operations_load_ghosts() {
        let (mut skeleton, _) = archived(100);
        skeleton.deflate().expect("deflate");
        assert!(skeleton.is_bare());

        assert_eq!(skeleton.get(&42).expect("get"), Some(&"v42".to_string()));
        assert!(skeleton.contains_key(&7).expect("contains"));
        assert!(!skeleton.contains_key(&1000).expect("contains"));
        assert_eq!(skeleton.put(500, "new".to_string()).expect("put"), None);
        assert_eq!(skeleton.remove(&3).expect("remove"), Some("v3".to_string()));
        assert_eq!(skeleton.len(), 100);

        skeleton.inflate().expect("inflate");
        assert!(skeleton.is_live());
        skeleton.tree().verify().expect("verify");
        assert_eq!(skeleton.get(&500).expect("get"), Some(&"new".to_string()));
        assert_eq!(skeleton.get(&3).expect("get"), None);
    }

    #[test]
    fn test_remove_everything_from_deflated_tree() {
        let (mut skeleton, _) = archived(60);
        skeleton.deflate().expect("deflate");
        for i in (0..60).rev() {
            assert_eq!(skeleton.remove(&i).expect("remove"), Some(format!("v{i}")));
            skeleton.tree().verify().expect("verify");
        }
        assert!(skeleton.is_empty());
        assert!(skeleton.is_live());
    }

    #[test]
    fn test_set_serializers_requires_live_tree() {
        let (mut skeleton, _) = archived(20);
        skeleton.deflate().expect("deflate");
        let err = skeleton
            .set_serializers(Box::new(MemoryArchive::new("n")), Box::new(MemoryArchive::new("v")))
            .expect_err("not live");
        assert!(matches!(err, SkeletonError::IllegalState(_)));
    }

    #[test]
    fn test_ghost_without_serializer_is_illegal_state() {
        let (mut skeleton, nodes) = archived(30);
        skeleton.deflate().expect("deflate");
        let doc = skeleton.tree_doc().expect("doc");

        let mut copy = SkeletonBTree::<i32, String>::from_tree_doc(doc).expect("copy");
        assert!(matches!(
            copy.get(&5),
            Err(SkeletonError::IllegalState(_))
        ));
        assert!(!nodes.is_empty());
    }

    #[test]
    fn test_retryable_faults_surface_and_clear() {
        let (mut skeleton, nodes) = archived(200);
        skeleton.deflate().expect("deflate");
        nodes.set_fault_config(FaultConfig {
            pull_error_rate: 1.0,
            push_error_rate: 0.0,
            fatal_rate: 0.0,
        });
        let err = skeleton.inflate().expect_err("fault");
        assert!(err.is_retryable());
        skeleton.tree().verify().expect("verify");

        nodes.set_fault_config(FaultConfig::no_faults());
        skeleton.inflate().expect("inflate");
        assert!(skeleton.is_live());
        assert_eq!(skeleton.get(&150).expect("get"), Some(&"v150".to_string()));
    }

    #[test]
    fn test_put_over_stored_value_returns_none() {
        let (mut skeleton, _) = archived(40);
        skeleton.deflate().expect("deflate");

        assert!(skeleton.contains_key(&12).expect("contains"));
        assert_eq!(skeleton.put(12, "fresh".to_string()).expect("put"), None);
        assert_eq!(skeleton.len(), 40);
        assert_eq!(
            skeleton.put(12, "again".to_string()).expect("put"),
            Some("fresh".to_string())
        );
        assert_eq!(skeleton.get(&12).expect("get"), Some(&"again".to_string()));
        skeleton.tree().verify().expect("verify");
    }
}
