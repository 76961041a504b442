//! Node types for the arena B-tree.
//!
//! A slot in the arena holds either a loaded [`Node`] or a [`Ghost`]
//! standing in for a subtree that lives only in the backing store.

use std::cell::Cell;
use std::cmp::Ordering;

use crate::serial::Location;

/// Index of a node slot in the tree arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Open key interval `(lkey, rkey)` covered by a node.
///
/// An absent bound is unbounded on that side.
///
/// # Ordering
///
/// Ranges are ordered by right bound first (absent sorts last), then by
/// left bound descending (absent sorts last). Nested ranges therefore
/// sort inner-first, and sibling ranges sort left-to-right.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeRange<K> {
    pub lkey: Option<K>,
    pub rkey: Option<K>,
}

impl<K> NodeRange<K> {
    /// The range of a root: unbounded on both sides.
    #[must_use]
    pub const fn unbounded() -> Self {
        Self {
            lkey: None,
            rkey: None,
        }
    }

    #[must_use]
    pub const fn new(lkey: Option<K>, rkey: Option<K>) -> Self {
        Self { lkey, rkey }
    }
}

impl<K: Ord> NodeRange<K> {
    /// Whether `key` lies strictly inside the range.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.lkey.as_ref().is_none_or(|l| l < key) && self.rkey.as_ref().is_none_or(|r| key < r)
    }
}

impl<K: Ord> Ord for NodeRange<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        let upper = match (&self.rkey, &other.rkey) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => a.cmp(b),
        };
        // None sorts first for Option, which is -inf for a left bound.
        upper.then_with(|| other.lkey.cmp(&self.lkey))
    }
}

impl<K: Ord> PartialOrd for NodeRange<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: std::fmt::Debug> std::fmt::Display for NodeRange<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.lkey {
            Some(k) => write!(f, "({k:?}, ")?,
            None => write!(f, "(*, ")?,
        }
        match &self.rkey {
            Some(k) => write!(f, "{k:?})"),
            None => write!(f, "*)"),
        }
    }
}

/// A value that is either in memory or only in the backing store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot<V> {
    Loaded(V),
    Ghost(Location),
}

impl<V> Slot<V> {
    #[must_use]
    pub const fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded(_))
    }

    #[must_use]
    pub const fn value(&self) -> Option<&V> {
        match self {
            Self::Loaded(v) => Some(v),
            Self::Ghost(_) => None,
        }
    }

    #[must_use]
    pub fn into_value(self) -> Option<V> {
        match self {
            Self::Loaded(v) => Some(v),
            Self::Ghost(_) => None,
        }
    }
}

/// A loaded node.
///
/// # Invariants
///
/// - `entries` is sorted by key, and every key lies inside `range`
/// - `children` is empty for a leaf, otherwise `entries.len() + 1` long
/// - child `i` covers `(key[i-1], key[i])`, using this node's bounds at
///   either end
#[derive(Debug)]
pub struct Node<K, V> {
    pub(crate) range: NodeRange<K>,
    pub(crate) entries: Vec<(K, Slot<V>)>,
    pub(crate) children: Vec<NodeId>,
    /// Total entries in this subtree; `None` once a mutation invalidated it.
    pub(crate) size: Cell<Option<usize>>,
}

impl<K, V> Node<K, V> {
    pub(crate) const fn new(range: NodeRange<K>) -> Self {
        Self {
            range,
            entries: Vec::new(),
            children: Vec::new(),
            size: Cell::new(None),
        }
    }

    pub(crate) const fn with_parts(
        range: NodeRange<K>,
        entries: Vec<(K, Slot<V>)>,
        children: Vec<NodeId>,
    ) -> Self {
        Self {
            range,
            entries,
            children,
            size: Cell::new(None),
        }
    }

    #[must_use]
    pub const fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    #[must_use]
    pub const fn range(&self) -> &NodeRange<K> {
        &self.range
    }

    #[must_use]
    pub fn entries(&self) -> &[(K, Slot<V>)] {
        &self.entries
    }

    #[must_use]
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub(crate) fn invalidate(&self) {
        self.size.set(None);
    }
}

impl<K: Ord, V> Node<K, V> {
    /// Binary search for `key` among the local entries.
    pub(crate) fn find(&self, key: &K) -> Result<usize, usize> {
        self.entries.binary_search_by(|(k, _)| k.cmp(key))
    }
}

impl<K: Clone, V> Node<K, V> {
    /// Range of child `i`.
    pub(crate) fn child_range(&self, i: usize) -> NodeRange<K> {
        let lkey = if i == 0 {
            self.range.lkey.clone()
        } else {
            self.entries.get(i - 1).map(|(k, _)| k.clone())
        };
        let rkey = match self.entries.get(i) {
            Some((k, _)) => Some(k.clone()),
            None => self.range.rkey.clone(),
        };
        NodeRange { lkey, rkey }
    }
}

/// Placeholder for a subtree that is only in the backing store.
#[derive(Debug, Clone)]
pub struct Ghost<K> {
    pub(crate) range: NodeRange<K>,
    pub(crate) size: usize,
    pub(crate) location: Location,
}

impl<K> Ghost<K> {
    #[must_use]
    pub const fn range(&self) -> &NodeRange<K> {
        &self.range
    }

    /// Total entries in the subtree this ghost stands for.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub const fn location(&self) -> &Location {
        &self.location
    }
}

/// Content of an arena slot.
#[derive(Debug)]
pub enum TreeNode<K, V> {
    Loaded(Node<K, V>),
    Ghost(Ghost<K>),
}

impl<K, V> TreeNode<K, V> {
    #[must_use]
    pub const fn range(&self) -> &NodeRange<K> {
        match self {
            Self::Loaded(node) => &node.range,
            Self::Ghost(ghost) => &ghost.range,
        }
    }

    #[must_use]
    pub const fn is_ghost(&self) -> bool {
        matches!(self, Self::Ghost(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_order_prefers_smaller_right_bound() {
        let left = NodeRange::new(None, Some(10));
        let right = NodeRange::new(Some(10), Some(20));
        let last = NodeRange::new(Some(20), None);
        assert!(left < right);
        assert!(right < last);
    }

    #[test]
    fn test_range_order_nested_ranges_sort_inner_first() {
        let root: NodeRange<i32> = NodeRange::unbounded();
        let tail = NodeRange::new(Some(20), None);
        let inner = NodeRange::new(Some(5), Some(10));
        let outer = NodeRange::new(Some(1), Some(10));
        assert!(tail < root);
        assert!(inner < outer);
    }

    #[test]
    fn test_range_contains_is_open() {
        let range = NodeRange::new(Some(1), Some(5));
        assert!(range.contains(&3));
        assert!(!range.contains(&1));
        assert!(!range.contains(&5));
        assert!(NodeRange::<i32>::unbounded().contains(&i32::MIN));
    }

    #[test]
    fn test_child_range_uses_node_bounds_at_edges() {
        let node: Node<i32, ()> = Node::with_parts(
            NodeRange::new(Some(0), Some(100)),
            vec![(10, Slot::Loaded(())), (20, Slot::Loaded(()))],
            vec![NodeId(1), NodeId(2), NodeId(3)],
        );
        assert_eq!(node.child_range(0), NodeRange::new(Some(0), Some(10)));
        assert_eq!(node.child_range(1), NodeRange::new(Some(10), Some(20)));
        assert_eq!(node.child_range(2), NodeRange::new(Some(20), Some(100)));
    }
}
