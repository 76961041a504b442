//! B-tree operations over the node arena.
//!
//! Insert and remove are single top-down passes: a full node is split
//! before it is entered, and a minimal node is enlarged (by merge or
//! rotation) before it is entered, so no pass ever has to walk back up.

use std::fmt::Debug;

use super::node::{Ghost, Node, NodeId, NodeRange, Slot, TreeNode};
use super::{BTreeError, Unloaded};

/// Where a key goes once the insert pass has made room for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Target {
    /// Overwrite entry `usize` of the node.
    Replace(NodeId, usize),
    /// Insert a new entry at position `usize` of the leaf.
    Insert(NodeId, usize),
}

/// A B-tree map whose subtrees may be ghosts.
///
/// # Invariants
///
/// - The root is always a loaded node
/// - Every non-root node holds `ent_min()..=ent_max()` entries
/// - `len()` equals the sum of entries over all nodes, counting ghost
///   subtrees by their recorded size
#[derive(Debug)]
pub struct BTree<K, V> {
    pub(crate) slots: Vec<Option<TreeNode<K, V>>>,
    free: Vec<usize>,
    pub(crate) root: NodeId,
    pub(crate) size: usize,
    node_min: usize,
}

impl<K, V> BTree<K, V> {
    /// Create an empty tree of order `node_min`.
    ///
    /// # Errors
    ///
    /// Returns an error if `node_min < 2`.
    pub fn new(node_min: usize) -> Result<Self, BTreeError> {
        if node_min < 2 {
            return Err(BTreeError::IllegalArgument(format!(
                "node_min must be at least 2, got {node_min}"
            )));
        }
        Ok(Self {
            slots: vec![Some(TreeNode::Loaded(Node::new(NodeRange::unbounded())))],
            free: Vec::new(),
            root: NodeId(0),
            size: 0,
            node_min,
        })
    }

    /// Number of entries in the tree, including those in ghost subtrees.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.size
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[must_use]
    pub const fn node_min(&self) -> usize {
        self.node_min
    }

    /// Minimum entries in a non-root node.
    #[must_use]
    pub const fn ent_min(&self) -> usize {
        self.node_min - 1
    }

    /// Maximum entries in any node.
    #[must_use]
    pub const fn ent_max(&self) -> usize {
        2 * self.node_min - 1
    }

    #[must_use]
    pub const fn root(&self) -> NodeId {
        self.root
    }

    /// Remove every entry and ghost.
    pub fn clear(&mut self) {
        self.slots = vec![Some(TreeNode::Loaded(Node::new(NodeRange::unbounded())))];
        self.free.clear();
        self.root = NodeId(0);
        self.size = 0;
    }

    pub(crate) fn alloc(&mut self, node: TreeNode<K, V>) -> NodeId {
        if let Some(index) = self.free.pop() {
            self.slots[index] = Some(node);
            NodeId(index)
        } else {
            self.slots.push(Some(node));
            NodeId(self.slots.len() - 1)
        }
    }

    /// Take a node out of the arena and free its slot.
    pub(crate) fn release(&mut self, id: NodeId) -> Result<TreeNode<K, V>, BTreeError> {
        let node = self
            .slots
            .get_mut(id.0)
            .and_then(Option::take)
            .ok_or_else(|| dangling(id))?;
        self.free.push(id.0);
        Ok(node)
    }

    /// Put `node` into an occupied slot, returning what was there.
    pub(crate) fn replace(
        &mut self,
        id: NodeId,
        node: TreeNode<K, V>,
    ) -> Result<TreeNode<K, V>, BTreeError> {
        match self.slots.get_mut(id.0) {
            Some(slot @ Some(_)) => slot.replace(node).ok_or_else(|| dangling(id)),
            _ => Err(dangling(id)),
        }
    }

    /// The content of a slot, ghost or not.
    pub fn slot(&self, id: NodeId) -> Result<&TreeNode<K, V>, BTreeError> {
        self.slots
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| dangling(id))
    }

    /// The ghost in slot `id`.
    pub fn ghost(&self, id: NodeId) -> Result<&Ghost<K>, BTreeError> {
        match self.slot(id)? {
            TreeNode::Ghost(ghost) => Ok(ghost),
            TreeNode::Loaded(_) => Err(BTreeError::IllegalArgument(format!(
                "node {id} is not a ghost"
            ))),
        }
    }

    /// Total entries under `id`, using recorded sizes for ghosts and the
    /// cache for loaded nodes where it is valid.
    pub fn total_size(&self, id: NodeId) -> Result<usize, BTreeError> {
        match self.slot(id)? {
            TreeNode::Ghost(ghost) => Ok(ghost.size),
            TreeNode::Loaded(node) => {
                if let Some(size) = node.size.get() {
                    return Ok(size);
                }
                let mut total = node.entries.len();
                for &child in &node.children {
                    total += self.total_size(child)?;
                }
                node.size.set(Some(total));
                Ok(total)
            }
        }
    }
}

fn dangling(id: NodeId) -> BTreeError {
    BTreeError::Verification(format!("node {id} does not exist"))
}

impl<K: Ord + Clone + Debug, V> BTree<K, V> {
    /// The loaded node in slot `id`.
    ///
    /// # Errors
    ///
    /// Returns `NotLoaded` naming the slot if it holds a ghost.
    pub fn node(&self, id: NodeId) -> Result<&Node<K, V>, BTreeError> {
        match self.slot(id)? {
            TreeNode::Loaded(node) => Ok(node),
            TreeNode::Ghost(ghost) => Err(BTreeError::NotLoaded {
                target: Unloaded::Node(id),
                range: ghost.range.to_string(),
            }),
        }
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Result<&mut Node<K, V>, BTreeError> {
        match self.slots.get_mut(id.0).and_then(Option::as_mut) {
            Some(TreeNode::Loaded(node)) => Ok(node),
            Some(TreeNode::Ghost(ghost)) => Err(BTreeError::NotLoaded {
                target: Unloaded::Node(id),
                range: ghost.range.to_string(),
            }),
            None => Err(dangling(id)),
        }
    }

    fn values_not_loaded(&self, id: NodeId) -> BTreeError {
        BTreeError::NotLoaded {
            target: Unloaded::Values(id),
            range: self
                .slot(id)
                .map(|node| node.range().to_string())
                .unwrap_or_default(),
        }
    }

    /// Look up the value for `key`.
    pub fn get(&self, key: &K) -> Result<Option<&V>, BTreeError> {
        let mut id = self.root;
        loop {
            let node = self.node(id)?;
            match node.find(key) {
                Ok(i) => {
                    return match &node.entries[i].1 {
                        Slot::Loaded(value) => Ok(Some(value)),
                        Slot::Ghost(_) => Err(self.values_not_loaded(id)),
                    };
                }
                Err(_) if node.is_leaf() => return Ok(None),
                Err(i) => id = node.children[i],
            }
        }
    }

    /// Whether `key` is present. Values need not be loaded.
    pub fn contains_key(&self, key: &K) -> Result<bool, BTreeError> {
        let mut id = self.root;
        loop {
            let node = self.node(id)?;
            match node.find(key) {
                Ok(_) => return Ok(true),
                Err(_) if node.is_leaf() => return Ok(false),
                Err(i) => id = node.children[i],
            }
        }
    }

    /// The entry at position `index` in key order.
    pub fn get_entry(&self, index: usize) -> Result<(&K, &V), BTreeError> {
        if index >= self.size {
            return Err(BTreeError::IndexOutOfBounds {
                index,
                size: self.size,
            });
        }
        let mut id = self.root;
        let mut index = index;
        'descend: loop {
            let node = self.node(id)?;
            let found = if node.is_leaf() {
                node.entries.get(index)
            } else {
                let mut found = None;
                for (i, &child) in node.children.iter().enumerate() {
                    let size = self.total_size(child)?;
                    if index < size {
                        id = child;
                        continue 'descend;
                    }
                    index -= size;
                    if index == 0 {
                        found = node.entries.get(i);
                        break;
                    }
                    index -= 1;
                }
                found
            };
            return match found {
                Some((key, Slot::Loaded(value))) => Ok((key, value)),
                Some((_, Slot::Ghost(_))) => Err(self.values_not_loaded(id)),
                None => Err(BTreeError::Verification(format!(
                    "cached sizes under {id} disagree with tree size {}",
                    self.size
                ))),
            };
        }
    }

    /// Smallest key, if any.
    pub fn first_key(&self) -> Result<Option<&K>, BTreeError> {
        let mut node = self.node(self.root)?;
        while let Some(&child) = node.children.first() {
            node = self.node(child)?;
        }
        Ok(node.entries.first().map(|(k, _)| k))
    }

    /// Largest key, if any.
    pub fn last_key(&self) -> Result<Option<&K>, BTreeError> {
        let mut node = self.node(self.root)?;
        while let Some(&child) = node.children.last() {
            node = self.node(child)?;
        }
        Ok(node.entries.last().map(|(k, _)| k))
    }

    /// Depth of the leftmost path, counting a ghost as one level.
    #[must_use]
    pub fn height_estimate(&self) -> usize {
        let mut height = 1;
        let mut id = self.root;
        while let Ok(node) = self.node(id) {
            match node.children.first() {
                Some(&child) => {
                    height += 1;
                    id = child;
                }
                None => break,
            }
        }
        height
    }

    /// Insert or overwrite `key`, returning the previous value if it was
    /// loaded.
    pub fn put(&mut self, key: K, value: V) -> Result<Option<V>, BTreeError> {
        let target = self.make_room(&key)?;
        self.insert_at(target, key, value)
    }

    /// Descend towards `key`, splitting every full node before entering it.
    ///
    /// Does not touch the value, so a `NotLoaded` failure can be retried
    /// after loading the named ghost.
    pub(crate) fn make_room(&mut self, key: &K) -> Result<Target, BTreeError> {
        let ent_max = self.ent_max();
        let mut parent = None;
        let mut id = self.root;
        loop {
            let node = self.node(id)?;
            node.invalidate();
            if node.entries.len() == ent_max {
                let above = self.split(parent, id)?;
                let node = self.node(above)?;
                match node.find(key) {
                    Ok(i) => return Ok(Target::Replace(above, i)),
                    Err(i) => {
                        parent = Some(above);
                        id = node.children[i];
                    }
                }
                continue;
            }
            match node.find(key) {
                Ok(i) => return Ok(Target::Replace(id, i)),
                Err(i) if node.is_leaf() => return Ok(Target::Insert(id, i)),
                Err(i) => {
                    parent = Some(id);
                    id = node.children[i];
                }
            }
        }
    }

    pub(crate) fn insert_at(
        &mut self,
        target: Target,
        key: K,
        value: V,
    ) -> Result<Option<V>, BTreeError> {
        match target {
            Target::Replace(id, i) => {
                let node = self.node_mut(id)?;
                let entry = node
                    .entries
                    .get_mut(i)
                    .ok_or_else(|| BTreeError::Verification(format!("no entry {i} in {id}")))?;
                Ok(std::mem::replace(&mut entry.1, Slot::Loaded(value)).into_value())
            }
            Target::Insert(id, i) => {
                self.node_mut(id)?.entries.insert(i, (key, Slot::Loaded(value)));
                self.size += 1;
                Ok(None)
            }
        }
    }

    /// Split full node `id`, promoting its median into `parent`.
    ///
    /// The first `ent_min()` entries move to a new left sibling; `id` keeps
    /// the rest. Without a parent a new root is created. Returns the node
    /// that received the median.
    fn split(&mut self, parent: Option<NodeId>, id: NodeId) -> Result<NodeId, BTreeError> {
        let ent_min = self.ent_min();
        let (left, median) = {
            let node = self.node_mut(id)?;
            let mut upper = node.entries.split_off(ent_min);
            let rest = upper.split_off(1);
            let median = upper
                .pop()
                .ok_or_else(|| BTreeError::Verification(format!("split of short node {id}")))?;
            let left_entries = std::mem::replace(&mut node.entries, rest);
            let left_children = if node.is_leaf() {
                Vec::new()
            } else {
                let rest = node.children.split_off(ent_min + 1);
                std::mem::replace(&mut node.children, rest)
            };
            let left_range = NodeRange::new(node.range.lkey.take(), Some(median.0.clone()));
            node.range.lkey = Some(median.0.clone());
            node.invalidate();
            (Node::with_parts(left_range, left_entries, left_children), median)
        };
        let left_id = self.alloc(TreeNode::Loaded(left));

        let parent_id = if let Some(p) = parent {
            p
        } else {
            let root = Node::with_parts(NodeRange::unbounded(), Vec::new(), vec![id]);
            self.root = self.alloc(TreeNode::Loaded(root));
            self.root
        };
        let above = self.node_mut(parent_id)?;
        let pos = above
            .children
            .iter()
            .position(|&c| c == id)
            .ok_or_else(|| BTreeError::Verification(format!("{id} is not a child of {parent_id}")))?;
        above.entries.insert(pos, median);
        above.children.insert(pos, left_id);
        above.invalidate();
        Ok(parent_id)
    }

    /// Remove `key`, returning its value if it was loaded.
    pub fn remove(&mut self, key: &K) -> Result<Option<V>, BTreeError> {
        let ent_min = self.ent_min();
        let mut parent: Option<(NodeId, usize)> = None;
        let mut id = self.root;
        loop {
            self.node(id)?.invalidate();

            if id != self.root && self.node(id)?.entries.len() == ent_min {
                let (above, pos) = parent.ok_or_else(|| {
                    BTreeError::Verification(format!("non-root node {id} has no parent"))
                })?;
                let root = self.root;
                self.enlarge_child(above, pos)?;
                if self.root == root {
                    let (i, child) = self.select_child(above, key)?;
                    parent = Some((above, i));
                    id = child;
                } else {
                    parent = None;
                    id = self.root;
                }
                continue;
            }

            let node = self.node(id)?;
            match node.find(key) {
                Err(_) if node.is_leaf() => return Ok(None),
                Ok(i) if node.is_leaf() => {
                    let (_, slot) = self.node_mut(id)?.entries.remove(i);
                    self.size -= 1;
                    return Ok(slot.into_value());
                }
                Err(i) => {
                    parent = Some((id, i));
                    id = node.children[i];
                }
                Ok(i) => {
                    let root = self.root;
                    self.push_down(id, i)?;
                    if self.root == root {
                        let (i, child) = self.select_child(id, key)?;
                        parent = Some((id, i));
                        id = child;
                    } else {
                        parent = None;
                        id = self.root;
                    }
                }
            }
        }
    }

    /// The child of `id` that `key` belongs to.
    fn select_child(&self, id: NodeId, key: &K) -> Result<(usize, NodeId), BTreeError> {
        let node = self.node(id)?;
        match node.find(key) {
            Err(i) if !node.is_leaf() => Ok((i, node.children[i])),
            _ => Err(BTreeError::Verification(format!(
                "key not routed to a child of {id} after rebalancing"
            ))),
        }
    }

    fn entry_count(&self, id: Option<NodeId>) -> Result<Option<usize>, BTreeError> {
        id.map(|id| self.node(id).map(|n| n.entries.len()))
            .transpose()
    }

    /// Give child `pos` of `parent` more than `ent_min()` entries.
    ///
    /// Merges with a minimal sibling, otherwise rotates from the richer
    /// one. Equal siblings are chosen between by the parity of the size.
    fn enlarge_child(&mut self, parent: NodeId, pos: usize) -> Result<(), BTreeError> {
        let ent_min = self.ent_min();
        let (left, right) = {
            let node = self.node(parent)?;
            (
                pos.checked_sub(1).map(|i| node.children[i]),
                node.children.get(pos + 1).copied(),
            )
        };
        let l = self.entry_count(left)?;
        let r = self.entry_count(right)?;
        match (l, r) {
            (None, None) => Err(BTreeError::Verification(format!(
                "child {pos} of {parent} has no siblings"
            ))),
            (None, Some(r)) if r == ent_min => self.merge(parent, pos),
            (None, Some(_)) => self.rotate_left(parent, pos),
            (Some(l), None) if l == ent_min => self.merge(parent, pos - 1),
            (Some(_), None) => self.rotate_right(parent, pos - 1),
            (Some(l), Some(r)) if r > l => self.rotate_left(parent, pos),
            (Some(l), Some(r)) if l > r => self.rotate_right(parent, pos - 1),
            (Some(_), Some(r)) if self.size % 2 == 1 => {
                if r == ent_min {
                    self.merge(parent, pos)
                } else {
                    self.rotate_left(parent, pos)
                }
            }
            (Some(l), Some(_)) => {
                if l == ent_min {
                    self.merge(parent, pos - 1)
                } else {
                    self.rotate_right(parent, pos - 1)
                }
            }
        }
    }

    /// Move local entry `i` of `id` down into one of its adjacent children.
    fn push_down(&mut self, id: NodeId, i: usize) -> Result<(), BTreeError> {
        let ent_min = self.ent_min();
        let (left, right) = {
            let node = self.node(id)?;
            (node.children[i], node.children[i + 1])
        };
        let l = self.node(left)?.entries.len();
        let r = self.node(right)?.entries.len();
        if r > l {
            self.rotate_left(id, i)
        } else if l > r {
            self.rotate_right(id, i)
        } else if self.size % 2 == 1 {
            if r == ent_min {
                self.merge(id, i)
            } else {
                self.rotate_left(id, i)
            }
        } else if l == ent_min {
            self.merge(id, i)
        } else {
            self.rotate_right(id, i)
        }
    }

    /// Ids of children `li` and `li + 1` of `parent`, both loaded.
    fn pair(&self, parent: NodeId, li: usize) -> Result<(NodeId, NodeId), BTreeError> {
        let node = self.node(parent)?;
        match (node.children.get(li), node.children.get(li + 1)) {
            (Some(&left), Some(&right)) if li < node.entries.len() => {
                self.node(left)?;
                self.node(right)?;
                Ok((left, right))
            }
            _ => Err(BTreeError::Verification(format!(
                "{parent} has no children at {li} and {}",
                li + 1
            ))),
        }
    }

    /// Merge children `li` and `li + 1` of `parent` around their separator.
    ///
    /// The right node absorbs the left. If this drains the root, the merged
    /// node becomes the root.
    fn merge(&mut self, parent: NodeId, li: usize) -> Result<(), BTreeError> {
        let (left_id, right_id) = self.pair(parent, li)?;
        let (separator, drained) = {
            let node = self.node_mut(parent)?;
            let separator = node.entries.remove(li);
            node.children.remove(li);
            node.invalidate();
            (separator, node.entries.is_empty())
        };
        let TreeNode::Loaded(left) = self.release(left_id)? else {
            return Err(BTreeError::Verification(format!("merged ghost {left_id}")));
        };

        let right = self.node_mut(right_id)?;
        let mut entries = left.entries;
        entries.push(separator);
        entries.append(&mut right.entries);
        right.entries = entries;
        let mut children = left.children;
        children.append(&mut right.children);
        right.children = children;
        right.range.lkey = left.range.lkey;
        right.invalidate();

        if drained && parent == self.root {
            self.release(parent)?;
            self.root = right_id;
        }
        Ok(())
    }

    /// Rotate one entry from child `li + 1` through the parent into `li`.
    fn rotate_left(&mut self, parent: NodeId, li: usize) -> Result<(), BTreeError> {
        let (left_id, right_id) = self.pair(parent, li)?;
        let (first, first_child) = {
            let right = self.node_mut(right_id)?;
            if right.entries.is_empty() {
                return Err(BTreeError::Verification(format!("rotation from empty {right_id}")));
            }
            let first = right.entries.remove(0);
            let child = (!right.is_leaf()).then(|| right.children.remove(0));
            right.range.lkey = Some(first.0.clone());
            right.invalidate();
            (first, child)
        };
        let bound = first.0.clone();
        let separator = {
            let node = self.node_mut(parent)?;
            node.invalidate();
            std::mem::replace(&mut node.entries[li], first)
        };
        let left = self.node_mut(left_id)?;
        left.entries.push(separator);
        left.children.extend(first_child);
        left.range.rkey = Some(bound);
        left.invalidate();
        Ok(())
    }

    /// Rotate one entry from child `li` through the parent into `li + 1`.
    fn rotate_right(&mut self, parent: NodeId, li: usize) -> Result<(), BTreeError> {
        let (left_id, right_id) = self.pair(parent, li)?;
        let (last, last_child) = {
            let left = self.node_mut(left_id)?;
            let last = left
                .entries
                .pop()
                .ok_or_else(|| BTreeError::Verification(format!("rotation from empty {left_id}")))?;
            let child = left.children.pop();
            left.range.rkey = Some(last.0.clone());
            left.invalidate();
            (last, child)
        };
        let bound = last.0.clone();
        let separator = {
            let node = self.node_mut(parent)?;
            node.invalidate();
            std::mem::replace(&mut node.entries[li], last)
        };
        let right = self.node_mut(right_id)?;
        right.entries.insert(0, separator);
        if let Some(child) = last_child {
            right.children.insert(0, child);
        }
        right.range.lkey = Some(bound);
        right.invalidate();
        Ok(())
    }
}
