//! Moving nodes and values between memory and the serializers.

use std::collections::BTreeMap;
use std::fmt::Debug;

use tracing::{debug, info};

use super::{SkeletonBTree, SkeletonError};
use crate::btree::{Ghost, NodeId, Slot, TreeNode};
use crate::serial::{Location, PullTask, PushTask, TaskError};

fn missing_serializer(kind: &str) -> SkeletonError {
    SkeletonError::IllegalState(format!("no {kind} serializer installed"))
}

impl<K: Ord + Clone + Debug, V> SkeletonBTree<K, V> {
    /// Load ghost `id` from the node serializer. Its children arrive as
    /// ghosts and its values unloaded.
    ///
    /// Does nothing if the node is already loaded.
    ///
    /// # Errors
    ///
    /// Returns `DataFormat` if the loaded document does not match the
    /// ghost's bounds or size.
    pub fn inflate_ghost(&mut self, id: NodeId) -> Result<(), SkeletonError> {
        let ghost = match self.tree.slot(id)? {
            TreeNode::Loaded(_) => return Ok(()),
            TreeNode::Ghost(ghost) => ghost.clone(),
        };
        let nodes = self.nodes.as_mut().ok_or_else(|| missing_serializer("node"))?;

        let range = ghost.range().clone();
        let mut tasks = BTreeMap::from([(range.clone(), PullTask::new(ghost.location().clone()))]);
        match nodes.pull(&mut tasks, self.meta.as_deref()) {
            Ok(()) | Err(TaskError::Complete) => {}
            Err(err) => return Err(err.context(format!("could not inflate node {range}")).into()),
        }
        let doc = tasks
            .remove(&range)
            .and_then(|task| task.data)
            .ok_or_else(|| {
                SkeletonError::DataFormat(format!("no document loaded for node {range}"))
            })?;
        self.attach(id, doc)
    }

    /// Load every unloaded value of node `id` in one batch.
    pub fn inflate_values(&mut self, id: NodeId) -> Result<(), SkeletonError> {
        let node = self.tree.node(id)?;
        let mut tasks: BTreeMap<K, PullTask<V>> = node
            .entries()
            .iter()
            .filter_map(|(key, slot)| match slot {
                Slot::Ghost(location) => Some((key.clone(), PullTask::new(location.clone()))),
                Slot::Loaded(_) => None,
            })
            .collect();
        if tasks.is_empty() {
            return Ok(());
        }
        let range = node.range().to_string();

        let values = self.values.as_mut().ok_or_else(|| missing_serializer("value"))?;
        match values.pull(&mut tasks, self.meta.as_deref()) {
            Ok(()) | Err(TaskError::Complete) => {}
            Err(err) => {
                return Err(err.context(format!("could not load values of node {range}")).into());
            }
        }

        let node = self.tree.node_mut(id)?;
        for (key, slot) in &mut node.entries {
            if slot.is_loaded() {
                continue;
            }
            let value = tasks.remove(&*key).and_then(|task| task.data).ok_or_else(|| {
                SkeletonError::DataFormat(format!("no value loaded for key {key:?}"))
            })?;
            *slot = Slot::Loaded(value);
        }
        debug!(node = %id, "loaded values");
        Ok(())
    }

    /// Store every loaded value of node `id` in one batch and unload it.
    ///
    /// Values that are already stored travel with the batch so the value
    /// serializer sees the whole node. If the push fails, every value is
    /// back in memory as it was.
    pub fn deflate_values(&mut self, id: NodeId) -> Result<(), SkeletonError> {
        if self.tree.node(id)?.entries().iter().all(|(_, slot)| !slot.is_loaded()) {
            return Ok(());
        }
        let values = self.values.as_mut().ok_or_else(|| missing_serializer("value"))?;
        let node = self.tree.node_mut(id)?;
        let range = node.range().to_string();

        let mut tasks = BTreeMap::new();
        for (key, slot) in &mut node.entries {
            let task = match slot {
                Slot::Ghost(location) => PushTask::stored(location.clone()),
                Slot::Loaded(_) => match std::mem::replace(slot, Slot::Ghost(Location::default())) {
                    Slot::Loaded(value) => PushTask::new(value),
                    Slot::Ghost(location) => PushTask::stored(location),
                },
            };
            tasks.insert(key.clone(), task);
        }

        let result = values.push(&mut tasks, self.meta.as_deref());
        let stored = matches!(&result, Ok(()) | Err(TaskError::Complete));
        let mut problem = None;
        for (key, slot) in &mut node.entries {
            let Some(task) = tasks.remove(&*key) else {
                problem.get_or_insert_with(|| format!("value serializer dropped key {key:?}"));
                continue;
            };
            match (task.data, task.meta) {
                (Some(_), Some(location)) | (None, Some(location)) if stored => {
                    *slot = Slot::Ghost(location);
                }
                (Some(value), None) if stored => {
                    *slot = Slot::Loaded(value);
                    problem.get_or_insert_with(|| format!("no location returned for key {key:?}"));
                }
                (Some(value), _) => *slot = Slot::Loaded(value),
                (None, _) => {}
            }
        }

        match result {
            Ok(()) | Err(TaskError::Complete) => {}
            Err(err) => {
                return Err(err.context(format!("could not store values of node {range}")).into());
            }
        }
        if let Some(problem) = problem {
            return Err(SkeletonError::IllegalState(problem));
        }
        debug!(node = %id, "stored values");
        Ok(())
    }

    /// Load node `id` and everything below it, depth first.
    pub fn inflate_node(&mut self, id: NodeId) -> Result<(), SkeletonError> {
        self.inflate_ghost(id)?;
        self.inflate_values(id)?;
        let children = self.tree.node(id)?.children().to_vec();
        for child in children {
            self.inflate_node(child)?;
        }
        Ok(())
    }

    /// Load the whole tree. Does nothing if it is already live.
    pub fn inflate(&mut self) -> Result<(), SkeletonError> {
        self.inflate_node(self.tree.root())?;
        info!(size = self.tree.len(), "inflated tree");
        Ok(())
    }

    /// Store everything below node `id` and leave it bare.
    ///
    /// Children are deflated bottom-up, then pushed in one batch and
    /// replaced by ghosts; the node's own values go last.
    pub fn deflate_node(&mut self, id: NodeId) -> Result<(), SkeletonError> {
        let children = match self.tree.slot(id)? {
            TreeNode::Ghost(_) => return Ok(()),
            TreeNode::Loaded(node) => node.children().to_vec(),
        };
        let mut loaded = Vec::with_capacity(children.len());
        for child in children {
            if !self.tree.slot(child)?.is_ghost() {
                self.deflate_node(child)?;
                loaded.push(child);
            }
        }
        self.push_nodes(&loaded)?;
        self.deflate_values(id)
    }

    /// Store the whole tree, leaving only a bare root in memory.
    pub fn deflate(&mut self) -> Result<(), SkeletonError> {
        self.deflate_node(self.tree.root())?;
        info!(size = self.tree.len(), "deflated tree");
        Ok(())
    }

    /// Load the nodes and values on the lookup path of `key`.
    pub fn inflate_key(&mut self, key: &K) -> Result<(), SkeletonError> {
        loop {
            let result = self.tree.get(key).map(|_| ());
            match result {
                Ok(()) => return Ok(()),
                Err(err) => self.recover(err)?,
            }
        }
    }

    /// Unload the lowest loaded subtree on the lookup path of `key`.
    ///
    /// Follows `key` down to the first child that is bare or a leaf, stores
    /// it and replaces it with a ghost. A key found in an internal node
    /// continues into the child to its right.
    ///
    /// # Pre-conditions
    ///
    /// - Both serializers are set
    ///
    /// # Post-conditions
    ///
    /// - Returns `true` when one child was stored and replaced by a ghost;
    ///   its values were stored along with it
    /// - Returns `false` and changes nothing when the path already ends in a
    ///   ghost or the root is a leaf
    /// - The root is never unloaded, and `len` is unchanged
    ///
    /// # Errors
    ///
    /// On a failed store the child stays loaded; values that were stored
    /// before the failure stay unloaded.
    pub fn deflate_key(&mut self, key: &K) -> Result<bool, SkeletonError> {
        let mut id = self.tree.root();
        loop {
            let node = self.tree.node(id)?;
            if node.is_leaf() {
                return Ok(false);
            }
            let child = match node.find(key) {
                Ok(i) => node.children()[i + 1],
                Err(i) => node.children()[i],
            };
            let leaf = match self.tree.slot(child)? {
                TreeNode::Ghost(_) => return Ok(false),
                TreeNode::Loaded(inner) => inner.is_leaf(),
            };
            if leaf || self.is_node_bare(child) {
                self.deflate_values(child)?;
                self.push_nodes(&[child])?;
                return Ok(true);
            }
            id = child;
        }
    }

    /// Push bare nodes `ids` in one batch and replace each with a ghost.
    fn push_nodes(&mut self, ids: &[NodeId]) -> Result<(), SkeletonError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut tasks = BTreeMap::new();
        for &id in ids {
            let doc = self.node_doc(id)?;
            tasks.insert(doc.range(), PushTask::new(doc));
        }
        let nodes = self.nodes.as_mut().ok_or_else(|| missing_serializer("node"))?;
        nodes
            .push(&mut tasks, self.meta.as_deref())
            .map_err(|err| err.context(format!("could not store {} nodes", ids.len())))?;

        for &id in ids {
            let range = self.tree.slot(id)?.range().clone();
            let location = tasks
                .remove(&range)
                .and_then(|task| task.meta)
                .ok_or_else(|| {
                    SkeletonError::IllegalState(format!("no location returned for node {range}"))
                })?;
            self.ghost_out(id, location)?;
        }
        Ok(())
    }

    /// Replace bare node `id` with a ghost at `location`.
    fn ghost_out(&mut self, id: NodeId, location: Location) -> Result<(), SkeletonError> {
        let ghost = Ghost {
            range: self.tree.slot(id)?.range().clone(),
            size: self.tree.total_size(id)?,
            location,
        };
        if let TreeNode::Loaded(node) = self.tree.replace(id, TreeNode::Ghost(ghost))? {
            for &child in node.children() {
                self.tree.release(child)?;
            }
        }
        debug!(node = %id, "stored node");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::FaultConfig;
    use crate::testing::archived;

    fn keys(skeleton: &SkeletonBTree<i32, String>) -> Vec<i32> {
        skeleton
            .tree()
            .keys()
            .map(|k| k.copied())
            .collect::<Result<_, _>>()
            .expect("keys")
    }

    #[test]
    fn test_deflate_then_inflate_round_trip() {
        let mut f = archived(2, 40);
        assert_eq!(f.skeleton.tree().verify().expect("verify"), Some(3));
        let before = keys(&f.skeleton);

        f.skeleton.deflate().expect("deflate");
        assert!(f.skeleton.is_bare());
        assert!(!f.skeleton.is_live());
        assert_eq!(f.skeleton.len(), 40);
        assert_eq!(f.values.len(), 40);

        f.skeleton.inflate().expect("inflate");
        assert!(f.skeleton.is_live());
        assert_eq!(keys(&f.skeleton), before);
        f.skeleton.tree().verify().expect("verify");
    }

    #[test]
    fn test_deflate_and_inflate_are_idempotent() {
        let mut f = archived(3, 100);
        f.skeleton.deflate().expect("deflate");
        let pushes = f.nodes.stats().pushes;
        f.skeleton.deflate().expect("deflate again");
        assert_eq!(f.nodes.stats().pushes, pushes);

        f.skeleton.inflate().expect("inflate");
        let pulls = f.nodes.stats().pulls;
        f.skeleton.inflate().expect("inflate again");
        assert_eq!(f.nodes.stats().pulls, pulls);
    }

    #[test]
    fn test_inflate_rejects_mismatched_bounds() {
        let mut f = archived(2, 20);
        f.skeleton.deflate().expect("deflate");
        let root = f.skeleton.tree().node(f.skeleton.tree().root()).expect("root");
        let first = root.children()[0];
        let ghost = f.skeleton.tree().ghost(first).expect("ghost").clone();

        let mut doc = f.nodes.get(ghost.location(), None).expect("stored");
        doc.rkey = doc.rkey.map(|k| k + 1);
        f.nodes
            .insert(ghost.location().address.clone().expect("address"), doc);

        let err = f.skeleton.inflate_ghost(first).expect_err("bounds");
        assert!(matches!(err, SkeletonError::DataFormat(_)));
        assert!(f.skeleton.tree().slot(first).expect("slot").is_ghost());
    }

    #[test]
    fn test_inflate_rejects_wrong_size() {
        let mut f = archived(2, 20);
        f.skeleton.deflate().expect("deflate");
        let root = f.skeleton.tree().node(f.skeleton.tree().root()).expect("root");
        let first = root.children()[0];
        let ghost = f.skeleton.tree().ghost(first).expect("ghost").clone();

        let mut doc = f.nodes.get(ghost.location(), None).expect("stored");
        doc.subnodes = None;
        f.nodes
            .insert(ghost.location().address.clone().expect("address"), doc);

        let err = f.skeleton.inflate_ghost(first).expect_err("size");
        assert!(matches!(err, SkeletonError::DataFormat(_)));
    }

    #[test]
    fn test_failed_value_push_keeps_values() {
        let mut f = archived(2, 10);
        f.values.set_fault_config(FaultConfig {
            pull_error_rate: 0.0,
            push_error_rate: 1.0,
            fatal_rate: 0.0,
        });
        let root = f.skeleton.tree().root();
        let err = f.skeleton.deflate_values(root).expect_err("push fails");
        assert!(err.is_retryable());
        assert!(
            f.skeleton
                .tree()
                .node(root)
                .expect("root")
                .entries()
                .iter()
                .all(|(_, slot)| slot.is_loaded())
        );
    }

    #[test]
    fn test_deflate_key_unloads_one_path() {
        let mut f = archived(2, 40);
        assert!(f.skeleton.deflate_key(&17).expect("deflate key"));
        assert!(!f.skeleton.is_live());
        assert_eq!(f.skeleton.len(), 40);
        f.skeleton.tree().verify().expect("verify");

        assert!(!f.skeleton.deflate_key(&17).expect("path ends in a ghost"));

        f.skeleton.inflate_key(&17).expect("inflate key");
        assert_eq!(
            f.skeleton.tree().get(&17).expect("get"),
            Some(&"v17".to_string())
        );
        assert!(f.skeleton.is_live());
    }

    #[test]
    fn test_deflate_key_on_leaf_root_does_nothing() {
        let mut f = archived(4, 3);
        assert!(!f.skeleton.deflate_key(&1).expect("deflate key"));
        assert!(f.skeleton.is_live());
    }
}
