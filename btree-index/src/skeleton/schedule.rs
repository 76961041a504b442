//! Concurrent whole-tree inflation.
//!
//! A pool of worker tasks fetches ghost documents through the node
//! serializer's [`Fetch`](crate::serial::Fetch) handle while a single
//! coordinator attaches the results. Only the coordinator touches the
//! tree, so every attach happens against a consistent node graph.
//!
//! ```text
//!                 jobs (bounded)            completions
//!  coordinator ───────────────▶ workers ───────────────▶ coordinator
//!   (attach)                  (spawn_blocking fetch)
//! ```
//!
//! Nodes are visited in [`NodeRange`] order, smallest right bound first,
//! so the loaded part of the tree grows from the left.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt::Debug;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tracing::{info, warn};

use super::{NodeDoc, SkeletonBTree, SkeletonError};
use crate::btree::{NodeId, NodeRange};
use crate::serial::{Location, TaskError};

/// Jobs each worker may have queued or running at once.
const JOBS_PER_WORKER: usize = 2;

struct Job {
    id: NodeId,
    location: Location,
}

struct Completion<K> {
    id: NodeId,
    result: Result<NodeDoc<K>, TaskError>,
}

type Queue<K> = BinaryHeap<Reverse<(NodeRange<K>, NodeId)>>;

impl<K, V> SkeletonBTree<K, V>
where
    K: Ord + Clone + Debug + Send + 'static,
{
    /// Load the whole tree using `workers` concurrent fetches.
    ///
    /// Falls back to [`inflate`](Self::inflate) when the node serializer
    /// has no fetch handle. On failure the first error is returned once
    /// every fetch in flight has finished; everything attached so far
    /// stays attached.
    pub async fn inflate_scheduled(&mut self, workers: usize) -> Result<(), SkeletonError> {
        let Some(fetcher) = self.nodes.as_ref().and_then(|nodes| nodes.fetcher()) else {
            return self.inflate();
        };
        let workers = workers.max(1);
        let window = workers * JOBS_PER_WORKER;

        let (job_tx, job_rx) = mpsc::channel::<Job>(window);
        let (done_tx, mut done_rx) = mpsc::channel::<Completion<K>>(window);
        let job_rx = Arc::new(Mutex::new(job_rx));

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let job_rx = Arc::clone(&job_rx);
            let done_tx = done_tx.clone();
            let fetcher = Arc::clone(&fetcher);
            let meta = self.meta.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let job = job_rx.lock().await.recv().await;
                    let Some(Job { id, location }) = job else {
                        break;
                    };
                    let fetcher = Arc::clone(&fetcher);
                    let meta = meta.clone();
                    let result = tokio::task::spawn_blocking(move || {
                        fetcher.fetch(&location, meta.as_deref())
                    })
                    .await
                    .unwrap_or_else(|err| Err(TaskError::abort(format!("fetch interrupted: {err}"))));
                    if done_tx.send(Completion { id, result }).await.is_err() {
                        break;
                    }
                }
            }));
        }
        drop(done_tx);

        let mut scan: Queue<K> = BinaryHeap::new();
        let mut pending: Queue<K> = BinaryHeap::new();
        let mut failure: Option<SkeletonError> = None;
        let mut in_flight = 0usize;
        let mut fetched = 0usize;

        let root = self.tree.root();
        match self.tree.slot(root) {
            Ok(node) => scan.push(Reverse((node.range().clone(), root))),
            Err(err) => failure = Some(err.into()),
        }

        loop {
            while failure.is_none() {
                let Some(Reverse((_, id))) = scan.pop() else {
                    break;
                };
                if let Err(err) = self.queue_children(id, &mut scan, &mut pending) {
                    failure = Some(err);
                }
            }

            while failure.is_none() && in_flight < window {
                let Some(Reverse((_, id))) = pending.pop() else {
                    break;
                };
                let location = match self.tree.ghost(id) {
                    Ok(ghost) => ghost.location().clone(),
                    Err(err) => {
                        failure = Some(err.into());
                        break;
                    }
                };
                if job_tx.send(Job { id, location }).await.is_err() {
                    failure = Some(TaskError::abort("inflate workers stopped").into());
                    break;
                }
                in_flight += 1;
            }

            if in_flight == 0 && (failure.is_some() || (scan.is_empty() && pending.is_empty())) {
                break;
            }

            let Some(Completion { id, result }) = done_rx.recv().await else {
                failure.get_or_insert(TaskError::abort("inflate interrupted").into());
                break;
            };
            in_flight -= 1;
            if let Err(err) = self.complete(id, result, &mut scan, failure.is_some()) {
                warn!(node = %id, error = %err, "scheduled inflate failed");
                failure.get_or_insert(err);
            } else {
                fetched += 1;
            }
        }

        drop(job_tx);
        for joined in futures::future::join_all(handles).await {
            if let Err(err) = joined {
                failure.get_or_insert(TaskError::abort(format!("inflate worker failed: {err}")).into());
            }
        }

        match failure {
            Some(err) => Err(err),
            None => {
                info!(size = self.tree.len(), fetched, workers, "inflated tree");
                Ok(())
            }
        }
    }

    /// Load the values of loaded node `id` and queue its children: loaded
    /// ones for scanning, ghosts for fetching.
    fn queue_children(
        &mut self,
        id: NodeId,
        scan: &mut Queue<K>,
        pending: &mut Queue<K>,
    ) -> Result<(), SkeletonError> {
        self.inflate_values(id)?;
        for &child in self.tree.node(id)?.children() {
            let slot = self.tree.slot(child)?;
            let entry = Reverse((slot.range().clone(), child));
            if slot.is_ghost() {
                pending.push(entry);
            } else {
                scan.push(entry);
            }
        }
        Ok(())
    }

    /// Handle one finished fetch. After a failure, results are drained but
    /// no longer attached.
    fn complete(
        &mut self,
        id: NodeId,
        result: Result<NodeDoc<K>, TaskError>,
        scan: &mut Queue<K>,
        draining: bool,
    ) -> Result<(), SkeletonError> {
        let slot = self.tree.slot(id)?;
        let range = slot.range().clone();
        let ghost = slot.is_ghost();
        match result {
            Ok(_) if draining => Ok(()),
            Ok(doc) => {
                self.attach(id, doc)?;
                scan.push(Reverse((range, id)));
                Ok(())
            }
            Err(TaskError::Complete) if !ghost => {
                scan.push(Reverse((range, id)));
                Ok(())
            }
            Err(err) => Err(err.context(format!("could not inflate node {range}")).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::{FaultConfig, MemoryArchive};
    use crate::testing::{self, Archived};

    fn deflated(n: i32) -> (SkeletonBTree<i32, String>, MemoryArchive<NodeDoc<i32>>) {
        let Archived { skeleton, nodes, .. } = testing::deflated(3, n);
        (skeleton, nodes)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_scheduled_inflate_loads_everything() {
        let (mut skeleton, nodes) = deflated(2000);
        let stored = nodes.stats().pushes;

        skeleton.inflate_scheduled(4).await.expect("inflate");
        assert!(skeleton.is_live());
        skeleton.tree().verify().expect("verify");
        assert_eq!(nodes.stats().pulls, stored);

        let values: Vec<(i32, String)> = skeleton
            .tree()
            .iter()
            .map(|e| e.map(|(k, v)| (*k, v.clone())))
            .collect::<Result<_, _>>()
            .expect("iter");
        assert_eq!(values.len(), 2000);
        assert!(values.iter().all(|(k, v)| *v == format!("v{k}")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_scheduled_inflate_of_live_tree_is_noop() {
        let (mut skeleton, nodes) = deflated(50);
        skeleton.inflate().expect("inflate");
        let pulls = nodes.stats().pulls;
        skeleton.inflate_scheduled(2).await.expect("inflate");
        assert_eq!(nodes.stats().pulls, pulls);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_scheduled_inflate_reports_fault_and_resumes() {
        let (mut skeleton, nodes) = deflated(500);
        nodes.set_fault_config(FaultConfig {
            pull_error_rate: 1.0,
            push_error_rate: 0.0,
            fatal_rate: 0.0,
        });
        let err = skeleton.inflate_scheduled(3).await.expect_err("fault");
        assert!(err.is_retryable());
        skeleton.tree().verify().expect("verify");

        nodes.set_fault_config(FaultConfig::no_faults());
        skeleton.inflate_scheduled(3).await.expect("inflate");
        assert!(skeleton.is_live());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_scheduled_inflate_with_single_worker() {
        let (mut skeleton, _) = deflated(300);
        skeleton.inflate_scheduled(0).await.expect("inflate");
        assert!(skeleton.is_live());
        assert_eq!(skeleton.tree().verify().expect("verify"), Some(skeleton.tree().height_estimate()));
    }
}
