//! Shared test helpers.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

use crate::serial::MemoryArchive;
use crate::skeleton::{NodeDoc, SkeletonBTree};

static TRACING: Once = Once::new();

/// Route log output through the test harness. Honours `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| "btree_index=debug".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

/// A skeleton tree together with handles on its archives.
pub struct Archived {
    pub skeleton: SkeletonBTree<i32, String>,
    pub nodes: MemoryArchive<NodeDoc<i32>>,
    pub values: MemoryArchive<String>,
}

/// A live tree holding `i -> "v{i}"` for `0..n`, bulk loaded, with
/// in-memory archives installed.
pub fn archived(node_min: usize, n: i32) -> Archived {
    init_tracing();
    let nodes = MemoryArchive::new("node");
    let values = MemoryArchive::new("value");
    let mut skeleton = SkeletonBTree::new(node_min)
        .expect("tree")
        .with_meta("test");
    skeleton
        .set_serializers(Box::new(nodes.clone()), Box::new(values.clone()))
        .expect("serializers");
    skeleton
        .tree_mut()
        .put_all((0..n).map(|i| (i, format!("v{i}"))).collect())
        .expect("put_all");
    Archived {
        skeleton,
        nodes,
        values,
    }
}

/// Like [`archived`], then fully deflated.
pub fn deflated(node_min: usize, n: i32) -> Archived {
    let mut archived = archived(node_min, n);
    archived.skeleton.deflate().expect("deflate");
    archived
}
