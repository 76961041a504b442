//! Serialization contract between the tree and its backing store.
//!
//! Nodes, values and packed bins never talk to storage directly. They hand
//! batches of requests to a [`Serializer`], which fills in data (on pull) or
//! locations (on push). The contract is deliberately narrow so the same
//! tree can run on top of an in-memory archive in tests and a networked
//! block store in production.
//!
//! # Design
//!
//! - Requests are batched in a `BTreeMap` keyed by the caller's own key
//!   type, so one call can move many nodes or values at once.
//! - A [`Location`] is opaque to the tree except for the bin id and weight,
//!   which the packer reads and writes.
//! - Failures are reported as [`TaskError`]; `Complete` is the one variant
//!   that means "nothing left to do" rather than failure.

mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use memory::{ArchiveStats, FaultConfig, MemoryArchive};

/// Where a serialized item lives.
///
/// Produced by push and consumed by a later pull. `address` is owned by the
/// backing store; `bin` and `weight` are owned by the packer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    /// Store-specific address, if the store assigned one.
    pub address: Option<String>,
    /// Identifier of the bin holding this item, if it was packed.
    pub bin: Option<u64>,
    /// Recorded weight of the item, if it was packed.
    pub weight: Option<u32>,
}

impl Location {
    /// Location of an item stored at a store-assigned address.
    #[must_use]
    pub fn at(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            bin: None,
            weight: None,
        }
    }

    /// Location of a whole bin, addressed by its id alone.
    #[must_use]
    pub const fn bin(id: u64) -> Self {
        Self {
            address: None,
            bin: Some(id),
            weight: None,
        }
    }

    /// Location of an element packed into bin `id` with the given weight.
    #[must_use]
    pub const fn packed(id: u64, weight: u32) -> Self {
        Self {
            address: None,
            bin: Some(id),
            weight: Some(weight),
        }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.address, self.bin) {
            (Some(address), _) => write!(f, "{address}"),
            (None, Some(bin)) => write!(f, "bin:{bin}"),
            (None, None) => write!(f, "<unplaced>"),
        }
    }
}

/// A request to load the item at `meta`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullTask<T> {
    /// Where to read from.
    pub meta: Location,
    /// Filled in by the serializer.
    pub data: Option<T>,
}

impl<T> PullTask<T> {
    #[must_use]
    pub const fn new(meta: Location) -> Self {
        Self { meta, data: None }
    }
}

/// A request to store `data`.
///
/// `meta` may carry the item's previous location on the way in; on success
/// it holds the new location. A task with no data but an existing location
/// describes an item that is already stored and unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushTask<T> {
    pub data: Option<T>,
    pub meta: Option<Location>,
}

impl<T> PushTask<T> {
    #[must_use]
    pub const fn new(data: T) -> Self {
        Self {
            data: Some(data),
            meta: None,
        }
    }

    /// An already-stored item that the caller did not load.
    #[must_use]
    pub const fn stored(meta: Location) -> Self {
        Self {
            data: None,
            meta: Some(meta),
        }
    }
}

/// Errors raised by a serialization task.
#[derive(Debug)]
pub enum TaskError {
    /// There was nothing left to do. Not a failure.
    Complete,
    /// The task failed. Retrying may help when `retryable` is set.
    Abort {
        message: String,
        retryable: bool,
        source: Option<Box<TaskError>>,
    },
    /// Loaded data failed a structural check.
    DataFormat(String),
    /// A caller passed an argument the task cannot accept.
    IllegalArgument(String),
    /// The task was invoked in a state that does not allow it.
    IllegalState(String),
}

impl TaskError {
    /// A retryable abort.
    #[must_use]
    pub fn abort(message: impl Into<String>) -> Self {
        Self::Abort {
            message: message.into(),
            retryable: true,
            source: None,
        }
    }

    /// A fatal abort.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Abort {
            message: message.into(),
            retryable: false,
            source: None,
        }
    }

    /// Wrap this error in an abort carrying extra context.
    ///
    /// Retryability is inherited: only a retryable abort stays retryable.
    /// `Complete` passes through untouched.
    #[must_use]
    pub fn context(self, message: impl Into<String>) -> Self {
        if matches!(self, Self::Complete) {
            return self;
        }
        Self::Abort {
            message: message.into(),
            retryable: self.is_retryable(),
            source: Some(Box::new(self)),
        }
    }

    /// Whether retrying the failed operation may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Abort {
                retryable: true,
                ..
            }
        )
    }

    #[must_use]
    pub const fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete => write!(f, "task complete"),
            Self::Abort {
                message, retryable, ..
            } => {
                if *retryable {
                    write!(f, "task aborted (retryable): {message}")
                } else {
                    write!(f, "task aborted: {message}")
                }
            }
            Self::DataFormat(msg) => write!(f, "data format error: {msg}"),
            Self::IllegalArgument(msg) => write!(f, "illegal argument: {msg}"),
            Self::IllegalState(msg) => write!(f, "illegal state: {msg}"),
        }
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Abort {
                source: Some(inner),
                ..
            } => Some(inner.as_ref()),
            _ => None,
        }
    }
}

/// Batch serializer for items of type `T`, keyed by `K`.
///
/// # Implementation Notes
///
/// Implementations must ensure:
/// - `pull` fills `data` for every task it returns `Ok` for, and may add
///   extra tasks when it loaded more than was asked for
/// - `pull` returns `TaskError::Complete` when every task already has data
/// - `push` sets `meta` on every task that carried data and leaves the
///   data in place
/// - a failed batch reports an abort even if some tasks were written; the
///   written ones are recognisable by their updated `meta`
pub trait Serializer<K, T> {
    /// Load the data for every task in `tasks`.
    ///
    /// `meta` is tree-wide metadata identifying the collection being read.
    fn pull(
        &mut self,
        tasks: &mut BTreeMap<K, PullTask<T>>,
        meta: Option<&str>,
    ) -> Result<(), TaskError>;

    /// Store the data of every task in `tasks`.
    fn push(
        &mut self,
        tasks: &mut BTreeMap<K, PushTask<T>>,
        meta: Option<&str>,
    ) -> Result<(), TaskError>;

    /// A handle for loading single items from other threads, if supported.
    fn fetcher(&self) -> Option<Arc<dyn Fetch<T>>> {
        None
    }
}

/// Thread-safe single-item loader used by scheduled inflation.
pub trait Fetch<T>: Send + Sync {
    /// Load the item at `location`.
    fn fetch(&self, location: &Location, meta: Option<&str>) -> Result<T, TaskError>;
}
