//! In-memory archive for tests and simulation.
//!
//! [`MemoryArchive`] implements the full serialization contract over a
//! shared map, with seeded fault injection:
//! - Pull errors (retryable or fatal)
//! - Push errors (retryable or fatal), possibly part-way through a batch

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{Fetch, Location, PullTask, PushTask, Serializer, TaskError};

/// Configuration for fault injection.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Probability that loading one item fails (0.0 - 1.0).
    pub pull_error_rate: f64,
    /// Probability that storing one item fails (0.0 - 1.0).
    pub push_error_rate: f64,
    /// Probability that an injected failure is fatal rather than retryable.
    pub fatal_rate: f64,
}

impl FaultConfig {
    /// No faults (for baseline testing).
    #[must_use]
    pub fn no_faults() -> Self {
        Self::default()
    }

    /// Low fault rates, all retryable.
    #[must_use]
    pub const fn low_faults() -> Self {
        Self {
            pull_error_rate: 0.01,
            push_error_rate: 0.01,
            fatal_rate: 0.0,
        }
    }

    /// High fault rates, some of them fatal.
    #[must_use]
    pub const fn high_faults() -> Self {
        Self {
            pull_error_rate: 0.05,
            push_error_rate: 0.05,
            fatal_rate: 0.1,
        }
    }
}

/// Statistics about archive operations.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ArchiveStats {
    /// Number of items loaded.
    pub pulls: u64,
    /// Number of items stored.
    pub pushes: u64,
    /// Number of injected pull failures.
    pub injected_pull_errors: u64,
    /// Number of injected push failures.
    pub injected_push_errors: u64,
}

struct Inner<T> {
    items: HashMap<String, T>,
    prefix: String,
    next_address: u64,
    faults: FaultConfig,
    rng: StdRng,
    stats: ArchiveStats,
}

impl<T> Inner<T> {
    fn should_fail(&mut self, rate: f64) -> Option<TaskError> {
        if rate <= 0.0 || self.rng.random::<f64>() >= rate {
            return None;
        }
        let fatal = self.faults.fatal_rate > 0.0 && self.rng.random::<f64>() < self.faults.fatal_rate;
        Some(if fatal {
            TaskError::fatal("simulated archive failure")
        } else {
            TaskError::abort("simulated archive failure")
        })
    }

    fn load(&mut self, location: &Location, meta: Option<&str>) -> Result<T, TaskError>
    where
        T: Clone,
    {
        self.stats.pulls += 1;
        if let Some(err) = self.should_fail(self.faults.pull_error_rate) {
            self.stats.injected_pull_errors += 1;
            return Err(err);
        }
        let key = resolve(location, meta).ok_or_else(|| {
            TaskError::DataFormat(format!("location {location} has neither address nor bin"))
        })?;
        self.items
            .get(&key)
            .cloned()
            .ok_or_else(|| TaskError::fatal(format!("no data stored at {key}")))
    }
}

/// Storage key for a location: its address, or a name derived from the
/// tree metadata and bin id.
fn resolve(location: &Location, meta: Option<&str>) -> Option<String> {
    match (&location.address, location.bin) {
        (Some(address), _) => Some(address.clone()),
        (None, Some(bin)) => Some(bin_key(meta, bin)),
        (None, None) => None,
    }
}

fn bin_key(meta: Option<&str>, bin: u64) -> String {
    format!("{}/bin/{bin}", meta.unwrap_or("-"))
}

/// Shared in-memory store.
///
/// Cloning the archive yields another handle to the same items, so a test
/// can keep one handle for inspection while a tree owns another.
///
/// # Thread Safety
///
/// All state sits behind one mutex, which is enough for the fetch workers
/// used by scheduled inflation.
pub struct MemoryArchive<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for MemoryArchive<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> MemoryArchive<T> {
    /// Create an archive whose addresses start with `prefix`.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self::with_faults(prefix, 0, FaultConfig::no_faults())
    }

    /// Create an archive with seeded fault injection.
    ///
    /// The same seed produces the same sequence of faults.
    #[must_use]
    pub fn with_faults(prefix: impl Into<String>, seed: u64, faults: FaultConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                items: HashMap::new(),
                prefix: prefix.into(),
                next_address: 0,
                faults,
                rng: StdRng::seed_from_u64(seed),
                stats: ArchiveStats::default(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of stored items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn stats(&self) -> ArchiveStats {
        self.lock().stats.clone()
    }

    pub fn set_fault_config(&self, faults: FaultConfig) {
        self.lock().faults = faults;
    }

    /// Store `item` directly under `address`, bypassing fault injection.
    pub fn insert(&self, address: impl Into<String>, item: T) {
        self.lock().items.insert(address.into(), item);
    }

    /// Load the item stored for `location`, bypassing fault injection.
    #[must_use]
    pub fn get(&self, location: &Location, meta: Option<&str>) -> Option<T>
    where
        T: Clone,
    {
        let key = resolve(location, meta)?;
        self.lock().items.get(&key).cloned()
    }
}

impl<K: Ord, T: Clone + Send + 'static> Serializer<K, T> for MemoryArchive<T> {
    fn pull(
        &mut self,
        tasks: &mut BTreeMap<K, PullTask<T>>,
        meta: Option<&str>,
    ) -> Result<(), TaskError> {
        if tasks.values().all(|task| task.data.is_some()) {
            return Err(TaskError::Complete);
        }
        let mut inner = self.lock();
        for task in tasks.values_mut().filter(|task| task.data.is_none()) {
            task.data = Some(inner.load(&task.meta, meta)?);
        }
        Ok(())
    }

    fn push(
        &mut self,
        tasks: &mut BTreeMap<K, PushTask<T>>,
        meta: Option<&str>,
    ) -> Result<(), TaskError> {
        let mut inner = self.lock();
        for task in tasks.values_mut() {
            let Some(data) = &task.data else {
                if task.meta.is_some() {
                    continue;
                }
                return Err(TaskError::IllegalArgument(
                    "push task has neither data nor location".to_string(),
                ));
            };

            inner.stats.pushes += 1;
            let rate = inner.faults.push_error_rate;
            if let Some(err) = inner.should_fail(rate) {
                inner.stats.injected_push_errors += 1;
                return Err(err);
            }

            let previous = task.meta.take().unwrap_or_default();
            let location = if let Some(bin) = previous.bin {
                inner.items.insert(bin_key(meta, bin), data.clone());
                Location {
                    address: None,
                    ..previous
                }
            } else {
                let address = format!("{}:{}", inner.prefix, inner.next_address);
                inner.next_address += 1;
                inner.items.insert(address.clone(), data.clone());
                Location {
                    address: Some(address),
                    ..previous
                }
            };
            task.meta = Some(location);
        }
        Ok(())
    }

    fn fetcher(&self) -> Option<Arc<dyn Fetch<T>>> {
        Some(Arc::new(self.clone()))
    }
}

impl<T: Clone + Send> Fetch<T> for MemoryArchive<T> {
    fn fetch(&self, location: &Location, meta: Option<&str>) -> Result<T, TaskError> {
        self.lock().load(location, meta)
    }
}
