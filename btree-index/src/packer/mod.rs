//! Packs many small elements into fixed-capacity bins.
//!
//! A [`Packer`] is a [`Serializer`] for elements that stores them through
//! another serializer for whole bins. Elements are placed best-fit
//! decreasing, then bins are evened out so that every bin is at least half
//! full except at most one.
//!
//! # Stored Bins
//!
//! A stored bin is overwritten only when every element it holds is being
//! repacked in the same push. Otherwise its new contents go under a fresh
//! id, so elements outside the batch that still point at the old bin can
//! always find it. Unchanged bins are not written at all.
//!
//! # Locations
//!
//! Every packed element gets [`Location::packed`] with its bin id and
//! weight; the weight lets later batches pack around elements that are
//! not loaded.

mod bin;
mod scale;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;

use tracing::{debug, info};

use crate::serial::{Location, PullTask, PushTask, Serializer, TaskError};
use bin::BinSet;

pub use scale::{ByteLength, IdGenerator, Weigh};

/// How much stored data a push may reload to pack better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Aggression {
    /// Elements without data keep their location and are not packed.
    SkipUnloaded = 0,
    /// Existing bins are rebuilt from the locations of elements without
    /// data; bins left unchanged by best-fit packing are not rewritten.
    #[default]
    KeepPacked = 1,
    /// As `KeepPacked`, but bins are checked for changes only after they
    /// have been evened out.
    KeepBalanced = 2,
    /// Everything is loaded and packed from scratch.
    Repack = 3,
}

impl TryFrom<u8> for Aggression {
    type Error = TaskError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(Self::SkipUnloaded),
            1 => Ok(Self::KeepPacked),
            2 => Ok(Self::KeepBalanced),
            3 => Ok(Self::Repack),
            _ => Err(TaskError::IllegalArgument(format!(
                "aggression must be between 0 and 3, got {level}"
            ))),
        }
    }
}

/// Serializer that packs elements into bins stored by `S`.
///
/// # Type Parameters
///
/// - `S`: serializer for whole bins, keyed by bin id
/// - `W`: weighs a single element
///
/// # Bin Ids
///
/// Fresh ids come from an [`IdGenerator`] that also registers every bin id
/// seen in a batch. A packer reopened over a store that already holds bins
/// must be given a generator past those ids with [`Packer::with_ids`].
pub struct Packer<S, W> {
    bins: S,
    scale: W,
    capacity: u32,
    no_tiny: bool,
    aggression: Aggression,
    ids: IdGenerator,
}

impl<S, W> Packer<S, W> {
    /// Create a packer for bins of weight `capacity`.
    ///
    /// With `no_tiny`, a bin left under half full is merged into another,
    /// and a single element heavier than `capacity` is allowed its own bin.
    ///
    /// # Errors
    ///
    /// Returns `IllegalArgument` if `capacity` is zero.
    pub fn new(bins: S, scale: W, capacity: u32, no_tiny: bool) -> Result<Self, TaskError> {
        if capacity == 0 {
            return Err(TaskError::IllegalArgument(
                "bin capacity must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            bins,
            scale,
            capacity,
            no_tiny,
            aggression: Aggression::default(),
            ids: IdGenerator::new(),
        })
    }

    #[must_use]
    pub fn with_aggression(mut self, aggression: Aggression) -> Self {
        self.aggression = aggression;
        self
    }

    /// Hand out bin ids from `ids`, typically the generator of an earlier
    /// packer over the same bin store.
    #[must_use]
    pub fn with_ids(mut self, ids: IdGenerator) -> Self {
        self.ids = ids;
        self
    }

    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    #[must_use]
    pub const fn aggression(&self) -> Aggression {
        self.aggression
    }

    /// The generator bin ids come from.
    #[must_use]
    pub const fn ids(&self) -> &IdGenerator {
        &self.ids
    }

    /// The bin serializer.
    #[must_use]
    pub const fn bins(&self) -> &S {
        &self.bins
    }

    fn half(&self) -> u64 {
        u64::from(self.capacity >> 1)
    }
}

impl<S, W> Packer<S, W> {
    /// Load the stored bins `ids` whole.
    fn fetch_bins<K, T>(
        &mut self,
        ids: &BTreeSet<u64>,
        meta: Option<&str>,
    ) -> Result<BTreeMap<u64, BTreeMap<K, T>>, TaskError>
    where
        S: Serializer<u64, BTreeMap<K, T>>,
    {
        if ids.is_empty() {
            return Ok(BTreeMap::new());
        }
        let mut requests: BTreeMap<u64, PullTask<BTreeMap<K, T>>> = ids
            .iter()
            .map(|&bin| (bin, PullTask::new(Location::bin(bin))))
            .collect();
        match self.bins.pull(&mut requests, meta) {
            Ok(()) | Err(TaskError::Complete) => {}
            Err(err) => return Err(err.context(format!("could not load {} bins", ids.len()))),
        }
        requests
            .into_iter()
            .map(|(bin, request)| {
                request
                    .data
                    .map(|contents| (bin, contents))
                    .ok_or_else(|| TaskError::DataFormat(format!("bin {bin} was not loaded")))
            })
            .collect()
    }

    /// Fill in the data of every task in `keys` that has none, by pulling
    /// the bins their locations point at.
    fn load_members<K, T>(
        &mut self,
        tasks: &mut BTreeMap<K, PushTask<T>>,
        keys: &BTreeSet<K>,
        meta: Option<&str>,
    ) -> Result<(), TaskError>
    where
        K: Ord + Clone + Debug,
        T: Clone,
        S: Serializer<u64, BTreeMap<K, T>>,
        W: Weigh<T>,
    {
        let mut pulls: BTreeMap<K, PullTask<T>> = BTreeMap::new();
        for key in keys {
            let Some(task) = tasks.get(key) else {
                continue;
            };
            if task.data.is_some() {
                continue;
            }
            let location = task.meta.clone().ok_or_else(|| {
                TaskError::IllegalArgument(format!("element {key:?} has neither data nor location"))
            })?;
            pulls.insert(key.clone(), PullTask::new(location));
        }
        if pulls.is_empty() {
            return Ok(());
        }
        match self.pull(&mut pulls, meta) {
            Ok(()) | Err(TaskError::Complete) => {}
            Err(err) => return Err(err.context("could not load bin members for repacking")),
        }
        for (key, pulled) in pulls {
            if let Some(task) = tasks.get_mut(&key).filter(|task| task.data.is_none()) {
                task.data = pulled.data;
            }
        }
        Ok(())
    }
}

impl<K, T, S, W> Serializer<K, T> for Packer<S, W>
where
    K: Ord + Clone + Debug,
    T: Clone,
    S: Serializer<u64, BTreeMap<K, T>>,
    W: Weigh<T>,
{
    /// Load elements by pulling each bin they were packed into once.
    ///
    /// Other members of those bins come back as extra tasks.
    fn pull(
        &mut self,
        tasks: &mut BTreeMap<K, PullTask<T>>,
        meta: Option<&str>,
    ) -> Result<(), TaskError> {
        let mut groups: BTreeMap<u64, Vec<K>> = BTreeMap::new();
        for (key, task) in tasks.iter().filter(|(_, task)| task.data.is_none()) {
            let bin = task.meta.bin.ok_or_else(|| {
                TaskError::DataFormat(format!("location {} of {key:?} names no bin", task.meta))
            })?;
            groups.entry(bin).or_default().push(key.clone());
        }
        if groups.is_empty() {
            return Err(TaskError::Complete);
        }

        let ids: BTreeSet<u64> = groups.keys().copied().collect();
        let mut loaded = self.fetch_bins(&ids, meta)?;
        for (bin, keys) in groups {
            let Some(mut contents) = loaded.remove(&bin) else {
                return Err(TaskError::DataFormat(format!("bin {bin} was not loaded")));
            };
            for key in keys {
                let data = contents.remove(&key).ok_or_else(|| {
                    TaskError::fatal(format!("bin {bin} does not hold element {key:?}"))
                })?;
                if let Some(task) = tasks.get_mut(&key) {
                    task.data = Some(data);
                }
            }
            for (key, data) in contents {
                if !tasks.contains_key(&key) {
                    let weight = self.scale.weigh(&data);
                    tasks.insert(
                        key,
                        PullTask {
                            meta: Location::packed(bin, weight),
                            data: Some(data),
                        },
                    );
                }
            }
        }
        Ok(())
    }

    /// Pack every task into bins and store the bins that changed.
    ///
    /// # Pre-conditions
    ///
    /// - Every task has data, a location with a weight, or both
    /// - A task without data names the bin that holds it
    ///
    /// # Post-conditions
    ///
    /// - Every packed task has data and [`Location::packed`] metadata
    /// - Of the bins written, at most one is lighter than half the capacity,
    ///   and with `no_tiny` none is unless it is the only one
    /// - Without `no_tiny` no written bin is heavier than the capacity
    /// - Tasks skipped under [`Aggression::SkipUnloaded`] and tasks in
    ///   unchanged bins keep their location
    ///
    /// # Errors
    ///
    /// Returns `IllegalArgument` for an element heavier than the capacity,
    /// unless `no_tiny` is set and it is the only one. On any error element
    /// metadata is left untouched, but every element that was being
    /// repacked has its data filled in: the stored bin it came from may
    /// already have been overwritten, so a caller must keep that data.
    fn push(
        &mut self,
        tasks: &mut BTreeMap<K, PushTask<T>>,
        meta: Option<&str>,
    ) -> Result<(), TaskError> {
        for location in tasks.values().filter_map(|task| task.meta.as_ref()) {
            if let Some(bin) = location.bin {
                self.ids.register(bin);
            }
        }
        if self.aggression == Aggression::Repack {
            let keys: BTreeSet<K> = tasks.keys().cloned().collect();
            self.load_members(tasks, &keys, meta)?;
        }

        let (weights, giant) = self.weigh_all(tasks)?;
        let packing = self.pack(tasks, &weights, giant);
        let stored = self.load_packed(tasks, &packing.bins, meta)?;
        let (written, reused) = self.assign_ids(packing.bins, &stored);
        self.store_bins(tasks, &written, meta)?;

        for (id, members) in &written {
            for (weight, key) in members {
                if let Some(task) = tasks.get_mut(key) {
                    task.meta = Some(Location::packed(*id, *weight));
                }
            }
            debug!(bin = id, members = members.len(), "stored bin");
        }
        info!(
            elements = tasks.len(),
            written = written.len(),
            reused,
            merged = packing.merged,
            unchanged = packing.unchanged,
            "packed elements"
        );
        Ok(())
    }
}

/// Bins ready to be written, each with the stored bin it was rebuilt from.
struct Packing<K> {
    bins: Vec<(Option<u64>, Vec<(u32, K)>)>,
    unchanged: usize,
    merged: usize,
}

impl<S, W> Packer<S, W> {
    /// Weigh every task, returning the weights of the elements to pack and
    /// the loaded element heavier than the capacity, if any.
    fn weigh_all<K, T>(
        &self,
        tasks: &BTreeMap<K, PushTask<T>>,
    ) -> Result<(BTreeMap<K, u32>, Option<(K, u32)>), TaskError>
    where
        K: Ord + Clone + Debug,
        W: Weigh<T>,
    {
        let mut weights = BTreeMap::new();
        let mut giant = None;
        let mut oversized = false;
        for (key, task) in tasks {
            let weight = match (&task.data, &task.meta) {
                (Some(data), _) => self.scale.weigh(data),
                (None, Some(location)) => location.weight.ok_or_else(|| {
                    TaskError::DataFormat(format!("location {location} of {key:?} has no weight"))
                })?,
                (None, None) => {
                    return Err(TaskError::IllegalArgument(format!(
                        "element {key:?} has neither data nor location"
                    )));
                }
            };
            if weight > self.capacity {
                if !self.no_tiny || oversized {
                    return Err(TaskError::IllegalArgument(format!(
                        "element {key:?} weighs {weight}, over the bin capacity {}",
                        self.capacity
                    )));
                }
                oversized = true;
                if task.data.is_some() {
                    giant = Some((key.clone(), weight));
                }
                continue;
            }
            if task.data.is_none() && self.aggression == Aggression::SkipUnloaded {
                continue;
            }
            weights.insert(key.clone(), weight);
        }
        Ok((weights, giant))
    }

    /// Place the weighed elements into bins.
    fn pack<K, T>(
        &self,
        tasks: &BTreeMap<K, PushTask<T>>,
        weights: &BTreeMap<K, u32>,
        giant: Option<(K, u32)>,
    ) -> Packing<K>
    where
        K: Ord + Clone,
    {
        // Stored bins are rebuilt from the elements nobody loaded; loaded
        // elements are always placed afresh.
        let mut set = BinSet::new(self.capacity);
        let mut placed = BTreeSet::new();
        if matches!(self.aggression, Aggression::KeepPacked | Aggression::KeepBalanced) {
            let mut slots: BTreeMap<u64, usize> = BTreeMap::new();
            for (key, &weight) in weights {
                let Some(bin) = tasks
                    .get(key)
                    .filter(|task| task.data.is_none())
                    .and_then(|task| task.meta.as_ref())
                    .and_then(|location| location.bin)
                else {
                    continue;
                };
                let slot = *slots.entry(bin).or_insert_with(|| set.open(Some(bin)));
                set.insert_original(slot, key.clone(), weight);
                placed.insert(key.clone());
            }
            for (_, key) in set.evict_overfull() {
                placed.remove(&key);
            }
        }

        let mut order: Vec<(u32, K)> = weights
            .iter()
            .filter(|(key, _)| !placed.contains(*key))
            .map(|(key, &weight)| (weight, key.clone()))
            .collect();
        order.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        for (weight, key) in order {
            let slot = set.best_fit(weight).unwrap_or_else(|| set.open(None));
            set.insert(slot, key, weight);
        }

        let mut unchanged = 0;
        if self.aggression == Aggression::KeepPacked {
            unchanged = set.take_unchanged().len();
        }
        set.redistribute(self.half(), weights.len().saturating_mul(set.len()));
        if self.aggression == Aggression::KeepBalanced {
            unchanged = set.take_unchanged().len();
        }
        let merged = set.merge_light(self.half());

        let mut giant_members: Vec<(u32, K)> = giant.map(|(key, w)| (w, key)).into_iter().collect();
        if self.no_tiny {
            if let Some((tiny, partner)) = set.tiny_pair(self.half()) {
                let fits = partner.is_some_and(|partner| {
                    set.weight(partner) + set.weight(tiny) <= u64::from(self.capacity)
                });
                match partner {
                    Some(partner) if fits || giant_members.is_empty() => set.absorb(partner, tiny),
                    _ if !giant_members.is_empty() => {
                        if let Some(bin) = set.take(tiny) {
                            giant_members.extend(bin.members);
                        }
                    }
                    _ => {}
                }
            }
        }

        let mut bins: Vec<(Option<u64>, Vec<(u32, K)>)> = set
            .into_bins()
            .map(|bin| (bin.origin, bin.members.into_iter().collect()))
            .collect();
        if !giant_members.is_empty() {
            bins.push((None, giant_members));
        }
        Packing {
            bins,
            unchanged,
            merged,
        }
    }

    /// Load the data of every packed element that has none, along with the
    /// stored bins the packed bins were rebuilt from. Returns the stored
    /// bins that were loaded.
    fn load_packed<K, T>(
        &mut self,
        tasks: &mut BTreeMap<K, PushTask<T>>,
        bins: &[(Option<u64>, Vec<(u32, K)>)],
        meta: Option<&str>,
    ) -> Result<BTreeMap<u64, BTreeMap<K, T>>, TaskError>
    where
        K: Ord + Clone + Debug,
        T: Clone,
        S: Serializer<u64, BTreeMap<K, T>>,
    {
        let unloaded: Vec<&K> = bins
            .iter()
            .flat_map(|(_, members)| members.iter().map(|(_, key)| key))
            .filter(|key| tasks.get(*key).is_some_and(|task| task.data.is_none()))
            .collect();
        let mut wanted: BTreeSet<u64> = bins.iter().filter_map(|(origin, _)| *origin).collect();
        for key in &unloaded {
            let bin = tasks
                .get(*key)
                .and_then(|task| task.meta.as_ref())
                .and_then(|location| location.bin)
                .ok_or_else(|| {
                    TaskError::DataFormat(format!("element {key:?} is not loaded and names no bin"))
                })?;
            wanted.insert(bin);
        }

        let stored = self
            .fetch_bins(&wanted, meta)
            .map_err(|err| err.context("could not load bin members for repacking"))?;
        for key in unloaded {
            let Some(task) = tasks.get_mut(key) else {
                continue;
            };
            let bin = task.meta.as_ref().and_then(|location| location.bin);
            let data = bin
                .and_then(|bin| stored.get(&bin))
                .and_then(|contents| contents.get(key))
                .cloned()
                .ok_or_else(|| {
                    TaskError::fatal(format!("bin {bin:?} does not hold element {key:?}"))
                })?;
            task.data = Some(data);
        }
        Ok(stored)
    }

    /// Give every packed bin its id. A stored bin whose every element is
    /// repacked here has no other readers and keeps its id; every other bin
    /// gets a fresh one. Returns the bins and how many kept their id.
    fn assign_ids<K, T>(
        &mut self,
        bins: Vec<(Option<u64>, Vec<(u32, K)>)>,
        stored: &BTreeMap<u64, BTreeMap<K, T>>,
    ) -> (Vec<(u64, Vec<(u32, K)>)>, usize)
    where
        K: Ord,
    {
        let rewritten: BTreeSet<&K> = bins
            .iter()
            .flat_map(|(_, members)| members.iter().map(|(_, key)| key))
            .collect();
        let owned: Vec<Option<u64>> = bins
            .iter()
            .map(|&(origin, _)| {
                origin.filter(|bin| {
                    stored
                        .get(bin)
                        .is_some_and(|contents| contents.keys().all(|key| rewritten.contains(key)))
                })
            })
            .collect();

        let reused = owned.iter().flatten().count();
        let written = bins
            .into_iter()
            .zip(owned)
            .map(|((_, members), own)| (own.unwrap_or_else(|| self.ids.next_id()), members))
            .collect();
        (written, reused)
    }

    /// Write every bin in `written` through the bin serializer.
    fn store_bins<K, T>(
        &mut self,
        tasks: &BTreeMap<K, PushTask<T>>,
        written: &[(u64, Vec<(u32, K)>)],
        meta: Option<&str>,
    ) -> Result<(), TaskError>
    where
        K: Ord + Clone + Debug,
        T: Clone,
        S: Serializer<u64, BTreeMap<K, T>>,
    {
        let mut requests: BTreeMap<u64, PushTask<BTreeMap<K, T>>> = BTreeMap::new();
        for (id, members) in written {
            let mut contents = BTreeMap::new();
            for (_, key) in members {
                let data = tasks
                    .get(key)
                    .and_then(|task| task.data.clone())
                    .ok_or_else(|| TaskError::DataFormat(format!("no data for element {key:?}")))?;
                contents.insert(key.clone(), data);
            }
            requests.insert(
                *id,
                PushTask {
                    data: Some(contents),
                    meta: Some(Location::bin(*id)),
                },
            );
        }
        self.bins
            .push(&mut requests, meta)
            .map_err(|err| err.context(format!("could not store {} bins", requests.len())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::MemoryArchive;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::cell::RefCell;
    use std::rc::Rc;

    type Store = MemoryArchive<BTreeMap<u32, u32>>;

    /// Elements are their own weight.
    fn packer(capacity: u32, no_tiny: bool) -> (Packer<Store, fn(&u32) -> u32>, Store) {
        let store = Store::new("bin");
        let weigh: fn(&u32) -> u32 = |v| *v;
        let packer = Packer::new(store.clone(), weigh, capacity, no_tiny).expect("packer");
        (packer, store)
    }

    fn tasks(weights: &[u32]) -> BTreeMap<u32, PushTask<u32>> {
        (0u32..)
            .zip(weights)
            .map(|(key, &w)| (key, PushTask::new(w)))
            .collect()
    }

    /// Bin id to total weight, read back from the store.
    fn fills(tasks: &BTreeMap<u32, PushTask<u32>>) -> BTreeMap<u64, u64> {
        let mut fills = BTreeMap::new();
        for task in tasks.values() {
            let location = task.meta.as_ref().expect("location");
            *fills.entry(location.bin.expect("bin")).or_default() +=
                u64::from(location.weight.expect("weight"));
        }
        fills
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let weigh: fn(&u32) -> u32 = |v| *v;
        assert!(matches!(
            Packer::new(Store::new("bin"), weigh, 0, false),
            Err(TaskError::IllegalArgument(_))
        ));
        assert!(Aggression::try_from(4u8).is_err());
        assert_eq!(Aggression::try_from(2u8).expect("valid"), Aggression::KeepBalanced);
    }

    #[test]
    fn test_small_example_fills_bins_at_least_half() {
        let (mut packer, store) = packer(10, false);
        let mut batch = tasks(&[7, 6, 5, 4, 3, 2, 1]);
        packer.push(&mut batch, Some("t")).expect("push");

        let fills = fills(&batch);
        assert_eq!(fills.values().sum::<u64>(), 28);
        assert!(fills.values().filter(|&&w| w < 5).count() <= 1, "{fills:?}");
        assert!(fills.values().all(|&w| w <= 10));
        assert_eq!(store.len(), fills.len());
    }

    #[test]
    fn test_random_batches_keep_packing_invariants() {
        let mut rng = StdRng::seed_from_u64(11);
        for round in 0..200 {
            let capacity = rng.random_range(2..64);
            let count = rng.random_range(1..80);
            let weights: Vec<u32> = (0..count).map(|_| rng.random_range(1..=capacity)).collect();
            let (mut packer, store) = packer(capacity, false);
            let mut batch = tasks(&weights);
            packer.push(&mut batch, Some("t")).expect("push");

            let half = u64::from(capacity >> 1);
            let fills = fills(&batch);
            assert!(
                fills.values().filter(|&&w| w < half).count() <= 1,
                "round {round}: {fills:?}"
            );
            assert!(fills.values().all(|&w| w <= u64::from(capacity)));

            let mut stored: Vec<u32> = Vec::new();
            for bin in fills.keys() {
                let contents = store.get(&Location::bin(*bin), Some("t")).expect("bin");
                stored.extend(contents.keys());
            }
            stored.sort_unstable();
            assert_eq!(stored, batch.keys().copied().collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_pull_returns_bin_mates_as_extras() {
        let (mut packer, _) = packer(10, false);
        let mut batch = tasks(&[4, 3, 2]);
        packer.push(&mut batch, None).expect("push");
        assert_eq!(fills(&batch).len(), 1);

        let mut pulls = BTreeMap::from([(1u32, PullTask::new(batch[&1].meta.clone().expect("meta")))]);
        packer.pull(&mut pulls, None).expect("pull");
        assert_eq!(pulls.len(), 3);
        assert_eq!(pulls[&1].data, Some(3));
        assert_eq!(pulls[&2].meta.weight, Some(2));

        let err = packer.pull(&mut pulls, None).expect_err("complete");
        assert!(err.is_complete());
    }

    #[test]
    fn test_pull_of_missing_member_is_fatal() {
        let (mut packer, store) = packer(10, false);
        store.insert("-/bin/5", BTreeMap::from([(1, 1)]));
        let mut pulls = BTreeMap::from([(9u32, PullTask::new(Location::packed(5, 1)))]);
        let err = packer.pull(&mut pulls, None).expect_err("missing");
        assert!(!err.is_retryable());
        assert!(matches!(err, TaskError::Abort { .. }));
    }

    #[test]
    fn test_oversized_elements() {
        let (mut strict, _) = packer(10, false);
        let err = strict.push(&mut tasks(&[3, 11]), None).expect_err("oversized");
        assert!(matches!(err, TaskError::IllegalArgument(_)));

        let (mut lenient, _) = packer(10, true);
        let mut batch = tasks(&[3, 11]);
        lenient.push(&mut batch, None).expect("one giant is allowed");
        assert_eq!(fills(&batch).len(), 1);

        let err = lenient.push(&mut tasks(&[12, 11]), None).expect_err("two giants");
        assert!(matches!(err, TaskError::IllegalArgument(_)));
    }

    #[test]
    fn test_no_tiny_merges_light_bin() {
        let (mut packer, _) = packer(10, true);
        let mut batch = tasks(&[6, 1]);
        packer.push(&mut batch, None).expect("push");
        assert_eq!(fills(&batch).values().copied().collect::<Vec<_>>(), vec![7]);

        let (mut packer, _) = self::packer(10, true);
        let mut batch = tasks(&[9, 8, 2]);
        packer.push(&mut batch, None).expect("push");
        let fills = fills(&batch);
        assert_eq!(fills.values().sum::<u64>(), 19);
        assert_eq!(fills.len(), 2);
    }

    #[test]
    fn test_no_tiny_merges_past_capacity() {
        let (mut packer, store) = packer(10, true);
        let mut batch = tasks(&[9, 8, 3]);
        packer.push(&mut batch, None).expect("push");

        let mut weights: Vec<u64> = fills(&batch).into_values().collect();
        weights.sort_unstable();
        assert_eq!(weights, vec![9, 11]);
        assert_eq!(store.len(), 2);
        assert_eq!(batch[&1].meta.as_ref().and_then(|m| m.bin), batch[&2].meta.as_ref().and_then(|m| m.bin));
    }

    #[test]
    fn test_unchanged_bins_are_not_rewritten() {
        let (mut packer, store) = packer(10, false);
        let mut first = tasks(&[9, 8]);
        packer.push(&mut first, None).expect("push");
        let stored = store.stats().pushes;

        let mut second: BTreeMap<u32, PushTask<u32>> = first
            .iter()
            .map(|(k, t)| (*k, PushTask::stored(t.meta.clone().expect("meta"))))
            .collect();
        second.insert(2, PushTask::new(5));
        packer.push(&mut second, None).expect("push");

        assert_eq!(store.stats().pushes, stored + 1);
        assert_eq!(second[&0].meta, first[&0].meta);
        assert_eq!(second[&1].meta, first[&1].meta);
        assert_ne!(second[&2].meta.as_ref().and_then(|m| m.bin), first[&0].meta.as_ref().and_then(|m| m.bin));
    }

    #[test]
    fn test_repack_loads_everything() {
        let (packer, store) = packer(10, false);
        let mut packer = packer.with_aggression(Aggression::Repack);
        let mut first = tasks(&[9, 8]);
        packer.push(&mut first, None).expect("push");

        let mut second: BTreeMap<u32, PushTask<u32>> = first
            .iter()
            .map(|(k, t)| (*k, PushTask::stored(t.meta.clone().expect("meta"))))
            .collect();
        packer.push(&mut second, None).expect("push");
        assert_eq!(second[&0].data, Some(9));
        assert_ne!(second[&0].meta, first[&0].meta);
        assert_eq!(store.stats().pushes, 4);
    }

    #[test]
    fn test_skip_unloaded_leaves_stored_elements_alone() {
        let (packer, _) = packer(10, false);
        let mut packer = packer.with_aggression(Aggression::SkipUnloaded);
        let mut batch = BTreeMap::from([
            (0u32, PushTask::stored(Location::packed(40, 3))),
            (1, PushTask::new(4)),
        ]);
        packer.push(&mut batch, None).expect("push");
        assert_eq!(batch[&0].meta, Some(Location::packed(40, 3)));
        assert_eq!(batch[&1].meta.as_ref().and_then(|m| m.bin), Some(41));
    }

    #[test]
    fn test_repush_of_loaded_elements_repacks_them() {
        for aggression in [Aggression::KeepPacked, Aggression::KeepBalanced] {
            let (packer, store) = packer(10, false);
            let mut packer = packer.with_aggression(aggression);
            let mut first = tasks(&[6, 4, 6, 4]);
            packer.push(&mut first, None).expect("push");
            assert_eq!(fills(&first).into_values().collect::<Vec<_>>(), vec![10, 10]);

            let mut second: BTreeMap<u32, PushTask<u32>> = [1u32, 3]
                .into_iter()
                .map(|key| {
                    let task = PushTask {
                        data: Some(4),
                        meta: first[&key].meta.clone(),
                    };
                    (key, task)
                })
                .collect();
            packer.push(&mut second, None).expect("push");
            let fills = fills(&second);
            assert_eq!(fills.into_values().collect::<Vec<_>>(), vec![8], "{aggression:?}");

            for key in [0u32, 2] {
                let location = first[&key].meta.as_ref().expect("meta");
                let bin = store.get(location, None).expect("old bin");
                assert_eq!(bin.get(&key), Some(&6));
            }
        }
    }

    #[test]
    fn test_fully_repacked_bin_keeps_its_id() {
        let (mut packer, store) = packer(10, false);
        let mut first = tasks(&[6, 4]);
        packer.push(&mut first, None).expect("push");
        let location = first[&0].meta.clone().expect("meta");
        assert_eq!(store.len(), 1);

        let mut second = BTreeMap::from([
            (0u32, PushTask::stored(location.clone())),
            (1, PushTask::new(3)),
        ]);
        packer.push(&mut second, None).expect("push");
        assert_eq!(second[&0].meta.as_ref().and_then(|m| m.bin), location.bin);
        assert_eq!(second[&1].meta.as_ref().and_then(|m| m.bin), location.bin);
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.get(&location, None).expect("bin"),
            BTreeMap::from([(0, 6), (1, 3)])
        );
    }

    #[test]
    fn test_bin_with_outside_readers_is_not_overwritten() {
        let (mut packer, store) = packer(10, false);
        let mut first = tasks(&[6, 4]);
        packer.push(&mut first, None).expect("push");
        let location = first[&0].meta.clone().expect("meta");

        let mut second = BTreeMap::from([
            (0u32, PushTask::stored(location.clone())),
            (5, PushTask::new(3)),
        ]);
        packer.push(&mut second, None).expect("push");
        assert_ne!(second[&5].meta.as_ref().and_then(|m| m.bin), location.bin);
        assert_eq!(store.len(), 2);

        let mut pulls = BTreeMap::from([(1u32, PullTask::new(first[&1].meta.clone().expect("meta")))]);
        packer.pull(&mut pulls, None).expect("pull");
        assert_eq!(pulls[&1].data, Some(4));
    }

    #[test]
    fn test_reopened_packer_does_not_reuse_bin_ids() {
        let (mut first, store) = packer(10, false);
        let mut batch = tasks(&[6]);
        first.push(&mut batch, None).expect("push");
        let location = batch[&0].meta.clone().expect("meta");

        let weigh: fn(&u32) -> u32 = |v| *v;
        let mut reopened = Packer::new(store.clone(), weigh, 10, false)
            .expect("packer")
            .with_ids(first.ids().clone());
        let mut other = BTreeMap::from([(7u32, PushTask::new(5))]);
        reopened.push(&mut other, None).expect("push");
        assert_ne!(other[&7].meta.as_ref().and_then(|m| m.bin), location.bin);

        let mut pulls = BTreeMap::from([(0u32, PullTask::new(location))]);
        reopened.pull(&mut pulls, None).expect("pull");
        assert_eq!(pulls[&0].data, Some(6));
        assert_eq!(store.len(), 2);
    }

    /// Bin store that remembers which bins were written.
    struct Recording {
        store: Store,
        written: Rc<RefCell<BTreeSet<u64>>>,
    }

    impl Serializer<u64, BTreeMap<u32, u32>> for Recording {
        fn pull(
            &mut self,
            tasks: &mut BTreeMap<u64, PullTask<BTreeMap<u32, u32>>>,
            meta: Option<&str>,
        ) -> Result<(), TaskError> {
            self.store.pull(tasks, meta)
        }

        fn push(
            &mut self,
            tasks: &mut BTreeMap<u64, PushTask<BTreeMap<u32, u32>>>,
            meta: Option<&str>,
        ) -> Result<(), TaskError> {
            self.written.borrow_mut().extend(tasks.keys().copied());
            self.store.push(tasks, meta)
        }
    }

    #[test]
    fn test_repeated_pushes_keep_packing_invariants() {
        let cases = [
            Aggression::SkipUnloaded,
            Aggression::KeepPacked,
            Aggression::KeepBalanced,
            Aggression::Repack,
        ]
        .into_iter()
        .flat_map(|aggression| [(aggression, false), (aggression, true)]);

        for (seed, (aggression, no_tiny)) in (29u64..).zip(cases) {
            let mut rng = StdRng::seed_from_u64(seed);
            let capacity: u32 = rng.random_range(4..40);
            let half = u64::from(capacity >> 1);
            let store = Store::new("bin");
            let written = Rc::new(RefCell::new(BTreeSet::new()));
            let recording = Recording {
                store: store.clone(),
                written: Rc::clone(&written),
            };
            let weigh: fn(&u32) -> u32 = |v| *v;
            let mut packer = Packer::new(recording, weigh, capacity, no_tiny)
                .expect("packer")
                .with_aggression(aggression);

            // Two groups of elements share the store, the way the values of
            // two tree nodes do, and are pushed in turn.
            let mut values: BTreeMap<u32, u32> = BTreeMap::new();
            let mut locations: BTreeMap<u32, Location> = BTreeMap::new();
            let mut next_key = 0u32;
            for round in 0u32..40 {
                let group = round % 2;
                let mut loaded = BTreeSet::new();
                let members: Vec<u32> = values.keys().copied().filter(|k| k % 2 == group).collect();
                for key in members {
                    match rng.random_range(0..8) {
                        0 => {
                            values.remove(&key);
                            locations.remove(&key);
                        }
                        1 => {
                            values.insert(key, rng.random_range(1..=capacity));
                            loaded.insert(key);
                        }
                        2 | 3 => {
                            loaded.insert(key);
                        }
                        _ => {}
                    }
                }
                for _ in 0..rng.random_range(0..8) {
                    let key = next_key * 2 + group;
                    next_key += 1;
                    values.insert(key, rng.random_range(1..=capacity));
                    loaded.insert(key);
                }

                let mut batch: BTreeMap<u32, PushTask<u32>> = BTreeMap::new();
                for (&key, &value) in values.iter().filter(|(k, _)| *k % 2 == group) {
                    let task = match locations.get(&key) {
                        Some(location) if !loaded.contains(&key) => PushTask::stored(location.clone()),
                        location => PushTask {
                            data: Some(value),
                            meta: location.cloned(),
                        },
                    };
                    batch.insert(key, task);
                }
                written.borrow_mut().clear();
                packer.push(&mut batch, Some("t")).expect("push");
                for (key, task) in batch {
                    locations.insert(key, task.meta.expect("location"));
                }

                let context = format!("{aggression:?} no_tiny={no_tiny} cap={capacity} round {round}");
                for (key, value) in &values {
                    let location = &locations[key];
                    assert_eq!(location.weight, Some(*value), "{context}: key {key}");
                    let bin = store
                        .get(&Location::bin(location.bin.expect("bin")), Some("t"))
                        .expect("stored bin");
                    assert_eq!(bin.get(key), Some(value), "{context}: key {key}");
                }

                let fills: Vec<u64> = written
                    .borrow()
                    .iter()
                    .map(|&bin| {
                        let contents = store.get(&Location::bin(bin), Some("t")).expect("written bin");
                        contents.values().map(|&w| u64::from(w)).sum()
                    })
                    .collect();
                let light = fills.iter().filter(|&&w| w < half).count();
                if no_tiny {
                    assert!(fills.len() < 2 || light == 0, "{context}: {fills:?}");
                    assert!(fills.iter().all(|&w| w <= u64::from(capacity) + half), "{context}: {fills:?}");
                } else {
                    assert!(light <= 1, "{context}: {fills:?}");
                    assert!(fills.iter().all(|&w| w <= u64::from(capacity)), "{context}: {fills:?}");
                }
            }
        }
    }
}
