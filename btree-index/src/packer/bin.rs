//! Bins and the packing passes that fill them.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

/// One bin under construction.
#[derive(Debug, Clone)]
pub(crate) struct Bin<K> {
    /// Id of the stored bin this one was initialised from.
    pub(crate) origin: Option<u64>,
    /// Members ordered by weight, lightest first.
    pub(crate) members: BTreeSet<(u32, K)>,
    pub(crate) weight: u64,
    /// Keys the bin held when it was initialised.
    original: BTreeSet<K>,
}

impl<K: Ord + Clone> Bin<K> {
    const fn new(origin: Option<u64>) -> Self {
        Self {
            origin,
            members: BTreeSet::new(),
            weight: 0,
            original: BTreeSet::new(),
        }
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = &K> {
        self.members.iter().map(|(_, key)| key)
    }

    /// Whether the bin holds exactly what it was initialised with.
    fn is_unchanged(&self) -> bool {
        self.origin.is_some()
            && self.members.len() == self.original.len()
            && self.keys().all(|key| self.original.contains(key))
    }
}

/// Bins indexed by fill level.
///
/// # Invariants
///
/// - `index` holds `(Reverse(weight), slot)` for every bin in `bins`, so
///   iterating it visits the fullest bin first
#[derive(Debug)]
pub(crate) struct BinSet<K> {
    capacity: u64,
    bins: BTreeMap<usize, Bin<K>>,
    index: BTreeSet<(Reverse<u64>, usize)>,
    next_slot: usize,
}

impl<K: Ord + Clone> BinSet<K> {
    pub(crate) fn new(capacity: u32) -> Self {
        Self {
            capacity: u64::from(capacity),
            bins: BTreeMap::new(),
            index: BTreeSet::new(),
            next_slot: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.bins.len()
    }

    pub(crate) fn weight(&self, slot: usize) -> u64 {
        self.bins.get(&slot).map_or(0, |bin| bin.weight)
    }

    /// Open an empty bin.
    pub(crate) fn open(&mut self, origin: Option<u64>) -> usize {
        let slot = self.next_slot;
        self.next_slot += 1;
        self.bins.insert(slot, Bin::new(origin));
        self.index.insert((Reverse(0), slot));
        slot
    }

    pub(crate) fn insert(&mut self, slot: usize, key: K, weight: u32) {
        if let Some(bin) = self.bins.get_mut(&slot) {
            self.index.remove(&(Reverse(bin.weight), slot));
            bin.weight += u64::from(weight);
            bin.members.insert((weight, key));
            self.index.insert((Reverse(bin.weight), slot));
        }
    }

    /// Add a member the stored bin already held.
    pub(crate) fn insert_original(&mut self, slot: usize, key: K, weight: u32) {
        if let Some(bin) = self.bins.get_mut(&slot) {
            bin.original.insert(key.clone());
        }
        self.insert(slot, key, weight);
    }

    fn remove(&mut self, slot: usize, member: &(u32, K)) -> bool {
        let Some(bin) = self.bins.get_mut(&slot) else {
            return false;
        };
        if !bin.members.remove(member) {
            return false;
        }
        self.index.remove(&(Reverse(bin.weight), slot));
        bin.weight -= u64::from(member.0);
        self.index.insert((Reverse(bin.weight), slot));
        true
    }

    /// The fullest bin with room for `weight`.
    pub(crate) fn best_fit(&self, weight: u32) -> Option<usize> {
        let room = self.capacity.checked_sub(u64::from(weight))?;
        self.index
            .range((Reverse(room), 0)..)
            .next()
            .map(|&(_, slot)| slot)
    }

    /// Evict members, heaviest first, from every bin over capacity.
    /// Returns the evicted members.
    pub(crate) fn evict_overfull(&mut self) -> Vec<(u32, K)> {
        let overfull: Vec<usize> = self
            .index
            .iter()
            .take_while(|(Reverse(weight), _)| *weight > self.capacity)
            .map(|&(_, slot)| slot)
            .collect();
        let mut evicted = Vec::new();
        for slot in overfull {
            while self.weight(slot) > self.capacity {
                let Some(member) = self
                    .bins
                    .get(&slot)
                    .and_then(|bin| bin.members.last().cloned())
                else {
                    break;
                };
                self.remove(slot, &member);
                evicted.push(member);
            }
        }
        evicted
    }

    /// Remove and return the bins that hold exactly what they were
    /// initialised with.
    pub(crate) fn take_unchanged(&mut self) -> Vec<Bin<K>> {
        let slots: Vec<usize> = self
            .bins
            .iter()
            .filter(|(_, bin)| bin.is_unchanged())
            .map(|(&slot, _)| slot)
            .collect();
        slots
            .into_iter()
            .filter_map(|slot| self.take(slot))
            .collect()
    }

    /// Even out fill levels.
    ///
    /// Repeatedly moves the lightest member of the fullest bin into the
    /// emptiest bin, as long as that narrows the gap between them and
    /// leaves the fullest bin at least `half` full. A bin that cannot give
    /// anything away is final.
    pub(crate) fn redistribute(&mut self, half: u64, max_steps: usize) {
        let Some(&(_, mut smallest)) = self.index.last() else {
            return;
        };
        let mut queue = self.index.clone();
        queue.remove(&(Reverse(self.weight(smallest)), smallest));

        let mut steps = 0;
        while let Some((Reverse(heavy), fullest)) = queue.pop_first() {
            if steps >= max_steps {
                break;
            }
            steps += 1;

            let light = self.weight(smallest);
            let Some(member) = self
                .bins
                .get(&fullest)
                .and_then(|bin| bin.members.first().cloned())
            else {
                continue;
            };
            let weight = u64::from(member.0);
            if weight == 0 || weight >= heavy.saturating_sub(light) || heavy - weight < half {
                continue;
            }

            self.remove(fullest, &member);
            let (member_weight, key) = member;
            self.insert(smallest, key, member_weight);
            if self.weight(fullest) < self.weight(smallest) {
                queue.insert((Reverse(self.weight(smallest)), smallest));
                smallest = fullest;
            } else {
                queue.insert((Reverse(self.weight(fullest)), fullest));
            }
        }
    }

    /// Merge the two emptiest bins for as long as both are lighter than
    /// `half`. Returns the number of merges.
    ///
    /// Two bins under half of the capacity always fit in one, so afterwards
    /// at most one bin is lighter than `half`.
    pub(crate) fn merge_light(&mut self, half: u64) -> usize {
        let mut merged = 0;
        loop {
            let mut lightest = self.index.iter().rev();
            let (Some(&(_, tiny)), Some(&(Reverse(next_weight), next))) =
                (lightest.next(), lightest.next())
            else {
                break;
            };
            if next_weight >= half {
                break;
            }
            self.absorb(next, tiny);
            merged += 1;
        }
        merged
    }

    /// The emptiest bin, if it is lighter than `half`, and the next
    /// emptiest bin if there is one.
    pub(crate) fn tiny_pair(&self, half: u64) -> Option<(usize, Option<usize>)> {
        let mut lightest = self.index.iter().rev();
        let &(Reverse(weight), tiny) = lightest.next()?;
        if weight >= half {
            return None;
        }
        Some((tiny, lightest.next().map(|&(_, slot)| slot)))
    }

    /// Move every member of bin `from` into bin `into`.
    pub(crate) fn absorb(&mut self, into: usize, from: usize) {
        let Some(bin) = self.bins.remove(&from) else {
            return;
        };
        self.index.remove(&(Reverse(bin.weight), from));
        for (weight, key) in bin.members {
            self.insert(into, key, weight);
        }
    }

    /// Remove bin `slot` from the set.
    pub(crate) fn take(&mut self, slot: usize) -> Option<Bin<K>> {
        let bin = self.bins.remove(&slot)?;
        self.index.remove(&(Reverse(bin.weight), slot));
        Some(bin)
    }

    pub(crate) fn into_bins(self) -> impl Iterator<Item = Bin<K>> {
        self.bins.into_values().filter(|bin| !bin.members.is_empty())
    }
}
