//! Main simulator harness for deterministic simulation testing.
//!
//! Drives a [`SkeletonBTree`] whose nodes live in one [`MemoryArchive`]
//! and whose values are packed into bins in another, mirroring every
//! successful mutation in a `BTreeMap` model.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use super::invariants::{InvariantChecker, InvariantViolation, Operation, OperationHistory};
use crate::config::IndexConfig;
use crate::packer::{Aggression, ByteLength, Packer};
use crate::serial::{FaultConfig, MemoryArchive};
use crate::skeleton::{NodeDoc, SkeletonBTree, SkeletonError};

type SimTree = SkeletonBTree<u32, String>;

/// Configuration for the simulator.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Random seed for reproducibility.
    pub seed: u64,
    pub node_min: usize,
    pub bin_capacity: u32,
    pub no_tiny: bool,
    pub aggression: Aggression,
    /// Concurrent fetches during scheduled inflate.
    pub inflate_workers: usize,
    /// Keys are drawn from `0..key_space`.
    pub key_space: u32,
    /// How often a retryable failure is retried before giving up.
    pub max_retries: usize,
    /// Fault injection for both archives.
    pub fault_config: FaultConfig,
}

impl SimulatorConfig {
    /// Create a new simulator config with the given seed.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            node_min: 2,
            bin_capacity: 64,
            no_tiny: true,
            aggression: Aggression::default(),
            inflate_workers: 2,
            key_space: 256,
            max_retries: 8,
            fault_config: FaultConfig::no_faults(),
        }
    }

    /// Take tree and packer settings from an index configuration.
    #[must_use]
    pub fn from_index_config(config: &IndexConfig) -> Self {
        Self {
            node_min: config.node_min,
            bin_capacity: config.bin_capacity,
            no_tiny: config.no_tiny,
            aggression: config.aggression,
            inflate_workers: config.inflate_workers,
            ..Self::new(config.sim_seed)
        }
    }

    #[must_use]
    pub fn with_fault_config(mut self, config: FaultConfig) -> Self {
        self.fault_config = config;
        self
    }

    #[must_use]
    pub const fn with_node_min(mut self, node_min: usize) -> Self {
        self.node_min = node_min;
        self
    }

    #[must_use]
    pub const fn with_aggression(mut self, aggression: Aggression) -> Self {
        self.aggression = aggression;
        self
    }

    #[must_use]
    pub const fn with_inflate_workers(mut self, workers: usize) -> Self {
        self.inflate_workers = workers;
        self
    }
}

/// Results from a simulation run.
#[derive(Debug)]
pub struct SimulationResult {
    /// The seed used for this simulation.
    pub seed: u64,
    pub operations_processed: u64,
    pub successful_operations: u64,
    /// Operations that failed even after retrying.
    pub failed_operations: u64,
    /// Retries caused by retryable failures.
    pub retries: u64,
    /// Number of entries at the end of the run.
    pub final_size: usize,
    pub invariant_violations: Vec<InvariantViolation>,
    /// Whether the simulation ran to the end.
    pub completed_successfully: bool,
    /// Error message if simulation failed.
    pub error: Option<String>,
}

impl SimulationResult {
    /// Check if the simulation passed (no invariant violations).
    #[must_use]
    pub const fn passed(&self) -> bool {
        self.completed_successfully && self.invariant_violations.is_empty()
    }
}

/// The main simulator harness.
pub struct Simulator {
    config: SimulatorConfig,
    rng: StdRng,
    history: OperationHistory,
    checker: InvariantChecker,
    retries: u64,
}

impl Simulator {
    #[must_use]
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            history: OperationHistory::new(),
            checker: InvariantChecker::new(),
            retries: 0,
        }
    }

    /// Run `operation_count` random operations against a fresh tree.
    ///
    /// Invariants are checked after every operation. At the end, faults are
    /// switched off and the whole tree is loaded and compared to the model.
    ///
    /// Must not be called from within an async runtime.
    pub fn run(&mut self, operation_count: usize) -> SimulationResult {
        let runtime = match tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.config.inflate_workers.max(1))
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => return self.aborted(format!("Failed to create runtime: {e}")),
        };

        let faults = self.config.fault_config.clone();
        let nodes: MemoryArchive<NodeDoc<u32>> =
            MemoryArchive::with_faults("node", self.config.seed, faults.clone());
        let bins: MemoryArchive<BTreeMap<u32, String>> =
            MemoryArchive::with_faults("bin", self.config.seed.wrapping_add(1), faults);

        let mut skeleton = match self.build_tree(&nodes, &bins) {
            Ok(skeleton) => skeleton,
            Err(e) => return self.aborted(format!("Failed to create tree: {e}")),
        };

        let mut model = BTreeMap::new();
        for index in 0..operation_count {
            let operation = self.next_operation();
            let error = self
                .apply(&runtime, &mut skeleton, &mut model, operation, index)
                .err()
                .map(|e| e.to_string());
            if let Some(message) = &error {
                debug!(index, ?operation, error = %message, "operation failed");
            }
            self.history.record(operation, error);

            self.checker.check_structure(&skeleton, model.len(), index);
            if skeleton.is_live() {
                self.checker.check_contents(&skeleton, &model, index);
            }
        }

        nodes.set_fault_config(FaultConfig::no_faults());
        bins.set_fault_config(FaultConfig::no_faults());
        match skeleton.inflate() {
            Ok(()) => self.checker.check_contents(&skeleton, &model, operation_count),
            Err(e) => self.checker.add_violation(InvariantViolation {
                description: "Final inflate failed".to_string(),
                operation_index: operation_count,
                context: e.to_string(),
            }),
        }

        let failed = self.history.failures().len() as u64;
        SimulationResult {
            seed: self.config.seed,
            operations_processed: self.history.len() as u64,
            successful_operations: self.history.len() as u64 - failed,
            failed_operations: failed,
            retries: self.retries,
            final_size: skeleton.len(),
            invariant_violations: self.checker.violations().to_vec(),
            completed_successfully: true,
            error: None,
        }
    }

    fn build_tree(
        &self,
        nodes: &MemoryArchive<NodeDoc<u32>>,
        bins: &MemoryArchive<BTreeMap<u32, String>>,
    ) -> Result<SimTree, SkeletonError> {
        let packer = Packer::new(
            bins.clone(),
            ByteLength,
            self.config.bin_capacity,
            self.config.no_tiny,
        )?
        .with_aggression(self.config.aggression);
        let mut skeleton =
            SkeletonBTree::new(self.config.node_min)?.with_meta(format!("sim-{}", self.config.seed));
        skeleton.set_serializers(Box::new(nodes.clone()), Box::new(packer))?;
        Ok(skeleton)
    }

    fn aborted(&self, error: String) -> SimulationResult {
        SimulationResult {
            seed: self.config.seed,
            operations_processed: 0,
            successful_operations: 0,
            failed_operations: 0,
            retries: 0,
            final_size: 0,
            invariant_violations: vec![],
            completed_successfully: false,
            error: Some(error),
        }
    }

    fn next_operation(&mut self) -> Operation {
        match self.rng.random_range(0..100) {
            0..40 => Operation::Put,
            40..60 => Operation::Remove,
            60..80 => Operation::Get,
            80..88 => Operation::DeflateKey,
            88..93 => Operation::Deflate,
            93..97 => Operation::Inflate,
            _ => Operation::InflateScheduled,
        }
    }

    fn next_key(&mut self) -> u32 {
        self.rng.random_range(0..self.config.key_space.max(1))
    }

    /// Run one operation, retrying retryable failures, and update the model
    /// if it succeeded.
    fn apply(
        &mut self,
        runtime: &tokio::runtime::Runtime,
        skeleton: &mut SimTree,
        model: &mut BTreeMap<u32, String>,
        operation: Operation,
        index: usize,
    ) -> Result<(), SkeletonError> {
        match operation {
            Operation::Put => {
                let key = self.next_key();
                let padding = self.rng.random_range(0..24);
                let value = format!("{key}:{index}:{}", "x".repeat(padding));
                let previous = self.retry(skeleton, |s| s.put(key, value.clone()))?;
                let expected = model.insert(key, value);
                if previous.is_some() {
                    self.checker
                        .check_read(&key, previous.as_ref(), expected.as_ref(), index);
                }
            }
            Operation::Remove => {
                let key = self.next_key();
                let removed = self.retry(skeleton, |s| s.remove(&key))?;
                let expected = model.remove(&key);
                self.checker
                    .check_read(&key, removed.as_ref(), expected.as_ref(), index);
            }
            Operation::Get => {
                let key = self.next_key();
                let found = self.retry(skeleton, |s| s.get(&key).map(Option::<&String>::cloned))?;
                self.checker
                    .check_read(&key, found.as_ref(), model.get(&key), index);
            }
            Operation::DeflateKey => {
                let key = self.next_key();
                self.retry(skeleton, |s| s.deflate_key(&key))?;
            }
            Operation::Deflate => self.retry(skeleton, SkeletonBTree::deflate)?,
            Operation::Inflate => self.retry(skeleton, SkeletonBTree::inflate)?,
            Operation::InflateScheduled => {
                let workers = self.config.inflate_workers;
                self.retry(skeleton, |s| runtime.block_on(s.inflate_scheduled(workers)))?;
            }
        }
        Ok(())
    }

    fn retry<T>(
        &mut self,
        skeleton: &mut SimTree,
        mut op: impl FnMut(&mut SimTree) -> Result<T, SkeletonError>,
    ) -> Result<T, SkeletonError> {
        let mut attempts = 0;
        loop {
            match op(skeleton) {
                Err(e) if e.is_retryable() && attempts < self.config.max_retries => {
                    attempts += 1;
                    self.retries += 1;
                }
                result => return result,
            }
        }
    }

    #[must_use]
    pub const fn history(&self) -> &OperationHistory {
        &self.history
    }

    #[must_use]
    pub const fn checker(&self) -> &InvariantChecker {
        &self.checker
    }
}
