//! Deterministic Simulation Testing (DST) infrastructure.
//!
//! This module exercises a skeleton tree end to end with:
//! - In-memory archives with fault injection for nodes and value bins
//! - Reproducible random operation sequences
//! - Invariant checking after each operation against a `BTreeMap` model
//!
//! # Design Principles
//!
//! 1. All storage goes through the serializer contract and can be faulted
//! 2. All randomness is seeded for reproducibility
//! 3. Given the same seed and a single inflate worker, execution is identical
//!
//! # Usage
//!
//! ```ignore
//! use btree_index::serial::FaultConfig;
//! use btree_index::simulation::{Simulator, SimulatorConfig};
//!
//! let config = SimulatorConfig::new(12345).with_fault_config(FaultConfig::low_faults());
//! let result = Simulator::new(config).run(1000);
//!
//! assert!(result.passed());
//! ```

mod invariants;
mod simulator;

pub use invariants::{InvariantChecker, InvariantViolation, Operation, OperationHistory};
pub use simulator::{SimulationResult, Simulator, SimulatorConfig};
