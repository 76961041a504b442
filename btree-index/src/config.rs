//! Index configuration module.
//!
//! Loads tree, packer and simulation settings from environment variables.
//!
//! # Environment Variables
//!
//! - `BTREE_INDEX_NODE_MIN`: minimum children of a non-root node (default: `8`)
//! - `BTREE_INDEX_BIN_CAPACITY`: weight capacity of a value bin (default: `4096`)
//! - `BTREE_INDEX_NO_TINY`: merge bins left under half full (default: `true`)
//! - `BTREE_INDEX_AGGRESSION`: packer aggression level, 0 to 3 (default: `1`)
//! - `BTREE_INDEX_INFLATE_WORKERS`: concurrent fetches during scheduled inflate (default: `4`)
//! - `BTREE_INDEX_SIM_SEED`: simulation seed (default: `0`)
//! - `BTREE_INDEX_SIM_OPERATIONS`: simulation length (default: `1000`)
//!
//! # Invariants
//!
//! - `node_min >= 2`
//! - `bin_capacity > 0`
//! - `inflate_workers >= 1`

use std::str::FromStr;

use crate::packer::Aggression;

/// Index configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexConfig {
    /// Minimum number of children of a non-root internal node.
    pub node_min: usize,
    /// Weight capacity of one value bin.
    pub bin_capacity: u32,
    /// Whether bins under half full are merged away.
    pub no_tiny: bool,
    pub aggression: Aggression,
    /// Concurrent fetches during scheduled inflate.
    pub inflate_workers: usize,
    pub sim_seed: u64,
    /// Number of operations one simulation run performs.
    pub sim_operations: usize,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable is missing.
    MissingEnvVar(String),
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingEnvVar(name) => {
                write!(f, "missing required environment variable: {name}")
            }
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            node_min: Self::DEFAULT_NODE_MIN,
            bin_capacity: Self::DEFAULT_BIN_CAPACITY,
            no_tiny: Self::DEFAULT_NO_TINY,
            aggression: Aggression::default(),
            inflate_workers: Self::DEFAULT_INFLATE_WORKERS,
            sim_seed: Self::DEFAULT_SIM_SEED,
            sim_operations: Self::DEFAULT_SIM_OPERATIONS,
        }
    }
}

impl IndexConfig {
    pub const DEFAULT_NODE_MIN: usize = 8;
    pub const DEFAULT_BIN_CAPACITY: u32 = 4096;
    pub const DEFAULT_NO_TINY: bool = true;
    pub const DEFAULT_AGGRESSION: u8 = 1;
    pub const DEFAULT_INFLATE_WORKERS: usize = 4;
    pub const DEFAULT_SIM_SEED: u64 = 0;
    pub const DEFAULT_SIM_OPERATIONS: usize = 1000;

    /// Load configuration from environment variables.
    ///
    /// Every variable is optional; unset ones take their default.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but does not parse, or is out
    /// of range.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let node_min = load(&lookup, "BTREE_INDEX_NODE_MIN", Self::DEFAULT_NODE_MIN)?;
        if node_min < 2 {
            return Err(invalid("BTREE_INDEX_NODE_MIN", "must be at least 2"));
        }
        let bin_capacity = load(&lookup, "BTREE_INDEX_BIN_CAPACITY", Self::DEFAULT_BIN_CAPACITY)?;
        if bin_capacity == 0 {
            return Err(invalid("BTREE_INDEX_BIN_CAPACITY", "must be greater than zero"));
        }
        let no_tiny = load(&lookup, "BTREE_INDEX_NO_TINY", Self::DEFAULT_NO_TINY)?;
        let level = load(&lookup, "BTREE_INDEX_AGGRESSION", Self::DEFAULT_AGGRESSION)?;
        let aggression = Aggression::try_from(level)
            .map_err(|_| invalid("BTREE_INDEX_AGGRESSION", "must be between 0 and 3"))?;
        let inflate_workers = load(
            &lookup,
            "BTREE_INDEX_INFLATE_WORKERS",
            Self::DEFAULT_INFLATE_WORKERS,
        )?;
        if inflate_workers == 0 {
            return Err(invalid("BTREE_INDEX_INFLATE_WORKERS", "must be at least 1"));
        }

        Ok(Self {
            node_min,
            bin_capacity,
            no_tiny,
            aggression,
            inflate_workers,
            sim_seed: load(&lookup, "BTREE_INDEX_SIM_SEED", Self::DEFAULT_SIM_SEED)?,
            sim_operations: load(
                &lookup,
                "BTREE_INDEX_SIM_OPERATIONS",
                Self::DEFAULT_SIM_OPERATIONS,
            )?,
        })
    }
}

fn invalid(name: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        message: message.to_string(),
    }
}

/// Parse variable `name`, or return `default` if it is unset.
fn load<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        Some(value) => value.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
            name: name.to_string(),
            message: format!("'{value}' could not be parsed"),
        }),
        None => Ok(default),
    }
}
