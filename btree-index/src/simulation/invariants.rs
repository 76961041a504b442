//! Invariant checking for deterministic simulation testing.
//!
//! After every operation the tree must still be a valid B-tree whose size
//! matches the model. Whenever it is fully loaded, its contents must match
//! the model exactly.

use std::collections::BTreeMap;
use std::fmt::Debug;

use crate::skeleton::SkeletonBTree;

/// Kinds of operation the simulator performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Operation {
    Put,
    Remove,
    Get,
    /// Unload the lowest loaded subtree on one key's path.
    DeflateKey,
    Deflate,
    Inflate,
    InflateScheduled,
}

/// Outcome counts per operation kind.
#[derive(Debug, Default)]
pub struct OperationHistory {
    succeeded: BTreeMap<Operation, u64>,
    failed: BTreeMap<Operation, u64>,
    /// Index and message of every failed operation.
    failures: Vec<(usize, String)>,
}

impl OperationHistory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, operation: Operation, error: Option<String>) {
        let index = self.len();
        match error {
            None => *self.succeeded.entry(operation).or_default() += 1,
            Some(message) => {
                *self.failed.entry(operation).or_default() += 1;
                self.failures.push((index, message));
            }
        }
    }

    /// Number of recorded operations.
    #[must_use]
    pub fn len(&self) -> usize {
        let total: u64 = self.succeeded.values().chain(self.failed.values()).sum();
        usize::try_from(total).unwrap_or(usize::MAX)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn succeeded(&self, operation: Operation) -> u64 {
        self.succeeded.get(&operation).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn failed(&self, operation: Operation) -> u64 {
        self.failed.get(&operation).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn failures(&self) -> &[(usize, String)] {
        &self.failures
    }
}

/// An invariant violation detected during simulation.
#[derive(Debug, Clone)]
pub struct InvariantViolation {
    /// Description of the violation.
    pub description: String,
    /// Operation index where it was detected.
    pub operation_index: usize,
    /// Additional context.
    pub context: String,
}

/// Checker for tree invariants.
#[derive(Debug, Default)]
pub struct InvariantChecker {
    violations: Vec<InvariantViolation>,
}

impl InvariantChecker {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            violations: Vec::new(),
        }
    }

    #[must_use]
    pub fn violations(&self) -> &[InvariantViolation] {
        &self.violations
    }

    #[must_use]
    pub const fn has_violations(&self) -> bool {
        !self.violations.is_empty()
    }

    pub fn add_violation(&mut self, violation: InvariantViolation) {
        self.violations.push(violation);
    }

    fn violation(&mut self, description: &str, operation_index: usize, context: String) {
        self.violations.push(InvariantViolation {
            description: description.to_string(),
            operation_index,
            context,
        });
    }

    /// Check the loaded part of the tree and its recorded size.
    pub fn check_structure<K, V>(
        &mut self,
        skeleton: &SkeletonBTree<K, V>,
        expected_len: usize,
        operation_index: usize,
    ) where
        K: Ord + Clone + Debug,
    {
        if let Err(err) = skeleton.tree().verify() {
            self.violation("Tree failed verification", operation_index, err.to_string());
        }
        if skeleton.len() != expected_len {
            self.violation(
                "Tree size differs from model",
                operation_index,
                format!("tree has {}, model has {expected_len}", skeleton.len()),
            );
        }
    }

    /// Check that a live tree holds exactly the model's entries.
    pub fn check_contents<K, V>(
        &mut self,
        skeleton: &SkeletonBTree<K, V>,
        model: &BTreeMap<K, V>,
        operation_index: usize,
    ) where
        K: Ord + Clone + Debug,
        V: PartialEq + Debug,
    {
        let mut expected = model.iter();
        for entry in skeleton.tree().iter() {
            let (key, value) = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    self.violation("Live tree could not be read", operation_index, err.to_string());
                    return;
                }
            };
            if expected.next() != Some((key, value)) {
                self.violation(
                    "Tree entry differs from model",
                    operation_index,
                    format!("tree has {key:?} = {value:?}"),
                );
                return;
            }
        }
        if let Some((key, _)) = expected.next() {
            self.violation(
                "Tree is missing a model entry",
                operation_index,
                format!("first missing key {key:?}"),
            );
        }
    }

    /// Check a value read from the tree against the model.
    pub fn check_read<K: Debug, V: PartialEq + Debug>(
        &mut self,
        key: &K,
        actual: Option<&V>,
        expected: Option<&V>,
        operation_index: usize,
    ) {
        if actual != expected {
            self.violation(
                "Read returned wrong value",
                operation_index,
                format!("key {key:?}: got {actual:?}, expected {expected:?}"),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(entries: &[(u32, &str)]) -> SkeletonBTree<u32, String> {
        let mut skeleton = SkeletonBTree::new(2).expect("tree");
        for (key, value) in entries {
            skeleton.tree_mut().put(*key, (*value).to_string()).expect("put");
        }
        skeleton
    }

    #[test]
    fn test_history_counts() {
        let mut history = OperationHistory::new();
        history.record(Operation::Put, None);
        history.record(Operation::Put, Some("aborted".to_string()));
        history.record(Operation::Get, None);

        assert_eq!(history.len(), 3);
        assert_eq!(history.succeeded(Operation::Put), 1);
        assert_eq!(history.failed(Operation::Put), 1);
        assert_eq!(history.failures(), &[(1, "aborted".to_string())]);
    }

    #[test]
    fn test_matching_tree_passes() {
        let skeleton = tree(&[(1, "a"), (2, "b"), (3, "c")]);
        let model = BTreeMap::from([
            (1, "a".to_string()),
            (2, "b".to_string()),
            (3, "c".to_string()),
        ]);
        let mut checker = InvariantChecker::new();
        checker.check_structure(&skeleton, model.len(), 0);
        checker.check_contents(&skeleton, &model, 0);
        assert!(!checker.has_violations(), "{:?}", checker.violations());
    }

    #[test]
    fn test_differences_are_reported() {
        let skeleton = tree(&[(1, "a"), (2, "b")]);
        let model = BTreeMap::from([(1, "a".to_string()), (2, "x".to_string())]);
        let mut checker = InvariantChecker::new();
        checker.check_contents(&skeleton, &model, 4);
        checker.check_structure(&skeleton, 3, 4);
        checker.check_read(&2, Some(&"b".to_string()), model.get(&2), 4);

        let violations = checker.violations();
        assert_eq!(violations.len(), 3);
        assert!(violations.iter().all(|v| v.operation_index == 4));
    }
}
