#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]
// Layers, bottom up:
// 1. btree: the in-memory B-tree, with ghosts standing in for unloaded
//    subtrees and values
// 2. serial: the batch pull/push contract to a backing store
// 3. skeleton: loads and stores parts of a btree through two serializers,
//    one for nodes and one for values
// 4. packer: a value serializer that packs small values into bins stored
//    through another serializer
//
// simulation drives all four against faulty in-memory archives.

pub mod btree;
pub mod config;
pub mod packer;
pub mod serial;
pub mod simulation;
pub mod skeleton;

#[cfg(test)]
mod testing;
