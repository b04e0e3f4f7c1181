//! B+-tree implementation: point lookups, insertion with splitting,
//! deletion with coalesce/redistribute rebalancing, and range scans.

mod tree;

pub use tree::BTree;
