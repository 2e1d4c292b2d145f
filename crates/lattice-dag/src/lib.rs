//! DAG Partitioner.
//!
//! A client request is an ordered list of operations that may span several
//! engines. The partitioner cuts it into segments, each executed by exactly
//! one engine in a single round trip. Boundary operations (those that mint or
//! consume a handle, or move work to another engine) always open a fresh
//! segment so the coordinator observes the engine's reply before composing
//! the next one.

pub mod boundary;
pub mod partition;

pub use boundary::BoundaryTable;
pub use partition::{partition, DagPartitioner, SegmentQueue, DEFAULT_ENGINE};
