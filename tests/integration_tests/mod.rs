//! Integration tests module
//!
//! End-to-end tests over the in-memory backends and in-process transport.

pub mod cluster_test;
pub mod coordinator_test;
pub mod frontier_test;
pub mod queue_test;
pub mod worker_test;
