//! Integration tests entry point
//!
//! This file serves as the entry point for all integration tests.
//! It includes the integration_tests module which contains:
//! - Queue partition and retry scenarios
//! - Coordinator assignment and recovery
//! - Worker execution against a shared queue
//! - Frontier strategies over a fake site
//! - Whole in-process clusters

mod common;
mod integration_tests;
