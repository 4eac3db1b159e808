//! Integration test suite for constellation.
//!
//! These tests drive whole graphs through the public API, including
//! concurrent execution against a fake device layer, live edits and
//! persistence.
//!
//! # Test Categories
//!
//! - `execution`: End-to-end orchestration scenarios
//! - `editing`: Undo/redo and snapshot persistence
//! - `graph_properties`: Property tests over generated graphs
//!
//! # CI Compatibility
//!
//! The device layer is simulated in-process; no test talks to a real
//! device.

mod fixtures;

mod editing;
mod execution;
