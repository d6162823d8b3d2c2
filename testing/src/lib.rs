//! # Repant Testing
//!
//! Ergonomic testing utilities for repant reducers.
//!
//! The main entry point is [`ReducerTest`], a fluent Given/When/Then harness
//! that runs a reducer synchronously (no runtime, no I/O) and asserts on the
//! resulting state and effects.


pub use reducer_test::{assertions, ReducerTest};
