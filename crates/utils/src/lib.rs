//! Shared utilities for taskgate
//!
//! Tracing setup and the small async coordination primitives (one-shot
//! waiters and poll supersession) that the task components are built from.

pub mod sync;
pub mod tracing;

pub use sync::*;
