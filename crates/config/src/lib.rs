//! Configuration for taskgate
//!
//! Supplies the plain value objects (timeouts, reuse policy, flags, roots)
//! that the coordination components read at construction time.

pub mod settings;

pub use settings::*;
