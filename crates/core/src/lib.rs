//! Core domain types, errors, and events for `taskgate`.
//!
//! ## Key Components
//!
//! - **`errors`**: the primary `Error` enum and `Result` alias shared by every
//!   crate in the workspace.
//! - **`types`**: task identities, discovered task metadata, invocation records
//!   and the state enums reported by the coordination components.
//! - **`events`**: the notification bus consumed by presentation layers.
//! - **`constants`**: environment variable names and defaults.

pub mod constants;
pub mod errors;
pub mod events;
pub mod types;

pub use self::{
    constants::*,
    errors::{Error, Result, ResultExt},
    events::{EventEmitter, SystemEvent},
    types::*,
};
