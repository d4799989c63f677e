//! Async coordination primitives shared by the task components

mod supersede;
mod waiter;

pub use supersede::{PollOutcome, Superseder};
pub use waiter::Waiter;
