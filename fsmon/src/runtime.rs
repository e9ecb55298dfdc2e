//! A small cooperative runtime.
//!
//! There is no executor and no thread: a computation only runs while its
//! [`ComputationRunner`] is being constructed or while somebody signals the
//! [`Blocker`] it is parked on. The [`Scheduler`] is the FIFO of blockers
//! waiting for a future pump to signal them.

mod blocker;
mod computation;
mod scheduler;

pub use blocker::{Blocker, Wait};
pub use computation::ComputationRunner;
pub use scheduler::Scheduler;
