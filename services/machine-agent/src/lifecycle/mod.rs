//! Lifecycle management for supervised worker groups.
//!
//! - `LifecycleHandle`: shared kill/dying/dead latch, first kill wins
//! - `Worker`: contract every long-running task implements
//! - `Task`: runs a worker body on its own tokio task
//! - `run_group`: runs a worker set to first exit and aggregates the result

mod group;
mod handle;
mod worker;

pub use group::run_group;
pub use handle::{LifecycleHandle, LifecycleState};
pub use worker::{Task, Worker, WorkerId};
