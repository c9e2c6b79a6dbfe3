//! Fleet Machine Agent Library
//!
//! The machine agent runs on every machine managed by the fleet controller.
//! It keeps a small set of long-running workers alive, restarts the whole
//! set after failures, and hands over to the process supervisor when the
//! controller proposes a new agent binary.
//!
//! ## Architecture
//!
//! ```text
//! MachineAgent (supervisor loop, one LifecycleHandle for the process)
//! └── cycle (child LifecycleHandle, one store connection)
//!     ├── Machiner   (deployed units follow the store)
//!     └── Upgrader   (ends the cycle when new tools are proposed)
//! ```
//!
//! ## Modules
//!
//! - `lifecycle`: lifecycle handle, worker contract, group runner
//! - `agent`: supervisor loop and cycle classification
//! - `workers`: concrete workers
//! - `store`: state store interface and implementations
//! - `tools`: agent binary versions and local tools switching

pub mod agent;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod store;
pub mod tools;
pub mod workers;

// Re-export commonly used types
pub use agent::{AgentExit, MachineAgent};
pub use config::{AgentArgs, AgentConfig};
pub use error::{AgentError, Result};
pub use lifecycle::{run_group, LifecycleHandle, Task, Worker};
