//! # Execution Engine
//!
//! Everything that happens after a playbook resolves: per-run state,
//! cooperative cancellation, leaf dispatch with retry and timeout
//! handling, composite step workers, and the coordinator loop that walks
//! ready groups in dependency order.
//!
//! ## Architecture
//!
//! ```text
//! RunControl (api)
//!    └── RunCoordinator (one task per run)
//!          ├── ExecutionContext   scope + recorded results, coordinator-owned
//!          ├── StepWorker         recursive conditional/parallel dispatch
//!          │     └── StepExecutor leaf retry/backoff/timeout loop
//!          └── RunHandle          shared status, watched by callers
//! ```

pub mod cancel;
pub mod context;
pub(crate) mod coordinator;
pub mod run;
pub mod status;
pub(crate) mod step_executor;
pub(crate) mod worker;

pub use cancel::CancelToken;
pub use context::ExecutionContext;
pub use run::{JobRun, RunHandle};
pub use status::{StepResult, StepStatus};
