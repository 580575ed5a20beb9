//! LightningOps Operation Engine
//!
//! Executes long-running file operations (copy, move, delete, attribute
//! change, text conversion, directory creation) on background threads:
//! - Operation scripts: ordered, costed step plans
//! - Workers: one thread per operation, pausable and cancellable
//! - Rate meters and time-left estimation for the progress dialog
//! - A throughput cap with batched braking sleeps
//! - Admission queue serializing "start when idle" operations
//! - Path availability probing that survives dead network media
//! - A synchronous bridge for error prompts answered by the UI thread

pub mod bridge;
pub mod config;
pub mod error;
pub mod eta;
pub mod gate;
pub mod limiter;
pub mod prober;
pub mod queue;
pub mod script;
pub mod speed;
pub mod status;
pub mod worker;

pub use bridge::{bridge, AutoResolver, BridgeClient, BridgeHost, Decision, ErrorContext, ErrorResolver, UiRequest};
pub use config::{EngineConfig, OPERATION_BUFFER, REMOVABLE_DISK_COPY_BUFFER};
pub use error::{ItemErrorKind, OpError, Result};
pub use eta::{round_time_left, TimeLeft};
pub use gate::Gate;
pub use limiter::{BurstPlan, SpeedLimit, SpeedLimiter};
pub use prober::{PathProber, ProbeOutcome, ProbeWait, PROBE_SLOTS};
pub use queue::{OperationId, OperationsQueue, PauseState};
pub use script::{OperationScript, Step, StepFlags, StepKind, WorkPath};
pub use speed::{MeterProfile, SpeedMeter, PROGRESS_METER, TRANSFER_METER};
pub use status::{StatusBoard, StatusSnapshot};
pub use worker::{start, OperationSummary, Outcome, WorkerContext, WorkerHandle, WorkerState};
