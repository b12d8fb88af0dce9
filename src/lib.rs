//! Runway - execution admission and live-output streaming for
//! infrastructure operations.

pub mod config;
pub mod expander;
pub mod inventory;
pub mod model;
pub mod observability;
pub mod queue;
pub mod server;
pub mod shell;
pub mod streaming;
pub mod test_support;
pub mod transport;

pub use config::{Config, QueueConfig, StreamConfig};
pub use expander::{ExpandError, ExpandedTargets, TargetExpander};
pub use inventory::{InventoryResolver, StaticInventory};
pub use model::{ActionKind, ActionSpec, Batch, ExecutionResult, ExecutionStatus, ExecutionUnit};
pub use queue::{CancelError, CancelOutcome, ExecutionQueue, QueueWorker, SubmitError};
pub use server::{HttpState, create_router, run_http_server};
pub use shell::ShellTransport;
pub use streaming::{ChannelClosed, Frame, FrameEvent, StreamChannel, StreamingHub, truncate_chunk};
pub use transport::{CancelSupport, StreamingCallbacks, TransportError, TransportExecutor};
