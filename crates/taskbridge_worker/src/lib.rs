//! Worker node: connects out to the coordinator, runs the assistant CLI,
//! and relays parsed stream events back over the control plane.

pub mod attachments;
pub mod executor;
pub mod parser;
pub mod worker;

pub use executor::{ExecutionRequest, ExecutorEvent};
pub use parser::StreamParser;
pub use worker::{ReconnectBackoff, WorkerConfig};
