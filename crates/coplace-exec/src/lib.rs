#![forbid(unsafe_code)]
//! coplace-exec: talking to workers and driving the whole pipeline.
//!
//! - `rpc`: the worker RPC client seam and the bounded-time fan-out used by
//!   both deployment directions.
//! - `deploy` / `undeploy`: register+start and stop+unregister a shared
//!   query on every execution node hosting it.
//! - `coordinator`: the request-processing layer (submit, stop, fail) that
//!   merges, places, deploys and tears down.
//! - `metrics`: tracing hook called at phase boundaries.

pub mod coordinator;
pub mod deploy;
pub mod error;
pub mod metrics;
pub mod rpc;
pub mod undeploy;

pub use coordinator::Coordinator;
pub use deploy::QueryDeploymentPhase;
pub use error::{ExecError, Result};
pub use rpc::{RecordingWorkerClient, RpcCall, RpcError, RpcMode, TerminationType, WorkerRpcClient};
pub use undeploy::QueryUndeploymentPhase;
