//! Worker RPC seam.
//!
//! `WorkerRpcClient` is what the coordinator needs from a worker: register,
//! start, stop and unregister the sub-plans of one shared query. `fan_out`
//! issues one call per execution node concurrently, bounds each by a
//! timeout, and reports the nodes whose call failed.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use coplace_core::id::{SharedQueryId, TopologyNodeId};
use coplace_core::plan::QueryPlan;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationType {
    Graceful,
    HardStop,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcMode {
    Register,
    Start,
    Stop,
    Unregister,
}

impl fmt::Display for RpcMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RpcMode::Register => "registerQuery",
            RpcMode::Start => "startQuery",
            RpcMode::Stop => "stopQuery",
            RpcMode::Unregister => "unregisterQuery",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("worker {address} unreachable: {message}")]
    Unreachable { address: String, message: String },

    #[error("worker {address} rejected the request: {message}")]
    Rejected { address: String, message: String },
}

#[async_trait]
pub trait WorkerRpcClient: Send + Sync {
    async fn register_query(
        &self,
        address: &str,
        shared_query_id: SharedQueryId,
        sub_plans: Vec<QueryPlan>,
    ) -> Result<(), RpcError>;

    async fn start_query(&self, address: &str, shared_query_id: SharedQueryId) -> Result<(), RpcError>;

    async fn stop_query(
        &self,
        address: &str,
        shared_query_id: SharedQueryId,
        termination: TerminationType,
    ) -> Result<(), RpcError>;

    async fn unregister_query(&self, address: &str, shared_query_id: SharedQueryId) -> Result<(), RpcError>;
}

/// One call of a fan-out, addressed to one execution node.
#[derive(Debug, Clone)]
pub(crate) struct RpcRequest {
    pub node: TopologyNodeId,
    pub address: String,
    pub shared_query_id: SharedQueryId,
    pub sub_plans: Vec<QueryPlan>,
}

async fn dispatch(
    client: &dyn WorkerRpcClient,
    mode: RpcMode,
    termination: TerminationType,
    request: RpcRequest,
) -> Result<(), RpcError> {
    let RpcRequest {
        address,
        shared_query_id,
        sub_plans,
        ..
    } = request;
    match mode {
        RpcMode::Register => client.register_query(&address, shared_query_id, sub_plans).await,
        RpcMode::Start => client.start_query(&address, shared_query_id).await,
        RpcMode::Stop => client.stop_query(&address, shared_query_id, termination).await,
        RpcMode::Unregister => client.unregister_query(&address, shared_query_id).await,
    }
}

/// Issue `mode` to every request concurrently and wait for all of them.
/// Returns the nodes whose call failed or did not finish within `timeout`.
pub(crate) async fn fan_out(
    client: &dyn WorkerRpcClient,
    mode: RpcMode,
    termination: TerminationType,
    requests: Vec<RpcRequest>,
    timeout: Duration,
) -> Vec<TopologyNodeId> {
    let calls = requests.into_iter().map(|request| async move {
        let node = request.node;
        match tokio::time::timeout(timeout, dispatch(client, mode, termination, request)).await {
            Ok(Ok(())) => {
                trace!(%node, %mode, "rpc completed");
                None
            }
            Ok(Err(e)) => {
                warn!(%node, %mode, error = %e, "rpc failed");
                Some(node)
            }
            Err(_) => {
                warn!(%node, %mode, timeout_ms = timeout.as_millis() as u64, "rpc timed out");
                Some(node)
            }
        }
    });
    join_all(calls).await.into_iter().flatten().collect()
}

/// A call observed by [`RecordingWorkerClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcCall {
    pub mode: RpcMode,
    pub address: String,
    pub shared_query_id: SharedQueryId,
    pub termination: Option<TerminationType>,
    pub sub_plan_count: usize,
}

/// In-process worker client that records every call and rejects calls to
/// addresses marked as failing. Used by tests, benches and dry runs.
#[derive(Debug, Default)]
pub struct RecordingWorkerClient {
    calls: Mutex<Vec<RpcCall>>,
    failing: Mutex<BTreeSet<String>>,
    latency: Option<Duration>,
}

impl RecordingWorkerClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency` before answering.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    pub fn fail_address(&self, address: impl Into<String>) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(address.into());
        }
    }

    pub fn heal_address(&self, address: &str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.remove(address);
        }
    }

    pub fn calls(&self) -> Vec<RpcCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn calls_with_mode(&self, mode: RpcMode) -> Vec<RpcCall> {
        self.calls().into_iter().filter(|c| c.mode == mode).collect()
    }

    async fn record(&self, call: RpcCall) -> Result<(), RpcError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let address = call.address.clone();
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
        let failing = self
            .failing
            .lock()
            .map(|f| f.contains(&address))
            .unwrap_or(false);
        if failing {
            return Err(RpcError::Unreachable {
                address,
                message: "connection refused".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl WorkerRpcClient for RecordingWorkerClient {
    async fn register_query(
        &self,
        address: &str,
        shared_query_id: SharedQueryId,
        sub_plans: Vec<QueryPlan>,
    ) -> Result<(), RpcError> {
        self.record(RpcCall {
            mode: RpcMode::Register,
            address: address.to_string(),
            shared_query_id,
            termination: None,
            sub_plan_count: sub_plans.len(),
        })
        .await
    }

    async fn start_query(&self, address: &str, shared_query_id: SharedQueryId) -> Result<(), RpcError> {
        self.record(RpcCall {
            mode: RpcMode::Start,
            address: address.to_string(),
            shared_query_id,
            termination: None,
            sub_plan_count: 0,
        })
        .await
    }

    async fn stop_query(
        &self,
        address: &str,
        shared_query_id: SharedQueryId,
        termination: TerminationType,
    ) -> Result<(), RpcError> {
        self.record(RpcCall {
            mode: RpcMode::Stop,
            address: address.to_string(),
            shared_query_id,
            termination: Some(termination),
            sub_plan_count: 0,
        })
        .await
    }

    async fn unregister_query(&self, address: &str, shared_query_id: SharedQueryId) -> Result<(), RpcError> {
        self.record(RpcCall {
            mode: RpcMode::Unregister,
            address: address.to_string(),
            shared_query_id,
            termination: None,
            sub_plan_count: 0,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(node: u64, address: &str) -> RpcRequest {
        RpcRequest {
            node: TopologyNodeId::new(node),
            address: address.to_string(),
            shared_query_id: SharedQueryId::new(1),
            sub_plans: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_fan_out_reports_failed_nodes() {
        let client = RecordingWorkerClient::new();
        client.fail_address("b:2");
        let failed = fan_out(
            &client,
            RpcMode::Stop,
            TerminationType::HardStop,
            vec![request(1, "a:1"), request(2, "b:2")],
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(failed, vec![TopologyNodeId::new(2)]);
        assert_eq!(client.calls_with_mode(RpcMode::Stop).len(), 2);
    }

    #[tokio::test]
    async fn test_fan_out_times_out_slow_workers() {
        let client = RecordingWorkerClient::with_latency(Duration::from_secs(10));
        let failed = fan_out(
            &client,
            RpcMode::Start,
            TerminationType::Graceful,
            vec![request(3, "c:3")],
            Duration::from_millis(100),
        )
        .await;
        assert_eq!(failed, vec![TopologyNodeId::new(3)]);
    }
}
