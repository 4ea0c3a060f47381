//! Coordinator configuration that downstream crates can serialize/deserialize.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::plan::PlacementStrategyType;

/// Which query merger rule the coordinator runs on pending queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryMergerRuleType {
    /// Never merge: every query gets its own shared query plan.
    DefaultQueryMergerRule,
    SyntaxBasedCompleteQueryMergerRule,
    SyntaxBasedPartialQueryMergerRule,
    HashSignatureBasedPartialQueryMergerRule,
}

impl std::str::FromStr for QueryMergerRuleType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "DefaultQueryMergerRule" => Ok(Self::DefaultQueryMergerRule),
            "SyntaxBasedCompleteQueryMergerRule" => Ok(Self::SyntaxBasedCompleteQueryMergerRule),
            "SyntaxBasedPartialQueryMergerRule" => Ok(Self::SyntaxBasedPartialQueryMergerRule),
            "HashSignatureBasedPartialQueryMergerRule" => {
                Ok(Self::HashSignatureBasedPartialQueryMergerRule)
            }
            other => Err(Error::Config(format!("unknown query merger rule '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Place only the unprocessed change-log entries of a shared query plan
    /// instead of re-running placement over the whole merged graph.
    pub enable_query_reconfiguration: bool,

    pub query_merger_rule: QueryMergerRuleType,

    /// Upper bound for one worker RPC during deployment/undeployment fan-out.
    pub rpc_timeout_ms: u64,

    /// Strategy assumed for queries that do not name one.
    pub default_placement_strategy: PlacementStrategyType,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            enable_query_reconfiguration: false,
            query_merger_rule: QueryMergerRuleType::SyntaxBasedCompleteQueryMergerRule,
            rpc_timeout_ms: 5_000,
            default_placement_strategy: PlacementStrategyType::BottomUp,
        }
    }
}

impl CoordinatorConfig {
    /// Create a config from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `COPLACE_ENABLE_QUERY_RECONFIGURATION`: `true`/`false`
    /// - `COPLACE_QUERY_MERGER_RULE`: merger rule name
    /// - `COPLACE_RPC_TIMEOUT_MS`: per-call RPC timeout
    /// - `COPLACE_PLACEMENT_STRATEGY`: default placement strategy name
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(s) = std::env::var("COPLACE_ENABLE_QUERY_RECONFIGURATION") {
            if let Ok(v) = s.parse::<bool>() {
                cfg.enable_query_reconfiguration = v;
            }
        }

        if let Ok(s) = std::env::var("COPLACE_QUERY_MERGER_RULE") {
            if let Ok(v) = s.parse::<QueryMergerRuleType>() {
                cfg.query_merger_rule = v;
            }
        }

        if let Ok(s) = std::env::var("COPLACE_RPC_TIMEOUT_MS") {
            if let Ok(v) = s.parse::<u64>() {
                cfg.rpc_timeout_ms = v;
            }
        }

        if let Ok(s) = std::env::var("COPLACE_PLACEMENT_STRATEGY") {
            if let Ok(v) = s.parse::<PlacementStrategyType>() {
                cfg.default_placement_strategy = v;
            }
        }

        cfg
    }

    pub fn validate(&self) -> Result<()> {
        if self.rpc_timeout_ms == 0 {
            return Err(Error::Config("rpc_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn rpc_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.rpc_timeout_ms)
    }
}
