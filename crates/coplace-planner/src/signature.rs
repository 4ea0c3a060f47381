//! Computes a canonical signature for every operator subtree of a plan.

use std::collections::BTreeMap;

use coplace_core::hash::Signature;
use coplace_core::id::OperatorId;
use coplace_core::plan::QueryPlan;
use tracing::trace;

use crate::error::Result;

/// Signature inference: each operator's signature combines its own canonical
/// text with its children's signatures (order-independent), so equal upstream
/// computations get equal signatures even when written differently.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignatureInferencePhase;

impl SignatureInferencePhase {
    pub fn new() -> Self {
        Self
    }

    pub fn execute(&self, plan: &mut QueryPlan) -> Result<()> {
        let mut computed: BTreeMap<OperatorId, Signature> = BTreeMap::new();
        for id in plan.topological_order() {
            let op = plan.get(id)?;
            let children: Vec<&Signature> = op
                .children
                .iter()
                .filter_map(|c| computed.get(c))
                .collect();
            let sig = Signature::compose(&op.kind.canonical(), &children);
            trace!(operator = %id, signature = %sig.hash, "inferred signature");
            computed.insert(id, sig);
        }
        for (id, sig) in computed {
            plan.get_mut(id)?.signature = Some(sig);
        }
        Ok(())
    }
}
