//! Post-placement check run over every mutated sub-plan.

use coplace_core::operator::OperatorKind;
use coplace_core::plan::QueryPlan;

use crate::error::{PlacementError, Result};

/// Hook invoked after every placement mutation. Implementations may rewrite
/// the plan (e.g. attach schemas) or reject it.
pub trait TypeInferencePhase: Send + Sync {
    fn execute(&self, plan: &mut QueryPlan) -> Result<()>;
}

/// Checks that each operator has the number of inputs its kind expects and
/// that every edge stays inside the plan.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuralTypeInference;

impl TypeInferencePhase for StructuralTypeInference {
    fn execute(&self, plan: &mut QueryPlan) -> Result<()> {
        for op in plan.operators() {
            for edge in op.children.iter().chain(op.parents.iter()) {
                if !plan.contains(*edge) {
                    return Err(PlacementError::TypeInference(format!(
                        "{} references {edge} outside the plan",
                        op.id
                    )));
                }
            }
            let inputs = op.children.len();
            let ok = match op.kind {
                OperatorKind::Source { .. } | OperatorKind::NetworkSource { .. } => inputs == 0,
                OperatorKind::Join { .. } => inputs == 2,
                OperatorKind::Union => inputs >= 2,
                OperatorKind::Sink { .. }
                | OperatorKind::NetworkSink { .. }
                | OperatorKind::Filter { .. }
                | OperatorKind::Map { .. }
                | OperatorKind::Project { .. }
                | OperatorKind::Window { .. } => inputs == 1,
            };
            if !ok {
                return Err(PlacementError::TypeInference(format!(
                    "{} ({}) has {inputs} inputs",
                    op.id,
                    op.kind.name()
                )));
            }
            if (op.kind.is_sink() || matches!(op.kind, OperatorKind::NetworkSink { .. }))
                && !op.parents.is_empty()
            {
                return Err(PlacementError::TypeInference(format!(
                    "{} is a sink but has consumers",
                    op.id
                )));
            }
        }
        Ok(())
    }
}
