use crate::error::Result;
use crate::global_plan::GlobalQueryPlan;

use super::QueryMergerRule;

/// Never merges: each pending query becomes its own shared query plan.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultQueryMergerRule;

impl QueryMergerRule for DefaultQueryMergerRule {
    fn name(&self) -> &'static str {
        "DefaultQueryMergerRule"
    }

    fn apply(&self, global: &mut GlobalQueryPlan) -> Result<bool> {
        for plan in global.take_query_plans_to_add() {
            global.create_new_shared_query_plan(plan);
        }
        global.remove_failed_or_stopped_shared_query_plans();
        Ok(true)
    }
}
