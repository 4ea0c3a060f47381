//! Coordinator-wide registry of shared query plans and pending queries.

use std::collections::{BTreeMap, HashMap};

use coplace_core::id::{QueryId, SharedQueryId};
use coplace_core::plan::{PlacementStrategyType, QueryPlan};
use tracing::{debug, info, warn};

use crate::error::{PlanError, Result};
use crate::shared_plan::{SharedQueryPlan, SharedQueryPlanStatus};

/// Why a query is being taken out of the global plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Stop,
    Fail,
}

fn candidate_key(source_consumed: &str, strategy: PlacementStrategyType) -> String {
    format!("{source_consumed}_{strategy}")
}

#[derive(Debug, Default)]
pub struct GlobalQueryPlan {
    query_plans_to_add: Vec<QueryPlan>,
    shared_query_plans: BTreeMap<SharedQueryId, SharedQueryPlan>,
    query_to_shared: HashMap<QueryId, SharedQueryId>,
    /// `<sources>_<strategy>` → shared plans, in creation order.
    candidates: HashMap<String, Vec<SharedQueryId>>,
}

impl GlobalQueryPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a query for the next merger run.
    pub fn add_query_plan(&mut self, plan: QueryPlan) -> Result<()> {
        let query_id = plan.query_id;
        if !query_id.is_valid() {
            return Err(PlanError::GlobalQueryPlanUpdate(
                "query plan carries the invalid query id".into(),
            ));
        }
        if self.query_to_shared.contains_key(&query_id)
            || self.query_plans_to_add.iter().any(|p| p.query_id == query_id)
        {
            return Err(PlanError::GlobalQueryPlanUpdate(format!(
                "{query_id} already exists in the global query plan"
            )));
        }
        debug!(query_id = %query_id, "queued query plan for merging");
        self.query_plans_to_add.push(plan);
        Ok(())
    }

    pub fn query_plans_to_add(&self) -> &[QueryPlan] {
        &self.query_plans_to_add
    }

    pub fn query_plans_to_add_mut(&mut self) -> &mut [QueryPlan] {
        &mut self.query_plans_to_add
    }

    /// Drain the pending queue.
    pub fn take_query_plans_to_add(&mut self) -> Vec<QueryPlan> {
        std::mem::take(&mut self.query_plans_to_add)
    }

    /// Put plans back at the head of the pending queue, ahead of anything
    /// queued since they were taken.
    pub fn requeue_query_plans(&mut self, plans: impl IntoIterator<Item = QueryPlan>) {
        let mut queue: Vec<QueryPlan> = plans.into_iter().collect();
        queue.append(&mut self.query_plans_to_add);
        self.query_plans_to_add = queue;
    }

    pub fn clear_query_plans_to_add(&mut self) {
        self.query_plans_to_add.clear();
    }

    /// Remove a query. Returns the owning shared plan, or `None` when the
    /// query was still waiting to be merged.
    pub fn remove_query(
        &mut self,
        query_id: QueryId,
        request: RequestType,
    ) -> Result<Option<SharedQueryId>> {
        if let Some(pos) = self
            .query_plans_to_add
            .iter()
            .position(|p| p.query_id == query_id)
        {
            self.query_plans_to_add.remove(pos);
            return Ok(None);
        }
        let shared_id = *self
            .query_to_shared
            .get(&query_id)
            .ok_or(PlanError::QueryNotFound(query_id))?;
        let shared = self
            .shared_query_plans
            .get_mut(&shared_id)
            .ok_or(PlanError::SharedQueryPlanNotFound(shared_id))?;

        match request {
            RequestType::Fail => {
                shared.set_status(SharedQueryPlanStatus::Failed);
            }
            RequestType::Stop => {
                shared.remove_query(query_id)?;
                self.query_to_shared.remove(&query_id);
                if shared.is_empty() {
                    shared.set_status(SharedQueryPlanStatus::Stopped);
                } else {
                    shared.set_status(SharedQueryPlanStatus::Updated);
                }
            }
        }
        Ok(Some(shared_id))
    }

    pub fn create_new_shared_query_plan(&mut self, plan: QueryPlan) -> SharedQueryId {
        let shared = SharedQueryPlan::create(plan);
        let id = shared.id();
        for q in shared.query_ids() {
            self.query_to_shared.insert(*q, id);
        }
        let key = candidate_key(
            &shared.query_plan().source_consumed(),
            shared.placement_strategy(),
        );
        self.candidates.entry(key).or_default().push(id);
        info!(shared_query_id = %id, "created shared query plan");
        self.shared_query_plans.insert(id, shared);
        id
    }

    /// Mark a shared plan updated and re-index it after its graph changed.
    pub fn update_shared_query_plan(&mut self, id: SharedQueryId) -> Result<()> {
        let shared = self
            .shared_query_plans
            .get_mut(&id)
            .ok_or(PlanError::SharedQueryPlanNotFound(id))?;
        shared.set_status(SharedQueryPlanStatus::Updated);
        for q in shared.query_ids() {
            self.query_to_shared.insert(*q, id);
        }
        let key = candidate_key(
            &shared.query_plan().source_consumed(),
            shared.placement_strategy(),
        );
        for ids in self.candidates.values_mut() {
            ids.retain(|s| *s != id);
        }
        self.candidates.retain(|_, ids| !ids.is_empty());
        self.candidates.entry(key).or_default().push(id);
        Ok(())
    }

    /// Merge candidates for a query consuming `source_consumed`.
    pub fn shared_query_plans_consuming_sources_and_placement_strategy(
        &self,
        source_consumed: &str,
        strategy: PlacementStrategyType,
    ) -> Vec<SharedQueryId> {
        self.candidates
            .get(&candidate_key(source_consumed, strategy))
            .cloned()
            .unwrap_or_default()
    }

    pub fn shared_query_plan(&self, id: SharedQueryId) -> Option<&SharedQueryPlan> {
        self.shared_query_plans.get(&id)
    }

    pub fn shared_query_plan_mut(&mut self, id: SharedQueryId) -> Option<&mut SharedQueryPlan> {
        self.shared_query_plans.get_mut(&id)
    }

    pub fn shared_query_id_for(&self, query_id: QueryId) -> Option<SharedQueryId> {
        self.query_to_shared.get(&query_id).copied()
    }

    pub fn all_shared_query_plans(&self) -> impl Iterator<Item = &SharedQueryPlan> {
        self.shared_query_plans.values()
    }

    /// Plans that still need placement and deployment.
    pub fn shared_query_plans_to_deploy(&self) -> Vec<SharedQueryId> {
        self.shared_query_plans
            .values()
            .filter(|s| {
                matches!(
                    s.status(),
                    SharedQueryPlanStatus::Created | SharedQueryPlanStatus::Updated
                )
            })
            .map(|s| s.id())
            .collect()
    }

    pub fn remove_shared_query_plan(&mut self, id: SharedQueryId) -> Option<SharedQueryPlan> {
        let shared = self.shared_query_plans.remove(&id)?;
        self.query_to_shared.retain(|_, s| *s != id);
        for ids in self.candidates.values_mut() {
            ids.retain(|s| *s != id);
        }
        self.candidates.retain(|_, ids| !ids.is_empty());
        Some(shared)
    }

    /// Garbage-collect plans that failed or lost their last query.
    pub fn remove_failed_or_stopped_shared_query_plans(&mut self) -> Vec<SharedQueryId> {
        let doomed: Vec<SharedQueryId> = self
            .shared_query_plans
            .values()
            .filter(|s| {
                matches!(
                    s.status(),
                    SharedQueryPlanStatus::Failed | SharedQueryPlanStatus::Stopped
                )
            })
            .map(|s| s.id())
            .collect();
        for id in &doomed {
            warn!(shared_query_id = %id, "removing failed or stopped shared query plan");
            self.remove_shared_query_plan(*id);
        }
        doomed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coplace_core::builder::QueryPlanBuilder;

    fn q(id: u64) -> QueryPlan {
        QueryPlanBuilder::from_source("a")
            .filter("v > 5")
            .sink("s")
            .build(QueryId::new(id))
    }

    #[test]
    fn test_duplicate_pending_id_rejected() {
        let mut gqp = GlobalQueryPlan::new();
        gqp.add_query_plan(q(1)).expect("first");
        assert!(matches!(
            gqp.add_query_plan(q(1)),
            Err(PlanError::GlobalQueryPlanUpdate(_))
        ));
        assert_eq!(gqp.query_plans_to_add().len(), 1);
    }

    #[test]
    fn test_invalid_id_rejected() {
        let mut gqp = GlobalQueryPlan::new();
        assert!(gqp.add_query_plan(q(0)).is_err());
    }

    #[test]
    fn test_candidate_lookup_by_source_and_strategy() {
        let mut gqp = GlobalQueryPlan::new();
        let id = gqp.create_new_shared_query_plan(q(1));
        assert_eq!(
            gqp.shared_query_plans_consuming_sources_and_placement_strategy(
                "a",
                PlacementStrategyType::BottomUp
            ),
            vec![id]
        );
        assert!(gqp
            .shared_query_plans_consuming_sources_and_placement_strategy(
                "a",
                PlacementStrategyType::LowLatency
            )
            .is_empty());
    }

    #[test]
    fn test_stop_last_query_then_gc() {
        let mut gqp = GlobalQueryPlan::new();
        let id = gqp.create_new_shared_query_plan(q(1));
        assert_eq!(gqp.shared_query_plans_to_deploy(), vec![id]);

        let owner = gqp
            .remove_query(QueryId::new(1), RequestType::Stop)
            .expect("stop");
        assert_eq!(owner, Some(id));
        let shared = gqp.shared_query_plan(id).expect("still registered");
        assert_eq!(shared.status(), SharedQueryPlanStatus::Stopped);
        assert!(shared.is_empty());

        assert_eq!(gqp.remove_failed_or_stopped_shared_query_plans(), vec![id]);
        assert!(gqp.shared_query_plan(id).is_none());
        assert!(gqp
            .shared_query_plans_consuming_sources_and_placement_strategy(
                "a",
                PlacementStrategyType::BottomUp
            )
            .is_empty());
    }

    #[test]
    fn test_fail_marks_owner_failed() {
        let mut gqp = GlobalQueryPlan::new();
        let id = gqp.create_new_shared_query_plan(q(3));
        gqp.remove_query(QueryId::new(3), RequestType::Fail)
            .expect("fail");
        assert_eq!(
            gqp.shared_query_plan(id).map(|s| s.status()),
            Some(SharedQueryPlanStatus::Failed)
        );
        assert!(gqp.shared_query_plans_to_deploy().is_empty());
    }

    #[test]
    fn test_stop_pending_query_drops_it() {
        let mut gqp = GlobalQueryPlan::new();
        gqp.add_query_plan(q(5)).expect("queue");
        assert_eq!(
            gqp.remove_query(QueryId::new(5), RequestType::Stop)
                .expect("stop"),
            None
        );
        assert!(gqp.query_plans_to_add().is_empty());
        assert!(matches!(
            gqp.remove_query(QueryId::new(5), RequestType::Stop),
            Err(PlanError::QueryNotFound(_))
        ));
    }

    #[test]
    fn test_requeued_plans_go_back_to_the_head_of_the_queue() {
        let mut gqp = GlobalQueryPlan::new();
        gqp.add_query_plan(q(1)).expect("queue");
        gqp.add_query_plan(q(2)).expect("queue");
        let taken = gqp.take_query_plans_to_add();
        gqp.add_query_plan(q(3)).expect("queue");

        gqp.requeue_query_plans(taken);
        let order: Vec<u64> = gqp.query_plans_to_add().iter().map(|p| p.query_id.get()).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }
}
