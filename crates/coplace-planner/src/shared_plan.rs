//! The merged operator graph serving one or more queries.

use std::collections::{BTreeMap, BTreeSet};

use coplace_core::hash::Signature;
use coplace_core::id::{OperatorId, QueryId, SharedQueryId};
use coplace_core::operator::OperatorState;
use coplace_core::plan::{PlacementStrategyType, QueryPlan};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::change_log::{now_micros, ChangeLog, ChangeLogEntry};
use crate::error::{PlanError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SharedQueryPlanStatus {
    Created,
    Updated,
    Deployed,
    Stopped,
    Failed,
}

/// A host operator in the shared plan and the equivalent operator of an
/// incoming query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MatchedOperatorPair {
    pub host: OperatorId,
    pub target: OperatorId,
}

/// What `add_query` will do, computed before any mutation.
struct Graft {
    /// Target operators copied into the host arena.
    copy: BTreeSet<OperatorId>,
    /// Non-sink target operator → equivalent host operator.
    host_of: BTreeMap<OperatorId, OperatorId>,
    /// Target sink → host sink whose inputs it adopts.
    sink_grafts: BTreeMap<OperatorId, OperatorId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedQueryPlan {
    id: SharedQueryId,
    plan: QueryPlan,
    status: SharedQueryPlanStatus,
    query_id_to_sinks: BTreeMap<QueryId, BTreeSet<OperatorId>>,
    query_ids: Vec<QueryId>,
    change_log: ChangeLog,
    signatures: BTreeMap<OperatorId, Signature>,
    placement_strategy: PlacementStrategyType,
}

impl SharedQueryPlan {
    /// Wrap a freshly submitted query in its own shared plan.
    pub fn create(query_plan: QueryPlan) -> Self {
        let query_id = query_plan.query_id;
        let sinks: BTreeSet<OperatorId> = query_plan.sink_operators().into_iter().collect();
        let leaves: BTreeSet<OperatorId> = query_plan.leaf_operators().into_iter().collect();
        let roots: BTreeSet<OperatorId> = query_plan.root_operators().into_iter().collect();
        let mut change_log = ChangeLog::new();
        change_log.add_entry(now_micros(), ChangeLogEntry::new(&query_plan, leaves, roots));

        let mut shared = Self {
            id: SharedQueryId::next(),
            placement_strategy: query_plan.placement_strategy,
            plan: query_plan,
            status: SharedQueryPlanStatus::Created,
            query_id_to_sinks: BTreeMap::from([(query_id, sinks)]),
            query_ids: vec![query_id],
            change_log,
            signatures: BTreeMap::new(),
        };
        shared.refresh_signatures();
        shared
    }

    pub fn id(&self) -> SharedQueryId {
        self.id
    }

    pub fn status(&self) -> SharedQueryPlanStatus {
        self.status
    }

    pub fn set_status(&mut self, status: SharedQueryPlanStatus) {
        debug!(shared_query_id = %self.id, from = ?self.status, to = ?status, "status change");
        self.status = status;
    }

    pub fn query_plan(&self) -> &QueryPlan {
        &self.plan
    }

    pub fn query_plan_mut(&mut self) -> &mut QueryPlan {
        &mut self.plan
    }

    pub fn query_ids(&self) -> &[QueryId] {
        &self.query_ids
    }

    pub fn placement_strategy(&self) -> PlacementStrategyType {
        self.placement_strategy
    }

    /// Every sink of every member query.
    pub fn sink_operators(&self) -> Vec<OperatorId> {
        self.query_id_to_sinks.values().flatten().copied().collect()
    }

    pub fn signatures(&self) -> &BTreeMap<OperatorId, Signature> {
        &self.signatures
    }

    pub fn change_log(&self) -> &ChangeLog {
        &self.change_log
    }

    pub fn is_empty(&self) -> bool {
        self.query_ids.is_empty() || self.plan.is_empty()
    }

    fn refresh_signatures(&mut self) {
        self.signatures = self
            .plan
            .operators()
            .filter_map(|op| op.signature.clone().map(|s| (op.id, s)))
            .collect();
    }

    fn plan_graft(&self, target: &QueryPlan, pairs: &[MatchedOperatorPair]) -> Result<Graft> {
        if pairs.is_empty() {
            return Err(PlanError::InconsistentMatch("no matched operators".into()));
        }
        let mut host_of = BTreeMap::new();
        let mut sink_grafts = BTreeMap::new();
        let mut covered_from: Vec<OperatorId> = Vec::new();
        for pair in pairs {
            let host = self.plan.get(pair.host)?;
            let t = target.get(pair.target)?;
            if host.kind.is_sink() && t.kind.is_sink() {
                sink_grafts.insert(pair.target, pair.host);
                covered_from.extend(t.children.iter().copied());
            } else {
                host_of.insert(pair.target, pair.host);
                covered_from.push(pair.target);
            }
        }
        let covered = target.upstream_closure(&covered_from);
        let copy: BTreeSet<OperatorId> = target
            .operator_ids()
            .into_iter()
            .filter(|id| !covered.contains(id))
            .collect();
        if copy.is_empty() {
            return Err(PlanError::InconsistentMatch(
                "incoming query adds no operators".into(),
            ));
        }
        for id in &copy {
            if sink_grafts.contains_key(id) {
                continue;
            }
            for child in &target.get(*id)?.children {
                if !copy.contains(child) && !host_of.contains_key(child) {
                    return Err(PlanError::InconsistentMatch(format!(
                        "{child} feeds {id} but has no host counterpart"
                    )));
                }
            }
        }
        Ok(Graft {
            copy,
            host_of,
            sink_grafts,
        })
    }

    /// Whether `add_query` would accept these pairs.
    pub fn is_graftable(&self, target: &QueryPlan, pairs: &[MatchedOperatorPair]) -> bool {
        self.plan_graft(target, pairs).is_ok()
    }

    /// Graft the operators of `target` not covered by `pairs` onto the matched
    /// host operators and record the change.
    pub fn add_query(&mut self, target: &QueryPlan, pairs: &[MatchedOperatorPair]) -> Result<()> {
        let graft = self.plan_graft(target, pairs)?;
        let query_id = target.query_id;

        for id in &graft.copy {
            let mut op = target.get(*id)?.detached_copy();
            op.state = OperatorState::ToBePlaced;
            self.plan.add_operator(op);
        }

        let mut attach_points = BTreeSet::new();
        for id in &graft.copy {
            if graft.sink_grafts.contains_key(id) {
                continue;
            }
            for child in target.get(*id)?.children.clone() {
                let mapped = match graft.host_of.get(&child) {
                    Some(host) => {
                        attach_points.insert(*host);
                        *host
                    }
                    None => child,
                };
                self.plan.connect(mapped, *id)?;
            }
        }
        for (target_sink, host_sink) in &graft.sink_grafts {
            for host_child in self.plan.get(*host_sink)?.children.clone() {
                self.plan.connect(host_child, *target_sink)?;
                attach_points.insert(host_child);
            }
        }

        let sinks: BTreeSet<OperatorId> = graft
            .copy
            .iter()
            .copied()
            .filter(|id| self.plan.operator(*id).is_some_and(|op| op.kind.is_sink()))
            .collect();
        let entry = ChangeLogEntry::new(&self.plan, attach_points, sinks.clone());
        self.change_log.add_entry(now_micros(), entry);
        self.query_id_to_sinks.insert(query_id, sinks);
        self.query_ids.push(query_id);
        self.refresh_signatures();
        debug!(
            shared_query_id = %self.id,
            query_id = %query_id,
            added = graft.copy.len(),
            "grafted query onto shared plan"
        );
        Ok(())
    }

    /// Remove a member query's exclusive operators, walking upstream from its
    /// sinks until an operator still used by another query is reached.
    /// Returns that dangling frontier.
    pub fn remove_query(&mut self, query_id: QueryId) -> Result<BTreeSet<OperatorId>> {
        let sinks = self
            .query_id_to_sinks
            .remove(&query_id)
            .ok_or(PlanError::QueryNotFound(query_id))?;
        self.query_ids.retain(|q| *q != query_id);

        let mut frontier = BTreeSet::new();
        let mut stack: Vec<OperatorId> = sinks.into_iter().collect();
        while let Some(id) = stack.pop() {
            let Some(op) = self.plan.remove_operator(id) else {
                continue;
            };
            frontier.remove(&id);
            for child in op.children {
                match self.plan.operator(child) {
                    Some(c) if c.parents.is_empty() => stack.push(child),
                    Some(_) => {
                        frontier.insert(child);
                    }
                    None => {}
                }
            }
        }
        if !frontier.is_empty() {
            let entry = ChangeLogEntry::new(&self.plan, frontier.clone(), frontier.clone());
            self.change_log.add_entry(now_micros(), entry);
        }
        self.refresh_signatures();
        debug!(shared_query_id = %self.id, query_id = %query_id, frontier = frontier.len(), "removed query");
        Ok(frontier)
    }

    /// Clear the pin on every operator strictly between the bounds so the
    /// next placement may move them.
    pub fn perform_re_operator_placement(
        &mut self,
        upstream: &BTreeSet<OperatorId>,
        downstream: &BTreeSet<OperatorId>,
    ) {
        // Manual plans keep their user-chosen nodes.
        let keep_pins = self.placement_strategy() == PlacementStrategyType::Manual;
        for id in self.plan.operators_between(upstream, downstream) {
            if let Some(op) = self.plan.operator_mut(id) {
                if !keep_pins {
                    op.unpin();
                }
                op.state = OperatorState::ToBeReplaced;
            }
        }
    }

    /// Forget every placement decision and queue the whole graph for placement.
    pub fn reset_placement(&mut self) {
        let leaves: BTreeSet<OperatorId> = self.plan.leaf_operators().into_iter().collect();
        let roots: BTreeSet<OperatorId> = self.plan.root_operators().into_iter().collect();
        self.perform_re_operator_placement(&leaves, &roots);
        for op in self.plan.operators_mut() {
            op.state = OperatorState::ToBePlaced;
        }
        self.change_log.discard_pending();
        let entry = ChangeLogEntry::new(&self.plan, leaves, roots);
        self.change_log.add_entry(now_micros(), entry);
    }

    /// Unprocessed change-log entries up to `timestamp`.
    pub fn change_log_entries(&self, timestamp: u64) -> Vec<(u64, ChangeLogEntry)> {
        self.change_log.entries_until(timestamp)
    }

    pub fn update_processed_change_log_timestamp(&mut self, timestamp: u64) {
        self.change_log.update_processed_timestamp(timestamp);
    }

    pub fn compact_change_log(&mut self) -> usize {
        self.change_log.compact()
    }
}
