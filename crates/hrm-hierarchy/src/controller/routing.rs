//! RouteRequest resolution against the local forwarding table, with the
//! base-level coordinator as fallback.

use std::collections::BTreeSet;

use serde::Serialize;

use hrm_protocol::{
    ClusterKey, ClusterName, FibEntry, HierarchyLevel, HrmMessage, Hrmid, L2Address, RouteRequest, RouteResult,
};

use super::{node_scope, Actions, HrmController, Inbound};
use crate::HierarchyError;

/// Answer to a route request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteOutcome {
    pub result: RouteResult,
    /// Next hops toward the target, nearest first.
    pub route: Vec<L2Address>,
    pub description: String,
}

impl RouteOutcome {
    fn unfeasible(description: impl Into<String>) -> Self {
        Self {
            result: RouteResult::Unfeasible,
            route: Vec::new(),
            description: description.into(),
        }
    }
}

impl HrmController {
    /// Ask for a route to `target` that passes through every cluster in
    /// `required`. Returns a session id; the outcome is available through
    /// [`HrmController::route_result`] immediately when the local table
    /// decides, or once the coordinator answered.
    pub fn route_request(&mut self, target: Hrmid, required: Vec<ClusterName>) -> (u64, Actions) {
        let mut actions = Actions::new();
        self.next_session += 1;
        let session = self.next_session;

        if let Some(outcome) = self.resolve_locally(&target, &required) {
            tracing::debug!(
                node = %self.name,
                target = %target,
                result = %outcome.result,
                "Route resolved locally"
            );
            self.route_sessions.insert(session, Some(outcome));
            return (session, actions);
        }

        let upstream = self
            .registry
            .local_keys_at(HierarchyLevel::BASE)
            .into_iter()
            .filter_map(|key| self.registry.local(&key))
            .filter_map(|cluster| cluster.coordinator())
            .find(|binding| !binding.is_local() && !binding.route.is_empty())
            .map(|binding| binding.route.clone());

        let Some(route) = upstream else {
            tracing::info!(node = %self.name, target = %target, "No route and no coordinator to ask");
            let unreachable = HierarchyError::UnreachableCluster(format!("{} (no coordinator to ask)", target));
            self.route_sessions
                .insert(session, Some(RouteOutcome::unfeasible(unreachable.to_string())));
            return (session, actions);
        };

        let source = self.primary_hrmid().unwrap_or(Hrmid::UNASSIGNED);
        let mut request = RouteRequest::new(source, target, session, self.name.clone());
        request.required_clusters = required;
        request.description = format!("route {} -> {}", source, target);
        tracing::debug!(
            node = %self.name,
            target = %target,
            session,
            coordinator = ?route.last(),
            "Asking coordinator for a route"
        );
        self.route_sessions.insert(session, None);
        let scope = node_scope(HierarchyLevel::BASE);
        self.send(&route, scope, scope, HrmMessage::RouteRequest(request), &mut actions);
        (session, actions)
    }

    /// Outcome of a route session, `None` while it is still pending or if
    /// the session is unknown.
    pub fn route_result(&self, session: u64) -> Option<&RouteOutcome> {
        self.route_sessions.get(&session).and_then(|outcome| outcome.as_ref())
    }

    pub(crate) fn on_route_request(&mut self, inbound: Inbound, mut msg: RouteRequest, actions: &mut Actions) {
        if msg.is_answer {
            let Some(slot) = self.route_sessions.get_mut(&msg.session) else {
                tracing::debug!(node = %self.name, session = msg.session, "Answer for an unknown route session");
                return;
            };
            let result = msg.result.unwrap_or(RouteResult::Unfeasible);
            tracing::info!(
                node = %self.name,
                target = %msg.target,
                session = msg.session,
                result = %result,
                "Route request answered"
            );
            *slot = Some(RouteOutcome {
                result,
                route: msg.route,
                description: msg.description,
            });
            return;
        }

        let outcome = self
            .resolve_locally(&msg.target, &msg.required_clusters)
            .unwrap_or_else(|| {
                RouteOutcome::unfeasible(HierarchyError::UnreachableCluster(msg.target.to_string()).to_string())
            });
        tracing::debug!(
            node = %self.name,
            requester = %msg.requester,
            target = %msg.target,
            result = %outcome.result,
            "Answering route request"
        );
        msg.description = outcome.description;
        msg.set_result(outcome.result, outcome.route);
        let scope = node_scope(HierarchyLevel::BASE);
        self.send(&inbound.reply_route(), scope, inbound.sender, HrmMessage::RouteRequest(msg), actions);
    }

    /// Decide a route from the local table alone. `None` if the table has no
    /// matching entry.
    fn resolve_locally(&self, target: &Hrmid, required: &[ClusterName]) -> Option<RouteOutcome> {
        if target.is_unassigned() {
            return Some(RouteOutcome::unfeasible("unassigned destination"));
        }
        if self.hrmids().iter().any(|(_, hrmid)| hrmid == target) {
            return Some(RouteOutcome {
                result: RouteResult::Success,
                route: Vec::new(),
                description: "local destination".into(),
            });
        }
        let entry = self.table_read().resolve(target).cloned()?;
        let traversed = self.traversed_clusters(&entry);
        let missing: Vec<String> = required
            .iter()
            .filter(|cluster| !traversed.contains(&cluster.key()))
            .map(|cluster| cluster.to_string())
            .collect();
        let (result, description) = if missing.is_empty() {
            (RouteResult::Success, format!("via {}", entry.next_cluster))
        } else {
            (
                RouteResult::Alternative,
                format!("via {}, missing {}", entry.next_cluster, missing.join(",")),
            )
        };
        Some(RouteOutcome {
            result,
            route: vec![entry.next_hop],
            description,
        })
    }

    /// Clusters a packet following `entry` passes through, as far as this
    /// node's graph can tell.
    fn traversed_clusters(&self, entry: &FibEntry) -> BTreeSet<ClusterKey> {
        let mut traversed: BTreeSet<ClusterKey> = self.registry.local_keys_at(HierarchyLevel::BASE).into_iter().collect();
        traversed.insert(entry.next_cluster.key());
        let goal = entry.farthest_cluster.unwrap_or(entry.next_cluster);
        let graph = self.graph_read();
        for key in self.registry.local_keys_at(HierarchyLevel::BASE) {
            let Some(start) = self.registry.current_name(&key) else {
                continue;
            };
            let path = graph.get_intermediate_nodes(&start, &goal);
            if path.is_empty() {
                continue;
            }
            traversed.extend(path.iter().map(|cluster| cluster.key()));
            break;
        }
        traversed
    }
}
