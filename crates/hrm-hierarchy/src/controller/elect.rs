//! Election handling: BullyElect/Reply/Announce/Alive/Resign, PriorityUpdate,
//! coordinator takeover and loss.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use hrm_protocol::{
    BullyAlive, BullyAnnounce, BullyElect, BullyReply, BullyResign, Candidate, ClusterKey, HrmMessage, NodeName,
    PriorityUpdate, RoutingVector,
};

use super::{Actions, HrmController, Inbound, TimerEvent};
use crate::cluster::{claim_order, CoordinatorBinding, MemberChannel};
use crate::coordinator::Coordinator;
use crate::elections::{ElectionOutcome, ElectorState};
use crate::liveness::LivenessVerdict;
use crate::HierarchyError;

impl HrmController {
    /// Open a new election round on `key`.
    pub(crate) fn begin_election(&mut self, key: ClusterKey, actions: &mut Actions) {
        let Some(cluster) = self.registry.local(&key) else {
            return;
        };
        let name = cluster.name();
        let priority = cluster.priority();
        let members: Vec<MemberChannel> = cluster.members().cloned().collect();
        let round = self
            .elections
            .elector(key)
            .start(members.iter().map(|m| m.peer.clone()).collect());
        self.expected_winners.remove(&key);
        tracing::info!(
            node = %self.name,
            cluster = %key,
            round,
            priority = %priority,
            members = members.len(),
            "Election started"
        );

        if members.is_empty() {
            self.close_round(key, actions);
            return;
        }
        for member in &members {
            let elect = BullyElect {
                sender_name: self.name.clone(),
                sender_priority: priority,
                level: key.level,
                round,
            };
            self.send(&member.route, name, name, HrmMessage::BullyElect(elect), actions);
        }
        actions.arm(
            self.config.election.reply_timeout_ms,
            TimerEvent::ElectionReply { cluster: key, round },
        );
    }

    pub(crate) fn on_elect(&mut self, key: ClusterKey, inbound: Inbound, msg: BullyElect, actions: &mut Actions) {
        let reply_route = inbound.reply_route();
        let Some(cluster) = self.registry.local_mut(&key) else {
            return;
        };
        cluster.add_member(MemberChannel::routed(inbound.origin.clone(), reply_route.clone()));
        cluster.record_priority(&inbound.origin, msg.sender_priority);
        cluster.observe(Candidate::new(msg.sender_name.clone(), msg.sender_priority));
        let name = cluster.name();
        let reply = BullyReply {
            priority: cluster.priority(),
            initiator_name: msg.sender_name,
            round: msg.round,
            highest_seen: cluster.highest_seen().cloned(),
        };
        let last_announce = cluster.last_announce().cloned();
        self.send(&reply_route, name, inbound.sender, HrmMessage::BullyReply(reply), actions);

        match self.elections.state(&key) {
            ElectorState::Idle => {
                if self.started || key.level.is_higher_level() {
                    self.begin_election(key, actions);
                }
            }
            ElectorState::Coordinating | ElectorState::Following => {
                if let Some(announce) = last_announce {
                    self.send(&reply_route, name, inbound.sender, HrmMessage::BullyAnnounce(announce), actions);
                }
            }
            ElectorState::AwaitingReplies | ElectorState::AwaitingAnnounce => {}
        }
    }

    pub(crate) fn on_reply(&mut self, key: ClusterKey, inbound: Inbound, msg: BullyReply, actions: &mut Actions) {
        if msg.initiator_name != self.name {
            return;
        }
        let Some(cluster) = self.registry.local_mut(&key) else {
            return;
        };
        let candidate = Candidate::new(inbound.origin.clone(), msg.priority);
        cluster.record_priority(&inbound.origin, msg.priority);
        cluster.observe(candidate.clone());
        if let Some(seen) = &msg.highest_seen {
            cluster.observe(seen.clone());
        }
        let complete = self
            .elections
            .elector(key)
            .record_reply(inbound.origin, msg.round, candidate, msg.highest_seen);
        if complete {
            self.close_round(key, actions);
        }
    }

    pub(crate) fn on_reply_timeout(&mut self, key: ClusterKey, round: u64, actions: &mut Actions) {
        let Some(elector) = self.elections.get(&key) else {
            return;
        };
        if elector.state() == ElectorState::AwaitingReplies && elector.round() == round {
            let timeout = HierarchyError::ElectionTimeout(key.to_string());
            tracing::debug!(node = %self.name, round, error = %timeout, "Closing round without all replies");
            self.close_round(key, actions);
        }
    }

    fn close_round(&mut self, key: ClusterKey, actions: &mut Actions) {
        let Some(cluster) = self.registry.local(&key) else {
            return;
        };
        let own = cluster.own_candidate(&self.name);
        let watermark = cluster.highest_seen().cloned();
        let bound = cluster.coordinator().map(|binding| binding.name.clone());
        let elector = self.elections.elector(key);
        let round = elector.round();
        let outcome = elector.close(&own, watermark.as_ref(), |c| cluster.is_excluded(&c.name));

        match outcome {
            ElectionOutcome::Won => self.become_coordinator(key, actions),
            ElectionOutcome::Lost { winner } => {
                tracing::info!(
                    node = %self.name,
                    cluster = %key,
                    winner = %winner,
                    "Election lost"
                );
                if bound.as_ref() == Some(&winner.name) {
                    self.elections.elector(key).supersede();
                    return;
                }
                self.expected_winners.insert(key, winner);
                actions.arm(
                    self.config.election.announce_timeout_ms,
                    TimerEvent::AnnounceWait { cluster: key, round },
                );
            }
        }
    }

    /// The winner of a lost round never announced: exclude it and re-elect.
    pub(crate) fn on_announce_timeout(&mut self, key: ClusterKey, round: u64, actions: &mut Actions) {
        let Some(elector) = self.elections.get(&key) else {
            return;
        };
        if elector.state() != ElectorState::AwaitingAnnounce || elector.round() != round {
            return;
        }
        let winner = self.expected_winners.remove(&key);
        let Some(cluster) = self.registry.local_mut(&key) else {
            return;
        };
        if let Some(winner) = &winner {
            tracing::warn!(
                node = %self.name,
                cluster = %key,
                winner = %winner,
                "Election winner never announced"
            );
            cluster.suspect(winner.name.clone());
        }
        cluster.reset_highest_seen();
        self.elections.elector(key).reset();
        self.begin_election(key, actions);
    }

    /// Take over as coordinator of `key` under a fresh token.
    pub(crate) fn become_coordinator(&mut self, key: ClusterKey, actions: &mut Actions) {
        let token = self.random_token();
        self.epoch += 1;
        let epoch = self.epoch;
        let signature = self.identity.sign(key.level);
        let Some(cluster) = self.registry.local_mut(&key) else {
            return;
        };
        let old = cluster.set_token(token);
        let name = cluster.name();
        let priority = cluster.priority();

        let mut covered: BTreeSet<NodeName> = cluster.member_names().into_iter().collect();
        covered.insert(self.name.clone());
        let announce = BullyAnnounce {
            coordinator_name: self.name.clone(),
            coordinator_address: self.address,
            priority,
            signature: signature.clone(),
            token,
            epoch,
            covered_nodes: covered.into_iter().collect(),
            routing_vectors: Vec::new(),
        };
        cluster.set_coordinator(CoordinatorBinding {
            name: self.name.clone(),
            address: self.address,
            priority,
            signature: signature.clone(),
            token,
            epoch,
            channel: None,
            route: Vec::new(),
        });
        cluster.set_last_announce(announce.clone());
        cluster.clear_suspects();
        cluster.set_awaiting_topology(false);
        let generation = cluster.generation();
        let members: Vec<MemberChannel> = cluster.members().cloned().collect();

        self.rekey_in_graph(old, name);
        self.expected_winners.remove(&key);
        self.elections.elector(key).assume_coordinator();
        if let Err(e) = self.approved.approve(&signature) {
            tracing::warn!(node = %self.name, error = %e, "Own signature rejected");
        }
        self.monitor.unmonitor(&key);
        tracing::info!(
            node = %self.name,
            cluster = %name,
            priority = %priority,
            epoch,
            members = members.len(),
            "Election won, coordinating"
        );

        for member in &members {
            self.send(&member.route, name, name, HrmMessage::BullyAnnounce(announce.clone()), actions);
        }

        let mut coordinator = Coordinator::new(key, self.name.clone(), self.address, priority);
        coordinator.set_local_attachments(self.attachments_of(key));
        for previous in self.coordinators.get(&key).into_iter().flat_map(|c| c.members()) {
            if previous.name != self.name && members.iter().any(|m| m.peer == previous.name) {
                coordinator.add_member(previous.clone());
            }
        }
        coordinator.arm_distribution();
        self.coordinators.insert(key, coordinator);

        self.after_coordinator_bound(key, actions);

        actions.arm(
            self.config.liveness.alive_interval_ms,
            TimerEvent::AliveTick { cluster: key, generation },
        );
        actions.arm(
            self.config.address_distribution_delay_ms,
            TimerEvent::AddressDistribution { cluster: key, generation },
        );
        if (key.level.value() + 1) < self.config.height as i32 {
            actions.arm(
                self.config.election.announce_timeout_ms,
                TimerEvent::SuperiorCheck { level: key.level },
            );
        }
    }

    pub(crate) fn on_announce(
        &mut self,
        key: ClusterKey,
        inbound: Inbound,
        mut msg: BullyAnnounce,
        actions: &mut Actions,
    ) {
        if msg.coordinator_name == self.name {
            return;
        }
        if msg.signature.signer != msg.coordinator_name || msg.signature.verify().is_err() {
            tracing::warn!(
                node = %self.name,
                cluster = %key,
                coordinator = %msg.coordinator_name,
                "Dropping announcement with invalid signature"
            );
            return;
        }
        let reply_route = inbound.reply_route();
        let started = self.started;
        let Some(cluster) = self.registry.local_mut(&key) else {
            return;
        };
        if cluster.is_failed_claim(&msg.coordinator_name, msg.epoch) {
            tracing::debug!(
                node = %self.name,
                coordinator = %msg.coordinator_name,
                epoch = msg.epoch,
                "Ignoring announcement of a failed coordinator"
            );
            return;
        }
        msg.routing_vectors.push(inbound.segment(&self.name));
        cluster.add_member(MemberChannel::routed(inbound.origin.clone(), reply_route.clone()));
        cluster.observe(msg.candidate());

        if let Some(binding) = cluster.coordinator() {
            match claim_order(&msg.candidate(), msg.epoch, &binding.candidate(), binding.epoch) {
                Ordering::Equal => {
                    if self.elections.state(&key) != ElectorState::Following {
                        self.elections.elector(key).supersede();
                    }
                    return;
                }
                Ordering::Less => {
                    let name = cluster.name();
                    if let Some(better) = cluster.last_announce().cloned() {
                        tracing::debug!(
                            node = %self.name,
                            cluster = %key,
                            offered = %msg.coordinator_name,
                            held = %better.coordinator_name,
                            "Bouncing weaker announcement"
                        );
                        self.send(&reply_route, name, inbound.sender, HrmMessage::BullyAnnounce(better), actions);
                    }
                    return;
                }
                Ordering::Greater => {}
            }
        } else if msg.candidate() < cluster.own_candidate(&self.name) {
            if self.elections.state(&key) == ElectorState::Idle && (started || key.level.is_higher_level()) {
                self.begin_election(key, actions);
            }
            return;
        }

        self.accept_announce(key, inbound, msg, actions);
    }

    fn accept_announce(&mut self, key: ClusterKey, inbound: Inbound, msg: BullyAnnounce, actions: &mut Actions) {
        if self.coordinators.remove(&key).is_some() {
            tracing::info!(
                node = %self.name,
                cluster = %key,
                successor = %msg.coordinator_name,
                "Resigning as coordinator"
            );
        }
        let mut route = RoutingVector::route_back(&msg.routing_vectors, &self.name);
        if route.is_empty() {
            route.push(inbound.origin.clone());
        }
        let Some(cluster) = self.registry.local_mut(&key) else {
            return;
        };
        let old = cluster.set_token(msg.token);
        let name = cluster.name();
        cluster.set_coordinator(CoordinatorBinding {
            name: msg.coordinator_name.clone(),
            address: msg.coordinator_address,
            priority: msg.priority,
            signature: msg.signature.clone(),
            token: msg.token,
            epoch: msg.epoch,
            channel: route.first().cloned(),
            route: route.clone(),
        });
        cluster.set_last_announce(msg.clone());
        cluster.clear_suspects();
        cluster.forgive(&msg.coordinator_name);
        cluster.set_awaiting_topology(true);
        let generation = cluster.generation();

        let mut informed: BTreeSet<NodeName> = msg.covered_nodes.iter().cloned().collect();
        informed.insert(self.name.clone());
        informed.insert(inbound.origin.clone());
        informed.insert(msg.coordinator_name.clone());
        let targets = cluster.broadcast_targets(&mut informed);

        self.rekey_in_graph(old, name);
        self.expected_winners.remove(&key);
        self.elections.elector(key).supersede();
        if let Err(e) = self.approved.approve(&msg.signature) {
            tracing::warn!(node = %self.name, error = %e, "Coordinator signature rejected");
        }
        self.monitor.monitor(key, msg.coordinator_name.clone(), msg.epoch);
        self.names.register_node(&msg.coordinator_name, msg.coordinator_address);
        self.names.register_route(&self.name, &msg.coordinator_name, route.clone());
        tracing::info!(
            node = %self.name,
            cluster = %name,
            coordinator = %msg.coordinator_name,
            priority = %msg.priority,
            hops = route.len(),
            "Coordinator accepted"
        );

        let mut forward = msg;
        forward.covered_nodes = informed.into_iter().collect();
        for target in &targets {
            self.send(&target.route, name, name, HrmMessage::BullyAnnounce(forward.clone()), actions);
        }

        self.after_coordinator_bound(key, actions);
        self.send_membership(key, actions);
        actions.arm(
            self.config.liveness.timeout_ms,
            TimerEvent::LivenessCheck { cluster: key, generation },
        );
    }

    /// Send the current announcement to a member that joined late.
    pub(crate) fn greet_member(&mut self, key: ClusterKey, peer: &NodeName, actions: &mut Actions) {
        if !self.elections.state(&key).is_settled() {
            return;
        }
        let Some(cluster) = self.registry.local(&key) else {
            return;
        };
        let (Some(announce), Some(member)) = (cluster.last_announce().cloned(), cluster.member(peer)) else {
            return;
        };
        let route = member.route.clone();
        let name = cluster.name();
        self.send(&route, name, name, HrmMessage::BullyAnnounce(announce), actions);
    }

    // ── Heartbeats ──

    pub(crate) fn on_alive_tick(&mut self, key: ClusterKey, generation: u64, actions: &mut Actions) {
        let Some(cluster) = self.registry.local_mut(&key) else {
            return;
        };
        if cluster.generation() != generation || !cluster.is_coordinator(&self.name) {
            return;
        }
        let sequence = cluster.next_alive_sequence();
        let name = cluster.name();
        let members: Vec<MemberChannel> = cluster.members().cloned().collect();
        for member in &members {
            let alive = BullyAlive {
                peer_name: self.name.clone(),
                coordinator_name: self.name.clone(),
                sequence,
            };
            self.send(&member.route, name, name, HrmMessage::BullyAlive(alive), actions);
        }
        actions.arm(
            self.config.liveness.alive_interval_ms,
            TimerEvent::AliveTick { cluster: key, generation },
        );
    }

    pub(crate) fn on_alive(&mut self, key: ClusterKey, inbound: Inbound, msg: BullyAlive, actions: &mut Actions) {
        let Some(cluster) = self.registry.local_mut(&key) else {
            return;
        };
        let follows = cluster
            .coordinator()
            .map(|binding| !binding.is_local() && binding.name == msg.coordinator_name)
            .unwrap_or(false);
        if !follows || !cluster.accept_alive(msg.sequence) {
            return;
        }
        self.monitor.record_alive(&key, &msg.coordinator_name);

        let mut informed: BTreeSet<NodeName> = [
            inbound.origin.clone(),
            msg.coordinator_name.clone(),
            self.name.clone(),
        ]
        .into_iter()
        .collect();
        let name = cluster.name();
        let targets = cluster.broadcast_targets(&mut informed);
        for target in &targets {
            let alive = BullyAlive {
                peer_name: self.name.clone(),
                coordinator_name: msg.coordinator_name.clone(),
                sequence: msg.sequence,
            };
            self.send(&target.route, name, name, HrmMessage::BullyAlive(alive), actions);
        }
    }

    pub(crate) fn on_liveness_check(&mut self, key: ClusterKey, generation: u64, actions: &mut Actions) {
        let Some(cluster) = self.registry.local(&key) else {
            return;
        };
        if cluster.generation() != generation {
            return;
        }
        match self.monitor.check(&key) {
            LivenessVerdict::Alive => actions.arm(
                self.config.liveness.timeout_ms,
                TimerEvent::LivenessCheck { cluster: key, generation },
            ),
            LivenessVerdict::Lost => self.coordinator_lost(key, actions),
            LivenessVerdict::Unmonitored => {}
        }
    }

    /// Drop a dead or unreachable coordinator and re-elect.
    pub(crate) fn coordinator_lost(&mut self, key: ClusterKey, actions: &mut Actions) {
        let Some(cluster) = self.registry.local_mut(&key) else {
            return;
        };
        if let Some(binding) = cluster.clear_coordinator() {
            if !binding.is_local() {
                tracing::warn!(
                    node = %self.name,
                    cluster = %key,
                    coordinator = %binding.name,
                    epoch = binding.epoch,
                    "Coordinator lost, re-electing"
                );
                cluster.mark_failed(binding.name.clone(), binding.epoch);
                let removed = self.table_write().remove_signed_by(&binding.name);
                if removed > 0 {
                    tracing::debug!(node = %self.name, removed, "Dropped entries of lost coordinator");
                }
                self.approved.revoke(&binding.name);
            }
        }
        self.monitor.unmonitor(&key);
        self.coordinators.remove(&key);
        self.elections.elector(key).reset();
        self.begin_election(key, actions);
    }

    /// The coordinator this cluster follows stepped down; re-elect without
    /// holding it against the resigned node.
    pub(crate) fn on_resign(&mut self, key: ClusterKey, inbound: Inbound, msg: BullyResign, actions: &mut Actions) {
        if let Err(e) = msg.verify() {
            tracing::warn!(
                node = %self.name,
                cluster = %key,
                origin = %inbound.origin,
                error = %e,
                "Dropping resignation with invalid signature"
            );
            return;
        }
        let Some(cluster) = self.registry.local_mut(&key) else {
            return;
        };
        let bound = cluster
            .coordinator()
            .map(|binding| !binding.is_local() && binding.name == msg.coordinator_name && binding.epoch == msg.epoch)
            .unwrap_or(false);
        if !bound {
            tracing::debug!(
                node = %self.name,
                cluster = %key,
                coordinator = %msg.coordinator_name,
                "Ignoring resignation of a coordinator not followed"
            );
            return;
        }
        cluster.clear_coordinator();
        tracing::info!(
            node = %self.name,
            cluster = %key,
            coordinator = %msg.coordinator_name,
            epoch = msg.epoch,
            "Coordinator resigned, re-electing"
        );
        self.table_write().remove_signed_by(&msg.coordinator_name);
        self.monitor.unmonitor(&key);
        self.elections.elector(key).reset();
        self.begin_election(key, actions);
    }

    // ── Priorities ──

    /// Add the connectivity bonus for a new neighbor cluster of `key`. A
    /// foreign neighbor only marks the cluster as a boundary.
    pub(crate) fn raise_connectivity(&mut self, key: ClusterKey, foreign_neighbor: bool, actions: &mut Actions) {
        let offset = self.config.connectivity_offset;
        let Some(cluster) = self.registry.local_mut(&key) else {
            return;
        };
        if foreign_neighbor {
            cluster.set_boundary(true);
            return;
        }
        cluster.increase_connectivity(offset);
        let priority = cluster.priority();
        let name = cluster.name();
        tracing::debug!(node = %self.name, cluster = %key, priority = %priority, "Connectivity priority raised");
        if !self.started {
            return;
        }

        let overtakes = cluster
            .coordinator()
            .map(|binding| !binding.is_local() && cluster.own_candidate(&self.name) > binding.candidate())
            .unwrap_or(false);
        let members: Vec<MemberChannel> = if cluster.is_boundary() {
            Vec::new()
        } else {
            cluster.members().cloned().collect()
        };
        for member in &members {
            let update = PriorityUpdate { priority };
            self.send(&member.route, name, name, HrmMessage::PriorityUpdate(update), actions);
        }
        if overtakes && self.elections.state(&key) == ElectorState::Following {
            self.begin_election(key, actions);
        }
    }

    pub(crate) fn on_priority_update(
        &mut self,
        key: ClusterKey,
        inbound: Inbound,
        msg: PriorityUpdate,
        actions: &mut Actions,
    ) {
        let Some(cluster) = self.registry.local_mut(&key) else {
            return;
        };
        let candidate = Candidate::new(inbound.origin.clone(), msg.priority);
        cluster.record_priority(&inbound.origin, msg.priority);
        cluster.observe(candidate.clone());
        let reelect = cluster.is_coordinator(&self.name) && candidate > cluster.own_candidate(&self.name);
        if reelect && self.elections.state(&key) == ElectorState::Coordinating {
            tracing::info!(
                node = %self.name,
                cluster = %key,
                member = %candidate,
                "Member overtook coordinator priority, re-electing"
            );
            self.begin_election(key, actions);
        }
    }
}
