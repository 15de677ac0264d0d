//! Bully elections.
//!
//! One [`Elector`] runs per local cluster. A round proceeds in phases:
//!
//! 1. **Elect**: `start()` snapshots the member list and opens a numbered round
//! 2. **Collect**: `record_reply()` buffers every BullyReply of that round
//! 3. **Close**: once all replies are in or the reply timer fires, `close()`
//!    selects the winner from the buffered set
//!
//! No reply is acted upon before the round closes, so the outcome does not
//! depend on arrival order. The winner is the maximum under the total order of
//! [`Candidate`]: priority first, node name second.

use std::collections::{BTreeMap, BTreeSet};

use hrm_protocol::{
    Candidate, ClusterKey, HierarchyLevel, NodeName, ANNOUNCE_TIMEOUT_MS, ELECTION_REPLY_TIMEOUT_MS,
};

/// Timing of the election process.
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// How long a round waits for replies.
    pub reply_timeout_ms: u64,
    /// How long a loser waits for the winner's announcement.
    pub announce_timeout_ms: u64,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            reply_timeout_ms: ELECTION_REPLY_TIMEOUT_MS,
            announce_timeout_ms: ANNOUNCE_TIMEOUT_MS,
        }
    }
}

impl ElectionConfig {
    pub fn with_timeouts(reply_timeout_ms: u64, announce_timeout_ms: u64) -> Self {
        Self {
            reply_timeout_ms,
            announce_timeout_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectorState {
    Idle,
    /// Round open, replies outstanding.
    AwaitingReplies,
    /// Lost the round, waiting for the winner's BullyAnnounce.
    AwaitingAnnounce,
    Coordinating,
    Following,
}

impl ElectorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElectorState::Idle => "idle",
            ElectorState::AwaitingReplies => "awaiting_replies",
            ElectorState::AwaitingAnnounce => "awaiting_announce",
            ElectorState::Coordinating => "coordinating",
            ElectorState::Following => "following",
        }
    }

    /// Whether a coordinator is bound.
    pub fn is_settled(&self) -> bool {
        matches!(self, ElectorState::Coordinating | ElectorState::Following)
    }
}

impl std::fmt::Display for ElectorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionOutcome {
    Won,
    Lost { winner: Candidate },
}

#[derive(Debug, Clone)]
struct BufferedReply {
    candidate: Candidate,
    highest_seen: Option<Candidate>,
}

/// Pick the highest candidate. Input order is irrelevant.
pub fn select_winner<'a, I>(candidates: I) -> Option<Candidate>
where
    I: IntoIterator<Item = &'a Candidate>,
{
    candidates.into_iter().max().cloned()
}

/// Election state machine of one cluster.
#[derive(Debug, Clone)]
pub struct Elector {
    cluster: ClusterKey,
    state: ElectorState,
    round: u64,
    expected: BTreeSet<NodeName>,
    replies: BTreeMap<NodeName, BufferedReply>,
}

impl Elector {
    pub fn new(cluster: ClusterKey) -> Self {
        Self {
            cluster,
            state: ElectorState::Idle,
            round: 0,
            expected: BTreeSet::new(),
            replies: BTreeMap::new(),
        }
    }

    pub fn cluster(&self) -> ClusterKey {
        self.cluster
    }

    pub fn state(&self) -> ElectorState {
        self.state
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn is_electing(&self) -> bool {
        self.state == ElectorState::AwaitingReplies
    }

    /// Open a new round against a snapshot of the member list.
    pub fn start(&mut self, members: Vec<NodeName>) -> u64 {
        self.round += 1;
        self.state = ElectorState::AwaitingReplies;
        self.expected = members.into_iter().collect();
        self.replies.clear();
        tracing::debug!(
            cluster = %self.cluster,
            round = self.round,
            expected = self.expected.len(),
            "Election round opened"
        );
        self.round
    }

    /// Buffer a reply. Returns true once every expected member answered.
    pub fn record_reply(
        &mut self,
        from: NodeName,
        round: u64,
        candidate: Candidate,
        highest_seen: Option<Candidate>,
    ) -> bool {
        if self.state != ElectorState::AwaitingReplies || round != self.round {
            tracing::debug!(
                cluster = %self.cluster,
                from = %from,
                round,
                current = self.round,
                "Discarding reply of a closed round"
            );
            return false;
        }
        self.expected.insert(from.clone());
        self.replies.insert(
            from,
            BufferedReply {
                candidate,
                highest_seen,
            },
        );
        self.is_complete()
    }

    /// Whether every expected member has replied.
    pub fn is_complete(&self) -> bool {
        self.expected.iter().all(|member| self.replies.contains_key(member))
    }

    pub fn reply_count(&self) -> usize {
        self.replies.len()
    }

    /// Close the round. `own` is this node's candidate, `watermark` the best
    /// candidate seen outside the round; candidates for which `excluded`
    /// returns true (declared dead) are skipped.
    pub fn close<F>(
        &mut self,
        own: &Candidate,
        watermark: Option<&Candidate>,
        excluded: F,
    ) -> ElectionOutcome
    where
        F: Fn(&Candidate) -> bool,
    {
        let mut pool: Vec<&Candidate> = vec![own];
        for reply in self.replies.values() {
            pool.push(&reply.candidate);
            if let Some(seen) = &reply.highest_seen {
                pool.push(seen);
            }
        }
        if let Some(seen) = watermark {
            pool.push(seen);
        }
        let winner = select_winner(
            pool.into_iter()
                .filter(|candidate| candidate.name == own.name || !excluded(*candidate))
                .filter(|candidate| !candidate.priority.is_undefined()),
        )
        .unwrap_or_else(|| own.clone());

        let outcome = if winner.name == own.name {
            self.state = ElectorState::Coordinating;
            ElectionOutcome::Won
        } else {
            self.state = ElectorState::AwaitingAnnounce;
            ElectionOutcome::Lost { winner }
        };
        tracing::debug!(
            cluster = %self.cluster,
            round = self.round,
            replies = self.replies.len(),
            outcome = ?outcome,
            "Election round closed"
        );
        self.replies.clear();
        self.expected.clear();
        outcome
    }

    /// A better coordinator was accepted; the pending round is abandoned.
    pub fn supersede(&mut self) {
        if self.state == ElectorState::AwaitingReplies {
            tracing::debug!(cluster = %self.cluster, round = self.round, "Election superseded");
        }
        self.round += 1;
        self.state = ElectorState::Following;
        self.replies.clear();
        self.expected.clear();
    }

    /// This node took over as coordinator without a round.
    pub fn assume_coordinator(&mut self) {
        self.state = ElectorState::Coordinating;
        self.replies.clear();
        self.expected.clear();
    }

    /// Coordinator lost or resigned.
    pub fn reset(&mut self) {
        self.round += 1;
        self.state = ElectorState::Idle;
        self.replies.clear();
        self.expected.clear();
    }
}

/// All electors of a node, passed explicitly to whoever needs them.
#[derive(Debug, Default)]
pub struct ElectionRegistry {
    electors: BTreeMap<ClusterKey, Elector>,
}

impl ElectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn elector(&mut self, key: ClusterKey) -> &mut Elector {
        self.electors.entry(key).or_insert_with(|| Elector::new(key))
    }

    pub fn get(&self, key: &ClusterKey) -> Option<&Elector> {
        self.electors.get(key)
    }

    pub fn remove(&mut self, key: &ClusterKey) -> Option<Elector> {
        self.electors.remove(key)
    }

    pub fn state(&self, key: &ClusterKey) -> ElectorState {
        self.electors
            .get(key)
            .map(|elector| elector.state())
            .unwrap_or(ElectorState::Idle)
    }

    /// Whether every elector on `level` has a bound coordinator.
    pub fn settled_on_level(&self, level: HierarchyLevel) -> bool {
        let mut on_level = self.electors.values().filter(|e| e.cluster().level == level);
        let mut any = false;
        let all = on_level.all(|elector| {
            any = true;
            elector.state().is_settled()
        });
        any && all
    }

    pub fn iter(&self) -> impl Iterator<Item = &Elector> {
        self.electors.values()
    }
}
