//! Tokio runtime: one task per node.
//!
//! Every node task owns its controller and a [`ChannelMuxer`] of in-memory
//! channels. It waits on three inputs (commands from its handle, fired
//! timers, frames from neighbors) and carries out the returned actions:
//! frames go out through the muxer, timer requests become sleeping tasks.
//! After every step the task refreshes a snapshot that outside observers
//! read through the handle.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;

use hrm_hierarchy::{Actions, HrmController, RouteOutcome, SharedClusterGraph, SharedRoutingTable, TimerEvent};
use hrm_network::channel::{inbox, Frame};
use hrm_network::{Channel, ChannelMuxer, MemoryChannel, MemoryNameService, NameService};
use hrm_protocol::{ClusterKey, ClusterName, Hrmid, L2Address, NodeName};

use crate::config::NodeConfig;
use crate::NodeError;

/// Observable state of a node, refreshed after every handled input.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub name: NodeName,
    pub address: L2Address,
    pub coordinators: Vec<(ClusterKey, NodeName)>,
    pub hrmids: Vec<(ClusterKey, Hrmid)>,
    pub neighbor_clusters: usize,
    pub routing_entries: usize,
    pub status: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

impl NodeSnapshot {
    fn capture(controller: &HrmController) -> Self {
        let coordinators = controller
            .cluster_keys()
            .into_iter()
            .filter_map(|key| controller.coordinator_of(&key).map(|name| (key, name)))
            .collect();
        let status = controller.status();
        Self {
            name: controller.name().clone(),
            address: controller.address(),
            coordinators,
            hrmids: controller.hrmids(),
            neighbor_clusters: controller.neighbor_clusters().len(),
            routing_entries: status["routing_entries"].as_u64().unwrap_or(0) as usize,
            status,
            updated_at: Utc::now(),
        }
    }
}

enum Command {
    Start,
    Attach {
        channel: Arc<dyn Channel>,
        address: L2Address,
        cluster: Option<i64>,
    },
    Detach(NodeName),
    RequestCoordinator,
    Discover(NodeName),
    Route {
        target: Hrmid,
        required: Vec<ClusterName>,
        reply: oneshot::Sender<u64>,
    },
    RouteResult {
        session: u64,
        reply: oneshot::Sender<Option<RouteOutcome>>,
    },
    Shutdown,
}

/// Handle on a running node task.
#[derive(Clone)]
pub struct NodeHandle {
    name: NodeName,
    address: L2Address,
    commands: mpsc::UnboundedSender<Command>,
    inbox: mpsc::UnboundedSender<Frame>,
    snapshot: Arc<RwLock<NodeSnapshot>>,
    graph: SharedClusterGraph,
    routing: SharedRoutingTable,
}

impl NodeHandle {
    pub fn name(&self) -> &NodeName {
        &self.name
    }

    pub fn address(&self) -> L2Address {
        self.address
    }

    fn command(&self, command: Command) -> Result<(), NodeError> {
        self.commands
            .send(command)
            .map_err(|_| NodeError::NodeStopped(self.name.to_string()))
    }

    pub fn start(&self) -> Result<(), NodeError> {
        self.command(Command::Start)
    }

    pub fn detach(&self, peer: &NodeName) -> Result<(), NodeError> {
        self.command(Command::Detach(peer.clone()))
    }

    pub fn request_coordinator(&self) -> Result<(), NodeError> {
        self.command(Command::RequestCoordinator)
    }

    pub fn discover(&self, peer: &NodeName) -> Result<(), NodeError> {
        self.command(Command::Discover(peer.clone()))
    }

    /// Open a route request session and return its id.
    pub async fn route_request(&self, target: Hrmid, required: Vec<ClusterName>) -> Result<u64, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Route {
            target,
            required,
            reply,
        })?;
        rx.await.map_err(|_| NodeError::NodeStopped(self.name.to_string()))
    }

    pub async fn route_result(&self, session: u64) -> Result<Option<RouteOutcome>, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::RouteResult { session, reply })?;
        rx.await.map_err(|_| NodeError::NodeStopped(self.name.to_string()))
    }

    /// Deliver a raw frame as if `from` had sent it over a channel.
    pub fn inject(&self, from: &NodeName, bytes: Vec<u8>) -> Result<(), NodeError> {
        self.inbox
            .send(Frame {
                from: from.clone(),
                bytes,
            })
            .map_err(|_| NodeError::NodeStopped(self.name.to_string()))
    }

    pub async fn snapshot(&self) -> NodeSnapshot {
        self.snapshot.read().await.clone()
    }

    /// Live handle on the node's cluster graph.
    pub fn graph(&self) -> SharedClusterGraph {
        Arc::clone(&self.graph)
    }

    /// Live handle on the node's routing table.
    pub fn routing_table(&self) -> SharedRoutingTable {
        Arc::clone(&self.routing)
    }
}

/// A topology of node tasks.
pub struct NodeRuntime {
    handles: BTreeMap<NodeName, NodeHandle>,
    channels: BTreeMap<(NodeName, NodeName), MemoryChannel>,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeRuntime {
    /// Spawn one task per node and open every link. Elections are started
    /// separately with [`NodeRuntime::start`].
    pub fn spawn(config: &NodeConfig) -> Result<Self, NodeError> {
        config.validate()?;
        let hrm_config = config.hrm_config();
        let names: Arc<dyn NameService> = Arc::new(MemoryNameService::new());

        let mut runtime = Self {
            handles: BTreeMap::new(),
            channels: BTreeMap::new(),
            tasks: Vec::new(),
        };
        let mut inboxes = BTreeMap::new();
        for (index, spec) in config.nodes.iter().enumerate() {
            let name = spec.node_name();
            let address = L2Address(index as u64 + 1);
            let controller = HrmController::new(
                name.clone(),
                address,
                spec.bully_priority(),
                spec.foreign,
                hrm_config.clone(),
                Arc::clone(&names),
            );
            let (inbox_tx, inbox_rx) = inbox();
            let (commands_tx, commands_rx) = mpsc::unbounded_channel();
            let snapshot = Arc::new(RwLock::new(NodeSnapshot::capture(&controller)));
            let handle = NodeHandle {
                name: name.clone(),
                address,
                commands: commands_tx,
                inbox: inbox_tx.clone(),
                snapshot: Arc::clone(&snapshot),
                graph: controller.graph(),
                routing: controller.routing_table(),
            };
            let task = NodeTask {
                muxer: ChannelMuxer::new(name.clone()),
                controller,
                snapshot,
            };
            runtime.tasks.push(tokio::spawn(task.run(commands_rx, inbox_rx)));
            inboxes.insert(name.clone(), inbox_tx);
            runtime.handles.insert(name, handle);
        }

        for link in &config.links {
            let a = NodeName::new(link.a.clone());
            let b = NodeName::new(link.b.clone());
            let (Some(a_inbox), Some(b_inbox)) = (inboxes.get(&a), inboxes.get(&b)) else {
                return Err(NodeError::InvalidTopology(format!("link {}-{}", a, b)));
            };
            let (a_end, b_end) = MemoryChannel::pair(a.clone(), a_inbox.clone(), b.clone(), b_inbox.clone());
            runtime.attach(&a, a_end.clone(), &b, link.cluster)?;
            runtime.attach(&b, b_end, &a, link.cluster)?;
            runtime.channels.insert((a, b), a_end);
        }
        tracing::info!(
            nodes = runtime.handles.len(),
            links = runtime.channels.len(),
            "Node runtime spawned"
        );
        Ok(runtime)
    }

    fn attach(
        &self,
        local: &NodeName,
        channel: MemoryChannel,
        peer: &NodeName,
        cluster: Option<i64>,
    ) -> Result<(), NodeError> {
        let address = self.handle(peer)?.address();
        self.handle(local)?.command(Command::Attach {
            channel: Arc::new(channel),
            address,
            cluster,
        })
    }

    /// Start elections on every node.
    pub fn start(&self) -> Result<(), NodeError> {
        for handle in self.handles.values() {
            handle.start()?;
        }
        Ok(())
    }

    /// Close the channel between `a` and `b`; both ends detach.
    pub fn fail_link(&mut self, a: &NodeName, b: &NodeName) -> Result<(), NodeError> {
        let channel = self
            .channels
            .remove(&(a.clone(), b.clone()))
            .or_else(|| self.channels.remove(&(b.clone(), a.clone())))
            .ok_or_else(|| NodeError::InvalidTopology(format!("no link {}-{}", a, b)))?;
        channel.close();
        self.handle(a)?.detach(b)?;
        self.handle(b)?.detach(a)?;
        Ok(())
    }

    pub fn handle(&self, name: &NodeName) -> Result<&NodeHandle, NodeError> {
        self.handles
            .get(name)
            .ok_or_else(|| NodeError::UnknownNode(name.to_string()))
    }

    pub fn handles(&self) -> impl Iterator<Item = &NodeHandle> {
        self.handles.values()
    }

    pub async fn snapshots(&self) -> Vec<NodeSnapshot> {
        let mut snapshots = Vec::with_capacity(self.handles.len());
        for handle in self.handles.values() {
            snapshots.push(handle.snapshot().await);
        }
        snapshots
    }

    /// Stop every node task and wait for them to finish.
    pub async fn shutdown(self) {
        for handle in self.handles.values() {
            let _ = handle.command(Command::Shutdown);
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Node task failed");
            }
        }
    }
}

struct NodeTask {
    controller: HrmController,
    muxer: ChannelMuxer,
    snapshot: Arc<RwLock<NodeSnapshot>>,
}

impl NodeTask {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut frames: mpsc::UnboundedReceiver<Frame>,
    ) {
        let (timer_tx, mut timers) = mpsc::unbounded_channel::<TimerEvent>();
        tracing::debug!(node = %self.controller.name(), "Node task started");

        loop {
            let actions = tokio::select! {
                biased;
                command = commands.recv() => match command {
                    None | Some(Command::Shutdown) => break,
                    Some(command) => self.handle_command(command),
                },
                Some(event) = timers.recv() => self.controller.on_timer(event),
                Some(frame) = frames.recv() => match self.muxer.demux(&frame) {
                    Ok(envelope) => self.controller.receive(envelope),
                    Err(_) => continue,
                },
            };
            self.dispatch(actions, &timer_tx);
            *self.snapshot.write().await = NodeSnapshot::capture(&self.controller);
        }

        tracing::debug!(node = %self.controller.name(), "Node task stopped");
    }

    fn handle_command(&mut self, command: Command) -> Actions {
        match command {
            Command::Start => self.controller.start_elections(),
            Command::Attach {
                channel,
                address,
                cluster,
            } => {
                let peer = channel.peer().clone();
                self.muxer.attach(channel);
                self.controller.attach_link(peer, address, cluster)
            }
            Command::Detach(peer) => {
                self.muxer.detach(&peer);
                self.controller.detach(&peer)
            }
            Command::RequestCoordinator => self.controller.request_coordinator(),
            Command::Discover(peer) => self.controller.discover(peer),
            Command::Route {
                target,
                required,
                reply,
            } => {
                let (session, actions) = self.controller.route_request(target, required);
                let _ = reply.send(session);
                actions
            }
            Command::RouteResult { session, reply } => {
                let _ = reply.send(self.controller.route_result(session).cloned());
                Actions::new()
            }
            Command::Shutdown => Actions::new(),
        }
    }

    fn dispatch(&mut self, actions: Actions, timer_tx: &mpsc::UnboundedSender<TimerEvent>) {
        for outgoing in actions.outgoing {
            if let Err(e) = self.muxer.send_frame(&outgoing.to, outgoing.bytes) {
                tracing::warn!(
                    node = %self.controller.name(),
                    peer = %outgoing.to,
                    error = %e,
                    "Failed to send frame"
                );
            }
        }
        for timer in actions.timers {
            let tx = timer_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(timer.after_ms)).await;
                let _ = tx.send(timer.event);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshot_reflects_attached_clusters() {
        let runtime = NodeRuntime::spawn(&NodeConfig::line(2)).unwrap();
        let handle = runtime.handle(&"node-0".into()).unwrap().clone();
        let mut clusters = 0;
        for _ in 0..50 {
            clusters = handle.snapshot().await.status["clusters"]
                .as_array()
                .map(|c| c.len())
                .unwrap_or(0);
            if clusters == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(clusters, 1);
        runtime.shutdown().await;
    }
}
