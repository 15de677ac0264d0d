//! Envelope multiplexing over physical channels.
//!
//! One channel per physical neighbor carries the signaling of every logical
//! cluster both nodes take part in; the envelope's sender and receiver
//! cluster identities select the cluster on either side.

use std::collections::BTreeMap;
use std::sync::Arc;

use hrm_protocol::{Envelope, NodeName};

use crate::channel::{Channel, Frame};
use crate::NetworkError;

/// Per-node table of physical channels.
#[derive(Debug)]
pub struct ChannelMuxer {
    local: NodeName,
    channels: BTreeMap<NodeName, Arc<dyn Channel>>,
    sent: u64,
    received: u64,
    malformed: u64,
}

impl ChannelMuxer {
    pub fn new(local: NodeName) -> Self {
        Self {
            local,
            channels: BTreeMap::new(),
            sent: 0,
            received: 0,
            malformed: 0,
        }
    }

    pub fn local(&self) -> &NodeName {
        &self.local
    }

    /// Attach a channel, replacing any previous channel to the same peer.
    pub fn attach(&mut self, channel: Arc<dyn Channel>) {
        let peer = channel.peer().clone();
        if let Some(old) = self.channels.insert(peer.clone(), channel) {
            old.close();
        }
        tracing::debug!(local = %self.local, peer = %peer, "Channel attached");
    }

    /// Detach and close the channel to `peer`.
    pub fn detach(&mut self, peer: &NodeName) -> bool {
        match self.channels.remove(peer) {
            Some(channel) => {
                channel.close();
                true
            }
            None => false,
        }
    }

    pub fn peers(&self) -> Vec<NodeName> {
        self.channels.keys().cloned().collect()
    }

    pub fn is_connected(&self, peer: &NodeName) -> bool {
        self.channels
            .get(peer)
            .map(|channel| channel.is_open())
            .unwrap_or(false)
    }

    /// Encode an envelope and send it to a physical neighbor.
    pub fn send(&mut self, peer: &NodeName, envelope: &Envelope) -> Result<(), NetworkError> {
        let channel = self
            .channels
            .get(peer)
            .ok_or_else(|| NetworkError::UnknownPeer(peer.to_string()))?;
        let bytes = envelope.encode()?;
        channel.send(bytes)?;
        self.sent += 1;
        tracing::trace!(
            local = %self.local,
            peer = %peer,
            method = %envelope.method(),
            message_id = envelope.message_id,
            "Envelope sent"
        );
        Ok(())
    }

    /// Send an already encoded envelope to a physical neighbor.
    pub fn send_frame(&mut self, peer: &NodeName, bytes: Vec<u8>) -> Result<(), NetworkError> {
        let channel = self
            .channels
            .get(peer)
            .ok_or_else(|| NetworkError::UnknownPeer(peer.to_string()))?;
        channel.send(bytes)?;
        self.sent += 1;
        Ok(())
    }

    /// Decode a received frame. Malformed frames are counted and returned as
    /// errors; the channel stays open.
    pub fn demux(&mut self, frame: &Frame) -> Result<Envelope, NetworkError> {
        match Envelope::decode(&frame.bytes) {
            Ok(envelope) => {
                self.received += 1;
                Ok(envelope)
            }
            Err(e) => {
                self.malformed += 1;
                tracing::warn!(
                    local = %self.local,
                    peer = %frame.from,
                    error = %e,
                    "Dropping malformed frame"
                );
                Err(e.into())
            }
        }
    }

    /// (sent, received, malformed) counters.
    pub fn stats(&self) -> (u64, u64, u64) {
        (self.sent, self.received, self.malformed)
    }
}
