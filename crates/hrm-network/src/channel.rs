//! Reliable, ordered byte-stream channels between physical neighbors.
//!
//! A node owns a single inbox. Every channel attached to the node writes
//! frames into that inbox tagged with the sending peer, which preserves send
//! order per channel while frames of different peers interleave freely.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use hrm_protocol::NodeName;

use crate::NetworkError;

/// A frame received from a physical neighbor.
#[derive(Debug, Clone)]
pub struct Frame {
    pub from: NodeName,
    pub bytes: Vec<u8>,
}

/// One end of a physical link.
pub trait Channel: Send + Sync + std::fmt::Debug {
    fn local(&self) -> &NodeName;

    fn peer(&self) -> &NodeName;

    /// Queue bytes for in-order delivery to the peer.
    fn send(&self, bytes: Vec<u8>) -> Result<(), NetworkError>;

    /// Close both directions of the link.
    fn close(&self);

    fn is_open(&self) -> bool;
}

/// Create a node inbox.
pub fn inbox() -> (mpsc::UnboundedSender<Frame>, mpsc::UnboundedReceiver<Frame>) {
    mpsc::unbounded_channel()
}

/// In-memory channel writing into the peer's inbox.
#[derive(Debug, Clone)]
pub struct MemoryChannel {
    local: NodeName,
    peer: NodeName,
    peer_inbox: mpsc::UnboundedSender<Frame>,
    open: Arc<AtomicBool>,
}

impl MemoryChannel {
    /// Open a link between `a` and `b`. Both ends share the open flag, so
    /// closing either end closes the link.
    pub fn pair(
        a: NodeName,
        a_inbox: mpsc::UnboundedSender<Frame>,
        b: NodeName,
        b_inbox: mpsc::UnboundedSender<Frame>,
    ) -> (MemoryChannel, MemoryChannel) {
        let open = Arc::new(AtomicBool::new(true));
        let a_end = MemoryChannel {
            local: a.clone(),
            peer: b.clone(),
            peer_inbox: b_inbox,
            open: open.clone(),
        };
        let b_end = MemoryChannel {
            local: b,
            peer: a,
            peer_inbox: a_inbox,
            open,
        };
        (a_end, b_end)
    }
}

impl Channel for MemoryChannel {
    fn local(&self) -> &NodeName {
        &self.local
    }

    fn peer(&self) -> &NodeName {
        &self.peer
    }

    fn send(&self, bytes: Vec<u8>) -> Result<(), NetworkError> {
        if !self.is_open() {
            return Err(NetworkError::ChannelClosed(self.peer.to_string()));
        }
        self.peer_inbox
            .send(Frame {
                from: self.local.clone(),
                bytes,
            })
            .map_err(|_| NetworkError::ChannelClosed(self.peer.to_string()))
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            tracing::debug!(local = %self.local, peer = %self.peer, "Channel closed");
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_arrive_in_send_order() {
        let (a_tx, _a_rx) = inbox();
        let (b_tx, mut b_rx) = inbox();
        let (a_end, _b_end) = MemoryChannel::pair("a".into(), a_tx, "b".into(), b_tx);

        for i in 0..10u8 {
            a_end.send(vec![i]).unwrap();
        }
        for i in 0..10u8 {
            let frame = b_rx.recv().await.unwrap();
            assert_eq!(frame.from, NodeName::from("a"));
            assert_eq!(frame.bytes, vec![i]);
        }
    }

    #[test]
    fn closing_one_end_closes_the_link() {
        let (a_tx, _a_rx) = inbox();
        let (b_tx, _b_rx) = inbox();
        let (a_end, b_end) = MemoryChannel::pair("a".into(), a_tx, "b".into(), b_tx);
        b_end.close();
        assert!(!a_end.is_open());
        assert!(matches!(
            a_end.send(vec![1]),
            Err(NetworkError::ChannelClosed(_))
        ));
    }
}
