//! HRM Network - transport collaborators for the signaling layer
//!
//! The hierarchy core never touches sockets. It consumes two narrow
//! interfaces defined here:
//! - a reliable, ordered byte-stream [`Channel`] per physical link, over
//!   which the [`ChannelMuxer`] multiplexes envelopes of many clusters
//! - a [`NameService`] mapping coordinator names to transport addresses and
//!   recording routes learned from routing vectors
//!
//! It also ships the in-memory implementations used by the node runtime and
//! a deterministic link fabric for simulations.

pub mod channel;
pub mod mux;
pub mod naming;
pub mod sim;

pub use channel::{Channel, Frame, MemoryChannel};
pub use mux::ChannelMuxer;
pub use naming::{MemoryNameService, NameService};
pub use sim::{Delivery, SimulatedLinks};

use thiserror::Error;

/// Errors originating from the network layer.
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Channel to {0} is closed")]
    ChannelClosed(String),

    #[error("No channel to peer: {0}")]
    UnknownPeer(String),

    #[error("Internal channel closed")]
    InboxClosed,

    #[error("Protocol error: {0}")]
    Protocol(#[from] hrm_protocol::ProtocolError),
}
