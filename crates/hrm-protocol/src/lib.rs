//! HRM - Core types and message definitions
//!
//! Implements the value types shared by every layer of the Hierarchical
//! Routing Management subsystem: hierarchy levels, Bully priorities, cluster
//! identities, hierarchical addresses, forwarding entries and the signaling
//! message catalogue carried inside the multiplexing envelope.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod messages;
pub mod types;

pub use constants::*;
pub use crypto::{HrmSignature, NodeIdentity};
pub use error::*;
pub use identity::*;
pub use messages::*;
pub use types::*;
