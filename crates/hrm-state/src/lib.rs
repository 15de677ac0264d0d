//! HRM State - forwarding state held by every node
//!
//! - [`RoutingTable`]: the local FIB, keyed by destination HRMID, merging
//!   coordinator pushes under a deterministic precedence rule
//! - [`ApprovedSignatures`]: coordinator signatures a node trusts; entries
//!   signed by anyone else are rejected

pub mod routing_table;
pub mod signatures;

pub use routing_table::{MergeOutcome, MergeReport, RoutingEntry, RoutingTable};
pub use signatures::ApprovedSignatures;

use thiserror::Error;

/// Errors originating from the state layer.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("Signature mismatch: {0}")]
    SignatureMismatch(String),

    #[error("Entry for {0} is write-protected")]
    WriteProtected(String),

    #[error("Invalid forwarding entry: {0}")]
    InvalidEntry(String),
}
