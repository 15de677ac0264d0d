use std::collections::{BTreeMap, BTreeSet};

use hrm_protocol::{HrmSignature, NodeName};

use crate::StateError;

/// Coordinator signatures accepted by this node, as signer -> public keys.
///
/// A signature is approved once the node accepts the signer as coordinator
/// of one of its clusters, or when an already approved coordinator passes it
/// down inside TopologyData.
#[derive(Debug, Clone, Default)]
pub struct ApprovedSignatures {
    approved: BTreeMap<NodeName, BTreeSet<String>>,
}

impl ApprovedSignatures {
    pub fn new() -> Self {
        Self::default()
    }

    /// Approve the signer's key. The signature itself must verify.
    pub fn approve(&mut self, signature: &HrmSignature) -> Result<bool, StateError> {
        signature
            .verify()
            .map_err(|e| StateError::SignatureMismatch(format!("{}: {}", signature.signer, e)))?;
        let inserted = self
            .approved
            .entry(signature.signer.clone())
            .or_default()
            .insert(signature.public_key.clone());
        if inserted {
            tracing::debug!(signer = %signature.signer, level = %signature.level, "Signature approved");
        }
        Ok(inserted)
    }

    pub fn is_approved(&self, signature: &HrmSignature) -> bool {
        self.approved
            .get(&signature.signer)
            .map(|keys| keys.contains(&signature.public_key))
            .unwrap_or(false)
    }

    /// Verify the signature and check that its signer is trusted.
    pub fn validate(&self, signature: &HrmSignature) -> Result<(), StateError> {
        signature
            .verify()
            .map_err(|e| StateError::SignatureMismatch(format!("{}: {}", signature.signer, e)))?;
        if !self.is_approved(signature) {
            return Err(StateError::SignatureMismatch(format!(
                "{} is not an approved coordinator",
                signature.signer
            )));
        }
        Ok(())
    }

    pub fn revoke(&mut self, signer: &NodeName) -> bool {
        self.approved.remove(signer).is_some()
    }

    pub fn len(&self) -> usize {
        self.approved.values().map(|keys| keys.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.approved.is_empty()
    }
}
