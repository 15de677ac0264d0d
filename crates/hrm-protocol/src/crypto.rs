use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::identity::{HierarchyLevel, NodeName};
use crate::ProtocolError;

/// Generate a new Ed25519 keypair.
pub fn generate_keypair() -> SigningKey {
    let mut rng = rand::thread_rng();
    SigningKey::generate(&mut rng)
}

/// Verify a payload signature against the verifying key.
pub fn verify_signature(
    verifying_key: &VerifyingKey,
    payload: &[u8],
    signature: &Signature,
) -> Result<(), ProtocolError> {
    verifying_key
        .verify(payload, signature)
        .map_err(|e| ProtocolError::InvalidSignature(e.to_string()))
}

/// Compute SHA-256 hash of data.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let hash = Sha256::digest(data);
    let mut result = [0u8; 32];
    result.copy_from_slice(&hash);
    result
}

/// Hex-encode bytes.
pub fn hex_encode(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Derive a stable, positive cluster id from a seed string and a level.
///
/// Every coordinator of one domain derives the same id for the cluster one
/// level up, so they meet in the same superior cluster without negotiation.
pub fn derive_cluster_id(seed: &str, level: HierarchyLevel) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(level.value().to_be_bytes());
    let hash = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&hash[..8]);
    let id = (u64::from_be_bytes(head) & i64::MAX as u64) as i64;
    id.max(1)
}

/// Signing identity of a node acting as coordinator.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    name: NodeName,
    signing_key: SigningKey,
}

impl NodeIdentity {
    /// Identity with a freshly generated key.
    pub fn generate(name: NodeName) -> Self {
        Self {
            name,
            signing_key: generate_keypair(),
        }
    }

    /// Identity with a key derived from the node name alone. Anyone who
    /// knows the name can rebuild the key, so this is for fixtures only.
    pub fn derived(name: NodeName) -> Self {
        let seed = sha256(name.as_str().as_bytes());
        Self::from_seed(name, seed)
    }

    /// Identity with a key derived from a deployment secret and the node
    /// name. Reproducible for whoever holds the secret.
    pub fn from_secret(name: NodeName, secret: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        hasher.update([0u8]);
        hasher.update(name.as_str().as_bytes());
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&hasher.finalize());
        Self::from_seed(name, seed)
    }

    pub fn from_seed(name: NodeName, seed: [u8; 32]) -> Self {
        Self {
            name,
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn name(&self) -> &NodeName {
        &self.name
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Sign as coordinator of the given level, stamped with the current time.
    pub fn sign(&self, level: HierarchyLevel) -> HrmSignature {
        self.sign_at(level, Utc::now())
    }

    pub fn sign_at(&self, level: HierarchyLevel, issued_at: DateTime<Utc>) -> HrmSignature {
        self.sign_digest(level, issued_at, String::new())
    }

    /// Sign `content` as coordinator of the given level. The signature only
    /// verifies together with the exact same content.
    pub fn sign_content(&self, level: HierarchyLevel, content: &[u8]) -> HrmSignature {
        self.sign_digest(level, Utc::now(), hex_encode(&sha256(content)))
    }

    fn sign_digest(&self, level: HierarchyLevel, issued_at: DateTime<Utc>, digest: String) -> HrmSignature {
        let payload = HrmSignature::signing_payload(&self.name, level, &issued_at, &digest);
        let signature = self.signing_key.sign(&payload);
        HrmSignature {
            signer: self.name.clone(),
            level,
            issued_at,
            digest,
            public_key: hex_encode(self.verifying_key().as_bytes()),
            signature: hex_encode(&signature.to_bytes()),
        }
    }
}

/// Signature of a coordinator, attached to announcements and FIB entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HrmSignature {
    pub signer: NodeName,
    pub level: HierarchyLevel,
    pub issued_at: DateTime<Utc>,
    /// Hex SHA-256 of the signed content, empty for bare coordinator claims.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub digest: String,
    /// Hex-encoded Ed25519 verifying key.
    pub public_key: String,
    /// Hex-encoded Ed25519 signature over the signing payload.
    pub signature: String,
}

impl HrmSignature {
    /// Canonical bytes for signing: JSON(signer + level + issued_at + digest).
    pub fn signing_payload(
        signer: &NodeName,
        level: HierarchyLevel,
        issued_at: &DateTime<Utc>,
        digest: &str,
    ) -> Vec<u8> {
        let canonical = serde_json::json!({
            "signer": signer,
            "level": level,
            "issued_at": issued_at,
            "digest": digest,
        });
        serde_json::to_vec(&canonical).unwrap_or_default()
    }

    /// Check that the signature was produced by the embedded key.
    pub fn verify(&self) -> Result<(), ProtocolError> {
        let key_bytes = hex::decode(&self.public_key)
            .map_err(|e| ProtocolError::Crypto(format!("public key: {}", e)))?;
        let key_bytes: [u8; 32] = key_bytes
            .try_into()
            .map_err(|_| ProtocolError::Crypto("public key must be 32 bytes".into()))?;
        let verifying_key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| ProtocolError::Crypto(e.to_string()))?;

        let sig_bytes = hex::decode(&self.signature)
            .map_err(|e| ProtocolError::InvalidSignature(format!("encoding: {}", e)))?;
        let signature = Signature::from_slice(&sig_bytes)
            .map_err(|e| ProtocolError::InvalidSignature(e.to_string()))?;

        let payload = Self::signing_payload(&self.signer, self.level, &self.issued_at, &self.digest);
        verify_signature(&verifying_key, &payload, &signature)
    }

    /// Check the signature and that it was made over exactly `content`.
    pub fn verify_content(&self, content: &[u8]) -> Result<(), ProtocolError> {
        self.verify()?;
        if self.digest.is_empty() {
            return Err(ProtocolError::InvalidSignature(format!(
                "signature of {} does not cover any content",
                self.signer
            )));
        }
        if self.digest != hex_encode(&sha256(content)) {
            return Err(ProtocolError::InvalidSignature(format!(
                "content does not match the digest signed by {}",
                self.signer
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_roundtrip_verifies() {
        let identity = NodeIdentity::generate("node-1".into());
        let signature = identity.sign(HierarchyLevel::BASE);
        assert!(signature.verify().is_ok());

        let json = serde_json::to_string(&signature).unwrap();
        let decoded: HrmSignature = serde_json::from_str(&json).unwrap();
        assert!(decoded.verify().is_ok());
    }

    #[test]
    fn tampered_signature_fails() {
        let identity = NodeIdentity::derived("node-1".into());
        let mut signature = identity.sign(HierarchyLevel::new(1));
        signature.level = HierarchyLevel::new(2);
        assert!(signature.verify().is_err());

        let mut garbage = identity.sign(HierarchyLevel::BASE);
        garbage.signature = "00ff".into();
        assert!(garbage.verify().is_err());
    }

    #[test]
    fn content_signature_binds_the_content() {
        let identity = NodeIdentity::generate("node-1".into());
        let signature = identity.sign_content(HierarchyLevel::BASE, b"entries: 1.0.0 via 2");
        assert!(signature.verify_content(b"entries: 1.0.0 via 2").is_ok());
        assert!(signature.verify_content(b"entries: 1.0.0 via 9").is_err());

        let mut swapped = signature.clone();
        swapped.digest = hex_encode(&sha256(b"entries: 1.0.0 via 9"));
        assert!(swapped.verify_content(b"entries: 1.0.0 via 9").is_err());

        let bare = identity.sign(HierarchyLevel::BASE);
        assert!(bare.verify().is_ok());
        assert!(bare.verify_content(b"entries: 1.0.0 via 2").is_err());
    }

    #[test]
    fn secret_identities_depend_on_the_secret() {
        let a = NodeIdentity::from_secret("node-1".into(), "alpha");
        let b = NodeIdentity::from_secret("node-1".into(), "alpha");
        let c = NodeIdentity::from_secret("node-1".into(), "beta");
        assert_eq!(a.verifying_key(), b.verifying_key());
        assert_ne!(a.verifying_key(), c.verifying_key());
        assert_ne!(a.verifying_key(), NodeIdentity::derived("node-1".into()).verifying_key());
    }

    #[test]
    fn derived_identities_are_stable() {
        let a = NodeIdentity::derived("node-1".into());
        let b = NodeIdentity::derived("node-1".into());
        assert_eq!(a.verifying_key(), b.verifying_key());
    }

    #[test]
    fn cluster_ids_are_positive_and_level_specific() {
        let l1 = derive_cluster_id("hrm", HierarchyLevel::new(1));
        let l2 = derive_cluster_id("hrm", HierarchyLevel::new(2));
        assert!(l1 > 0 && l2 > 0);
        assert_ne!(l1, l2);
        assert_eq!(l1, derive_cluster_id("hrm", HierarchyLevel::new(1)));
    }
}
