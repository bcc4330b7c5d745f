//! Build and sign well-formed quotes.
//!
//! This side only runs where the signing keys live: agent-side tooling and
//! tests. A real deployment gets quotes from the TDX hardware device.

use anyhow::{anyhow, Context as _};
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};

use crate::quote::{
    QuoteHeader, TdReportBody, ATTESTATION_KEY_TYPE_ECDSA_P256, INTEL_QE_VENDOR_ID, QUOTE_SIZE,
    QUOTE_VERSION, SIGNATURE_DATA_LEN, TEE_TYPE_TDX,
};

/// Holds the attestation key and the trust-anchor key used to produce a
/// complete signature chain.
pub struct QuoteSigner {
    attestation_key: SigningKey,
    anchor_key: SigningKey,
}

/// Raw affine coordinates (x||y) of a signing key's public half.
fn raw_public_key(key: &SigningKey) -> [u8; 64] {
    let point = key.verifying_key().to_encoded_point(false);
    let mut out = [0u8; 64];
    // Skip the 0x04 uncompressed-point tag
    out.copy_from_slice(&point.as_bytes()[1..65]);
    out
}

fn raw_signature(signature: &Signature) -> [u8; 64] {
    let mut out = [0u8; 64];
    out.copy_from_slice(&signature.to_bytes());
    out
}

impl QuoteSigner {
    pub fn new(attestation_key: SigningKey, anchor_key: SigningKey) -> QuoteSigner {
        QuoteSigner {
            attestation_key,
            anchor_key,
        }
    }

    /// Creates a signer from fixed 32-byte scalar seeds. Deterministic, which
    /// is what tests want.
    pub fn from_seeds(attestation_seed: [u8; 32], anchor_seed: [u8; 32]) -> anyhow::Result<Self> {
        let attestation_key = SigningKey::from_slice(&attestation_seed)
            .map_err(|_| anyhow!("Attestation seed is not a valid P-256 scalar"))
            .context("Failed to build the attestation signing key")?;
        let anchor_key = SigningKey::from_slice(&anchor_seed)
            .map_err(|_| anyhow!("Anchor seed is not a valid P-256 scalar"))
            .context("Failed to build the trust-anchor signing key")?;
        Ok(QuoteSigner::new(attestation_key, anchor_key))
    }

    /// Hex-encoded SEC1 public key of the anchor, the form policy files use
    /// for `trustedRoots`.
    pub fn anchor_public_key_hex(&self) -> String {
        hex::encode(
            self.anchor_key
                .verifying_key()
                .to_encoded_point(false)
                .as_bytes(),
        )
    }

    /// Builds a complete quote over `body` and signs it.
    pub fn sign(&self, body: &TdReportBody, user_data: [u8; 20]) -> Vec<u8> {
        let header = QuoteHeader {
            version: QUOTE_VERSION,
            attestation_key_type: ATTESTATION_KEY_TYPE_ECDSA_P256,
            tee_type: TEE_TYPE_TDX,
            qe_vendor_id: INTEL_QE_VENDOR_ID,
            user_data,
        };

        let mut out = Vec::with_capacity(QUOTE_SIZE);
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&body.to_bytes());

        let quote_signature: Signature = self.attestation_key.sign(&out);
        let attestation_key = raw_public_key(&self.attestation_key);
        let key_endorsement: Signature = self.anchor_key.sign(&attestation_key);

        out.extend_from_slice(&SIGNATURE_DATA_LEN.to_le_bytes());
        out.extend_from_slice(&raw_signature(&quote_signature));
        out.extend_from_slice(&attestation_key);
        out.extend_from_slice(&raw_signature(&key_endorsement));
        out
    }
}
