//! Verify the quote signature chain against configured trust anchors.

use anyhow::{anyhow, bail, ensure, Context as _};
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};

use crate::quote::Quote;

/// A trust-anchor key that endorses attestation keys.
///
/// This is the root the signature chain of a quote must validate up to.
#[derive(Debug, Clone)]
pub struct TrustAnchor(VerifyingKey);

impl TrustAnchor {
    /// Creates a `TrustAnchor` from a hex-encoded SEC1 P-256 public key,
    /// the shape trust roots are carried in policy files.
    pub fn from_hex(hex_point: &str) -> anyhow::Result<TrustAnchor> {
        let bytes = hex::decode(hex_point).context("Trust anchor is not valid hex")?;
        let key = VerifyingKey::from_sec1_bytes(&bytes)
            .map_err(|_| anyhow!("Trust anchor is not a valid SEC1 P-256 public key"))?;
        Ok(TrustAnchor(key))
    }

    fn endorses(&self, attestation_key: &[u8; 64], endorsement: &Signature) -> bool {
        self.0.verify(attestation_key, endorsement).is_ok()
    }
}

/// Reconstructs a P-256 verifying key from raw affine coordinates (x||y).
fn attestation_key_from_raw(raw: &[u8; 64]) -> anyhow::Result<VerifyingKey> {
    let point = p256::EncodedPoint::from_affine_coordinates(
        p256::FieldBytes::from_slice(&raw[..32]),
        p256::FieldBytes::from_slice(&raw[32..]),
        false,
    );
    VerifyingKey::from_encoded_point(&point)
        .map_err(|_| anyhow!("Attestation key is not a valid P-256 point"))
}

/// Verifies the signature chain of a quote.
///
/// The key endorsement must validate under one of the configured trust
/// anchors, and the quote signature must validate under the endorsed
/// attestation key over the signed region (header + report body).
///
/// # Errors
/// Returns an error if no anchors are configured, if the embedded signatures
/// or key are malformed, or if either link of the chain does not verify.
pub fn verify_signature_chain(quote: &Quote, anchors: &[TrustAnchor]) -> anyhow::Result<()> {
    ensure!(!anchors.is_empty(), "No trust anchors configured");

    let endorsement = Signature::from_slice(&quote.signature.key_endorsement)
        .map_err(|_| anyhow!("Key endorsement is not a valid ECDSA signature"))?;
    if !anchors
        .iter()
        .any(|anchor| anchor.endorses(&quote.signature.attestation_key, &endorsement))
    {
        bail!("Attestation key is not endorsed by any configured trust anchor");
    }

    let attestation_key = attestation_key_from_raw(&quote.signature.attestation_key)?;
    let quote_signature = Signature::from_slice(&quote.signature.quote_signature)
        .map_err(|_| anyhow!("Quote signature is not a valid ECDSA signature"))?;
    attestation_key
        .verify(quote.signed_region(), &quote_signature)
        .context("Quote signature does not verify under the endorsed attestation key")?;

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::generate::QuoteSigner;
    use crate::quote::TdReportBody;

    fn signer() -> QuoteSigner {
        QuoteSigner::from_seeds([1u8; 32], [2u8; 32]).unwrap()
    }

    fn anchor() -> TrustAnchor {
        TrustAnchor::from_hex(&signer().anchor_public_key_hex()).unwrap()
    }

    #[test]
    fn valid_chain_verifies() {
        let bytes = signer().sign(&TdReportBody::default(), [0u8; 20]);
        let quote = Quote::parse(&bytes).unwrap();
        verify_signature_chain(&quote, &[anchor()]).unwrap();
    }

    #[test]
    fn chain_fails_without_anchors() {
        let bytes = signer().sign(&TdReportBody::default(), [0u8; 20]);
        let quote = Quote::parse(&bytes).unwrap();
        assert!(verify_signature_chain(&quote, &[]).is_err());
    }

    #[test]
    fn chain_fails_under_a_different_anchor() {
        let bytes = signer().sign(&TdReportBody::default(), [0u8; 20]);
        let quote = Quote::parse(&bytes).unwrap();
        let other = QuoteSigner::from_seeds([1u8; 32], [9u8; 32]).unwrap();
        let wrong_anchor = TrustAnchor::from_hex(&other.anchor_public_key_hex()).unwrap();
        assert!(verify_signature_chain(&quote, &[wrong_anchor]).is_err());
    }

    #[test]
    fn chain_fails_on_tampered_report_body() {
        let mut bytes = signer().sign(&TdReportBody::default(), [0u8; 20]);
        // Flip one byte inside mr_td
        bytes[crate::quote::HEADER_SIZE + 70] ^= 0x01;
        let quote = Quote::parse(&bytes).unwrap();
        assert!(verify_signature_chain(&quote, &[anchor()]).is_err());
    }

    #[test]
    fn chain_fails_on_swapped_attestation_key() {
        let mut bytes = signer().sign(&TdReportBody::default(), [0u8; 20]);
        // Replace the attestation key with another valid key; the anchor
        // endorsement no longer covers it.
        let other = QuoteSigner::from_seeds([5u8; 32], [2u8; 32]).unwrap();
        let other_bytes = other.sign(&TdReportBody::default(), [0u8; 20]);
        let key_offset = crate::quote::SIGNED_REGION_SIZE + 4 + 64;
        bytes[key_offset..key_offset + 64]
            .copy_from_slice(&other_bytes[key_offset..key_offset + 64]);
        let quote = Quote::parse(&bytes).unwrap();
        assert!(verify_signature_chain(&quote, &[anchor()]).is_err());
    }

    #[test]
    fn anchor_from_bad_hex_is_rejected() {
        assert!(TrustAnchor::from_hex("not hex").is_err());
        assert!(TrustAnchor::from_hex("00ff").is_err());
    }
}
