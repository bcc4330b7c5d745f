//! Quote verification against the configured platform policy.
//!
//! The verifier is pure: it never stores anything and the clock is passed in,
//! so the same quote under the same policy always yields the same verdict
//! (timestamps aside). Trust failures are data (the verdict's `reason`), not
//! errors; only a broken policy file fails construction.

use std::collections::BTreeMap;

use anyhow::Context as _;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use tdx_quote::quote::Quote;
use tdx_quote::verify::{verify_signature_chain, TrustAnchor};

use crate::policy::VerifierPolicy;

/// Why a verdict came out unverified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum VerdictReason {
    #[error("the quote does not parse as a TDX quote")]
    MalformedQuote,
    #[error("the signature chain does not validate to a trusted root")]
    UntrustedSignature,
    #[error("a measurement digest does not match the allow-list")]
    MeasurementMismatch,
    #[error("verification did not complete in time")]
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformInfo {
    pub cpu: String,
    pub firmware_version: String,
}

/// The outcome of verifying one quote for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub agent_id: String,
    pub verified: bool,
    pub measurements: BTreeMap<String, String>,
    pub platform: Option<PlatformInfo>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<VerdictReason>,
    /// The register that failed, when `reason` is `MeasurementMismatch`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mismatched_field: Option<String>,
}

impl Verdict {
    /// An unverified verdict with no extracted quote contents. Expires
    /// immediately.
    pub fn unverified(agent_id: &str, now: DateTime<Utc>, reason: VerdictReason) -> Verdict {
        Verdict {
            agent_id: agent_id.to_string(),
            verified: false,
            measurements: BTreeMap::new(),
            platform: None,
            issued_at: now,
            expires_at: now,
            reason: Some(reason),
            mismatched_field: None,
        }
    }
}

pub struct AttestationVerifier {
    anchors: Vec<TrustAnchor>,
    /// Allowed digests per register, lowercase hex.
    allow_list: BTreeMap<String, Vec<String>>,
    max_age: Duration,
    min_tcb_svn: Option<[u8; 16]>,
}

impl AttestationVerifier {
    pub fn new(policy: &VerifierPolicy) -> anyhow::Result<AttestationVerifier> {
        let anchors = policy
            .trusted_roots
            .iter()
            .map(|root| TrustAnchor::from_hex(root))
            .collect::<anyhow::Result<Vec<_>>>()
            .context("Failed parsing the trusted roots from the policy")?;

        let allow_list = policy
            .measurement_allow_list
            .iter()
            .map(|(name, digests)| {
                let digests = digests.iter().map(|d| d.to_lowercase()).collect();
                (name.clone(), digests)
            })
            .collect();

        let min_tcb_svn = match &policy.min_tcb_svn {
            Some(hex_svn) => {
                let bytes = hex::decode(hex_svn).context("minTcbSvn is not valid hex")?;
                let svn: [u8; 16] = bytes
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("minTcbSvn must be 16 bytes"))?;
                Some(svn)
            }
            None => None,
        };

        let max_age_secs = i64::try_from(policy.max_age_secs)
            .context("maxAgeSecs does not fit a signed duration")?;
        let max_age =
            Duration::try_seconds(max_age_secs).context("maxAgeSecs is out of range")?;

        Ok(AttestationVerifier {
            anchors,
            allow_list,
            max_age,
            min_tcb_svn,
        })
    }

    /// Verifies a raw quote for `agent_id` and renders the outcome as a
    /// verdict. `now` becomes the verdict's `issued_at`.
    pub fn verify(&self, agent_id: &str, quote_bytes: &[u8], now: DateTime<Utc>) -> Verdict {
        let quote = match Quote::parse(quote_bytes) {
            Ok(quote) => quote,
            Err(err) => {
                info!("Rejecting quote for {agent_id}: {err}");
                return Verdict::unverified(agent_id, now, VerdictReason::MalformedQuote);
            }
        };

        let measurements = quote.measurements();
        let platform = PlatformInfo {
            cpu: "intel-tdx".to_string(),
            firmware_version: hex::encode(quote.report_body.tcb_svn),
        };

        if let Err(err) = verify_signature_chain(&quote, &self.anchors) {
            info!("Rejecting quote for {agent_id}: {err:#}");
            return Verdict {
                measurements,
                platform: Some(platform),
                ..Verdict::unverified(agent_id, now, VerdictReason::UntrustedSignature)
            };
        }

        for (name, allowed) in &self.allow_list {
            let matched = measurements
                .get(name)
                .is_some_and(|actual| allowed.iter().any(|digest| digest == actual));
            if !matched {
                info!("Rejecting quote for {agent_id}: measurement {name} does not match the allow-list");
                return Verdict {
                    measurements,
                    platform: Some(platform),
                    mismatched_field: Some(name.clone()),
                    ..Verdict::unverified(agent_id, now, VerdictReason::MeasurementMismatch)
                };
            }
        }

        if let Some(floor) = &self.min_tcb_svn {
            let below_floor = quote
                .report_body
                .tcb_svn
                .iter()
                .zip(floor)
                .any(|(actual, min)| actual < min);
            if below_floor {
                info!("Rejecting quote for {agent_id}: TCB SVN below the policy floor");
                return Verdict {
                    measurements,
                    platform: Some(platform),
                    mismatched_field: Some("tcb_svn".to_string()),
                    ..Verdict::unverified(agent_id, now, VerdictReason::MeasurementMismatch)
                };
            }
        }

        debug!("Quote for {agent_id} verified");
        Verdict {
            agent_id: agent_id.to_string(),
            verified: true,
            measurements,
            platform: Some(platform),
            issued_at: now,
            expires_at: now + self.max_age,
            reason: None,
            mismatched_field: None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::BTreeMap;
    use tdx_quote::generate::QuoteSigner;
    use tdx_quote::quote::TdReportBody;

    pub(crate) fn init_logger_tests() {
        let _ = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or("info"),
        )
        .try_init();
    }

    fn signer() -> QuoteSigner {
        QuoteSigner::from_seeds([1u8; 32], [2u8; 32]).unwrap()
    }

    fn sample_body() -> TdReportBody {
        TdReportBody {
            mr_td: [0xaa; 48],
            tcb_svn: [3; 16],
            ..TdReportBody::default()
        }
    }

    fn sample_policy() -> VerifierPolicy {
        VerifierPolicy {
            trusted_roots: vec![signer().anchor_public_key_hex()],
            measurement_allow_list: BTreeMap::from([(
                "mr_td".to_string(),
                vec![hex::encode([0xaa; 48])],
            )]),
            max_age_secs: 300,
            min_tcb_svn: None,
        }
    }

    #[test]
    fn well_formed_quote_verifies() {
        init_logger_tests();
        let verifier = AttestationVerifier::new(&sample_policy()).unwrap();
        let quote = signer().sign(&sample_body(), [0u8; 20]);
        let now = Utc::now();

        let verdict = verifier.verify("cube-agent-01", &quote, now);
        assert!(verdict.verified);
        assert_eq!(verdict.reason, None);
        assert_eq!(verdict.issued_at, now);
        assert_eq!(verdict.expires_at, now + Duration::seconds(300));
        let platform = verdict.platform.unwrap();
        assert_eq!(platform.cpu, "intel-tdx");
        assert_eq!(platform.firmware_version, hex::encode([3u8; 16]));
    }

    #[test]
    fn garbage_is_malformed_quote() {
        let verifier = AttestationVerifier::new(&sample_policy()).unwrap();
        let verdict = verifier.verify("cube-agent-01", b"not a quote", Utc::now());
        assert!(!verdict.verified);
        assert_eq!(verdict.reason, Some(VerdictReason::MalformedQuote));
    }

    #[test]
    fn unknown_anchor_is_untrusted_signature() {
        let mut policy = sample_policy();
        let other = QuoteSigner::from_seeds([1u8; 32], [9u8; 32]).unwrap();
        policy.trusted_roots = vec![other.anchor_public_key_hex()];
        let verifier = AttestationVerifier::new(&policy).unwrap();

        let quote = signer().sign(&sample_body(), [0u8; 20]);
        let verdict = verifier.verify("cube-agent-01", &quote, Utc::now());
        assert!(!verdict.verified);
        assert_eq!(verdict.reason, Some(VerdictReason::UntrustedSignature));
        // Quote contents are still extracted for diagnostics
        assert!(!verdict.measurements.is_empty());
    }

    #[test]
    fn measurement_mismatch_names_the_field() {
        let mut policy = sample_policy();
        policy
            .measurement_allow_list
            .insert("rtmr0".to_string(), vec![hex::encode([0xcc; 48])]);
        let verifier = AttestationVerifier::new(&policy).unwrap();

        let quote = signer().sign(&sample_body(), [0u8; 20]);
        let verdict = verifier.verify("cube-agent-01", &quote, Utc::now());
        assert!(!verdict.verified);
        assert_eq!(verdict.reason, Some(VerdictReason::MeasurementMismatch));
        assert_eq!(verdict.mismatched_field.as_deref(), Some("rtmr0"));
    }

    #[test]
    fn tcb_below_floor_is_a_mismatch_on_tcb_svn() {
        let mut policy = sample_policy();
        policy.min_tcb_svn = Some(hex::encode([4u8; 16]));
        let verifier = AttestationVerifier::new(&policy).unwrap();

        let quote = signer().sign(&sample_body(), [0u8; 20]);
        let verdict = verifier.verify("cube-agent-01", &quote, Utc::now());
        assert!(!verdict.verified);
        assert_eq!(verdict.reason, Some(VerdictReason::MeasurementMismatch));
        assert_eq!(verdict.mismatched_field.as_deref(), Some("tcb_svn"));
    }

    #[test]
    fn tcb_at_floor_passes() {
        let mut policy = sample_policy();
        policy.min_tcb_svn = Some(hex::encode([3u8; 16]));
        let verifier = AttestationVerifier::new(&policy).unwrap();

        let quote = signer().sign(&sample_body(), [0u8; 20]);
        assert!(verifier.verify("cube-agent-01", &quote, Utc::now()).verified);
    }

    #[test]
    fn oversized_max_age_fails_construction() {
        let mut policy = sample_policy();
        // Wraps negative as i64
        policy.max_age_secs = u64::MAX;
        assert!(AttestationVerifier::new(&policy).is_err());
        // Fits i64 but exceeds what a chrono duration can hold
        policy.max_age_secs = i64::MAX as u64;
        assert!(AttestationVerifier::new(&policy).is_err());
    }

    #[test]
    fn verification_is_deterministic() {
        let verifier = AttestationVerifier::new(&sample_policy()).unwrap();
        let quote = signer().sign(&sample_body(), [0u8; 20]);
        let now = Utc::now();
        let first = verifier.verify("cube-agent-01", &quote, now);
        let second = verifier.verify("cube-agent-01", &quote, now);
        assert_eq!(first.verified, second.verified);
        assert_eq!(first.measurements, second.measurements);
        assert_eq!(first.expires_at, second.expires_at);
    }
}
