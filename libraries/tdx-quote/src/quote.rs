//! TDX quote wire format.
//!
//! Quotes are little-endian binary structures: a header identifying the TEE
//! and the attestation key type, the TD report body carrying the measurement
//! registers, and a signature section holding the quote signature, the
//! attestation public key and the trust-anchor endorsement of that key.

use std::collections::BTreeMap;

use thiserror::Error;

/// Quote structure version this crate understands.
pub const QUOTE_VERSION: u16 = 4;

/// ECDSA-256 with the NIST P-256 curve.
pub const ATTESTATION_KEY_TYPE_ECDSA_P256: u16 = 2;

/// TEE type value for TDX.
pub const TEE_TYPE_TDX: u32 = 0x0000_0081;

/// Unique identifier of the Intel QE vendor.
pub const INTEL_QE_VENDOR_ID: [u8; 16] = [
    0x93, 0x9a, 0x72, 0x33, 0xf7, 0x9c, 0x4c, 0xa9, 0x94, 0x0a, 0x0d, 0xb3, 0x95, 0x7f, 0x06, 0x07,
];

pub const HEADER_SIZE: usize = 48;
pub const REPORT_BODY_SIZE: usize = 464;
/// The signed region covers the header and the report body.
pub const SIGNED_REGION_SIZE: usize = HEADER_SIZE + REPORT_BODY_SIZE;
/// Raw ECDSA signature (r||s), attestation key (x||y) and key endorsement (r||s).
pub const SIGNATURE_DATA_LEN: u32 = 192;
/// Total size of a well-formed quote.
pub const QUOTE_SIZE: usize = SIGNED_REGION_SIZE + 4 + SIGNATURE_DATA_LEN as usize;

/// List of ways a byte sequence can fail to be a well-formed TDX quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("quote is {0} bytes, expected {QUOTE_SIZE}")]
    WrongLength(usize),
    #[error("unsupported quote version {0}")]
    UnsupportedVersion(u16),
    #[error("unsupported attestation key type {0}")]
    UnsupportedKeyType(u16),
    #[error("not a TDX quote (tee_type {0:#010x})")]
    NotTdx(u32),
    #[error("unknown QE vendor id")]
    UnknownQeVendor,
    #[error("signature data is {0} bytes, expected {SIGNATURE_DATA_LEN}")]
    BadSignatureLength(u32),
}

#[derive(Debug, Clone)]
pub struct QuoteHeader {
    pub version: u16,
    pub attestation_key_type: u16,
    pub tee_type: u32,
    pub qe_vendor_id: [u8; 16],
    pub user_data: [u8; 20],
}

/// The TD report body: the measurement registers of the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TdReportBody {
    /// TCB security version numbers of the platform firmware.
    pub tcb_svn: [u8; 16],
    /// Measurement of the TDX module.
    pub mr_seam: [u8; 48],
    /// Measurement of the initial TD contents.
    pub mr_td: [u8; 48],
    pub mr_config_id: [u8; 48],
    pub mr_owner: [u8; 48],
    /// Runtime-extendable measurement registers.
    pub rtmr0: [u8; 48],
    pub rtmr1: [u8; 48],
    pub rtmr2: [u8; 48],
    pub rtmr3: [u8; 48],
    /// Custom data bound into the quote by the guest.
    pub report_data: [u8; 64],
}

impl Default for TdReportBody {
    fn default() -> Self {
        TdReportBody {
            tcb_svn: [0; 16],
            mr_seam: [0; 48],
            mr_td: [0; 48],
            mr_config_id: [0; 48],
            mr_owner: [0; 48],
            rtmr0: [0; 48],
            rtmr1: [0; 48],
            rtmr2: [0; 48],
            rtmr3: [0; 48],
            report_data: [0; 64],
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignatureData {
    /// ECDSA-P256 signature (raw r||s) over the signed region, made with the
    /// attestation key.
    pub quote_signature: [u8; 64],
    /// The attestation public key as raw affine coordinates (x||y).
    pub attestation_key: [u8; 64],
    /// ECDSA-P256 signature (raw r||s) over `attestation_key`, made by a
    /// trust-anchor key.
    pub key_endorsement: [u8; 64],
}

#[derive(Debug, Clone)]
pub struct Quote {
    pub header: QuoteHeader,
    pub report_body: TdReportBody,
    pub signature: SignatureData,
    raw: Vec<u8>,
}

/// Copies a fixed-size field out of `input` at `offset`.
///
/// The caller must have checked that `input` is long enough.
fn take<const N: usize>(input: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&input[offset..offset + N]);
    out
}

impl QuoteHeader {
    fn from_bytes(input: &[u8]) -> Result<Self, ParseError> {
        let header = QuoteHeader {
            version: u16::from_le_bytes(take::<2>(input, 0)),
            attestation_key_type: u16::from_le_bytes(take::<2>(input, 2)),
            tee_type: u32::from_le_bytes(take::<4>(input, 4)),
            qe_vendor_id: take::<16>(input, 12),
            user_data: take::<20>(input, 28),
        };
        if header.version != QUOTE_VERSION {
            return Err(ParseError::UnsupportedVersion(header.version));
        }
        if header.attestation_key_type != ATTESTATION_KEY_TYPE_ECDSA_P256 {
            return Err(ParseError::UnsupportedKeyType(header.attestation_key_type));
        }
        if header.tee_type != TEE_TYPE_TDX {
            return Err(ParseError::NotTdx(header.tee_type));
        }
        if header.qe_vendor_id != INTEL_QE_VENDOR_ID {
            return Err(ParseError::UnknownQeVendor);
        }
        Ok(header)
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..2].copy_from_slice(&self.version.to_le_bytes());
        out[2..4].copy_from_slice(&self.attestation_key_type.to_le_bytes());
        out[4..8].copy_from_slice(&self.tee_type.to_le_bytes());
        // 8..12 reserved
        out[12..28].copy_from_slice(&self.qe_vendor_id);
        out[28..48].copy_from_slice(&self.user_data);
        out
    }
}

impl TdReportBody {
    fn from_bytes(input: &[u8]) -> Self {
        TdReportBody {
            tcb_svn: take::<16>(input, 0),
            mr_seam: take::<48>(input, 16),
            mr_td: take::<48>(input, 64),
            mr_config_id: take::<48>(input, 112),
            mr_owner: take::<48>(input, 160),
            rtmr0: take::<48>(input, 208),
            rtmr1: take::<48>(input, 256),
            rtmr2: take::<48>(input, 304),
            rtmr3: take::<48>(input, 352),
            report_data: take::<64>(input, 400),
        }
    }

    pub fn to_bytes(&self) -> [u8; REPORT_BODY_SIZE] {
        let mut out = [0u8; REPORT_BODY_SIZE];
        out[0..16].copy_from_slice(&self.tcb_svn);
        out[16..64].copy_from_slice(&self.mr_seam);
        out[64..112].copy_from_slice(&self.mr_td);
        out[112..160].copy_from_slice(&self.mr_config_id);
        out[160..208].copy_from_slice(&self.mr_owner);
        out[208..256].copy_from_slice(&self.rtmr0);
        out[256..304].copy_from_slice(&self.rtmr1);
        out[304..352].copy_from_slice(&self.rtmr2);
        out[352..400].copy_from_slice(&self.rtmr3);
        out[400..464].copy_from_slice(&self.report_data);
        out
    }
}

impl Quote {
    /// Parses a byte sequence as a TDX quote.
    ///
    /// Parsing is strict: a wrong total length, a wrong magic value or a
    /// wrong signature-section length are all rejected.
    pub fn parse(input: &[u8]) -> Result<Quote, ParseError> {
        if input.len() != QUOTE_SIZE {
            return Err(ParseError::WrongLength(input.len()));
        }
        let header = QuoteHeader::from_bytes(&input[..HEADER_SIZE])?;
        let report_body = TdReportBody::from_bytes(&input[HEADER_SIZE..SIGNED_REGION_SIZE]);

        let sig_len = u32::from_le_bytes(take::<4>(input, SIGNED_REGION_SIZE));
        if sig_len != SIGNATURE_DATA_LEN {
            return Err(ParseError::BadSignatureLength(sig_len));
        }
        let sig_offset = SIGNED_REGION_SIZE + 4;
        let signature = SignatureData {
            quote_signature: take::<64>(input, sig_offset),
            attestation_key: take::<64>(input, sig_offset + 64),
            key_endorsement: take::<64>(input, sig_offset + 128),
        };

        Ok(Quote {
            header,
            report_body,
            signature,
            raw: input.to_vec(),
        })
    }

    /// The bytes covered by the quote signature (header + report body).
    pub fn signed_region(&self) -> &[u8] {
        &self.raw[..SIGNED_REGION_SIZE]
    }

    /// Named measurement registers as lowercase hex digests.
    pub fn measurements(&self) -> BTreeMap<String, String> {
        let body = &self.report_body;
        [
            ("mr_seam", &body.mr_seam),
            ("mr_td", &body.mr_td),
            ("mr_config_id", &body.mr_config_id),
            ("mr_owner", &body.mr_owner),
            ("rtmr0", &body.rtmr0),
            ("rtmr1", &body.rtmr1),
            ("rtmr2", &body.rtmr2),
            ("rtmr3", &body.rtmr3),
        ]
        .into_iter()
        .map(|(name, digest)| (name.to_string(), hex::encode(digest)))
        .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::generate::QuoteSigner;

    fn test_signer() -> QuoteSigner {
        QuoteSigner::from_seeds([1u8; 32], [2u8; 32]).unwrap()
    }

    fn sample_body() -> TdReportBody {
        TdReportBody {
            mr_td: [0xaa; 48],
            rtmr1: [0xbb; 48],
            tcb_svn: [3; 16],
            ..TdReportBody::default()
        }
    }

    #[test]
    fn parse_roundtrip() {
        let bytes = test_signer().sign(&sample_body(), [7u8; 20]);
        let quote = Quote::parse(&bytes).unwrap();
        assert_eq!(quote.header.version, QUOTE_VERSION);
        assert_eq!(quote.header.tee_type, TEE_TYPE_TDX);
        assert_eq!(quote.header.user_data, [7u8; 20]);
        assert_eq!(quote.report_body, sample_body());
    }

    #[test]
    fn parse_rejects_wrong_length() {
        assert!(matches!(
            Quote::parse(&[]),
            Err(ParseError::WrongLength(0))
        ));
        let mut bytes = test_signer().sign(&sample_body(), [0u8; 20]);
        bytes.push(0);
        assert!(matches!(
            Quote::parse(&bytes),
            Err(ParseError::WrongLength(len)) if len == QUOTE_SIZE + 1
        ));
    }

    #[test]
    fn parse_rejects_bad_magic_values() {
        let good = test_signer().sign(&sample_body(), [0u8; 20]);

        let mut bad_version = good.clone();
        bad_version[0] = 3;
        assert!(matches!(
            Quote::parse(&bad_version),
            Err(ParseError::UnsupportedVersion(3))
        ));

        let mut bad_tee = good.clone();
        bad_tee[4] = 0;
        assert!(matches!(Quote::parse(&bad_tee), Err(ParseError::NotTdx(0))));

        let mut bad_vendor = good.clone();
        bad_vendor[12] ^= 0xff;
        assert!(matches!(
            Quote::parse(&bad_vendor),
            Err(ParseError::UnknownQeVendor)
        ));

        let mut bad_sig_len = good;
        bad_sig_len[SIGNED_REGION_SIZE] = 0;
        assert!(matches!(
            Quote::parse(&bad_sig_len),
            Err(ParseError::BadSignatureLength(_))
        ));
    }

    #[test]
    fn measurements_are_named_hex_digests() {
        let bytes = test_signer().sign(&sample_body(), [0u8; 20]);
        let quote = Quote::parse(&bytes).unwrap();
        let measurements = quote.measurements();
        assert_eq!(measurements["mr_td"], hex::encode([0xaa; 48]));
        assert_eq!(measurements["rtmr1"], hex::encode([0xbb; 48]));
        assert_eq!(measurements.len(), 8);
    }
}
