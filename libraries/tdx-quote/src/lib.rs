//! Parsing and verification of TDX attestation quotes.
//!
//! A quote is the signed report a TDX guest obtains from the platform. This
//! crate handles the wire format (`quote`) and the signature chain up to a
//! configured trust anchor (`verify`). Quote generation lives behind the
//! `generate` feature; it is only needed by agent-side tooling and tests.

pub mod quote;
pub mod verify;

#[cfg(any(test, feature = "generate"))]
pub mod generate;
