//! Error types for certificate authority operations.
//!
//! Errors fall into two groups:
//! - Startup errors (root material cannot be loaded or is unusable)
//! - Issuance errors (a single leaf certificate could not be minted)
//!
//! Issuance errors are scoped to the connection that triggered them.

use thiserror::Error;

/// Errors related to loading the root CA and issuing leaf certificates.
#[derive(Debug, Error)]
pub enum CaError {
    /// The root private key PEM could not be parsed.
    #[error("Failed to parse CA private key: {0}")]
    KeyParse(String),

    /// The root certificate PEM could not be parsed.
    #[error("Failed to parse CA certificate: {0}")]
    CertParse(String),

    /// The root key uses an algorithm other than Ed25519.
    #[error("CA private key must be Ed25519, found {0}")]
    UnsupportedKeyAlgorithm(String),

    /// The root key does not belong to the root certificate.
    #[error("CA private key does not match the CA certificate public key")]
    KeyMismatch,

    /// A mandatory subject field is empty.
    #[error("CA subject field '{0}' must not be empty")]
    EmptySubjectField(&'static str),

    /// Failed to generate the leaf key pair.
    #[error("Failed to generate key pair: {0}")]
    KeyGeneration(String),

    /// The requested name cannot be encoded as a DNS subject alternative name.
    #[error("Invalid hostname '{hostname}': {message}")]
    InvalidHostname {
        /// The hostname taken from the handshake.
        hostname: String,
        /// Why it was rejected.
        message: String,
    },

    /// Failed to sign the leaf certificate with the root key.
    #[error("Failed to sign certificate: {0}")]
    Signing(String),
}

impl CaError {
    /// Whether this error can only happen while loading root material.
    pub fn is_startup(&self) -> bool {
        matches!(
            self,
            CaError::KeyParse(_)
                | CaError::CertParse(_)
                | CaError::UnsupportedKeyAlgorithm(_)
                | CaError::KeyMismatch
                | CaError::EmptySubjectField(_)
        )
    }
}
