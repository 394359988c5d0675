use crate::session::SessionState;
use thiserror::Error;

/// Errors raised while loading device identities or driving a license session.
#[derive(Debug, Clone, Error)]
pub enum CdmError {
    // ── Identity files ────────────────────────────────────────────────
    #[error("device identity for {level} not found at {path}")]
    IdentityMissing { level: String, path: String },
    #[error("could not read device identity: {0}")]
    IdentityRead(String),
    #[error("invalid device identity magic bytes")]
    BadMagic,
    #[error("device identity file is truncated")]
    Truncated,
    #[error("unsupported device identity version {0}")]
    UnsupportedVersion(u8),
    #[error("invalid security level byte {0}")]
    BadSecurityLevel(u8),
    #[error("device identity has an empty certificate chain")]
    EmptyCertificateChain,
    #[error("RSA key parse failed: {0}")]
    RsaKeyParse(String),

    // ── Protection headers ────────────────────────────────────────────
    #[error("malformed protection header: {0}")]
    HeaderMalformed(String),
    #[error("protection system '{0}' has no registered codec")]
    UnsupportedSystem(String),

    // ── Protocol exchange ─────────────────────────────────────────────
    #[error("message decode failed: {0}")]
    Decode(String),
    #[error("expected message type {expected}, got {got}")]
    UnexpectedMessageType { expected: i32, got: i32 },
    #[error("response nonce does not match the outstanding challenge")]
    NonceMismatch,
    #[error("response signature verification failed")]
    SignatureMismatch,
    #[error("license carried no usable content keys")]
    NoContentKeys,
    #[error("{op} is not valid in session state {state:?}")]
    InvalidState { op: &'static str, state: SessionState },

    // ── Crypto ────────────────────────────────────────────────────────
    #[error("RSA operation failed: {0}")]
    RsaOperation(String),
    #[error("expected a {expected}-byte {what}, got {got} bytes")]
    BadLength {
        what: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("AES-CBC decryption failed (bad padding or unaligned input)")]
    CbcDecrypt,
}

impl From<prost::DecodeError> for CdmError {
    fn from(e: prost::DecodeError) -> Self {
        Self::Decode(e.to_string())
    }
}

pub type CdmResult<T> = std::result::Result<T, CdmError>;
