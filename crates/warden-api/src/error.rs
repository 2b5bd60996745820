//! Discovery API error taxonomy and envelope mapping.

use thiserror::Error;
use warden_proto::{ServiceKind, codes};
use warden_signer::SignerError;
use warden_store::StoreError;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    // Policy errors — reported to the caller, never retried.
    #[error("admin token must be at least {min} characters")]
    AdminTokenTooShort { min: usize },

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid value for {field}: {reason}")]
    InvalidFieldValue { field: &'static str, reason: String },

    // Crypto errors — rotation only.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("signature verification failed")]
    InvalidSignature,

    // State errors.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate endpoint: {0}")]
    Duplicate(String),

    #[error("endpoint {0} is already decommissioned")]
    AlreadyDecommissioned(String),

    #[error("service kind mismatch: current is {current}, replacement is {replacement}")]
    MismatchedKind {
        current: ServiceKind,
        replacement: ServiceKind,
    },

    #[error("endpoint {0} is not healthy")]
    UnhealthyCandidate(String),

    #[error("endpoint registered {age_secs}s ago; rotation requires {required_secs}s")]
    TooNewToRotate { age_secs: i64, required_secs: i64 },

    #[error("endpoint {0} is already mid-rotation")]
    RotationInProgress(String),

    // System errors — the caller may retry.
    #[error("storage unavailable: {0}")]
    Storage(String),

    #[error("registry invariant violated: {0}")]
    Invariant(String),
}

impl DiscoveryError {
    /// Integer code for the shared error envelope.
    pub fn error_code(&self) -> i64 {
        match self {
            Self::AdminTokenTooShort { .. } => codes::INVALID_ADMIN_TOKEN,
            Self::MissingField(_) => codes::MISSING_FIELD,
            Self::Duplicate(_) => codes::DUPLICATE,
            Self::NotFound(_) => codes::NOT_FOUND,
            Self::InvalidFieldValue { .. }
            | Self::InvalidPublicKey(_)
            | Self::InvalidSignature => codes::VALIDATION,
            Self::AlreadyDecommissioned(_)
            | Self::MismatchedKind { .. }
            | Self::UnhealthyCandidate(_)
            | Self::TooNewToRotate { .. }
            | Self::RotationInProgress(_) => codes::ROTATION_REJECTED,
            Self::Storage(_) | Self::Invariant(_) => codes::STORAGE,
        }
    }

    /// HTTP status for the error envelope.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::AdminTokenTooShort { .. } => 401,
            Self::MissingField(_)
            | Self::InvalidFieldValue { .. }
            | Self::InvalidPublicKey(_)
            | Self::InvalidSignature => 400,
            Self::NotFound(_) => 404,
            Self::Duplicate(_)
            | Self::AlreadyDecommissioned(_)
            | Self::MismatchedKind { .. }
            | Self::UnhealthyCandidate(_)
            | Self::TooNewToRotate { .. }
            | Self::RotationInProgress(_) => 409,
            Self::Storage(_) | Self::Invariant(_) => 500,
        }
    }
}

impl From<StoreError> for DiscoveryError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Duplicate(what) => Self::Duplicate(what),
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::InvariantViolation(what) => Self::Invariant(what),
            StoreError::Unavailable(what) => Self::Storage(what),
        }
    }
}

impl From<SignerError> for DiscoveryError {
    fn from(e: SignerError) -> Self {
        match e {
            SignerError::InvalidKey(reason) => Self::InvalidPublicKey(reason),
            SignerError::InvalidSignature => Self::InvalidSignature,
            SignerError::MalformedInput(reason) => Self::InvalidFieldValue {
                field: "signature",
                reason,
            },
        }
    }
}
