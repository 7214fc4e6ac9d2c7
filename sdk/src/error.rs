//! Error kinds shared across the Kernel core.
//!
//! Handlers translate each kind into a canonical `{"error": <code>}` JSON
//! response; nothing here carries signer secrets or database internals.

use {
    crate::{canonical::CanonicalError, signer::SignerError},
    thiserror::Error,
};

/// Store-level failures, shared by every persistence trait.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("record not found")]
    NotFound,
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
    #[error(transparent)]
    Signer(#[from] SignerError),
}

/// Unified error surface for the orchestration layer.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("{message}")]
    InvalidInput {
        code: &'static str,
        message: String,
    },
    #[error("authentication required")]
    Unauthenticated,
    #[error("principal lacks a required role")]
    Forbidden,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{message}")]
    Conflict {
        code: &'static str,
        message: String,
    },
    #[error("idempotency key reused with a different request")]
    IdempotencyConflict,
    #[error("insufficient quorum ({approvals}/{required})")]
    InsufficientQuorum { approvals: u32, required: u32 },
    #[error("signer unavailable: {0}")]
    SignerUnavailable(#[source] SignerError),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl KernelError {
    pub fn invalid_input(code: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            code,
            message: message.into(),
        }
    }

    pub fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        Self::Conflict {
            code,
            message: message.into(),
        }
    }

    /// Stable machine-readable error code for the response body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput { code, .. } => code,
            Self::Unauthenticated => "unauthenticated",
            Self::Forbidden => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Conflict { code, .. } => code,
            Self::IdempotencyConflict => "idempotency_key_conflict",
            Self::InsufficientQuorum { .. } => "insufficient_quorum",
            Self::SignerUnavailable(_) => "signer_unavailable",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::Internal(_) => "internal_error",
        }
    }

    /// HTTP status the handler layer responds with.
    pub fn status(&self) -> u16 {
        match self {
            Self::InvalidInput { .. } | Self::InsufficientQuorum { .. } => 400,
            Self::Unauthenticated => 401,
            Self::Forbidden => 403,
            Self::NotFound(_) => 404,
            Self::Conflict { .. } => 409,
            Self::IdempotencyConflict => 412,
            Self::SignerUnavailable(_) | Self::Internal(_) => 500,
            Self::StoreUnavailable(_) => 503,
        }
    }
}

impl From<SignerError> for KernelError {
    fn from(err: SignerError) -> Self {
        Self::SignerUnavailable(err)
    }
}

impl From<CanonicalError> for KernelError {
    fn from(err: CanonicalError) -> Self {
        Self::invalid_input("invalid_payload", err.to_string())
    }
}

impl From<StoreError> for KernelError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Signer(e) => Self::SignerUnavailable(e),
            StoreError::Canonical(e) => e.into(),
            StoreError::NotFound => Self::NotFound("record"),
            StoreError::Conflict(message) => Self::Conflict {
                code: "conflict",
                message,
            },
            StoreError::Database(e) => Self::StoreUnavailable(e.to_string()),
            StoreError::Unavailable(message) => Self::StoreUnavailable(message),
            StoreError::Encoding(message) => Self::Internal(anyhow::anyhow!(message)),
        }
    }
}
