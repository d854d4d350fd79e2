use scakit_secure_store::KeyStoreError;
use thiserror::Error;

use crate::lifecycle::AuthorizationStatus;

/// Error outputs from the protocol engine.
#[derive(Debug, Error)]
pub enum ScaError {
    /// The host could not be reached or the request timed out. Retryable by
    /// re-invoking the whole operation, never partially.
    #[error("transport_error: {url}: {message}")]
    Transport {
        /// The request URL.
        url: String,
        /// Transport-level failure detail.
        message: String,
    },

    /// The server answered with a 4xx/5xx status. Not retryable without
    /// user action.
    #[error("api_error {status}: {error_class}: {error_message}")]
    ApiResponse {
        /// HTTP status code.
        status: u16,
        /// Machine-readable error class from the server envelope.
        error_class: String,
        /// Human-readable message from the server envelope.
        error_message: String,
    },

    /// Malformed or unsupported ciphertext. Isolated per item, never aborts
    /// a batch.
    #[error("decode_error: {context}")]
    Decode {
        /// What failed to decode.
        context: String,
    },

    /// The key entry for a connection is missing or invalid. Fatal for that
    /// connection until re-enrollment.
    #[error("key_unavailable: {alias}")]
    KeyUnavailable {
        /// The key alias that could not be resolved.
        alias: String,
    },

    /// The authorization expired locally before a disposition could be sent.
    /// Distinct from any server error; no network call is made.
    #[error("authorization_expired: {id}")]
    ExpiredAuthorization {
        /// The expired authorization id.
        id: String,
    },

    /// The authorization is not in a state that permits the requested
    /// disposition.
    #[error("invalid_transition: {id} is {from}")]
    InvalidTransition {
        /// The authorization id.
        id: String,
        /// Its current status.
        from: AuthorizationStatus,
    },

    /// The authorization id is not tracked by the lifecycle.
    #[error("not_tracked: {id}")]
    NotTracked {
        /// The unknown authorization id.
        id: String,
    },

    /// Unexpected error serializing or deserializing information.
    #[error("serialization_error: {0}")]
    Serialization(String),

    /// Internal cryptographic failure outside the decode path.
    #[error("crypto_error: {0}")]
    Crypto(String),
}

impl ScaError {
    /// Creates a [`ScaError::Decode`] with context.
    pub fn decode<S: Into<String>>(context: S) -> Self {
        Self::Decode {
            context: context.into(),
        }
    }

    /// Creates a [`ScaError::Transport`] with context.
    pub fn transport<U: Into<String>, M: Into<String>>(url: U, message: M) -> Self {
        Self::Transport {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Creates a [`ScaError::KeyUnavailable`] for `alias`.
    pub fn key_unavailable<S: Into<String>>(alias: S) -> Self {
        Self::KeyUnavailable {
            alias: alias.into(),
        }
    }

    /// Whether re-invoking the whole operation may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

impl From<serde_json::Error> for ScaError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<KeyStoreError> for ScaError {
    fn from(err: KeyStoreError) -> Self {
        match err {
            KeyStoreError::KeyNotFound { alias } | KeyStoreError::KeyTypeMismatch { alias } => {
                Self::KeyUnavailable { alias }
            }
            other => Self::Crypto(other.to_string()),
        }
    }
}

/// A failure attributed to a single connection inside a batch. One
/// connection's failure never hides results from the others.
#[derive(Debug)]
pub struct PerConnectionError {
    /// Local identifier of the failing connection.
    pub connection_guid: String,
    /// The failure itself.
    pub error: ScaError,
}

impl PerConnectionError {
    /// Pairs an error with the connection it belongs to.
    pub fn new<S: Into<String>>(connection_guid: S, error: ScaError) -> Self {
        Self {
            connection_guid: connection_guid.into(),
            error,
        }
    }
}
