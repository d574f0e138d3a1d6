//! Error types for hsmvault.
//!
//! One error type covers every layer of the subsystem: primitives, the vendor
//! adapter contract, the cluster manager and the configuration layer. Messages
//! name *what* failed and where (vendor, operation, attempt count) without
//! echoing key material or plaintext.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, HsmError>;

/// Coarse classification used by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorClass {
    Connection,
    Authentication,
    Validation,
    NotConnected,
    VendorOperation,
    ClusterExhausted,
    Unauthorized,
    Timeout,
    Backpressure,
    Internal,
}

/// The single error type for all hsmvault operations.
#[derive(Debug, Error)]
pub enum HsmError {
    /// Network or handshake failure talking to a backend node.
    #[error("connection to {vendor} failed: {reason}")]
    Connection { vendor: String, reason: String },

    /// The backend rejected the presented credentials.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Malformed caller parameters. Always raised before any backend call.
    #[error("invalid parameters: {0}")]
    Validation(String),

    /// An operation was attempted on a session that is not connected.
    #[error("connection {connection_id} is not connected")]
    NotConnected { connection_id: String },

    /// The backend reported a failure while performing a key or crypto operation.
    #[error("{vendor} failed during {operation}: {reason}")]
    VendorOperation {
        vendor: String,
        operation: String,
        reason: String,
        retryable: bool,
    },

    /// No healthy node remains in the cluster.
    #[error("no healthy node available for service {service}")]
    ClusterExhausted { service: String },

    /// The request is well formed but refused by key policy.
    #[error("operation not permitted: {0}")]
    Unauthorized(String),

    /// No key with the given identifier exists.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// The concurrency ceiling was reached and the queue wait expired.
    #[error("too many concurrent operations (limit {limit})")]
    Backpressure { limit: usize },

    /// A retryable failure persisted through every permitted attempt.
    #[error("{operation} on {vendor} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        vendor: String,
        operation: String,
        attempts: u32,
        last: Box<HsmError>,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    /// A cryptographic key was invalid (wrong length, malformed, etc.).
    #[error("invalid key")]
    InvalidKey,

    #[error("encryption failed")]
    EncryptionFailure,

    /// Wrong key, tampered ciphertext or a failed authentication tag.
    #[error("decryption failed")]
    DecryptionFailure,

    #[error("key derivation failed")]
    KeyDerivationFailure,

    #[error("randomness source failed")]
    RandomnessFailure,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HsmError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Connection { .. } => ErrorClass::Connection,
            Self::Authentication(_) => ErrorClass::Authentication,
            Self::Validation(_) | Self::Configuration(_) => ErrorClass::Validation,
            Self::NotConnected { .. } => ErrorClass::NotConnected,
            Self::VendorOperation { .. } | Self::KeyNotFound(_) => ErrorClass::VendorOperation,
            Self::ClusterExhausted { .. } => ErrorClass::ClusterExhausted,
            Self::Unauthorized(_) => ErrorClass::Unauthorized,
            Self::Timeout { .. } => ErrorClass::Timeout,
            Self::Backpressure { .. } => ErrorClass::Backpressure,
            Self::RetriesExhausted { last, .. } => last.class(),
            Self::InvalidKey
            | Self::EncryptionFailure
            | Self::DecryptionFailure
            | Self::KeyDerivationFailure
            | Self::RandomnessFailure
            | Self::Io(_)
            | Self::Serialization(_) => ErrorClass::Internal,
        }
    }

    /// Whether resubmitting the same request could succeed.
    ///
    /// Validation, authentication and policy refusals are never retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } | Self::Timeout { .. } => true,
            Self::VendorOperation { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Whether the failure indicates the node itself is unhealthy, as opposed
    /// to a problem with this particular request.
    pub fn is_node_failure(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Timeout { .. } | Self::NotConnected { .. }
        )
    }

    pub(crate) fn vendor_op(
        vendor: &str,
        operation: &str,
        reason: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self::VendorOperation {
            vendor: vendor.to_string(),
            operation: operation.to_string(),
            reason: reason.into(),
            retryable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability_by_class() {
        let conn = HsmError::Connection {
            vendor: "softhsm".into(),
            reason: "refused".into(),
        };
        assert!(conn.is_retryable());
        assert!(!HsmError::Validation("empty usage".into()).is_retryable());
        assert!(!HsmError::Authentication("bad cert".into()).is_retryable());
        assert!(!HsmError::Unauthorized("not exportable".into()).is_retryable());
        assert!(HsmError::vendor_op("softhsm", "sign", "busy", true).is_retryable());
        assert!(!HsmError::vendor_op("softhsm", "sign", "bad key", false).is_retryable());
    }

    #[test]
    fn test_exhausted_error_keeps_diagnostics() {
        let err = HsmError::RetriesExhausted {
            vendor: "softhsm".into(),
            operation: "encrypt".into(),
            attempts: 3,
            last: Box::new(HsmError::Timeout {
                operation: "encrypt".into(),
                timeout_ms: 50,
            }),
        };
        let msg = err.to_string();
        assert!(msg.contains("softhsm"));
        assert!(msg.contains("encrypt"));
        assert!(msg.contains("3 attempts"));
        assert_eq!(err.class(), ErrorClass::Timeout);
    }
}
