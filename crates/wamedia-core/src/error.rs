//! Error types for the media cryptography core.

use crate::keys::MEDIA_KEY_LEN;

/// Errors produced by key derivation and the cipher pipelines.
///
/// Every variant maps to an HTTP-like status code via
/// [`status_code`](MediaError::status_code) so callers can surface
/// failures in the shape the rest of the protocol stack expects.
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    /// The media key is not exactly 32 bytes.
    #[error("media key must be {MEDIA_KEY_LEN} bytes, got {0}")]
    InvalidMediaKey(usize),

    /// The media key string was not valid base64.
    #[error("invalid base64 media key: {0}")]
    MediaKeyEncoding(#[from] base64::DecodeError),

    /// Plaintext exceeded the configured content-length limit.
    #[error("plaintext exceeded the configured limit of {limit} bytes")]
    SizeExceeded {
        /// The limit that was crossed.
        limit: u64,
    },

    /// Encryption failed.
    #[error("encryption failed: {reason}")]
    EncryptionFailed {
        /// The reason for the failure.
        reason: String,
    },

    /// Decryption failed (bad padding, truncated ciphertext, ...).
    #[error("decryption failed: {reason}")]
    DecryptionFailed {
        /// The reason for the failure.
        reason: String,
    },

    /// The trailing MAC did not match the ciphertext.
    #[error("media MAC verification failed")]
    MacMismatch,

    /// Neither a trusted URL nor a direct path was usable.
    #[error("invalid media URL: {reason}")]
    InvalidMediaUrl {
        /// The reason the URL was rejected.
        reason: String,
    },
}

impl MediaError {
    /// HTTP-like status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidMediaKey(_) | Self::MediaKeyEncoding(_) | Self::InvalidMediaUrl { .. } => {
                400
            }
            Self::SizeExceeded { .. } => 413,
            Self::MacMismatch => 412,
            Self::EncryptionFailed { .. } | Self::DecryptionFailed { .. } => 500,
        }
    }
}
