//! Error types for the media transport layer.

use wamedia_core::MediaError;

/// Errors produced by sources, uploads and downloads.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// A cryptographic or protocol error from the core.
    #[error(transparent)]
    Media(#[from] MediaError),

    /// The source stream aborted or refused.
    #[error("stream error: {reason}")]
    Stream {
        /// The reason the stream failed.
        reason: String,
    },

    /// HTTP transport failure.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// Filesystem failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A URL could not be parsed.
    #[error(transparent)]
    Url(#[from] url::ParseError),

    /// The upload body exceeds a host's declared maximum.
    #[error("upload body of {size} bytes exceeds host limit of {limit}")]
    BodyTooLarge {
        /// Size of the staged body.
        size: u64,
        /// The host's declared maximum.
        limit: u64,
    },

    /// Every upload host rejected the body.
    #[error("all upload hosts failed: {last_response}")]
    UploadFailed {
        /// The last server response (or transport error) observed.
        last_response: String,
    },

    /// The media server answered with a non-success status.
    #[error("media download failed: HTTP {status}")]
    DownloadStatus {
        /// The HTTP status code returned.
        status: u16,
    },
}

impl TransportError {
    /// HTTP-like status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Media(e) => e.status_code(),
            Self::BodyTooLarge { .. } => 413,
            Self::DownloadStatus { status } => *status,
            Self::Url(_) => 400,
            Self::Stream { .. } | Self::Http(_) | Self::Io(_) | Self::UploadFailed { .. } => 500,
        }
    }
}
