//! Canonical media URL derivation.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use crate::error::MediaError;

/// Host serving stored media objects.
pub const MEDIA_HOST: &str = "mmg.whatsapp.net";

/// `Origin` header value for media requests.
pub const DEFAULT_ORIGIN: &str = "https://web.whatsapp.com";

/// Only absolute URLs under this prefix are trusted for downloads.
const TRUSTED_URL_PREFIX: &str = "https://mmg.whatsapp.net/";

/// Parameters identifying a downloadable media object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadableMessage {
    /// The 32-byte media key shared in the message.
    pub media_key: Vec<u8>,
    /// Server-relative path of the stored object.
    pub direct_path: Option<String>,
    /// Absolute URL, trusted only under the media host.
    pub url: Option<String>,
}

/// Derive the canonical download URL from a direct path.
///
/// The path is preserved verbatim; an empty path is rejected.
pub fn direct_path_to_url(direct_path: &str) -> Result<String, MediaError> {
    if direct_path.is_empty() {
        return Err(MediaError::InvalidMediaUrl {
            reason: "empty direct path".into(),
        });
    }
    Ok(format!("https://{MEDIA_HOST}{direct_path}"))
}

/// Resolve the URL to download a message's media from.
///
/// A message-supplied `url` takes precedence iff it begins with the
/// trusted media-host prefix; otherwise the direct path is used.
pub fn resolve_download_url(
    url: Option<&str>,
    direct_path: Option<&str>,
) -> Result<String, MediaError> {
    if let Some(url) = url {
        if url.starts_with(TRUSTED_URL_PREFIX) {
            return Ok(url.to_string());
        }
    }
    match direct_path {
        Some(path) => direct_path_to_url(path),
        None => Err(MediaError::InvalidMediaUrl {
            reason: "neither a trusted url nor a direct path".into(),
        }),
    }
}

impl DownloadableMessage {
    /// Resolve this message's download URL.
    pub fn download_url(&self) -> Result<String, MediaError> {
        resolve_download_url(self.url.as_deref(), self.direct_path.as_deref())
    }
}

/// Encode an encrypted-file hash as an upload URL token: URL-safe
/// base64 without padding.
pub fn upload_token(file_enc_sha256: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(file_enc_sha256)
}

/// Rewrite a standard base64 string into the upload token form.
///
/// Idempotent: URL-safe unpadded input passes through unchanged.
pub fn upload_token_from_base64(encoded: &str) -> String {
    encoded
        .replace('+', "-")
        .replace('/', "_")
        .trim_end_matches('=')
        .to_string()
}
