//! Encrypt-and-stage pipeline and the host-fallback upload dispatcher.
//!
//! Upload is two steps: [`encrypt_source`] streams plaintext through
//! the encrypting pipeline into a contiguous body (the servers do not
//! accept chunked uploads), then [`UploadDispatcher::upload`] walks the
//! ordered host list (custom hosts first, then server-provided),
//! POSTing to each until one answers with a URL or direct path.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;

use wamedia_core::url::{DEFAULT_ORIGIN, upload_token};
use wamedia_core::{MEDIA_MAC_LEN, MediaEncryptor, MediaError, MediaType, Secret};

use crate::conn::{MediaConnCache, MediaConnSource, UploadHost};
use crate::error::TransportError;
use crate::source::MediaSource;

/// Options for staging an upload.
#[derive(Debug, Clone, Default)]
pub struct EncryptOptions {
    /// Fail with `SizeExceeded` once the plaintext crosses this limit.
    pub max_content_length: Option<u64>,
    /// Tee the plaintext to a temp file and report its path.
    pub save_original: bool,
}

/// A staged, encrypted media object ready for upload.
#[derive(Debug)]
pub struct EncryptedArtifact {
    /// The media key the recipient needs to derive decryption keys.
    pub media_key: Secret<[u8; 32]>,
    /// `ciphertext || mac`, the exact upload body.
    pub body: Bytes,
    /// Plaintext length in bytes.
    pub file_length: u64,
    /// SHA-256 of the plaintext.
    pub file_sha256: [u8; 32],
    /// SHA-256 of the upload body.
    pub file_enc_sha256: [u8; 32],
    /// Trailing ten-byte MAC.
    pub mac: [u8; MEDIA_MAC_LEN],
    /// Where the plaintext copy was saved, when requested.
    pub body_path: Option<PathBuf>,
}

/// Stream a source through the encrypting pipeline.
///
/// The temp file backing `body_path` only survives a fully successful
/// pass; every error path drops (and thereby unlinks) it.
pub async fn encrypt_source(
    source: MediaSource,
    media_type: MediaType,
    client: &reqwest::Client,
    options: &EncryptOptions,
) -> Result<EncryptedArtifact, TransportError> {
    let mut encryptor = MediaEncryptor::new(media_type)?;
    let mut stream = source.open(client).await?;
    let mut tee = if options.save_original {
        Some(tempfile::NamedTempFile::new()?)
    } else {
        None
    };
    let mut body = BytesMut::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if let Some(limit) = options.max_content_length {
            if encryptor.bytes_in() + chunk.len() as u64 > limit {
                return Err(MediaError::SizeExceeded { limit }.into());
            }
        }
        if let Some(file) = tee.as_mut() {
            file.write_all(&chunk)?;
        }
        body.extend_from_slice(&encryptor.update(&chunk));
    }
    let (tail, summary) = encryptor.finalize();
    body.extend_from_slice(&tail);

    let body_path = match tee {
        Some(file) => {
            let (_, path) = file.keep().map_err(|e| TransportError::Io(e.error))?;
            Some(path)
        }
        None => None,
    };

    tracing::debug!(
        target: "wamedia_net::upload",
        file_length = summary.file_length,
        enc_sha256 = %hex::encode(summary.file_enc_sha256),
        "staged encrypted media",
    );

    Ok(EncryptedArtifact {
        media_key: summary.media_key,
        body: body.freeze(),
        file_length: summary.file_length,
        file_sha256: summary.file_sha256,
        file_enc_sha256: summary.file_enc_sha256,
        mac: summary.mac,
        body_path,
    })
}

/// Options for one upload.
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    /// Route through the newsletter upload path.
    pub newsletter: bool,
    /// Per-request timeout.
    pub timeout: Option<Duration>,
}

/// What a successful upload returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResult {
    /// Absolute media URL, if the server returned one.
    pub media_url: Option<String>,
    /// Server-relative direct path.
    pub direct_path: Option<String>,
    /// Opaque handle (returned for document uploads).
    pub handle: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct UploadResponse {
    url: Option<String>,
    direct_path: Option<String>,
    handle: Option<String>,
}

/// A server answer counts as success only when it names the stored
/// object by URL or direct path.
fn parse_upload_response(text: &str) -> Option<UploadResult> {
    let response: UploadResponse = serde_json::from_str(text).ok()?;
    if response.url.is_none() && response.direct_path.is_none() {
        return None;
    }
    Some(UploadResult {
        media_url: response.url,
        direct_path: response.direct_path,
        handle: response.handle,
    })
}

/// Resolve the upload path segment, applying the newsletter rewrite.
fn media_path(media_type: MediaType, newsletter: bool) -> String {
    let base = media_type.upload_path();
    if newsletter || media_type.is_newsletter() {
        base.replace("/mms/", "/newsletter/newsletter-")
    } else {
        base.to_string()
    }
}

/// Tries the ordered upload host list until one accepts the body.
///
/// HTTP behaviour (proxies, TLS, user agent) is whatever the supplied
/// `reqwest::Client` was built with.
pub struct UploadDispatcher<S> {
    client: reqwest::Client,
    conn: MediaConnCache<S>,
    custom_hosts: Vec<UploadHost>,
}

impl<S> UploadDispatcher<S>
where
    S: MediaConnSource,
{
    /// Create a dispatcher over a connection source.
    pub fn new(client: reqwest::Client, source: S) -> Self {
        Self {
            client,
            conn: MediaConnCache::new(source),
            custom_hosts: Vec::new(),
        }
    }

    /// Prepend caller-supplied hosts to the server-provided list.
    pub fn with_custom_hosts(mut self, hosts: Vec<UploadHost>) -> Self {
        self.custom_hosts = hosts;
        self
    }

    /// Upload a staged artifact.
    ///
    /// Hosts are tried strictly in list order, at most once each. A
    /// host whose declared size limit the body exceeds is skipped. A
    /// host that answers without a URL or direct path triggers one
    /// forced auth refresh before the next host is tried. Exhausting
    /// the list fails with the last response observed.
    pub async fn upload(
        &self,
        artifact: &EncryptedArtifact,
        media_type: MediaType,
        options: &UploadOptions,
    ) -> Result<UploadResult, TransportError> {
        let mut conn = self.conn.get(false).await?;
        let token = upload_token(&artifact.file_enc_sha256);
        let path = media_path(media_type, options.newsletter);
        let size = artifact.body.len() as u64;

        let hosts = self.combined_hosts(&conn.hosts);
        let mut last_response = String::from("no upload hosts available");

        for host in &hosts {
            if let Some(limit) = host.max_content_length {
                if size > limit {
                    let err = TransportError::BodyTooLarge { size, limit };
                    tracing::debug!(
                        target: "wamedia_net::upload",
                        host = %host.hostname,
                        %err,
                        "skipping upload host",
                    );
                    last_response = format!("{}: {err}", host.hostname);
                    continue;
                }
            }

            let url = format!("https://{}{}/{}", host.hostname, path, token);
            let mut request = self
                .client
                .post(&url)
                .query(&[("auth", conn.auth.as_str()), ("token", token.as_str())])
                .header(reqwest::header::ORIGIN, DEFAULT_ORIGIN)
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(artifact.body.clone());
            if let Some(timeout) = options.timeout {
                request = request.timeout(timeout);
            }

            let text = match request.send().await {
                Ok(response) => response.text().await.unwrap_or_default(),
                Err(e) => {
                    tracing::warn!(
                        target: "wamedia_net::upload",
                        host = %host.hostname,
                        error = %e,
                        "upload attempt failed",
                    );
                    last_response = format!("{}: {e}", host.hostname);
                    continue;
                }
            };

            match parse_upload_response(&text) {
                Some(result) => return Ok(result),
                None => {
                    tracing::warn!(
                        target: "wamedia_net::upload",
                        host = %host.hostname,
                        response = %text,
                        "upload host returned no result, refreshing auth",
                    );
                    last_response = text;
                    conn = self.conn.get(true).await?;
                }
            }
        }

        Err(TransportError::UploadFailed { last_response })
    }

    /// Custom hosts first, then the server-provided list.
    fn combined_hosts(&self, server_hosts: &[UploadHost]) -> Vec<UploadHost> {
        self.custom_hosts
            .iter()
            .chain(server_hosts.iter())
            .cloned()
            .collect()
    }
}
