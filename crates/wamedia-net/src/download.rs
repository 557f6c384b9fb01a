//! Streaming (optionally ranged) media download.
//!
//! The fetch plan comes from the core: for a ranged read the request
//! is widened to block boundaries so the preceding ciphertext block is
//! available as the CBC IV, and the decryptor trims its output back to
//! the requested plaintext range.

use bytes::Bytes;
use futures_util::stream::{StreamExt, TryStreamExt, try_unfold};

use wamedia_core::decrypt::{MediaDecryptor, RangePlan, decrypt_media};
use wamedia_core::url::DEFAULT_ORIGIN;
use wamedia_core::{DownloadableMessage, MediaKeys, MediaType};

use crate::error::TransportError;
use crate::source::ByteStream;

/// Options for one download.
#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    /// First plaintext byte to return.
    pub start_byte: Option<u64>,
    /// One past the last plaintext byte to return.
    pub end_byte: Option<u64>,
    /// Verify the trailing MAC. Only honoured for whole-object
    /// downloads; a partial fetch never sees the full ciphertext.
    pub verify_mac: bool,
}

impl DownloadOptions {
    fn plan(&self) -> RangePlan {
        RangePlan::new(self.start_byte.unwrap_or(0), self.end_byte)
    }
}

/// Pipe a fetched ciphertext stream through the decrypting pipeline.
///
/// Dropping the returned stream cancels the transfer and disposes the
/// cipher state; partial output is never valid.
pub fn decrypt_stream(
    input: ByteStream,
    keys: &MediaKeys,
    plan: RangePlan,
) -> Result<ByteStream, TransportError> {
    struct DecryptState {
        input: ByteStream,
        decryptor: Option<MediaDecryptor>,
    }

    let state = DecryptState {
        input,
        decryptor: Some(MediaDecryptor::new(keys, plan)?),
    };

    Ok(Box::pin(try_unfold(state, |mut state| async move {
        loop {
            let Some(decryptor) = state.decryptor.as_mut() else {
                return Ok(None);
            };
            match state.input.next().await {
                Some(Ok(chunk)) => {
                    let out = decryptor.update(&chunk).map_err(TransportError::from)?;
                    if out.is_empty() {
                        continue;
                    }
                    return Ok(Some((Bytes::from(out), state)));
                }
                Some(Err(e)) => return Err(e),
                None => {
                    let decryptor = state.decryptor.take().expect("present in this branch");
                    let tail = decryptor.finalize().map_err(TransportError::from)?;
                    if tail.is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some((Bytes::from(tail), state)));
                }
            }
        }
    })))
}

/// GET a ciphertext URL and return the decrypted plaintext stream.
pub async fn download_stream(
    url: &str,
    keys: &MediaKeys,
    options: &DownloadOptions,
    client: &reqwest::Client,
) -> Result<ByteStream, TransportError> {
    let target = reqwest::Url::parse(url)?;
    let plan = options.plan();

    let mut request = client
        .get(target)
        .header(reqwest::header::ORIGIN, DEFAULT_ORIGIN);
    if let Some(range) = plan.range_header() {
        request = request.header(reqwest::header::RANGE, range);
    }

    let response = request.send().await?;
    if !response.status().is_success() {
        return Err(TransportError::DownloadStatus {
            status: response.status().as_u16(),
        });
    }

    let input = response
        .bytes_stream()
        .map_err(TransportError::from)
        .boxed();
    decrypt_stream(input, keys, plan)
}

/// Download a message's media into memory.
///
/// Resolves the URL (trusted-prefix rule), derives the keys, fetches
/// and decrypts. MAC verification, when requested, is applied on the
/// buffered whole object before decryption.
pub async fn download_media(
    message: &DownloadableMessage,
    media_type: MediaType,
    options: &DownloadOptions,
    client: &reqwest::Client,
) -> Result<Vec<u8>, TransportError> {
    let url = message.download_url()?;
    let keys = MediaKeys::derive(&message.media_key, media_type)?;
    let plan = options.plan();

    if options.verify_mac && !plan.is_ranged() {
        let target = reqwest::Url::parse(&url)?;
        let response = client
            .get(target)
            .header(reqwest::header::ORIGIN, DEFAULT_ORIGIN)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TransportError::DownloadStatus {
                status: response.status().as_u16(),
            });
        }
        let data = response.bytes().await?;
        return Ok(decrypt_media(&data, &keys, true)?);
    }

    let mut stream = download_stream(&url, &keys, options, client).await?;
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}
