//! Uniform byte-stream sources.
//!
//! Upload plaintext can come from memory, a local file, a remote URL
//! or an already-open stream; all of them open into the same one-shot
//! chunk stream.

use std::path::PathBuf;

use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use tokio_util::io::ReaderStream;

use crate::error::TransportError;

/// A one-shot stream of byte chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Where upload plaintext comes from.
pub enum MediaSource {
    /// In-memory bytes, yielded as a single chunk.
    Bytes(Bytes),
    /// A local file, read as a chunked stream.
    Path(PathBuf),
    /// A remote URL, fetched with a streaming GET.
    Url(String),
    /// An existing stream, passed through unchanged.
    Stream(ByteStream),
}

impl MediaSource {
    /// Interpret a string spec: `http://` and `https://` prefixes mean
    /// a remote URL, anything else is a file path.
    pub fn from_spec(spec: &str) -> Self {
        if spec.starts_with("http://") || spec.starts_with("https://") {
            Self::Url(spec.to_string())
        } else {
            Self::Path(PathBuf::from(spec))
        }
    }

    /// Open the source into a chunk stream.
    ///
    /// The returned stream is consumable exactly once; dropping it
    /// releases the underlying file handle or HTTP connection.
    pub async fn open(self, client: &reqwest::Client) -> Result<ByteStream, TransportError> {
        match self {
            Self::Bytes(bytes) => Ok(stream::iter([Ok(bytes)]).boxed()),
            Self::Path(path) => {
                let file = tokio::fs::File::open(path).await?;
                Ok(ReaderStream::new(file).map_err(TransportError::from).boxed())
            }
            Self::Url(url) => {
                let response = client.get(&url).send().await?;
                if !response.status().is_success() {
                    return Err(TransportError::DownloadStatus {
                        status: response.status().as_u16(),
                    });
                }
                Ok(response.bytes_stream().map_err(TransportError::from).boxed())
            }
            Self::Stream(stream) => Ok(stream),
        }
    }
}

impl From<Vec<u8>> for MediaSource {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(bytes))
    }
}

impl From<Bytes> for MediaSource {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<PathBuf> for MediaSource {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}
