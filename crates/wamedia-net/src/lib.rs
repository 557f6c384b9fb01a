//! Media transport for a WhatsApp-compatible client.
//!
//! Builds on `wamedia-core`: uniform byte-stream sources, the
//! encrypt-and-stage pipeline for uploads, the sequential host-fallback
//! upload dispatcher with auth refresh, and streaming (optionally
//! ranged) downloads piped through the decrypting pipeline.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::bare_urls)]

pub mod conn;
pub mod download;
pub mod error;
pub mod source;
pub mod upload;

pub use self::conn::{MediaConn, MediaConnCache, MediaConnSource, UploadHost};
pub use self::download::{DownloadOptions, decrypt_stream, download_media, download_stream};
pub use self::error::TransportError;
pub use self::source::{ByteStream, MediaSource};
pub use self::upload::{
    EncryptOptions, EncryptedArtifact, UploadDispatcher, UploadOptions, UploadResult,
    encrypt_source,
};
