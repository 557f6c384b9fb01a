//! Media cryptography core for a WhatsApp-compatible client.
//!
//! This crate implements the wire format used for end-to-end encrypted
//! media: per-object key derivation from a shared 32-byte media key,
//! streaming AES-256-CBC + HMAC-SHA256 encryption and decryption
//! pipelines (including partial-range decryption, where the previous
//! ciphertext block serves as the CBC IV), the out-of-band media retry
//! protocol, and canonical download-URL derivation.
//!
//! Everything here is pure computation over byte streams; transport
//! lives in the companion `wamedia-net` crate.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::bare_urls)]

pub mod decrypt;
pub mod encrypt;
pub mod error;
pub mod keys;
pub mod node;
pub mod retry;
mod secret;
pub mod url;

pub use self::decrypt::{MediaDecryptor, RangePlan, decrypt_media};
pub use self::encrypt::{EncryptSummary, EncryptedPayload, MediaEncryptor, encrypt_media};
pub use self::error::MediaError;
pub use self::keys::{MEDIA_KEY_LEN, MediaKeys, MediaType, generate_media_key};
pub use self::node::{BinaryNode, NodeContent};
pub use self::secret::Secret;
pub use self::url::DownloadableMessage;

/// AES block size of the wire format, in bytes.
pub const AES_BLOCK_LEN: usize = 16;

/// Length of the truncated HMAC appended after the ciphertext.
pub const MEDIA_MAC_LEN: usize = 10;
