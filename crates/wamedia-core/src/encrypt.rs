//! Streaming authenticated encryption for media uploads.
//!
//! Wire layout of an encrypted object:
//!
//! ```text
//! [AES-256-CBC(cipher_key, iv, plaintext + PKCS#7)] [MAC (10 bytes)]
//! MAC = HMAC-SHA256(mac_key, iv || ciphertext)[0..10]
//! ```
//!
//! The encryptor is single-pass: plaintext SHA-256, ciphertext SHA-256
//! and the MAC are all computed while the ciphertext is produced.

use aes::{Aes256, Block};
use cbc::cipher::{BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::MediaError;
use crate::keys::{MediaKeys, MediaType, generate_media_key};
use crate::secret::Secret;
use crate::{AES_BLOCK_LEN, MEDIA_MAC_LEN};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Key material and digests describing one encrypted media object.
#[derive(Debug, Clone)]
pub struct EncryptSummary {
    /// The 32-byte media key the recipient derives from.
    pub media_key: Secret<[u8; 32]>,
    /// Plaintext length in bytes.
    pub file_length: u64,
    /// SHA-256 of the plaintext.
    pub file_sha256: [u8; 32],
    /// SHA-256 of `ciphertext || mac`.
    pub file_enc_sha256: [u8; 32],
    /// First ten bytes of `HMAC-SHA256(mac_key, iv || ciphertext)`.
    pub mac: [u8; MEDIA_MAC_LEN],
}

/// Single-pass streaming media encryptor.
///
/// Feed plaintext chunks through [`update`](Self::update) and emit the
/// returned ciphertext downstream; [`finalize`](Self::finalize) pads
/// the last block, appends the truncated MAC and hands back the
/// digests. All cipher, MAC and hash state is scoped to one object and
/// dropped with the encryptor.
pub struct MediaEncryptor {
    media_key: Secret<[u8; 32]>,
    enc: Aes256CbcEnc,
    hmac: HmacSha256,
    sha_plain: Sha256,
    sha_enc: Sha256,
    pending: Vec<u8>,
    file_length: u64,
}

impl MediaEncryptor {
    /// Create an encryptor with a fresh random media key.
    pub fn new(media_type: MediaType) -> Result<Self, MediaError> {
        Self::with_media_key(generate_media_key(), media_type)
    }

    /// Create an encryptor from caller-provided key material.
    pub fn with_media_key(
        media_key: Secret<[u8; 32]>,
        media_type: MediaType,
    ) -> Result<Self, MediaError> {
        let keys = MediaKeys::derive(media_key.as_ref(), media_type)?;
        let enc = Aes256CbcEnc::new_from_slices(keys.cipher_key.as_ref(), keys.iv.as_ref())
            .map_err(|e| MediaError::EncryptionFailed {
                reason: format!("cipher init: {e}"),
            })?;
        let mut hmac = HmacSha256::new_from_slice(keys.mac_key.as_ref()).map_err(|e| {
            MediaError::EncryptionFailed {
                reason: format!("mac init: {e}"),
            }
        })?;
        // The MAC covers iv || ciphertext
        hmac.update(keys.iv.as_ref());

        Ok(Self {
            media_key,
            enc,
            hmac,
            sha_plain: Sha256::new(),
            sha_enc: Sha256::new(),
            pending: Vec::with_capacity(AES_BLOCK_LEN),
            file_length: 0,
        })
    }

    /// Plaintext bytes absorbed so far.
    pub fn bytes_in(&self) -> u64 {
        self.file_length
    }

    /// Absorb a plaintext chunk, returning the ciphertext produced by
    /// the complete blocks it closed.
    pub fn update(&mut self, chunk: &[u8]) -> Vec<u8> {
        self.sha_plain.update(chunk);
        self.file_length += chunk.len() as u64;
        self.pending.extend_from_slice(chunk);

        let aligned = self.pending.len() - self.pending.len() % AES_BLOCK_LEN;
        if aligned == 0 {
            return Vec::new();
        }
        let mut out: Vec<u8> = self.pending.drain(..aligned).collect();
        for block in out.chunks_exact_mut(AES_BLOCK_LEN) {
            self.enc.encrypt_block_mut(Block::from_mut_slice(block));
        }
        self.hmac.update(&out);
        self.sha_enc.update(&out);
        out
    }

    /// Pad and encrypt the final block, append the MAC, and return the
    /// tail bytes together with the object summary.
    pub fn finalize(mut self) -> (Vec<u8>, EncryptSummary) {
        let mut tail = std::mem::take(&mut self.pending);
        let pad = AES_BLOCK_LEN - tail.len() % AES_BLOCK_LEN;
        tail.resize(tail.len() + pad, pad as u8);
        for block in tail.chunks_exact_mut(AES_BLOCK_LEN) {
            self.enc.encrypt_block_mut(Block::from_mut_slice(block));
        }
        self.hmac.update(&tail);
        self.sha_enc.update(&tail);

        let digest = self.hmac.finalize().into_bytes();
        let mut mac = [0u8; MEDIA_MAC_LEN];
        mac.copy_from_slice(&digest[..MEDIA_MAC_LEN]);
        self.sha_enc.update(mac);
        tail.extend_from_slice(&mac);

        let summary = EncryptSummary {
            media_key: self.media_key,
            file_length: self.file_length,
            file_sha256: self.sha_plain.finalize().into(),
            file_enc_sha256: self.sha_enc.finalize().into(),
            mac,
        };
        (tail, summary)
    }
}

/// An in-memory encrypted media object.
#[derive(Debug, Clone)]
pub struct EncryptedPayload {
    /// `ciphertext || mac`, ready for upload.
    pub data: Vec<u8>,
    /// Key material and digests for the object.
    pub summary: EncryptSummary,
}

/// Encrypt a buffer with a fresh media key in one call.
pub fn encrypt_media(
    plaintext: &[u8],
    media_type: MediaType,
) -> Result<EncryptedPayload, MediaError> {
    let mut encryptor = MediaEncryptor::new(media_type)?;
    let mut data = encryptor.update(plaintext);
    let (tail, summary) = encryptor.finalize();
    data.extend_from_slice(&tail);
    Ok(EncryptedPayload { data, summary })
}
