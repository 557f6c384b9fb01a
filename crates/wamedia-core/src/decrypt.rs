//! Streaming decryption, including partial byte ranges.
//!
//! A ranged read cannot start mid-stream without an IV: CBC needs the
//! ciphertext block *before* the first block of interest. The
//! [`RangePlan`] therefore widens the request to block boundaries,
//! fetches one extra leading block to serve as the IV, and records how
//! much of the decrypted output to trim so the consumer sees exactly
//! `[start, end)` of the plaintext.
//!
//! The trailing ten-byte MAC is not verified by the streaming path
//! (partial fetches cannot see the whole ciphertext); whole-object
//! callers can opt in via [`decrypt_media`].

use aes::{Aes256, Block};
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::MediaError;
use crate::keys::MediaKeys;
use crate::secret::Secret;
use crate::{AES_BLOCK_LEN, MEDIA_MAC_LEN};

type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

fn floor_block(n: u64) -> u64 {
    n - n % AES_BLOCK_LEN as u64
}

/// Fetch plan for a (possibly ranged) decryption.
///
/// `fetch_start..fetch_end` is the ciphertext span to request from the
/// server; when [`first_block_is_iv`](Self::first_block_is_iv) is set
/// the first fetched block is consumed as the CBC IV and decrypted
/// output logically begins at plaintext offset
/// [`plaintext_offset`](Self::plaintext_offset).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangePlan {
    /// First plaintext byte the consumer asked for.
    pub start_byte: u64,
    /// One past the last plaintext byte the consumer asked for, if
    /// bounded.
    pub end_byte: Option<u64>,
    /// Ciphertext offset the fetch starts at.
    pub fetch_start: u64,
    /// Ciphertext offset the fetch ends at, if bounded.
    pub fetch_end: Option<u64>,
    /// Whether the first fetched block is the IV rather than data.
    pub first_block_is_iv: bool,
    /// Plaintext offset of the first decrypted byte.
    pub plaintext_offset: u64,
}

impl RangePlan {
    /// Plan a whole-object decryption.
    pub fn whole() -> Self {
        Self::new(0, None)
    }

    /// Plan a decryption of plaintext bytes `[start_byte, end_byte)`.
    ///
    /// With `C = 16`: the fetch starts at `floor(start/C)*C - C` so the
    /// preceding ciphertext block is available as the IV (unless the
    /// range already starts in the first block, where the derived IV
    /// applies), and ends at `floor(end/C)*C + C` so the block holding
    /// the last requested byte is included.
    pub fn new(start_byte: u64, end_byte: Option<u64>) -> Self {
        let chunk_start = floor_block(start_byte);
        let (fetch_start, first_block_is_iv) = if chunk_start > 0 {
            (chunk_start - AES_BLOCK_LEN as u64, true)
        } else {
            (0, false)
        };
        let fetch_end = end_byte.map(|end| floor_block(end) + AES_BLOCK_LEN as u64);

        if start_byte > 0 || end_byte.is_some() {
            tracing::debug!(
                target: "wamedia_core::decrypt",
                start_byte,
                end_byte,
                fetch_start,
                fetch_end,
                first_block_is_iv,
                "planned ranged media fetch",
            );
        }

        Self {
            start_byte,
            end_byte,
            fetch_start,
            fetch_end,
            first_block_is_iv,
            plaintext_offset: chunk_start,
        }
    }

    /// Whether this plan fetches less than the whole object.
    pub fn is_ranged(&self) -> bool {
        self.start_byte > 0 || self.end_byte.is_some()
    }

    /// The HTTP `Range` header value, if the fetch is bounded.
    pub fn range_header(&self) -> Option<String> {
        if !self.is_ranged() {
            return None;
        }
        Some(match self.fetch_end {
            Some(end) => format!("bytes={}-{}", self.fetch_start, end),
            None => format!("bytes={}-", self.fetch_start),
        })
    }
}

/// Streaming media decryptor.
///
/// Feed fetched ciphertext chunks through [`update`](Self::update) in
/// arrival order; [`finalize`](Self::finalize) flushes the held-back
/// final block (validating PKCS#7 padding for unbounded reads) and
/// discards the trailing MAC bytes. Emitted plaintext is already
/// trimmed to the requested range.
pub struct MediaDecryptor {
    dec: Option<Aes256CbcDec>,
    cipher_key: Secret<[u8; 32]>,
    plan: RangePlan,
    /// PKCS#7 validation is disabled when `end_byte` bounds the fetch,
    /// because the fetched tail need not be the true end of the
    /// ciphertext.
    unpad: bool,
    pending: Vec<u8>,
    pos: u64,
}

impl MediaDecryptor {
    /// Create a decryptor for the given keys and fetch plan.
    pub fn new(keys: &MediaKeys, plan: RangePlan) -> Result<Self, MediaError> {
        let dec = if plan.first_block_is_iv {
            // IV arrives as the first fetched ciphertext block
            None
        } else {
            Some(
                Aes256CbcDec::new_from_slices(keys.cipher_key.as_ref(), keys.iv.as_ref())
                    .map_err(|e| MediaError::DecryptionFailed {
                        reason: format!("cipher init: {e}"),
                    })?,
            )
        };
        Ok(Self {
            dec,
            cipher_key: keys.cipher_key.clone(),
            unpad: plan.end_byte.is_none(),
            pos: plan.plaintext_offset,
            plan,
            pending: Vec::with_capacity(2 * AES_BLOCK_LEN),
        })
    }

    /// Absorb a fetched ciphertext chunk and return the plaintext it
    /// completed, trimmed to the requested range.
    pub fn update(&mut self, chunk: &[u8]) -> Result<Vec<u8>, MediaError> {
        self.pending.extend_from_slice(chunk);

        if self.dec.is_none() {
            if self.pending.len() < AES_BLOCK_LEN {
                return Ok(Vec::new());
            }
            let iv: Vec<u8> = self.pending.drain(..AES_BLOCK_LEN).collect();
            self.dec = Some(
                Aes256CbcDec::new_from_slices(self.cipher_key.as_ref(), &iv).map_err(|e| {
                    MediaError::DecryptionFailed {
                        reason: format!("cipher init: {e}"),
                    }
                })?,
            );
        }

        // Hold one aligned block back when unpadding: the final block
        // must be stripped of its padding at finalize
        let keep_back = if self.unpad { AES_BLOCK_LEN } else { 0 };
        let aligned = self.pending.len() - self.pending.len() % AES_BLOCK_LEN;
        if aligned <= keep_back {
            return Ok(Vec::new());
        }

        let mut buf: Vec<u8> = self.pending.drain(..aligned - keep_back).collect();
        let dec = self.dec.as_mut().expect("decryptor initialised above");
        for block in buf.chunks_exact_mut(AES_BLOCK_LEN) {
            dec.decrypt_block_mut(Block::from_mut_slice(block));
        }
        Ok(self.trim(buf))
    }

    /// Flush the end of the stream.
    ///
    /// For an unbounded read this decrypts the held-back final block,
    /// validates and strips its PKCS#7 padding, and discards whatever
    /// trails it (the appended MAC). For a bounded read there is
    /// nothing left to emit.
    pub fn finalize(mut self) -> Result<Vec<u8>, MediaError> {
        if !self.unpad {
            // Bounded fetch: any sub-block residue is past the range
            return Ok(Vec::new());
        }

        let Some(dec) = self.dec.as_mut() else {
            return Err(MediaError::DecryptionFailed {
                reason: "truncated ciphertext".into(),
            });
        };
        if self.pending.len() < AES_BLOCK_LEN {
            return Err(MediaError::DecryptionFailed {
                reason: "truncated ciphertext".into(),
            });
        }

        let mut block = [0u8; AES_BLOCK_LEN];
        block.copy_from_slice(&self.pending[..AES_BLOCK_LEN]);
        dec.decrypt_block_mut(Block::from_mut_slice(&mut block));

        let pad = block[AES_BLOCK_LEN - 1] as usize;
        if pad == 0 || pad > AES_BLOCK_LEN || block[AES_BLOCK_LEN - pad..].iter().any(|&b| b != pad as u8)
        {
            return Err(MediaError::DecryptionFailed {
                reason: "bad PKCS#7 padding".into(),
            });
        }

        let plain = block[..AES_BLOCK_LEN - pad].to_vec();
        Ok(self.trim(plain))
    }

    /// Intersect decrypted output with the requested plaintext range.
    fn trim(&mut self, plain: Vec<u8>) -> Vec<u8> {
        let start = self.pos;
        let end = start + plain.len() as u64;
        self.pos = end;

        let lo = self.plan.start_byte.max(start);
        let hi = match self.plan.end_byte {
            Some(e) => e.min(end),
            None => end,
        };
        if lo >= hi {
            return Vec::new();
        }
        if lo == start && hi == end {
            return plain;
        }
        plain[(lo - start) as usize..(hi - start) as usize].to_vec()
    }
}

/// Decrypt a complete in-memory object (`ciphertext || mac`).
///
/// When `verify_mac` is set, the trailing ten bytes are checked against
/// `HMAC-SHA256(mac_key, iv || ciphertext)` before any decryption
/// happens.
pub fn decrypt_media(
    data: &[u8],
    keys: &MediaKeys,
    verify_mac: bool,
) -> Result<Vec<u8>, MediaError> {
    if data.len() < AES_BLOCK_LEN + MEDIA_MAC_LEN {
        return Err(MediaError::DecryptionFailed {
            reason: "downloaded data too short".into(),
        });
    }
    let (ciphertext, mac) = data.split_at(data.len() - MEDIA_MAC_LEN);
    if ciphertext.len() % AES_BLOCK_LEN != 0 {
        return Err(MediaError::DecryptionFailed {
            reason: "ciphertext is not block-aligned".into(),
        });
    }

    if verify_mac {
        let mut hmac =
            HmacSha256::new_from_slice(keys.mac_key.as_ref()).map_err(|e| {
                MediaError::DecryptionFailed {
                    reason: format!("mac init: {e}"),
                }
            })?;
        hmac.update(keys.iv.as_ref());
        hmac.update(ciphertext);
        let expected = hmac.finalize().into_bytes();
        if mac.ct_eq(&expected[..MEDIA_MAC_LEN]).unwrap_u8() != 1 {
            return Err(MediaError::MacMismatch);
        }
    }

    let mut buf = ciphertext.to_vec();
    let dec = Aes256CbcDec::new_from_slices(keys.cipher_key.as_ref(), keys.iv.as_ref()).map_err(
        |e| MediaError::DecryptionFailed {
            reason: format!("cipher init: {e}"),
        },
    )?;
    let plain = dec
        .decrypt_padded_mut::<Pkcs7>(&mut buf)
        .map_err(|_| MediaError::DecryptionFailed {
            reason: "bad PKCS#7 padding".into(),
        })?;
    Ok(plain.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encrypt::encrypt_media;
    use crate::keys::MediaType;

    fn encrypted_fixture(plaintext: &[u8]) -> (Vec<u8>, MediaKeys) {
        let payload = encrypt_media(plaintext, MediaType::Image).unwrap();
        let keys = MediaKeys::derive(payload.summary.media_key.as_ref(), MediaType::Image).unwrap();
        (payload.data, keys)
    }

    /// Run the streaming decryptor over `wire` in chunks of `chunk_len`.
    fn stream_decrypt(
        wire: &[u8],
        keys: &MediaKeys,
        plan: RangePlan,
        chunk_len: usize,
    ) -> Result<Vec<u8>, MediaError> {
        let mut dec = MediaDecryptor::new(keys, plan)?;
        let mut out = Vec::new();
        for chunk in wire.chunks(chunk_len.max(1)) {
            out.extend(dec.update(chunk)?);
        }
        out.extend(dec.finalize()?);
        Ok(out)
    }

    #[test]
    fn whole_plan_has_no_range_header() {
        let plan = RangePlan::whole();
        assert!(!plan.is_ranged());
        assert_eq!(plan.range_header(), None);
        assert!(!plan.first_block_is_iv);
        assert_eq!(plan.plaintext_offset, 0);
    }

    #[test]
    fn mid_block_range_fetches_the_previous_block_as_iv() {
        // Bytes [20, 40) of the plaintext: the block holding byte 20
        // starts at 16, so the fetch starts one block earlier at 0 and
        // that first block is the IV.
        let plan = RangePlan::new(20, Some(40));
        assert_eq!(plan.fetch_start, 0);
        assert_eq!(plan.fetch_end, Some(48));
        assert!(plan.first_block_is_iv);
        assert_eq!(plan.plaintext_offset, 16);
        assert_eq!(plan.range_header().unwrap(), "bytes=0-48");
    }

    #[test]
    fn block_boundary_start_uses_the_preceding_block() {
        let plan = RangePlan::new(32, None);
        assert_eq!(plan.fetch_start, 16);
        assert_eq!(plan.fetch_end, None);
        assert!(plan.first_block_is_iv);
        assert_eq!(plan.plaintext_offset, 32);
        assert_eq!(plan.range_header().unwrap(), "bytes=16-");
    }

    #[test]
    fn first_block_start_uses_the_derived_iv() {
        let plan = RangePlan::new(5, Some(10));
        assert_eq!(plan.fetch_start, 0);
        assert_eq!(plan.fetch_end, Some(16));
        assert!(!plan.first_block_is_iv);
        assert_eq!(plan.plaintext_offset, 0);
    }

    #[test]
    fn whole_stream_roundtrip_at_odd_chunk_sizes() {
        let plaintext: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
        let (wire, keys) = encrypted_fixture(&plaintext);

        for chunk_len in [1, 7, 16, 26, 64, wire.len()] {
            let out = stream_decrypt(&wire, &keys, RangePlan::whole(), chunk_len).unwrap();
            assert_eq!(out, plaintext, "chunk_len={chunk_len}");
        }
    }

    #[test]
    fn empty_plaintext_roundtrip() {
        let (wire, keys) = encrypted_fixture(b"");
        let out = stream_decrypt(&wire, &keys, RangePlan::whole(), 5).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn ranged_decrypt_yields_the_exact_plaintext_slice() {
        let plaintext: Vec<u8> = (0..100u8).collect();
        let (wire, keys) = encrypted_fixture(&plaintext);

        for (start, end) in [
            (0u64, 100u64),
            (20, 40),
            (16, 32),
            (5, 95),
            (0, 1),
            (99, 100),
            (17, 18),
        ] {
            let plan = RangePlan::new(start, Some(end));
            let fetch_end = (plan.fetch_end.unwrap() as usize).min(wire.len());
            let fetched = &wire[plan.fetch_start as usize..fetch_end];
            let out = stream_decrypt(fetched, &keys, plan, 9).unwrap();
            assert_eq!(
                out,
                &plaintext[start as usize..end as usize],
                "range [{start}, {end})"
            );
        }
    }

    #[test]
    fn open_ended_range_reads_to_the_end() {
        let plaintext: Vec<u8> = (0..100u8).collect();
        let (wire, keys) = encrypted_fixture(&plaintext);

        let plan = RangePlan::new(20, None);
        let fetched = &wire[plan.fetch_start as usize..];
        let out = stream_decrypt(fetched, &keys, plan, 13).unwrap();
        assert_eq!(out, &plaintext[20..]);
    }

    #[test]
    fn full_range_behaves_like_whole_file() {
        let plaintext: Vec<u8> = (0..100u8).collect();
        let (wire, keys) = encrypted_fixture(&plaintext);

        let plan = RangePlan::new(0, Some(100));
        let fetch_end = (plan.fetch_end.unwrap() as usize).min(wire.len());
        let out = stream_decrypt(&wire[..fetch_end], &keys, plan, 32).unwrap();
        assert_eq!(out, plaintext);
    }

    #[test]
    fn corrupted_final_block_fails_padding_validation() {
        let plaintext = vec![0x42u8; 50];
        let (mut wire, keys) = encrypted_fixture(&plaintext);
        let last_ct_byte = wire.len() - MEDIA_MAC_LEN - 1;
        wire[last_ct_byte] ^= 0xFF;

        let result = stream_decrypt(&wire, &keys, RangePlan::whole(), 16);
        assert!(matches!(
            result,
            Err(MediaError::DecryptionFailed { .. })
        ));
    }

    #[test]
    fn truncated_stream_is_rejected() {
        let (wire, keys) = encrypted_fixture(b"some plaintext");
        let result = stream_decrypt(&wire[..5], &keys, RangePlan::whole(), 2);
        assert!(matches!(result, Err(MediaError::DecryptionFailed { .. })));
    }

    #[test]
    fn buffered_decrypt_verifies_the_mac() {
        let plaintext = b"verify me".to_vec();
        let (wire, keys) = encrypted_fixture(&plaintext);

        assert_eq!(decrypt_media(&wire, &keys, true).unwrap(), plaintext);

        let mut bad_mac = wire.clone();
        let last = bad_mac.len() - 1;
        bad_mac[last] ^= 0x01;
        assert!(matches!(
            decrypt_media(&bad_mac, &keys, true),
            Err(MediaError::MacMismatch)
        ));

        let mut bad_ct = wire.clone();
        bad_ct[0] ^= 0x01;
        assert!(matches!(
            decrypt_media(&bad_ct, &keys, true),
            Err(MediaError::MacMismatch)
        ));

        // Without verification the tampered MAC goes unnoticed
        assert_eq!(decrypt_media(&bad_mac, &keys, false).unwrap(), plaintext);
    }

    #[test]
    fn buffered_decrypt_rejects_short_input() {
        let (_, keys) = encrypted_fixture(b"x");
        assert!(matches!(
            decrypt_media(&[0u8; 9], &keys, false),
            Err(MediaError::DecryptionFailed { .. })
        ));
    }
}
