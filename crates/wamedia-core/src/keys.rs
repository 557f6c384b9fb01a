//! Per-media key derivation.
//!
//! A 32-byte media key is expanded with HKDF-SHA256 (no salt) into 112
//! bytes of keying material: the CBC IV, the AES-256 cipher key, the
//! HMAC-SHA256 MAC key, and a reserved reference key. The HKDF info
//! string is `"WhatsApp <Label> Keys"` where the label depends on the
//! media type; the label table is part of the protocol ABI.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::MediaError;
use crate::secret::Secret;

/// Required length of a raw media key.
pub const MEDIA_KEY_LEN: usize = 32;

/// Total HKDF expansion length: iv(16) + cipher(32) + mac(32) + ref(32).
const EXPANDED_LEN: usize = 112;

/// Media kinds carried by the protocol.
///
/// Each kind determines the HKDF info label and the server upload path
/// segment. Newsletter variants share labels with their base kind but
/// upload through the newsletter path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    /// Still image.
    Image,
    /// Video.
    Video,
    /// Voice note or audio file.
    Audio,
    /// Arbitrary document.
    Document,
    /// Sticker (shares keying with images).
    Sticker,
    /// Thumbnail of an image.
    ThumbnailImage,
    /// Thumbnail of a video.
    ThumbnailVideo,
    /// Product catalog image.
    ProductImage,
    /// Newsletter image.
    NewsletterImage,
    /// Newsletter video.
    NewsletterVideo,
    /// Newsletter audio.
    NewsletterAudio,
    /// Newsletter document.
    NewsletterDocument,
    /// Push-to-video note (shares keying with videos).
    Ptv,
}

impl MediaType {
    /// The `<Label>` part of the HKDF info string.
    pub fn hkdf_label(&self) -> &'static str {
        match self {
            Self::Image | Self::Sticker | Self::NewsletterImage => "Image",
            Self::Video | Self::Ptv | Self::NewsletterVideo => "Video",
            Self::Audio | Self::NewsletterAudio => "Audio",
            Self::Document | Self::NewsletterDocument => "Document",
            Self::ThumbnailImage => "Image Thumbnail",
            Self::ThumbnailVideo => "Video Thumbnail",
            Self::ProductImage => "Product Image",
        }
    }

    /// Full HKDF info string, e.g. `WhatsApp Image Keys`.
    pub fn hkdf_info(&self) -> String {
        format!("WhatsApp {} Keys", self.hkdf_label())
    }

    /// Server upload path segment for this kind.
    ///
    /// Newsletter variants return their base path; the dispatcher
    /// rewrites `/mms/<x>` to `/newsletter/newsletter-<x>` for them.
    pub fn upload_path(&self) -> &'static str {
        match self {
            Self::Image | Self::Sticker | Self::ThumbnailImage | Self::NewsletterImage => {
                "/mms/image"
            }
            Self::Video | Self::Ptv | Self::ThumbnailVideo | Self::NewsletterVideo => "/mms/video",
            Self::Audio | Self::NewsletterAudio => "/mms/audio",
            Self::Document | Self::NewsletterDocument => "/mms/document",
            Self::ProductImage => "/product/image",
        }
    }

    /// Whether this kind uploads through the newsletter path.
    pub fn is_newsletter(&self) -> bool {
        matches!(
            self,
            Self::NewsletterImage
                | Self::NewsletterVideo
                | Self::NewsletterAudio
                | Self::NewsletterDocument
        )
    }
}

/// Keying material derived from one media key.
///
/// Scoped to a single encrypt or decrypt operation; all fields are
/// zeroized on drop.
#[derive(Debug, Clone)]
pub struct MediaKeys {
    /// CBC IV for the whole object.
    pub iv: Secret<[u8; 16]>,
    /// AES-256 cipher key.
    pub cipher_key: Secret<[u8; 32]>,
    /// HMAC-SHA256 key.
    pub mac_key: Secret<[u8; 32]>,
    /// Reserved reference key (unused by the pipelines, part of the
    /// 112-byte expansion).
    pub ref_key: Secret<[u8; 32]>,
}

impl MediaKeys {
    /// Derive the per-object keys from a 32-byte media key.
    ///
    /// Deterministic: the same key and media type always produce the
    /// same expansion.
    pub fn derive(media_key: &[u8], media_type: MediaType) -> Result<Self, MediaError> {
        if media_key.len() != MEDIA_KEY_LEN {
            return Err(MediaError::InvalidMediaKey(media_key.len()));
        }

        let hk = Hkdf::<Sha256>::new(None, media_key);
        let mut okm = [0u8; EXPANDED_LEN];
        hk.expand(media_type.hkdf_info().as_bytes(), &mut okm)
            .map_err(|e| MediaError::EncryptionFailed {
                reason: format!("HKDF expansion failed: {e}"),
            })?;

        let mut iv = [0u8; 16];
        let mut cipher_key = [0u8; 32];
        let mut mac_key = [0u8; 32];
        let mut ref_key = [0u8; 32];
        iv.copy_from_slice(&okm[0..16]);
        cipher_key.copy_from_slice(&okm[16..48]);
        mac_key.copy_from_slice(&okm[48..80]);
        ref_key.copy_from_slice(&okm[80..112]);
        okm.zeroize();

        Ok(Self {
            iv: Secret::new(iv),
            cipher_key: Secret::new(cipher_key),
            mac_key: Secret::new(mac_key),
            ref_key: Secret::new(ref_key),
        })
    }
}

/// Generate a fresh random 32-byte media key.
pub fn generate_media_key() -> Secret<[u8; MEDIA_KEY_LEN]> {
    let mut key = [0u8; MEDIA_KEY_LEN];
    rand::rng().fill_bytes(&mut key);
    Secret::new(key)
}

/// Parse a media key from its base64 boundary representation.
///
/// Accepts an optional `data:;base64,` prefix, which some callers hand
/// through verbatim.
pub fn media_key_from_base64(encoded: &str) -> Result<Secret<[u8; MEDIA_KEY_LEN]>, MediaError> {
    let encoded = encoded.strip_prefix("data:;base64,").unwrap_or(encoded);
    let mut decoded = STANDARD.decode(encoded)?;
    if decoded.len() != MEDIA_KEY_LEN {
        let len = decoded.len();
        decoded.zeroize();
        return Err(MediaError::InvalidMediaKey(len));
    }
    let mut key = [0u8; MEDIA_KEY_LEN];
    key.copy_from_slice(&decoded);
    decoded.zeroize();
    Ok(Secret::new(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let media_key = [0u8; 32];
        let a = MediaKeys::derive(&media_key, MediaType::Image).unwrap();
        let b = MediaKeys::derive(&media_key, MediaType::Image).unwrap();
        assert_eq!(a.iv, b.iv);
        assert_eq!(a.cipher_key, b.cipher_key);
        assert_eq!(a.mac_key, b.mac_key);
        assert_eq!(a.ref_key, b.ref_key);
    }

    #[test]
    fn derived_keys_are_distinct_sections_of_the_expansion() {
        let media_key = [7u8; 32];
        let keys = MediaKeys::derive(&media_key, MediaType::Video).unwrap();
        assert_ne!(keys.cipher_key, keys.mac_key);
        assert_ne!(keys.cipher_key, keys.ref_key);
        assert_ne!(keys.iv.as_ref()[..], keys.cipher_key.as_ref()[..16]);
    }

    #[test]
    fn media_types_sharing_a_label_derive_identical_keys() {
        let media_key = [3u8; 32];
        let image = MediaKeys::derive(&media_key, MediaType::Image).unwrap();
        let sticker = MediaKeys::derive(&media_key, MediaType::Sticker).unwrap();
        let newsletter = MediaKeys::derive(&media_key, MediaType::NewsletterImage).unwrap();
        assert_eq!(image.cipher_key, sticker.cipher_key);
        assert_eq!(image.cipher_key, newsletter.cipher_key);

        let video = MediaKeys::derive(&media_key, MediaType::Video).unwrap();
        assert_ne!(image.cipher_key, video.cipher_key);
    }

    #[test]
    fn hkdf_info_strings_are_exact() {
        assert_eq!(MediaType::Image.hkdf_info(), "WhatsApp Image Keys");
        assert_eq!(MediaType::Sticker.hkdf_info(), "WhatsApp Image Keys");
        assert_eq!(MediaType::Video.hkdf_info(), "WhatsApp Video Keys");
        assert_eq!(MediaType::Ptv.hkdf_info(), "WhatsApp Video Keys");
        assert_eq!(MediaType::Audio.hkdf_info(), "WhatsApp Audio Keys");
        assert_eq!(MediaType::Document.hkdf_info(), "WhatsApp Document Keys");
        assert_eq!(
            MediaType::ThumbnailImage.hkdf_info(),
            "WhatsApp Image Thumbnail Keys"
        );
        assert_eq!(
            MediaType::ThumbnailVideo.hkdf_info(),
            "WhatsApp Video Thumbnail Keys"
        );
        assert_eq!(
            MediaType::ProductImage.hkdf_info(),
            "WhatsApp Product Image Keys"
        );
    }

    #[test]
    fn upload_paths_follow_the_media_path_map() {
        assert_eq!(MediaType::Image.upload_path(), "/mms/image");
        assert_eq!(MediaType::Sticker.upload_path(), "/mms/image");
        assert_eq!(MediaType::Video.upload_path(), "/mms/video");
        assert_eq!(MediaType::Audio.upload_path(), "/mms/audio");
        assert_eq!(MediaType::Document.upload_path(), "/mms/document");
        assert_eq!(MediaType::ProductImage.upload_path(), "/product/image");
        assert!(MediaType::NewsletterVideo.is_newsletter());
        assert!(!MediaType::Video.is_newsletter());
    }

    #[test]
    fn rejects_wrong_sized_keys() {
        for len in [0usize, 16, 31, 33, 64] {
            let key = vec![0u8; len];
            let result = MediaKeys::derive(&key, MediaType::Image);
            assert!(
                matches!(result, Err(MediaError::InvalidMediaKey(l)) if l == len),
                "expected InvalidMediaKey for length {len}"
            );
        }
    }

    #[test]
    fn generated_keys_are_random() {
        let a = generate_media_key();
        let b = generate_media_key();
        assert_ne!(a, b);
        assert_ne!(*a, [0u8; 32]);
    }

    #[test]
    fn base64_media_key_parsing() {
        let raw = [0x5Au8; 32];
        let encoded = STANDARD.encode(raw);

        let parsed = media_key_from_base64(&encoded).unwrap();
        assert_eq!(*parsed, raw);

        // The data-URL prefix is stripped on the boundary
        let prefixed = format!("data:;base64,{encoded}");
        let parsed = media_key_from_base64(&prefixed).unwrap();
        assert_eq!(*parsed, raw);

        let short = STANDARD.encode([1u8; 8]);
        assert!(matches!(
            media_key_from_base64(&short),
            Err(MediaError::InvalidMediaKey(8))
        ));

        assert!(matches!(
            media_key_from_base64("not base64!!"),
            Err(MediaError::MediaKeyEncoding(_))
        ));
    }
}
