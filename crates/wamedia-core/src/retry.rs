//! The media retry protocol.
//!
//! When a media URL has gone stale the client asks the original sender
//! to re-upload: it sends a `server-error` receipt whose payload is an
//! AES-256-GCM-encrypted [`ServerErrorReceipt`], keyed by a subkey of
//! the original media key. The peer answers with a notification node
//! carrying either an error code or a GCM-encrypted
//! [`MediaRetryNotification`] with fresh download parameters.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use hkdf::Hkdf;
use prost::Message;
use rand::RngCore;
use sha2::Sha256;

use crate::error::MediaError;
use crate::node::BinaryNode;
use crate::secret::Secret;

/// HKDF info for the retry-specific subkey.
const RETRY_KEY_INFO: &[u8] = b"WhatsApp Media Retry Notification";

/// GCM nonce length used by the retry handshake.
const RETRY_IV_LEN: usize = 12;

/// Identifies the message whose media is being re-requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageKey {
    /// Stanza id of the original message.
    pub id: String,
    /// Chat the message belongs to.
    pub remote_jid: String,
    /// Whether the requester sent the original message.
    pub from_me: bool,
    /// Group participant that sent it, if any.
    pub participant: Option<String>,
}

/// Receipt payload sent to the peer.
#[derive(Clone, PartialEq, Message)]
pub struct ServerErrorReceipt {
    /// Stanza id of the message whose media vanished.
    #[prost(string, optional, tag = "1")]
    pub stanza_id: Option<String>,
}

/// Notification payload received from the peer after a re-upload.
#[derive(Clone, PartialEq, Message)]
pub struct MediaRetryNotification {
    /// Stanza id this notification answers.
    #[prost(string, optional, tag = "1")]
    pub stanza_id: Option<String>,
    /// Fresh direct path for the re-uploaded object.
    #[prost(string, optional, tag = "2")]
    pub direct_path: Option<String>,
    /// Outcome of the retry on the peer's side.
    #[prost(enumeration = "RetryResult", optional, tag = "3")]
    pub result: Option<i32>,
}

/// Outcome of a media retry, as reported by the peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum RetryResult {
    /// The peer hit an unspecified error.
    GeneralError = 0,
    /// The media was re-uploaded.
    Success = 1,
    /// The peer no longer has the media.
    NotFound = 2,
    /// The peer could not decrypt the request.
    DecryptionError = 3,
}

impl RetryResult {
    /// HTTP-like status code for this outcome.
    pub fn status_code(self) -> u16 {
        match self {
            Self::Success => 200,
            Self::NotFound => 404,
            Self::DecryptionError => 412,
            Self::GeneralError => 418,
        }
    }
}

/// Encrypted payload extracted from a retry response node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPayload {
    /// GCM ciphertext (tag appended).
    pub ciphertext: Vec<u8>,
    /// 12-byte GCM nonce.
    pub iv: Vec<u8>,
}

/// What a retry response node resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// An encrypted notification to pass to [`decrypt_retry_data`].
    Payload(RetryPayload),
    /// The peer reported an error.
    Error {
        /// HTTP-like status code of the reported error.
        status: u16,
    },
}

/// Decoded retry response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRetryEvent {
    /// Which message the response refers to.
    pub key: MessageKey,
    /// Payload or reported error.
    pub outcome: RetryOutcome,
}

/// Errors of the retry protocol.
#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    /// Key derivation failed.
    #[error(transparent)]
    Media(#[from] MediaError),

    /// The receipt payload could not be encrypted.
    #[error("retry receipt encryption failed")]
    EncryptFailed,

    /// The notification payload could not be decrypted.
    #[error("retry notification decryption failed")]
    DecryptFailed,

    /// The response node has no `rmr` child.
    #[error("retry response is missing the rmr node")]
    MissingRmr,

    /// The response node has no usable encrypted payload.
    #[error("retry response is missing the encrypted payload")]
    MissingPayload,

    /// The notification protobuf could not be decoded.
    #[error(transparent)]
    Proto(#[from] prost::DecodeError),
}

impl RetryError {
    /// HTTP-like status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Media(e) => e.status_code(),
            Self::MissingPayload => 404,
            Self::MissingRmr | Self::Proto(_) => 400,
            Self::EncryptFailed | Self::DecryptFailed => 500,
        }
    }
}

/// Derive the retry-specific subkey from a media key.
pub fn derive_retry_key(media_key: &[u8]) -> Result<Secret<[u8; 32]>, MediaError> {
    if media_key.len() != crate::keys::MEDIA_KEY_LEN {
        return Err(MediaError::InvalidMediaKey(media_key.len()));
    }
    let hk = Hkdf::<Sha256>::new(None, media_key);
    let mut key = [0u8; 32];
    hk.expand(RETRY_KEY_INFO, &mut key)
        .map_err(|e| MediaError::EncryptionFailed {
            reason: format!("HKDF expansion failed: {e}"),
        })?;
    Ok(Secret::new(key))
}

/// Reduce a JID to its bare user form (device suffix stripped, legacy
/// server name rewritten).
pub fn normalize_jid(jid: &str) -> String {
    match jid.split_once('@') {
        Some((user, server)) => {
            let user = user.split(':').next().unwrap_or(user);
            let server = if server == "c.us" {
                "s.whatsapp.net"
            } else {
                server
            };
            format!("{user}@{server}")
        }
        None => jid.to_string(),
    }
}

/// Build the `server-error` receipt node asking the peer to re-upload.
pub fn encrypt_retry_request(
    msg_key: &MessageKey,
    media_key: &[u8],
    me_jid: &str,
) -> Result<BinaryNode, RetryError> {
    let retry_key = derive_retry_key(media_key)?;

    let mut iv = [0u8; RETRY_IV_LEN];
    rand::rng().fill_bytes(&mut iv);

    let receipt = ServerErrorReceipt {
        stanza_id: Some(msg_key.id.clone()),
    };
    let plaintext = receipt.encode_to_vec();

    let cipher =
        Aes256Gcm::new_from_slice(retry_key.as_ref()).map_err(|_| RetryError::EncryptFailed)?;
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: &plaintext,
                aad: msg_key.id.as_bytes(),
            },
        )
        .map_err(|_| RetryError::EncryptFailed)?;

    let mut rmr = BinaryNode::new("rmr")
        .with_attr("jid", msg_key.remote_jid.clone())
        .with_attr("from_me", if msg_key.from_me { "true" } else { "false" });
    if let Some(participant) = &msg_key.participant {
        rmr = rmr.with_attr("participant", participant.clone());
    }

    Ok(BinaryNode::new("receipt")
        .with_attr("id", msg_key.id.clone())
        .with_attr("to", normalize_jid(me_jid))
        .with_attr("type", "server-error")
        .with_children(vec![
            BinaryNode::new("encrypt").with_children(vec![
                BinaryNode::new("enc_p").with_bytes(ciphertext),
                BinaryNode::new("enc_iv").with_bytes(iv.to_vec()),
            ]),
            rmr,
        ]))
}

fn status_for_error_code(code: &str) -> u16 {
    match code {
        "success" => 200,
        "decryption-error" => 412,
        "not-found" => 404,
        "general-error" => 418,
        other => other
            .parse::<i32>()
            .ok()
            .and_then(|value| RetryResult::try_from(value).ok())
            .map(RetryResult::status_code)
            .unwrap_or(418),
    }
}

/// Decode a retry response node into a [`MediaRetryEvent`].
pub fn decode_retry_node(node: &BinaryNode) -> Result<MediaRetryEvent, RetryError> {
    let rmr = node.child("rmr").ok_or(RetryError::MissingRmr)?;
    let key = MessageKey {
        id: node.attr("id").unwrap_or_default().to_string(),
        remote_jid: rmr.attr("jid").unwrap_or_default().to_string(),
        from_me: rmr.attr("from_me") == Some("true"),
        participant: rmr.attr("participant").map(str::to_string),
    };

    if let Some(error) = node.child("error") {
        let status = error.attr("code").map(status_for_error_code).unwrap_or(418);
        tracing::debug!(
            target: "wamedia_core::retry",
            id = %key.id,
            status,
            "peer reported media retry error",
        );
        return Ok(MediaRetryEvent {
            key,
            outcome: RetryOutcome::Error { status },
        });
    }

    let encrypt = node.child("encrypt").ok_or(RetryError::MissingPayload)?;
    let ciphertext = encrypt
        .child("enc_p")
        .and_then(BinaryNode::bytes)
        .ok_or(RetryError::MissingPayload)?
        .to_vec();
    let iv = encrypt
        .child("enc_iv")
        .and_then(BinaryNode::bytes)
        .ok_or(RetryError::MissingPayload)?
        .to_vec();

    Ok(MediaRetryEvent {
        key,
        outcome: RetryOutcome::Payload(RetryPayload { ciphertext, iv }),
    })
}

/// Decrypt the notification payload of a retry response.
pub fn decrypt_retry_data(
    payload: &RetryPayload,
    media_key: &[u8],
    msg_id: &str,
) -> Result<MediaRetryNotification, RetryError> {
    if payload.iv.len() != RETRY_IV_LEN {
        return Err(RetryError::DecryptFailed);
    }
    let retry_key = derive_retry_key(media_key)?;
    let cipher =
        Aes256Gcm::new_from_slice(retry_key.as_ref()).map_err(|_| RetryError::DecryptFailed)?;
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(&payload.iv),
            Payload {
                msg: &payload.ciphertext,
                aad: msg_id.as_bytes(),
            },
        )
        .map_err(|_| RetryError::DecryptFailed)?;
    Ok(MediaRetryNotification::decode(plaintext.as_slice())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_media_key;

    fn test_key() -> MessageKey {
        MessageKey {
            id: "3EB0F4A2C9D1".to_string(),
            remote_jid: "9876543210@s.whatsapp.net".to_string(),
            from_me: true,
            participant: None,
        }
    }

    #[test]
    fn receipt_node_has_the_expected_shape() {
        let media_key = generate_media_key();
        let msg_key = test_key();
        let node =
            encrypt_retry_request(&msg_key, media_key.as_ref(), "1234:5@s.whatsapp.net").unwrap();

        assert_eq!(node.tag, "receipt");
        assert_eq!(node.attr("id"), Some("3EB0F4A2C9D1"));
        assert_eq!(node.attr("to"), Some("1234@s.whatsapp.net"));
        assert_eq!(node.attr("type"), Some("server-error"));

        let encrypt = node.child("encrypt").unwrap();
        let enc_p = encrypt.child("enc_p").and_then(BinaryNode::bytes).unwrap();
        let enc_iv = encrypt.child("enc_iv").and_then(BinaryNode::bytes).unwrap();
        // GCM appends a 16-byte tag to the encoded receipt
        let receipt_len = ServerErrorReceipt {
            stanza_id: Some(msg_key.id.clone()),
        }
        .encode_to_vec()
        .len();
        assert_eq!(enc_p.len(), receipt_len + 16);
        assert_eq!(enc_iv.len(), 12);

        let rmr = node.child("rmr").unwrap();
        assert_eq!(rmr.attr("jid"), Some("9876543210@s.whatsapp.net"));
        assert_eq!(rmr.attr("from_me"), Some("true"));
        assert_eq!(rmr.attr("participant"), None);
    }

    #[test]
    fn participant_is_carried_when_present() {
        let media_key = generate_media_key();
        let msg_key = MessageKey {
            participant: Some("5550001111@s.whatsapp.net".to_string()),
            from_me: false,
            ..test_key()
        };
        let node =
            encrypt_retry_request(&msg_key, media_key.as_ref(), "1234@s.whatsapp.net").unwrap();
        let rmr = node.child("rmr").unwrap();
        assert_eq!(rmr.attr("participant"), Some("5550001111@s.whatsapp.net"));
        assert_eq!(rmr.attr("from_me"), Some("false"));
    }

    #[test]
    fn response_roundtrip_recovers_the_notification() {
        let media_key = generate_media_key();
        let msg_key = test_key();

        // Simulate the peer: encrypt a notification under the same
        // retry subkey and wrap it the way the server delivers it
        let notification = MediaRetryNotification {
            stanza_id: Some(msg_key.id.clone()),
            direct_path: Some("/v/t62.7118-24/fresh.enc".to_string()),
            result: Some(RetryResult::Success as i32),
        };
        let retry_key = derive_retry_key(media_key.as_ref()).unwrap();
        let cipher = Aes256Gcm::new_from_slice(retry_key.as_ref()).unwrap();
        let iv = [9u8; 12];
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&iv),
                Payload {
                    msg: &notification.encode_to_vec(),
                    aad: msg_key.id.as_bytes(),
                },
            )
            .unwrap();

        let response = BinaryNode::new("receipt")
            .with_attr("id", msg_key.id.clone())
            .with_children(vec![
                BinaryNode::new("rmr")
                    .with_attr("jid", msg_key.remote_jid.clone())
                    .with_attr("from_me", "true"),
                BinaryNode::new("encrypt").with_children(vec![
                    BinaryNode::new("enc_p").with_bytes(ciphertext),
                    BinaryNode::new("enc_iv").with_bytes(iv.to_vec()),
                ]),
            ]);

        let event = decode_retry_node(&response).unwrap();
        assert_eq!(event.key.id, msg_key.id);
        assert_eq!(event.key.remote_jid, msg_key.remote_jid);
        assert!(event.key.from_me);

        let RetryOutcome::Payload(payload) = event.outcome else {
            panic!("expected an encrypted payload");
        };
        let decoded = decrypt_retry_data(&payload, media_key.as_ref(), &msg_key.id).unwrap();
        assert_eq!(decoded, notification);
        assert_eq!(decoded.result(), RetryResult::Success);
    }

    #[test]
    fn wrong_aad_fails_decryption() {
        let media_key = generate_media_key();
        let msg_key = test_key();
        let node =
            encrypt_retry_request(&msg_key, media_key.as_ref(), "1234@s.whatsapp.net").unwrap();

        let encrypt = node.child("encrypt").unwrap();
        let payload = RetryPayload {
            ciphertext: encrypt.child("enc_p").and_then(BinaryNode::bytes).unwrap().to_vec(),
            iv: encrypt.child("enc_iv").and_then(BinaryNode::bytes).unwrap().to_vec(),
        };

        let err = decrypt_retry_data(&payload, media_key.as_ref(), "different-id").unwrap_err();
        assert!(matches!(err, RetryError::DecryptFailed));
    }

    #[test]
    fn error_child_maps_to_status_codes() {
        for (code, status) in [
            ("success", 200u16),
            ("decryption-error", 412),
            ("not-found", 404),
            ("general-error", 418),
            ("2", 404),
            ("3", 412),
            ("gibberish", 418),
        ] {
            let node = BinaryNode::new("receipt")
                .with_attr("id", "X")
                .with_children(vec![
                    BinaryNode::new("rmr").with_attr("jid", "j@s.whatsapp.net"),
                    BinaryNode::new("error").with_attr("code", code),
                ]);
            let event = decode_retry_node(&node).unwrap();
            assert_eq!(
                event.outcome,
                RetryOutcome::Error { status },
                "code {code}"
            );
        }
    }

    #[test]
    fn missing_rmr_is_rejected() {
        let node = BinaryNode::new("receipt").with_attr("id", "X");
        assert!(matches!(
            decode_retry_node(&node),
            Err(RetryError::MissingRmr)
        ));
    }

    #[test]
    fn missing_payload_reports_not_found() {
        let node = BinaryNode::new("receipt")
            .with_attr("id", "X")
            .with_children(vec![
                BinaryNode::new("rmr").with_attr("jid", "j@s.whatsapp.net"),
                // encrypt node present but enc_iv missing
                BinaryNode::new("encrypt")
                    .with_children(vec![BinaryNode::new("enc_p").with_bytes(vec![1, 2, 3])]),
            ]);
        let err = decode_retry_node(&node).unwrap_err();
        assert!(matches!(err, RetryError::MissingPayload));
        assert_eq!(err.status_code(), 404);
    }

    #[test]
    fn retry_result_status_mapping() {
        assert_eq!(RetryResult::Success.status_code(), 200);
        assert_eq!(RetryResult::DecryptionError.status_code(), 412);
        assert_eq!(RetryResult::NotFound.status_code(), 404);
        assert_eq!(RetryResult::GeneralError.status_code(), 418);
    }

    #[test]
    fn jid_normalization() {
        assert_eq!(
            normalize_jid("1234:5@s.whatsapp.net"),
            "1234@s.whatsapp.net"
        );
        assert_eq!(normalize_jid("1234@s.whatsapp.net"), "1234@s.whatsapp.net");
        assert_eq!(normalize_jid("1234@c.us"), "1234@s.whatsapp.net");
        assert_eq!(normalize_jid("no-server"), "no-server");
    }

    #[test]
    fn malformed_iv_is_rejected_without_panicking() {
        let media_key = generate_media_key();
        let payload = RetryPayload {
            ciphertext: vec![0u8; 24],
            iv: vec![0u8; 7],
        };
        assert!(matches!(
            decrypt_retry_data(&payload, media_key.as_ref(), "id"),
            Err(RetryError::DecryptFailed)
        ));
    }

    #[test]
    fn retry_key_requires_a_full_media_key() {
        assert!(matches!(
            derive_retry_key(&[0u8; 8]),
            Err(MediaError::InvalidMediaKey(8))
        ));
    }
}
