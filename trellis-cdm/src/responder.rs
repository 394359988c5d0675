//! Reference implementation of the server half of the license exchange.
//!
//! Speaks the same message set as [`crate::codec::WidevineCodec`] against a
//! known device public key. It exists for the integration test suites and
//! for running a local development license server; nothing in the download
//! path depends on it.

use crate::{
    crypto,
    error::{CdmError, CdmResult},
    proto::{
        KeyContainer, LicenseGrant, LicenseRequest, MESSAGE_TYPE_LICENSE_GRANT,
        MESSAGE_TYPE_LICENSE_REQUEST, SignedMessage,
    },
    types::KeyType,
};
use prost::Message;
use rand::RngCore;
use rsa::RsaPublicKey;
use std::time::{SystemTime, UNIX_EPOCH};

pub struct Responder {
    device_key: RsaPublicKey,
    keys: Vec<([u8; 16], [u8; 16], KeyType)>,
}

impl Responder {
    pub fn new(device_key: RsaPublicKey) -> Self {
        Self {
            device_key,
            keys: Vec::new(),
        }
    }

    /// Serve a content key for `kid`.
    pub fn key(self, kid: [u8; 16], value: [u8; 16]) -> Self {
        self.key_of(kid, value, KeyType::Content)
    }

    pub fn key_of(mut self, kid: [u8; 16], value: [u8; 16], kind: KeyType) -> Self {
        self.keys.push((kid, value, kind));
        self
    }

    /// Answer a challenge with a well-formed, signed grant carrying every
    /// configured key.
    pub fn respond(&self, challenge: &[u8]) -> CdmResult<Vec<u8>> {
        self.respond_edited(challenge, |_| {})
    }

    /// Like [`respond`](Self::respond), but lets the caller edit the grant
    /// before it is signed. Test suites use this to produce replies that are
    /// validly signed yet wrong.
    pub fn respond_edited(
        &self,
        challenge: &[u8],
        edit: impl FnOnce(&mut LicenseGrant),
    ) -> CdmResult<Vec<u8>> {
        let envelope = SignedMessage::decode(challenge)?;

        let got = envelope.r#type.unwrap_or_default();
        if got != MESSAGE_TYPE_LICENSE_REQUEST {
            return Err(CdmError::UnexpectedMessageType {
                expected: MESSAGE_TYPE_LICENSE_REQUEST,
                got,
            });
        }

        let request_bytes = envelope
            .msg
            .ok_or_else(|| CdmError::Decode("challenge is missing msg".to_owned()))?;
        let request = LicenseRequest::decode(request_bytes.as_slice())?;

        let mut rng = rand::thread_rng();
        let mut session_key = [0u8; 16];
        rng.fill_bytes(&mut session_key);

        let derived = crypto::aes::derive_keys(
            &crypto::aes::build_enc_context(&request_bytes),
            &crypto::aes::build_mac_context(&request_bytes),
            &session_key,
        );

        let mut containers = Vec::with_capacity(self.keys.len());
        for (kid, value, kind) in &self.keys {
            let mut iv = [0u8; 16];
            rng.fill_bytes(&mut iv);

            containers.push(KeyContainer {
                id: Some(kid.to_vec()),
                iv: Some(iv.to_vec()),
                key: Some(crypto::aes::cbc_encrypt(&derived.enc_key, &iv, value)),
                r#type: Some(*kind as i32),
            });
        }

        let mut grant = LicenseGrant {
            nonce: request.nonce.clone(),
            keys: containers,
            issued_at: Some(
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs() as i64,
            ),
            duration: None,
        };
        edit(&mut grant);

        let payload = grant.encode_to_vec();
        let signature = crypto::hmac::sign(&derived.mac_key_server, &payload);

        Ok(SignedMessage {
            r#type: Some(MESSAGE_TYPE_LICENSE_GRANT),
            msg: Some(payload),
            signature: Some(signature),
            session_key: Some(crypto::rsa::oaep_wrap(&self.device_key, &session_key)?),
        }
        .encode_to_vec())
    }
}
