use crate::{
    codec::{ChallengeParams, LicenseCodec, codec_for},
    crypto,
    device::Device,
    error::{CdmError, CdmResult},
    header::ProtectionHeader,
    proto::LicenseGrant,
    types::{ContentKey, DerivedKeys, KeyType},
};
use log::{debug, warn};
use rand::RngCore;
use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

/// License session lifecycle. A session is single use: one per title, driven
/// forward only, with `Failed` as the terminal state for protocol errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    ChallengeBuilt,
    AwaitingServer,
    ResponseValidated,
    KeysDerived,
    Closed,
    Failed,
}

/// Drives one challenge/response exchange against a license server.
///
/// The session owns no transport. The caller POSTs the challenge bytes and
/// feeds the raw reply back in, which keeps retries, timeouts and status
/// classification out of the protocol layer:
///
/// ```ignore
/// let mut session = Session::new(device, header)?;
/// let challenge = session.build_challenge()?;
/// session.submitted();
/// // ... POST challenge, read body ...
/// session.validate_response(&body)?;
/// session.derive_keys()?;
/// let keys = session.close()?;
/// ```
pub struct Session {
    device: Arc<Device>,
    codec: &'static dyn LicenseCodec,
    header: ProtectionHeader,
    state: SessionState,
    nonce: Option<[u8; 16]>,
    contexts: Option<(Vec<u8>, Vec<u8>)>,
    derived: Option<DerivedKeys>,
    grant: Option<LicenseGrant>,
    keys: Vec<ContentKey>,
}

impl Session {
    pub fn new(device: Arc<Device>, header: ProtectionHeader) -> CdmResult<Self> {
        let codec = codec_for(header.system)?;

        Ok(Session {
            device,
            codec,
            header,
            state: SessionState::Idle,
            nonce: None,
            contexts: None,
            derived: None,
            grant: None,
            keys: Vec::new(),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Build a signed challenge for this title.
    ///
    /// Callable again after a failed submission attempt; every call mints a
    /// fresh nonce and invalidates the previous attempt's derivation
    /// contexts, so a stale server reply can never validate.
    pub fn build_challenge(&mut self) -> CdmResult<Vec<u8>> {
        match self.state {
            SessionState::Idle | SessionState::ChallengeBuilt | SessionState::AwaitingServer => {}
            state => return Err(CdmError::InvalidState {
                op: "build_challenge",
                state,
            }),
        }

        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);

        let params = ChallengeParams {
            client_id: &self.device.client_id,
            init_data: &self.header.init_data,
            key_ids: &self.header.key_ids,
            nonce,
            request_time: unix_now(),
            security_level: self.device.security_level,
        };

        let encoded = self.codec.encode_challenge(&params, &self.device.private_key)?;

        self.nonce = Some(nonce);
        self.contexts = Some((
            crypto::aes::build_enc_context(&encoded.request),
            crypto::aes::build_mac_context(&encoded.request),
        ));
        self.state = SessionState::ChallengeBuilt;

        Ok(encoded.message)
    }

    /// Mark the outstanding challenge as handed to the transport.
    pub fn submitted(&mut self) -> CdmResult<()> {
        if self.state != SessionState::ChallengeBuilt {
            return Err(CdmError::InvalidState {
                op: "submitted",
                state: self.state,
            });
        }

        self.state = SessionState::AwaitingServer;
        Ok(())
    }

    /// Validate a raw server reply: unwrap the session key, derive the key
    /// ladder, check the payload HMAC and the echoed nonce.
    ///
    /// Any failure is terminal. No key material from an unvalidated reply
    /// survives the error path.
    pub fn validate_response(&mut self, raw: &[u8]) -> CdmResult<()> {
        if self.state != SessionState::AwaitingServer {
            return Err(CdmError::InvalidState {
                op: "validate_response",
                state: self.state,
            });
        }

        match self.validate_inner(raw) {
            Ok(()) => {
                self.state = SessionState::ResponseValidated;
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn validate_inner(&mut self, raw: &[u8]) -> CdmResult<()> {
        let response = self.codec.decode_response(raw)?;

        let session_key_vec =
            crypto::rsa::oaep_unwrap(&self.device.private_key, &response.session_key)?;
        let session_key: [u8; 16] =
            session_key_vec
                .try_into()
                .map_err(|v: Vec<u8>| CdmError::BadLength {
                    what: "session key",
                    expected: 16,
                    got: v.len(),
                })?;

        let (enc_context, mac_context) = self.contexts.as_ref().expect("challenge outstanding");
        let derived = crypto::aes::derive_keys(enc_context, mac_context, &session_key);

        crypto::hmac::verify(&derived.mac_key_server, &response.payload, &response.signature)?;

        let expected = self.nonce.expect("challenge outstanding");
        if response.grant.nonce.as_deref() != Some(&expected[..]) {
            return Err(CdmError::NonceMismatch);
        }

        self.derived = Some(derived);
        self.grant = Some(response.grant);
        Ok(())
    }

    /// Decrypt the per-key containers of the validated grant. Key ids the
    /// challenge did not request are dropped and logged, never returned.
    pub fn derive_keys(&mut self) -> CdmResult<()> {
        if self.state != SessionState::ResponseValidated {
            return Err(CdmError::InvalidState {
                op: "derive_keys",
                state: self.state,
            });
        }

        match self.derive_inner() {
            Ok(keys) => {
                self.keys = keys;
                self.state = SessionState::KeysDerived;
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn derive_inner(&mut self) -> CdmResult<Vec<ContentKey>> {
        let derived = self.derived.as_ref().expect("response validated");
        let grant = self.grant.as_ref().expect("response validated");
        let requested = &self.header.key_ids;

        let mut keys = Vec::with_capacity(grant.keys.len());

        for container in &grant.keys {
            let (Some(id), Some(iv), Some(ciphertext)) = (
                container.id.as_deref(),
                container.iv.as_deref(),
                container.key.as_deref(),
            ) else {
                debug!("skipping incomplete key container");
                continue;
            };

            let Ok(kid) = <[u8; 16]>::try_from(id) else {
                warn!("skipping key container with a {}-byte key id", id.len());
                continue;
            };

            let Some(kind) = KeyType::from_i32(container.r#type.unwrap_or_default()) else {
                debug!("skipping key container with unknown type");
                continue;
            };

            if !requested.is_empty() && !requested.contains(&kid) {
                warn!(
                    "license server returned unsolicited key id {}, dropping it",
                    hex::encode(kid)
                );
                continue;
            }

            let iv: [u8; 16] = iv.try_into().map_err(|_| CdmError::BadLength {
                what: "key container iv",
                expected: 16,
                got: iv.len(),
            })?;
            let value = crypto::aes::cbc_decrypt(&derived.enc_key, &iv, ciphertext)?;
            let key: [u8; 16] = value.try_into().map_err(|v: Vec<u8>| CdmError::BadLength {
                what: "content key",
                expected: 16,
                got: v.len(),
            })?;

            keys.push(ContentKey { kid, key, kind });
        }

        if keys.is_empty() {
            return Err(CdmError::NoContentKeys);
        }

        Ok(keys)
    }

    /// Hand out the derived keys for persistence and end the session.
    /// Challenge, response and derived session material all die here.
    pub fn close(mut self) -> CdmResult<Vec<ContentKey>> {
        if self.state != SessionState::KeysDerived {
            return Err(CdmError::InvalidState {
                op: "close",
                state: self.state,
            });
        }

        self.state = SessionState::Closed;
        self.nonce = None;
        self.contexts = None;
        self.derived = None;
        self.grant = None;

        Ok(std::mem::take(&mut self.keys))
    }

    fn fail(&mut self, error: CdmError) -> CdmError {
        self.state = SessionState::Failed;
        self.nonce = None;
        self.contexts = None;
        self.derived = None;
        self.grant = None;
        self.keys.clear();
        error
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        header,
        proto::SignedMessage,
        responder::Responder,
        types::{ProtectionSystem, SecurityLevel},
    };
    use prost::Message;

    const KID: [u8; 16] = [0xaa; 16];
    const KEY: [u8; 16] = [0xbb; 16];

    fn session_pair() -> (Session, Responder) {
        let device = Arc::new(crate::device::tests::test_device(SecurityLevel::L3));
        let responder = Responder::new(device.private_key.to_public_key()).key(KID, KEY);
        let raw = header::build(ProtectionSystem::Widevine, &[KID], b"init-data");
        let session = Session::new(device, ProtectionHeader::parse(&raw).unwrap()).unwrap();
        (session, responder)
    }

    #[test]
    fn full_exchange_yields_keys() {
        let (mut session, responder) = session_pair();

        let challenge = session.build_challenge().unwrap();
        session.submitted().unwrap();

        let response = responder.respond(&challenge).unwrap();
        session.validate_response(&response).unwrap();
        session.derive_keys().unwrap();

        let keys = session.close().unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].kid, KID);
        assert_eq!(keys[0].key, KEY);
        assert_eq!(keys[0].kind, KeyType::Content);
    }

    #[test]
    fn each_attempt_mints_a_fresh_nonce() {
        let (mut session, _) = session_pair();

        let first = session.build_challenge().unwrap();
        session.submitted().unwrap();
        let second = session.build_challenge().unwrap();

        let nonce_of = |raw: &[u8]| {
            let envelope = SignedMessage::decode(raw).unwrap();
            crate::proto::LicenseRequest::decode(envelope.msg.unwrap().as_slice())
                .unwrap()
                .nonce
                .unwrap()
        };
        assert_ne!(nonce_of(&first), nonce_of(&second));
    }

    #[test]
    fn stale_response_fails_after_rebuild() {
        let (mut session, responder) = session_pair();

        let stale_challenge = session.build_challenge().unwrap();
        let stale_response = responder.respond(&stale_challenge).unwrap();

        // Retry happened: fresh nonce and fresh derivation contexts, then
        // the old reply shows up. Its MAC no longer verifies.
        session.build_challenge().unwrap();
        session.submitted().unwrap();

        assert!(matches!(
            session.validate_response(&stale_response),
            Err(CdmError::SignatureMismatch)
        ));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn mismatched_nonce_is_rejected_even_when_validly_signed() {
        let (mut session, responder) = session_pair();

        let challenge = session.build_challenge().unwrap();
        session.submitted().unwrap();

        // The responder signs after the edit, so the HMAC is valid.
        let response = responder
            .respond_edited(&challenge, |grant| {
                grant.nonce = Some(vec![0u8; 16]);
            })
            .unwrap();

        assert!(matches!(
            session.validate_response(&response),
            Err(CdmError::NonceMismatch)
        ));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let (mut session, responder) = session_pair();

        let challenge = session.build_challenge().unwrap();
        session.submitted().unwrap();

        let mut envelope =
            SignedMessage::decode(responder.respond(&challenge).unwrap().as_slice()).unwrap();
        envelope.signature.as_mut().unwrap()[0] ^= 0xff;

        assert!(matches!(
            session.validate_response(&envelope.encode_to_vec()),
            Err(CdmError::SignatureMismatch)
        ));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn unsolicited_key_ids_are_dropped() {
        let (mut session, responder) = session_pair();
        let responder = responder.key([0xcc; 16], [0xdd; 16]);

        let challenge = session.build_challenge().unwrap();
        session.submitted().unwrap();
        let response = responder.respond(&challenge).unwrap();
        session.validate_response(&response).unwrap();
        session.derive_keys().unwrap();

        let keys = session.close().unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].kid, KID);
    }

    #[test]
    fn out_of_order_calls_are_state_errors() {
        let (mut session, _) = session_pair();

        assert!(matches!(
            session.validate_response(b"anything"),
            Err(CdmError::InvalidState { .. })
        ));
        assert!(matches!(
            session.derive_keys(),
            Err(CdmError::InvalidState { .. })
        ));
        // Misuse does not poison the session.
        assert_eq!(session.state(), SessionState::Idle);
        session.build_challenge().unwrap();
    }
}
