use crate::{
    crypto,
    error::{CdmError, CdmResult},
    proto::{
        LicenseGrant, LicenseRequest, MESSAGE_TYPE_LICENSE_GRANT, MESSAGE_TYPE_LICENSE_REQUEST,
        SignedMessage,
    },
    types::{ProtectionSystem, SecurityLevel},
};
use prost::Message;
use rsa::RsaPrivateKey;

/// Everything a codec needs to build one challenge attempt.
pub struct ChallengeParams<'a> {
    pub client_id: &'a [u8],
    pub init_data: &'a [u8],
    pub key_ids: &'a [[u8; 16]],
    pub nonce: [u8; 16],
    pub request_time: i64,
    pub security_level: SecurityLevel,
}

pub struct EncodedChallenge {
    /// Signed envelope bytes, ready to POST.
    pub message: Vec<u8>,
    /// Serialized inner request, kept for key derivation contexts.
    pub request: Vec<u8>,
}

pub struct DecodedResponse {
    /// Serialized grant bytes the server's HMAC covers.
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
    pub session_key: Vec<u8>,
    pub grant: LicenseGrant,
}

/// Message schema of one protection system. The session drives the same
/// state machine regardless of which codec is plugged in.
pub trait LicenseCodec: Send + Sync {
    fn system(&self) -> ProtectionSystem;

    fn encode_challenge(
        &self,
        params: &ChallengeParams<'_>,
        signer: &RsaPrivateKey,
    ) -> CdmResult<EncodedChallenge>;

    fn decode_response(&self, raw: &[u8]) -> CdmResult<DecodedResponse>;
}

/// Select the codec registered for a protection system.
pub fn codec_for(system: ProtectionSystem) -> CdmResult<&'static dyn LicenseCodec> {
    match system {
        ProtectionSystem::Widevine => Ok(&WidevineCodec),
        other => Err(CdmError::UnsupportedSystem(other.to_string())),
    }
}

/// The modular-DRM message set from `proto`: protobuf messages in a signed
/// envelope, RSA-PSS challenges, HMAC-signed grants.
pub struct WidevineCodec;

impl LicenseCodec for WidevineCodec {
    fn system(&self) -> ProtectionSystem {
        ProtectionSystem::Widevine
    }

    fn encode_challenge(
        &self,
        params: &ChallengeParams<'_>,
        signer: &RsaPrivateKey,
    ) -> CdmResult<EncodedChallenge> {
        let request = LicenseRequest {
            client_id: Some(params.client_id.to_vec()),
            content_header: Some(params.init_data.to_vec()),
            key_ids: params.key_ids.iter().map(|kid| kid.to_vec()).collect(),
            nonce: Some(params.nonce.to_vec()),
            request_time: Some(params.request_time),
            security_level: Some(params.security_level.to_u8() as u32),
        }
        .encode_to_vec();

        let signature = crypto::rsa::pss_sign(signer, &request)?;

        let message = SignedMessage {
            r#type: Some(MESSAGE_TYPE_LICENSE_REQUEST),
            msg: Some(request.clone()),
            signature: Some(signature),
            session_key: None,
        }
        .encode_to_vec();

        Ok(EncodedChallenge { message, request })
    }

    fn decode_response(&self, raw: &[u8]) -> CdmResult<DecodedResponse> {
        let envelope = SignedMessage::decode(raw)?;

        let got = envelope.r#type.unwrap_or_default();
        if got != MESSAGE_TYPE_LICENSE_GRANT {
            return Err(CdmError::UnexpectedMessageType {
                expected: MESSAGE_TYPE_LICENSE_GRANT,
                got,
            });
        }

        let payload = envelope
            .msg
            .ok_or_else(|| CdmError::Decode("envelope is missing msg".to_owned()))?;
        let signature = envelope
            .signature
            .ok_or_else(|| CdmError::Decode("envelope is missing signature".to_owned()))?;
        let session_key = envelope
            .session_key
            .ok_or_else(|| CdmError::Decode("envelope is missing session key".to_owned()))?;

        let grant = LicenseGrant::decode(payload.as_slice())?;

        Ok(DecodedResponse {
            payload,
            signature,
            session_key,
            grant,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_is_signed_and_decodable() {
        let signer = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let params = ChallengeParams {
            client_id: b"client",
            init_data: b"init",
            key_ids: &[[0xab; 16]],
            nonce: [0x01; 16],
            request_time: 1_700_000_000,
            security_level: SecurityLevel::L3,
        };

        let encoded = WidevineCodec.encode_challenge(&params, &signer).unwrap();
        let envelope = SignedMessage::decode(encoded.message.as_slice()).unwrap();

        assert_eq!(envelope.r#type, Some(MESSAGE_TYPE_LICENSE_REQUEST));
        assert_eq!(envelope.msg.as_deref(), Some(encoded.request.as_slice()));
        crypto::rsa::pss_verify(
            &signer.to_public_key(),
            &encoded.request,
            envelope.signature.as_deref().unwrap(),
        )
        .unwrap();

        let request = LicenseRequest::decode(encoded.request.as_slice()).unwrap();
        assert_eq!(request.nonce.as_deref(), Some(&[0x01; 16][..]));
        assert_eq!(request.key_ids, vec![vec![0xab; 16]]);
    }

    #[test]
    fn response_must_be_a_grant() {
        let not_a_grant = SignedMessage {
            r#type: Some(MESSAGE_TYPE_LICENSE_REQUEST),
            msg: Some(vec![]),
            signature: Some(vec![]),
            session_key: Some(vec![]),
        }
        .encode_to_vec();

        assert!(matches!(
            WidevineCodec.decode_response(&not_a_grant),
            Err(CdmError::UnexpectedMessageType { .. })
        ));
    }

    #[test]
    fn playready_has_no_codec_yet() {
        assert!(matches!(
            codec_for(ProtectionSystem::PlayReady),
            Err(CdmError::UnsupportedSystem(_))
        ));
    }
}
