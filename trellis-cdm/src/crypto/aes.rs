use crate::{
    error::{CdmError, CdmResult},
    types::DerivedKeys,
};
use aes::Aes128;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use cmac::{Cmac, Mac};

type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes128CbcEnc = cbc::Encryptor<Aes128>;

/// Derivation context bound to the serialized challenge. Built at request
/// time, consumed when the grant arrives.
///
/// `b"ENCRYPTION" || 0x00 || request || len(enc_key) in bits as u32`
pub fn build_enc_context(request: &[u8]) -> Vec<u8> {
    labeled_context(b"ENCRYPTION\x00", request, 128)
}

/// `b"AUTHENTICATION" || 0x00 || request || len(mac keys) in bits as u32`
pub fn build_mac_context(request: &[u8]) -> Vec<u8> {
    labeled_context(b"AUTHENTICATION\x00", request, 512)
}

fn labeled_context(label: &[u8], request: &[u8], bits: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(label.len() + request.len() + 4);
    out.extend_from_slice(label);
    out.extend_from_slice(request);
    out.extend_from_slice(&bits.to_be_bytes());
    out
}

/// AES-128-CMAC key ladder over the session key:
///
///   enc_key        = CMAC(sk, 0x01 || enc_ctx)
///   mac_key_server = CMAC(sk, 0x01 || mac_ctx) || CMAC(sk, 0x02 || mac_ctx)
///   mac_key_client = CMAC(sk, 0x03 || mac_ctx) || CMAC(sk, 0x04 || mac_ctx)
pub fn derive_keys(enc_context: &[u8], mac_context: &[u8], session_key: &[u8; 16]) -> DerivedKeys {
    let enc_key = cmac_block(session_key, 0x01, enc_context);

    let mut mac_key_server = [0u8; 32];
    mac_key_server[..16].copy_from_slice(&cmac_block(session_key, 0x01, mac_context));
    mac_key_server[16..].copy_from_slice(&cmac_block(session_key, 0x02, mac_context));

    let mut mac_key_client = [0u8; 32];
    mac_key_client[..16].copy_from_slice(&cmac_block(session_key, 0x03, mac_context));
    mac_key_client[16..].copy_from_slice(&cmac_block(session_key, 0x04, mac_context));

    DerivedKeys {
        enc_key,
        mac_key_server,
        mac_key_client,
    }
}

fn cmac_block(key: &[u8; 16], counter: u8, context: &[u8]) -> [u8; 16] {
    let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(key).unwrap();
    mac.update(&[counter]);
    mac.update(context);
    mac.finalize().into_bytes().into()
}

/// AES-128-CBC with PKCS#7, used for the key values inside grant containers.
pub fn cbc_decrypt(key: &[u8; 16], iv: &[u8; 16], ciphertext: &[u8]) -> CdmResult<Vec<u8>> {
    Aes128CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CdmError::CbcDecrypt)
}

/// Inverse of [`cbc_decrypt`], for the server half of the exchange.
pub fn cbc_encrypt(key: &[u8; 16], iv: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
    Aes128CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cbc_roundtrip() {
        let key = [0x11; 16];
        let iv = [0x22; 16];
        let ciphertext = cbc_encrypt(&key, &iv, b"sixteen byte key");
        assert_eq!(
            cbc_decrypt(&key, &iv, &ciphertext).unwrap(),
            b"sixteen byte key"
        );
        assert!(cbc_decrypt(&key, &[0x23; 16], &ciphertext).is_err());
    }

    #[test]
    fn derivation_is_deterministic_and_context_bound() {
        let sk = [0x42; 16];
        let a = derive_keys(&build_enc_context(b"req"), &build_mac_context(b"req"), &sk);
        let b = derive_keys(&build_enc_context(b"req"), &build_mac_context(b"req"), &sk);
        let c = derive_keys(&build_enc_context(b"other"), &build_mac_context(b"other"), &sk);

        assert_eq!(a.enc_key, b.enc_key);
        assert_eq!(a.mac_key_server, b.mac_key_server);
        assert_ne!(a.enc_key, c.enc_key);
        assert_ne!(a.enc_key[..], a.mac_key_server[..16]);
    }
}
