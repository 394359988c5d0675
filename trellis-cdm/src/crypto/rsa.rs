use crate::error::{CdmError, CdmResult};
use rsa::{Oaep, Pss, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

/// RSA-PSS-SHA256 signature over `message` with the device private key.
/// Challenges are signed this way.
pub fn pss_sign(key: &RsaPrivateKey, message: &[u8]) -> CdmResult<Vec<u8>> {
    let digest = Sha256::digest(message);
    key.sign_with_rng(&mut rand::thread_rng(), Pss::new::<Sha256>(), &digest)
        .map_err(|e| CdmError::RsaOperation(e.to_string()))
}

pub fn pss_verify(key: &RsaPublicKey, message: &[u8], signature: &[u8]) -> CdmResult<()> {
    let digest = Sha256::digest(message);
    key.verify(Pss::new::<Sha256>(), &digest, signature)
        .map_err(|_| CdmError::SignatureMismatch)
}

/// Unwrap a session key with RSA-OAEP-SHA256.
pub fn oaep_unwrap(key: &RsaPrivateKey, ciphertext: &[u8]) -> CdmResult<Vec<u8>> {
    key.decrypt(Oaep::new::<Sha256>(), ciphertext)
        .map_err(|e| CdmError::RsaOperation(e.to_string()))
}

/// Wrap a session key to a device public key. The server-side half of
/// [`oaep_unwrap`]; provisioning tooling and the test harness use it.
pub fn oaep_wrap(key: &RsaPublicKey, plaintext: &[u8]) -> CdmResult<Vec<u8>> {
    key.encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), plaintext)
        .map_err(|e| CdmError::RsaOperation(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_unwrap() {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let public = key.to_public_key();

        let signature = pss_sign(&key, b"challenge bytes").unwrap();
        pss_verify(&public, b"challenge bytes", &signature).unwrap();
        assert!(pss_verify(&public, b"tampered bytes", &signature).is_err());

        let wrapped = oaep_wrap(&public, &[7u8; 16]).unwrap();
        assert_eq!(oaep_unwrap(&key, &wrapped).unwrap(), vec![7u8; 16]);
    }
}
