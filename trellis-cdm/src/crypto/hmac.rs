use crate::error::{CdmError, CdmResult};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub fn sign(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).unwrap();
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

/// Constant-time HMAC-SHA256 check of a grant payload.
pub fn verify(key: &[u8], message: &[u8], signature: &[u8]) -> CdmResult<()> {
    let mut mac = HmacSha256::new_from_slice(key).unwrap();
    mac.update(message);
    mac.verify_slice(signature)
        .map_err(|_| CdmError::SignatureMismatch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_matches_sign() {
        let tag = sign(b"mac key", b"payload");
        verify(b"mac key", b"payload", &tag).unwrap();
        assert!(verify(b"mac key", b"payload!", &tag).is_err());
        assert!(verify(b"other key", b"payload", &tag).is_err());
    }
}
