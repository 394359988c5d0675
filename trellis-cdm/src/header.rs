use crate::{
    error::{CdmError, CdmResult},
    types::ProtectionSystem,
};
use base64::Engine;

/// A parsed content protection header (`pssh` box layout).
///
/// Identifies the protection system and, for version 1 headers, the key ids
/// a license must cover. The init data blob is passed through to the codec
/// untouched.
#[derive(Debug, Clone)]
pub struct ProtectionHeader {
    pub system: ProtectionSystem,
    pub key_ids: Vec<[u8; 16]>,
    pub init_data: Vec<u8>,
}

impl ProtectionHeader {
    pub fn from_base64(value: &str) -> CdmResult<Self> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(value.trim())
            .map_err(|e| CdmError::HeaderMalformed(format!("base64: {e}")))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &[u8]) -> CdmResult<Self> {
        if raw.len() < 32 {
            return Err(CdmError::HeaderMalformed(
                "shorter than a minimal header box".to_owned(),
            ));
        }

        let size = u32::from_be_bytes(raw[0..4].try_into().unwrap()) as usize;
        if size != raw.len() {
            return Err(CdmError::HeaderMalformed(format!(
                "declared size {size} does not match {} bytes of data",
                raw.len()
            )));
        }

        if &raw[4..8] != b"pssh" {
            return Err(CdmError::HeaderMalformed(format!(
                "unexpected box type '{}'",
                String::from_utf8_lossy(&raw[4..8])
            )));
        }

        let version = raw[8];
        if version > 1 {
            return Err(CdmError::HeaderMalformed(format!(
                "unsupported header version {version}"
            )));
        }

        let system_id: [u8; 16] = raw[12..28].try_into().unwrap();
        let system = ProtectionSystem::from_system_id(&system_id)
            .ok_or_else(|| CdmError::UnsupportedSystem(hex::encode(system_id)))?;

        let mut offset = 28;
        let mut key_ids = Vec::new();

        if version == 1 {
            let count = read_u32(raw, &mut offset)? as usize;
            for _ in 0..count {
                let kid = raw
                    .get(offset..offset + 16)
                    .ok_or_else(|| CdmError::HeaderMalformed("key id list truncated".to_owned()))?;
                key_ids.push(kid.try_into().unwrap());
                offset += 16;
            }
        }

        let data_size = read_u32(raw, &mut offset)? as usize;
        let init_data = raw
            .get(offset..offset + data_size)
            .ok_or_else(|| CdmError::HeaderMalformed("init data truncated".to_owned()))?
            .to_vec();

        Ok(Self {
            system,
            key_ids,
            init_data,
        })
    }

    pub fn key_ids_hex(&self) -> Vec<String> {
        self.key_ids.iter().map(hex::encode).collect()
    }
}

fn read_u32(raw: &[u8], offset: &mut usize) -> CdmResult<u32> {
    let bytes = raw
        .get(*offset..*offset + 4)
        .ok_or_else(|| CdmError::HeaderMalformed("header truncated".to_owned()))?;
    *offset += 4;
    Ok(u32::from_be_bytes(bytes.try_into().unwrap()))
}

/// Assemble a version 1 header box. The inverse of [`ProtectionHeader::parse`],
/// used by manifests that carry only a default KID and by tests.
pub fn build(system: ProtectionSystem, key_ids: &[[u8; 16]], init_data: &[u8]) -> Vec<u8> {
    let system_id: [u8; 16] = match system {
        ProtectionSystem::Widevine => *b"\xed\xef\x8b\xa9\x79\xd6\x4a\xce\xa3\xc8\x27\xdc\xd5\x1d\x21\xed",
        ProtectionSystem::PlayReady => *b"\x9a\x04\xf0\x79\x98\x40\x42\x86\xab\x92\xe6\x5b\xe0\x88\x5f\x95",
    };

    let size = 32 + 4 + key_ids.len() * 16 + init_data.len();
    let mut raw = Vec::with_capacity(size);
    raw.extend((size as u32).to_be_bytes());
    raw.extend(b"pssh");
    raw.push(1);
    raw.extend([0u8; 3]);
    raw.extend(system_id);
    raw.extend((key_ids.len() as u32).to_be_bytes());
    for kid in key_ids {
        raw.extend(kid);
    }
    raw.extend((init_data.len() as u32).to_be_bytes());
    raw.extend_from_slice(init_data);
    raw
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_v1_header() {
        let kid = [0xaa; 16];
        let raw = build(ProtectionSystem::Widevine, &[kid], b"init");
        let header = ProtectionHeader::parse(&raw).unwrap();

        assert_eq!(header.system, ProtectionSystem::Widevine);
        assert_eq!(header.key_ids, vec![kid]);
        assert_eq!(header.init_data, b"init");
    }

    #[test]
    fn rejects_size_mismatch() {
        let mut raw = build(ProtectionSystem::Widevine, &[], b"data");
        raw.push(0);
        assert!(matches!(
            ProtectionHeader::parse(&raw),
            Err(CdmError::HeaderMalformed(_))
        ));
    }

    #[test]
    fn rejects_unknown_system() {
        let mut raw = build(ProtectionSystem::Widevine, &[], b"");
        raw[12] = 0x00;
        assert!(matches!(
            ProtectionHeader::parse(&raw),
            Err(CdmError::UnsupportedSystem(_))
        ));
    }

    #[test]
    fn rejects_wrong_box_type() {
        let mut raw = build(ProtectionSystem::PlayReady, &[], b"");
        raw[4..8].copy_from_slice(b"moov");
        assert!(ProtectionHeader::parse(&raw).is_err());
    }
}
