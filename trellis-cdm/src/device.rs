use crate::{
    error::{CdmError, CdmResult},
    types::SecurityLevel,
};
use rsa::{
    RsaPrivateKey,
    pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey},
};
use std::{
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

const MAGIC: &[u8] = b"DID";
const VERSION: u8 = 1;

/// Provisioner marked this identity for renewal ahead of its expiry.
const FLAG_RENEWAL_REQUESTED: u8 = 0b0000_0001;

/// A provisioned client identity, parsed from a `.did` container.
///
/// Read-only after load. Sessions share it behind an `Arc` and never
/// mutate it.
#[derive(Debug, Clone)]
pub struct Device {
    /// Opaque client identification blob, sent verbatim inside challenges.
    pub client_id: Vec<u8>,
    /// DER certificates, leaf first, root last. Never empty.
    pub certificate_chain: Vec<Vec<u8>>,
    /// PKCS#1 private key matching the leaf certificate.
    pub private_key: RsaPrivateKey,
    pub security_level: SecurityLevel,
    /// Unix seconds. `expires_at == 0` means the identity never expires.
    pub provisioned_at: i64,
    pub expires_at: i64,
    flags: u8,
}

impl Device {
    /// A freshly provisioned identity with no expiry and no renewal flag.
    pub fn new(
        client_id: Vec<u8>,
        certificate_chain: Vec<Vec<u8>>,
        private_key: RsaPrivateKey,
        security_level: SecurityLevel,
    ) -> Self {
        Self {
            client_id,
            certificate_chain,
            private_key,
            security_level,
            provisioned_at: unix_now(),
            expires_at: 0,
            flags: 0,
        }
    }

    pub fn from_bytes(data: impl AsRef<[u8]>) -> CdmResult<Self> {
        let data: &[u8] = data.as_ref();

        if data.len() < MAGIC.len() || &data[..MAGIC.len()] != MAGIC {
            return Err(CdmError::BadMagic);
        }

        let version = *data.get(3).ok_or(CdmError::Truncated)?;
        if version != VERSION {
            return Err(CdmError::UnsupportedVersion(version));
        }

        let level = *data.get(4).ok_or(CdmError::Truncated)?;
        let security_level =
            SecurityLevel::from_u8(level).ok_or(CdmError::BadSecurityLevel(level))?;
        let flags = *data.get(5).ok_or(CdmError::Truncated)?;

        let provisioned_at = i64::from_be_bytes(
            data.get(6..14)
                .ok_or(CdmError::Truncated)?
                .try_into()
                .unwrap(),
        );
        let expires_at = i64::from_be_bytes(
            data.get(14..22)
                .ok_or(CdmError::Truncated)?
                .try_into()
                .unwrap(),
        );

        let mut offset = 22;
        let client_id = read_block(data, &mut offset)?.to_vec();
        let private_key_der = read_block(data, &mut offset)?;
        let private_key = RsaPrivateKey::from_pkcs1_der(private_key_der)
            .map_err(|e| CdmError::RsaKeyParse(e.to_string()))?;

        let cert_count = *data.get(offset).ok_or(CdmError::Truncated)?;
        offset += 1;

        if cert_count == 0 {
            return Err(CdmError::EmptyCertificateChain);
        }

        let mut certificate_chain = Vec::with_capacity(cert_count as usize);
        for _ in 0..cert_count {
            let cert = read_block(data, &mut offset)?;
            if cert.is_empty() {
                return Err(CdmError::EmptyCertificateChain);
            }
            certificate_chain.push(cert.to_vec());
        }

        Ok(Device {
            client_id,
            certificate_chain,
            private_key,
            security_level,
            provisioned_at,
            expires_at,
            flags,
        })
    }

    /// Serialize back into the `.did` container format.
    pub fn to_bytes(&self) -> CdmResult<Vec<u8>> {
        let key_der = self
            .private_key
            .to_pkcs1_der()
            .map_err(|e| CdmError::RsaKeyParse(e.to_string()))?;

        let mut buffer = Vec::new();
        buffer.extend(MAGIC);
        buffer.push(VERSION);
        buffer.push(self.security_level.to_u8());
        buffer.push(self.flags);
        buffer.extend(self.provisioned_at.to_be_bytes());
        buffer.extend(self.expires_at.to_be_bytes());

        write_block(&mut buffer, &self.client_id)?;
        write_block(&mut buffer, key_der.as_bytes())?;

        buffer.push(u8::try_from(self.certificate_chain.len()).map_err(|_| {
            CdmError::BadLength {
                what: "certificate chain",
                expected: u8::MAX as usize,
                got: self.certificate_chain.len(),
            }
        })?);

        for cert in &self.certificate_chain {
            write_block(&mut buffer, cert)?;
        }

        Ok(buffer)
    }

    pub fn renewal_requested(mut self, requested: bool) -> Self {
        if requested {
            self.flags |= FLAG_RENEWAL_REQUESTED;
        } else {
            self.flags &= !FLAG_RENEWAL_REQUESTED;
        }
        self
    }

    /// Whether this identity should be renewed before further use, either
    /// because the provisioner flagged it or because it has expired.
    pub fn needs_renewal(&self) -> bool {
        if self.flags & FLAG_RENEWAL_REQUESTED != 0 {
            return true;
        }

        self.expires_at != 0 && unix_now() >= self.expires_at
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn read_block<'a>(data: &'a [u8], offset: &mut usize) -> CdmResult<&'a [u8]> {
    let len = u16::from_be_bytes(
        data.get(*offset..*offset + 2)
            .ok_or(CdmError::Truncated)?
            .try_into()
            .unwrap(),
    ) as usize;
    let start = *offset + 2;
    let block = data.get(start..start + len).ok_or(CdmError::Truncated)?;
    *offset = start + len;
    Ok(block)
}

fn write_block(buffer: &mut Vec<u8>, block: &[u8]) -> CdmResult<()> {
    let len = u16::try_from(block.len()).map_err(|_| CdmError::BadLength {
        what: "identity field",
        expected: u16::MAX as usize,
        got: block.len(),
    })?;
    buffer.extend(len.to_be_bytes());
    buffer.extend_from_slice(block);
    Ok(())
}

/// Loads provisioned identities from a directory holding one `.did` file
/// per security level (`l1.did`, `l2.did`, `l3.did`).
pub struct IdentityStore {
    directory: PathBuf,
}

impl IdentityStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn path_for(&self, level: SecurityLevel) -> PathBuf {
        self.directory.join(format!("l{}.did", level.to_u8()))
    }

    pub fn load(&self, level: SecurityLevel) -> CdmResult<Device> {
        let path = self.path_for(level);

        if !path.exists() {
            return Err(CdmError::IdentityMissing {
                level: level.to_string(),
                path: path.to_string_lossy().into_owned(),
            });
        }

        let bytes = std::fs::read(&path).map_err(|e| CdmError::IdentityRead(e.to_string()))?;
        let device = Device::from_bytes(&bytes)?;

        if device.security_level != level {
            return Err(CdmError::BadSecurityLevel(device.security_level.to_u8()));
        }

        Ok(device)
    }
}

/// Write a device identity to the store layout. Used by provisioning
/// tooling and tests, not by the download path.
pub fn save(device: &Device, directory: &Path) -> CdmResult<()> {
    std::fs::create_dir_all(directory).map_err(|e| CdmError::IdentityRead(e.to_string()))?;
    let path = directory.join(format!("l{}.did", device.security_level.to_u8()));
    std::fs::write(path, device.to_bytes()?).map_err(|e| CdmError::IdentityRead(e.to_string()))
}
