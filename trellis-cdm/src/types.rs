use std::fmt;

/// Security level of a provisioned device identity, ordered from hardware
/// backed (L1) down to software only (L3).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SecurityLevel {
    L1 = 1,
    L2 = 2,
    L3 = 3,
}

impl SecurityLevel {
    pub const fn from_u8(u: u8) -> Option<Self> {
        match u {
            1 => Some(Self::L1),
            2 => Some(Self::L2),
            3 => Some(Self::L3),
            _ => None,
        }
    }

    pub const fn to_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.to_u8())
    }
}

/// Role of a key inside a license grant. Only `Content` keys ever reach the
/// decryption pipeline; the rest exist so servers that bundle signing or
/// control keys are handled without surprises.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    Signing = 1,
    Content = 2,
    KeyControl = 3,
    OperatorSession = 4,
}

impl KeyType {
    pub const fn from_i32(v: i32) -> Option<Self> {
        match v {
            1 => Some(Self::Signing),
            2 => Some(Self::Content),
            3 => Some(Self::KeyControl),
            4 => Some(Self::OperatorSession),
            _ => None,
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Signing => "signing",
            Self::Content => "content",
            Self::KeyControl => "key-control",
            Self::OperatorSession => "operator-session",
        })
    }
}

/// A content decryption key recovered from a license response.
#[derive(Clone, PartialEq, Eq)]
pub struct ContentKey {
    pub kid: [u8; 16],
    pub key: [u8; 16],
    pub kind: KeyType,
}

impl ContentKey {
    pub fn kid_hex(&self) -> String {
        hex::encode(self.kid)
    }

    pub fn key_hex(&self) -> String {
        hex::encode(self.key)
    }
}

// Key material should never end up in logs through a stray {:?}.
impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentKey")
            .field("kid", &self.kid_hex())
            .field("key", &"<redacted>")
            .field("kind", &self.kind)
            .finish()
    }
}

/// The keys derived from a negotiated session key via AES-CMAC.
pub struct DerivedKeys {
    /// Decrypts `KeyContainer.key` fields.
    pub enc_key: [u8; 16],
    /// Verifies the server's HMAC over the license payload.
    pub mac_key_server: [u8; 32],
    /// Signs renewal requests back to the server.
    #[allow(dead_code)]
    pub mac_key_client: [u8; 32],
}

/// Known content protection systems, recognized by the 16-byte system id
/// carried in a protection header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtectionSystem {
    Widevine,
    PlayReady,
}

impl ProtectionSystem {
    pub fn from_system_id(id: &[u8; 16]) -> Option<Self> {
        match hex::encode(id).as_str() {
            "edef8ba979d64acea3c827dcd51d21ed" => Some(Self::Widevine),
            "9a04f07998404286ab92e65be0885f95" => Some(Self::PlayReady),
            _ => None,
        }
    }
}

impl fmt::Display for ProtectionSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Widevine => "widevine",
            Self::PlayReady => "playready",
        })
    }
}
