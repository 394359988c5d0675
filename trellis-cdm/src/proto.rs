//! Wire messages for the license exchange.
//!
//! Every message travels inside a [`SignedMessage`] envelope; `type`
//! disambiguates the direction and `msg` holds the serialized inner
//! message. Challenges are RSA-PSS signed by the device, grants are
//! HMAC signed with the session MAC key.

pub const MESSAGE_TYPE_LICENSE_REQUEST: i32 = 1;
pub const MESSAGE_TYPE_LICENSE_GRANT: i32 = 2;

#[derive(Clone, PartialEq, prost::Message)]
pub struct SignedMessage {
    #[prost(int32, optional, tag = "1")]
    pub r#type: Option<i32>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub msg: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub signature: Option<Vec<u8>>,
    /// Session key wrapped to the device's RSA public key (grants only).
    #[prost(bytes = "vec", optional, tag = "4")]
    pub session_key: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LicenseRequest {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub client_id: Option<Vec<u8>>,
    /// Init data from the protection header, passed through verbatim.
    #[prost(bytes = "vec", optional, tag = "2")]
    pub content_header: Option<Vec<u8>>,
    #[prost(bytes = "vec", repeated, tag = "3")]
    pub key_ids: Vec<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub nonce: Option<Vec<u8>>,
    #[prost(int64, optional, tag = "5")]
    pub request_time: Option<i64>,
    #[prost(uint32, optional, tag = "6")]
    pub security_level: Option<u32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LicenseGrant {
    /// Echo of the challenge nonce. Must match, or the grant is discarded.
    #[prost(bytes = "vec", optional, tag = "1")]
    pub nonce: Option<Vec<u8>>,
    #[prost(message, repeated, tag = "2")]
    pub keys: Vec<KeyContainer>,
    #[prost(int64, optional, tag = "3")]
    pub issued_at: Option<i64>,
    /// Seconds the grant is valid for; 0 or absent = unbounded.
    #[prost(uint32, optional, tag = "4")]
    pub duration: Option<u32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct KeyContainer {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub id: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub iv: Option<Vec<u8>>,
    /// AES-CBC ciphertext of the key value under the derived content key.
    #[prost(bytes = "vec", optional, tag = "3")]
    pub key: Option<Vec<u8>>,
    #[prost(int32, optional, tag = "4")]
    pub r#type: Option<i32>,
}
