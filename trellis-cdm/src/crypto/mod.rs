//! Crypto helpers behind the license exchange. Thin wrappers over the
//! RustCrypto crates so the session code reads at protocol level.

pub mod aes;
pub mod hmac;
pub mod rsa;
