//! Transport-safe (URL-safe base64, unpadded) encoding for key material.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

use crate::error::CryptoError;

pub fn encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn decode(s: &str) -> Result<Vec<u8>, CryptoError> {
    URL_SAFE_NO_PAD
        .decode(s)
        .map_err(|e| CryptoError::Encoding(e.to_string()))
}

pub fn decode_key(s: &str) -> Result<[u8; 32], CryptoError> {
    let bytes = decode(s)?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| CryptoError::InvalidKeyLength)
}

/// `#[serde(with = "b64_key")]` for `[u8; 32]` fields.
pub mod b64_key {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::encode(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        super::decode_key(&s).map_err(D::Error::custom)
    }
}

/// `#[serde(with = "b64_bytes")]` for `Vec<u8>` fields.
pub mod b64_bytes {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        super::decode(&s).map_err(D::Error::custom)
    }
}
