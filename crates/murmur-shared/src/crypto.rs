use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::constants::{KDF_CONTEXT_STORAGE_KEY, NONCE_SIZE, TAG_SIZE};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; 32];

type HmacSha256 = Hmac<Sha256>;

/// Fill a fixed-size array from the OS entropy source.
pub fn random_bytes<const N: usize>() -> Result<[u8; N], CryptoError> {
    let mut out = [0u8; N];
    rand::rngs::OsRng
        .try_fill_bytes(&mut out)
        .map_err(|_| CryptoError::EntropyUnavailable)?;
    Ok(out)
}

pub fn generate_symmetric_key() -> Result<SymmetricKey, CryptoError> {
    random_bytes()
}

pub fn generate_nonce() -> Result<[u8; NONCE_SIZE], CryptoError> {
    random_bytes()
}

// Returns ciphertext || tag (16 bytes appended)
pub fn encrypt(
    key: &SymmetricKey,
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(key.into());
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::EncryptionFailed)
}

pub fn decrypt(
    key: &SymmetricKey,
    nonce: &[u8],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if nonce.len() != NONCE_SIZE {
        return Err(CryptoError::MalformedPayload(format!(
            "nonce must be {NONCE_SIZE} bytes, got {}",
            nonce.len()
        )));
    }
    if ciphertext.len() < TAG_SIZE {
        return Err(CryptoError::MalformedPayload(
            "ciphertext shorter than tag".into(),
        ));
    }
    let cipher = ChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed)
}

// Local-at-rest sealing: nonce || ciphertext || tag
pub fn seal(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let nonce = generate_nonce()?;
    let ciphertext = encrypt(key, &nonce, plaintext, b"murmur-sealed")?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

pub fn open(key: &SymmetricKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }
    let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
    decrypt(key, nonce, ciphertext, b"murmur-sealed")
}

// BLAKE3 KDF with domain separation
pub fn derive_storage_key(device_secret: &[u8]) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_STORAGE_KEY);
    hasher.update(device_secret);
    *hasher.finalize().as_bytes()
}

/// HMAC-SHA256 keyed by `key` over a literal purpose label. Used for the
/// symmetric chain steps.
pub fn hmac_derive(key: &SymmetricKey, label: &[u8]) -> Result<SymmetricKey, CryptoError> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?;
    mac.update(label);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// HKDF-SHA256 extract-then-expand to a single 32-byte key.
pub fn hkdf_derive(
    salt: Option<&[u8]>,
    ikm: &[u8],
    info: &[u8],
) -> Result<SymmetricKey, CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = [0u8; 32];
    hk.expand(info, &mut okm)
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(okm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = generate_symmetric_key().unwrap();
        let nonce = generate_nonce().unwrap();
        let plaintext = b"whisper it quietly";

        let ciphertext = encrypt(&key, &nonce, plaintext, b"aad").unwrap();
        assert_eq!(ciphertext.len(), plaintext.len() + TAG_SIZE);

        let decrypted = decrypt(&key, &nonce, &ciphertext, b"aad").unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_wrong_aad_fails() {
        let key = generate_symmetric_key().unwrap();
        let nonce = generate_nonce().unwrap();
        let ciphertext = encrypt(&key, &nonce, b"data", b"header-1").unwrap();
        assert_eq!(
            decrypt(&key, &nonce, &ciphertext, b"header-2"),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = generate_symmetric_key().unwrap();
        let mut sealed = seal(&key, b"Important data").unwrap();
        let len = sealed.len();
        sealed[len - 1] ^= 0xFF;

        assert!(open(&key, &sealed).is_err());
    }

    #[test]
    fn test_short_inputs_are_malformed() {
        let key = generate_symmetric_key().unwrap();
        assert!(matches!(
            decrypt(&key, &[0u8; 4], &[0u8; 32], b""),
            Err(CryptoError::MalformedPayload(_))
        ));
        assert!(matches!(
            decrypt(&key, &[0u8; NONCE_SIZE], &[0u8; 3], b""),
            Err(CryptoError::MalformedPayload(_))
        ));
        assert!(open(&key, &[]).is_err());
    }

    #[test]
    fn test_labels_separate_derivations() {
        let key = [7u8; 32];
        let a = hmac_derive(&key, b"message key").unwrap();
        let b = hmac_derive(&key, b"next chain key").unwrap();
        assert_ne!(a, b);
        assert_eq!(a, hmac_derive(&key, b"message key").unwrap());
    }

    #[test]
    fn test_storage_key_deterministic() {
        assert_eq!(derive_storage_key(b"device"), derive_storage_key(b"device"));
        assert_ne!(derive_storage_key(b"device"), derive_storage_key(b"other"));
    }
}
