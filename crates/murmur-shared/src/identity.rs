use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::constants::{IDENTITY_SCHEMA_VERSION, ONE_TIME_PREKEY_POOL};
use crate::crypto::{self, random_bytes, SymmetricKey};
use crate::encoding::{b64_bytes, b64_key};
use crate::error::{CryptoError, MurmurError, ProtocolError};
use crate::types::Handle;

/// A locally provisioned user: public handle plus every private key the
/// session protocol needs. Created once; replacing it means re-provisioning.
#[derive(Clone)]
pub struct IdentityKeys {
    handle: Handle,
    identity_key: StaticSecret,
    signing_key: SigningKey,
    signed_prekey: StaticSecret,
    signed_prekey_signature: Signature,
    one_time_prekeys: Vec<(u32, StaticSecret)>,
    next_prekey_id: u32,
}

/// Public half of an identity, published so peers can start a session
/// without an interactive round trip.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyBundle {
    pub handle: Handle,
    #[serde(with = "b64_key")]
    pub identity_key: [u8; 32],
    #[serde(with = "b64_key")]
    pub signing_key: [u8; 32],
    #[serde(with = "b64_key")]
    pub signed_prekey: [u8; 32],
    #[serde(with = "b64_bytes")]
    pub signed_prekey_signature: Vec<u8>,
    #[serde(default)]
    pub one_time_prekey: Option<OneTimePreKeyPublic>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OneTimePreKeyPublic {
    pub id: u32,
    #[serde(with = "b64_key")]
    pub key: [u8; 32],
}

/// Serializable format for sealing/exporting an identity. Zeroized on drop.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct IdentityExport {
    pub handle: String,
    pub identity_secret: [u8; 32],
    pub signing_secret: [u8; 32],
    pub signed_prekey_secret: [u8; 32],
    pub signed_prekey_signature: Vec<u8>,
    pub one_time_prekeys: Vec<ExportedPreKey>,
    pub next_prekey_id: u32,
}

#[derive(Serialize, Deserialize, Zeroize)]
pub struct ExportedPreKey {
    pub id: u32,
    pub secret: [u8; 32],
}

fn new_x25519() -> Result<StaticSecret, CryptoError> {
    Ok(StaticSecret::from(random_bytes::<32>()?))
}

/// Generate a fresh identity with a random handle. Fails only when the
/// entropy source is unavailable.
pub fn generate_identity() -> Result<IdentityKeys, CryptoError> {
    IdentityKeys::generate_with_handle(Handle::generate()?)
}

impl IdentityKeys {
    /// Generate key material for a caller-chosen handle.
    pub fn generate_with_handle(handle: Handle) -> Result<Self, CryptoError> {
        let identity_key = new_x25519()?;
        let signing_key = SigningKey::from_bytes(&random_bytes::<32>()?);
        let signed_prekey = new_x25519()?;
        let signed_prekey_signature =
            signing_key.sign(PublicKey::from(&signed_prekey).as_bytes());

        let mut keys = Self {
            handle,
            identity_key,
            signing_key,
            signed_prekey,
            signed_prekey_signature,
            one_time_prekeys: Vec::new(),
            next_prekey_id: 1,
        };
        keys.replenish_one_time_prekeys(ONE_TIME_PREKEY_POOL)?;
        Ok(keys)
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn identity_public(&self) -> PublicKey {
        PublicKey::from(&self.identity_key)
    }

    pub fn signed_prekey_public(&self) -> PublicKey {
        PublicKey::from(&self.signed_prekey)
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub(crate) fn identity_secret(&self) -> &StaticSecret {
        &self.identity_key
    }

    pub fn signed_prekey_secret(&self) -> &StaticSecret {
        &self.signed_prekey
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn one_time_prekey_count(&self) -> usize {
        self.one_time_prekeys.len()
    }

    /// Top the one-time pre-key pool back up to `target` entries.
    pub fn replenish_one_time_prekeys(&mut self, target: usize) -> Result<(), CryptoError> {
        while self.one_time_prekeys.len() < target {
            let id = self.next_prekey_id;
            self.next_prekey_id = self.next_prekey_id.wrapping_add(1);
            self.one_time_prekeys.push((id, new_x25519()?));
        }
        Ok(())
    }

    /// Remove a one-time pre-key from the pool. Each one is usable for exactly
    /// one incoming handshake.
    pub fn take_one_time_prekey(&mut self, id: u32) -> Result<StaticSecret, ProtocolError> {
        let idx = self
            .one_time_prekeys
            .iter()
            .position(|(pid, _)| *pid == id)
            .ok_or(ProtocolError::UnknownOneTimePreKey(id))?;
        Ok(self.one_time_prekeys.remove(idx).1)
    }

    /// Public bundle; optionally advertises the oldest unused one-time pre-key.
    pub fn bundle(&self, with_one_time_prekey: bool) -> PreKeyBundle {
        let one_time_prekey = if with_one_time_prekey {
            self.one_time_prekeys
                .first()
                .map(|(id, secret)| OneTimePreKeyPublic {
                    id: *id,
                    key: PublicKey::from(secret).to_bytes(),
                })
        } else {
            None
        };

        PreKeyBundle {
            handle: self.handle.clone(),
            identity_key: self.identity_public().to_bytes(),
            signing_key: self.verifying_key().to_bytes(),
            signed_prekey: self.signed_prekey_public().to_bytes(),
            signed_prekey_signature: self.signed_prekey_signature.to_bytes().to_vec(),
            one_time_prekey,
        }
    }

    pub fn to_export(&self) -> IdentityExport {
        IdentityExport {
            handle: self.handle.to_string(),
            identity_secret: self.identity_key.to_bytes(),
            signing_secret: self.signing_key.to_bytes(),
            signed_prekey_secret: self.signed_prekey.to_bytes(),
            signed_prekey_signature: self.signed_prekey_signature.to_bytes().to_vec(),
            one_time_prekeys: self
                .one_time_prekeys
                .iter()
                .map(|(id, secret)| ExportedPreKey {
                    id: *id,
                    secret: secret.to_bytes(),
                })
                .collect(),
            next_prekey_id: self.next_prekey_id,
        }
    }

    pub fn from_export(export: &IdentityExport) -> Result<Self, MurmurError> {
        let handle = Handle::parse(&export.handle)?;
        let signature = Signature::from_slice(&export.signed_prekey_signature)
            .map_err(|_| CryptoError::MalformedPayload("signed pre-key signature".into()))?;

        let keys = Self {
            handle,
            identity_key: StaticSecret::from(export.identity_secret),
            signing_key: SigningKey::from_bytes(&export.signing_secret),
            signed_prekey: StaticSecret::from(export.signed_prekey_secret),
            signed_prekey_signature: signature,
            one_time_prekeys: export
                .one_time_prekeys
                .iter()
                .map(|k| (k.id, StaticSecret::from(k.secret)))
                .collect(),
            next_prekey_id: export.next_prekey_id,
        };
        keys.bundle(false).verify()?;
        Ok(keys)
    }

    /// Seal the identity for durable storage: `version || nonce || ciphertext`.
    /// Private keys never leave this crate unsealed.
    pub fn seal(&self, storage_key: &SymmetricKey) -> Result<Vec<u8>, MurmurError> {
        let plain = Zeroizing::new(
            bincode::serialize(&self.to_export())
                .map_err(|e| MurmurError::Serialization(e.to_string()))?,
        );
        let sealed = crypto::seal(storage_key, &plain)?;

        let mut out = Vec::with_capacity(1 + sealed.len());
        out.push(IDENTITY_SCHEMA_VERSION);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn open_sealed(storage_key: &SymmetricKey, blob: &[u8]) -> Result<Self, MurmurError> {
        let (version, sealed) = blob
            .split_first()
            .ok_or_else(|| CryptoError::MalformedPayload("empty identity blob".into()))?;
        if *version != IDENTITY_SCHEMA_VERSION {
            return Err(ProtocolError::UnsupportedSchema(*version).into());
        }
        let plain = Zeroizing::new(crypto::open(storage_key, sealed)?);
        let export: IdentityExport = bincode::deserialize(&plain)
            .map_err(|e| MurmurError::Serialization(e.to_string()))?;
        Self::from_export(&export)
    }
}

impl PreKeyBundle {
    /// Check the signed pre-key against the bundle's signing key.
    pub fn verify(&self) -> Result<(), ProtocolError> {
        let verifying_key = VerifyingKey::from_bytes(&self.signing_key)
            .map_err(|_| ProtocolError::BadPreKeySignature)?;
        let signature = Signature::from_slice(&self.signed_prekey_signature)
            .map_err(|_| ProtocolError::BadPreKeySignature)?;
        verifying_key
            .verify(&self.signed_prekey, &signature)
            .map_err(|_| ProtocolError::BadPreKeySignature)
    }
}
