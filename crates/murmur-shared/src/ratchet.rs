//! Forward-secret message ratchet.
//!
//! Chain labels are bound to a direction relative to the session initiator,
//! not to "mine" or "theirs": `initial send` and `sending chain` key
//! initiator-to-responder traffic, `initial receive` and `receiving chain`
//! key the opposite direction. Both peers run the same derivation for a given
//! direction and land on the same chain key.
//!
//! A DH step happens when a payload arrives under a ratchet public key the
//! receiver has not seen before. The receiver first derives the new receiving
//! chain from `DH(local, remote')`, then rotates its own key pair and derives a
//! fresh sending chain. Message numbers count within one chain: every new
//! receiving chain and every rotated sending chain starts again at zero.
//!
//! There is no skipped-key cache. A receiver that finds a gap on the current
//! chain steps over it (at most [`MAX_CHAIN_GAP`] keys) and drops the skipped
//! keys, so a lost message never blocks the ones after it. Messages that
//! arrive late, or under a chain that has since been replaced, stay
//! unreadable.

use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::constants::{
    LABEL_INITIAL_RECEIVE, LABEL_INITIAL_SEND, LABEL_MESSAGE_KEY, LABEL_NEXT_CHAIN_KEY,
    LABEL_RECEIVING_CHAIN, LABEL_ROOT_KEY, LABEL_SENDING_CHAIN, MAX_CHAIN_GAP, NONCE_SIZE,
    RATCHET_SCHEMA_VERSION,
};
use crate::crypto::{self, hkdf_derive, hmac_derive, random_bytes, SymmetricKey};
use crate::error::{CryptoError, MurmurError, ProtocolError};
use crate::protocol::WireMessage;

/// Which side of the key agreement this ratchet sits on.
pub enum RatchetRole {
    /// Ran `agree_sender`. `peer_ratchet_key` is the responder's first ratchet
    /// public key, normally its signed pre-key.
    Initiator { peer_ratchet_key: [u8; 32] },
    /// Ran `agree_receiver`. Starts out with the signed pre-key as its ratchet
    /// key pair so the initiator's first DH lines up.
    Responder { own_ratchet_key: StaticSecret },
}

/// One encrypted ratchet message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RatchetPayload {
    pub ratchet_key: [u8; 32],
    pub message_number: u32,
    pub nonce: [u8; NONCE_SIZE],
    /// Ciphertext with the 16-byte tag appended.
    pub ciphertext: Vec<u8>,
}

impl RatchetPayload {
    fn aad(ratchet_key: &[u8; 32], message_number: u32) -> [u8; 36] {
        let mut aad = [0u8; 36];
        aad[..32].copy_from_slice(ratchet_key);
        aad[32..].copy_from_slice(&message_number.to_be_bytes());
        aad
    }
}

impl TryFrom<&WireMessage> for RatchetPayload {
    type Error = CryptoError;

    fn try_from(msg: &WireMessage) -> Result<Self, Self::Error> {
        let nonce = <[u8; NONCE_SIZE]>::try_from(msg.nonce.as_slice()).map_err(|_| {
            CryptoError::MalformedPayload(format!(
                "nonce must be {NONCE_SIZE} bytes, got {}",
                msg.nonce.len()
            ))
        })?;
        Ok(Self {
            ratchet_key: msg.ratchet_public_key,
            message_number: msg.message_number,
            nonce,
            ciphertext: msg.ciphertext.clone(),
        })
    }
}

/// Per-channel ratchet. Every mutating call is transactional: on error the
/// state is exactly what it was before the call.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct RatchetState {
    root_key: SymmetricKey,
    send_chain: Option<SymmetricKey>,
    recv_chain: Option<SymmetricKey>,
    local_secret: [u8; 32],
    remote_public: Option<[u8; 32]>,
    send_count: u32,
    recv_count: u32,
    initiator: bool,
}

impl std::fmt::Debug for RatchetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatchetState")
            .field("initiator", &self.initiator)
            .field("send_count", &self.send_count)
            .field("recv_count", &self.recv_count)
            .finish_non_exhaustive()
    }
}

fn initial_label(initiator_to_responder: bool) -> &'static [u8] {
    if initiator_to_responder {
        LABEL_INITIAL_SEND
    } else {
        LABEL_INITIAL_RECEIVE
    }
}

fn step_label(initiator_to_responder: bool) -> &'static [u8] {
    if initiator_to_responder {
        LABEL_SENDING_CHAIN
    } else {
        LABEL_RECEIVING_CHAIN
    }
}

/// Root step: new root and a chain key for one direction, both salted by the
/// current root.
fn kdf_root(
    root: &SymmetricKey,
    dh: &[u8],
    chain_label: &[u8],
) -> Result<(SymmetricKey, SymmetricKey), CryptoError> {
    let next_root = hkdf_derive(Some(root.as_slice()), dh, LABEL_ROOT_KEY)?;
    let chain = hkdf_derive(Some(root.as_slice()), dh, chain_label)?;
    Ok((next_root, chain))
}

/// Symmetric step: (message key, next chain key).
fn kdf_chain(chain: &SymmetricKey) -> Result<(Zeroizing<SymmetricKey>, SymmetricKey), CryptoError> {
    let message_key = Zeroizing::new(hmac_derive(chain, LABEL_MESSAGE_KEY)?);
    let next = hmac_derive(chain, LABEL_NEXT_CHAIN_KEY)?;
    Ok((message_key, next))
}

impl RatchetState {
    /// Seed a ratchet from the agreed root secret. The initiator generates its
    /// first ratchet key pair here.
    pub fn init(root_secret: &SymmetricKey, role: RatchetRole) -> Result<Self, CryptoError> {
        let (local_secret, remote_public, initiator) = match role {
            RatchetRole::Initiator { peer_ratchet_key } => {
                (random_bytes::<32>()?, Some(peer_ratchet_key), true)
            }
            RatchetRole::Responder { own_ratchet_key } => {
                (own_ratchet_key.to_bytes(), None, false)
            }
        };
        Ok(Self {
            root_key: *root_secret,
            send_chain: None,
            recv_chain: None,
            local_secret,
            remote_public,
            send_count: 0,
            recv_count: 0,
            initiator,
        })
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn send_count(&self) -> u32 {
        self.send_count
    }

    pub fn recv_count(&self) -> u32 {
        self.recv_count
    }

    /// Ratchet public key currently advertised on outgoing payloads.
    pub fn local_public(&self) -> [u8; 32] {
        PublicKey::from(&StaticSecret::from(self.local_secret)).to_bytes()
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<RatchetPayload, CryptoError> {
        let mut next = self.clone();
        let payload = next.encrypt_in_place(plaintext)?;
        *self = next;
        Ok(payload)
    }

    /// Decrypt the next inbound payload. Any failure (wrong key, tampered
    /// ciphertext, replay, gap) leaves the state untouched.
    pub fn decrypt(&mut self, payload: &RatchetPayload) -> Result<Vec<u8>, CryptoError> {
        let mut next = self.clone();
        let plaintext = next.decrypt_in_place(payload)?;
        *self = next;
        Ok(plaintext)
    }

    fn encrypt_in_place(&mut self, plaintext: &[u8]) -> Result<RatchetPayload, CryptoError> {
        let chain = match self.send_chain {
            Some(chain) => chain,
            None => hmac_derive(&self.root_key, initial_label(self.initiator))?,
        };
        let (message_key, next_chain) = kdf_chain(&chain)?;

        let ratchet_key = self.local_public();
        let message_number = self.send_count;
        let nonce = crypto::generate_nonce()?;
        let ciphertext = crypto::encrypt(
            &message_key,
            &nonce,
            plaintext,
            &RatchetPayload::aad(&ratchet_key, message_number),
        )?;

        self.send_chain = Some(next_chain);
        self.send_count = self.send_count.wrapping_add(1);
        Ok(RatchetPayload {
            ratchet_key,
            message_number,
            nonce,
            ciphertext,
        })
    }

    fn decrypt_in_place(&mut self, payload: &RatchetPayload) -> Result<Vec<u8>, CryptoError> {
        let inbound = !self.initiator;
        match self.remote_public {
            Some(remote) if remote == payload.ratchet_key => {
                if self.recv_chain.is_none() {
                    self.recv_chain = Some(hmac_derive(&self.root_key, initial_label(inbound))?);
                }
            }
            None => {
                // First contact on the responder: the peer is still on its
                // initial chain, only our sending side rotates.
                self.recv_chain = Some(hmac_derive(&self.root_key, initial_label(inbound))?);
                self.recv_count = 0;
                self.remote_public = Some(payload.ratchet_key);
                self.rotate_sending()?;
            }
            Some(_) => {
                let dh = self.dh(&payload.ratchet_key)?;
                let (root, chain) = kdf_root(&self.root_key, dh.as_slice(), step_label(inbound))?;
                self.root_key = root;
                self.recv_chain = Some(chain);
                self.recv_count = 0;
                self.remote_public = Some(payload.ratchet_key);
                self.rotate_sending()?;
            }
        }

        let gap = payload
            .message_number
            .checked_sub(self.recv_count)
            .filter(|gap| *gap <= MAX_CHAIN_GAP)
            .ok_or(CryptoError::OutOfOrder {
                expected: self.recv_count,
                got: payload.message_number,
            })?;

        let mut chain = self
            .recv_chain
            .ok_or_else(|| CryptoError::MalformedPayload("no receiving chain".into()))?;
        for _ in 0..gap {
            let (_skipped, next) = kdf_chain(&chain)?;
            chain = next;
        }
        let (message_key, next_chain) = kdf_chain(&chain)?;
        let plaintext = crypto::decrypt(
            &message_key,
            &payload.nonce,
            &payload.ciphertext,
            &RatchetPayload::aad(&payload.ratchet_key, payload.message_number),
        )?;

        self.recv_chain = Some(next_chain);
        self.recv_count = payload.message_number.wrapping_add(1);
        Ok(plaintext)
    }

    /// Fresh local key pair and a sending chain keyed off it.
    fn rotate_sending(&mut self) -> Result<(), CryptoError> {
        let remote = self
            .remote_public
            .ok_or_else(|| CryptoError::MalformedPayload("no remote ratchet key".into()))?;
        self.local_secret = random_bytes::<32>()?;
        let dh = self.dh(&remote)?;
        let (root, chain) = kdf_root(&self.root_key, dh.as_slice(), step_label(self.initiator))?;
        self.root_key = root;
        self.send_chain = Some(chain);
        self.send_count = 0;
        Ok(())
    }

    fn dh(&self, remote: &[u8; 32]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let shared = StaticSecret::from(self.local_secret).diffie_hellman(&PublicKey::from(*remote));
        if !shared.was_contributory() {
            return Err(CryptoError::MalformedPayload("low-order ratchet key".into()));
        }
        Ok(Zeroizing::new(shared.to_bytes()))
    }

    /// Schema-versioned snapshot: `version || bincode(state)`. Contains raw
    /// key material, so callers persist it only through [`RatchetState::seal`].
    pub fn to_bytes(&self) -> Result<Zeroizing<Vec<u8>>, MurmurError> {
        let body = bincode::serialize(self).map_err(|e| MurmurError::Serialization(e.to_string()))?;
        let mut out = Zeroizing::new(Vec::with_capacity(1 + body.len()));
        out.push(RATCHET_SCHEMA_VERSION);
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        let (version, body) = data
            .split_first()
            .ok_or_else(|| ProtocolError::CorruptSnapshot("empty snapshot".into()))?;
        if *version != RATCHET_SCHEMA_VERSION {
            return Err(ProtocolError::UnsupportedSchema(*version));
        }
        bincode::deserialize(body).map_err(|e| ProtocolError::CorruptSnapshot(e.to_string()))
    }

    pub fn seal(&self, storage_key: &SymmetricKey) -> Result<Vec<u8>, MurmurError> {
        let snapshot = self.to_bytes()?;
        Ok(crypto::seal(storage_key, &snapshot)?)
    }

    pub fn open_sealed(storage_key: &SymmetricKey, blob: &[u8]) -> Result<Self, MurmurError> {
        let snapshot = Zeroizing::new(crypto::open(storage_key, blob)?);
        Ok(Self::from_bytes(&snapshot)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_symmetric_key;
    use crate::types::Handle;
    use crate::x3dh::fallback_session;

    fn pair() -> (RatchetState, RatchetState) {
        let root = generate_symmetric_key().unwrap();
        let bob_spk = StaticSecret::from(random_bytes::<32>().unwrap());
        let alice = RatchetState::init(
            &root,
            RatchetRole::Initiator {
                peer_ratchet_key: PublicKey::from(&bob_spk).to_bytes(),
            },
        )
        .unwrap();
        let bob = RatchetState::init(
            &root,
            RatchetRole::Responder {
                own_ratchet_key: bob_spk,
            },
        )
        .unwrap();
        (alice, bob)
    }

    fn snapshot(state: &RatchetState) -> Vec<u8> {
        state.to_bytes().unwrap().to_vec()
    }

    #[test]
    fn test_roundtrip() {
        let (mut alice, mut bob) = pair();
        let payload = alice.encrypt(b"hello").unwrap();
        assert_eq!(payload.message_number, 0);
        assert_eq!(bob.decrypt(&payload).unwrap(), b"hello");
        assert_eq!(alice.send_count(), 1);
        assert_eq!(bob.recv_count(), 1);
    }

    #[test]
    fn test_ping_pong_across_dh_steps() {
        let (mut alice, mut bob) = pair();

        for round in 0..4u8 {
            let first_key = alice.local_public();
            for i in 0..3u8 {
                let msg = [round, i, 0xA];
                let payload = alice.encrypt(&msg).unwrap();
                assert_eq!(payload.ratchet_key, first_key);
                assert_eq!(bob.decrypt(&payload).unwrap(), msg);
            }
            for i in 0..2u8 {
                let msg = [round, i, 0xB];
                let payload = bob.encrypt(&msg).unwrap();
                assert_eq!(alice.decrypt(&payload).unwrap(), msg);
            }
            // Receiving under a new remote key rotates the local one.
            assert_ne!(alice.local_public(), first_key);
        }
        // Counters belong to the current chains.
        assert_eq!(alice.send_count(), 0);
        assert_eq!(alice.recv_count(), 2);
        assert_eq!(bob.recv_count(), 3);
        assert_eq!(bob.send_count(), 2);
    }

    #[test]
    fn test_interleaved_sends_before_reply_arrives() {
        let (mut alice, mut bob) = pair();

        let a0 = alice.encrypt(b"a0").unwrap();
        assert_eq!(bob.decrypt(&a0).unwrap(), b"a0");
        let b0 = bob.encrypt(b"b0").unwrap();
        // Alice keeps talking on her old chain before b0 lands.
        let a1 = alice.encrypt(b"a1").unwrap();

        assert_eq!(alice.decrypt(&b0).unwrap(), b"b0");
        assert_eq!(bob.decrypt(&a1).unwrap(), b"a1");

        let a2 = alice.encrypt(b"a2").unwrap();
        assert_eq!(bob.decrypt(&a2).unwrap(), b"a2");
    }

    #[test]
    fn test_lost_message_does_not_block_the_next_chain() {
        let (mut alice, mut bob) = pair();

        let a0 = alice.encrypt(b"a0").unwrap();
        let _lost = alice.encrypt(b"a1").unwrap();
        assert_eq!(bob.decrypt(&a0).unwrap(), b"a0");

        let b0 = bob.encrypt(b"b0").unwrap();
        assert_eq!(alice.decrypt(&b0).unwrap(), b"b0");

        for round in 0..3u8 {
            let msg = [round, 0xA];
            let payload = alice.encrypt(&msg).unwrap();
            assert_eq!(bob.decrypt(&payload).unwrap(), msg);
            let reply = [round, 0xB];
            let payload = bob.encrypt(&reply).unwrap();
            assert_eq!(payload.message_number, 0);
            assert_eq!(alice.decrypt(&payload).unwrap(), reply);
        }
    }

    #[test]
    fn test_gap_on_one_chain_is_stepped_over() {
        let (mut alice, mut bob) = pair();

        let a0 = alice.encrypt(b"a0").unwrap();
        let a1 = alice.encrypt(b"a1").unwrap();
        let a2 = alice.encrypt(b"a2").unwrap();
        assert_eq!(bob.decrypt(&a0).unwrap(), b"a0");
        assert_eq!(bob.decrypt(&a2).unwrap(), b"a2");
        assert_eq!(bob.recv_count(), 3);

        // The key for a1 is gone.
        let before = snapshot(&bob);
        assert_eq!(
            bob.decrypt(&a1),
            Err(CryptoError::OutOfOrder {
                expected: 3,
                got: 1
            })
        );
        assert_eq!(snapshot(&bob), before);

        let a3 = alice.encrypt(b"a3").unwrap();
        assert_eq!(bob.decrypt(&a3).unwrap(), b"a3");
    }

    #[test]
    fn test_gap_beyond_limit_rejected() {
        let (mut alice, mut bob) = pair();
        bob.decrypt(&alice.encrypt(b"a0").unwrap()).unwrap();

        let mut far = alice.encrypt(b"far").unwrap();
        far.message_number = MAX_CHAIN_GAP + 2;
        let before = snapshot(&bob);
        assert!(matches!(bob.decrypt(&far), Err(CryptoError::OutOfOrder { .. })));
        assert_eq!(snapshot(&bob), before);
    }

    #[test]
    fn test_fallback_responder_may_speak_first() {
        let a = Handle::parse("AAAAAAAA").unwrap();
        let b = Handle::parse("BBBBBBBB").unwrap();
        let (root_a, role_a) = fallback_session(&a, &b).unwrap();
        let (root_b, role_b) = fallback_session(&b, &a).unwrap();
        let mut alice = RatchetState::init(&root_a, role_a).unwrap();
        let mut bob = RatchetState::init(&root_b, role_b).unwrap();

        let b0 = bob.encrypt(b"first").unwrap();
        assert_eq!(alice.decrypt(&b0).unwrap(), b"first");

        let a0 = alice.encrypt(b"reply").unwrap();
        assert_eq!(bob.decrypt(&a0).unwrap(), b"reply");

        let b1 = bob.encrypt(b"again").unwrap();
        assert_eq!(alice.decrypt(&b1).unwrap(), b"again");
    }

    #[test]
    fn test_forward_secrecy_after_steps() {
        let (mut alice, mut bob) = pair();

        let old = alice.encrypt(b"old secret").unwrap();
        assert_eq!(bob.decrypt(&old).unwrap(), b"old secret");

        for _ in 0..2 {
            let p = bob.encrypt(b"x").unwrap();
            alice.decrypt(&p).unwrap();
            let p = alice.encrypt(b"y").unwrap();
            bob.decrypt(&p).unwrap();
        }

        let before = snapshot(&bob);
        assert!(bob.decrypt(&old).is_err());
        assert_eq!(snapshot(&bob), before);

        // Even with the counter lined up, the retired key no longer opens it.
        let mut stale = old.clone();
        stale.message_number = bob.recv_count();
        assert!(bob.decrypt(&stale).is_err());
        assert_eq!(snapshot(&bob), before);
    }

    #[test]
    fn test_tampered_payload_leaves_state_intact() {
        let (mut alice, mut bob) = pair();
        let payload = alice.encrypt(b"intact").unwrap();

        let mut tampered = payload.clone();
        tampered.ciphertext[0] ^= 0x01;
        let before = snapshot(&bob);
        assert_eq!(bob.decrypt(&tampered), Err(CryptoError::DecryptionFailed));
        assert_eq!(snapshot(&bob), before);

        assert_eq!(bob.decrypt(&payload).unwrap(), b"intact");
    }

    #[test]
    fn test_replay_rejected() {
        let (mut alice, mut bob) = pair();
        let payload = alice.encrypt(b"once").unwrap();
        bob.decrypt(&payload).unwrap();
        assert_eq!(
            bob.decrypt(&payload),
            Err(CryptoError::OutOfOrder {
                expected: 1,
                got: 0
            })
        );
    }

    #[test]
    fn test_sealed_snapshot_resumes_session() {
        let (mut alice, mut bob) = pair();
        bob.decrypt(&alice.encrypt(b"one").unwrap()).unwrap();

        let storage_key = crypto::derive_storage_key(b"device");
        let blob = bob.seal(&storage_key).unwrap();
        let mut restored = RatchetState::open_sealed(&storage_key, &blob).unwrap();

        assert_eq!(restored.decrypt(&alice.encrypt(b"two").unwrap()).unwrap(), b"two");
        assert_eq!(alice.decrypt(&restored.encrypt(b"three").unwrap()).unwrap(), b"three");
    }

    #[test]
    fn test_unknown_schema_version_rejected() {
        let (alice, _) = pair();
        let mut bytes = snapshot(&alice);
        bytes[0] = RATCHET_SCHEMA_VERSION + 1;
        assert!(matches!(
            RatchetState::from_bytes(&bytes),
            Err(ProtocolError::UnsupportedSchema(_))
        ));
        assert!(RatchetState::from_bytes(&[]).is_err());
    }
}
