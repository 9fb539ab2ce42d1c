//! X3DH-style key agreement.
//!
//! The initiator combines, in this fixed order:
//!
//! ```text
//! DH1 = DH(IK_a,  SPK_b)
//! DH2 = DH(EK_a,  IK_b)
//! DH3 = DH(EK_a,  SPK_b)
//! DH4 = DH(EK_a,  OPK_b)   only when the bundle advertised a one-time pre-key
//! SK  = HKDF(DH1 || DH2 || DH3 [|| DH4], info = "murmur x3dh v1")
//! ```
//!
//! The responder mirrors the pairings and arrives at the same `SK`, which
//! seeds the ratchet as its root secret.

use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};
use zeroize::Zeroizing;

use crate::constants::{LABEL_FALLBACK, LABEL_FALLBACK_RATCHET, LABEL_X3DH};
use crate::crypto::{hkdf_derive, random_bytes, SymmetricKey};
use crate::error::{CryptoError, MurmurError};
use crate::identity::{IdentityKeys, PreKeyBundle};
use crate::protocol::HandshakeHeader;
use crate::ratchet::RatchetRole;
use crate::types::Handle;

/// Result of the initiator side: the root secret plus the header that must
/// ride along with the first message.
pub struct SenderAgreement {
    pub shared_secret: Zeroizing<SymmetricKey>,
    pub handshake: HandshakeHeader,
}

fn contributory(dh: SharedSecret) -> Result<SharedSecret, CryptoError> {
    if dh.was_contributory() {
        Ok(dh)
    } else {
        Err(CryptoError::MalformedPayload("low-order public key".into()))
    }
}

fn finish(parts: &[SharedSecret]) -> Result<Zeroizing<SymmetricKey>, CryptoError> {
    let mut ikm = Zeroizing::new(Vec::with_capacity(parts.len() * 32));
    for dh in parts {
        ikm.extend_from_slice(dh.as_bytes());
    }
    Ok(Zeroizing::new(hkdf_derive(Some(&[0u8; 32][..]), &ikm, LABEL_X3DH)?))
}

/// Initiator side. Verifies the bundle's signed pre-key, generates a fresh
/// ephemeral key and derives the shared root secret.
pub fn agree_sender(
    self_identity: &IdentityKeys,
    peer: &PreKeyBundle,
) -> Result<SenderAgreement, MurmurError> {
    peer.verify()?;

    let peer_identity = PublicKey::from(peer.identity_key);
    let peer_spk = PublicKey::from(peer.signed_prekey);
    let ephemeral = StaticSecret::from(random_bytes::<32>()?);

    let mut parts = vec![
        contributory(self_identity.identity_secret().diffie_hellman(&peer_spk))?,
        contributory(ephemeral.diffie_hellman(&peer_identity))?,
        contributory(ephemeral.diffie_hellman(&peer_spk))?,
    ];
    if let Some(opk) = &peer.one_time_prekey {
        parts.push(contributory(
            ephemeral.diffie_hellman(&PublicKey::from(opk.key)),
        )?);
    }

    Ok(SenderAgreement {
        shared_secret: finish(&parts)?,
        handshake: HandshakeHeader {
            identity_key: self_identity.identity_public().to_bytes(),
            ephemeral_key: PublicKey::from(&ephemeral).to_bytes(),
            one_time_prekey_id: peer.one_time_prekey.as_ref().map(|k| k.id),
        },
    })
}

/// Responder side. `one_time_prekey` must be the secret matching the id in
/// the handshake header, already removed from the local pool.
pub fn agree_receiver(
    self_identity: &IdentityKeys,
    self_signed_prekey: &StaticSecret,
    peer_identity_pub: &[u8; 32],
    peer_ephemeral_pub: &[u8; 32],
    one_time_prekey: Option<&StaticSecret>,
) -> Result<Zeroizing<SymmetricKey>, CryptoError> {
    let peer_identity = PublicKey::from(*peer_identity_pub);
    let peer_ephemeral = PublicKey::from(*peer_ephemeral_pub);

    let mut parts = vec![
        contributory(self_signed_prekey.diffie_hellman(&peer_identity))?,
        contributory(self_identity.identity_secret().diffie_hellman(&peer_ephemeral))?,
        contributory(self_signed_prekey.diffie_hellman(&peer_ephemeral))?,
    ];
    if let Some(opk) = one_time_prekey {
        parts.push(contributory(opk.diffie_hellman(&peer_ephemeral))?);
    }

    finish(&parts)
}

/// Degraded bootstrap used when no pre-key bundle is reachable: everything is
/// derived from the two public handles, so anyone who knows both handles can
/// derive the same keys. Only the ratchet's later DH steps add secrecy.
pub fn fallback_session(
    me: &Handle,
    peer: &Handle,
) -> Result<(Zeroizing<SymmetricKey>, RatchetRole), CryptoError> {
    let (lo, hi) = if me <= peer { (me, peer) } else { (peer, me) };
    let seed = format!("{lo}:{hi}");
    let root = Zeroizing::new(hkdf_derive(None, seed.as_bytes(), LABEL_FALLBACK)?);

    let responder_key = StaticSecret::from(hkdf_derive(
        Some(root.as_slice()),
        seed.as_bytes(),
        LABEL_FALLBACK_RATCHET,
    )?);

    let role = if me == lo {
        RatchetRole::Initiator {
            peer_ratchet_key: PublicKey::from(&responder_key).to_bytes(),
        }
    } else {
        RatchetRole::Responder {
            own_ratchet_key: responder_key,
        }
    };
    Ok((root, role))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::generate_identity;

    #[test]
    fn test_both_sides_agree() {
        let alice = generate_identity().unwrap();
        let bob = generate_identity().unwrap();

        let sent = agree_sender(&alice, &bob.bundle(false)).unwrap();
        assert_eq!(sent.handshake.one_time_prekey_id, None);

        let received = agree_receiver(
            &bob,
            bob.signed_prekey_secret(),
            &sent.handshake.identity_key,
            &sent.handshake.ephemeral_key,
            None,
        )
        .unwrap();

        assert_eq!(*sent.shared_secret, *received);
    }

    #[test]
    fn test_agreement_with_one_time_prekey() {
        let alice = generate_identity().unwrap();
        let mut bob = generate_identity().unwrap();

        let sent = agree_sender(&alice, &bob.bundle(true)).unwrap();
        let opk_id = sent.handshake.one_time_prekey_id.unwrap();
        let opk = bob.take_one_time_prekey(opk_id).unwrap();

        let without_opk = agree_receiver(
            &bob,
            bob.signed_prekey_secret(),
            &sent.handshake.identity_key,
            &sent.handshake.ephemeral_key,
            None,
        )
        .unwrap();
        assert_ne!(*sent.shared_secret, *without_opk);

        let received = agree_receiver(
            &bob,
            bob.signed_prekey_secret(),
            &sent.handshake.identity_key,
            &sent.handshake.ephemeral_key,
            Some(&opk),
        )
        .unwrap();
        assert_eq!(*sent.shared_secret, *received);
    }

    #[test]
    fn test_fresh_ephemeral_per_agreement() {
        let alice = generate_identity().unwrap();
        let bob = generate_identity().unwrap();
        let first = agree_sender(&alice, &bob.bundle(false)).unwrap();
        let second = agree_sender(&alice, &bob.bundle(false)).unwrap();
        assert_ne!(first.handshake.ephemeral_key, second.handshake.ephemeral_key);
        assert_ne!(*first.shared_secret, *second.shared_secret);
    }

    #[test]
    fn test_forged_bundle_rejected() {
        let alice = generate_identity().unwrap();
        let bob = generate_identity().unwrap();
        let mallory = generate_identity().unwrap();

        let mut bundle = bob.bundle(false);
        bundle.signed_prekey = mallory.signed_prekey_public().to_bytes();

        assert!(matches!(
            agree_sender(&alice, &bundle),
            Err(MurmurError::Protocol(_))
        ));
    }

    #[test]
    fn test_fallback_is_symmetric() {
        let a = Handle::parse("AAAAAAAA").unwrap();
        let b = Handle::parse("BBBBBBBB").unwrap();

        let (root_a, role_a) = fallback_session(&a, &b).unwrap();
        let (root_b, role_b) = fallback_session(&b, &a).unwrap();

        assert_eq!(*root_a, *root_b);
        assert!(matches!(role_a, RatchetRole::Initiator { .. }));
        assert!(matches!(role_b, RatchetRole::Responder { .. }));
    }
}
