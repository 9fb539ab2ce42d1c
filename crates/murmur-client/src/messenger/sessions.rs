//! Per-channel ratchet sessions: establishing them, and moving them in and
//! out of the store sealed under the device storage key.

use murmur_shared::{
    agree_receiver, agree_sender, fallback_session, ChannelId, Handle, HandshakeHeader,
    IdentityKeys, RatchetRole, RatchetState,
};
use murmur_store::StoredIdentity;
use tracing::{info, warn};

use super::Core;
use crate::error::ClientError;

impl Core {
    pub(crate) async fn load_ratchet(&self, channel_id: &ChannelId) -> Result<Option<RatchetState>, ClientError> {
        match self.store.load_ratchet_state(channel_id).await? {
            Some(blob) => Ok(Some(RatchetState::open_sealed(&self.storage_key, &blob)?)),
            None => Ok(None),
        }
    }

    pub(crate) async fn save_ratchet(&self, channel_id: &ChannelId, state: &RatchetState) -> Result<(), ClientError> {
        let sealed = state.seal(&self.storage_key)?;
        self.store
            .save_ratchet_state(channel_id, sealed, self.now())
            .await?;
        Ok(())
    }

    /// Start a session as initiator. Uses the peer's published bundle when
    /// there is one; otherwise falls back to the handle-derived session.
    pub(crate) async fn initiate(
        &self,
        identity: &IdentityKeys,
        peer: &Handle,
    ) -> Result<(RatchetState, Option<HandshakeHeader>), ClientError> {
        match self.backend.fetch_bundle(peer).await? {
            Some(bundle) => {
                let agreement = agree_sender(identity, &bundle)?;
                let state = RatchetState::init(
                    &agreement.shared_secret,
                    RatchetRole::Initiator {
                        peer_ratchet_key: bundle.signed_prekey,
                    },
                )?;
                info!(peer = %peer, one_time_prekey = bundle.one_time_prekey.is_some(), "session initiated");
                Ok((state, Some(agreement.handshake)))
            }
            None => {
                warn!(peer = %peer, "no pre-key bundle published, using handle-derived session");
                Ok((Self::fallback(identity.handle(), peer)?, None))
            }
        }
    }

    /// Answer a handshake. Works on a copy of the identity so a consumed
    /// one-time pre-key only sticks once the caller commits it.
    pub(crate) fn respond(
        identity: &IdentityKeys,
        header: &HandshakeHeader,
    ) -> Result<(RatchetState, Option<IdentityKeys>), ClientError> {
        let mut candidate = identity.clone();
        let one_time_prekey = header
            .one_time_prekey_id
            .map(|id| candidate.take_one_time_prekey(id))
            .transpose()?;

        let root = agree_receiver(
            &candidate,
            candidate.signed_prekey_secret(),
            &header.identity_key,
            &header.ephemeral_key,
            one_time_prekey.as_ref(),
        )?;
        let state = RatchetState::init(
            &root,
            RatchetRole::Responder {
                own_ratchet_key: candidate.signed_prekey_secret().clone(),
            },
        )?;
        let updated = one_time_prekey.map(|_| candidate);
        Ok((state, updated))
    }

    pub(crate) fn fallback(me: &Handle, peer: &Handle) -> Result<RatchetState, ClientError> {
        let (root, role) = fallback_session(me, peer)?;
        Ok(RatchetState::init(&root, role)?)
    }

    /// Re-seal and persist an identity whose pre-key pool changed.
    pub(crate) async fn persist_identity(&self, identity: &IdentityKeys) -> Result<(), ClientError> {
        self.store
            .replace_identity(StoredIdentity {
                handle: identity.handle().clone(),
                sealed_keys: identity.seal(&self.storage_key)?,
                created_at: self.now(),
            })
            .await?;
        Ok(())
    }
}

/// Whether an incoming handshake replaces an existing session. Only a session
/// that has never heard from the peer is replaced, and only on the side with
/// the higher handle, so two simultaneous first messages settle on the lower
/// handle's session.
pub(crate) fn adopt_handshake(existing: &RatchetState, me: &Handle, peer: &Handle) -> bool {
    existing.recv_count() == 0 && me > peer
}

/// Whether a handshake may re-key an existing session. A session that has
/// heard from the peer is established; one that has not is still racing the
/// peer's and is settled by [`adopt_handshake`] alone.
pub(crate) fn accepts_rekey(existing: &RatchetState) -> bool {
    existing.recv_count() > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_shared::crypto::generate_symmetric_key;

    fn h(s: &str) -> Handle {
        Handle::parse(s).unwrap()
    }

    #[test]
    fn test_adopt_only_on_higher_handle_before_first_receive() {
        let root = generate_symmetric_key().unwrap();
        let (_, role) = fallback_session(&h("AAAAAAAA"), &h("BBBBBBBB")).unwrap();
        let state = RatchetState::init(&root, role).unwrap();

        assert!(adopt_handshake(&state, &h("BBBBBBBB"), &h("AAAAAAAA")));
        assert!(!adopt_handshake(&state, &h("AAAAAAAA"), &h("BBBBBBBB")));
    }

    #[test]
    fn test_rekey_only_on_established_session() {
        let a = h("AAAAAAAA");
        let b = h("BBBBBBBB");
        let (root_a, role_a) = fallback_session(&a, &b).unwrap();
        let (root_b, role_b) = fallback_session(&b, &a).unwrap();
        let mut alice = RatchetState::init(&root_a, role_a).unwrap();
        let mut bob = RatchetState::init(&root_b, role_b).unwrap();
        assert!(!accepts_rekey(&bob));

        let payload = alice.encrypt(b"hi").unwrap();
        bob.decrypt(&payload).unwrap();
        assert!(accepts_rekey(&bob));
        assert!(!adopt_handshake(&bob, &b, &a));
    }

    #[test]
    fn test_respond_consumes_one_time_prekey_on_copy() {
        let alice = murmur_shared::generate_identity().unwrap();
        let bob = murmur_shared::generate_identity().unwrap();
        let before = bob.one_time_prekey_count();

        let sent = agree_sender(&alice, &bob.bundle(true)).unwrap();
        let (_, updated) = Core::respond(&bob, &sent.handshake).unwrap();

        assert_eq!(bob.one_time_prekey_count(), before);
        assert_eq!(updated.unwrap().one_time_prekey_count(), before - 1);
    }
}
