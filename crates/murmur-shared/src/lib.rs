// Session crypto, identity material and wire types shared by every murmur crate.

pub mod constants;
pub mod crypto;
pub mod encoding;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod ratchet;
pub mod types;
pub mod x3dh;

pub use error::{CryptoError, HandleError, MurmurError, ProtocolError};
pub use identity::{generate_identity, IdentityKeys, PreKeyBundle};
pub use protocol::{
    HandshakeHeader, HeartbeatRequest, HeartbeatResponse, LeaseStatus, RelayEnvelope, RelayEvent,
    WireMessage,
};
pub use ratchet::{RatchetPayload, RatchetRole, RatchetState};
pub use types::{bucket_of, now_millis, ChannelId, DeliveryStatus, Handle};
pub use x3dh::{agree_receiver, agree_sender, fallback_session, SenderAgreement};
