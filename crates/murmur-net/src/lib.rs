// Connectivity layer: admission leases, remote message backend, same-device relay.

pub mod admission;
pub mod backend;
pub mod error;
pub mod lease;
pub mod memory;
pub mod relay;

pub use admission::{AdmissionService, HttpAdmissionClient};
pub use backend::{Change, RemoteBackend, SubscriptionId};
pub use error::NetError;
pub use lease::{
    spawn_lease_manager, HostSignal, LeaseConfig, LeaseEvent, LeaseHandle, LeaseState,
};
pub use memory::{LocalBus, MemoryBackend};
pub use relay::{BroadcastBus, CrossContextRelay, TypingTracker};
