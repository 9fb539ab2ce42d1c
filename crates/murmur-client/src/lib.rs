//! # murmur-client
//!
//! Embeddable end-to-end encrypted messaging core. A host creates one
//! [`Messenger`] per context, supplies its capabilities (admission service,
//! remote backend, broadcast bus, clock) and consumes [`ClientEvent`]s.

mod bridge;
pub mod config;
pub mod error;
pub mod events;
pub mod messenger;

use tracing_subscriber::{fmt, EnvFilter};

pub use config::ClientConfig;
pub use error::ClientError;
pub use events::{ClientEvent, MediaRef, MessageView};
pub use messenger::{Clock, HostCapabilities, Messenger};

/// Install the global `tracing` subscriber. `RUST_LOG` wins; otherwise the
/// murmur crates log at debug and everything else at warn. Safe to call more
/// than once.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("murmur_client=debug,murmur_net=debug,murmur_store=info,murmur_shared=info,warn")
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
