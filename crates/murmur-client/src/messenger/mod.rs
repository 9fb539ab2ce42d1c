//! The [`Messenger`]: one object per process context that owns the store,
//! the loaded identity and the background tasks around them.
//!
//! Lifecycle: [`Messenger::init`] opens the store and starts the WAL flusher
//! and expiry sweeper. Provisioning or loading an identity starts a session
//! (lease manager, relay listener and the bridge that feeds both into the
//! store). [`Messenger::shutdown`] stops everything and flushes the WAL.

mod channels;
mod messaging;
mod sessions;

use std::sync::{Arc, RwLock};

use murmur_net::{
    spawn_lease_manager, AdmissionService, BroadcastBus, CrossContextRelay, HostSignal,
    HttpAdmissionClient, LeaseHandle, LeaseState, RemoteBackend,
};
use murmur_shared::crypto::{derive_storage_key, SymmetricKey};
use murmur_shared::{generate_identity, now_millis, Handle, IdentityKeys};
use murmur_store::{MessageStore, StoredIdentity};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::bridge;
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::events::ClientEvent;

/// Wall clock in Unix epoch millis.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Everything the messenger needs from its host environment.
#[derive(Clone)]
pub struct HostCapabilities {
    pub admission: Arc<dyn AdmissionService>,
    pub backend: Arc<dyn RemoteBackend>,
    pub bus: Arc<dyn BroadcastBus>,
    pub clock: Clock,
}

impl HostCapabilities {
    pub fn new(
        admission: Arc<dyn AdmissionService>,
        backend: Arc<dyn RemoteBackend>,
        bus: Arc<dyn BroadcastBus>,
    ) -> Self {
        Self {
            admission,
            backend,
            bus,
            clock: Arc::new(now_millis),
        }
    }

    /// Capabilities that reach the admission service over HTTP at
    /// `config.admission_url`.
    pub fn over_http(
        config: &ClientConfig,
        backend: Arc<dyn RemoteBackend>,
        bus: Arc<dyn BroadcastBus>,
    ) -> Self {
        Self::new(
            Arc::new(HttpAdmissionClient::new(config.admission_url.clone())),
            backend,
            bus,
        )
    }

    pub fn with_clock(mut self, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }
}

/// Handles into the running session that the bridge and the public API both
/// need.
#[derive(Clone)]
pub(crate) struct SessionLinks {
    pub(crate) handle: Handle,
    pub(crate) relay: Arc<CrossContextRelay>,
    pub(crate) signals: mpsc::Sender<HostSignal>,
}

impl SessionLinks {
    pub(crate) fn signal(&self, signal: HostSignal) {
        if let Err(e) = self.signals.try_send(signal) {
            debug!(error = %e, "lease signal dropped");
        }
    }
}

/// State shared between the public API and the background tasks.
pub(crate) struct Core {
    pub(crate) config: ClientConfig,
    pub(crate) store: Arc<MessageStore>,
    pub(crate) backend: Arc<dyn RemoteBackend>,
    pub(crate) clock: Clock,
    pub(crate) storage_key: Zeroizing<SymmetricKey>,
    /// The loaded identity. Held for the whole of every encrypt/decrypt so
    /// ratchet load-modify-save cycles never interleave.
    pub(crate) keys: AsyncMutex<Option<IdentityKeys>>,
    pub(crate) session: RwLock<Option<SessionLinks>>,
    events: mpsc::Sender<ClientEvent>,
}

impl Core {
    pub(crate) fn now(&self) -> i64 {
        (self.clock)()
    }

    pub(crate) fn links(&self) -> Result<SessionLinks, ClientError> {
        self.session
            .read()
            .map_err(|_| ClientError::ShuttingDown)?
            .clone()
            .ok_or(ClientError::NoIdentity)
    }

    fn set_links(&self, links: Option<SessionLinks>) {
        match self.session.write() {
            Ok(mut guard) => *guard = links,
            Err(poisoned) => *poisoned.into_inner() = links,
        }
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(?event, "event queue full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

struct ActiveSession {
    lease: LeaseHandle,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct Messenger {
    core: Arc<Core>,
    admission: Arc<dyn AdmissionService>,
    bus: Arc<dyn BroadcastBus>,
    shutdown: watch::Sender<bool>,
    background: Vec<JoinHandle<()>>,
    session: Option<ActiveSession>,
}

impl Messenger {
    /// Open the local store and start the background maintenance tasks. No
    /// network activity happens until an identity is loaded.
    pub async fn init(
        config: ClientConfig,
        host: HostCapabilities,
        device_secret: &[u8],
    ) -> Result<(Self, mpsc::Receiver<ClientEvent>), ClientError> {
        let path = config.database_path()?;
        info!(path = %path.display(), "initialising messenger");
        let store = Arc::new(MessageStore::open(&path, config.wal.clone())?);

        let (events_tx, events_rx) = mpsc::channel(256);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let core = Arc::new(Core {
            config,
            store,
            backend: host.backend,
            clock: host.clock,
            storage_key: Zeroizing::new(derive_storage_key(device_secret)),
            keys: AsyncMutex::new(None),
            session: RwLock::new(None),
            events: events_tx,
        });

        let background = vec![
            core.store.spawn_flusher(shutdown_rx.clone()),
            bridge::spawn_expiry_sweeper(core.clone(), shutdown_rx),
        ];

        Ok((
            Self {
                core,
                admission: host.admission,
                bus: host.bus,
                shutdown: shutdown_tx,
                background,
                session: None,
            },
            events_rx,
        ))
    }

    /// Handle of the loaded identity, if any.
    pub fn handle(&self) -> Option<Handle> {
        self.core.links().ok().map(|l| l.handle)
    }

    pub fn connection_state(&self) -> Option<LeaseState> {
        self.session.as_ref().map(|s| s.lease.current())
    }

    /// Create a fresh identity with a random handle, persist it sealed and
    /// start a session for it.
    pub async fn provision_identity(&mut self) -> Result<Handle, ClientError> {
        let keys = generate_identity()?;
        self.install_identity(keys).await
    }

    /// Like [`provision_identity`](Self::provision_identity) with a handle
    /// chosen by the caller.
    pub async fn provision_identity_as(&mut self, handle: Handle) -> Result<Handle, ClientError> {
        let keys = IdentityKeys::generate_with_handle(handle)?;
        self.install_identity(keys).await
    }

    async fn install_identity(&mut self, keys: IdentityKeys) -> Result<Handle, ClientError> {
        let handle = keys.handle().clone();
        self.core
            .store
            .insert_identity(StoredIdentity {
                handle: handle.clone(),
                sealed_keys: keys.seal(&self.core.storage_key)?,
                created_at: self.core.now(),
            })
            .await?;
        info!(handle = %handle, "identity provisioned");
        self.start_session(keys).await?;
        Ok(handle)
    }

    /// Load a stored identity (the oldest one when `handle` is `None`) and
    /// start a session for it. A blob that no longer opens is an
    /// identity-level failure and is surfaced, never skipped.
    pub async fn load_identity(&mut self, handle: Option<&Handle>) -> Result<Handle, ClientError> {
        let stored = match handle {
            Some(h) => self.core.store.identity(h).await?,
            None => self
                .core
                .store
                .first_identity()
                .await?
                .ok_or(ClientError::NoIdentity)?,
        };
        let keys = IdentityKeys::open_sealed(&self.core.storage_key, &stored.sealed_keys)
            .map_err(ClientError::Identity)?;
        let handle = keys.handle().clone();
        info!(handle = %handle, "identity loaded");
        self.start_session(keys).await?;
        Ok(handle)
    }

    async fn start_session(&mut self, keys: IdentityKeys) -> Result<(), ClientError> {
        self.stop_session().await;

        let handle = keys.handle().clone();
        if let Err(e) = self.core.backend.publish_bundle(&keys.bundle(true)).await {
            warn!(handle = %handle, error = %e, "publishing pre-key bundle failed");
        }
        *self.core.keys.lock().await = Some(keys);

        let (session_tx, session_rx) = watch::channel(false);
        let relay = Arc::new(CrossContextRelay::new(
            self.bus.clone(),
            self.core.config.relay_channel.clone(),
            handle.clone(),
            self.core.config.typing_timeout,
        ));
        let (relay_tx, relay_rx) = mpsc::channel(64);
        let relay_task = relay.spawn_listener(relay_tx, session_rx.clone())?;

        let mut lease_config = self.core.config.lease.clone();
        if lease_config.user_id.is_empty() {
            lease_config.user_id = handle.to_string();
        }
        let (lease, lease_events) = spawn_lease_manager(
            handle.clone(),
            lease_config,
            self.admission.clone(),
            self.core.backend.clone(),
            self.core.store.clone(),
        );

        let links = SessionLinks {
            handle: handle.clone(),
            relay: relay.clone(),
            signals: lease.signals.clone(),
        };
        self.core.set_links(Some(links));

        let bridge_task = tokio::spawn(bridge::run(
            self.core.clone(),
            lease_events,
            relay_rx,
            session_rx,
        ));

        if let Err(e) = relay.publish_online(true) {
            debug!(error = %e, "presence publish failed");
        }

        self.session = Some(ActiveSession {
            lease,
            shutdown: session_tx,
            tasks: vec![relay_task, bridge_task],
        });
        info!(handle = %handle, "session started");
        Ok(())
    }

    async fn stop_session(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        if let Ok(links) = self.core.links() {
            if let Err(e) = links.relay.publish_online(false) {
                debug!(error = %e, "presence publish failed");
            }
        }

        session.lease.shutdown().await;
        let _ = session.shutdown.send(true);
        for task in session.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "session task ended abnormally");
            }
        }

        self.core.set_links(None);
        *self.core.keys.lock().await = None;
        info!("session stopped");
    }

    /// Stop every timer and subscription, then flush the WAL.
    pub async fn shutdown(mut self) {
        self.stop_session().await;
        let _ = self.shutdown.send(true);
        for task in self.background.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        info!("messenger shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_net::{LocalBus, MemoryBackend, NetError};
    use murmur_shared::{HeartbeatRequest, HeartbeatResponse, LeaseStatus};

    struct AlwaysActive;

    #[async_trait::async_trait]
    impl AdmissionService for AlwaysActive {
        async fn heartbeat(&self, _req: &HeartbeatRequest) -> Result<HeartbeatResponse, NetError> {
            Ok(HeartbeatResponse {
                status: LeaseStatus::Active,
                active_connections: 1,
            })
        }
    }

    fn host() -> HostCapabilities {
        HostCapabilities::new(
            Arc::new(AlwaysActive),
            Arc::new(MemoryBackend::new()),
            Arc::new(LocalBus::new()),
        )
    }

    fn config(dir: &std::path::Path) -> ClientConfig {
        ClientConfig {
            data_dir: Some(dir.to_path_buf()),
            ..ClientConfig::default()
        }
    }

    #[tokio::test]
    async fn test_identity_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let (mut messenger, _events) = Messenger::init(config(dir.path()), host(), b"device")
            .await
            .unwrap();
        assert!(matches!(
            messenger.load_identity(None).await,
            Err(ClientError::NoIdentity)
        ));

        let handle = messenger.provision_identity().await.unwrap();
        assert_eq!(messenger.handle(), Some(handle.clone()));
        messenger.shutdown().await;

        let (mut messenger, _events) = Messenger::init(config(dir.path()), host(), b"device")
            .await
            .unwrap();
        assert_eq!(messenger.load_identity(None).await.unwrap(), handle);
        messenger.shutdown().await;
    }

    #[tokio::test]
    async fn test_wrong_device_secret_is_identity_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (mut messenger, _events) = Messenger::init(config(dir.path()), host(), b"device")
            .await
            .unwrap();
        messenger.provision_identity().await.unwrap();
        messenger.shutdown().await;

        let (mut messenger, _events) = Messenger::init(config(dir.path()), host(), b"other device")
            .await
            .unwrap();
        let err = messenger.load_identity(None).await.unwrap_err();
        assert!(matches!(err, ClientError::Identity(_)));
        assert!(!err.is_channel_scoped());
        assert!(messenger.handle().is_none());
        messenger.shutdown().await;
    }
}
