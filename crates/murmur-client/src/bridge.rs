//! Background loops that turn lease and relay traffic into store writes and
//! [`ClientEvent`]s.

use std::sync::Arc;

use murmur_net::{Change, LeaseEvent};
use murmur_shared::{RelayEnvelope, RelayEvent, WireMessage};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::ClientError;
use crate::events::ClientEvent;
use crate::messenger::Core;

/// Process session traffic until `shutdown` fires or both sources close.
pub(crate) async fn run(
    core: Arc<Core>,
    mut lease_events: mpsc::Receiver<LeaseEvent>,
    mut relay_rx: mpsc::Receiver<RelayEnvelope>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            Some(event) = lease_events.recv() => on_lease_event(&core, event).await,
            Some(envelope) = relay_rx.recv() => on_relay_envelope(&core, envelope).await,
            _ = shutdown.changed() => break,
            else => break,
        }
    }
    debug!("bridge stopped");
}

async fn on_lease_event(core: &Core, event: LeaseEvent) {
    match event {
        LeaseEvent::StateChanged(state) => core.emit(ClientEvent::connection(state)),
        LeaseEvent::Change(Change::Message(wire)) => receive(core, wire).await,
        LeaseEvent::Change(Change::Delivered {
            channel_id,
            message_id,
            ..
        }) => core.on_delivered(&channel_id, message_id).await,
        LeaseEvent::OutboxFlushed { sent } => core.emit(ClientEvent::OutboxFlushed { sent }),
    }
}

async fn on_relay_envelope(core: &Core, envelope: RelayEnvelope) {
    let sender = envelope.sender;
    match envelope.event {
        RelayEvent::Message { message } => receive(core, message).await,
        RelayEvent::Typing { channel_id } => core.emit(ClientEvent::Typing {
            channel_id,
            handle: sender,
        }),
        RelayEvent::Delivered {
            channel_id,
            message_id,
        } => core.on_delivered(&channel_id, message_id).await,
        RelayEvent::Online { online } => core.emit(ClientEvent::Presence {
            handle: sender,
            online,
        }),
    }
}

async fn receive(core: &Core, wire: WireMessage) {
    let id = wire.id;
    match core.receive(wire).await {
        Ok(_) => {}
        // Relay traffic between other contexts on this device.
        Err(ClientError::NotParticipant(_)) => {}
        Err(e) => warn!(id = %id, error = %e, "inbound message not processed"),
    }
}

/// Periodically delete expired messages.
pub(crate) fn spawn_expiry_sweeper(core: Arc<Core>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(core.config.expiry_sweep_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => sweep(&core).await,
                _ = shutdown.changed() => break,
            }
        }
    })
}

async fn sweep(core: &Core) {
    match core.store.delete_expired(core.now()).await {
        Ok(0) => {}
        Ok(count) => {
            info!(count, "expired messages removed");
            core.emit(ClientEvent::Expired { count });
        }
        Err(e) => warn!(error = %e, "expiry sweep failed"),
    }
}
