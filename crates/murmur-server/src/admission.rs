//! Lease table behind the `/heartbeat` endpoint.
//!
//! Every heartbeat refreshes one lease. Leases that have not heartbeated
//! within the TTL are purged. The remaining leases are ranked (typing first,
//! then most recent activity) and the top `max_active` are active; the rest
//! are queued. A queued client keeps heartbeating and is promoted as soon as
//! it ranks inside the ceiling again.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use murmur_net::{AdmissionService, NetError};
use murmur_shared::{now_millis, Handle, HeartbeatRequest, HeartbeatResponse, LeaseStatus};
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct LeaseKey {
    user_id: String,
    handle: Handle,
}

#[derive(Debug, Clone)]
struct Lease {
    typing: bool,
    last_active_at: i64,
    last_seen_at: i64,
}

#[derive(Clone)]
pub struct AdmissionTable {
    leases: Arc<Mutex<HashMap<LeaseKey, Lease>>>,
    max_active: usize,
    ttl_ms: i64,
}

impl AdmissionTable {
    pub fn new(max_active: usize, ttl: Duration) -> Self {
        Self {
            leases: Arc::new(Mutex::new(HashMap::new())),
            max_active,
            ttl_ms: i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX),
        }
    }

    pub fn max_active(&self) -> usize {
        self.max_active
    }

    /// Refresh the caller's lease as of `now` and report its standing.
    pub async fn heartbeat_at(&self, req: &HeartbeatRequest, now: i64) -> HeartbeatResponse {
        let mut leases = self.leases.lock().await;
        Self::purge(&mut leases, now, self.ttl_ms);

        let key = LeaseKey {
            user_id: req.user_id.clone(),
            handle: req.pin_handle.clone(),
        };
        let previous = leases.get(&key).map(|l| l.last_active_at);
        let last_active_at = req
            .last_active_at
            .or(previous)
            .unwrap_or(now);
        leases.insert(
            key.clone(),
            Lease {
                typing: req.typing,
                last_active_at,
                last_seen_at: now,
            },
        );

        let ranked = Self::rank(&leases);
        let active = ranked.len().min(self.max_active);
        let position = ranked.iter().position(|k| *k == &key).unwrap_or(usize::MAX);
        let status = if position < self.max_active {
            LeaseStatus::Active
        } else {
            LeaseStatus::Queued
        };

        debug!(
            user = %req.user_id,
            handle = %req.pin_handle,
            ?status,
            position,
            leases = ranked.len(),
            "heartbeat"
        );

        HeartbeatResponse {
            status,
            active_connections: u32::try_from(active).unwrap_or(u32::MAX),
        }
    }

    /// Current standing of a lease without refreshing it.
    pub async fn status_of(&self, user_id: &str, handle: &Handle, now: i64) -> Option<LeaseStatus> {
        let mut leases = self.leases.lock().await;
        Self::purge(&mut leases, now, self.ttl_ms);
        let key = LeaseKey {
            user_id: user_id.to_string(),
            handle: handle.clone(),
        };
        let position = Self::rank(&leases).iter().position(|k| *k == &key)?;
        Some(if position < self.max_active {
            LeaseStatus::Active
        } else {
            LeaseStatus::Queued
        })
    }

    /// Drop every lease that has gone quiet for longer than the TTL.
    pub async fn purge_stale(&self, now: i64) -> usize {
        let mut leases = self.leases.lock().await;
        Self::purge(&mut leases, now, self.ttl_ms)
    }

    pub async fn lease_count(&self) -> usize {
        self.leases.lock().await.len()
    }

    fn purge(leases: &mut HashMap<LeaseKey, Lease>, now: i64, ttl_ms: i64) -> usize {
        let before = leases.len();
        leases.retain(|_, lease| now.saturating_sub(lease.last_seen_at) <= ttl_ms);
        let purged = before - leases.len();
        if purged > 0 {
            info!(purged, remaining = leases.len(), "purged stale leases");
        }
        purged
    }

    fn rank(leases: &HashMap<LeaseKey, Lease>) -> Vec<&LeaseKey> {
        let mut keys: Vec<(&LeaseKey, &Lease)> = leases.iter().collect();
        keys.sort_by_key(|(key, lease)| (Reverse(lease.typing), Reverse(lease.last_active_at), *key));
        keys.into_iter().map(|(key, _)| key).collect()
    }
}

#[async_trait]
impl AdmissionService for AdmissionTable {
    async fn heartbeat(&self, request: &HeartbeatRequest) -> Result<HeartbeatResponse, NetError> {
        Ok(self.heartbeat_at(request, now_millis()).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(user: &str, handle: &str, typing: bool, active: i64) -> HeartbeatRequest {
        HeartbeatRequest {
            user_id: user.into(),
            pin_handle: Handle::parse(handle).unwrap(),
            typing,
            last_active_at: Some(active),
        }
    }

    #[tokio::test]
    async fn test_under_capacity_all_active() {
        let table = AdmissionTable::new(2, Duration::from_secs(60));
        let a = table.heartbeat_at(&req("u1", "AAAAAAAA", false, 10), 100).await;
        let b = table.heartbeat_at(&req("u2", "BBBBBBBB", false, 20), 100).await;
        assert_eq!(a.status, LeaseStatus::Active);
        assert_eq!(b.status, LeaseStatus::Active);
        assert_eq!(b.active_connections, 2);
    }

    #[tokio::test]
    async fn test_one_over_capacity_queues_least_recent_non_typing() {
        let table = AdmissionTable::new(2, Duration::from_secs(60));
        // The typer is the least recently active, but typing outranks recency.
        table.heartbeat_at(&req("u1", "AAAAAAAA", true, 100), 1000).await;
        table.heartbeat_at(&req("u2", "BBBBBBBB", false, 300), 1000).await;
        let c = table.heartbeat_at(&req("u3", "CCCCCCCC", false, 200), 1000).await;

        assert_eq!(c.status, LeaseStatus::Queued);
        assert_eq!(c.active_connections, 2);

        let a = Handle::parse("AAAAAAAA").unwrap();
        let b = Handle::parse("BBBBBBBB").unwrap();
        let cc = Handle::parse("CCCCCCCC").unwrap();
        assert_eq!(table.status_of("u1", &a, 1000).await, Some(LeaseStatus::Active));
        assert_eq!(table.status_of("u2", &b, 1000).await, Some(LeaseStatus::Active));
        assert_eq!(table.status_of("u3", &cc, 1000).await, Some(LeaseStatus::Queued));
    }

    #[tokio::test]
    async fn test_fresh_activity_promotes_queued_lease() {
        let table = AdmissionTable::new(1, Duration::from_secs(60));
        table.heartbeat_at(&req("u1", "AAAAAAAA", false, 100), 1000).await;
        let queued = table.heartbeat_at(&req("u2", "BBBBBBBB", false, 50), 1000).await;
        assert_eq!(queued.status, LeaseStatus::Queued);

        let promoted = table.heartbeat_at(&req("u2", "BBBBBBBB", false, 900), 1100).await;
        assert_eq!(promoted.status, LeaseStatus::Active);
        let a = Handle::parse("AAAAAAAA").unwrap();
        assert_eq!(table.status_of("u1", &a, 1100).await, Some(LeaseStatus::Queued));
    }

    #[tokio::test]
    async fn test_stale_leases_free_capacity() {
        let table = AdmissionTable::new(1, Duration::from_secs(60));
        table.heartbeat_at(&req("u1", "AAAAAAAA", false, 500), 0).await;
        let queued = table.heartbeat_at(&req("u2", "BBBBBBBB", false, 100), 0).await;
        assert_eq!(queued.status, LeaseStatus::Queued);

        // u1 goes silent; u2 keeps heartbeating past the TTL.
        let later = table.heartbeat_at(&req("u2", "BBBBBBBB", false, 100), 61_000).await;
        assert_eq!(later.status, LeaseStatus::Active);
        assert_eq!(table.lease_count().await, 1);
    }

    #[tokio::test]
    async fn test_missing_activity_defaults_to_heartbeat_time() {
        let table = AdmissionTable::new(1, Duration::from_secs(60));
        table.heartbeat_at(&req("u1", "AAAAAAAA", false, 100), 1000).await;
        let mut r = req("u2", "BBBBBBBB", false, 0);
        r.last_active_at = None;
        let resp = table.heartbeat_at(&r, 2000).await;
        assert_eq!(resp.status, LeaseStatus::Active);
    }
}
