//! The HTTP admission client against a live server on a loopback port.

use std::time::Duration;

use murmur_net::{AdmissionService, HttpAdmissionClient, NetError};
use murmur_server::{serve_on, AdmissionTable, AppState};
use murmur_shared::{Handle, HeartbeatRequest, LeaseStatus};
use tokio::net::TcpListener;

async fn start(max_active: usize) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = AppState {
        admission: AdmissionTable::new(max_active, Duration::from_secs(60)),
    };
    tokio::spawn(serve_on(listener, state));
    format!("http://{addr}")
}

fn request(user: &str, handle: &str, last_active_at: i64) -> HeartbeatRequest {
    HeartbeatRequest {
        user_id: user.into(),
        pin_handle: Handle::parse(handle).unwrap(),
        typing: false,
        last_active_at: Some(last_active_at),
    }
}

#[tokio::test]
async fn heartbeats_over_http_respect_the_ceiling() {
    let client = HttpAdmissionClient::new(start(1).await);

    let first = client.heartbeat(&request("u1", "AAAAAAAA", 200)).await.unwrap();
    assert_eq!(first.status, LeaseStatus::Active);

    let second = client.heartbeat(&request("u2", "BBBBBBBB", 100)).await.unwrap();
    assert_eq!(second.status, LeaseStatus::Queued);
    assert_eq!(second.active_connections, 1);
}

#[tokio::test]
async fn rejected_heartbeat_is_not_transient() {
    let client = HttpAdmissionClient::new(start(1).await);
    let err = client
        .heartbeat(&request("", "AAAAAAAA", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, NetError::Status(400)));
    assert!(!err.is_transient());
}
