//! Client side of the heartbeat/admission RPC.

use async_trait::async_trait;
use murmur_shared::{HeartbeatRequest, HeartbeatResponse};
use tracing::debug;

use crate::error::NetError;

/// Remote arbiter of realtime leases. Answers every heartbeat with `active`
/// or `queued`; being queued is a normal outcome, not an error.
#[async_trait]
pub trait AdmissionService: Send + Sync + 'static {
    async fn heartbeat(&self, request: &HeartbeatRequest) -> Result<HeartbeatResponse, NetError>;
}

/// Talks to the admission server's `POST /heartbeat` endpoint.
#[derive(Clone)]
pub struct HttpAdmissionClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAdmissionClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn heartbeat_url(&self) -> String {
        format!("{}/heartbeat", self.base_url)
    }
}

#[async_trait]
impl AdmissionService for HttpAdmissionClient {
    async fn heartbeat(&self, request: &HeartbeatRequest) -> Result<HeartbeatResponse, NetError> {
        let resp = self
            .client
            .post(self.heartbeat_url())
            .json(request)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(NetError::Status(resp.status().as_u16()));
        }

        let body: HeartbeatResponse = resp.json().await?;
        debug!(
            handle = %request.pin_handle,
            status = ?body.status,
            active = body.active_connections,
            "heartbeat answered"
        );
        Ok(body)
    }
}
