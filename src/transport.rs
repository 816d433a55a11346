//! Delivery of sealed batches to the events endpoint.
//!
//! Two modes:
//! - [`Transport::send`]: standard async POST, cancellable by dropping or
//!   aborting the future, reports success or failure.
//! - [`Transport::send_beacon`]: unload-safe fire-and-forget. Returns
//!   immediately; the request runs detached and is never retried.

use crate::buffer::Batch;
use crate::error::DeliveryError;
use crate::event::NormalizedEvent;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// JSON body POSTed to the endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WirePayload {
    pub session_id: String,
    pub timestamp: u64,
    /// `"batch"` or `"session_end"`
    #[serde(rename = "type")]
    pub kind: String,
    pub events: Vec<NormalizedEvent>,
}

impl WirePayload {
    pub fn from_batch(batch: &Batch, now: u64) -> Self {
        let session_id = batch
            .events
            .last()
            .map(|e| e.session_id.clone())
            .unwrap_or_default();
        Self {
            session_id,
            timestamp: now,
            kind: batch.kind.wire_type().to_string(),
            events: batch.events.clone(),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one payload during normal operation.
    async fn send(&self, payload: &WirePayload) -> Result<(), DeliveryError>;

    /// Queue a payload for unload-safe delivery without waiting for it.
    /// Returns whether the payload was queued.
    fn send_beacon(&self, payload: &WirePayload) -> bool;
}

// ---------------------------------------------------------------------------
// HttpTransport
// ---------------------------------------------------------------------------

/// POSTs `application/json` payloads with reqwest.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, DeliveryError> {
        let endpoint = endpoint.into();
        if endpoint.trim().is_empty() {
            return Err(DeliveryError::Network("events endpoint must not be empty".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeliveryError::Network(format!("http client build failed: {e}")))?;
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

async fn post_json(
    client: &reqwest::Client,
    endpoint: &str,
    body: Vec<u8>,
) -> Result<(), DeliveryError> {
    let response = client
        .post(endpoint)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await
        .map_err(|e| DeliveryError::Network(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        return Err(DeliveryError::Status(status.as_u16()));
    }
    Ok(())
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, payload: &WirePayload) -> Result<(), DeliveryError> {
        let body = serde_json::to_vec(payload).map_err(|e| DeliveryError::Encode(e.to_string()))?;
        trace!(endpoint = %self.endpoint, bytes = body.len(), "posting payload");
        post_json(&self.client, &self.endpoint, body).await
    }

    fn send_beacon(&self, payload: &WirePayload) -> bool {
        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "beacon payload encoding failed");
                return false;
            }
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no runtime available for beacon delivery");
            return false;
        };
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let events = payload.events.len();
        runtime.spawn(async move {
            match post_json(&client, &endpoint, body).await {
                Ok(()) => debug!(events, "beacon delivered"),
                Err(e) => debug!(events, error = %e, "beacon lost"),
            }
        });
        true
    }
}

// ---------------------------------------------------------------------------
// DiscardTransport
// ---------------------------------------------------------------------------

/// Used when no endpoint is configured: logs each payload and reports success.
#[derive(Debug, Clone, Default)]
pub struct DiscardTransport;

#[async_trait]
impl Transport for DiscardTransport {
    async fn send(&self, payload: &WirePayload) -> Result<(), DeliveryError> {
        info!(
            kind = %payload.kind,
            session_id = %payload.session_id,
            events = payload.events.len(),
            "no endpoint configured, discarding payload"
        );
        Ok(())
    }

    fn send_beacon(&self, payload: &WirePayload) -> bool {
        info!(
            kind = %payload.kind,
            events = payload.events.len(),
            "no endpoint configured, discarding beacon"
        );
        true
    }
}
