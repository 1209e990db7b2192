//! Remote side of the sync. Speaks the WakaTime compatible bulk heartbeat endpoint.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{
    config::Config,
    error::{ConfigError, SyncError},
    tracker::storage::entities::{ActivityKind, Heartbeat},
};

const BULK_PATH: &str = "/users/current/heartbeats.bulk";

/// Outcome of a single heartbeat in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemResult {
    Accepted,
    Rejected { status: u16, message: String },
}

/// What the remote confirmed for a batch it answered with success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchReceipt {
    AllAccepted,
    /// One result per submitted heartbeat, in submission order.
    PerItem(Vec<ItemResult>),
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait HeartbeatApi: Send + Sync + 'static {
    async fn send_batch(&self, batch: Vec<Heartbeat>) -> Result<BatchReceipt, SyncError>;
}

#[derive(Debug, Serialize)]
struct WireHeartbeat<'a> {
    entity: &'a str,
    #[serde(rename = "type")]
    entity_type: &'static str,
    category: &'static str,
    time: f64,
    project: &'a str,
    is_write: bool,
    plugin: &'a str,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    responses: Vec<(Value, u16)>,
}

#[derive(Clone)]
pub struct HttpHeartbeatApi {
    agent: ureq::Agent,
    url: String,
    authorization: String,
    user_agent: String,
}

impl HttpHeartbeatApi {
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        let api_key = config.require_api_key()?;
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(config.request_timeout()))
            .http_status_as_error(false)
            .build()
            .into();
        Ok(Self {
            agent,
            url: normalize_heartbeats_url(&config.api_url),
            authorization: format!("Basic {}", STANDARD.encode(api_key)),
            user_agent: user_agent(config.plugin.as_deref()),
        })
    }

    fn post(&self, body: Vec<u8>) -> Result<(u16, String), SyncError> {
        let mut response = self
            .agent
            .post(&self.url)
            .header("Authorization", &self.authorization)
            .header("User-Agent", &self.user_agent)
            .header("Content-Type", "application/json")
            .send(&body[..])
            .map_err(transport_error)?;
        let status = response.status().as_u16();
        let body = response
            .body_mut()
            .read_to_string()
            .map_err(transport_error)?;
        Ok((status, body))
    }
}

#[async_trait]
impl HeartbeatApi for HttpHeartbeatApi {
    async fn send_batch(&self, batch: Vec<Heartbeat>) -> Result<BatchReceipt, SyncError> {
        let body = serde_json::to_vec(&to_wire(&batch, &self.user_agent))
            .map_err(|e| SyncError::MalformedResponse(format!("failed to encode batch: {e}")))?;
        debug!("Posting {} heartbeats to {}", batch.len(), self.url);

        let api = self.clone();
        let (status, body) = tokio::task::spawn_blocking(move || api.post(body))
            .await
            .map_err(|e| SyncError::Unreachable(format!("request task failed: {e}")))??;
        interpret_response(status, &body, batch.len())
    }
}

fn transport_error(error: ureq::Error) -> SyncError {
    match error {
        ureq::Error::Timeout(_) => SyncError::Timeout,
        other => SyncError::Unreachable(other.to_string()),
    }
}

fn to_wire<'a>(batch: &'a [Heartbeat], plugin: &'a str) -> Vec<WireHeartbeat<'a>> {
    batch
        .iter()
        .map(|heartbeat| WireHeartbeat {
            entity: &heartbeat.entity,
            entity_type: "file",
            category: match heartbeat.kind {
                ActivityKind::Edit | ActivityKind::Save => "designing",
                ActivityKind::View => "browsing",
            },
            time: heartbeat.epoch_seconds(),
            project: &heartbeat.project,
            is_write: heartbeat.is_write,
            plugin,
        })
        .collect()
}

fn user_agent(plugin: Option<&str>) -> String {
    let own = format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    match plugin.map(str::trim).filter(|plugin| !plugin.is_empty()) {
        Some(plugin) => format!("{plugin} {own}"),
        None => own,
    }
}

/// Classifies the answer of the bulk endpoint.
pub fn interpret_response(
    status: u16,
    body: &str,
    batch_len: usize,
) -> Result<BatchReceipt, SyncError> {
    match status {
        200..=299 => {}
        401 | 403 => return Err(SyncError::Unauthorized(status)),
        400 | 413 | 422 => {
            return Err(SyncError::InvalidPayload {
                status,
                message: body.chars().take(200).collect(),
            })
        }
        _ => return Err(SyncError::ServerStatus(status)),
    }

    if body.trim().is_empty() {
        return Ok(BatchReceipt::AllAccepted);
    }
    let parsed: BulkResponse = serde_json::from_str(body)
        .map_err(|e| SyncError::MalformedResponse(e.to_string()))?;
    if parsed.responses.len() != batch_len {
        return Err(SyncError::MalformedResponse(format!(
            "expected {batch_len} results, got {}",
            parsed.responses.len()
        )));
    }
    Ok(BatchReceipt::PerItem(
        parsed
            .responses
            .into_iter()
            .map(|(body, status)| match status {
                200..=299 => ItemResult::Accepted,
                _ => ItemResult::Rejected {
                    status,
                    message: body.to_string(),
                },
            })
            .collect(),
    ))
}

/// Turns the configured api url into the bulk heartbeat endpoint. Accepts a bare host, an
/// `/api` or `/api/v1` base or a url that already points at a heartbeat endpoint.
pub fn normalize_heartbeats_url(api_url: &str) -> String {
    let mut base = api_url.trim().trim_end_matches('/');
    for suffix in [BULK_PATH, "/heartbeats.bulk", "/heartbeats"] {
        if let Some(stripped) = base.strip_suffix(suffix) {
            base = stripped.trim_end_matches('/');
            break;
        }
    }
    let base = if base.ends_with("/api/v1") || base.ends_with("/v1") {
        base.to_string()
    } else if base.ends_with("/api") {
        format!("{base}/v1")
    } else {
        format!("{base}/api/v1")
    };
    format!("{base}{BULK_PATH}")
}
