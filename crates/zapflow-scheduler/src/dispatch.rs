//! Follow-up dispatch — turns a claimed job into an outbound send request and
//! classifies the transport's answer as sent, queued or error.
//!
//! The transport is a black-box HTTP endpoint. A non-2xx response is an error
//! whatever the body says.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zapflow_core::config::DispatchConfig;
use zapflow_core::{FollowUp, JsonPayload};

use crate::store::ClaimedJob;

/// Longest response body kept in an error message.
const MAX_ERROR_BODY: usize = 500;

/// What the transport did with the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Delivered to the chat channel.
    Sent { variant: Option<String> },
    /// Accepted but deferred by far-side policy (quiet hours, guardrails).
    Queued { variant: Option<String> },
}

/// Dispatch failure. Always retryable from the transport's point of view;
/// the scheduler decides between retry and terminal failure.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Connection, timeout or other transport failure.
    #[error("dispatch request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Non-2xx response.
    #[error("dispatch endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// 2xx response with a status we do not understand.
    #[error("unrecognized dispatch status '{0}'")]
    UnknownStatus(String),

    /// 2xx response whose body is not the expected JSON.
    #[error("malformed dispatch response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(
        &self,
        claimed: &ClaimedJob,
        worker_id: &str,
    ) -> Result<DispatchOutcome, DispatchError>;
}

/// Stable idempotency key for a job.
///
/// An explicit key on the job wins; otherwise the key is derived from
/// `(lead_id, id, created_at)` so every retry of the same job carries the
/// same key.
pub fn idempotency_key(job: &FollowUp) -> String {
    if let Some(key) = job.idempotency_key.as_ref().filter(|k| !k.is_empty()) {
        return key.clone();
    }
    let mut hasher = Sha256::new();
    hasher.update(format!("followup:{}:{}:{}", job.lead_id, job.id, job.created_at));
    format!("{:x}", hasher.finalize())
}

/// JSON body sent to the transport.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest<'a> {
    pub name: &'a str,
    pub command_id: Option<&'a str>,
    pub idempotency_key: String,
    pub lead: LeadAddress<'a>,
    pub objective: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constraints: Option<&'a JsonPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cta: Option<&'a JsonPayload>,
    pub ab_test: bool,
    pub metadata: DispatchMetadata<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadAddress<'a> {
    pub wa_jid: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchMetadata<'a> {
    pub follow_up_id: &'a str,
    pub lead_id: &'a str,
    pub attempt: u32,
    pub template_id: Option<&'a str>,
    pub worker_id: &'a str,
}

impl<'a> DispatchRequest<'a> {
    pub fn build(name: &'a str, claimed: &'a ClaimedJob, worker_id: &'a str) -> Self {
        let job = &claimed.job;
        Self {
            name,
            command_id: job.command_id.as_deref(),
            idempotency_key: idempotency_key(job),
            lead: LeadAddress {
                wa_jid: &claimed.lead.wa_jid,
            },
            objective: &job.objective,
            constraints: job.constraints.as_ref(),
            cta: job.cta.as_ref(),
            ab_test: job.ab_test,
            metadata: DispatchMetadata {
                follow_up_id: &job.id,
                lead_id: &job.lead_id,
                attempt: job.attempts,
                template_id: job.template_id.as_deref(),
                worker_id,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct DispatchResponse {
    status: String,
    #[serde(default)]
    variant: Option<String>,
}

/// Classify a 2xx response body.
fn classify(body: &str) -> Result<DispatchOutcome, DispatchError> {
    let resp: DispatchResponse =
        serde_json::from_str(body).map_err(|e| DispatchError::Malformed(e.to_string()))?;
    match resp.status.to_ascii_uppercase().as_str() {
        "SENT" => Ok(DispatchOutcome::Sent {
            variant: resp.variant,
        }),
        "QUEUED" => Ok(DispatchOutcome::Queued {
            variant: resp.variant,
        }),
        _ => Err(DispatchError::UnknownStatus(resp.status)),
    }
}

fn truncate(mut s: String) -> String {
    if s.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
        s.push('…');
    }
    s
}

/// HTTP dispatch client.
pub struct HttpDispatcher {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
    automation_name: String,
    timeout: Duration,
}

impl HttpDispatcher {
    pub fn new(config: &DispatchConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: config.url.clone(),
            token: config.token.clone().filter(|t| !t.is_empty()),
            automation_name: config.automation_name.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn dispatch(
        &self,
        claimed: &ClaimedJob,
        worker_id: &str,
    ) -> Result<DispatchOutcome, DispatchError> {
        let body = DispatchRequest::build(&self.automation_name, claimed, worker_id);
        tracing::debug!(
            follow_up = %claimed.job.id,
            key = %body.idempotency_key,
            "dispatching follow-up"
        );

        let mut req = self
            .client
            .post(&self.url)
            .json(&body)
            .timeout(self.timeout);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            return Err(DispatchError::Status {
                status: status.as_u16(),
                body: truncate(text),
            });
        }
        classify(&text)
    }
}
