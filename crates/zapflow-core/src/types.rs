//! Follow-up job and lead records — the data model the scheduler works on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ZapflowError};

/// Default ceiling on claim attempts per job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Milliseconds since the Unix epoch for a timestamp.
pub fn epoch_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// A scheduled outbound follow-up message.
///
/// Owned by the job store. The scheduler never writes these fields directly;
/// every state change goes through a `JobStore` operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowUp {
    /// Stable identifier.
    pub id: String,
    /// Recipient lead.
    pub lead_id: String,
    pub status: FollowUpStatus,
    /// Epoch-ms at which the job becomes due. `None` means "as soon as possible".
    pub scheduled_at: Option<i64>,
    /// Epoch-ms of the current lease, if any.
    pub processing_at: Option<i64>,
    /// Worker holding the current lease, if any.
    pub worker_id: Option<String>,
    /// Number of times the job has been claimed.
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub objective: String,
    pub constraints: Option<JsonPayload>,
    pub cta: Option<JsonPayload>,
    pub ab_test: bool,
    pub template_id: Option<String>,
    /// Explicit idempotency key. When absent the dispatch client derives one.
    pub idempotency_key: Option<String>,
    pub command_id: Option<String>,
    pub created_at: i64,
    pub sent_at: Option<i64>,
    /// A/B variant reported by the transport on delivery.
    pub variant: Option<String>,
}

impl FollowUp {
    /// Whether the job reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, FollowUpStatus::Sent | FollowUpStatus::Failed)
    }

    /// Whether `worker_id` currently holds the lease on this job.
    pub fn is_leased_by(&self, worker_id: &str) -> bool {
        self.status == FollowUpStatus::Processing && self.worker_id.as_deref() == Some(worker_id)
    }
}

/// Follow-up lifecycle: `scheduled → processing → {sent | failed | scheduled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FollowUpStatus {
    Scheduled,
    Processing,
    Sent,
    Failed,
}

impl FollowUpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FollowUpStatus::Scheduled => "scheduled",
            FollowUpStatus::Processing => "processing",
            FollowUpStatus::Sent => "sent",
            FollowUpStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "scheduled" => Ok(FollowUpStatus::Scheduled),
            "processing" => Ok(FollowUpStatus::Processing),
            "sent" => Ok(FollowUpStatus::Sent),
            "failed" => Ok(FollowUpStatus::Failed),
            other => Err(ZapflowError::Store(format!("unknown follow-up status '{other}'"))),
        }
    }
}

impl std::fmt::Display for FollowUpStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Opaque JSON object forwarded to the dispatch transport.
///
/// Validated once at the boundary (must be a JSON object); the scheduler only
/// ever reads the `cooldownHours` constraint out of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "serde_json::Value", into = "serde_json::Value")]
pub struct JsonPayload(serde_json::Map<String, serde_json::Value>);

impl JsonPayload {
    /// Parse a JSON string, rejecting anything that is not an object.
    pub fn parse(raw: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        Self::try_from(value)
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::Value::Object(self.0.clone())
    }

    pub fn to_json_string(&self) -> String {
        self.to_value().to_string()
    }

    /// Cooldown constraint in hours, when present and non-negative.
    pub fn cooldown_hours(&self) -> Option<f64> {
        self.0
            .get("cooldownHours")
            .or_else(|| self.0.get("cooldown_hours"))
            .and_then(|v| v.as_f64())
            .filter(|h| h.is_finite() && *h >= 0.0)
    }
}

impl TryFrom<serde_json::Value> for JsonPayload {
    type Error = ZapflowError;

    fn try_from(value: serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Object(map) => Ok(Self(map)),
            other => Err(ZapflowError::InvalidPayload(format!(
                "expected a JSON object, got {other}"
            ))),
        }
    }
}

impl From<JsonPayload> for serde_json::Value {
    fn from(p: JsonPayload) -> Self {
        serde_json::Value::Object(p.0)
    }
}

/// Input for creating a new follow-up job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFollowUp {
    pub lead_id: String,
    pub objective: String,
    pub scheduled_at: Option<i64>,
    pub max_attempts: Option<u32>,
    pub constraints: Option<JsonPayload>,
    pub cta: Option<JsonPayload>,
    #[serde(default)]
    pub ab_test: bool,
    pub template_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub command_id: Option<String>,
}

impl NewFollowUp {
    pub fn new(lead_id: &str, objective: &str) -> Self {
        Self {
            lead_id: lead_id.to_string(),
            objective: objective.to_string(),
            ..Default::default()
        }
    }

    /// Schedule for a specific epoch-ms instead of "as soon as possible".
    pub fn at(mut self, scheduled_at: i64) -> Self {
        self.scheduled_at = Some(scheduled_at);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_constraints(mut self, constraints: JsonPayload) -> Self {
        self.constraints = Some(constraints);
        self
    }
}

/// A conversation recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lead {
    pub id: String,
    /// WhatsApp chat id, e.g. `5511999999999@s.whatsapp.net`.
    pub wa_jid: String,
    pub name: String,
    pub opted_out: bool,
    /// Outbound messages delivered to this lead.
    pub outbound_count: u32,
    pub last_outbound_at: Option<i64>,
}

impl Lead {
    pub fn new(id: &str, wa_jid: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            wa_jid: wa_jid.to_string(),
            name: name.to_string(),
            opted_out: false,
            outbound_count: 0,
            last_outbound_at: None,
        }
    }
}

/// Job counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub scheduled: u64,
    pub processing: u64,
    pub sent: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.scheduled + self.processing + self.sent + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            FollowUpStatus::Scheduled,
            FollowUpStatus::Processing,
            FollowUpStatus::Sent,
            FollowUpStatus::Failed,
        ] {
            assert_eq!(FollowUpStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(FollowUpStatus::parse("cancelled").is_err());
    }

    #[test]
    fn test_payload_rejects_non_objects() {
        assert!(JsonPayload::parse("[1,2]").is_err());
        assert!(JsonPayload::parse("\"text\"").is_err());
        assert!(JsonPayload::parse("{not json").is_err());
        assert!(JsonPayload::parse(r#"{"tone":"friendly"}"#).is_ok());
    }

    #[test]
    fn test_cooldown_hours() {
        let p = JsonPayload::parse(r#"{"cooldownHours": 1.5}"#).unwrap();
        assert_eq!(p.cooldown_hours(), Some(1.5));

        let p = JsonPayload::parse(r#"{"cooldown_hours": 2}"#).unwrap();
        assert_eq!(p.cooldown_hours(), Some(2.0));

        let p = JsonPayload::parse(r#"{"cooldownHours": -1}"#).unwrap();
        assert_eq!(p.cooldown_hours(), None);

        let p = JsonPayload::parse(r#"{"tone":"short"}"#).unwrap();
        assert_eq!(p.cooldown_hours(), None);
    }

    #[test]
    fn test_payload_serde_is_transparent() {
        let p = JsonPayload::parse(r#"{"label":"Book a call"}"#).unwrap();
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, r#"{"label":"Book a call"}"#);
        let back: JsonPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
        assert!(serde_json::from_str::<JsonPayload>("42").is_err());
    }

    #[test]
    fn test_lease_ownership() {
        let mut job = FollowUp {
            id: "f1".into(),
            lead_id: "l1".into(),
            status: FollowUpStatus::Processing,
            scheduled_at: None,
            processing_at: Some(1),
            worker_id: Some("w1".into()),
            attempts: 1,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            last_error: None,
            objective: "reengage".into(),
            constraints: None,
            cta: None,
            ab_test: false,
            template_id: None,
            idempotency_key: None,
            command_id: None,
            created_at: 0,
            sent_at: None,
            variant: None,
        };
        assert!(job.is_leased_by("w1"));
        assert!(!job.is_leased_by("w2"));
        job.status = FollowUpStatus::Sent;
        assert!(!job.is_leased_by("w1"));
        assert!(job.is_terminal());
    }
}
