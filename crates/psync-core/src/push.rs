//! Inbound push-channel contract.
//!
//! Envelopes are decoded in two steps: the outer `{type, data}` shape is always accepted so that
//! unknown message types can be reported, then `PushMessage::from_envelope` validates `data`
//! against the shape required for the recognized type.

use crate::BulkAction;
use serde::de::{self, DeserializeOwned, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

pub const BULK_DELETE_PROGRESS: &str = "bulk_delete_progress";
pub const BULK_RESTORE_PROGRESS: &str = "bulk_restore_progress";
pub const IMPORT_PROGRESS: &str = "import_progress";
pub const CAMPAIGN_STARTED: &str = "campaign_started";
pub const MESSAGE_UPDATED: &str = "message_updated";

pub const RECOGNIZED_TYPES: [&str; 5] = [
    BULK_DELETE_PROGRESS,
    BULK_RESTORE_PROGRESS,
    IMPORT_PROGRESS,
    CAMPAIGN_STARTED,
    MESSAGE_UPDATED,
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, alias = "companyId", skip_serializing_if = "Option::is_none")]
    pub company_id: Option<String>,
}

impl PushEnvelope {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            company_id: None,
        }
    }

    pub fn for_company(mut self, company_id: impl Into<String>) -> Self {
        self.company_id = Some(company_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PushError {
    #[error("unrecognized push message type: {0}")]
    UnknownType(String),
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: String, reason: String },
}

/// Cumulative counters reported by aggregate progress messages.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AggregateProgress {
    pub status: String,
    #[serde(default, deserialize_with = "deserialize_count")]
    pub total: u64,
    #[serde(default, deserialize_with = "deserialize_count")]
    pub processed: u64,
    #[serde(default, deserialize_with = "deserialize_count")]
    pub successful: u64,
    #[serde(default, deserialize_with = "deserialize_count")]
    pub failed: u64,
    #[serde(
        default,
        alias = "operationId",
        alias = "job_id",
        alias = "jobId",
        deserialize_with = "deserialize_opt_id"
    )]
    pub operation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImportProgress {
    #[serde(flatten)]
    pub progress: AggregateProgress,
    #[serde(default, deserialize_with = "deserialize_count")]
    pub duplicates: u64,
    #[serde(default, deserialize_with = "deserialize_count")]
    pub updated: u64,
    #[serde(
        default,
        rename = "noWhatsApp",
        alias = "no_whatsapp",
        deserialize_with = "deserialize_count"
    )]
    pub no_whatsapp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CampaignStarted {
    #[serde(alias = "scheduleId", deserialize_with = "deserialize_id")]
    pub schedule_id: String,
    #[serde(default, alias = "scheduleName")]
    pub schedule_name: Option<String>,
    #[serde(
        default,
        alias = "total_messages",
        alias = "totalMessages",
        deserialize_with = "deserialize_count"
    )]
    pub total: u64,
    #[serde(
        default,
        alias = "campaignKind",
        alias = "campaign_type",
        alias = "campaignType"
    )]
    pub campaign_kind: Option<String>,
    #[serde(
        default,
        alias = "batchCount",
        alias = "total_batches",
        alias = "totalBatches",
        deserialize_with = "deserialize_count"
    )]
    pub batch_count: u64,
    #[serde(
        default,
        alias = "batchesDone",
        alias = "completed_batches",
        deserialize_with = "deserialize_count"
    )]
    pub batches_done: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MessageUpdated {
    #[serde(alias = "scheduleId", deserialize_with = "deserialize_id")]
    pub schedule_id: String,
    #[serde(alias = "messageId", deserialize_with = "deserialize_id")]
    pub message_id: String,
    pub status: String,
    #[serde(default, alias = "contactName")]
    pub contact_name: Option<String>,
    #[serde(default, alias = "phoneNumber")]
    pub phone_number: Option<String>,
}

impl MessageUpdated {
    /// Display label for the recent-items list.
    pub fn label(&self) -> String {
        match (self.contact_name.as_deref(), self.phone_number.as_deref()) {
            (Some(name), Some(phone)) if !name.trim().is_empty() => format!("{name} ({phone})"),
            (Some(name), None) if !name.trim().is_empty() => name.to_string(),
            (_, Some(phone)) => phone.to_string(),
            _ => self.message_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushMessage {
    BulkProgress {
        action: BulkAction,
        progress: AggregateProgress,
    },
    ImportProgress(ImportProgress),
    CampaignStarted(CampaignStarted),
    MessageUpdated(MessageUpdated),
}

impl PushMessage {
    pub fn from_envelope(envelope: &PushEnvelope) -> Result<Self, PushError> {
        match envelope.kind.as_str() {
            BULK_DELETE_PROGRESS => Ok(PushMessage::BulkProgress {
                action: BulkAction::Delete,
                progress: parse_data(envelope)?,
            }),
            BULK_RESTORE_PROGRESS => Ok(PushMessage::BulkProgress {
                action: BulkAction::Restore,
                progress: parse_data(envelope)?,
            }),
            IMPORT_PROGRESS => Ok(PushMessage::ImportProgress(parse_data(envelope)?)),
            CAMPAIGN_STARTED => Ok(PushMessage::CampaignStarted(parse_data(envelope)?)),
            MESSAGE_UPDATED => Ok(PushMessage::MessageUpdated(parse_data(envelope)?)),
            other => Err(PushError::UnknownType(other.to_string())),
        }
    }
}

fn parse_data<T: DeserializeOwned>(envelope: &PushEnvelope) -> Result<T, PushError> {
    serde_json::from_value(envelope.data.clone()).map_err(|err| PushError::InvalidPayload {
        kind: envelope.kind.clone(),
        reason: err.to_string(),
    })
}

/// Accepts unsigned, signed, float, numeric-string or null counts; negatives clamp to zero.
fn deserialize_count<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    struct CountVisitor;

    impl<'de> Visitor<'de> for CountVisitor {
        type Value = u64;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a count as number or numeric string")
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value)
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(u64::try_from(value).unwrap_or(0))
        }

        fn visit_f64<E>(self, value: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if value.is_finite() && value > 0.0 {
                Ok(value.trunc() as u64)
            } else {
                Ok(0)
            }
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return Ok(0);
            }
            trimmed
                .parse::<i64>()
                .map(|parsed| u64::try_from(parsed).unwrap_or(0))
                .map_err(|err| E::custom(format!("invalid count '{value}': {err}")))
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(0)
        }

        fn visit_none<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(0)
        }
    }

    deserializer.deserialize_any(CountVisitor)
}

fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(de::Error::custom("expected string or number for id")),
    }
}

fn deserialize_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(None),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        _ => Err(de::Error::custom("expected string or number for id")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bulk_progress_accepts_numeric_strings() {
        let envelope = PushEnvelope::new(
            BULK_DELETE_PROGRESS,
            json!({"status":"processing","total":"50","processed":3,"successful":"2","failed":1}),
        );
        let PushMessage::BulkProgress { action, progress } =
            PushMessage::from_envelope(&envelope).expect("parse")
        else {
            panic!("expected bulk progress")
        };
        assert_eq!(action, BulkAction::Delete);
        assert_eq!(progress.total, 50);
        assert_eq!(progress.successful, 2);
        assert_eq!(progress.failed, 1);
        assert_eq!(progress.operation_id, None);
    }

    #[test]
    fn import_progress_reads_camel_case_whatsapp_counter() {
        let envelope = PushEnvelope::new(
            IMPORT_PROGRESS,
            json!({
                "status": "processing",
                "total": 100,
                "processed": 10,
                "successful": 8,
                "failed": 2,
                "duplicates": 3,
                "updated": 1,
                "noWhatsApp": 4,
                "jobId": 77
            }),
        );
        let PushMessage::ImportProgress(import) =
            PushMessage::from_envelope(&envelope).expect("parse")
        else {
            panic!("expected import progress")
        };
        assert_eq!(import.no_whatsapp, 4);
        assert_eq!(import.duplicates, 3);
        assert_eq!(import.progress.operation_id.as_deref(), Some("77"));
    }

    #[test]
    fn message_updated_requires_ids() {
        let envelope = PushEnvelope::new(MESSAGE_UPDATED, json!({"status": "sent"}));
        assert!(matches!(
            PushMessage::from_envelope(&envelope),
            Err(PushError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn message_label_prefers_contact_name() {
        let envelope = PushEnvelope::new(
            MESSAGE_UPDATED,
            json!({
                "scheduleId": 9,
                "messageId": "m1",
                "status": "sent",
                "contactName": "Ana",
                "phoneNumber": "+5511999990000"
            }),
        );
        let PushMessage::MessageUpdated(message) =
            PushMessage::from_envelope(&envelope).expect("parse")
        else {
            panic!("expected message update")
        };
        assert_eq!(message.schedule_id, "9");
        assert_eq!(message.label(), "Ana (+5511999990000)");
    }

    #[test]
    fn unknown_type_is_reported() {
        let envelope: PushEnvelope =
            serde_json::from_str(r#"{"type":"contact_created","data":{},"companyId":"c1"}"#)
                .expect("parse envelope");
        assert_eq!(envelope.company_id.as_deref(), Some("c1"));
        assert_eq!(
            PushMessage::from_envelope(&envelope),
            Err(PushError::UnknownType("contact_created".to_string()))
        );
    }
}
