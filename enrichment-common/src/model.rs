//! Core data types shared by every component: task payloads, final results,
//! cache entries, and the derived job-status view.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The triple that identifies a unit of idempotent work.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    pub task_kind: String,
    pub job_id: String,
    pub entity_id: String,
}

impl IdempotencyKey {
    pub fn new(
        task_kind: impl Into<String>,
        job_id: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        Self {
            task_kind: task_kind.into(),
            job_id: job_id.into(),
            entity_id: entity_id.into(),
        }
    }
}

/// The JSON payload delivered by the queue for one task execution.
///
/// Unknown fields are preserved verbatim in `extra` so a retried delivery can
/// be re-emitted byte-identical to what was received.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPayload {
    pub job_id: String,
    pub task_kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lead_id: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum TaskPayloadError {
    #[error("task payload is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("task payload must set exactly one of `account_id` or `lead_id`")]
    AmbiguousEntity,
}

impl TaskPayload {
    /// Returns the entity this payload targets: whichever of
    /// `account_id`/`lead_id` is present.
    pub fn entity_id(&self) -> Result<&str, TaskPayloadError> {
        match (&self.account_id, &self.lead_id) {
            (Some(id), None) => Ok(id.as_str()),
            (None, Some(id)) => Ok(id.as_str()),
            (None, None) => Err(TaskPayloadError::MissingField("account_id|lead_id")),
            (Some(_), Some(_)) => Err(TaskPayloadError::AmbiguousEntity),
        }
    }

    pub fn idempotency_key(&self) -> Result<IdempotencyKey, TaskPayloadError> {
        Ok(IdempotencyKey::new(
            self.task_kind.clone(),
            self.job_id.clone(),
            self.entity_id()?.to_owned(),
        ))
    }
}

/// `status` of a final result, as carried in the callback payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Completed,
    Failed,
    Processing,
}

/// Error details attached to a `failed` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub r#type: String,
    pub message: String,
    pub stage: String,
}

/// The final result produced by a handler, and the unit the runner persists
/// to the result store and delivers through the callback transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalResult {
    pub job_id: String,
    pub task_kind: String,
    pub entity_id: String,
    pub status: ResultStatus,
    pub source: String,
    pub completion_percentage: u8,
    pub processed_data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<ErrorDetails>,
}

impl FinalResult {
    pub fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey::new(
            self.task_kind.clone(),
            self.job_id.clone(),
            self.entity_id.clone(),
        )
    }
}

/// Per-item outcome of a handler's bounded fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FanOutItem<T> {
    Ok(T),
    Err { item: Value, error: String },
}

/// What a handler returns to the runner: an optional final result plus a
/// free-form summary view returned to the delivery endpoint regardless of
/// whether a final result was produced.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Summary {
    #[serde(flatten)]
    pub fields: HashMap<String, Value>,
}

impl Summary {
    pub fn empty() -> Self {
        Self::default()
    }
}

pub type HandlerOutcome = (Option<FinalResult>, Summary);

/// One page of a (possibly split) callback delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackPage {
    pub job_id: String,
    pub task_kind: String,
    pub entity_id: String,
    pub status: ResultStatus,
    pub source: String,
    pub completion_percentage: u8,
    pub processed_data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<ErrorDetails>,
    pub page_index: u32,
    pub page_count: u32,
    pub request_id: String,
}

/// Derived job-status view, queried by the admin API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub task_kind: String,
    pub entity_id: String,
    pub status: JobStatusKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatusKind {
    Completed,
    Failed,
    Processing,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entity_id_prefers_account_then_lead() {
        let mut payload = TaskPayload {
            job_id: "j1".into(),
            task_kind: "enhance".into(),
            account_id: Some("a1".into()),
            lead_id: None,
            extra: HashMap::new(),
        };
        assert_eq!(payload.entity_id().unwrap(), "a1");

        payload.account_id = None;
        payload.lead_id = Some("l1".into());
        assert_eq!(payload.entity_id().unwrap(), "l1");
    }

    #[test]
    fn entity_id_rejects_missing_and_ambiguous() {
        let payload = TaskPayload {
            job_id: "j1".into(),
            task_kind: "enhance".into(),
            account_id: None,
            lead_id: None,
            extra: HashMap::new(),
        };
        assert!(matches!(
            payload.entity_id(),
            Err(TaskPayloadError::MissingField(_))
        ));

        let payload = TaskPayload {
            job_id: "j1".into(),
            task_kind: "enhance".into(),
            account_id: Some("a1".into()),
            lead_id: Some("l1".into()),
            extra: HashMap::new(),
        };
        assert!(matches!(
            payload.entity_id(),
            Err(TaskPayloadError::AmbiguousEntity)
        ));
    }

    #[test]
    fn unknown_fields_round_trip() {
        let raw = json!({
            "job_id": "j1",
            "task_kind": "enhance",
            "account_id": "a1",
            "website": "https://ex.com",
            "nested": {"k": 1},
        });
        let payload: TaskPayload = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(
            payload.extra.get("website").unwrap().as_str().unwrap(),
            "https://ex.com"
        );
        let back = serde_json::to_value(&payload).unwrap();
        assert_eq!(back["nested"]["k"], 1);
    }
}
