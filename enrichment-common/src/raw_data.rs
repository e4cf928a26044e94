//! The raw-data/audit trail backing the job-status derivation and the admin
//! API's failed-job listing and retry-replay check.
//!
//! Every delivery attempt appends one row per stage (`received`,
//! `completed`, `failed`) rather than updating a row in place, matching the
//! append-only discipline the result store and caches already use.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::warn;

use crate::error::CacheError;
use crate::model::{IdempotencyKey, TaskPayload};
use crate::warehouse::WarehouseClient;

#[derive(Debug, Clone)]
pub struct RawDataRow {
    pub stage: String,
    pub data: Value,
    pub error: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct RawDataStore {
    warehouse: WarehouseClient,
}

impl RawDataStore {
    pub fn new(warehouse: WarehouseClient) -> Self {
        Self { warehouse }
    }

    /// Appends a stage row. Write failures are logged and swallowed: the
    /// audit trail must never fail the delivery it is describing.
    pub async fn record(&self, key: &IdempotencyKey, stage: &str, data: Value, error: Option<Value>) {
        if let Err(err) = self.record_inner(key, stage, data, error).await {
            warn!(
                task_kind = %key.task_kind, job_id = %key.job_id, entity_id = %key.entity_id,
                stage, error = %err, "raw-data write failed, proceeding without it"
            );
        }
    }

    async fn record_inner(
        &self,
        key: &IdempotencyKey,
        stage: &str,
        data: Value,
        error: Option<Value>,
    ) -> Result<(), CacheError> {
        sqlx::query(
            "INSERT INTO enrichment_raw_data (job_id, entity_id, task_kind, stage, data_json, error_json) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&key.job_id)
        .bind(&key.entity_id)
        .bind(&key.task_kind)
        .bind(stage)
        .bind(data)
        .bind(error)
        .execute(self.warehouse.pool())
        .await?;
        Ok(())
    }

    /// All rows for `(job_id, entity_id, task_kind)`, newest first.
    pub async fn history(
        &self,
        job_id: &str,
        entity_id: &str,
        task_kind: &str,
    ) -> Result<Vec<RawDataRow>, CacheError> {
        let rows: Vec<(String, Value, Option<Value>, DateTime<Utc>)> = sqlx::query_as(
            "SELECT stage, data_json, error_json, created_at FROM enrichment_raw_data \
             WHERE job_id = $1 AND entity_id = $2 AND task_kind = $3 \
             ORDER BY created_at DESC",
        )
        .bind(job_id)
        .bind(entity_id)
        .bind(task_kind)
        .fetch_all(self.warehouse.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|(stage, data, error, created_at)| RawDataRow {
                stage,
                data,
                error,
                created_at,
            })
            .collect())
    }

    /// Every `(job_id, entity_id, task_kind)` whose most recent row is a
    /// `failed` stage, most recently failed first, optionally filtered by
    /// `task_kind` and restricted to failures at or after `since`.
    pub async fn list_failed(
        &self,
        since: DateTime<Utc>,
        task_kind: Option<&str>,
    ) -> Result<Vec<RawDataRow>, CacheError> {
        let rows: Vec<(String, String, String, String, Value, Option<Value>, DateTime<Utc>)> = sqlx::query_as(
            "SELECT DISTINCT ON (job_id, entity_id, task_kind) \
                 job_id, entity_id, task_kind, stage, data_json, error_json, created_at \
             FROM enrichment_raw_data \
             WHERE ($1::text IS NULL OR task_kind = $1) \
             ORDER BY job_id, entity_id, task_kind, created_at DESC",
        )
        .bind(task_kind)
        .fetch_all(self.warehouse.pool())
        .await?;

        Ok(rows
            .into_iter()
            .filter(|(_, _, _, stage, _, _, created_at)| stage == "failed" && *created_at >= since)
            .map(|(job_id, entity_id, task_kind, stage, data, error, created_at)| RawDataRow {
                stage: format!("{job_id}:{entity_id}:{task_kind}:{stage}"),
                data,
                error,
                created_at,
            })
            .collect())
    }

    /// Every distinct `(task_kind, entity_id)` this `job_id` has ever touched
    /// — a job may fan out across more than one entity or task_kind, so the
    /// admin status endpoint reports one row per pair rather than assuming
    /// a 1:1 job-to-entity mapping.
    pub async fn job_entities(&self, job_id: &str) -> Result<Vec<(String, String)>, CacheError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT DISTINCT task_kind, entity_id FROM enrichment_raw_data WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_all(self.warehouse.pool())
        .await?;
        Ok(rows)
    }

    /// Returns `Some(payload)` if the most recent `received` snapshot for
    /// this key deserializes into a complete, replayable `TaskPayload`: a
    /// row stored before the payload shape stabilized, or one that only
    /// recorded a partial batch, fails to deserialize and yields `None`.
    pub async fn replayable_payload(&self, key: &IdempotencyKey) -> Result<Option<TaskPayload>, CacheError> {
        let history = self.history(&key.job_id, &key.entity_id, &key.task_kind).await?;
        let Some(received) = history.into_iter().find(|row| row.stage == "received") else {
            return Ok(None);
        };
        Ok(serde_json::from_value(received.data).ok())
    }
}
