//! The append-only idempotency store — the core of exactly-once semantics.
//!
//! `put` is `pub(crate)`: handlers never get a `ResultStore` handle at all
//! (see `handler::HandlerContext`), and the runner — the only caller — lives
//! in this same crate (`runner.rs`), so module privacy is what keeps handlers
//! from writing results directly, rather than a capability token threaded
//! across a crate boundary.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::warn;

use crate::callback::CallbackTransport;
use crate::error::{CacheError, TransportError};
use crate::model::{FinalResult, IdempotencyKey, ResultStatus};
use crate::warehouse::{WarehouseClient, MAX_ROW_BYTES};

pub struct ResultStore {
    warehouse: WarehouseClient,
}

impl ResultStore {
    pub fn new(warehouse: WarehouseClient) -> Self {
        Self { warehouse }
    }

    /// Returns the most recent completed payload for `key`, reassembling
    /// chunked payloads in index order, or `None` on miss.
    pub async fn get(&self, key: &IdempotencyKey) -> Result<Option<FinalResult>, CacheError> {
        let rows: Vec<(i32, i32, Value, DateTime<Utc>)> = sqlx::query_as(
            "SELECT chunk_index, chunk_count, payload_json, created_at \
             FROM enrichment_callbacks \
             WHERE task_kind = $1 AND job_id = $2 AND entity_id = $3 \
             ORDER BY created_at DESC",
        )
        .bind(&key.task_kind)
        .bind(&key.job_id)
        .bind(&key.entity_id)
        .fetch_all(self.warehouse.pool())
        .await?;

        // Group by the `created_at` of the chunk_index=0 row in each write
        // (concurrent writers for the same key are prevented by the runner;
        // if a race happens anyway, group by timestamp proximity is not
        // reliable, so instead treat rows in descending recency and take the
        // newest *complete* group: scan until we've seen chunk_count
        // distinct chunk_indexes that agree on chunk_count).
        let Some((_, chunk_count, _, _)) = rows.first() else {
            return Ok(None);
        };
        let chunk_count = *chunk_count;
        let mut chunks: Vec<Option<Value>> = vec![None; chunk_count.max(0) as usize];
        for (index, count, payload, _created_at) in &rows {
            if *count != chunk_count {
                continue;
            }
            if let Some(slot) = chunks.get_mut(*index as usize) {
                if slot.is_none() {
                    *slot = Some(payload.clone());
                }
            }
        }
        if chunks.iter().any(|c| c.is_none()) {
            return Ok(None);
        }

        let reassembled = reassemble(&chunks.into_iter().flatten().collect::<Vec<_>>());
        let result: FinalResult = serde_json::from_value(reassembled)?;
        Ok(Some(result))
    }

    pub(crate) async fn put(&self, result: &FinalResult) -> Result<(), CacheError> {
        if result.status != ResultStatus::Completed {
            // only a completed result is eligible for idempotent replay.
            return Ok(());
        }
        let key = result.idempotency_key();
        let payload = serde_json::to_value(result)?;
        let chunks = chunk_payload(&payload, MAX_ROW_BYTES);
        let chunk_count = chunks.len() as i32;
        let now = Utc::now();

        for (index, chunk) in chunks.into_iter().enumerate() {
            sqlx::query(
                "INSERT INTO enrichment_callbacks \
                 (task_kind, job_id, entity_id, chunk_index, chunk_count, payload_json, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(&key.task_kind)
            .bind(&key.job_id)
            .bind(&key.entity_id)
            .bind(index as i32)
            .bind(chunk_count)
            .bind(chunk)
            .bind(now)
            .execute(self.warehouse.pool())
            .await?;
        }
        Ok(())
    }

    /// Fetches the stored payload for `key` and redrives the callback
    /// transport — used when a redelivery discovers an existing entry.
    /// Pagination is re-derived fresh on every resend, never stored.
    pub async fn resend(
        &self,
        key: &IdempotencyKey,
        transport: &CallbackTransport,
    ) -> Result<bool, TransportError> {
        let stored = match self.get(key).await {
            Ok(Some(result)) => result,
            Ok(None) => return Ok(false),
            Err(err) => {
                warn!(error = %err, "result store read failed during resend");
                return Ok(false);
            }
        };
        transport.deliver(key, &stored).await?;
        Ok(true)
    }
}

/// Splits a JSON payload into chunks of at most `max_bytes` when serialized,
/// storing the value as a single "chunk 0 of 1" when it already fits.
///
/// Multi-chunk payloads are split on raw UTF-8 bytes and base64-encoded
/// before being boxed into a `Value::String`, so a chunk boundary landing
/// inside a multi-byte character never loses or corrupts data — splitting
/// the serialized bytes directly (and lossily re-decoding each piece as
/// UTF-8) would silently mangle any non-ASCII content straddling a boundary.
fn chunk_payload(payload: &Value, max_bytes: usize) -> Vec<Value> {
    let serialized = serde_json::to_string(payload).unwrap_or_default();
    if serialized.len() <= max_bytes {
        return vec![payload.clone()];
    }
    serialized
        .as_bytes()
        .chunks(max_bytes)
        .map(|bytes| Value::String(BASE64.encode(bytes)))
        .collect()
}

/// Reassembles chunks written by `chunk_payload`: a single chunk is the
/// original value; multiple chunks are base64-decoded, byte-concatenated,
/// and the result reparsed as JSON.
fn reassemble(chunks: &[Value]) -> Value {
    if chunks.len() == 1 {
        return chunks[0].clone();
    }
    let mut joined = Vec::new();
    for chunk in chunks {
        if let Some(s) = chunk.as_str() {
            if let Ok(mut bytes) = BASE64.decode(s) {
                joined.append(&mut bytes);
            }
        }
    }
    serde_json::from_slice(&joined).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ErrorDetails;

    fn sample(status: ResultStatus) -> FinalResult {
        FinalResult {
            job_id: "J1".into(),
            task_kind: "enhance".into(),
            entity_id: "A1".into(),
            status,
            source: "prov".into(),
            completion_percentage: 100,
            processed_data: serde_json::json!({"name": "Ex"}),
            error_details: if status == ResultStatus::Failed {
                Some(ErrorDetails {
                    r#type: "ProviderError".into(),
                    message: "boom".into(),
                    stage: "fetch".into(),
                })
            } else {
                None
            },
        }
    }

    #[test]
    fn chunk_and_reassemble_round_trip_small_payload() {
        let result = sample(ResultStatus::Completed);
        let payload = serde_json::to_value(&result).unwrap();
        let chunks = chunk_payload(&payload, MAX_ROW_BYTES);
        assert_eq!(chunks.len(), 1);
        let back = reassemble(&chunks);
        assert_eq!(back, payload);
    }

    #[test]
    fn chunk_and_reassemble_round_trip_large_payload() {
        let mut result = sample(ResultStatus::Completed);
        result.processed_data = serde_json::json!({"blob": "x".repeat(50)});
        let payload = serde_json::to_value(&result).unwrap();
        let chunks = chunk_payload(&payload, 10);
        assert!(chunks.len() > 1);
        let back = reassemble(&chunks);
        assert_eq!(back, payload);
    }

    #[test]
    fn chunk_and_reassemble_round_trip_multibyte_payload() {
        let mut result = sample(ResultStatus::Completed);
        // Multi-byte characters repeated so a chunk boundary (max_bytes=10)
        // is very likely to fall inside one of them.
        result.processed_data = serde_json::json!({"blob": "héllo wörld 日本語".repeat(10)});
        let payload = serde_json::to_value(&result).unwrap();
        let chunks = chunk_payload(&payload, 10);
        assert!(chunks.len() > 1);
        let back = reassemble(&chunks);
        assert_eq!(back, payload);
    }
}
