//! Task runner — the idempotency-aware execution loop invoked once per
//! queue delivery.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tracing::{info, warn};

use crate::callback::CallbackTransport;
use crate::error::RunnerError;
use crate::handler::HandlerContext;
use crate::model::{ErrorDetails, FinalResult, ResultStatus, Summary, TaskPayload};
use crate::raw_data::RawDataStore;
use crate::registry::TaskRegistry;
use crate::result_store::ResultStore;

pub struct Runner {
    registry: TaskRegistry,
    result_store: ResultStore,
    raw_data: RawDataStore,
    transport: CallbackTransport,
    handler_ctx: HandlerContext,
}

impl Runner {
    pub fn new(
        registry: TaskRegistry,
        result_store: ResultStore,
        raw_data: RawDataStore,
        transport: CallbackTransport,
        handler_ctx: HandlerContext,
    ) -> Self {
        Self {
            registry,
            result_store,
            raw_data,
            transport,
            handler_ctx,
        }
    }

    /// Runs the full idempotency-aware delivery within `deadline`. On
    /// deadline expiry returns `RunnerError::DeadlineExceeded`, mapped to a
    /// 5xx response so the queue redelivers.
    pub async fn handle_delivery(
        &self,
        task_kind: &str,
        payload: TaskPayload,
        deadline: Duration,
    ) -> Result<Summary, RunnerError> {
        match tokio::time::timeout(deadline, self.handle_delivery_inner(task_kind, payload)).await
        {
            Ok(result) => result,
            Err(_) => Err(RunnerError::DeadlineExceeded),
        }
    }

    async fn handle_delivery_inner(
        &self,
        task_kind: &str,
        payload: TaskPayload,
    ) -> Result<Summary, RunnerError> {
        let key = payload.idempotency_key()?;

        // Resolved before the idempotency lookup: an unregistered task_kind
        // is a structured 404 and should never cost a warehouse round trip,
        // let alone invoke a handler.
        let handler = self
            .registry
            .get(task_kind)
            .ok_or_else(|| RunnerError::UnknownTaskKind(task_kind.to_owned()))?;

        let payload_snapshot = serde_json::to_value(&payload).unwrap_or(serde_json::Value::Null);
        self.raw_data.record(&key, "received", payload_snapshot, None).await;

        let existing = self.result_store.get(&key).await.map_err(RunnerError::Store)?;
        if let Some(existing) = existing {
            info!(
                task_kind = %key.task_kind,
                job_id = %key.job_id,
                entity_id = %key.entity_id,
                "skip-reprocess: idempotency key already completed"
            );
            self.result_store
                .resend(&key, &self.transport)
                .await
                .map_err(RunnerError::TransportAfterStore)?;
            return Ok(summary_view(&existing));
        }

        let outcome = AssertUnwindSafe(handler.execute(&self.handler_ctx, payload))
            .catch_unwind()
            .await;

        let (result, summary) = match outcome {
            Ok(outcome) => outcome,
            Err(_panic) => {
                warn!(
                    task_kind = %key.task_kind,
                    job_id = %key.job_id,
                    entity_id = %key.entity_id,
                    "handler panicked; synthesizing a failed result"
                );
                let failed = FinalResult {
                    job_id: key.job_id.clone(),
                    task_kind: key.task_kind.clone(),
                    entity_id: key.entity_id.clone(),
                    status: ResultStatus::Failed,
                    source: "runner".to_owned(),
                    completion_percentage: 0,
                    processed_data: serde_json::Value::Null,
                    error_details: Some(ErrorDetails {
                        r#type: "InternalError".to_owned(),
                        message: "handler panicked".to_owned(),
                        stage: "execute".to_owned(),
                    }),
                };
                (Some(failed), Summary::empty())
            }
        };

        let Some(result) = result else {
            // (result=None, summary): no final callback, summary still returned.
            return Ok(summary);
        };

        if result.status == ResultStatus::Completed {
            self.raw_data
                .record(&key, "completed", result.processed_data.clone(), None)
                .await;
            self.result_store.put(&result).await.map_err(RunnerError::Store)?;
            self.transport
                .deliver(&key, &result)
                .await
                .map_err(RunnerError::TransportAfterStore)?;
        } else {
            let error = result
                .error_details
                .as_ref()
                .and_then(|details| serde_json::to_value(details).ok());
            self.raw_data
                .record(&key, "failed", serde_json::Value::Null, error)
                .await;
            // failures are never stored; delivery is non-idempotent, the
            // receiver deduplicates by job_id if it needs to.
            if let Err(err) = self.transport.deliver(&key, &result).await {
                warn!(error = %err, "best-effort failure callback did not complete");
            }
        }

        Ok(summary)
    }
}

fn summary_view(result: &FinalResult) -> Summary {
    let mut fields = std::collections::HashMap::new();
    fields.insert(
        "status".to_owned(),
        serde_json::to_value(result.status).unwrap_or_default(),
    );
    fields.insert(
        "completion_percentage".to_owned(),
        serde_json::Value::from(result.completion_percentage),
    );
    Summary { fields }
}
