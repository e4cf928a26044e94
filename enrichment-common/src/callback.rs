//! Paginated, authenticated callback transport.

use std::time::Duration;

use reqwest::StatusCode;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::auth::CallbackTokenSigner;
use crate::error::{Retryable, TransportError};
use crate::http_pool::SharedHttpClientPool;
use crate::model::{CallbackPage, FinalResult, IdempotencyKey};
use crate::retry::RetryPolicy;

/// Serialized body size excluding envelope.
pub const MAX_PAGE_BYTES: usize = 750_000;

pub struct CallbackTransport {
    http_pool: SharedHttpClientPool,
    signer: CallbackTokenSigner,
    callback_url: String,
    retry_policy: RetryPolicy,
}

impl CallbackTransport {
    pub fn new(
        http_pool: SharedHttpClientPool,
        signer: CallbackTokenSigner,
        callback_url: impl Into<String>,
    ) -> Self {
        Self {
            http_pool,
            signer,
            callback_url: callback_url.into(),
            retry_policy: RetryPolicy::callback_default(),
        }
    }

    fn receiver_origin(&self) -> String {
        url::Url::parse(&self.callback_url)
            .ok()
            .and_then(|u| u.origin().ascii_serialization().into())
            .unwrap_or_else(|| self.callback_url.clone())
    }

    /// Delivers every page of `result` in strict index order; a later page
    /// is only attempted once the earlier page is acknowledged.
    pub async fn deliver(
        &self,
        key: &IdempotencyKey,
        result: &FinalResult,
    ) -> Result<(), TransportError> {
        let pages = build_pages(key, result);
        let page_count = pages.len() as u32;
        for page in pages {
            info!(
                page_index = page.page_index,
                page_count, "delivering callback page"
            );
            self.send_page_with_retry(&page).await?;
        }
        Ok(())
    }

    async fn send_page_with_retry(&self, page: &CallbackPage) -> Result<(), TransportError> {
        let mut attempt = 1;
        loop {
            match self.send_page_once(page).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    let retryable = err.is_retryable();
                    if attempt >= self.retry_policy.max_attempts || !retryable {
                        warn!(
                            page_index = page.page_index,
                            attempt, error = %err, "callback page delivery failed terminally"
                        );
                        return Err(err);
                    }
                    let preferred_retry_interval = match &err {
                        TransportError::Retryable { retry_after, .. } => *retry_after,
                        _ => None,
                    };
                    let delay = self
                        .retry_policy
                        .reconcile_delay(attempt, preferred_retry_interval);
                    warn!(
                        page_index = page.page_index,
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %err,
                        "retrying callback page delivery"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn send_page_once(&self, page: &CallbackPage) -> Result<(), TransportError> {
        let token = self.signer.sign(&self.receiver_origin())?;
        let (client, _permit) = self.http_pool.acquire().await;

        let response = client
            .post(&self.callback_url)
            .bearer_auth(token)
            .json(page)
            .send()
            .await
            .map_err(|source| TransportError::Retryable {
                source,
                retry_after: None,
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = retry_after_from(&response);
            let source = response.error_for_status().unwrap_err();
            return Err(TransportError::Retryable { source, retry_after });
        }
        let source = response.error_for_status().unwrap_err();
        Err(TransportError::NonRetryable(source))
    }
}

/// Parses the `Retry-After` response header (seconds, per RFC 9110 §10.2.3;
/// HTTP-date values are not supported). Must run before the response is
/// converted into a `reqwest::Error` via `error_for_status`, which discards
/// headers.
fn retry_after_from(response: &reqwest::Response) -> Option<Duration> {
    let header = response.headers().get(reqwest::header::RETRY_AFTER)?;
    let seconds: u64 = header.to_str().ok()?.trim().parse().ok()?;
    Some(Duration::from_secs(seconds))
}

/// Splits `result.processed_data` into pages no larger than `MAX_PAGE_BYTES`,
/// chunking any top-level list-valued fields in lockstep and duplicating
/// every non-list field onto each page.
pub fn build_pages(key: &IdempotencyKey, result: &FinalResult) -> Vec<CallbackPage> {
    let chunks = split_processed_data(&result.processed_data, MAX_PAGE_BYTES);
    let page_count = chunks.len() as u32;
    chunks
        .into_iter()
        .enumerate()
        .map(|(index, processed_data)| CallbackPage {
            job_id: result.job_id.clone(),
            task_kind: result.task_kind.clone(),
            entity_id: result.entity_id.clone(),
            status: result.status,
            source: result.source.clone(),
            completion_percentage: result.completion_percentage,
            processed_data,
            error_details: result.error_details.clone(),
            page_index: index as u32,
            page_count,
            request_id: request_id(key, index as u32),
        })
        .collect()
}

fn request_id(key: &IdempotencyKey, page_index: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.task_kind.as_bytes());
    hasher.update(b"\0");
    hasher.update(key.job_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(key.entity_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(page_index.to_be_bytes());
    format!("{:x}", hasher.finalize())
}

fn split_processed_data(processed_data: &Value, max_bytes: usize) -> Vec<Value> {
    let full = serde_json::to_string(processed_data).unwrap_or_default();
    if full.len() <= max_bytes {
        return vec![processed_data.clone()];
    }

    let Some(obj) = processed_data.as_object() else {
        // Not splittable: send as a single oversized page rather than drop data.
        return vec![processed_data.clone()];
    };
    let list_keys: Vec<String> = obj
        .iter()
        .filter(|(_, v)| v.is_array())
        .map(|(k, _)| k.clone())
        .collect();
    if list_keys.is_empty() {
        return vec![processed_data.clone()];
    }

    let base: serde_json::Map<String, Value> = obj
        .iter()
        .filter(|(k, _)| !list_keys.contains(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let total_len = list_keys
        .iter()
        .filter_map(|k| obj[k].as_array())
        .map(|a| a.len())
        .max()
        .unwrap_or(0);

    let page_with_range = |start: usize, end: usize| -> Value {
        let mut page = base.clone();
        for key in &list_keys {
            let arr = obj[key].as_array().cloned().unwrap_or_default();
            let slice = arr.get(start..end.min(arr.len())).unwrap_or(&[]).to_vec();
            page.insert(key.clone(), Value::Array(slice));
        }
        Value::Object(page)
    };

    let mut pages = Vec::new();
    let mut start = 0;
    while start < total_len {
        let mut end = start + 1;
        while end <= total_len
            && serde_json::to_string(&page_with_range(start, end))
                .map(|s| s.len())
                .unwrap_or(usize::MAX)
                <= max_bytes
        {
            end += 1;
        }
        end = (end - 1).max(start + 1);
        pages.push(page_with_range(start, end));
        start = end;
    }
    pages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResultStatus;
    use serde_json::json;

    fn sample_result(processed_data: Value) -> FinalResult {
        FinalResult {
            job_id: "J1".into(),
            task_kind: "enhance".into(),
            entity_id: "A1".into(),
            status: ResultStatus::Completed,
            source: "prov".into(),
            completion_percentage: 100,
            processed_data,
            error_details: None,
        }
    }

    #[test]
    fn single_page_when_small() {
        let result = sample_result(json!({"name": "Ex"}));
        let pages = split_processed_data(&result.processed_data, MAX_PAGE_BYTES);
        assert_eq!(pages.len(), 1);
    }

    #[test]
    fn splits_list_field_preserving_order() {
        let leads: Vec<Value> = (0..200)
            .map(|i| json!({"id": i, "blob": "x".repeat(8_000)}))
            .collect();
        let result = sample_result(json!({"leads": leads, "total": 200}));
        let pages = split_processed_data(&result.processed_data, MAX_PAGE_BYTES);
        assert!(pages.len() > 1);

        let mut reassembled = Vec::new();
        for page in &pages {
            assert_eq!(page["total"], 200); // non-list field duplicated
            reassembled.extend(page["leads"].as_array().unwrap().clone());
        }
        assert_eq!(reassembled.len(), 200);
        for (i, item) in reassembled.iter().enumerate() {
            assert_eq!(item["id"], i);
        }
    }

    #[test]
    fn request_id_is_stable_and_page_scoped() {
        let key = IdempotencyKey::new("enhance", "J1", "A1");
        let id0 = request_id(&key, 0);
        let id1 = request_id(&key, 1);
        assert_ne!(id0, id1);
        assert_eq!(id0, request_id(&key, 0));
    }

    #[test]
    fn build_pages_sets_stable_request_ids_and_ordering() {
        let key = IdempotencyKey::new("enhance", "J1", "A1");
        let leads: Vec<Value> = (0..200)
            .map(|i| json!({"id": i, "blob": "x".repeat(8_000)}))
            .collect();
        let result = sample_result(json!({"leads": leads}));
        let pages = build_pages(&key, &result);
        assert!(pages.len() > 1);
        for (i, page) in pages.iter().enumerate() {
            assert_eq!(page.page_index, i as u32);
            assert_eq!(page.page_count, pages.len() as u32);
        }
    }
}
