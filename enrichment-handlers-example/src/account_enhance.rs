//! The `enhance` handler: fetches an account's website and derives a display
//! name from it, demonstrating the API response cache and a single-page
//! completed result.

use async_trait::async_trait;
use enrichment_common::cache::ApiResponseCache;
use enrichment_common::handler::{Handler, HandlerContext};
use enrichment_common::model::{ErrorDetails, FinalResult, HandlerOutcome, ResultStatus, Summary, TaskPayload};
use serde_json::{json, Value};
use url::Url;

const HANDLER_VERSION: u16 = 1;
const CACHE_TTL_SECONDS: i64 = 3600;

pub struct AccountEnhanceHandler;

#[async_trait]
impl Handler for AccountEnhanceHandler {
    fn task_kind(&self) -> &'static str {
        "enhance"
    }

    async fn execute(&self, ctx: &HandlerContext, payload: TaskPayload) -> HandlerOutcome {
        let job_id = payload.job_id.clone();
        let task_kind = payload.task_kind.clone();

        let entity_id = match payload.entity_id() {
            Ok(id) => id.to_owned(),
            Err(err) => {
                return failed(job_id, task_kind, String::new(), "InvalidPayload", &err.to_string(), "validate")
            }
        };

        let Some(website) = payload.extra.get("website").and_then(Value::as_str) else {
            return failed(job_id, task_kind, entity_id, "MissingField", "payload is missing `website`", "validate");
        };

        match fetch_title(ctx, website).await {
            Ok(name) => {
                let result = FinalResult {
                    job_id,
                    task_kind,
                    entity_id,
                    status: ResultStatus::Completed,
                    source: "account_enhance".to_owned(),
                    completion_percentage: 100,
                    processed_data: json!({ "name": name }),
                    error_details: None,
                };
                (Some(result), Summary::empty())
            }
            Err(err) => failed(job_id, task_kind, entity_id, "UpstreamError", &err, "fetch"),
        }
    }
}

fn failed(
    job_id: String,
    task_kind: String,
    entity_id: String,
    error_type: &str,
    message: &str,
    stage: &str,
) -> HandlerOutcome {
    let result = FinalResult {
        job_id,
        task_kind,
        entity_id,
        status: ResultStatus::Failed,
        source: "account_enhance".to_owned(),
        completion_percentage: 0,
        processed_data: Value::Null,
        error_details: Some(ErrorDetails {
            r#type: error_type.to_owned(),
            message: message.to_owned(),
            stage: stage.to_owned(),
        }),
    };
    (Some(result), Summary::empty())
}

async fn fetch_title(ctx: &HandlerContext, website: &str) -> Result<String, String> {
    let request = json!({ "method": "GET", "url": website });
    let cache_key = ApiResponseCache::key("website_fetch", "GET", &request, HANDLER_VERSION);

    if let Some(entry) = ctx.api_cache.get(&cache_key).await {
        return Ok(entry.response["name"].as_str().unwrap_or_default().to_owned());
    }

    let (client, _permit) = ctx.http_pool.acquire().await;
    let response = client
        .get(website)
        .send()
        .await
        .map_err(|err| format!("request to {website} failed: {err}"))?;
    if !response.status().is_success() {
        return Err(format!("{website} returned {}", response.status()));
    }
    let body = response
        .text()
        .await
        .map_err(|err| format!("failed to read response body: {err}"))?;

    let name = derive_name(website, &body);
    let response_value = json!({ "name": name });
    ctx.api_cache
        .put(&cache_key, "website_fetch", &request, &response_value, &Value::Null, CACHE_TTL_SECONDS)
        .await;
    Ok(name)
}

fn derive_name(website: &str, body: &str) -> String {
    body.split("<title>")
        .nth(1)
        .and_then(|rest| rest.split("</title>").next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| {
            Url::parse(website)
                .ok()
                .and_then(|u| u.host_str().map(str::to_owned))
                .unwrap_or_else(|| website.to_owned())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_name_prefers_title_then_falls_back_to_host() {
        assert_eq!(
            derive_name("https://ex.com", "<html><title> Ex Corp </title></html>"),
            "Ex Corp"
        );
        assert_eq!(derive_name("https://ex.com/path", "<html></html>"), "ex.com");
    }
}
