use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use uuid::Uuid;

use enrichment_common::context::RequestContext;
use enrichment_common::model::TaskPayload;

use super::app::AppState;

/// POST `/tasks/{task_kind}` — the queue delivery endpoint.
pub async fn post_task(
    State(state): State<AppState>,
    Path(task_kind): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<TaskPayload>,
) -> Response {
    let trace_id = header_str(&headers, "X-Trace-Id").unwrap_or_else(|| Uuid::new_v4().to_string());
    let retry_count = header_str(&headers, "X-Task-Retry-Count");
    let queue_name = header_str(&headers, "X-Task-Queue-Name");

    let entity_id = payload.entity_id().map(str::to_owned).unwrap_or_default();
    let mut ctx = RequestContext::new(trace_id, payload.job_id.clone(), entity_id, task_kind.clone());
    if let Some(retry_count) = retry_count {
        ctx = ctx.with_tag("retry_count", retry_count);
    }
    if let Some(queue_name) = queue_name {
        ctx = ctx.with_tag("queue_name", queue_name);
    }

    let runner = state.runner.clone();
    let deadline = state.task_deadline;
    ctx.scope(async move {
        match runner.handle_delivery(&task_kind, payload, deadline).await {
            Ok(summary) => Json(summary).into_response(),
            Err(err) => (err.status_code(), Json(json!({ "error": err.to_string() }))).into_response(),
        }
    })
    .await
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode};
    use axum::Router;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::super::app::{add_routes, test_support::test_state};

    fn valid_token() -> String {
        use jsonwebtoken::{encode, EncodingKey, Header};
        #[derive(serde::Serialize)]
        struct Claims<'a> {
            iss: &'a str,
            aud: &'a str,
            exp: usize,
        }
        let claims = Claims {
            iss: "issuer",
            aud: "audience",
            exp: (chrono::Utc::now() + chrono::Duration::minutes(5)).timestamp() as usize,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(b"secret")).unwrap()
    }

    #[tokio::test]
    async fn invalid_payload_yields_400() {
        let app = add_routes(Router::new(), test_state());
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/tasks/enhance")
                    .header("Authorization", format!("Bearer {}", valid_token()))
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"job_id":"J1","task_kind":"enhance"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(!body.is_empty());
    }
}
