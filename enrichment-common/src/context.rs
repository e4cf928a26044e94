//! Propagates `trace_id`, `job_id`, `entity_id`, `task_kind` and free-form
//! tags across async suspensions and thread hand-offs.
//!
//! A `tokio::task_local!` cell holds the context for the lifetime of the
//! future it scopes, and nesting is just scoping a child future with a
//! context derived from the parent's.

use std::collections::HashMap;

use tracing::Span;

tokio::task_local! {
    static CONTEXT: RequestContext;
}

/// The fields carried through one delivery's lifetime.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub trace_id: String,
    pub job_id: String,
    pub entity_id: String,
    pub task_kind: String,
    pub tags: HashMap<String, String>,
}

impl RequestContext {
    pub fn new(
        trace_id: impl Into<String>,
        job_id: impl Into<String>,
        entity_id: impl Into<String>,
        task_kind: impl Into<String>,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            job_id: job_id.into(),
            entity_id: entity_id.into(),
            task_kind: task_kind.into(),
            tags: HashMap::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Returns a `tracing::Span` carrying this context's fields. Every log
    /// record emitted while this span is entered inherits the fields, which
    /// is how the JSON formatter surfaces them without per-call-site plumbing.
    pub fn span(&self) -> Span {
        tracing::info_span!(
            "delivery",
            trace_id = %self.trace_id,
            job_id = %self.job_id,
            entity_id = %self.entity_id,
            task_kind = %self.task_kind,
        )
    }

    /// Returns the currently-scoped context, if any. Useful for handlers that
    /// want to annotate `RawData` rows or fan-out item errors with trace_id.
    pub fn current() -> Option<RequestContext> {
        CONTEXT.try_with(|ctx| ctx.clone()).ok()
    }

    /// Runs `fut` with `self` installed as the current context. Nestable:
    /// a scope entered while another is already active simply shadows it for
    /// the lifetime of `fut`, and the outer scope is restored on return.
    pub async fn scope<F, T>(self, fut: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        let span = self.span();
        CONTEXT.scope(self, tracing::Instrument::instrument(fut, span)).await
    }

    /// Synchronous counterpart of [`scope`], for use inside `spawn_blocking`
    /// closures that need to observe the originator's context for the
    /// duration of a blocking call.
    pub fn scope_blocking<F, T>(self, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        let span = self.span();
        let _entered = span.enter();
        CONTEXT.sync_scope(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn current_is_none_outside_a_scope() {
        assert!(RequestContext::current().is_none());
    }

    #[tokio::test]
    async fn scope_installs_and_restores_context() {
        let ctx = RequestContext::new("t1", "j1", "e1", "enhance");
        let seen = ctx
            .clone()
            .scope(async { RequestContext::current().map(|c| c.trace_id) })
            .await;
        assert_eq!(seen, Some("t1".to_owned()));
        assert!(RequestContext::current().is_none());
    }

    #[tokio::test]
    async fn nested_scope_shadows_then_restores_outer() {
        let outer = RequestContext::new("outer", "j1", "e1", "enhance");
        outer
            .scope(async {
                assert_eq!(RequestContext::current().unwrap().trace_id, "outer");
                let inner = RequestContext::new("inner", "j2", "e2", "generate");
                inner
                    .scope(async {
                        assert_eq!(RequestContext::current().unwrap().trace_id, "inner");
                    })
                    .await;
                assert_eq!(RequestContext::current().unwrap().trace_id, "outer");
            })
            .await;
    }

    #[tokio::test]
    async fn blocking_offload_preserves_context() {
        let ctx = RequestContext::new("t1", "j1", "e1", "enhance");
        let result = ctx
            .clone()
            .scope(async {
                let inner_ctx = RequestContext::current().unwrap();
                tokio::task::spawn_blocking(move || {
                    inner_ctx.scope_blocking(|| RequestContext::current().map(|c| c.trace_id))
                })
                .await
                .unwrap()
            })
            .await;
        assert_eq!(result, Some("t1".to_owned()));
    }
}
