//! Task registry: a read-only, O(1) name→handler binding constructed once
//! at startup.

use std::collections::HashMap;
use std::sync::Arc;

use crate::handler::Handler;

#[derive(Clone)]
pub struct TaskRegistry {
    handlers: Arc<HashMap<&'static str, Arc<dyn Handler>>>,
}

impl TaskRegistry {
    pub fn new(handlers: Vec<Arc<dyn Handler>>) -> Self {
        let map = handlers
            .into_iter()
            .map(|handler| (handler.task_kind(), handler))
            .collect();
        Self {
            handlers: Arc::new(map),
        }
    }

    pub fn get(&self, task_kind: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(task_kind).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerContext;
    use crate::model::{HandlerOutcome, Summary, TaskPayload};
    use async_trait::async_trait;

    struct NoopHandler;

    #[async_trait]
    impl Handler for NoopHandler {
        fn task_kind(&self) -> &'static str {
            "noop"
        }

        async fn execute(&self, _ctx: &HandlerContext, _payload: TaskPayload) -> HandlerOutcome {
            (None, Summary::empty())
        }
    }

    #[test]
    fn lookup_is_case_sensitive_and_missing_yields_none() {
        let registry = TaskRegistry::new(vec![Arc::new(NoopHandler)]);
        assert!(registry.get("noop").is_some());
        assert!(registry.get("unknown").is_none());
    }
}
