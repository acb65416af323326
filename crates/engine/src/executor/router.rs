use std::{collections::HashMap, sync::Arc};

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::runner::{ActionExecutor, ResolvedAction};

/// Dispatches actions to executors registered per action type.
///
/// Unregistered types go to the fallback executor when one is set and fail otherwise.
#[derive(Default, Clone)]
pub struct ActionRouter {
    routes: HashMap<String, Arc<dyn ActionExecutor>>,
    fallback: Option<Arc<dyn ActionExecutor>>,
}

impl ActionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `executor` for `action_type`, replacing any earlier registration.
    pub fn route(mut self, action_type: impl Into<String>, executor: Arc<dyn ActionExecutor>) -> Self {
        self.routes.insert(action_type.into(), executor);
        self
    }

    pub fn fallback(mut self, executor: Arc<dyn ActionExecutor>) -> Self {
        self.fallback = Some(executor);
        self
    }

    pub fn action_types(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }
}

#[async_trait]
impl ActionExecutor for ActionRouter {
    async fn execute(&self, action: &ResolvedAction) -> Result<Value> {
        let executor = match self.routes.get(&action.action_type) {
            Some(executor) => executor,
            None => match &self.fallback {
                Some(fallback) => {
                    debug!(action_type = %action.action_type, step_id = %action.step_id, "routing action to fallback executor");
                    fallback
                }
                None => bail!("no executor registered for action type '{}'", action.action_type),
            },
        };
        executor.execute(action).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::runner::NoopExecutor;
    use indexmap::IndexMap;
    use serde_json::{Map as JsonMap, json};

    struct FixedExecutor(Value);

    #[async_trait]
    impl ActionExecutor for FixedExecutor {
        async fn execute(&self, _action: &ResolvedAction) -> Result<Value> {
            Ok(self.0.clone())
        }
    }

    fn action(action_type: &str) -> ResolvedAction {
        ResolvedAction {
            step_id: "s1".into(),
            action_type: action_type.into(),
            config: JsonMap::new(),
            inputs: IndexMap::new(),
        }
    }

    #[tokio::test]
    async fn routes_by_action_type_and_falls_back() {
        let router = ActionRouter::new()
            .route("http", Arc::new(FixedExecutor(json!({ "status": 200 }))))
            .fallback(Arc::new(NoopExecutor));

        let routed = router.execute(&action("http")).await.expect("routed");
        assert_eq!(routed, json!({ "status": 200 }));

        let fallback = router.execute(&action("db")).await.expect("fallback");
        assert_eq!(fallback["actionType"], "db");
    }

    #[tokio::test]
    async fn unknown_action_type_without_fallback_fails() {
        let router = ActionRouter::new();
        let error = router.execute(&action("db")).await.unwrap_err();
        assert!(error.to_string().contains("no executor registered"), "unexpected error: {error}");
    }
}
