//! Dispatch table for `Function` tasks.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use super::task::{FunctionContext, TaskError, TaskFunction};

/// Maps function names to callables.
///
/// Built before the engine starts and shared read-only with workers.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn TaskFunction>>,
}

impl FunctionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a [`TaskFunction`] under `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, function: Arc<dyn TaskFunction>) {
        self.functions.insert(name.into(), function);
    }

    /// Register an async closure under `name`.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(FunctionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        self.register(name, Arc::new(FnFunction(f)));
    }

    /// Builder form of [`register_fn`](Self::register_fn).
    pub fn with_fn<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(FunctionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        self.register_fn(name, f);
        self
    }

    /// Look up a function.
    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskFunction>> {
        self.functions.get(name).cloned()
    }

    /// Whether a function is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

struct FnFunction<F>(F);

#[async_trait]
impl<F, Fut> TaskFunction for FnFunction<F>
where
    F: Fn(FunctionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
{
    async fn call(&self, ctx: FunctionContext) -> Result<Value, TaskError> {
        (self.0)(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cancel::CancelToken;
    use crate::core::types::TaskId;
    use serde_json::json;

    fn ctx() -> FunctionContext {
        FunctionContext {
            task_id: TaskId::new("t"),
            attempt: 0,
            args: Value::Null,
            cancel: CancelToken::never(),
        }
    }

    #[tokio::test]
    async fn test_register_and_call_closure() {
        let registry = FunctionRegistry::new().with_fn("answer", |_ctx| async { Ok(json!(42)) });

        let f = registry.get("answer").expect("registered");
        assert_eq!(f.call(ctx()).await.unwrap(), json!(42));
    }

    #[test]
    fn test_unknown_function() {
        let registry = FunctionRegistry::new();
        assert!(registry.get("missing").is_none());
        assert!(!registry.contains("missing"));
    }

    #[test]
    fn test_names_sorted() {
        let registry = FunctionRegistry::new()
            .with_fn("b", |_ctx| async { Ok(Value::Null) })
            .with_fn("a", |_ctx| async { Ok(Value::Null) });

        assert_eq!(registry.names(), vec!["a", "b"]);
    }
}
