//! Primary execution seam.
//!
//! The hosting application supplies the actual generation call as a
//! [`PrimaryExecutor`]. Work items are dispatched to an executor by their
//! operation type through the [`ExecutorRegistry`], and each executor names
//! the downstream service its circuit breaker is keyed on.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use spendguard_core::{OperationType, ResponseQuality};

/// Errors from a primary executor.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("Upstream call failed: {0}")]
    Upstream(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Request rejected by upstream: {0}")]
    Rejected(String),

    #[error("No executor configured for {0}")]
    NotConfigured(OperationType),
}

impl ExecutionError {
    /// Whether re-queueing the work could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExecutionError::Upstream(_) | ExecutionError::Timeout(_))
    }
}

/// What the executor is asked to produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub caller_id: String,
    pub operation: OperationType,
    pub payload: serde_json::Value,

    /// Quality allowed at the current degradation level
    pub quality: ResponseQuality,
}

/// Successful primary output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    pub content: serde_json::Value,

    /// Metered cost, if the backend reports one; the estimate is charged otherwise
    pub actual_cost: Option<f64>,

    /// Tokens or other metered units
    pub units: u64,
}

impl ExecutionOutput {
    pub fn new(content: serde_json::Value) -> Self {
        Self {
            content,
            actual_cost: None,
            units: 0,
        }
    }

    pub fn with_cost(mut self, cost: f64, units: u64) -> Self {
        self.actual_cost = Some(cost);
        self.units = units;
        self
    }
}

/// The generation call supplied by the surrounding application.
#[async_trait]
pub trait PrimaryExecutor: Send + Sync {
    /// Execute one request against the metered backend.
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutput, ExecutionError>;

    /// Downstream service name, used as the circuit breaker key.
    fn service_name(&self) -> &str;
}

type ExecuteFn =
    dyn Fn(ExecutionRequest) -> BoxFuture<'static, Result<ExecutionOutput, ExecutionError>> + Send + Sync;

/// Adapts an async closure into a [`PrimaryExecutor`].
pub struct FnExecutor {
    service: String,
    func: Arc<ExecuteFn>,
}

impl FnExecutor {
    pub fn new<F, Fut>(service: impl Into<String>, func: F) -> Self
    where
        F: Fn(ExecutionRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ExecutionOutput, ExecutionError>> + Send + 'static,
    {
        Self {
            service: service.into(),
            func: Arc::new(move |request| Box::pin(func(request))),
        }
    }
}

#[async_trait]
impl PrimaryExecutor for FnExecutor {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutput, ExecutionError> {
        (self.func)(request.clone()).await
    }

    fn service_name(&self) -> &str {
        &self.service
    }
}

/// Operation type → executor, with an optional default.
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: BTreeMap<OperationType, Arc<dyn PrimaryExecutor>>,
    default: Option<Arc<dyn PrimaryExecutor>>,
}

impl ExecutorRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry serving every operation with one executor.
    pub fn with_default(executor: Arc<dyn PrimaryExecutor>) -> Self {
        Self {
            executors: BTreeMap::new(),
            default: Some(executor),
        }
    }

    /// Register an executor for one operation type, replacing any existing one.
    pub fn register(&mut self, operation: OperationType, executor: Arc<dyn PrimaryExecutor>) {
        self.executors.insert(operation, executor);
    }

    pub fn set_default(&mut self, executor: Arc<dyn PrimaryExecutor>) {
        self.default = Some(executor);
    }

    /// Executor for an operation, falling back to the default.
    pub fn get(&self, operation: OperationType) -> Result<Arc<dyn PrimaryExecutor>, ExecutionError> {
        self.executors
            .get(&operation)
            .or(self.default.as_ref())
            .cloned()
            .ok_or(ExecutionError::NotConfigured(operation))
    }

    /// Distinct service names, sorted.
    pub fn services(&self) -> Vec<String> {
        let mut services: Vec<String> = self
            .executors
            .values()
            .chain(self.default.iter())
            .map(|e| e.service_name().to_string())
            .collect();
        services.sort();
        services.dedup();
        services
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty() && self.default.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo(service: &'static str) -> Arc<dyn PrimaryExecutor> {
        Arc::new(FnExecutor::new(service, |request: ExecutionRequest| async move {
            Ok(ExecutionOutput::new(request.payload))
        }))
    }

    #[tokio::test]
    async fn test_fn_executor_runs_closure() {
        let executor = echo("gen");
        let request = ExecutionRequest {
            caller_id: "alice".to_string(),
            operation: OperationType::ContentGeneration,
            payload: json!({"prompt": "hi"}),
            quality: ResponseQuality::Full,
        };
        let output = executor.execute(&request).await.unwrap();
        assert_eq!(output.content, json!({"prompt": "hi"}));
        assert_eq!(executor.service_name(), "gen");
    }

    #[test]
    fn test_registry_lookup_falls_back_to_default() {
        let mut registry = ExecutorRegistry::with_default(echo("gen"));
        registry.register(OperationType::Verification, echo("verify"));

        assert_eq!(
            registry.get(OperationType::Verification).unwrap().service_name(),
            "verify"
        );
        assert_eq!(
            registry.get(OperationType::Analytics).unwrap().service_name(),
            "gen"
        );
        assert_eq!(registry.services(), vec!["gen".to_string(), "verify".to_string()]);
    }

    #[test]
    fn test_unconfigured_operation() {
        let registry = ExecutorRegistry::new();
        assert!(registry.is_empty());
        assert!(matches!(
            registry.get(OperationType::Analytics),
            Err(ExecutionError::NotConfigured(OperationType::Analytics))
        ));
    }

    #[test]
    fn test_transient_classification() {
        assert!(ExecutionError::Upstream("503".into()).is_transient());
        assert!(ExecutionError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!ExecutionError::Rejected("bad prompt".into()).is_transient());
    }
}
