//! Unified tool execution path: builtins run locally, everything else is
//! forwarded to its service with the per-call timeout. Every completed call
//! folds its latency and outcome back into the registry's rolling stats.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;

use super::builtin::{run_builtin, BUILTIN_SERVICE};
use super::discovery::ServiceDirectory;
use super::registry::ToolRegistry;
use crate::error::{OrchestratorError, Result};

/// Outcome of one tool call.
#[derive(Debug, Clone)]
pub struct ToolExecution {
    pub tool_id: String,
    pub data: Value,
    pub elapsed: Duration,
}

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    directory: Option<Arc<ServiceDirectory>>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, directory: Option<Arc<ServiceDirectory>>) -> Self {
        Self {
            registry,
            directory,
        }
    }

    pub async fn execute(
        &self,
        tool_id: &str,
        action: &str,
        params: &Value,
        timeout: Option<Duration>,
    ) -> Result<ToolExecution> {
        let tool = self
            .registry
            .get(tool_id)
            .await
            .ok_or_else(|| OrchestratorError::ToolUnavailable(tool_id.to_string()))?;
        if !tool.usable() {
            return Err(OrchestratorError::ToolUnavailable(tool_id.to_string()));
        }

        let timeout = timeout.unwrap_or(Duration::from_secs(tool.timeout_secs));
        let started = Instant::now();

        let outcome = if tool.service_name == BUILTIN_SERVICE {
            run_builtin(&tool.name, params)
        } else {
            let directory = self.directory.as_ref().ok_or_else(|| {
                OrchestratorError::ToolUnavailable(format!(
                    "no service directory configured for '{tool_id}'"
                ))
            })?;
            directory.invoke(&tool, action, params, timeout).await
        };

        let elapsed = started.elapsed();
        let success = outcome.is_ok();
        self.registry
            .record_call(tool_id, elapsed.as_secs_f64() * 1000.0, success)
            .await;

        match outcome {
            Ok(data) => Ok(ToolExecution {
                tool_id: tool_id.to_string(),
                data,
                elapsed,
            }),
            Err(err) => {
                // Service-level failure parks the tool until the next probe
                // succeeds; builtin failures are request-shaped, not health.
                if tool.service_name != BUILTIN_SERVICE {
                    self.registry.set_tool_availability(tool_id, false).await;
                }
                tracing::warn!(tool = %tool_id, error = %err, "tool execution failed");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_builtin_calculator_executes_locally() {
        let registry = Arc::new(ToolRegistry::with_builtins().await);
        let executor = ToolExecutor::new(Arc::clone(&registry), None);

        let out = executor
            .execute(
                "builtin.calculator",
                "evaluate",
                &serde_json::json!({"expression": "2 + 2"}),
                None,
            )
            .await
            .unwrap();
        assert_eq!(out.data["result"], serde_json::json!(4.0));

        let tool = registry.get("builtin.calculator").await.unwrap();
        assert_eq!(tool.total_calls, 1);
        assert!((tool.success_rate - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_builtin_failure_counts_but_keeps_availability() {
        let registry = Arc::new(ToolRegistry::with_builtins().await);
        let executor = ToolExecutor::new(Arc::clone(&registry), None);

        let err = executor
            .execute(
                "builtin.calculator",
                "evaluate",
                &serde_json::json!({"expression": "nope"}),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "upstream_failure");

        let tool = registry.get("builtin.calculator").await.unwrap();
        assert_eq!(tool.total_calls, 1);
        assert!(tool.is_available);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_unavailable() {
        let registry = Arc::new(ToolRegistry::new());
        let executor = ToolExecutor::new(registry, None);
        let err = executor
            .execute("ghost.tool", "run", &Value::Null, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "tool_unavailable");
    }

    #[tokio::test]
    async fn test_disabled_tool_is_rejected() {
        let registry = Arc::new(ToolRegistry::with_builtins().await);
        registry
            .set_tool_availability("builtin.reasoning", false)
            .await;
        let executor = ToolExecutor::new(registry, None);
        assert!(executor
            .execute("builtin.reasoning", "run", &Value::Null, None)
            .await
            .is_err());
    }
}
