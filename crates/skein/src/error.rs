use std::time::Duration;
use thiserror::Error;

/// Errors surfaced at the public orchestration API.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrchestratorError {
    #[error("Template '{0}' not found")]
    TemplateNotFound(String),

    #[error("Invalid DAG: {0}")]
    DagInvalid(String),

    #[error("Tool '{0}' is not available")]
    ToolUnavailable(String),

    #[error("No capacity left for agent '{0}'")]
    NoCapacity(String),

    #[error("Instance '{0}' not found")]
    InstanceNotFound(String),

    #[error("Instance '{0}' is unhealthy")]
    InstanceUnhealthy(String),

    #[error("Execution deadline of {0:?} expired")]
    Deadline(Duration),

    #[error("Upstream failure: {0}")]
    UpstreamFailure(String),
}

impl OrchestratorError {
    /// Stable short name used in events and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::TemplateNotFound(_) => "template_not_found",
            OrchestratorError::DagInvalid(_) => "dag_invalid",
            OrchestratorError::ToolUnavailable(_) => "tool_unavailable",
            OrchestratorError::NoCapacity(_) => "no_capacity",
            OrchestratorError::InstanceNotFound(_) => "instance_not_found",
            OrchestratorError::InstanceUnhealthy(_) => "instance_unhealthy",
            OrchestratorError::Deadline(_) => "deadline",
            OrchestratorError::UpstreamFailure(_) => "upstream_failure",
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
