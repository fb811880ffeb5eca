//! DAG nodes and edges. Node behavior is a closed sum - each variant carries
//! its own typed config, and the executor's dispatch is a total match.

use serde::{Deserialize, Serialize};

use super::condition::EdgeCondition;
use crate::tools::{ToolCategory, ToolType};
use crate::worker::ModelConfig;

pub type NodeId = String;

/// Runtime status of one node within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputConfig {
    pub required_fields: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    pub include_confidence: bool,
    pub include_citations: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentNodeConfig {
    pub agent_name: String,
    pub instructions: String,
    pub model: ModelConfig,
    pub temperature: f32,
    pub max_tokens: u32,
    pub preferred_categories: Vec<ToolCategory>,
    pub preferred_types: Vec<ToolType>,
    pub max_tools: usize,
    pub knowledge_bases: Vec<String>,
}

impl AgentNodeConfig {
    pub fn new(agent_name: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            instructions: instructions.into(),
            model: ModelConfig::named("claude-3-5-sonnet"),
            temperature: 0.7,
            max_tokens: 1000,
            preferred_categories: Vec::new(),
            preferred_types: Vec::new(),
            max_tools: 5,
            knowledge_bases: Vec::new(),
        }
    }

    pub fn with_model(mut self, model_name: &str) -> Self {
        self.model = ModelConfig::named(model_name);
        self
    }

    pub fn with_sampling(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_tools(
        mut self,
        categories: Vec<ToolCategory>,
        types: Vec<ToolType>,
        max_tools: usize,
    ) -> Self {
        self.preferred_categories = categories;
        self.preferred_types = types;
        self.max_tools = max_tools;
        self
    }

    pub fn with_knowledge_bases(mut self, knowledge_bases: Vec<String>) -> Self {
        self.knowledge_bases = knowledge_bases;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionConfig {
    /// Parsed at template construction; `None` means always-true.
    pub condition: Option<EdgeCondition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    Concat,
    Combine,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    pub strategy: MergeStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelConfig {
    pub max_parallel: usize,
    pub timeout_secs: u64,
}

/// The closed set of node behaviors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Input(InputConfig),
    Output(OutputConfig),
    Agent(Box<AgentNodeConfig>),
    Condition(ConditionConfig),
    Merge(MergeConfig),
    Parallel(ParallelConfig),
}

impl NodeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::Input(_) => "input",
            NodeKind::Output(_) => "output",
            NodeKind::Agent(_) => "agent",
            NodeKind::Condition(_) => "condition",
            NodeKind::Merge(_) => "merge",
            NodeKind::Parallel(_) => "parallel",
        }
    }

    /// Relative weight used by execution-time estimation. Agent nodes are
    /// priced separately.
    pub fn time_weight(&self) -> f64 {
        match self {
            NodeKind::Input(_) | NodeKind::Output(_) => 0.0,
            NodeKind::Condition(_) => 0.1,
            NodeKind::Merge(_) => 0.2,
            NodeKind::Parallel(_) => 0.3,
            NodeKind::Agent(_) => 1.0,
        }
    }
}

/// One node of a DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagNode {
    pub id: NodeId,
    pub name: String,
    pub description: String,
    /// Capabilities this node contributes; used for request-driven filtering.
    pub capabilities: Vec<String>,
    pub kind: NodeKind,
}

impl DagNode {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            capabilities: Vec::new(),
            kind,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn is_agent(&self) -> bool {
        matches!(self.kind, NodeKind::Agent(_))
    }

    pub fn agent_config(&self) -> Option<&AgentNodeConfig> {
        match &self.kind {
            NodeKind::Agent(config) => Some(config),
            _ => None,
        }
    }

    pub fn agent_config_mut(&mut self) -> Option<&mut AgentNodeConfig> {
        match &mut self.kind {
            NodeKind::Agent(config) => Some(config),
            _ => None,
        }
    }
}

/// A directed edge, optionally guarded by a condition on the source node's
/// result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagEdge {
    pub from: NodeId,
    pub to: NodeId,
    pub condition: Option<EdgeCondition>,
    pub weight: f64,
}

impl DagEdge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: None,
            weight: 1.0,
        }
    }

    pub fn when(mut self, condition: EdgeCondition) -> Self {
        self.condition = Some(condition);
        self
    }
}
