//! DAG model, generation and execution.

pub mod condition;
pub mod executor;
pub mod generator;
pub mod node;
pub mod template;

pub use condition::{CmpOp, ConditionField, EdgeCondition};
pub use executor::{DagExecutor, ExecutionOutcome, ExecutionStatus, FailureReason};
pub use generator::{
    DagGenerator, GeneratedDag, GenerationMode, GenerationRequest, NodeOverrides,
    OptimizationStrategy, ScoreWeights, UserPreferences,
};
pub use node::{
    AgentNodeConfig, ConditionConfig, DagEdge, DagNode, InputConfig, MergeConfig, MergeStrategy,
    NodeId, NodeKind, NodeStatus, OutputConfig, ParallelConfig,
};
pub use template::{basic_conversation, deep_thinking, knowledge_base, DagTemplate, TemplateStore};
