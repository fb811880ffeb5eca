//! DAG templates and the in-memory template store.
//!
//! Three templates ship with the runtime: a lightweight conversation
//! pipeline, a knowledge-base answering flow with a confidence branch, and a
//! deep-thinking flow that forks into a parallel specialist team for complex
//! tasks. Integrators can register more at runtime.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use super::condition::{CmpOp, ConditionField, EdgeCondition};
use super::node::{
    AgentNodeConfig, ConditionConfig, DagEdge, DagNode, InputConfig, NodeKind, OutputConfig,
    ParallelConfig,
};
use crate::tools::{ToolCategory, ToolType};

/// A reusable DAG structure with variable slots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagTemplate {
    pub template_id: String,
    pub name: String,
    pub description: String,
    pub category: String,
    pub nodes: Vec<DagNode>,
    pub edges: Vec<DagEdge>,
    pub variables: serde_json::Map<String, Value>,
    pub tags: Vec<String>,
    pub version: String,
}

/// Registry of templates, pre-seeded with the builtins.
pub struct TemplateStore {
    templates: RwLock<HashMap<String, DagTemplate>>,
}

impl TemplateStore {
    pub fn new() -> Self {
        let mut templates = HashMap::new();
        for template in [basic_conversation(), knowledge_base(), deep_thinking()] {
            templates.insert(template.template_id.clone(), template);
        }
        Self {
            templates: RwLock::new(templates),
        }
    }

    pub async fn get(&self, template_id: &str) -> Option<DagTemplate> {
        self.templates.read().await.get(template_id).cloned()
    }

    pub async fn register(&self, template: DagTemplate) {
        self.templates
            .write()
            .await
            .insert(template.template_id.clone(), template);
    }

    pub async fn list(&self) -> Vec<DagTemplate> {
        self.templates.read().await.values().cloned().collect()
    }
}

impl Default for TemplateStore {
    fn default() -> Self {
        Self::new()
    }
}

fn confidence_at_least(threshold: f64) -> EdgeCondition {
    EdgeCondition::new(ConditionField::Confidence, CmpOp::Ge, threshold)
}

fn confidence_below(threshold: f64) -> EdgeCondition {
    EdgeCondition::new(ConditionField::Confidence, CmpOp::Lt, threshold)
}

fn complexity_above(threshold: f64) -> EdgeCondition {
    EdgeCondition::new(ConditionField::Complexity, CmpOp::Gt, threshold)
}

fn complexity_at_most(threshold: f64) -> EdgeCondition {
    EdgeCondition::new(ConditionField::Complexity, CmpOp::Le, threshold)
}

/// input -> intent agent -> response agent -> output.
pub fn basic_conversation() -> DagTemplate {
    let nodes = vec![
        DagNode::new(
            "input",
            "User Input",
            NodeKind::Input(InputConfig {
                required_fields: vec!["message".into(), "user_id".into()],
            }),
        )
        .with_description("Receives the user's message"),
        DagNode::new(
            "intent_agent",
            "Intent Recognition Agent",
            NodeKind::Agent(Box::new(
                AgentNodeConfig::new(
                    "Intent Recognition Agent",
                    "Analyze the intent and sentiment of the user's message and return a structured result",
                )
                .with_model("claude-3-haiku")
                .with_sampling(0.3, 500)
                .with_tools(vec![ToolCategory::Reasoning], vec![ToolType::Builtin], 3),
            )),
        )
        .with_description("Recognizes intent and sentiment")
        .with_capabilities(vec!["intent".into(), "conversation".into()]),
        DagNode::new(
            "response_agent",
            "Response Generation Agent",
            NodeKind::Agent(Box::new(
                AgentNodeConfig::new(
                    "Response Generation Agent",
                    "Generate a friendly, helpful reply based on the recognized intent",
                )
                .with_sampling(0.7, 1000)
                .with_tools(
                    vec![
                        ToolCategory::Search,
                        ToolCategory::Calculation,
                        ToolCategory::Reasoning,
                    ],
                    vec![ToolType::Builtin, ToolType::External, ToolType::Mcp],
                    5,
                ),
            )),
        )
        .with_description("Generates the reply")
        .with_capabilities(vec!["conversation".into()]),
        DagNode::new(
            "output",
            "Output",
            NodeKind::Output(OutputConfig::default()),
        ),
    ];

    let edges = vec![
        DagEdge::new("input", "intent_agent"),
        DagEdge::new("intent_agent", "response_agent"),
        DagEdge::new("response_agent", "output"),
    ];

    DagTemplate {
        template_id: "basic_conversation".into(),
        name: "Basic Conversation".into(),
        description: "Fast, lightweight conversational assistant".into(),
        category: "conversation".into(),
        nodes,
        edges,
        variables: serde_json::Map::new(),
        tags: vec!["basic".into(), "conversation".into(), "fast".into()],
        version: "1.0".into(),
    }
}

/// Knowledge-base answering with a confidence branch to a fallback agent.
pub fn knowledge_base() -> DagTemplate {
    let nodes = vec![
        DagNode::new(
            "input",
            "Question Input",
            NodeKind::Input(InputConfig {
                required_fields: vec!["question".into(), "knowledge_base_ids".into()],
            }),
        ),
        DagNode::new(
            "query_analysis_agent",
            "Query Analysis Agent",
            NodeKind::Agent(Box::new(
                AgentNodeConfig::new(
                    "Query Analysis Agent",
                    "Analyze the question, extract keywords and entities, and refine the retrieval query",
                )
                .with_sampling(0.2, 1000)
                .with_tools(
                    vec![ToolCategory::Reasoning, ToolCategory::Analysis],
                    vec![ToolType::Builtin],
                    2,
                ),
            )),
        )
        .with_capabilities(vec!["retrieval".into(), "analysis".into()]),
        DagNode::new(
            "knowledge_retrieval_agent",
            "Knowledge Retrieval Agent",
            NodeKind::Agent(Box::new(
                AgentNodeConfig::new(
                    "Knowledge Retrieval Agent",
                    "Retrieve relevant knowledge from {knowledge_base_ids} and assess its relevance",
                )
                .with_sampling(0.1, 1000)
                .with_tools(
                    vec![
                        ToolCategory::Search,
                        ToolCategory::Reasoning,
                        ToolCategory::Data,
                    ],
                    vec![ToolType::Builtin, ToolType::System],
                    4,
                )
                .with_knowledge_bases(vec!["{knowledge_base_ids}".into()]),
            )),
        )
        .with_capabilities(vec!["retrieval".into()]),
        DagNode::new(
            "answer_synthesis_agent",
            "Answer Synthesis Agent",
            NodeKind::Agent(Box::new(
                AgentNodeConfig::new(
                    "Answer Synthesis Agent",
                    "Synthesize an accurate, complete answer with citations from the retrieved knowledge",
                )
                .with_sampling(0.3, 2000)
                .with_tools(
                    vec![ToolCategory::Reasoning, ToolCategory::Analysis],
                    vec![ToolType::Builtin],
                    3,
                ),
            )),
        )
        .with_capabilities(vec!["synthesis".into()]),
        DagNode::new(
            "confidence_check",
            "Confidence Check",
            NodeKind::Condition(ConditionConfig {
                condition: Some(confidence_at_least(0.7)),
            }),
        ),
        DagNode::new(
            "output",
            "Answer Output",
            NodeKind::Output(OutputConfig {
                include_confidence: true,
                include_citations: true,
            }),
        ),
        DagNode::new(
            "fallback_agent",
            "Fallback Agent",
            NodeKind::Agent(Box::new(
                AgentNodeConfig::new(
                    "Fallback Agent",
                    "When no definitive answer exists, offer helpful suggestions and related information",
                )
                .with_model("claude-3-haiku")
                .with_sampling(0.5, 1000)
                .with_tools(
                    vec![ToolCategory::Search, ToolCategory::Reasoning],
                    vec![ToolType::Builtin, ToolType::External],
                    3,
                ),
            )),
        )
        .with_capabilities(vec!["fallback".into()]),
    ];

    let edges = vec![
        DagEdge::new("input", "query_analysis_agent"),
        DagEdge::new("query_analysis_agent", "knowledge_retrieval_agent"),
        DagEdge::new("knowledge_retrieval_agent", "answer_synthesis_agent"),
        DagEdge::new("answer_synthesis_agent", "confidence_check"),
        DagEdge::new("confidence_check", "output").when(confidence_at_least(0.7)),
        DagEdge::new("confidence_check", "fallback_agent").when(confidence_below(0.7)),
        DagEdge::new("fallback_agent", "output"),
    ];

    let mut variables = serde_json::Map::new();
    variables.insert("knowledge_base_ids".into(), Value::Array(vec![]));
    variables.insert("confidence_threshold".into(), Value::from(0.7));
    variables.insert("max_retrieval_results".into(), Value::from(5));

    DagTemplate {
        template_id: "knowledge_base".into(),
        name: "Knowledge Base QA".into(),
        description: "Knowledge-grounded answering with a confidence fallback".into(),
        category: "knowledge".into(),
        nodes,
        edges,
        variables,
        tags: vec!["knowledge".into(), "qa".into(), "professional".into()],
        version: "1.0".into(),
    }
}

/// Complexity-gated flow: simple tasks go to one solver, complex tasks fan
/// out to a research/analysis/planning team converging on a synthesizer.
pub fn deep_thinking() -> DagTemplate {
    let nodes = vec![
        DagNode::new(
            "input",
            "Task Input",
            NodeKind::Input(InputConfig {
                required_fields: vec!["task".into(), "requirements".into()],
            }),
        ),
        DagNode::new(
            "task_analysis_agent",
            "Task Analysis Agent",
            NodeKind::Agent(Box::new(
                AgentNodeConfig::new(
                    "Task Analysis Agent",
                    "Analyze the task's complexity, requirements and candidate approaches in depth",
                )
                .with_sampling(0.3, 1000)
                .with_tools(
                    vec![ToolCategory::Reasoning, ToolCategory::Analysis],
                    vec![ToolType::Builtin],
                    3,
                ),
            )),
        )
        .with_capabilities(vec!["analysis".into()]),
        DagNode::new(
            "complexity_check",
            "Complexity Check",
            NodeKind::Condition(ConditionConfig {
                condition: Some(complexity_above(0.8)),
            }),
        ),
        DagNode::new(
            "single_agent_solver",
            "Single Agent Solver",
            NodeKind::Agent(Box::new(
                AgentNodeConfig::new(
                    "Single Agent Solver",
                    "Independently analyze and solve a relatively simple task",
                )
                .with_sampling(0.5, 3000)
                .with_tools(
                    vec![
                        ToolCategory::Reasoning,
                        ToolCategory::Search,
                        ToolCategory::Calculation,
                        ToolCategory::Analysis,
                    ],
                    vec![ToolType::Builtin, ToolType::External, ToolType::Mcp],
                    6,
                ),
            )),
        )
        .with_capabilities(vec!["solving".into()]),
        DagNode::new(
            "team_coordinator",
            "Team Coordinator",
            NodeKind::Parallel(ParallelConfig {
                max_parallel: 3,
                timeout_secs: 120,
            }),
        )
        .with_description("Coordinates the specialist team"),
        DagNode::new(
            "research_agent",
            "Research Agent",
            NodeKind::Agent(Box::new(
                AgentNodeConfig::new(
                    "Research Agent",
                    "Research the task in depth, gathering and assessing relevant information",
                )
                .with_sampling(0.4, 1000)
                .with_tools(
                    vec![
                        ToolCategory::Search,
                        ToolCategory::Reasoning,
                        ToolCategory::Content,
                        ToolCategory::Data,
                    ],
                    vec![
                        ToolType::Builtin,
                        ToolType::External,
                        ToolType::Mcp,
                        ToolType::System,
                    ],
                    8,
                ),
            )),
        )
        .with_capabilities(vec!["research".into()]),
        DagNode::new(
            "analysis_agent",
            "Analysis Agent",
            NodeKind::Agent(Box::new(
                AgentNodeConfig::new(
                    "Analysis Agent",
                    "Analyze the data, surfacing patterns and insights",
                )
                .with_sampling(0.3, 1000)
                .with_tools(
                    vec![
                        ToolCategory::Reasoning,
                        ToolCategory::Calculation,
                        ToolCategory::Analysis,
                        ToolCategory::Data,
                    ],
                    vec![ToolType::Builtin, ToolType::External],
                    5,
                ),
            )),
        )
        .with_capabilities(vec!["analysis".into()]),
        DagNode::new(
            "planning_agent",
            "Planning Agent",
            NodeKind::Agent(Box::new(
                AgentNodeConfig::new(
                    "Planning Agent",
                    "Draft a detailed solution plan from the research and analysis",
                )
                .with_sampling(0.4, 1000)
                .with_tools(
                    vec![ToolCategory::Reasoning, ToolCategory::Analysis],
                    vec![ToolType::Builtin],
                    3,
                ),
            )),
        )
        .with_capabilities(vec!["planning".into()]),
        DagNode::new(
            "synthesis_agent",
            "Synthesis Agent",
            NodeKind::Agent(Box::new(
                AgentNodeConfig::new(
                    "Synthesis Agent",
                    "Combine every specialist's result into the final solution",
                )
                .with_sampling(0.3, 4000)
                .with_tools(
                    vec![ToolCategory::Reasoning, ToolCategory::Analysis],
                    vec![ToolType::Builtin],
                    3,
                ),
            )),
        )
        .with_capabilities(vec!["synthesis".into()]),
        DagNode::new(
            "output",
            "Output",
            NodeKind::Output(OutputConfig::default()),
        ),
    ];

    let edges = vec![
        DagEdge::new("input", "task_analysis_agent"),
        DagEdge::new("task_analysis_agent", "complexity_check"),
        // Simple path.
        DagEdge::new("complexity_check", "single_agent_solver").when(complexity_at_most(0.8)),
        DagEdge::new("single_agent_solver", "output"),
        // Complex path: the team.
        DagEdge::new("complexity_check", "team_coordinator").when(complexity_above(0.8)),
        DagEdge::new("team_coordinator", "research_agent"),
        DagEdge::new("team_coordinator", "analysis_agent"),
        DagEdge::new("team_coordinator", "planning_agent"),
        DagEdge::new("research_agent", "synthesis_agent"),
        DagEdge::new("analysis_agent", "synthesis_agent"),
        DagEdge::new("planning_agent", "synthesis_agent"),
        DagEdge::new("synthesis_agent", "output"),
    ];

    let mut variables = serde_json::Map::new();
    variables.insert("complexity_threshold".into(), Value::from(0.8));
    variables.insert("max_team_size".into(), Value::from(3));
    variables.insert("analysis_depth".into(), Value::from("deep"));

    DagTemplate {
        template_id: "deep_thinking".into(),
        name: "Deep Thinking".into(),
        description: "Analysis expert with complexity-gated team collaboration".into(),
        category: "analysis".into(),
        nodes,
        edges,
        variables,
        tags: vec!["analysis".into(), "complex".into(), "team".into()],
        version: "1.0".into(),
    }
}
