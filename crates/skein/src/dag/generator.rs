//! Dynamic DAG generation: template + user preferences in, validated DAG
//! plus node-to-tool mapping out.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

use super::node::{DagEdge, DagNode, NodeId, NodeKind};
use super::template::{DagTemplate, TemplateStore};
use crate::error::{OrchestratorError, Result};
use crate::tools::{ToolCategory, ToolDefinition, ToolRegistry, ToolType};
use crate::worker::ModelConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum GenerationMode {
    /// Every default node, every usable tool.
    Full,
    /// Input, output and one agent with a single reasoning tool.
    Minimal,
    /// Filtered by the request's capabilities and preferences.
    Custom,
    /// Custom, then post-processed by the optimization strategy.
    Optimized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OptimizationStrategy {
    Performance,
    Accuracy,
    Cost,
    Balanced,
}

/// Weights for the optimization score. The original system hard-coded these
/// inconsistently across code paths; here they are configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub success_rate: f64,
    pub time_band: f64,
    pub cost_band: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            success_rate: 0.4,
            time_band: 0.3,
            cost_band: 0.3,
        }
    }
}

/// Typed per-node overrides; unknown fields are rejected at deserialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeOverrides {
    pub instructions: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub max_tools: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPreferences {
    pub preferred_types: Vec<ToolType>,
    pub preferred_categories: Vec<ToolCategory>,
    pub excluded_tools: Vec<String>,
    pub max_tools_per_agent: usize,
    pub optimization_strategy: OptimizationStrategy,
    pub max_execution_time: Duration,
    pub max_cost_per_execution: f64,
    pub min_success_rate: f64,
    pub enable_parallel_execution: bool,
    pub enable_fallback_nodes: bool,
    pub custom_node_configs: HashMap<NodeId, NodeOverrides>,
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            preferred_types: vec![ToolType::Builtin],
            preferred_categories: vec![ToolCategory::Reasoning],
            excluded_tools: Vec::new(),
            max_tools_per_agent: 5,
            optimization_strategy: OptimizationStrategy::Balanced,
            max_execution_time: Duration::from_secs(300),
            max_cost_per_execution: 1.0,
            min_success_rate: 0.8,
            enable_parallel_execution: true,
            enable_fallback_nodes: true,
            custom_node_configs: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub template_id: String,
    pub user_id: String,
    pub mode: GenerationMode,
    pub preferences: UserPreferences,
    pub selected_capabilities: Vec<String>,
    pub enabled_tools: Vec<String>,
    pub disabled_tools: Vec<String>,
    pub model_config: Option<ModelConfig>,
    pub custom_instructions: String,
}

impl GenerationRequest {
    pub fn new(template_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            template_id: template_id.into(),
            user_id: user_id.into(),
            mode: GenerationMode::Custom,
            preferences: UserPreferences::default(),
            selected_capabilities: Vec::new(),
            enabled_tools: Vec::new(),
            disabled_tools: Vec::new(),
            model_config: None,
            custom_instructions: String::new(),
        }
    }
}

/// A generated, validated DAG bound to its tool mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedDag {
    pub dag_id: String,
    pub template_id: String,
    pub user_id: String,
    pub nodes: Vec<DagNode>,
    pub edges: Vec<DagEdge>,
    pub execution_order: Vec<NodeId>,
    pub selected_tools: Vec<ToolDefinition>,
    pub tool_mapping: HashMap<NodeId, Vec<String>>,
    pub mode: GenerationMode,
    pub optimization_score: f64,
    pub estimated_cost: f64,
    pub estimated_time: f64,
    pub created_at: DateTime<Utc>,
}

impl GeneratedDag {
    pub fn node(&self, id: &str) -> Option<&DagNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn agent_nodes(&self) -> impl Iterator<Item = &DagNode> {
        self.nodes.iter().filter(|n| n.is_agent())
    }

    /// The first agent node in execution order; the "primary" role used for
    /// the persisted agent section.
    pub fn primary_agent(&self) -> Option<&DagNode> {
        self.execution_order
            .iter()
            .filter_map(|id| self.node(id))
            .find(|n| n.is_agent())
    }
}

pub struct DagGenerator {
    templates: Arc<TemplateStore>,
    registry: Arc<ToolRegistry>,
    weights: ScoreWeights,
}

impl DagGenerator {
    pub fn new(
        templates: Arc<TemplateStore>,
        registry: Arc<ToolRegistry>,
        weights: ScoreWeights,
    ) -> Self {
        Self {
            templates,
            registry,
            weights,
        }
    }

    pub async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedDag> {
        let template = self
            .templates
            .get(&request.template_id)
            .await
            .ok_or_else(|| OrchestratorError::TemplateNotFound(request.template_id.clone()))?;

        let mut dag = match request.mode {
            GenerationMode::Full => self.generate_full(&template, request).await?,
            GenerationMode::Minimal => self.generate_minimal(&template, request).await?,
            GenerationMode::Custom => self.generate_custom(&template, request).await?,
            GenerationMode::Optimized => {
                let mut base = self.generate_custom(&template, request).await?;
                apply_strategy_filter(&mut base, request.preferences.optimization_strategy);
                base.mode = GenerationMode::Optimized;
                base
            }
        };

        validate(&dag)?;
        dag.execution_order = execution_order(&dag.nodes, &dag.edges);
        dag.estimated_cost = estimate_cost(&dag.selected_tools);
        dag.estimated_time = estimate_time(&dag.nodes);
        dag.optimization_score = self.optimization_score(&dag);

        tracing::info!(
            dag_id = %dag.dag_id,
            nodes = dag.nodes.len(),
            edges = dag.edges.len(),
            tools = dag.selected_tools.len(),
            score = dag.optimization_score,
            "DAG generated"
        );
        Ok(dag)
    }

    async fn generate_full(
        &self,
        template: &DagTemplate,
        request: &GenerationRequest,
    ) -> Result<GeneratedDag> {
        let mut nodes = template.nodes.clone();
        let edges = template.edges.clone();

        let selected_tools = self.registry.select_for_agent(&[], &[], None).await;
        let all_ids: Vec<String> = selected_tools.iter().map(|t| t.id.clone()).collect();

        let mut tool_mapping = HashMap::new();
        for node in &mut nodes {
            if let Some(config) = node.agent_config_mut() {
                config.max_tools = all_ids.len();
                tool_mapping.insert(node.id.clone(), all_ids.clone());
            }
        }

        Ok(self.assemble(template, request, nodes, edges, selected_tools, tool_mapping))
    }

    async fn generate_minimal(
        &self,
        template: &DagTemplate,
        request: &GenerationRequest,
    ) -> Result<GeneratedDag> {
        let mut nodes = Vec::new();
        for node in &template.nodes {
            match node.kind {
                NodeKind::Input(_) | NodeKind::Output(_) => nodes.push(node.clone()),
                NodeKind::Agent(_) => {
                    if nodes.iter().any(|n: &DagNode| n.is_agent()) {
                        continue;
                    }
                    let mut minimal = node.clone();
                    if let Some(config) = minimal.agent_config_mut() {
                        config.preferred_categories = vec![ToolCategory::Reasoning];
                        config.preferred_types = vec![ToolType::Builtin];
                        config.max_tools = 1;
                    }
                    nodes.push(minimal);
                }
                _ => {}
            }
        }

        // Re-thread the survivors into a single input -> agent -> output
        // chain; the dropped intermediate nodes would otherwise leave the
        // output disconnected.
        let mut edges = Vec::new();
        let input_id = nodes
            .iter()
            .find(|n| matches!(n.kind, NodeKind::Input(_)))
            .map(|n| n.id.clone());
        let agent_id = nodes.iter().find(|n| n.is_agent()).map(|n| n.id.clone());
        let output_id = nodes
            .iter()
            .find(|n| matches!(n.kind, NodeKind::Output(_)))
            .map(|n| n.id.clone());
        match (&input_id, &agent_id, &output_id) {
            (Some(input), Some(agent), Some(output)) => {
                edges.push(DagEdge::new(input.clone(), agent.clone()));
                edges.push(DagEdge::new(agent.clone(), output.clone()));
            }
            (Some(input), None, Some(output)) => {
                edges.push(DagEdge::new(input.clone(), output.clone()));
            }
            _ => {}
        }

        let selected_tools = self
            .registry
            .select_for_agent(&[ToolCategory::Reasoning], &[ToolType::Builtin], Some(1))
            .await;
        let ids: Vec<String> = selected_tools.iter().map(|t| t.id.clone()).collect();

        let tool_mapping = nodes
            .iter()
            .filter(|n| n.is_agent())
            .map(|n| (n.id.clone(), ids.clone()))
            .collect();

        Ok(self.assemble(template, request, nodes, edges, selected_tools, tool_mapping))
    }

    async fn generate_custom(
        &self,
        template: &DagTemplate,
        request: &GenerationRequest,
    ) -> Result<GeneratedDag> {
        let mut nodes = Vec::new();
        for node in &template.nodes {
            if !should_include_node(node, request) {
                continue;
            }
            let mut kept = node.clone();
            customize_node(&mut kept, request);
            nodes.push(kept);
        }

        let edges = rebuild_edges(&template.edges, &nodes);
        let selected_tools = self.select_tools(request).await;
        let tool_mapping = map_tools_to_nodes(&nodes, &selected_tools, request);

        Ok(self.assemble(template, request, nodes, edges, selected_tools, tool_mapping))
    }

    /// Preference-driven selection minus exclusions, optionally intersected
    /// with an explicit allow list.
    async fn select_tools(&self, request: &GenerationRequest) -> Vec<ToolDefinition> {
        let prefs = &request.preferences;
        let candidates = self
            .registry
            .select_for_agent(&prefs.preferred_categories, &prefs.preferred_types, None)
            .await;

        candidates
            .into_iter()
            .filter(|t| !prefs.excluded_tools.contains(&t.id))
            .filter(|t| !request.disabled_tools.contains(&t.id))
            .filter(|t| request.enabled_tools.is_empty() || request.enabled_tools.contains(&t.id))
            .collect()
    }

    fn assemble(
        &self,
        template: &DagTemplate,
        request: &GenerationRequest,
        nodes: Vec<DagNode>,
        edges: Vec<DagEdge>,
        selected_tools: Vec<ToolDefinition>,
        tool_mapping: HashMap<NodeId, Vec<String>>,
    ) -> GeneratedDag {
        GeneratedDag {
            dag_id: format!(
                "{}_{}_{}",
                request.mode,
                template.template_id,
                Uuid::new_v4().simple()
            ),
            template_id: template.template_id.clone(),
            user_id: request.user_id.clone(),
            nodes,
            edges,
            execution_order: Vec::new(),
            selected_tools,
            tool_mapping,
            mode: request.mode,
            optimization_score: 0.0,
            estimated_cost: 0.0,
            estimated_time: 0.0,
            created_at: Utc::now(),
        }
    }

    fn optimization_score(&self, dag: &GeneratedDag) -> f64 {
        let mean_success = if dag.selected_tools.is_empty() {
            0.0
        } else {
            dag.selected_tools
                .iter()
                .map(|t| t.success_rate)
                .sum::<f64>()
                / dag.selected_tools.len() as f64
        };

        let time_band = if dag.estimated_time <= 30.0 {
            1.0
        } else if dag.estimated_time <= 60.0 {
            2.0 / 3.0
        } else {
            1.0 / 3.0
        };
        let cost_band = if dag.estimated_cost <= 0.5 {
            1.0
        } else if dag.estimated_cost <= 1.0 {
            2.0 / 3.0
        } else {
            1.0 / 3.0
        };

        let w = self.weights;
        (w.success_rate * mean_success + w.time_band * time_band + w.cost_band * cost_band).min(1.0)
    }
}

fn should_include_node(node: &DagNode, request: &GenerationRequest) -> bool {
    if matches!(node.kind, NodeKind::Input(_) | NodeKind::Output(_)) {
        return true;
    }

    if !request.selected_capabilities.is_empty()
        && !node
            .capabilities
            .iter()
            .any(|c| request.selected_capabilities.contains(c))
    {
        return false;
    }

    if let Some(config) = node.agent_config() {
        let preferred = &request.preferences.preferred_categories;
        if !preferred.is_empty()
            && !config
                .preferred_categories
                .iter()
                .any(|c| preferred.contains(c))
        {
            return false;
        }
    }

    true
}

fn customize_node(node: &mut DagNode, request: &GenerationRequest) {
    let node_id = node.id.clone();
    let Some(config) = node.agent_config_mut() else {
        return;
    };
    let prefs = &request.preferences;

    config.preferred_types = prefs.preferred_types.clone();
    config.preferred_categories = prefs.preferred_categories.clone();
    config.max_tools = prefs.max_tools_per_agent;

    if let Some(model) = &request.model_config {
        config.model.merge(model);
    }
    if !request.custom_instructions.is_empty() {
        config.instructions = format!("{}\n\n{}", config.instructions, request.custom_instructions);
    }
    if let Some(overrides) = prefs.custom_node_configs.get(&node_id) {
        if let Some(instructions) = &overrides.instructions {
            config.instructions = instructions.clone();
        }
        if let Some(temperature) = overrides.temperature {
            config.temperature = temperature;
        }
        if let Some(max_tokens) = overrides.max_tokens {
            config.max_tokens = max_tokens;
        }
        if let Some(max_tools) = overrides.max_tools {
            config.max_tools = max_tools;
        }
    }
}

fn rebuild_edges(edges: &[DagEdge], nodes: &[DagNode]) -> Vec<DagEdge> {
    let ids: HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
    edges
        .iter()
        .filter(|e| ids.contains(e.from.as_str()) && ids.contains(e.to.as_str()))
        .cloned()
        .collect()
}

fn map_tools_to_nodes(
    nodes: &[DagNode],
    tools: &[ToolDefinition],
    request: &GenerationRequest,
) -> HashMap<NodeId, Vec<String>> {
    let mut mapping = HashMap::new();
    for node in nodes {
        let Some(config) = node.agent_config() else {
            continue;
        };

        let mut suitable: Vec<&ToolDefinition> = tools
            .iter()
            .filter(|t| {
                config.preferred_categories.is_empty()
                    || config.preferred_categories.contains(&t.category)
            })
            .collect();
        sort_by_strategy(&mut suitable, request.preferences.optimization_strategy);
        suitable.truncate(config.max_tools);

        mapping.insert(
            node.id.clone(),
            suitable.iter().map(|t| t.id.clone()).collect(),
        );
    }
    mapping
}

/// Rank tools for one node; ties broken by ascending tool id.
fn sort_by_strategy(tools: &mut [&ToolDefinition], strategy: OptimizationStrategy) {
    let max_rt = tools
        .iter()
        .map(|t| t.avg_response_time)
        .fold(0.0_f64, f64::max)
        .max(1.0);

    match strategy {
        OptimizationStrategy::Performance => tools.sort_by(|a, b| {
            a.avg_response_time
                .total_cmp(&b.avg_response_time)
                .then(a.id.cmp(&b.id))
        }),
        OptimizationStrategy::Accuracy => tools.sort_by(|a, b| {
            b.success_rate
                .total_cmp(&a.success_rate)
                .then(a.id.cmp(&b.id))
        }),
        OptimizationStrategy::Cost => tools.sort_by(|a, b| {
            let a_tier = u8::from(a.tool_type != ToolType::Builtin);
            let b_tier = u8::from(b.tool_type != ToolType::Builtin);
            a_tier
                .cmp(&b_tier)
                .then(a.avg_response_time.total_cmp(&b.avg_response_time))
                .then(a.id.cmp(&b.id))
        }),
        OptimizationStrategy::Balanced => tools.sort_by(|a, b| {
            let score = |t: &ToolDefinition| {
                0.5 * t.success_rate - 0.3 * (t.avg_response_time / max_rt)
            };
            score(b).total_cmp(&score(a)).then(a.id.cmp(&b.id))
        }),
    }
}

/// Optimized-mode post filter: trim the selected set by the strategy, then
/// drop any mapped ids that no longer survive.
fn apply_strategy_filter(dag: &mut GeneratedDag, strategy: OptimizationStrategy) {
    dag.selected_tools.retain(|t| match strategy {
        OptimizationStrategy::Performance => t.avg_response_time <= 5000.0,
        OptimizationStrategy::Accuracy => t.success_rate >= 0.9,
        OptimizationStrategy::Cost => t.tool_type == ToolType::Builtin,
        OptimizationStrategy::Balanced => {
            let time_part = (5000.0 - t.avg_response_time.min(5000.0)) / 5000.0;
            let type_part = if t.tool_type == ToolType::Builtin {
                1.0
            } else {
                0.5
            };
            t.success_rate * 0.4 + time_part * 0.3 + type_part * 0.3 >= 0.6
        }
    });

    let surviving: HashSet<&str> = dag.selected_tools.iter().map(|t| t.id.as_str()).collect();
    for ids in dag.tool_mapping.values_mut() {
        ids.retain(|id| surviving.contains(id.as_str()));
    }
}

/// Structural validation: exactly one input, at least one output, no cycles,
/// every agent node reachable from the input.
fn validate(dag: &GeneratedDag) -> Result<()> {
    let inputs: Vec<&DagNode> = dag
        .nodes
        .iter()
        .filter(|n| matches!(n.kind, NodeKind::Input(_)))
        .collect();
    if inputs.is_empty() {
        return Err(OrchestratorError::DagInvalid("no input node".into()));
    }
    if inputs.len() > 1 {
        return Err(OrchestratorError::DagInvalid(format!(
            "{} input nodes, expected exactly one",
            inputs.len()
        )));
    }
    if !dag
        .nodes
        .iter()
        .any(|n| matches!(n.kind, NodeKind::Output(_)))
    {
        return Err(OrchestratorError::DagInvalid("no output node".into()));
    }

    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for node in &dag.nodes {
        adjacency.entry(node.id.as_str()).or_default();
    }
    for edge in &dag.edges {
        adjacency
            .entry(edge.from.as_str())
            .or_default()
            .push(edge.to.as_str());
    }

    if has_cycle(&adjacency) {
        return Err(OrchestratorError::DagInvalid("cycle detected".into()));
    }

    let mut reachable = HashSet::new();
    let mut queue = VecDeque::from([inputs[0].id.as_str()]);
    while let Some(id) = queue.pop_front() {
        if !reachable.insert(id) {
            continue;
        }
        if let Some(next) = adjacency.get(id) {
            queue.extend(next.iter().copied());
        }
    }
    for node in dag.agent_nodes() {
        if !reachable.contains(node.id.as_str()) {
            return Err(OrchestratorError::DagInvalid(format!(
                "agent node '{}' unreachable from input",
                node.id
            )));
        }
    }

    Ok(())
}

/// DFS 3-coloring cycle detection.
fn has_cycle(adjacency: &HashMap<&str, Vec<&str>>) -> bool {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    fn visit(
        id: &str,
        adjacency: &HashMap<&str, Vec<&str>>,
        colors: &mut HashMap<String, Color>,
    ) -> bool {
        match colors.get(id) {
            Some(Color::Gray) => return true,
            Some(Color::Black) => return false,
            _ => {}
        }
        colors.insert(id.to_string(), Color::Gray);
        if let Some(next) = adjacency.get(id) {
            for neighbor in next {
                if visit(neighbor, adjacency, colors) {
                    return true;
                }
            }
        }
        colors.insert(id.to_string(), Color::Black);
        false
    }

    let mut colors: HashMap<String, Color> = HashMap::new();
    adjacency.keys().any(|id| {
        !matches!(colors.get(*id), Some(Color::Black)) && visit(id, adjacency, &mut colors)
    })
}

/// Kahn topological order.
fn execution_order(nodes: &[DagNode], edges: &[DagEdge]) -> Vec<NodeId> {
    let mut in_degree: HashMap<&str, usize> = nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in edges {
        adjacency
            .entry(edge.from.as_str())
            .or_default()
            .push(edge.to.as_str());
        if let Some(degree) = in_degree.get_mut(edge.to.as_str()) {
            *degree += 1;
        }
    }

    let mut ready: VecDeque<&str> = nodes
        .iter()
        .map(|n| n.id.as_str())
        .filter(|id| in_degree[id] == 0)
        .collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(id) = ready.pop_front() {
        order.push(id.to_string());
        if let Some(next) = adjacency.get(id) {
            for neighbor in next {
                let degree = in_degree.get_mut(neighbor).expect("known node");
                *degree -= 1;
                if *degree == 0 {
                    ready.push_back(neighbor);
                }
            }
        }
    }
    order
}

fn estimate_cost(tools: &[ToolDefinition]) -> f64 {
    let mcp = tools.iter().filter(|t| t.tool_type == ToolType::Mcp).count();
    let external = tools
        .iter()
        .filter(|t| t.tool_type == ToolType::External)
        .count();
    0.1 + 0.02 * tools.len() as f64 + 0.05 * mcp as f64 + 0.03 * external as f64
}

fn estimate_time(nodes: &[DagNode]) -> f64 {
    let agents = nodes.iter().filter(|n| n.is_agent()).count();
    let rest: f64 = nodes
        .iter()
        .filter(|n| !n.is_agent())
        .map(|n| n.kind.time_weight())
        .sum();
    5.0 + 10.0 * agents as f64 + rest
}
