//! DAG execution: topological batching, parallel node dispatch, edge-guard
//! evaluation and deadline-bounded cancellation.
//!
//! The loop drains every ready node into a batch, runs the batch
//! concurrently, then walks the completed nodes' outgoing edges. A failed
//! node never satisfies its out-edges; its siblings keep running. A node
//! starts only after all of its in-edges are satisfied.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::generator::GeneratedDag;
use super::node::{DagNode, MergeStrategy, NodeId, NodeKind, NodeStatus};
use crate::error::{OrchestratorError, Result};
use crate::events::{EventSink, OrchestratorEvent};
use crate::tools::ToolRegistry;
use crate::worker::{WorkerConfig, WorkerRuntime};

/// Why an execution did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Deadline,
    Cancelled,
    UpstreamFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Failed,
}

/// Full record of one DAG execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub failure: Option<FailureReason>,
    pub node_results: HashMap<NodeId, Value>,
    pub node_statuses: HashMap<NodeId, NodeStatus>,
    pub node_errors: HashMap<NodeId, String>,
    pub execution_path: Vec<NodeId>,
    pub final_result: Option<Value>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }

    /// Map a failed outcome onto the public error kinds.
    pub fn to_error(&self, deadline: Duration) -> Option<OrchestratorError> {
        match self.failure.as_ref()? {
            FailureReason::Deadline | FailureReason::Cancelled => {
                Some(OrchestratorError::Deadline(deadline))
            }
            FailureReason::UpstreamFailure => Some(OrchestratorError::UpstreamFailure(
                "no output node completed".into(),
            )),
        }
    }
}

pub struct DagExecutor {
    registry: Arc<ToolRegistry>,
    worker: Arc<dyn WorkerRuntime>,
    events: Arc<dyn EventSink>,
}

impl DagExecutor {
    pub fn new(
        registry: Arc<ToolRegistry>,
        worker: Arc<dyn WorkerRuntime>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            registry,
            worker,
            events,
        }
    }

    /// Run a compiled DAG against one request payload. The deadline bounds
    /// the whole execution; on expiry, in-flight nodes are abandoned and
    /// pending ones marked skipped.
    pub async fn execute(
        &self,
        dag: &GeneratedDag,
        input: &Value,
        deadline: Duration,
        cancel: CancellationToken,
        instance_id: &str,
    ) -> ExecutionOutcome {
        let started_at = Utc::now();
        let deadline_at = tokio::time::Instant::now() + deadline;

        let nodes: HashMap<&str, &DagNode> =
            dag.nodes.iter().map(|n| (n.id.as_str(), n)).collect();
        let mut outgoing: HashMap<&str, Vec<&super::node::DagEdge>> = HashMap::new();
        let mut dependencies: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut total_in: HashMap<&str, usize> =
            dag.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
        for edge in &dag.edges {
            outgoing.entry(edge.from.as_str()).or_default().push(edge);
            dependencies
                .entry(edge.to.as_str())
                .or_default()
                .push(edge.from.as_str());
            if let Some(count) = total_in.get_mut(edge.to.as_str()) {
                *count += 1;
            }
        }

        let mut ready: VecDeque<&str> = dag
            .nodes
            .iter()
            .map(|n| n.id.as_str())
            .filter(|id| total_in[id] == 0)
            .collect();

        // Per node: how many in-edges fired, how many can never fire. A node
        // runs once every in-edge is settled and at least one fired; a node
        // whose in-edges are all dead is dead itself, and its own out-edges
        // die with it.
        let mut satisfied: HashMap<&str, usize> =
            dag.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
        let mut dead: HashMap<&str, usize> =
            dag.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
        let mut dead_nodes: std::collections::HashSet<&str> = std::collections::HashSet::new();

        let mut results: HashMap<NodeId, Value> = HashMap::new();
        let mut statuses: HashMap<NodeId, NodeStatus> = HashMap::new();
        let mut errors: HashMap<NodeId, String> = HashMap::new();
        let mut path: Vec<NodeId> = Vec::new();
        let mut interrupted: Option<FailureReason> = None;

        'schedule: while !ready.is_empty() {
            let batch: Vec<&str> = ready.drain(..).collect();

            let results_ref = &results;
            let tasks = batch.iter().map(|id| {
                let node = nodes[id];
                let deps = dependencies.get(id).cloned().unwrap_or_default();
                let cancel = cancel.clone();
                async move {
                    let run = self.run_node(node, &deps, results_ref, input, instance_id);
                    let outcome = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Err(OrchestratorError::Deadline(deadline)),
                        _ = tokio::time::sleep_until(deadline_at) => {
                            Err(OrchestratorError::Deadline(deadline))
                        }
                        result = run => result,
                    };
                    (node.id.clone(), outcome)
                }
            });
            let finished = futures::future::join_all(tasks).await;

            // Settle in-edges: (destination, fired?) marks, with dead paths
            // propagating through the worklist.
            let mut marks: Vec<(&str, bool)> = Vec::new();

            for (node_id, outcome) in finished {
                match outcome {
                    Ok(result) => {
                        statuses.insert(node_id.clone(), NodeStatus::Completed);
                        path.push(node_id.clone());
                        if let Some(edges) = outgoing.get(node_id.as_str()) {
                            for edge in edges {
                                let pass = edge
                                    .condition
                                    .as_ref()
                                    .map(|c| c.evaluate(&result))
                                    .unwrap_or(true);
                                marks.push((edge.to.as_str(), pass));
                            }
                        }
                        results.insert(node_id, result);
                    }
                    Err(OrchestratorError::Deadline(_)) => {
                        statuses.insert(node_id.clone(), NodeStatus::Failed);
                        errors.insert(node_id, "deadline expired".into());
                        interrupted = Some(if cancel.is_cancelled() {
                            FailureReason::Cancelled
                        } else {
                            FailureReason::Deadline
                        });
                    }
                    Err(err) => {
                        tracing::warn!(node = %node_id, error = %err, "node execution failed");
                        statuses.insert(node_id.clone(), NodeStatus::Failed);
                        errors.insert(node_id.clone(), err.to_string());
                        if let Some(edges) = outgoing.get(node_id.as_str()) {
                            for edge in edges {
                                marks.push((edge.to.as_str(), false));
                            }
                        }
                    }
                }
            }

            while let Some((to, fired)) = marks.pop() {
                if fired {
                    *satisfied.get_mut(to).expect("known node") += 1;
                } else {
                    *dead.get_mut(to).expect("known node") += 1;
                }
                if satisfied[to] + dead[to] < total_in[to] {
                    continue;
                }
                if satisfied[to] > 0 {
                    ready.push_back(to);
                } else if dead_nodes.insert(to) {
                    if let Some(edges) = outgoing.get(to) {
                        for edge in edges {
                            marks.push((edge.to.as_str(), false));
                        }
                    }
                }
            }

            if interrupted.is_some() {
                break 'schedule;
            }
        }

        // Anything never scheduled is skipped.
        for node in &dag.nodes {
            statuses
                .entry(node.id.clone())
                .or_insert(NodeStatus::Skipped);
        }

        let final_result = dag
            .nodes
            .iter()
            .find(|n| matches!(n.kind, NodeKind::Output(_)) && results.contains_key(&n.id))
            .map(|n| results[&n.id].clone())
            .or_else(|| path.last().map(|id| results[id].clone()));

        let output_completed = dag
            .nodes
            .iter()
            .any(|n| matches!(n.kind, NodeKind::Output(_)) && results.contains_key(&n.id));

        let (status, failure) = match interrupted {
            Some(reason) => (ExecutionStatus::Failed, Some(reason)),
            None if output_completed => (ExecutionStatus::Completed, None),
            None => (ExecutionStatus::Failed, Some(FailureReason::UpstreamFailure)),
        };

        ExecutionOutcome {
            execution_id: format!("exec_{}", uuid::Uuid::new_v4().simple()),
            status,
            failure,
            node_results: results,
            node_statuses: statuses,
            node_errors: errors,
            execution_path: path,
            final_result,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Total dispatch over the closed node sum.
    async fn run_node(
        &self,
        node: &DagNode,
        deps: &[&str],
        results: &HashMap<NodeId, Value>,
        input: &Value,
        instance_id: &str,
    ) -> Result<Value> {
        tracing::debug!(node = %node.id, kind = node.kind.type_name(), "executing node");
        match &node.kind {
            NodeKind::Input(_) => Ok(input.clone()),
            NodeKind::Output(_) => {
                let mut output = serde_json::Map::new();
                for dep in deps {
                    if let Some(result) = results.get(*dep) {
                        output.insert((*dep).to_string(), result.clone());
                    }
                }
                Ok(Value::Object(output))
            }
            NodeKind::Agent(config) => {
                self.run_agent_node(node, config, deps, results, input, instance_id)
                    .await
            }
            NodeKind::Condition(config) => {
                let Some(condition) = &config.condition else {
                    return Ok(json!({ "condition_met": true }));
                };
                for dep in deps {
                    if let Some(result) = results.get(*dep) {
                        if let Some(value) = condition.field_value(result) {
                            let mut out = serde_json::Map::new();
                            out.insert(
                                "condition_met".into(),
                                Value::Bool(condition.op.compare(value, condition.threshold)),
                            );
                            out.insert(condition.field.to_string(), Value::from(value));
                            return Ok(Value::Object(out));
                        }
                    }
                }
                Ok(json!({ "condition_met": true }))
            }
            NodeKind::Merge(config) => match config.strategy {
                MergeStrategy::Concat => {
                    let mut parts = Vec::new();
                    for dep in deps {
                        if let Some(text) = results.get(*dep).and_then(result_text) {
                            parts.push(text.to_string());
                        }
                    }
                    Ok(json!({ "merged_response": parts.join("\n") }))
                }
                MergeStrategy::Combine => {
                    let mut combined = serde_json::Map::new();
                    for dep in deps {
                        if let Some(result) = results.get(*dep) {
                            combined.insert((*dep).to_string(), result.clone());
                        }
                    }
                    Ok(Value::Object(combined))
                }
            },
            NodeKind::Parallel(_) => Ok(json!({
                "parallel_coordinator": true,
                "node_id": node.id,
            })),
        }
    }

    async fn run_agent_node(
        &self,
        node: &DagNode,
        config: &super::node::AgentNodeConfig,
        deps: &[&str],
        results: &HashMap<NodeId, Value>,
        input: &Value,
        instance_id: &str,
    ) -> Result<Value> {
        // Template variables come from the request payload's top-level keys.
        let instructions = substitute_variables(&config.instructions, input);
        let knowledge_bases = config
            .knowledge_bases
            .iter()
            .map(|kb| substitute_variables(kb, input))
            .collect();

        // Tools are resolved live so availability changes since generation
        // are reflected.
        let tools = self
            .registry
            .select_for_agent(
                &config.preferred_categories,
                &config.preferred_types,
                Some(config.max_tools),
            )
            .await;
        let tool_ids: Vec<String> = tools.iter().map(|t| t.id.clone()).collect();
        let schemas = self.registry.schemas_for(&tool_ids).await;

        let message = assemble_agent_input(deps, results, input);

        let worker_config = WorkerConfig {
            name: config.agent_name.clone(),
            instructions,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            tool_schemas: schemas,
            knowledge_bases,
        };

        let handle = self.worker.create(worker_config).await?;
        let started = Instant::now();
        let run = self.worker.run(&handle, &message).await;
        // The binding is released no matter how the run went.
        if let Err(err) = self.worker.destroy(&handle).await {
            tracing::debug!(node = %node.id, error = %err, "worker destroy failed");
        }

        match run {
            Ok(reply) => {
                let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                self.events.emit(OrchestratorEvent::ModelCalled {
                    instance_id: instance_id.to_string(),
                    latency_ms,
                    tokens_used: reply.tokens_used,
                });

                let mut result = serde_json::Map::new();
                // A structured reply surfaces its fields (confidence,
                // complexity, ...) for edge guards downstream.
                if let Ok(Value::Object(parsed)) = serde_json::from_str::<Value>(&reply.text) {
                    for (k, v) in parsed {
                        result.insert(k, v);
                    }
                }
                result.insert("response".into(), Value::from(reply.text));
                result.insert("execution_time_ms".into(), Value::from(latency_ms));
                result.insert("tokens_used".into(), Value::from(reply.tokens_used));
                result.insert(
                    "tools_used".into(),
                    Value::Array(tool_ids.into_iter().map(Value::from).collect()),
                );
                Ok(Value::Object(result))
            }
            Err(err) => {
                self.events.emit(OrchestratorEvent::ModelCallFailed {
                    instance_id: instance_id.to_string(),
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }
}

/// Pull the text out of a node result for merge/input assembly.
fn result_text(result: &Value) -> Option<&str> {
    result
        .as_str()
        .or_else(|| result.get("response").and_then(Value::as_str))
        .or_else(|| result.get("merged_response").and_then(Value::as_str))
}

/// Replace `{key}` placeholders with the request payload's top-level values.
fn substitute_variables(text: &str, input: &Value) -> String {
    let Some(object) = input.as_object() else {
        return text.to_string();
    };
    let mut output = text.to_string();
    for (key, value) in object {
        let placeholder = format!("{{{key}}}");
        if output.contains(&placeholder) {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            output = output.replace(&placeholder, &rendered);
        }
    }
    output
}

/// Compose the message an agent node receives: the raw input fields plus one
/// line per completed dependency.
fn assemble_agent_input(
    deps: &[&str],
    results: &HashMap<NodeId, Value>,
    input: &Value,
) -> String {
    let mut lines = Vec::new();

    if let Some(object) = input.as_object() {
        for (key, value) in object {
            match value {
                Value::String(s) => lines.push(format!("{key}: {s}")),
                other => lines.push(format!("{key}: {other}")),
            }
        }
    } else if !input.is_null() {
        lines.push(input.to_string());
    }

    for dep in deps {
        if *dep == "input" {
            continue;
        }
        if let Some(text) = results.get(*dep).and_then(result_text) {
            lines.push(format!("Previous result from {dep}: {text}"));
        }
    }

    if lines.is_empty() {
        "Please proceed with the task.".to_string()
    } else {
        lines.join("\n")
    }
}
