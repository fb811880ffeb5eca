//! Persisted instance configuration, written through an external collaborator.
//!
//! The core does not own a database; it hands the document below, verbatim,
//! to whatever [`ConfigStore`] the integrator wires in.

use std::collections::BTreeMap;
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DagSection {
    pub nodes: Vec<Value>,
    pub edges: Vec<Value>,
    pub execution_order: Vec<String>,
    pub optimization_score: f64,
    pub estimated_cost: f64,
    pub estimated_time: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSection {
    pub name: String,
    pub description: String,
    pub instructions: String,
    pub model_config: Value,
    pub temperature: f32,
    pub max_tokens: u32,
    pub memory_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsSection {
    pub total_tools: usize,
    pub by_category: BTreeMap<String, usize>,
    pub by_node: BTreeMap<String, Vec<String>>,
    pub details: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaSection {
    pub created_at: DateTime<Utc>,
    pub status: String,
    pub health_status: String,
}

/// The exact shape persisted for one agent instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceDocument {
    pub instance_id: String,
    pub agent_id: String,
    pub dag_id: String,
    pub user_id: String,
    pub template_id: String,
    pub generation_mode: String,
    pub dag: DagSection,
    pub agent: AgentSection,
    pub tools: ToolsSection,
    pub meta: MetaSection,
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn save(&self, document: &InstanceDocument) -> Result<()>;
    async fn delete(&self, instance_id: &str) -> Result<()>;
}

/// In-memory store for tests and embedded use.
#[derive(Default)]
pub struct MemoryStore {
    documents: Mutex<HashMap<String, InstanceDocument>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, instance_id: &str) -> Option<InstanceDocument> {
        self.documents.lock().await.get(instance_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.documents.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.lock().await.is_empty()
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn save(&self, document: &InstanceDocument) -> Result<()> {
        self.documents
            .lock()
            .await
            .insert(document.instance_id.clone(), document.clone());
        Ok(())
    }

    async fn delete(&self, instance_id: &str) -> Result<()> {
        self.documents.lock().await.remove(instance_id);
        Ok(())
    }
}
