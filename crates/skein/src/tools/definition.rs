//! Tool definitions - the unit the registry manages and the generator maps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumIter, EnumString};

/// Where a tool comes from.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ToolType {
    Builtin,
    System,
    External,
    Mcp,
}

/// What a tool is for. Closed set; unknown categories from discovery are
/// logged and the tool skipped.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ToolCategory {
    Search,
    Content,
    File,
    Reasoning,
    Calculation,
    Communication,
    Analysis,
    Automation,
    Security,
    Data,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ToolHealth {
    Healthy,
    Unhealthy,
    Unknown,
}

/// A named, schema-typed, invocable capability.
///
/// Identity (`id = service_name + "." + name`) is immutable once registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub id: String,
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub tool_type: ToolType,
    pub category: ToolCategory,

    pub service_name: String,
    pub endpoint: String,
    pub schema: Value,

    pub permission_level: String,
    pub rate_limit: Option<u32>,
    pub timeout_secs: u64,

    pub is_enabled: bool,
    pub is_available: bool,
    pub health: ToolHealth,

    pub total_calls: u64,
    pub successful_calls: u64,
    pub success_rate: f64,
    pub avg_response_time: f64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ToolDefinition {
    pub fn new(
        service_name: impl Into<String>,
        name: impl Into<String>,
        tool_type: ToolType,
        category: ToolCategory,
    ) -> Self {
        let service_name = service_name.into();
        let name = name.into();
        let now = Utc::now();
        Self {
            id: format!("{service_name}.{name}"),
            display_name: name.clone(),
            description: String::new(),
            name,
            tool_type,
            category,
            service_name,
            endpoint: String::new(),
            schema: Value::Null,
            permission_level: "user".into(),
            rate_limit: None,
            timeout_secs: 30,
            is_enabled: true,
            is_available: true,
            health: ToolHealth::Unknown,
            total_calls: 0,
            successful_calls: 0,
            success_rate: 0.0,
            avg_response_time: 0.0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_health(mut self, health: ToolHealth) -> Self {
        self.health = health;
        self
    }

    /// Seed rolling stats, mainly for tests and discovery payloads that carry
    /// historical figures.
    pub fn with_stats(mut self, success_rate: f64, avg_response_time: f64) -> Self {
        self.success_rate = success_rate;
        self.avg_response_time = avg_response_time;
        self
    }

    /// True when the tool may be handed to an agent right now.
    pub fn usable(&self) -> bool {
        self.is_enabled && self.is_available
    }

    /// Fold one completed call into the rolling stats. The success rate is
    /// recomputed from cumulative counters; response time is a running mean.
    pub fn record_call(&mut self, latency_ms: f64, success: bool) {
        self.total_calls += 1;
        if success {
            self.successful_calls += 1;
        }
        self.success_rate = self.successful_calls as f64 / self.total_calls as f64;
        let n = self.total_calls as f64;
        self.avg_response_time = self.avg_response_time + (latency_ms - self.avg_response_time) / n;
        self.updated_at = Utc::now();
    }
}
