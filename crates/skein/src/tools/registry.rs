//! Tool registry - the in-memory set of tool definitions plus its indices.
//!
//! Single writer (the discovery loop), many readers (selection, execution).
//! Indices are rebuilt while holding the write locks so readers never observe
//! a half-updated view.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

use super::definition::{ToolCategory, ToolDefinition, ToolHealth, ToolType};

/// Central registry for all known tools.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, ToolDefinition>>,
    by_category: RwLock<HashMap<ToolCategory, Vec<String>>>,
    by_service: RwLock<HashMap<String, Vec<String>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            by_category: RwLock::new(HashMap::new()),
            by_service: RwLock::new(HashMap::new()),
        }
    }

    /// Registry pre-seeded with the builtin tools.
    pub async fn with_builtins() -> Self {
        let registry = Self::new();
        for tool in super::builtin::builtin_tools() {
            registry.register(tool).await;
        }
        registry
    }

    /// Register or replace a tool. Idempotent by id; rolling stats of an
    /// existing entry survive the upsert.
    pub async fn register(&self, mut tool: ToolDefinition) {
        let mut tools = self.tools.write().await;
        let mut by_category = self.by_category.write().await;
        let mut by_service = self.by_service.write().await;

        if let Some(existing) = tools.get(&tool.id) {
            tool.total_calls = existing.total_calls;
            tool.successful_calls = existing.successful_calls;
            tool.success_rate = existing.success_rate;
            tool.avg_response_time = existing.avg_response_time;
            tool.created_at = existing.created_at;
        }

        tools.insert(tool.id.clone(), tool);
        Self::rebuild_indices(&tools, &mut by_category, &mut by_service);
    }

    pub async fn get(&self, id: &str) -> Option<ToolDefinition> {
        self.tools.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<ToolDefinition> {
        self.tools.read().await.values().cloned().collect()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.tools.read().await.contains_key(id)
    }

    pub async fn count(&self) -> usize {
        self.tools.read().await.len()
    }

    pub async fn remove(&self, id: &str) -> Option<ToolDefinition> {
        let mut tools = self.tools.write().await;
        let mut by_category = self.by_category.write().await;
        let mut by_service = self.by_service.write().await;

        let removed = tools.remove(id);
        if removed.is_some() {
            Self::rebuild_indices(&tools, &mut by_category, &mut by_service);
        }
        removed
    }

    /// Drop every tool belonging to `service_name`. Returns how many went.
    pub async fn remove_service_tools(&self, service_name: &str) -> usize {
        let ids: Vec<String> = {
            let by_service = self.by_service.read().await;
            by_service.get(service_name).cloned().unwrap_or_default()
        };
        for id in &ids {
            self.remove(id).await;
        }
        ids.len()
    }

    /// Flip availability for every tool of a service after a health probe.
    pub async fn set_service_availability(&self, service_name: &str, healthy: bool) {
        let mut tools = self.tools.write().await;
        for tool in tools.values_mut() {
            if tool.service_name == service_name {
                tool.is_available = healthy && tool.is_enabled;
                tool.health = if healthy {
                    ToolHealth::Healthy
                } else {
                    ToolHealth::Unhealthy
                };
            }
        }
    }

    pub async fn set_tool_availability(&self, id: &str, available: bool) {
        let mut tools = self.tools.write().await;
        if let Some(tool) = tools.get_mut(id) {
            tool.is_available = available;
            if !available {
                tool.health = ToolHealth::Unhealthy;
            }
        }
    }

    /// Select tools for an agent node: enabled and available, filtered by the
    /// given categories and types when non-empty, sorted by success rate
    /// (descending) then average response time (ascending), truncated to
    /// `max_tools` when present.
    pub async fn select_for_agent(
        &self,
        categories: &[ToolCategory],
        types: &[ToolType],
        max_tools: Option<usize>,
    ) -> Vec<ToolDefinition> {
        let tools = self.tools.read().await;
        let mut selected: Vec<ToolDefinition> = tools
            .values()
            .filter(|t| t.usable())
            .filter(|t| categories.is_empty() || categories.contains(&t.category))
            .filter(|t| types.is_empty() || types.contains(&t.tool_type))
            .cloned()
            .collect();

        selected.sort_by(|a, b| {
            b.success_rate
                .total_cmp(&a.success_rate)
                .then(a.avg_response_time.total_cmp(&b.avg_response_time))
                .then(a.id.cmp(&b.id))
        });

        if let Some(max) = max_tools {
            selected.truncate(max);
        }
        selected
    }

    /// Invocation schemas for the given ids, in the order requested, skipping
    /// tools that are no longer usable.
    pub async fn schemas_for(&self, ids: &[String]) -> Vec<Value> {
        let tools = self.tools.read().await;
        ids.iter()
            .filter_map(|id| tools.get(id))
            .filter(|t| t.usable())
            .map(|t| t.schema.clone())
            .collect()
    }

    /// Fold one completed call into a tool's rolling stats.
    pub async fn record_call(&self, id: &str, latency_ms: f64, success: bool) {
        let mut tools = self.tools.write().await;
        if let Some(tool) = tools.get_mut(id) {
            tool.record_call(latency_ms, success);
        }
    }

    pub async fn stats(&self) -> RegistryStats {
        let tools = self.tools.read().await;
        let mut by_category: HashMap<String, usize> = HashMap::new();
        let mut by_type: HashMap<String, usize> = HashMap::new();
        let mut available = 0;
        for tool in tools.values() {
            *by_category.entry(tool.category.to_string()).or_default() += 1;
            *by_type.entry(tool.tool_type.to_string()).or_default() += 1;
            if tool.usable() {
                available += 1;
            }
        }
        RegistryStats {
            total_tools: tools.len(),
            available_tools: available,
            by_category,
            by_type,
        }
    }

    fn rebuild_indices(
        tools: &HashMap<String, ToolDefinition>,
        by_category: &mut HashMap<ToolCategory, Vec<String>>,
        by_service: &mut HashMap<String, Vec<String>>,
    ) {
        by_category.clear();
        by_service.clear();
        for tool in tools.values() {
            by_category
                .entry(tool.category)
                .or_default()
                .push(tool.id.clone());
            by_service
                .entry(tool.service_name.clone())
                .or_default()
                .push(tool.id.clone());
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total_tools: usize,
    pub available_tools: usize,
    pub by_category: HashMap<String, usize>,
    pub by_type: HashMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(service: &str, name: &str, category: ToolCategory, rate: f64, ms: f64) -> ToolDefinition {
        ToolDefinition::new(service, name, ToolType::External, category).with_stats(rate, ms)
    }

    #[tokio::test]
    async fn test_register_is_idempotent_and_keeps_stats() {
        let registry = ToolRegistry::new();
        registry
            .register(tool("svc", "a", ToolCategory::Search, 0.0, 0.0))
            .await;
        registry.record_call("svc.a", 120.0, true).await;

        // Re-registering the same id must not reset counters.
        registry
            .register(tool("svc", "a", ToolCategory::Search, 0.0, 0.0))
            .await;

        let stored = registry.get("svc.a").await.unwrap();
        assert_eq!(stored.total_calls, 1);
        assert!((stored.success_rate - 1.0).abs() < f64::EPSILON);
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn test_selection_sorted_and_truncated() {
        let registry = ToolRegistry::new();
        registry
            .register(tool("svc", "slow", ToolCategory::Search, 0.9, 900.0))
            .await;
        registry
            .register(tool("svc", "fast", ToolCategory::Search, 0.9, 100.0))
            .await;
        registry
            .register(tool("svc", "best", ToolCategory::Search, 0.99, 500.0))
            .await;
        registry
            .register(tool("svc", "off", ToolCategory::Search, 1.0, 1.0))
            .await;
        registry.set_tool_availability("svc.off", false).await;

        let selected = registry
            .select_for_agent(&[ToolCategory::Search], &[], Some(2))
            .await;
        let ids: Vec<&str> = selected.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["svc.best", "svc.fast"]);
    }

    #[tokio::test]
    async fn test_selection_unbounded_without_max() {
        let registry = ToolRegistry::with_builtins().await;
        let all = registry.select_for_agent(&[], &[], None).await;
        assert_eq!(all.len(), registry.count().await);
    }

    #[tokio::test]
    async fn test_category_and_type_filters() {
        let registry = ToolRegistry::with_builtins().await;
        let reasoning = registry
            .select_for_agent(&[ToolCategory::Reasoning], &[ToolType::Builtin], Some(1))
            .await;
        assert_eq!(reasoning.len(), 1);
        assert_eq!(reasoning[0].id, "builtin.reasoning");
    }

    #[tokio::test]
    async fn test_schemas_preserve_requested_order() {
        let registry = ToolRegistry::with_builtins().await;
        let schemas = registry
            .schemas_for(&[
                "builtin.calculator".to_string(),
                "builtin.reasoning".to_string(),
                "missing.tool".to_string(),
            ])
            .await;
        assert_eq!(schemas.len(), 2);
        assert_eq!(schemas[0]["function"]["name"], "calculator");
        assert_eq!(schemas[1]["function"]["name"], "reasoning");
    }

    #[tokio::test]
    async fn test_service_availability_flip_and_removal() {
        let registry = ToolRegistry::new();
        registry
            .register(tool("svc", "a", ToolCategory::Search, 0.9, 10.0))
            .await;
        registry
            .register(tool("svc", "b", ToolCategory::Data, 0.9, 10.0))
            .await;

        registry.set_service_availability("svc", false).await;
        assert!(registry
            .select_for_agent(&[], &[], None)
            .await
            .is_empty());

        assert_eq!(registry.remove_service_tools("svc").await, 2);
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_stats_counts_by_category() {
        let registry = ToolRegistry::with_builtins().await;
        let stats = registry.stats().await;
        assert_eq!(stats.total_tools, 2);
        assert_eq!(stats.by_category.get("reasoning"), Some(&1));
        assert_eq!(stats.by_type.get("builtin"), Some(&2));
    }
}
