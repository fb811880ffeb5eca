//! Service discovery and health probing for remote tool services.
//!
//! Each configured service exposes a tool list endpoint and a health path.
//! Discovery upserts parsed definitions into the registry; probes flip
//! availability. A service that stays unhealthy for two consecutive probes
//! has its tools removed until a later discovery finds it again. None of
//! these paths surface errors to callers - failures only move flags.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::definition::{ToolCategory, ToolDefinition, ToolHealth, ToolType};
use super::registry::ToolRegistry;
use crate::error::{OrchestratorError, Result};

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(15);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const REMOVAL_STRIKES: u32 = 2;

/// One upstream tool service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEndpoints {
    pub name: String,
    pub base_url: String,
    pub health_path: String,
    pub tools_path: String,
    pub tool_type: ToolType,
}

impl ServiceEndpoints {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        tools_path: impl Into<String>,
        tool_type: ToolType,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            health_path: "/health".into(),
            tools_path: tools_path.into(),
            tool_type,
        }
    }
}

/// The standard trio of upstream services, rooted at the given base URLs.
pub fn standard_services(
    mcp_url: impl Into<String>,
    tools_url: impl Into<String>,
    system_url: impl Into<String>,
) -> Vec<ServiceEndpoints> {
    vec![
        ServiceEndpoints::new("mcp-service", mcp_url, "/api/v1/mcp/tools/list", ToolType::Mcp),
        ServiceEndpoints::new(
            "tools-service",
            tools_url,
            "/api/v1/tools/list",
            ToolType::External,
        ),
        ServiceEndpoints::new(
            "system-service",
            system_url,
            "/api/v1/tools/list",
            ToolType::System,
        ),
    ]
}

/// Payload for gateway registration at startup.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayRegistration {
    pub service_name: String,
    pub url: String,
    pub health_path: String,
    pub routes: Vec<String>,
}

/// Knows where the tool services live and keeps the registry in sync with
/// what they offer.
pub struct ServiceDirectory {
    client: reqwest::Client,
    services: Vec<ServiceEndpoints>,
    registry: Arc<ToolRegistry>,
    probe_misses: Mutex<HashMap<String, u32>>,
}

impl ServiceDirectory {
    pub fn new(services: Vec<ServiceEndpoints>, registry: Arc<ToolRegistry>) -> Self {
        Self {
            client: reqwest::Client::new(),
            services,
            registry,
            probe_misses: Mutex::new(HashMap::new()),
        }
    }

    pub fn services(&self) -> &[ServiceEndpoints] {
        &self.services
    }

    pub fn service(&self, name: &str) -> Option<&ServiceEndpoints> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Discover tools from every service concurrently and upsert them.
    /// Returns the number of tools registered per service.
    pub async fn discover_all(&self) -> HashMap<String, usize> {
        let futures = self
            .services
            .iter()
            .map(|service| async move { (service.name.clone(), self.discover_service(service).await) });
        let results = futures::future::join_all(futures).await;

        let mut counts = HashMap::new();
        for (name, outcome) in results {
            match outcome {
                Ok(count) => {
                    self.probe_misses.lock().await.remove(&name);
                    counts.insert(name, count);
                }
                Err(err) => {
                    tracing::warn!(service = %name, error = %err, "tool discovery failed");
                    self.strike(&name).await;
                    counts.insert(name, 0);
                }
            }
        }
        counts
    }

    async fn discover_service(&self, service: &ServiceEndpoints) -> Result<usize> {
        let url = format!("{}{}", service.base_url, service.tools_path);
        let response = self
            .client
            .get(&url)
            .timeout(DISCOVERY_TIMEOUT)
            .send()
            .await
            .map_err(|e| OrchestratorError::UpstreamFailure(e.to_string()))?;

        if !response.status().is_success() {
            return Err(OrchestratorError::UpstreamFailure(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| OrchestratorError::UpstreamFailure(e.to_string()))?;

        let entries = body
            .get("tools")
            .and_then(Value::as_array)
            .or_else(|| body.as_array())
            .cloned()
            .unwrap_or_default();

        let mut count = 0;
        for entry in &entries {
            match parse_tool_definition(service, entry) {
                Some(tool) => {
                    self.registry.register(tool).await;
                    count += 1;
                }
                None => {
                    tracing::warn!(
                        service = %service.name,
                        entry = %entry,
                        "skipping tool with unknown category or missing name"
                    );
                }
            }
        }
        tracing::info!(service = %service.name, count, "tool discovery completed");
        Ok(count)
    }

    /// Probe every service's health path and update availability. After two
    /// consecutive misses a service's tools are removed from the registry.
    pub async fn probe_all(&self) {
        let futures = self
            .services
            .iter()
            .map(|service| async move { (service.name.clone(), self.probe_service(service).await) });
        let results = futures::future::join_all(futures).await;

        for (name, healthy) in results {
            self.registry.set_service_availability(&name, healthy).await;
            if healthy {
                self.probe_misses.lock().await.remove(&name);
            } else {
                self.strike(&name).await;
            }
        }
    }

    async fn probe_service(&self, service: &ServiceEndpoints) -> bool {
        let url = format!("{}{}", service.base_url, service.health_path);
        match self.client.get(&url).timeout(PROBE_TIMEOUT).send().await {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                tracing::debug!(service = %service.name, error = %err, "health probe failed");
                false
            }
        }
    }

    async fn strike(&self, service_name: &str) {
        let mut misses = self.probe_misses.lock().await;
        let count = misses.entry(service_name.to_string()).or_insert(0);
        *count += 1;
        if *count >= REMOVAL_STRIKES {
            drop(misses);
            let removed = self.registry.remove_service_tools(service_name).await;
            if removed > 0 {
                tracing::warn!(
                    service = %service_name,
                    removed,
                    "service unreachable twice in a row, tools removed"
                );
            }
        }
    }

    /// Invoke a remote tool at its endpoint. Builtins never come through
    /// here.
    pub async fn invoke(
        &self,
        tool: &ToolDefinition,
        action: &str,
        params: &Value,
        timeout: Duration,
    ) -> Result<Value> {
        let service = self.service(&tool.service_name).ok_or_else(|| {
            OrchestratorError::ToolUnavailable(tool.id.clone())
        })?;
        let url = format!("{}{}", service.base_url, tool.endpoint);

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&serde_json::json!({
                "tool": tool.name,
                "action": action,
                "parameters": params,
            }))
            .send()
            .await
            .map_err(|e| OrchestratorError::UpstreamFailure(e.to_string()))?;

        if !response.status().is_success() {
            return Err(OrchestratorError::UpstreamFailure(format!(
                "tool '{}' returned {}",
                tool.id,
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| OrchestratorError::UpstreamFailure(e.to_string()))
    }

    /// Register this runtime with the gateway. Failure is logged, not fatal.
    pub async fn register_gateway(&self, gateway_url: &str, registration: &GatewayRegistration) {
        let url = format!("{gateway_url}/api/v1/services/register");
        match self
            .client
            .post(&url)
            .timeout(DISCOVERY_TIMEOUT)
            .json(registration)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                tracing::info!(service = %registration.service_name, "registered with gateway");
            }
            Ok(response) => {
                tracing::warn!(status = %response.status(), "gateway registration rejected");
            }
            Err(err) => {
                tracing::warn!(error = %err, "gateway registration failed");
            }
        }
    }

    /// Spawn the discovery and probe loops. The caller owns the handles and
    /// aborts them on shutdown.
    pub fn spawn_loops(
        self: &Arc<Self>,
        discovery_interval: Duration,
        probe_interval: Duration,
    ) -> Vec<JoinHandle<()>> {
        let discovery = {
            let directory = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(discovery_interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    directory.discover_all().await;
                }
            })
        };
        let probe = {
            let directory = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(probe_interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    directory.probe_all().await;
                }
            })
        };
        vec![discovery, probe]
    }
}

/// Parse one discovery entry. Unknown categories are a skip, not an error.
fn parse_tool_definition(service: &ServiceEndpoints, entry: &Value) -> Option<ToolDefinition> {
    let name = entry.get("name")?.as_str()?;
    let category = ToolCategory::from_str(entry.get("category")?.as_str()?).ok()?;

    let mut tool = ToolDefinition::new(&service.name, name, service.tool_type, category)
        .with_health(ToolHealth::Healthy);

    if let Some(display) = entry.get("display_name").and_then(Value::as_str) {
        tool.display_name = display.to_string();
    }
    if let Some(description) = entry.get("description").and_then(Value::as_str) {
        tool.description = description.to_string();
    }
    if let Some(schema) = entry.get("schema") {
        tool.schema = schema.clone();
    }
    if let Some(endpoint) = entry.get("endpoint").and_then(Value::as_str) {
        tool.endpoint = endpoint.to_string();
    }
    if let Some(permission) = entry.get("permission_level").and_then(Value::as_str) {
        tool.permission_level = permission.to_string();
    }
    if let Some(limit) = entry.get("rate_limit").and_then(Value::as_u64) {
        tool.rate_limit = Some(limit as u32);
    }
    if let Some(timeout) = entry.get("timeout").and_then(Value::as_u64) {
        tool.timeout_secs = timeout;
    }
    if let Some(rate) = entry.get("success_rate").and_then(Value::as_f64) {
        tool.success_rate = rate;
    }
    if let Some(ms) = entry.get("avg_response_time").and_then(Value::as_f64) {
        tool.avg_response_time = ms;
    }
    Some(tool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn directory_for(server_url: &str) -> (Arc<ToolRegistry>, ServiceDirectory) {
        let registry = Arc::new(ToolRegistry::new());
        let services = vec![ServiceEndpoints::new(
            "tools-service",
            server_url,
            "/api/v1/tools/list",
            ToolType::External,
        )];
        let directory = ServiceDirectory::new(services, Arc::clone(&registry));
        (registry, directory)
    }

    #[tokio::test]
    async fn test_discovery_registers_known_and_skips_unknown() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/tools/list"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "tools": [
                    {"name": "web_search", "category": "search", "endpoint": "/api/v1/tools/web_search",
                     "description": "Search the web", "success_rate": 0.95, "avg_response_time": 420.0},
                    {"name": "mind_reader", "category": "telepathy"},
                    {"category": "search"}
                ]
            })))
            .mount(&server)
            .await;

        let (registry, directory) = directory_for(&server.uri());
        let counts = directory.discover_all().await;

        assert_eq!(counts["tools-service"], 1);
        let tool = registry.get("tools-service.web_search").await.unwrap();
        assert_eq!(tool.tool_type, ToolType::External);
        assert!((tool.success_rate - 0.95).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_probe_failure_flips_availability() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let (registry, directory) = directory_for(&server.uri());
        registry
            .register(ToolDefinition::new(
                "tools-service",
                "web_search",
                ToolType::External,
                ToolCategory::Search,
            ))
            .await;

        directory.probe_all().await;
        let tool = registry.get("tools-service.web_search").await.unwrap();
        assert!(!tool.is_available);
        assert_eq!(tool.health, ToolHealth::Unhealthy);
    }

    #[tokio::test]
    async fn test_two_failed_probes_remove_service_tools() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let (registry, directory) = directory_for(&server.uri());
        registry
            .register(ToolDefinition::new(
                "tools-service",
                "web_search",
                ToolType::External,
                ToolCategory::Search,
            ))
            .await;

        directory.probe_all().await;
        assert!(registry.contains("tools-service.web_search").await);

        directory.probe_all().await;
        assert!(!registry.contains("tools-service.web_search").await);
    }

    #[tokio::test]
    async fn test_invoke_posts_to_tool_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/tools/web_search"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"results": ["hit"]})),
            )
            .mount(&server)
            .await;

        let (_registry, directory) = directory_for(&server.uri());
        let tool = ToolDefinition::new(
            "tools-service",
            "web_search",
            ToolType::External,
            ToolCategory::Search,
        )
        .with_endpoint("/api/v1/tools/web_search");

        let out = directory
            .invoke(
                &tool,
                "search",
                &serde_json::json!({"query": "rust"}),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(out["results"][0], "hit");
    }

    #[test]
    fn test_standard_services_cover_the_three_upstreams() {
        let services = standard_services("http://mcp", "http://tools", "http://system");
        assert_eq!(services.len(), 3);
        assert_eq!(services[0].tools_path, "/api/v1/mcp/tools/list");
        assert_eq!(services[0].tool_type, ToolType::Mcp);
        assert_eq!(services[2].tool_type, ToolType::System);
    }
}
