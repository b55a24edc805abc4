//! Agent registry: transport configuration and in-process handlers.
//!
//! Agents are black boxes behind a uniform transport contract. Each declares
//! input/output schema ids and exactly how to reach it: an endpoint URL, a
//! command line, a container image, or an in-process handler id.

use crate::errors::TransportError;
use crate::exec::context::ExecutionContext;
use crate::exec::transport::TransportKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Registered configuration for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent_id: String,
    pub input_schema: String,
    pub output_schema: String,
    /// Preferred transport; inferred from the config fields when absent.
    #[serde(default)]
    pub transport: Option<TransportKind>,
    /// Webhook endpoint URL.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Subprocess command and arguments.
    #[serde(default)]
    pub command: Option<Vec<String>>,
    /// Container image.
    #[serde(default)]
    pub image: Option<String>,
    /// In-process handler id.
    #[serde(default)]
    pub handler_id: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
}

impl AgentConfig {
    pub fn new(agent_id: &str, input_schema: &str, output_schema: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            input_schema: input_schema.to_string(),
            output_schema: output_schema.to_string(),
            transport: None,
            endpoint: None,
            command: None,
            image: None,
            handler_id: None,
            timeout_ms: None,
            memory_mb: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = Some(endpoint.to_string());
        self
    }

    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = Some(command);
        self
    }

    pub fn with_image(mut self, image: &str) -> Self {
        self.image = Some(image.to_string());
        self
    }

    pub fn with_handler(mut self, handler_id: &str) -> Self {
        self.handler_id = Some(handler_id.to_string());
        self
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// An agent hosted inside the coordinator process.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    /// Handle one invocation. The returned value is the agent's output
    /// object; an `Err` reads as an agent-internal failure.
    async fn handle(&self, ctx: &ExecutionContext) -> anyhow::Result<serde_json::Value>;
}

/// Registry of agent configs and in-process handlers.
#[derive(Default)]
pub struct AgentRegistry {
    configs: RwLock<HashMap<String, AgentConfig>>,
    handlers: RwLock<HashMap<String, Arc<dyn AgentHandler>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, config: AgentConfig) {
        let mut configs = match self.configs.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        configs.insert(config.agent_id.clone(), config);
    }

    pub fn register_handler(&self, handler_id: &str, handler: Arc<dyn AgentHandler>) {
        let mut handlers = match self.handlers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.insert(handler_id.to_string(), handler);
    }

    pub fn config(&self, agent_id: &str) -> Result<AgentConfig, TransportError> {
        let configs = match self.configs.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        configs
            .get(agent_id)
            .cloned()
            .ok_or_else(|| TransportError::UnknownAgent(agent_id.to_string()))
    }

    pub fn handler(&self, handler_id: &str) -> Result<Arc<dyn AgentHandler>, TransportError> {
        let handlers = match self.handlers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers
            .get(handler_id)
            .cloned()
            .ok_or_else(|| TransportError::UnknownHandler(handler_id.to_string()))
    }

    pub fn agent_ids(&self) -> Vec<String> {
        let configs = match self.configs.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut ids: Vec<String> = configs.keys().cloned().collect();
        ids.sort();
        ids
    }
}
