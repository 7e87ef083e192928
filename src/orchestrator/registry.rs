//! External interfaces the orchestration core consumes but does not own
//! (`spec.md` §1 "Out of scope"): the model/provider registry, the tool
//! registry, and the LLM client / tool capability they hand back.
//!
//! Concrete implementations live outside this crate. The in-memory
//! implementations here exist for tests and local development, the same
//! role the teacher's `MockClient` plays in `tests/orchestration_tests.rs`.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;

/// A single turn with an LLM: role plus content. Deliberately narrower than
/// the teacher's `client_wrapper::Message` (no native tool-call plumbing) —
/// the Agent Step builds its own text-based tool-call protocol on top, the
/// way `Agent::send` layers a JSON tool-call convention over the raw chat API.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// Why an [`LlmClient::complete`] call failed, distinguishing the transient
/// failures C4 retries from the permanent ones it does not (`spec.md` §4.4).
#[derive(Debug, Clone)]
pub enum LlmCallError {
    /// Network error, 5xx, or rate-limit (429) — retried with backoff.
    Transient(String),
    /// Auth failure, non-429 4xx, or a malformed request — fails immediately.
    Permanent(String),
}

impl std::fmt::Display for LlmCallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmCallError::Transient(msg) => write!(f, "transient LLM failure: {}", msg),
            LlmCallError::Permanent(msg) => write!(f, "permanent LLM failure: {}", msg),
        }
    }
}

impl Error for LlmCallError {}

/// A callable LLM obtained from the [`ModelRegistry`] for a given `model_ref`.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Run one completion call with the given temperature and max token budget.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, LlmCallError>;
}

/// Read-only lookup from `(provider_tag, model_id)` to a callable [`LlmClient`].
/// Credential storage and rotation live entirely outside this boundary.
#[async_trait]
pub trait ModelRegistry: Send + Sync {
    async fn resolve(&self, provider_tag: &str, model_id: &str) -> Option<Arc<dyn LlmClient>>;
}

/// A tool capability: name in, JSON arguments in, text result out.
#[async_trait]
pub trait Tool: Send + Sync {
    async fn invoke(&self, arguments: Value) -> Result<String, Box<dyn Error + Send + Sync>>;
}

/// Name → [`Tool`] lookup, external to the core.
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    async fn lookup(&self, name: &str) -> Option<Arc<dyn Tool>>;
}

/// In-memory [`ModelRegistry`] backed by a static map, suitable for tests
/// and for embedding applications that configure models at startup.
#[derive(Default)]
pub struct InMemoryModelRegistry {
    clients: HashMap<(String, String), Arc<dyn LlmClient>>,
}

impl InMemoryModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        mut self,
        provider_tag: impl Into<String>,
        model_id: impl Into<String>,
        client: Arc<dyn LlmClient>,
    ) -> Self {
        self.clients
            .insert((provider_tag.into(), model_id.into()), client);
        self
    }
}

#[async_trait]
impl ModelRegistry for InMemoryModelRegistry {
    async fn resolve(&self, provider_tag: &str, model_id: &str) -> Option<Arc<dyn LlmClient>> {
        self.clients
            .get(&(provider_tag.to_string(), model_id.to_string()))
            .cloned()
    }
}

/// In-memory [`ToolRegistry`] backed by a static map.
#[derive(Default)]
pub struct InMemoryToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl InMemoryToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, name: impl Into<String>, tool: Arc<dyn Tool>) -> Self {
        self.tools.insert(name.into(), tool);
        self
    }
}

#[async_trait]
impl ToolRegistry for InMemoryToolRegistry {
    async fn lookup(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }
}
