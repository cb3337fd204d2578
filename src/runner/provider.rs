//! LLM provider clients.
//!
//! A provider turns an [`AgentConfig`] into a live [`ProviderSession`]; the
//! session is the only thing a runner talks to. Runner types are plain strings
//! looked up in a [`ProviderSet`], so adding a provider never touches the core.
//!
//! - `gemini`, `openai`, `anthropic`, `ollama`: served by the `genai`
//!   multi-provider client, with the API key read from the environment variable
//!   named by `api_key_ref`.
//! - `echo`: offline provider that returns the prompt, for development.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use genai::chat::{
    ChatMessage, ChatOptions, ChatRequest, ChatStreamEvent, Tool as GenaiTool, ToolCall,
    ToolResponse,
};
use genai::resolver::{AuthData, AuthResolver};
use genai::{Client, ModelIden};

use crate::config::AgentConfig;
use crate::error::ProviderError;
use crate::orchestration::cleanup::Releasable;

/// A tool as advertised to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub schema: serde_json::Value,
}

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestedCall {
    pub call_id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One entry of a runner's conversation.
#[derive(Debug, Clone, PartialEq)]
pub enum Turn {
    User(String),
    Assistant(String),
    ToolCalls(Vec<RequestedCall>),
    ToolResult { call_id: String, content: String },
}

/// What the model said back. An empty `calls` means `text` is the final answer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reply {
    pub text: Option<String>,
    pub calls: Vec<RequestedCall>,
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            calls: Vec::new(),
        }
    }
}

/// Factory for sessions of one runner type.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// The runner type this provider serves, as written in config.
    fn runner_type(&self) -> &str;

    /// Acquire a session for `agent`. This is the only point where external
    /// resources are taken.
    async fn connect(&self, agent: &AgentConfig) -> Result<Arc<dyn ProviderSession>, ProviderError>;
}

/// A live channel to a model. Sessions are stateless between calls; the
/// runner owns the transcript.
#[async_trait]
pub trait ProviderSession: Send + Sync {
    /// Run one model turn over `transcript`, offering `tools`.
    async fn complete(
        &self,
        system: Option<&str>,
        transcript: &[Turn],
        tools: &[ToolSpec],
    ) -> Result<Reply, ProviderError>;

    /// Give back whatever the session holds. Called once by cleanup.
    async fn close(&self) {}
}

/// Registered providers, keyed by runner type.
#[derive(Clone, Default)]
pub struct ProviderSet {
    providers: BTreeMap<String, Arc<dyn LlmProvider>>,
}

impl ProviderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The genai-backed providers plus `echo`.
    pub fn with_defaults() -> Self {
        let mut set = Self::new();
        for runner_type in GenaiProvider::RUNNER_TYPES {
            set.register(Arc::new(GenaiProvider::new(runner_type)));
        }
        set.register(Arc::new(EchoProvider));
        set
    }

    pub fn register(&mut self, provider: Arc<dyn LlmProvider>) {
        self.providers
            .insert(provider.runner_type().to_string(), provider);
    }

    pub fn get(&self, runner_type: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers.get(runner_type).cloned()
    }

    pub fn runner_types(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

/// Provider backed by the `genai` client. The runner type doubles as the genai
/// adapter namespace, so `gemini` + `gemini-2.0-flash` resolves to
/// `gemini::gemini-2.0-flash`.
pub struct GenaiProvider {
    runner_type: String,
}

impl GenaiProvider {
    pub const RUNNER_TYPES: [&'static str; 4] = ["gemini", "openai", "anthropic", "ollama"];

    pub fn new(runner_type: impl Into<String>) -> Self {
        Self {
            runner_type: runner_type.into(),
        }
    }
}

#[async_trait]
impl LlmProvider for GenaiProvider {
    fn runner_type(&self) -> &str {
        &self.runner_type
    }

    async fn connect(&self, agent: &AgentConfig) -> Result<Arc<dyn ProviderSession>, ProviderError> {
        let client = match &agent.api_key_ref {
            Some(var) => {
                let key = std::env::var(var)
                    .map_err(|_| ProviderError::MissingApiKey(var.clone()))?;
                let auth = AuthResolver::from_resolver_fn(
                    move |_model: ModelIden| -> Result<Option<AuthData>, genai::resolver::Error> {
                        Ok(Some(AuthData::from_single(key.clone())))
                    },
                );
                Client::builder().with_auth_resolver(auth).build()
            }
            None => Client::default(),
        };

        tracing::debug!(
            runner = %self.runner_type,
            model = %agent.model_id,
            "Opened genai session"
        );
        Ok(Arc::new(GenaiSession {
            client,
            model: format!("{}::{}", self.runner_type, agent.model_id),
        }))
    }
}

struct GenaiSession {
    client: Client,
    model: String,
}

#[async_trait]
impl ProviderSession for GenaiSession {
    async fn complete(
        &self,
        system: Option<&str>,
        transcript: &[Turn],
        tools: &[ToolSpec],
    ) -> Result<Reply, ProviderError> {
        let mut chat_req = match system {
            Some(system) => ChatRequest::from_system(system),
            None => ChatRequest::default(),
        };
        if !tools.is_empty() {
            chat_req = chat_req.with_tools(
                tools
                    .iter()
                    .map(|t| {
                        GenaiTool::new(t.name.clone())
                            .with_description(t.description.clone())
                            .with_schema(t.schema.clone())
                    })
                    .collect::<Vec<_>>(),
            );
        }
        for turn in transcript {
            chat_req = chat_req.append_message(to_chat_message(turn));
        }

        let chat_options = ChatOptions::default()
            .with_capture_content(true)
            .with_capture_tool_calls(true);

        let stream_res = self
            .client
            .exec_chat_stream(&self.model, chat_req, Some(&chat_options))
            .await
            .map_err(|e| ProviderError::Request(e.to_string()))?;

        let mut stream = stream_res.stream;
        let mut reply = Reply::default();
        while let Some(event) = stream.next().await {
            match event {
                Ok(ChatStreamEvent::End(end)) => {
                    if let Some(text) = end.captured_first_text() {
                        reply.text = Some(text.to_string());
                    }
                    if let Some(calls) = end.captured_tool_calls() {
                        reply.calls = calls
                            .into_iter()
                            .map(|call| RequestedCall {
                                call_id: call.call_id.clone(),
                                name: call.fn_name.clone(),
                                arguments: call.fn_arguments.clone(),
                            })
                            .collect();
                    }
                }
                // Chunks are reassembled by the captured End event.
                Ok(_) => {}
                Err(e) => return Err(ProviderError::Request(e.to_string())),
            }
        }

        if reply.text.is_none() && reply.calls.is_empty() {
            return Err(ProviderError::EmptyResponse);
        }
        Ok(reply)
    }
}

fn to_chat_message(turn: &Turn) -> ChatMessage {
    match turn {
        Turn::User(text) => ChatMessage::user(text.clone()),
        Turn::Assistant(text) => ChatMessage::assistant(text.clone()),
        Turn::ToolCalls(calls) => ChatMessage::from(
            calls
                .iter()
                .map(|call| ToolCall {
                    call_id: call.call_id.clone(),
                    fn_name: call.name.clone(),
                    fn_arguments: call.arguments.clone(),
                    thought_signatures: None,
                })
                .collect::<Vec<_>>(),
        ),
        Turn::ToolResult { call_id, content } => {
            ToolResponse::new(call_id.clone(), content.clone()).into()
        }
    }
}

/// Offline provider: answers every turn with the latest user message.
pub struct EchoProvider;

#[async_trait]
impl LlmProvider for EchoProvider {
    fn runner_type(&self) -> &str {
        "echo"
    }

    async fn connect(&self, _agent: &AgentConfig) -> Result<Arc<dyn ProviderSession>, ProviderError> {
        Ok(Arc::new(EchoSession))
    }
}

struct EchoSession;

#[async_trait]
impl ProviderSession for EchoSession {
    async fn complete(
        &self,
        _system: Option<&str>,
        transcript: &[Turn],
        _tools: &[ToolSpec],
    ) -> Result<Reply, ProviderError> {
        transcript
            .iter()
            .rev()
            .find_map(|turn| match turn {
                Turn::User(text) => Some(Reply::text(text.clone())),
                _ => None,
            })
            .ok_or(ProviderError::EmptyResponse)
    }
}

/// Closes a provider session when its runner is cleaned up.
pub struct SessionResource {
    label: String,
    session: Arc<dyn ProviderSession>,
}

impl SessionResource {
    pub fn new(label: impl Into<String>, session: Arc<dyn ProviderSession>) -> Self {
        Self {
            label: label.into(),
            session,
        }
    }
}

#[async_trait]
impl Releasable for SessionResource {
    fn describe(&self) -> String {
        format!("session:{}", self.label)
    }

    async fn release(&self) {
        self.session.close().await;
    }
}
