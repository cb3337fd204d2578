use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

/// Name of a tool as it appears in `allowed_tools` and tool invocation requests.
pub type ToolName = String;

/// The TOML file structure for replica.toml.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    pub runtime: Option<RuntimeSection>,
    /// If specified, fully replaces agents from lower-priority layers.
    pub agents: Option<Vec<AgentSection>>,
    pub tool_servers: Option<BTreeMap<String, ToolServerSection>>,
}

#[derive(Debug, Deserialize)]
pub struct RuntimeSection {
    pub max_global_children: Option<usize>,
    pub default_timeout_seconds: Option<u64>,
    pub max_recursion_depth: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct AgentSection {
    pub name: String,
    pub runner: String,
    #[serde(default)]
    pub is_main: bool,
    pub model: Option<String>,
    /// Name of the environment variable holding the provider API key.
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub is_recursible: bool,
    pub max_children: Option<usize>,
    pub instruction: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ToolServerSection {
    #[serde(default)]
    pub tools: Vec<ToolSection>,
}

#[derive(Debug, Deserialize)]
pub struct ToolSection {
    pub name: String,
    pub command: String,
    pub description: Option<String>,
}

/// Per-agent settings, resolved and immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub name: String,
    pub runner_type: String,
    pub is_main: bool,
    pub model_id: String,
    pub api_key_ref: Option<String>,
    pub allowed_tools: BTreeSet<ToolName>,
    pub is_recursible: bool,
    /// Per-parent fan-out cap; `None` defers to the global limit.
    pub max_children: Option<usize>,
    pub instruction: Option<String>,
}

impl AgentConfig {
    /// Minimal agent with no tools, used as a starting point by tests and defaults.
    pub fn new(name: impl Into<String>, runner_type: impl Into<String>) -> Self {
        let runner_type = runner_type.into();
        Self {
            name: name.into(),
            model_id: default_model_for(&runner_type).to_string(),
            runner_type,
            is_main: false,
            api_key_ref: None,
            allowed_tools: BTreeSet::new(),
            is_recursible: false,
            max_children: None,
            instruction: None,
        }
    }

    pub fn main(mut self) -> Self {
        self.is_main = true;
        self
    }

    pub fn recursible(mut self) -> Self {
        self.is_recursible = true;
        self
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_children(mut self, max: usize) -> Self {
        self.max_children = Some(max);
        self
    }
}

/// Process-wide limits. Immutable after load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeLimits {
    pub max_global_children: usize,
    pub default_timeout_seconds: u64,
    pub max_recursion_depth: usize,
}

impl RuntimeLimits {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_seconds)
    }
}

impl Default for RuntimeLimits {
    fn default() -> Self {
        Self {
            max_global_children: 100,
            default_timeout_seconds: 60,
            max_recursion_depth: 3,
        }
    }
}

/// A shell-command-backed tool declared by a tool server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandToolConfig {
    pub name: ToolName,
    pub command: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolServerConfig {
    pub name: String,
    pub tools: Vec<CommandToolConfig>,
}

/// Fully-resolved runtime configuration. All fields have values.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub agents: BTreeMap<String, Arc<AgentConfig>>,
    pub runtime: RuntimeLimits,
    pub tool_servers: BTreeMap<String, ToolServerConfig>,
}

impl AppConfig {
    /// The single agent marked `is_main`. Validation guarantees there is one.
    pub fn main_agent(&self) -> Option<Arc<AgentConfig>> {
        self.agents.values().find(|a| a.is_main).cloned()
    }

    pub fn agent(&self, name: &str) -> Option<Arc<AgentConfig>> {
        self.agents.get(name).cloned()
    }

    /// Every tool declared across all tool servers.
    pub fn declared_tools(&self) -> impl Iterator<Item = &CommandToolConfig> {
        self.tool_servers.values().flat_map(|s| s.tools.iter())
    }
}

/// Partial config used during merge. All fields are Option so that
/// missing fields don't override lower-priority values.
#[derive(Debug, Clone, Default)]
pub struct PartialConfig {
    pub agents: Option<Vec<AgentConfig>>,
    pub max_global_children: Option<usize>,
    pub default_timeout_seconds: Option<u64>,
    pub max_recursion_depth: Option<usize>,
    pub tool_servers: Option<BTreeMap<String, ToolServerConfig>>,
}

impl ConfigFile {
    pub fn to_partial(self) -> PartialConfig {
        let runtime = self.runtime;
        PartialConfig {
            agents: self
                .agents
                .map(|agents| agents.into_iter().map(AgentSection::into_agent).collect()),
            max_global_children: runtime.as_ref().and_then(|r| r.max_global_children),
            default_timeout_seconds: runtime.as_ref().and_then(|r| r.default_timeout_seconds),
            max_recursion_depth: runtime.as_ref().and_then(|r| r.max_recursion_depth),
            tool_servers: self.tool_servers.map(|servers| {
                servers
                    .into_iter()
                    .map(|(name, section)| {
                        let tools = section
                            .tools
                            .into_iter()
                            .map(|t| CommandToolConfig {
                                description: t
                                    .description
                                    .unwrap_or_else(|| format!("Runs `{}`", t.command)),
                                name: t.name,
                                command: t.command,
                            })
                            .collect();
                        (name.clone(), ToolServerConfig { name, tools })
                    })
                    .collect()
            }),
        }
    }
}

impl AgentSection {
    fn into_agent(self) -> AgentConfig {
        AgentConfig {
            model_id: self
                .model
                .unwrap_or_else(|| default_model_for(&self.runner).to_string()),
            name: self.name,
            runner_type: self.runner,
            is_main: self.is_main,
            api_key_ref: self.api_key_env,
            allowed_tools: self.tools.into_iter().collect(),
            is_recursible: self.is_recursible,
            max_children: self.max_children,
            instruction: self.instruction,
        }
    }
}

/// Model used when an agent entry does not name one.
pub fn default_model_for(runner_type: &str) -> &'static str {
    match runner_type {
        "gemini" => "gemini-2.0-flash",
        "openai" => "gpt-4o-mini",
        "anthropic" => "claude-3-5-haiku-latest",
        "ollama" => "llama3.2",
        _ => "default",
    }
}
