use super::schema::{AgentConfig, AppConfig, PartialConfig, RuntimeLimits};
use crate::error::ConfigError;
use std::collections::BTreeMap;
use std::sync::Arc;

impl PartialConfig {
    /// Merge self with a lower-priority fallback.
    /// Self's non-None values take precedence.
    /// For agents and tool_servers: REPLACE semantics (if self has Some, use it entirely).
    pub fn with_fallback(self, fallback: PartialConfig) -> PartialConfig {
        PartialConfig {
            agents: self.agents.or(fallback.agents),
            max_global_children: self.max_global_children.or(fallback.max_global_children),
            default_timeout_seconds: self
                .default_timeout_seconds
                .or(fallback.default_timeout_seconds),
            max_recursion_depth: self.max_recursion_depth.or(fallback.max_recursion_depth),
            tool_servers: self.tool_servers.or(fallback.tool_servers),
        }
    }

    /// Convert to AppConfig, filling any remaining gaps with defaults.
    ///
    /// Fails only when two agents share a name; everything else is checked by
    /// [`AppConfig::validate`].
    pub fn finalize(self) -> Result<AppConfig, ConfigError> {
        let defaults = RuntimeLimits::default();

        let mut agents = BTreeMap::new();
        for agent in self.agents.unwrap_or_else(default_agents) {
            let name = agent.name.clone();
            if agents.insert(name.clone(), Arc::new(agent)).is_some() {
                return Err(ConfigError::Invalid(format!(
                    "agent `{name}` is defined more than once"
                )));
            }
        }

        Ok(AppConfig {
            agents,
            runtime: RuntimeLimits {
                max_global_children: self
                    .max_global_children
                    .unwrap_or(defaults.max_global_children),
                default_timeout_seconds: self
                    .default_timeout_seconds
                    .unwrap_or(defaults.default_timeout_seconds),
                max_recursion_depth: self
                    .max_recursion_depth
                    .unwrap_or(defaults.max_recursion_depth),
            },
            tool_servers: self.tool_servers.unwrap_or_default(),
        })
    }
}

/// A single gemini agent marked as main.
fn default_agents() -> Vec<AgentConfig> {
    let mut main = AgentConfig::new("main", "gemini").main().recursible();
    main.api_key_ref = Some("GEMINI_API_KEY".to_string());
    vec![main]
}
