use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use super::schema::AppConfig;
use crate::error::ConfigError;
use crate::tools::delegation::DELEGATION_TOOLS;

static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.-]+$").expect("static pattern compiles"));

impl AppConfig {
    /// Check the structural rules the core relies on: exactly one main agent,
    /// well-formed names, and no dangling tool references.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agents.is_empty() {
            return Err(ConfigError::Invalid("no agents configured".into()));
        }

        let mains: Vec<&str> = self
            .agents
            .values()
            .filter(|a| a.is_main)
            .map(|a| a.name.as_str())
            .collect();
        match mains.len() {
            1 => {}
            0 => {
                return Err(ConfigError::Invalid(
                    "no main agent configured; mark exactly one agent with is_main = true".into(),
                ));
            }
            _ => {
                return Err(ConfigError::Invalid(format!(
                    "multiple main agents configured: {}",
                    mains.join(", ")
                )));
            }
        }

        if self.runtime.default_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "runtime.default_timeout_seconds must be greater than zero".into(),
            ));
        }

        let mut declared: BTreeSet<&str> = BTreeSet::new();
        for tool in self.declared_tools() {
            check_name("tool", &tool.name)?;
            if DELEGATION_TOOLS.contains(&tool.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "tool `{}` shadows a built-in delegation tool",
                    tool.name
                )));
            }
            if !declared.insert(tool.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "tool `{}` is declared by more than one tool server",
                    tool.name
                )));
            }
        }

        for (key, agent) in &self.agents {
            check_name("agent", key)?;
            for tool in &agent.allowed_tools {
                let known =
                    declared.contains(tool.as_str()) || DELEGATION_TOOLS.contains(&tool.as_str());
                if !known {
                    return Err(ConfigError::Invalid(format!(
                        "agent `{key}` references undeclared tool `{tool}`"
                    )));
                }
            }
        }

        Ok(())
    }
}

fn check_name(kind: &str, name: &str) -> Result<(), ConfigError> {
    if NAME_PATTERN.is_match(name) {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "{kind} name `{name}` may only contain letters, digits, `_`, `.` and `-`"
        )))
    }
}
