//! Tools backed by shell commands declared under `[tool_servers]`.
//!
//! The tool's JSON arguments are written to the command's stdin. Exit status
//! zero means success and stdout becomes the result; anything else is a tool
//! failure carrying stderr.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;

use super::{Tool, ToolContext, ToolRegistry, ToolResult};
use crate::config::{AppConfig, CommandToolConfig};
use crate::exec::execute_with_input;

pub struct CommandTool {
    config: CommandToolConfig,
    cwd: PathBuf,
    timeout: Duration,
}

impl CommandTool {
    pub fn new(config: CommandToolConfig, cwd: PathBuf, timeout: Duration) -> Self {
        Self {
            config,
            cwd,
            timeout,
        }
    }
}

#[async_trait]
impl Tool for CommandTool {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn description(&self) -> &str {
        &self.config.description
    }

    fn schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "description": "Arbitrary JSON object, passed to the command on stdin"
        })
    }

    async fn execute(
        &self,
        ctx: ToolContext,
        args: serde_json::Value,
    ) -> Result<ToolResult, anyhow::Error> {
        let input = serde_json::to_vec(&args)?;
        tracing::debug!(
            tool = %self.config.name,
            caller = %ctx.caller,
            command = %self.config.command,
            "Running command tool"
        );

        let result = execute_with_input(&self.config.command, &self.cwd, Some(&input), self.timeout)
            .await
            .with_context(|| format!("running `{}`", self.config.command))?;

        if result.timed_out {
            bail!(
                "`{}` timed out after {}s",
                self.config.command,
                self.timeout.as_secs()
            );
        }
        match result.exit_code {
            Some(0) => Ok(ToolResult::text(result.stdout).with_metadata("exit_code", 0)),
            code => bail!(
                "`{}` exited with {}: {}",
                self.config.command,
                code.map_or_else(|| "a signal".to_string(), |c| format!("code {c}")),
                result.stderr.trim()
            ),
        }
    }
}

/// Register every tool declared by the configured tool servers.
pub async fn register_command_tools(registry: &ToolRegistry, config: &AppConfig, cwd: PathBuf) {
    let timeout = config.runtime.default_timeout();
    for tool in config.declared_tools() {
        tracing::debug!(tool = %tool.name, "Registering command tool");
        registry
            .register(CommandTool::new(tool.clone(), cwd.clone(), timeout))
            .await;
    }
}
