//! Built-in tools through which a runner manages its own children.
//!
//! The root runner holds all of them implicitly. A child holds one only when
//! its agent config lists it in `allowed_tools`. Every tool acts on behalf of
//! `ctx.caller` and can only reach that caller's descendants.

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Tool, ToolContext, ToolRegistry, ToolResult};
use crate::orchestration::types::{HandleId, RunnerHandle, RunnerState, TransitionOutcome};

pub const SPAWN_AGENT: &str = "spawn_agent";
pub const ASK_AGENT: &str = "ask_agent";
pub const AGENT_RESULT: &str = "agent_result";
pub const KILL_AGENT: &str = "kill_agent";
pub const LIST_AGENTS: &str = "list_agents";

/// Names reserved for delegation; no configured tool may reuse them.
pub const DELEGATION_TOOLS: [&str; 5] = [SPAWN_AGENT, ASK_AGENT, AGENT_RESULT, KILL_AGENT, LIST_AGENTS];

pub async fn register_delegation_tools(registry: &ToolRegistry) {
    registry.register(SpawnAgentTool).await;
    registry.register(AskAgentTool).await;
    registry.register(AgentResultTool).await;
    registry.register(KillAgentTool).await;
    registry.register(ListAgentsTool).await;
}

fn parse<T: for<'de> Deserialize<'de>>(tool: &str, args: serde_json::Value) -> anyhow::Result<T> {
    serde_json::from_value(args).with_context(|| format!("invalid arguments for {tool}"))
}

/// Row returned by `list_agents`.
#[derive(Debug, Serialize)]
struct AgentSummary {
    id: HandleId,
    agent: String,
    state: RunnerState,
    depth: usize,
}

impl From<RunnerHandle> for AgentSummary {
    fn from(handle: RunnerHandle) -> Self {
        Self {
            agent: handle.agent.name.clone(),
            id: handle.id,
            state: handle.state,
            depth: handle.depth,
        }
    }
}

pub struct SpawnAgentTool;

#[derive(Deserialize)]
struct SpawnArgs {
    agent: String,
    instruction: String,
}

#[async_trait]
impl Tool for SpawnAgentTool {
    fn name(&self) -> &str {
        SPAWN_AGENT
    }

    fn description(&self) -> &str {
        "Start a child agent from a configured agent name. The child works on the \
         instruction in the background; read its answer later with agent_result."
    }

    fn schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "agent": { "type": "string", "description": "Configured agent name" },
                "instruction": { "type": "string", "description": "Task for the child" }
            },
            "required": ["agent", "instruction"]
        })
    }

    async fn execute(&self, ctx: ToolContext, args: serde_json::Value) -> anyhow::Result<ToolResult> {
        let args: SpawnArgs = parse(SPAWN_AGENT, args)?;
        let orchestrator = ctx.orchestrator()?;
        let id = orchestrator
            .spawn_child(&ctx.caller, &args.agent, args.instruction)
            .await?;
        ToolResult::json(&serde_json::json!({ "id": id, "agent": args.agent }))
    }
}

pub struct AskAgentTool;

#[derive(Deserialize)]
struct AskArgs {
    id: String,
    message: String,
}

#[async_trait]
impl Tool for AskAgentTool {
    fn name(&self) -> &str {
        ASK_AGENT
    }

    fn description(&self) -> &str {
        "Send a follow-up message to one of your child agents and wait for its reply."
    }

    fn schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "id": { "type": "string" },
                "message": { "type": "string" }
            },
            "required": ["id", "message"]
        })
    }

    async fn execute(&self, ctx: ToolContext, args: serde_json::Value) -> anyhow::Result<ToolResult> {
        let args: AskArgs = parse(ASK_AGENT, args)?;
        let reply = ctx
            .orchestrator()?
            .ask_child(&ctx.caller, &HandleId::from(args.id), &args.message)
            .await?;
        Ok(ToolResult::text(reply))
    }
}

pub struct AgentResultTool;

#[derive(Deserialize)]
struct IdArgs {
    id: String,
}

#[async_trait]
impl Tool for AgentResultTool {
    fn name(&self) -> &str {
        AGENT_RESULT
    }

    fn description(&self) -> &str {
        "Read the outcome of a child agent's task. Reports the child's state while it is still working."
    }

    fn schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "id": { "type": "string" } },
            "required": ["id"]
        })
    }

    async fn execute(&self, ctx: ToolContext, args: serde_json::Value) -> anyhow::Result<ToolResult> {
        let args: IdArgs = parse(AGENT_RESULT, args)?;
        let id = HandleId::from(args.id);
        let orchestrator = ctx.orchestrator()?;
        match orchestrator.child_outcome(&ctx.caller, &id)? {
            Some(outcome) => ToolResult::json(&outcome),
            None => {
                let state = orchestrator
                    .manager()
                    .get(&id)
                    .map(|h| h.state)
                    .context("child disappeared")?;
                ToolResult::json(&serde_json::json!({ "agent_id": id, "state": state }))
            }
        }
    }
}

pub struct KillAgentTool;

#[async_trait]
impl Tool for KillAgentTool {
    fn name(&self) -> &str {
        KILL_AGENT
    }

    fn description(&self) -> &str {
        "Terminate a child agent and everything it spawned."
    }

    fn schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "id": { "type": "string" } },
            "required": ["id"]
        })
    }

    async fn execute(&self, ctx: ToolContext, args: serde_json::Value) -> anyhow::Result<ToolResult> {
        let args: IdArgs = parse(KILL_AGENT, args)?;
        let id = HandleId::from(args.id);
        let outcome = ctx.orchestrator()?.kill_child(&ctx.caller, &id).await?;
        Ok(ToolResult::text(match outcome {
            TransitionOutcome::Applied => format!("terminated {id}"),
            TransitionOutcome::Duplicate => format!("{id} was already terminated"),
        }))
    }
}

pub struct ListAgentsTool;

#[async_trait]
impl Tool for ListAgentsTool {
    fn name(&self) -> &str {
        LIST_AGENTS
    }

    fn description(&self) -> &str {
        "List your live child agents with their states."
    }

    fn schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, ctx: ToolContext, _args: serde_json::Value) -> anyhow::Result<ToolResult> {
        let children: Vec<AgentSummary> = ctx
            .orchestrator()?
            .list_children(&ctx.caller)
            .into_iter()
            .map(AgentSummary::from)
            .collect();
        ToolResult::json(&children)
    }
}
