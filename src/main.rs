use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use replica::cli::{Cli, Commands};
use replica::config;
use replica::orchestration::types::{HandleId, RunnerHandle};
use replica::orchestration::Orchestrator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries the root runner's replies.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Init { path } => {
            let path = match path.clone().or_else(config::global_config_path) {
                Some(path) => path,
                None => anyhow::bail!("could not determine the config directory; pass --path"),
            };
            if config::ensure_config_exists(&path)? {
                println!("Wrote {}", path.display());
            } else {
                println!("{} already exists; left unchanged", path.display());
            }
        }
        Commands::Check { .. } => {
            let config = config::load_config(&cli)?;
            println!(
                "Configuration OK: max {} children, depth {}, {}s timeout",
                config.runtime.max_global_children,
                config.runtime.max_recursion_depth,
                config.runtime.default_timeout_seconds
            );
            for agent in config.agents.values() {
                let tools: Vec<&str> = agent.allowed_tools.iter().map(String::as_str).collect();
                println!(
                    "  {}{} [{} / {}] tools: {}",
                    agent.name,
                    if agent.is_main { " (main)" } else { "" },
                    agent.runner_type,
                    agent.model_id,
                    if tools.is_empty() { "-".to_string() } else { tools.join(", ") }
                );
            }
        }
        Commands::Run { .. } => {
            let config = config::load_config(&cli)?;
            let workspace = std::env::current_dir()?;
            let orchestrator = Orchestrator::builder(config).workspace(workspace).build().await;
            let root = orchestrator.spawn_root().await?;
            tracing::info!(root = %root, "Replica started");

            let result = chat(&orchestrator).await;
            orchestrator.shutdown().await;
            result?;
        }
    }

    Ok(())
}

/// Line-oriented chat with the root runner until EOF, `/quit` or Ctrl-C.
async fn chat(orchestrator: &Orchestrator) -> anyhow::Result<()> {
    eprintln!("Type a message, /agents to show the runner tree, /quit to exit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        };
        let Some(line) = line else { break };
        let line = line.trim();

        match line {
            "" => continue,
            "/quit" => break,
            "/agents" => print_tree(&orchestrator.snapshot()),
            message => {
                let reply = tokio::select! {
                    reply = orchestrator.send_message(message) => reply,
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("Interrupted");
                        break;
                    }
                };
                match reply {
                    Ok(text) => println!("{text}"),
                    Err(e) => eprintln!("[error] {e}"),
                }
            }
        }
    }
    Ok(())
}

/// Print the live runners depth-first, children indented under their parent.
fn print_tree(handles: &[RunnerHandle]) {
    fn visit(handles: &[RunnerHandle], parent: Option<&HandleId>) {
        for handle in handles.iter().filter(|h| h.parent_id.as_ref() == parent) {
            println!(
                "{}{} {} [{}]",
                "  ".repeat(handle.depth),
                handle.agent.name,
                handle.id,
                handle.state
            );
            visit(handles, Some(&handle.id));
        }
    }
    visit(handles, None);
}
