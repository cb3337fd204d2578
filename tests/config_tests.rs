use std::path::Path;

use clap::Parser;
use replica::cli::Cli;
use replica::config::{ensure_config_exists, load_config, load_config_file, load_layered};
use replica::error::ConfigError;
use tempfile::TempDir;

fn write_config(dir: &TempDir, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join("replica.toml");
    std::fs::write(&path, contents).unwrap();
    path
}

const TEAM: &str = r#"
[runtime]
max_global_children = 8
default_timeout_seconds = 30
max_recursion_depth = 2

[[agents]]
name = "lead"
runner = "openai"
is_main = true
api_key_env = "OPENAI_API_KEY"
is_recursible = true
tools = ["grep_repo"]

[[agents]]
name = "reader"
runner = "ollama"
model = "qwen2.5"
tools = ["grep_repo", "spawn_agent"]
max_children = 1
instruction = "Read code and report findings."

[tool_servers.local]
tools = [
    { name = "grep_repo", command = "xargs -0 grep -rn", description = "Search the repository" },
]
"#;

// ============================================================
// Loading
// ============================================================

#[test]
fn test_full_file_resolves() {
    let dir = tempfile::tempdir().unwrap();
    let config = load_config_file(&write_config(&dir, TEAM)).unwrap();

    assert_eq!(config.runtime.max_global_children, 8);
    assert_eq!(config.runtime.default_timeout_seconds, 30);
    assert_eq!(config.main_agent().unwrap().name, "lead");

    let lead = config.agent("lead").unwrap();
    assert_eq!(lead.model_id, "gpt-4o-mini");
    assert_eq!(lead.api_key_ref.as_deref(), Some("OPENAI_API_KEY"));

    let reader = config.agent("reader").unwrap();
    assert_eq!(reader.model_id, "qwen2.5");
    assert_eq!(reader.max_children, Some(1));
    assert!(reader.allowed_tools.contains("spawn_agent"));
    assert!(!reader.is_recursible);

    let tools: Vec<&str> = config.declared_tools().map(|t| t.name.as_str()).collect();
    assert_eq!(tools, vec!["grep_repo"]);
}

#[test]
fn test_missing_runtime_section_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        r#"
[[agents]]
name = "main"
runner = "echo"
is_main = true
"#,
    );
    let config = load_config_file(&path).unwrap();
    assert_eq!(config.runtime.max_global_children, 100);
    assert_eq!(config.runtime.default_timeout_seconds, 60);
    assert_eq!(config.runtime.max_recursion_depth, 3);
}

#[test]
fn test_cli_overrides_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, TEAM);
    let cli = Cli::parse_from([
        "replica",
        "run",
        "--config",
        path.to_str().unwrap(),
        "--max-depth",
        "5",
        "--timeout",
        "9",
    ]);

    let config = load_config(&cli).unwrap();
    assert_eq!(config.runtime.max_recursion_depth, 5);
    assert_eq!(config.runtime.default_timeout_seconds, 9);
    assert_eq!(config.runtime.max_global_children, 8);
}

const GLOBAL: &str = r#"
[runtime]
max_global_children = 7
default_timeout_seconds = 11

[[agents]]
name = "home"
runner = "echo"
is_main = true
"#;

#[test]
fn test_workspace_file_layers_over_global() {
    let global_dir = tempfile::tempdir().unwrap();
    let global = write_config(&global_dir, GLOBAL);
    let workspace = tempfile::tempdir().unwrap();
    write_config(&workspace, "[runtime]\nmax_global_children = 3\n");

    let cli = Cli::parse_from(["replica", "check"]);
    let config = load_layered(&cli, workspace.path(), Some(&global)).unwrap();

    assert_eq!(config.runtime.max_global_children, 3);
    assert_eq!(config.runtime.default_timeout_seconds, 11);
    assert_eq!(config.runtime.max_recursion_depth, 3);
    assert_eq!(config.main_agent().unwrap().name, "home");
}

#[test]
fn test_explicit_file_replaces_workspace_but_not_global() {
    let global_dir = tempfile::tempdir().unwrap();
    let global = write_config(&global_dir, GLOBAL);
    let workspace = tempfile::tempdir().unwrap();
    write_config(&workspace, "[runtime]\nmax_recursion_depth = 9\n");
    let explicit_dir = tempfile::tempdir().unwrap();
    let explicit = write_config(&explicit_dir, "[runtime]\nmax_global_children = 2\n");

    let cli = Cli::parse_from(["replica", "run", "--config", explicit.to_str().unwrap(), "--timeout", "4"]);
    let config = load_layered(&cli, workspace.path(), Some(&global)).unwrap();

    assert_eq!(config.runtime.max_global_children, 2);
    assert_eq!(config.runtime.max_recursion_depth, 3);
    assert_eq!(config.runtime.default_timeout_seconds, 4);
    assert_eq!(config.main_agent().unwrap().name, "home");
}

#[test]
fn test_workspace_agents_replace_global_agents() {
    let global_dir = tempfile::tempdir().unwrap();
    let global = write_config(&global_dir, GLOBAL);
    let workspace = tempfile::tempdir().unwrap();
    write_config(&workspace, TEAM);

    let cli = Cli::parse_from(["replica", "check"]);
    let config = load_layered(&cli, workspace.path(), Some(&global)).unwrap();

    assert!(config.agent("home").is_none());
    assert_eq!(config.main_agent().unwrap().name, "lead");
    assert_eq!(config.runtime.default_timeout_seconds, 30);
}

#[test]
fn test_broken_global_file_is_skipped() {
    let global_dir = tempfile::tempdir().unwrap();
    let global = write_config(&global_dir, "[[agents]\nname = ");
    let workspace = tempfile::tempdir().unwrap();

    let cli = Cli::parse_from(["replica", "check"]);
    let config = load_layered(&cli, workspace.path(), Some(&global)).unwrap();
    assert_eq!(config.main_agent().unwrap().name, "main");
    assert_eq!(config.runtime.max_global_children, 100);

    let config = load_layered(&cli, workspace.path(), None).unwrap();
    assert_eq!(config.main_agent().unwrap().runner_type, "gemini");
}

// ============================================================
// Errors
// ============================================================

#[test]
fn test_explicit_missing_file_is_an_error() {
    let cli = Cli::parse_from(["replica", "check", "--config", "/nonexistent/replica.toml"]);
    assert!(matches!(load_config(&cli), Err(ConfigError::IoError(_))));
}

#[test]
fn test_malformed_toml_names_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, "[[agents]\nname = ");
    match load_config_file(&path) {
        Err(ConfigError::ParseError { path: reported, .. }) => assert_eq!(reported, path),
        other => panic!("expected ParseError, got {other:?}"),
    }
}

#[test]
fn test_dangling_tool_reference_is_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        r#"
[[agents]]
name = "main"
runner = "echo"
is_main = true
tools = ["web_search"]
"#,
    );
    let err = load_config_file(&path).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("web_search")));
}

#[test]
fn test_duplicate_agent_names_are_invalid() {
    let main_first = r#"
[[agents]]
name = "main"
runner = "echo"
is_main = true

[[agents]]
name = "main"
runner = "gemini"
"#;
    let main_last = r#"
[[agents]]
name = "main"
runner = "gemini"

[[agents]]
name = "main"
runner = "echo"
is_main = true
"#;
    for contents in [main_first, main_last] {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config_file(&write_config(&dir, contents)).unwrap_err();
        assert!(
            matches!(&err, ConfigError::Invalid(msg) if msg.contains("`main` is defined more than once")),
            "{err:?}"
        );
    }
}

#[test]
fn test_tool_may_not_shadow_delegation() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        r#"
[[agents]]
name = "main"
runner = "echo"
is_main = true

[tool_servers.local]
tools = [{ name = "kill_agent", command = "true" }]
"#,
    );
    assert!(matches!(load_config_file(&path), Err(ConfigError::Invalid(_))));
}

// ============================================================
// init
// ============================================================

#[test]
fn test_init_writes_loadable_default() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cfg").join("replica.toml");
    assert!(ensure_config_exists(&path).unwrap());
    assert!(Path::new(&path).exists());

    let config = load_config_file(&path).unwrap();
    let main = config.main_agent().unwrap();
    assert_eq!(main.runner_type, "gemini");
    assert_eq!(main.api_key_ref.as_deref(), Some("GEMINI_API_KEY"));
}
