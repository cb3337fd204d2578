pub mod merge;
pub mod schema;
pub mod validate;

pub use schema::*;

use crate::cli::{Cli, Commands};
use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Contents written by `replica init` when no config file exists yet.
pub const DEFAULT_CONFIG_TOML: &str = r#"[runtime]
max_global_children = 100
default_timeout_seconds = 60
max_recursion_depth = 3

[[agents]]
name = "main"
runner = "gemini"
is_main = true
model = "gemini-2.0-flash"
api_key_env = "GEMINI_API_KEY"
is_recursible = true
tools = []

[tool_servers]
"#;

/// File name looked up in the workspace and the global config directory.
pub const CONFIG_FILE_NAME: &str = "replica.toml";

/// Load configuration by merging global, file, and CLI sources, then validate.
/// Precedence: CLI > config file > global config > defaults.
///
/// The config file is `--config` when given (must exist and parse), otherwise
/// `replica.toml` in the current directory.
pub fn load_config(cli: &Cli) -> Result<AppConfig, ConfigError> {
    load_layered(cli, Path::new("."), global_config_path().as_deref())
}

/// [`load_config`] with the workspace directory and global file spelled out.
///
/// Missing or unparsable workspace and global files are skipped, so the layers
/// beneath them apply.
pub fn load_layered(
    cli: &Cli,
    workspace: &Path,
    global_path: Option<&Path>,
) -> Result<AppConfig, ConfigError> {
    // Layer 1: global config
    let global = match global_path {
        Some(path) => load_optional(path),
        None => {
            tracing::debug!("Could not determine global config directory");
            PartialConfig::default()
        }
    };

    // Layer 2: explicit config file, or the workspace one
    let file = match cli_config_path(cli) {
        Some(path) => load_toml_file(&path)?,
        None => load_optional(&workspace.join(CONFIG_FILE_NAME)),
    };

    // Layer 3: CLI args (converted to PartialConfig)
    let cli_partial = cli_to_partial(cli);

    // Merge: CLI > file > global > defaults
    let config = cli_partial
        .with_fallback(file)
        .with_fallback(global)
        .finalize()?;
    config.validate()?;

    tracing::debug!(
        agents = config.agents.len(),
        tool_servers = config.tool_servers.len(),
        "Configuration resolved"
    );
    Ok(config)
}

/// Load a config file that must exist, without CLI overrides.
pub fn load_config_file(path: &Path) -> Result<AppConfig, ConfigError> {
    let config = load_toml_file(path)?.finalize()?;
    config.validate()?;
    Ok(config)
}

/// Load an optional layer. Returns empty PartialConfig if the file is missing or broken.
fn load_optional(path: &Path) -> PartialConfig {
    match load_toml_file(path) {
        Ok(partial) => partial,
        Err(ConfigError::IoError(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config file at {}, skipping", path.display());
            PartialConfig::default()
        }
        Err(e) => {
            tracing::warn!("Ignoring config at {}: {}", path.display(), e);
            PartialConfig::default()
        }
    }
}

/// Read and parse a TOML config file into a PartialConfig.
fn load_toml_file(path: &Path) -> Result<PartialConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let config_file =
        toml::from_str::<ConfigFile>(&contents).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
    tracing::info!("Loaded config from {}", path.display());
    Ok(config_file.to_partial())
}

/// Write [`DEFAULT_CONFIG_TOML`] to `path` unless a file already exists there.
///
/// Returns `true` if a file was written.
pub fn ensure_config_exists(path: &Path) -> Result<bool, ConfigError> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, DEFAULT_CONFIG_TOML)?;
    tracing::info!("Created default config file at {}", path.display());
    Ok(true)
}

/// Resolve the platform-specific global config path.
/// Linux: ~/.config/replica/replica.toml
/// macOS: ~/Library/Application Support/replica/replica.toml
pub fn global_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "replica")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

/// Extract an explicit config path from CLI args.
fn cli_config_path(cli: &Cli) -> Option<PathBuf> {
    match &cli.command {
        Commands::Run { config, .. } => config.clone(),
        Commands::Check { config } => config.clone(),
        Commands::Init { .. } => None,
    }
}

/// Convert CLI arguments to a PartialConfig for merging.
fn cli_to_partial(cli: &Cli) -> PartialConfig {
    match &cli.command {
        Commands::Run {
            max_children,
            max_depth,
            timeout,
            ..
        } => PartialConfig {
            max_global_children: *max_children,
            max_recursion_depth: *max_depth,
            default_timeout_seconds: *timeout,
            ..Default::default()
        },
        Commands::Check { .. } | Commands::Init { .. } => PartialConfig::default(),
    }
}
