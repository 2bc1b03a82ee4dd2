pub mod merge;
pub mod schema;

pub use schema::*;

use crate::cli::{Cli, FabricArgs};
use crate::error::ConfigError;
use anyhow::Context;
use std::path::{Path, PathBuf};

const CONFIG_FILE_NAME: &str = "weave.toml";

/// Load configuration by merging global, local, and CLI sources.
/// Precedence: CLI > local config (`--config` or ./weave.toml) > global config > defaults.
///
/// Missing implicit config files are handled gracefully (defaults apply).
/// A file named with `--config` must exist and parse.
pub fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    let options = cli.options();

    // Layer 1: Global config (~/.config/weave/weave.toml or platform equivalent)
    let global = load_global_config();

    // Layer 2: Local config
    let local = match &options.config {
        Some(path) => load_explicit_config(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => load_toml_file(Path::new(CONFIG_FILE_NAME)).unwrap_or_default(),
    };

    // Layer 3: CLI args (converted to PartialConfig)
    let cli_partial = cli_to_partial(options);

    // Merge: CLI > local > global > defaults
    let config = cli_partial
        .with_fallback(local)
        .with_fallback(global)
        .finalize();

    Ok(config)
}

/// Load global config from the platform-specific config directory.
/// Returns empty PartialConfig if file not found.
fn load_global_config() -> PartialConfig {
    match global_config_path() {
        Some(p) => load_toml_file(&p).unwrap_or_default(),
        None => {
            tracing::debug!("Could not determine global config directory");
            PartialConfig::default()
        }
    }
}

fn load_explicit_config(path: &Path) -> Result<PartialConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    parse_config(path, &contents)
}

fn parse_config(path: &Path, contents: &str) -> Result<PartialConfig, ConfigError> {
    toml::from_str::<ConfigFile>(contents)
        .map(ConfigFile::to_partial)
        .map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Load and parse a TOML config file into a PartialConfig.
/// Returns None on file-not-found; parse errors are logged and ignored.
fn load_toml_file(path: &Path) -> Option<PartialConfig> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match parse_config(path, &contents) {
            Ok(partial) => {
                tracing::info!("Loaded config from {}", path.display());
                Some(partial)
            }
            Err(e) => {
                tracing::warn!("Config parse error: {e}");
                None
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config file at {}, using defaults", path.display());
            None
        }
        Err(e) => {
            tracing::warn!("Failed to read config at {}: {}", path.display(), e);
            None
        }
    }
}

/// Resolve the platform-specific global config path.
/// Linux: ~/.config/weave/weave.toml
/// macOS: ~/Library/Application Support/weave/weave.toml
fn global_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "weave").map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

/// Convert CLI arguments to a PartialConfig for merging.
fn cli_to_partial(options: &FabricArgs) -> PartialConfig {
    PartialConfig {
        default_model: options.model.clone(),
        task_secs: options.timeout,
        critique: options.no_critique.then_some(false),
        decompose: options.decompose.then_some(true),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Commands;
    use tempfile::TempDir;

    fn cli_with(options: FabricArgs) -> Cli {
        Cli {
            command: Commands::Run {
                task: "t".into(),
                options,
            },
        }
    }

    #[test]
    fn explicit_config_is_loaded_and_cli_wins() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("custom.toml");
        std::fs::write(
            &path,
            "[general]\ndefault_model = \"from-file\"\n[timeouts]\ntask_secs = 5\n",
        )
        .unwrap();

        let config = load_config(&cli_with(FabricArgs {
            config: Some(path),
            timeout: Some(7),
            no_critique: true,
            ..Default::default()
        }))
        .unwrap();

        assert_eq!(config.default_model, "from-file");
        assert_eq!(config.task_secs, 7);
        assert!(!config.critique);
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let tmp = TempDir::new().expect("tempdir");
        let result = load_config(&cli_with(FabricArgs {
            config: Some(tmp.path().join("absent.toml")),
            ..Default::default()
        }));
        assert!(result.is_err());
    }

    #[test]
    fn parse_error_names_the_file() {
        let err = parse_config(Path::new("bad.toml"), "[timeouts\n").unwrap_err();
        match err {
            ConfigError::ParseError { path, .. } => assert_eq!(path, PathBuf::from("bad.toml")),
            other => panic!("expected ParseError, got {other:?}"),
        }
    }
}
