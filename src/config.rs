//! Configuration for launchkit.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (LAUNCHKIT_HOME, LAUNCHKIT_KEYS, LAUNCHKIT_STORE,
//!    LAUNCHKIT_LAUNCH_WORKER, LAUNCHKIT_WALLET_WORKER)
//! 2. Config file (.launchkit/config.yaml)
//! 3. Defaults (~/.launchkit)
//!
//! Config file discovery:
//! - Searches current directory and parents for .launchkit/config.yaml
//! - Paths in the config file are relative to the .launchkit/ directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::{CoordinatorSettings, DEFAULT_EXPLORER_TX_URL, DEFAULT_STATUS_PATTERN};
use crate::domain::WorkerCommand;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const CONFIG_DIR: &str = ".launchkit";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub streaming: Option<StreamingConfig>,
    #[serde(default)]
    pub explorer: Option<ExplorerConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory
    pub home: Option<String>,
    /// Vanity key snapshot
    pub keys: Option<String>,
    /// Launch store file
    pub store: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkersConfig {
    pub launch: Option<WorkerCommand>,
    pub wallet: Option<WorkerCommand>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamingConfig {
    pub status_pattern: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExplorerConfig {
    pub tx_url: Option<String>,
}

/// Environment overrides, read once per load
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub home: Option<String>,
    pub keys: Option<String>,
    pub store: Option<String>,
    pub launch_worker: Option<String>,
    pub wallet_worker: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            home: var("LAUNCHKIT_HOME"),
            keys: var("LAUNCHKIT_KEYS"),
            store: var("LAUNCHKIT_STORE"),
            launch_worker: var("LAUNCHKIT_LAUNCH_WORKER"),
            wallet_worker: var("LAUNCHKIT_WALLET_WORKER"),
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// State directory
    pub home: PathBuf,
    /// Vanity key snapshot
    pub keys: PathBuf,
    /// Launch store file
    pub store: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Workers, status pattern and explorer prefix
    pub coordinator: CoordinatorSettings,
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(CONFIG_DIR).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Combine a config file (if any) with environment overrides
fn resolve(
    config_path: Option<&Path>,
    env: &EnvOverrides,
    default_home: PathBuf,
) -> Result<ResolvedConfig> {
    let file = config_path.map(load_config_file).transpose()?;
    let config_dir = config_path
        .and_then(Path::parent)
        .unwrap_or(Path::new("."));

    let paths = file.as_ref().map(|f| f.paths.clone()).unwrap_or_default();
    let from_file = |path: &Option<String>| path.as_deref().map(|p| resolve_path(config_dir, p));

    let home = env
        .home
        .as_ref()
        .map(PathBuf::from)
        .or_else(|| from_file(&paths.home))
        .unwrap_or(default_home);

    let keys = env
        .keys
        .as_ref()
        .map(PathBuf::from)
        .or_else(|| from_file(&paths.keys))
        .unwrap_or_else(|| home.join("vanity.json"));

    let store = env
        .store
        .as_ref()
        .map(PathBuf::from)
        .or_else(|| from_file(&paths.store))
        .unwrap_or_else(|| home.join("launches.json"));

    let defaults = CoordinatorSettings::default();
    let workers = file.as_ref().map(|f| f.workers.clone()).unwrap_or_default();

    let launch_worker = match &env.launch_worker {
        Some(program) => WorkerCommand::new(program.clone()),
        None => workers.launch.unwrap_or(defaults.launch_worker),
    };
    let wallet_worker = match &env.wallet_worker {
        Some(program) => WorkerCommand::new(program.clone()),
        None => workers.wallet.unwrap_or(defaults.wallet_worker),
    };

    let status_pattern = file
        .as_ref()
        .and_then(|f| f.streaming.as_ref())
        .and_then(|s| s.status_pattern.clone())
        .unwrap_or_else(|| DEFAULT_STATUS_PATTERN.to_string());

    let explorer_tx_url = file
        .as_ref()
        .and_then(|f| f.explorer.as_ref())
        .and_then(|e| e.tx_url.clone())
        .unwrap_or_else(|| DEFAULT_EXPLORER_TX_URL.to_string());

    Ok(ResolvedConfig {
        home,
        keys,
        store,
        config_file: config_path.map(Path::to_path_buf),
        coordinator: CoordinatorSettings {
            launch_worker,
            wallet_worker,
            status_pattern,
            explorer_tx_url,
        },
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR);

    resolve(
        find_config_file().as_deref(),
        &EnvOverrides::from_env(),
        default_home,
    )
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_config(temp: &TempDir, body: &str) -> PathBuf {
        let dir = temp.path().join(CONFIG_DIR);
        std::fs::create_dir_all(&dir).unwrap();

        let config_path = dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "{}", body).unwrap();
        config_path
    }

    #[test]
    fn test_defaults_without_file() {
        let home = PathBuf::from("/home/test/.launchkit");
        let config = resolve(None, &EnvOverrides::default(), home.clone()).unwrap();

        assert_eq!(config.home, home);
        assert_eq!(config.keys, home.join("vanity.json"));
        assert_eq!(config.store, home.join("launches.json"));
        assert!(config.config_file.is_none());
        assert_eq!(config.coordinator, CoordinatorSettings::default());
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(
            &temp,
            r#"
version: "1.0"
paths:
  home: ./
  keys: vanity.json
workers:
  launch: { program: /opt/bin/snipebundle_service }
  wallet: { program: sh, args: [wallet.sh] }
streaming:
  status_pattern: 'sent: ([A-Z]+)'
explorer:
  tx_url: https://explorer.example/tx/
"#,
        );

        let file = load_config_file(&config_path).unwrap();
        assert_eq!(file.version, "1.0");
        assert_eq!(file.paths.keys, Some("vanity.json".to_string()));
        assert_eq!(file.workers.wallet.unwrap().args, vec!["wallet.sh".to_string()]);

        let config = resolve(
            Some(&config_path),
            &EnvOverrides::default(),
            PathBuf::from("/unused"),
        )
        .unwrap();
        let dir = config_path.parent().unwrap();
        assert_eq!(config.keys, dir.join("vanity.json"));
        assert_eq!(config.store, config.home.join("launches.json"));
        assert_eq!(
            config.coordinator.launch_worker.program,
            "/opt/bin/snipebundle_service"
        );
        assert_eq!(config.coordinator.status_pattern, "sent: ([A-Z]+)");
        assert_eq!(config.coordinator.explorer_tx_url, "https://explorer.example/tx/");
    }

    #[test]
    fn test_env_overrides_file() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(
            &temp,
            r#"
version: "1.0"
paths:
  keys: vanity.json
workers:
  launch: { program: from-file }
"#,
        );
        let env = EnvOverrides {
            keys: Some("/env/keys.json".into()),
            launch_worker: Some("/env/launch".into()),
            ..EnvOverrides::default()
        };

        let config = resolve(Some(&config_path), &env, PathBuf::from("/home/x")).unwrap();
        assert_eq!(config.keys, PathBuf::from("/env/keys.json"));
        assert_eq!(config.coordinator.launch_worker, WorkerCommand::new("/env/launch"));
        assert_eq!(config.home, PathBuf::from("/home/x"));
    }

    #[test]
    fn test_malformed_file_is_error() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(&temp, "paths: [not, a, map]");
        assert!(resolve(Some(&config_path), &EnvOverrides::default(), PathBuf::from("/h")).is_err());
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project/.launchkit");

        assert_eq!(
            resolve_path(&base, "./keys.json"),
            PathBuf::from("/home/user/project/.launchkit/keys.json")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
