//! Loading [`FabricConfig`] from `~/.agentfabric/config.toml`.
//!
//! A config file may name other files in an `include` array. Includes are
//! merged in order, then the including file is merged on top, so the file
//! closest to the root wins.

use agentfabric_types::config::FabricConfig;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

const MAX_INCLUDE_DEPTH: u32 = 8;

const CONFIG_DIR: &str = ".agentfabric";

/// Why a config file could not be used.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("include '{0}' must be a relative path inside the config directory")]
    IncludeOutsideDir(String),
    #[error("include cycle through '{0}'")]
    IncludeCycle(String),
    #[error("includes nested deeper than {} levels", MAX_INCLUDE_DEPTH)]
    IncludeTooDeep,
    #[error("invalid config: {0}")]
    Invalid(#[from] toml::de::Error),
}

/// Load the config at `path` (or the default location), falling back to
/// defaults on any problem.
///
/// A missing file is not an error. Any other failure is logged and defaults
/// are used. The result is always sanitized.
pub fn load_config(path: Option<&Path>) -> FabricConfig {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);

    let mut config = if path.exists() {
        match try_load_config(&path) {
            Ok(config) => {
                info!(path = %path.display(), "Loaded fabric configuration");
                config
            }
            Err(e) => {
                warn!(error = %e, path = %path.display(), "Unusable fabric config, using defaults");
                FabricConfig::default()
            }
        }
    } else {
        info!(path = %path.display(), "No fabric config found, using defaults");
        FabricConfig::default()
    };

    for field in config.sanitize() {
        warn!(field, "Invalid fabric config value replaced with default");
    }
    config
}

/// Load and merge the config at `path`, reporting every failure.
pub fn try_load_config(path: &Path) -> Result<FabricConfig, ConfigError> {
    let mut seen = HashSet::new();
    seen.insert(std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf()));
    let merged = read_with_includes(path, &mut seen, 0)?;
    Ok(merged.try_into::<FabricConfig>()?)
}

fn read_toml(path: &Path) -> Result<toml::Value, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn read_with_includes(
    path: &Path,
    seen: &mut HashSet<PathBuf>,
    depth: u32,
) -> Result<toml::Value, ConfigError> {
    if depth > MAX_INCLUDE_DEPTH {
        return Err(ConfigError::IncludeTooDeep);
    }
    let mut value = read_toml(path)?;
    let includes: Vec<String> = match &mut value {
        toml::Value::Table(table) => match table.remove("include") {
            Some(toml::Value::Array(items)) => items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };
    if includes.is_empty() {
        return Ok(value);
    }

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut merged = toml::Value::Table(toml::map::Map::new());
    for name in includes {
        let target = resolve_include(dir, &name)?;
        if !seen.insert(target.clone()) {
            return Err(ConfigError::IncludeCycle(name));
        }
        info!(include = %name, "Loading config include");
        let included = read_with_includes(&target, seen, depth + 1)?;
        deep_merge_toml(&mut merged, &included);
    }
    deep_merge_toml(&mut merged, &value);
    Ok(merged)
}

/// Resolve an include against `dir`, refusing anything that leaves it.
fn resolve_include(dir: &Path, name: &str) -> Result<PathBuf, ConfigError> {
    let relative = Path::new(name);
    let escapes = relative.is_absolute()
        || relative
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)));
    if escapes {
        return Err(ConfigError::IncludeOutsideDir(name.to_string()));
    }

    let joined = dir.join(relative);
    let target = std::fs::canonicalize(&joined).map_err(|source| ConfigError::Read {
        path: joined.clone(),
        source,
    })?;
    let root = std::fs::canonicalize(dir).map_err(|source| ConfigError::Read {
        path: dir.to_path_buf(),
        source,
    })?;
    if !target.starts_with(&root) {
        return Err(ConfigError::IncludeOutsideDir(name.to_string()));
    }
    Ok(target)
}

/// Merge `overlay` into `base`. Tables merge key by key; any other value in
/// `overlay` replaces the one in `base`.
pub fn deep_merge_toml(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(key) {
                    Some(existing) => deep_merge_toml(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// `~/.agentfabric`, or a directory under the temp dir when there is no home.
pub fn agentfabric_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(CONFIG_DIR)
}

/// `~/.agentfabric/config.toml`.
pub fn default_config_path() -> PathBuf {
    agentfabric_home().join("config.toml")
}
