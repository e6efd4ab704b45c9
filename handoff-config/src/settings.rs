use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use handoff_core::orchestration::HandoffConfig;
use tracing::{info, warn};

pub const CONFIG_PATH_ENV: &str = "HANDOFF_CONFIG_PATH";
pub const CONFIG_JSON_ENV: &str = "HANDOFF_CONFIG_JSON";

const DEFAULT_FILES: &[&str] = &[
    "handoff.toml",
    "handoff.json",
    "config/handoff.toml",
    "config/handoff.json",
];

/// Where a loaded configuration came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigSource {
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
    Default,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::EnvPath(path) => write!(f, "{} ({})", CONFIG_PATH_ENV, path.display()),
            ConfigSource::EnvInline => f.write_str(CONFIG_JSON_ENV),
            ConfigSource::File(path) => write!(f, "{}", path.display()),
            ConfigSource::Default => f.write_str("built-in defaults"),
        }
    }
}

/// A validated configuration plus how it was obtained.
#[derive(Clone, Debug)]
pub struct ConfigLoad {
    pub config: HandoffConfig,
    pub source: ConfigSource,
    pub warnings: Vec<String>,
}

/// Loader for [`HandoffConfig`].
#[derive(Debug)]
pub struct HandoffSettings;

impl HandoffSettings {
    /// Loads configuration from the process environment and working
    /// directory. Evaluation order:
    /// 1) `$HANDOFF_CONFIG_PATH` (TOML or JSON file),
    /// 2) `$HANDOFF_CONFIG_JSON` (inline JSON),
    /// 3) the first default file that exists,
    /// 4) defaults.
    pub fn load_from_env() -> anyhow::Result<ConfigLoad> {
        let cwd = env::current_dir().context("failed to resolve working directory")?;
        let load = Self::load_with(|key| env::var(key).ok(), &cwd)?;
        info!(target: "handoff::runtime", source = %load.source, "loaded handoff configuration");
        for warning in &load.warnings {
            warn!(target: "handoff::runtime", "{warning}");
        }
        Ok(load)
    }

    /// Same as [`HandoffSettings::load_from_env`] with an explicit variable
    /// lookup and a base directory for the default files.
    pub fn load_with<F>(lookup: F, base_dir: &Path) -> anyhow::Result<ConfigLoad>
    where
        F: Fn(&str) -> Option<String>,
    {
        let (config, source) = Self::resolve(&lookup, base_dir)?;
        let warnings = config
            .validate()
            .map_err(|err| anyhow!("invalid handoff config from {source}: {err}"))?;
        Ok(ConfigLoad {
            config,
            source,
            warnings,
        })
    }

    fn resolve<F>(lookup: &F, base_dir: &Path) -> anyhow::Result<(HandoffConfig, ConfigSource)>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path_str) = lookup(CONFIG_PATH_ENV)
            && !path_str.trim().is_empty()
        {
            let path = PathBuf::from(path_str);
            let config = Self::load_from_file(&path)?;
            return Ok((config, ConfigSource::EnvPath(path)));
        }

        if let Some(raw) = lookup(CONFIG_JSON_ENV)
            && !raw.trim().is_empty()
        {
            let config = Self::parse_json(&raw).context("failed to parse HANDOFF_CONFIG_JSON")?;
            return Ok((config, ConfigSource::EnvInline));
        }

        if let Some(path) = Self::find_default_file(base_dir) {
            let config = Self::load_from_file(&path)?;
            return Ok((config, ConfigSource::File(path)));
        }

        Ok((HandoffConfig::default(), ConfigSource::Default))
    }

    pub fn load_from_file(path: &Path) -> anyhow::Result<HandoffConfig> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read handoff config from {}", path.display()))?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::parse_json(&contents)
                .with_context(|| format!("invalid handoff config {}", path.display())),
            Some("toml") | Some("tml") => toml::from_str(&contents)
                .map_err(|err| anyhow!("invalid handoff config {}: {}", path.display(), err)),
            _ => Self::parse_from_str(&contents, &path.display().to_string()),
        }
    }

    /// Tries TOML first, then JSON.
    pub fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<HandoffConfig> {
        toml::from_str(contents).or_else(|toml_err| {
            serde_json::from_str(contents).map_err(|json_err| {
                anyhow!(
                    "failed to parse handoff config {}: toml error: {}; json error: {}",
                    origin,
                    toml_err,
                    json_err
                )
            })
        })
    }

    pub fn parse_json(raw: &str) -> anyhow::Result<HandoffConfig> {
        serde_json::from_str(raw).map_err(|err| anyhow!("invalid handoff config json: {err}"))
    }

    fn find_default_file(base_dir: &Path) -> Option<PathBuf> {
        DEFAULT_FILES
            .iter()
            .map(|candidate| base_dir.join(candidate))
            .find(|path| path.exists())
    }
}
