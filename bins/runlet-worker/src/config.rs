// Engine configuration management for the runlet worker
use anyhow::{bail, Context, Result};
use runlet_common::types::{Language, Version};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config/engines.json";
pub const CONFIG_PATH_ENV: &str = "ENGINE_CONFIG";

/// Captured stdout and stderr are each capped at this size (10 MiB).
pub const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_max_output_bytes() -> usize {
    MAX_OUTPUT_BYTES
}

/// How to launch the engine for one language version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub language: Language,
    pub version: Version,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

impl EngineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct EnginesJson {
    engines: Vec<EngineConfig>,
}

/// Engine configuration manager
#[derive(Debug, Clone, Default)]
pub struct EngineConfigManager {
    configs: HashMap<Language, BTreeMap<Version, EngineConfig>>,
}

impl EngineConfigManager {
    /// Load engine configurations from a JSON file
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Engine config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        Self::from_json(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))
    }

    /// Load from `ENGINE_CONFIG`, or config/engines.json when unset
    pub fn load_default() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load(&path)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let engines_json: EnginesJson = serde_json::from_str(content)?;

        let mut configs: HashMap<Language, BTreeMap<Version, EngineConfig>> = HashMap::new();
        for engine in engines_json.engines {
            if engine.command.trim().is_empty() {
                bail!("Engine for {} {} has an empty command", engine.language, engine.version);
            }
            let versions = configs.entry(engine.language).or_default();
            if versions.contains_key(&engine.version) {
                bail!("Duplicate engine entry for {} {}", engine.language, engine.version);
            }
            versions.insert(engine.version, engine);
        }

        Ok(Self { configs })
    }

    /// All configured versions of a language
    pub fn engines_for(&self, language: Language) -> Vec<EngineConfig> {
        self.configs
            .get(&language)
            .map(|versions| versions.values().cloned().collect())
            .unwrap_or_default()
    }

    /// List all configured languages
    pub fn list_languages(&self) -> Vec<Language> {
        let mut languages: Vec<Language> = self.configs.keys().copied().collect();
        languages.sort_by_key(|l| l.as_str());
        languages
    }
}
