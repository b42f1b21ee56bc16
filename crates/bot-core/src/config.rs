use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::agent::conversation::ConversationConfig;
use crate::agent::error::AgentError;
use crate::agent::goal::Agenda;
use crate::agent::history::HistoryConfig;
use crate::agent::state::{AgentSettings, RetryLimits};

/// Environment variable naming an extra config directory, searched first.
pub const CONFIG_DIR_ENV: &str = "CIVBOT_CONFIG_DIR";

/// Locates and parses TOML config files.
///
/// Search order:
/// 1) `CIVBOT_CONFIG_DIR/<relative_path>`
/// 2) `./<relative_path>`
/// 3) `<repo_root>/config/<relative_path>`
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn parse_from_file<T: DeserializeOwned>(relative_path: &str) -> anyhow::Result<T> {
        let path = Self::resolve_path(relative_path)?;
        Self::parse_at(&path)
    }

    pub fn parse_at<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        Self::parse_from_str(&text).with_context(|| format!("in {}", path.display()))
    }

    pub fn parse_from_str<T: DeserializeOwned>(text: &str) -> anyhow::Result<T> {
        toml::from_str(text).context("Failed to parse TOML")
    }

    fn search_roots() -> Vec<PathBuf> {
        let mut roots = Vec::new();
        if let Some(root) = env::var_os(CONFIG_DIR_ENV) {
            roots.push(PathBuf::from(root));
        }
        if let Ok(cwd) = env::current_dir() {
            roots.push(cwd);
        }
        // This crate lives at <repo_root>/crates/bot-core.
        if let Some(repo) = Path::new(env!("CARGO_MANIFEST_DIR")).ancestors().nth(2) {
            roots.push(repo.join("config"));
        }
        roots
    }

    /// First root containing `relative_path` as a file.
    pub fn find_in(roots: &[PathBuf], relative_path: &str) -> Option<PathBuf> {
        roots
            .iter()
            .map(|root| root.join(relative_path))
            .find(|candidate| candidate.is_file())
    }

    fn resolve_path(relative_path: &str) -> anyhow::Result<PathBuf> {
        let roots = Self::search_roots();
        Self::find_in(&roots, relative_path).ok_or_else(|| {
            anyhow::anyhow!(
                "Config file not found for {relative_path:?} (searched {})",
                roots
                    .iter()
                    .map(|r| r.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        })
    }
}

/// Oracle backend for an Ollama-style generate endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ModelProfile {
    pub endpoint: String,
    pub model: String,
}

impl Default for ModelProfile {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:11434/api/generate".to_string(),
            model: "llama3".to_string(),
        }
    }
}

fn default_agenda() -> Vec<String> {
    [
        "build a house to be protected at night",
        "get some wooden tools to collect resources",
        "get some food to not die of hunger",
        "explore to find a village",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// One agent's profile, as read from `profiles/<name>.toml`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AgentProfile {
    pub name: String,
    pub model: ModelProfile,
    /// Minimum time between two oracle requests.
    pub cooldown_ms: u64,
    /// Pause after an abandoned goal cycle.
    pub error_backoff_ms: u64,
    pub conversing: String,
    pub saving_memory: String,
    pub max_messages: usize,
    pub summary_chunk: usize,
    pub verbose_commands: bool,
    /// Responses per incoming message. Absent means unbounded.
    pub max_commands: Option<usize>,
    pub blueprints: Vec<String>,
    pub agenda: Vec<String>,
    pub retry: RetryLimits,
    /// Restore history and last goal outcomes from a previous session.
    pub load_memory: bool,
}

impl Default for AgentProfile {
    fn default() -> Self {
        let convo = ConversationConfig::default();
        let history = HistoryConfig::default();
        Self {
            name: "civbot".to_string(),
            model: ModelProfile::default(),
            cooldown_ms: 0,
            error_backoff_ms: 2_000,
            conversing: convo.conversing,
            saving_memory: convo.saving_memory,
            max_messages: history.max_messages,
            summary_chunk: history.summary_chunk,
            verbose_commands: false,
            max_commands: None,
            blueprints: Vec::new(),
            agenda: default_agenda(),
            retry: RetryLimits::default(),
            load_memory: false,
        }
    }
}

impl AgentProfile {
    /// Loads `relative_path` through [`ConfigLoader`] and validates it.
    pub fn load(relative_path: &str) -> anyhow::Result<Self> {
        let profile: Self = ConfigLoader::parse_from_file(relative_path)?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if self.name.trim().is_empty() {
            return Err(AgentError::Config("profile name is empty".to_string()));
        }
        if self.agenda.iter().all(|g| g.trim().is_empty()) {
            return Err(AgentError::Config("initial agenda is empty".to_string()));
        }
        let zero = self.retry.zero_limits();
        if !zero.is_empty() {
            return Err(AgentError::Config(format!(
                "retry limits must be at least 1: {}",
                zero.join(", ")
            )));
        }
        if self.summary_chunk == 0 || self.summary_chunk > self.max_messages {
            return Err(AgentError::Config(format!(
                "summary_chunk must be in 1..={} (got {})",
                self.max_messages, self.summary_chunk
            )));
        }
        if self.max_commands == Some(0) {
            return Err(AgentError::Config("max_commands must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn initial_agenda(&self) -> Agenda {
        Agenda::from_descriptions(self.agenda.iter().filter(|g| !g.trim().is_empty()))
    }

    pub fn history_config(&self) -> HistoryConfig {
        HistoryConfig {
            max_messages: self.max_messages,
            summary_chunk: self.summary_chunk,
        }
    }

    pub fn conversation_config(&self) -> ConversationConfig {
        ConversationConfig {
            conversing: self.conversing.clone(),
            saving_memory: self.saving_memory.clone(),
            max_commands: self.max_commands,
        }
    }

    pub fn settings(&self) -> AgentSettings {
        AgentSettings {
            verbose_commands: self.verbose_commands,
            blueprints: self.blueprints.clone(),
            error_backoff: Duration::from_millis(self.error_backoff_ms),
        }
    }
}
