use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::goal::GoalOutcome;
use super::BoxFuture;

/// Who produced a turn. Saved as the bare identity string; agent turns carry an `agent:` prefix so
/// they reload as the agent's own output.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Speaker {
    System,
    Agent(String),
    User(String),
}

impl Speaker {
    pub fn identity(&self) -> &str {
        match self {
            Speaker::System => "system",
            Speaker::Agent(name) | Speaker::User(name) => name,
        }
    }

    /// Resolves a raw identity against the agent's own name.
    pub fn from_identity(identity: &str, agent_name: &str) -> Self {
        if identity == "system" {
            Speaker::System
        } else if identity == agent_name {
            Speaker::Agent(identity.to_string())
        } else {
            Speaker::User(identity.to_string())
        }
    }
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.identity())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    #[serde(serialize_with = "ser_speaker", rename = "role")]
    #[serde(deserialize_with = "de_speaker")]
    pub speaker: Speaker,
    #[serde(rename = "content")]
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(speaker: Speaker, text: impl Into<String>) -> Self {
        Self {
            speaker,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

fn ser_speaker<S: Serializer>(speaker: &Speaker, s: S) -> Result<S::Ok, S::Error> {
    match speaker {
        Speaker::System => s.serialize_str("system"),
        Speaker::Agent(name) => s.serialize_str(&format!("agent:{name}")),
        Speaker::User(name) => s.serialize_str(name),
    }
}

fn de_speaker<'de, D: Deserializer<'de>>(d: D) -> Result<Speaker, D::Error> {
    let raw = String::deserialize(d)?;
    Ok(if raw == "system" {
        Speaker::System
    } else if let Some(name) = raw.strip_prefix("agent:") {
        Speaker::Agent(name.to_string())
    } else {
        Speaker::User(raw)
    })
}

/// Renders turns as `speaker: text` lines, oldest first.
pub fn stringify_turns(turns: &[Turn]) -> String {
    let mut out = String::new();
    for turn in turns {
        match &turn.speaker {
            Speaker::System => out.push_str(&format!("System output: {}\n", turn.text)),
            Speaker::Agent(_) => out.push_str(&format!("Your output:\n{}\n", turn.text)),
            Speaker::User(name) => out.push_str(&format!("{name}: {}\n", turn.text)),
        }
    }
    out.trim_end().to_string()
}

/// Durable snapshot handed to a [`HistoryStore`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SavedHistory {
    #[serde(default)]
    pub memory: String,
    #[serde(default)]
    pub turns: Vec<Turn>,
    #[serde(default)]
    pub last_goals: Vec<GoalOutcome>,
}

/// Persistence collaborator: opaque durable storage for the history log.
pub trait HistoryStore: Send + Sync {
    fn load(&self) -> anyhow::Result<Option<SavedHistory>>;
    fn save(&self, snapshot: &SavedHistory) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryHistoryStore {
    saved: std::sync::Mutex<Option<SavedHistory>>,
    saves: std::sync::atomic::AtomicUsize,
}

impl InMemoryHistoryStore {
    pub fn save_count(&self) -> usize {
        self.saves.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl HistoryStore for InMemoryHistoryStore {
    fn load(&self) -> anyhow::Result<Option<SavedHistory>> {
        let guard = self
            .saved
            .lock()
            .map_err(|_| anyhow::anyhow!("history store poisoned"))?;
        Ok(guard.clone())
    }

    fn save(&self, snapshot: &SavedHistory) -> anyhow::Result<()> {
        let mut guard = self
            .saved
            .lock()
            .map_err(|_| anyhow::anyhow!("history store poisoned"))?;
        *guard = Some(snapshot.clone());
        self.saves.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

/// Stores the history as pretty JSON at `<root>/<agent>/memory.json`.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(root: impl AsRef<Path>, agent_name: &str) -> Self {
        Self {
            path: root.as_ref().join(agent_name).join("memory.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl HistoryStore for JsonFileStore {
    fn load(&self) -> anyhow::Result<Option<SavedHistory>> {
        if !self.path.is_file() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("read history at {}", self.path.display()))?;
        let saved = serde_json::from_str(&text)
            .with_context(|| format!("decode history at {}", self.path.display()))?;
        Ok(Some(saved))
    }

    fn save(&self, snapshot: &SavedHistory) -> anyhow::Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create history dir {}", dir.display()))?;
        }
        let text = serde_json::to_string_pretty(snapshot).context("encode history")?;
        std::fs::write(&self.path, text)
            .with_context(|| format!("write history at {}", self.path.display()))
    }
}

/// Summarization collaborator. Receives the running memory and the turns about to be folded in.
pub trait Summarizer: Send + Sync {
    fn summarize<'a>(
        &'a self,
        memory: &'a str,
        turns: &'a [Turn],
    ) -> BoxFuture<'a, anyhow::Result<String>>;
}

#[derive(Debug, Clone)]
pub struct HistoryConfig {
    /// Summarization is triggered once the log holds more than this many turns.
    pub max_messages: usize,
    /// How many of the oldest turns are folded into memory per summarization.
    pub summary_chunk: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_messages: 15,
            summary_chunk: 5,
        }
    }
}

/// Ordered, append-only conversation log.
///
/// Turns are only ever removed by [`HistoryLog::apply_summary`], which the summarization path calls
/// explicitly after folding them into `memory`.
pub struct HistoryLog {
    turns: Vec<Turn>,
    memory: String,
    cfg: HistoryConfig,
    store: Box<dyn HistoryStore>,
}

impl fmt::Debug for HistoryLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HistoryLog")
            .field("turns", &self.turns.len())
            .field("memory_len", &self.memory.len())
            .field("cfg", &self.cfg)
            .finish()
    }
}

impl HistoryLog {
    pub fn new(cfg: HistoryConfig, store: Box<dyn HistoryStore>) -> Self {
        Self {
            turns: Vec::new(),
            memory: String::new(),
            cfg,
            store,
        }
    }

    pub fn add(&mut self, speaker: Speaker, text: impl Into<String>) {
        self.turns.push(Turn::new(speaker, text));
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn memory(&self) -> &str {
        &self.memory
    }

    pub fn needs_summary(&self) -> bool {
        self.turns.len() > self.cfg.max_messages
    }

    pub fn overflow(&self) -> &[Turn] {
        if !self.needs_summary() {
            return &[];
        }
        let n = self.cfg.summary_chunk.min(self.turns.len());
        &self.turns[..n]
    }

    pub fn apply_summary(&mut self, summary: impl Into<String>, count: usize) {
        let count = count.min(self.turns.len());
        self.turns.drain(..count);
        self.memory = summary.into();
    }

    /// Restores turns and memory; returns the last goal outcomes recorded alongside them.
    pub fn load(&mut self) -> anyhow::Result<Vec<GoalOutcome>> {
        let Some(saved) = self.store.load()? else {
            return Ok(Vec::new());
        };
        self.turns = saved.turns;
        self.memory = saved.memory;
        Ok(saved.last_goals)
    }

    pub fn save(&self, last_goals: &[GoalOutcome]) -> anyhow::Result<()> {
        self.store.save(&SavedHistory {
            memory: self.memory.clone(),
            turns: self.turns.clone(),
            last_goals: last_goals.to_vec(),
        })
    }
}

/// Folds the oldest turns into memory when the log has grown past its limit.
///
/// Returns true when a summary was applied.
pub async fn summarize_if_needed(
    log: &mut HistoryLog,
    summarizer: &dyn Summarizer,
) -> anyhow::Result<bool> {
    let chunk = log.overflow().to_vec();
    if chunk.is_empty() {
        return Ok(false);
    }
    let summary = summarizer.summarize(log.memory(), &chunk).await?;
    log.apply_summary(summary, chunk.len());
    tracing::debug!(folded = chunk.len(), remaining = log.len(), "agent.history.summarized");
    Ok(true)
}
