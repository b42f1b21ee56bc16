use std::collections::HashSet;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use super::BoxFuture;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    SuccessfulGoal,
    FailedGoal,
    SuccessfulAction,
    FailedAction,
    Relationship,
}

impl MemoryKind {
    pub fn for_goal(achieved: bool) -> Self {
        if achieved {
            MemoryKind::SuccessfulGoal
        } else {
            MemoryKind::FailedGoal
        }
    }

    pub fn for_action(succeeded: bool) -> Self {
        if succeeded {
            MemoryKind::SuccessfulAction
        } else {
            MemoryKind::FailedAction
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MemoryRecord {
    pub id: String,
    pub kind: MemoryKind,
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ScoredMemory {
    pub record: MemoryRecord,
    /// Higher is more relevant. Only used for ranking.
    pub score: f32,
}

/// Retrieval collaborator. Results are injected into prompts as plain text.
pub trait MemoryStore: Send + Sync {
    fn query<'a>(&'a self, text: &'a str) -> BoxFuture<'a, anyhow::Result<Vec<ScoredMemory>>>;

    fn store<'a>(
        &'a self,
        kind: MemoryKind,
        content: &'a str,
        metadata: serde_json::Value,
    ) -> BoxFuture<'a, anyhow::Result<String>>;
}

/// Formats ranked memories for a prompt section, best first.
pub fn render_memories(memories: &[ScoredMemory]) -> String {
    let mut sorted: Vec<&ScoredMemory> = memories.iter().collect();
    sorted.sort_by(|a, b| b.score.total_cmp(&a.score));
    let lines: Vec<String> = sorted
        .iter()
        .map(|m| format!("- [{:?}] {}", m.record.kind, m.record.content))
        .collect();
    lines.join("\n")
}

/// Store that remembers nothing. Used when no retrieval backend is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMemory;

impl MemoryStore for NullMemory {
    fn query<'a>(&'a self, _text: &'a str) -> BoxFuture<'a, anyhow::Result<Vec<ScoredMemory>>> {
        Box::pin(async { Ok(vec![]) })
    }

    fn store<'a>(
        &'a self,
        _kind: MemoryKind,
        _content: &'a str,
        _metadata: serde_json::Value,
    ) -> BoxFuture<'a, anyhow::Result<String>> {
        Box::pin(async { Ok(String::new()) })
    }
}

fn words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(str::to_lowercase)
        .collect()
}

/// In-process store ranking records by word overlap with the query (no embedding model needed).
#[derive(Debug)]
pub struct WordOverlapMemory {
    records: Mutex<Vec<MemoryRecord>>,
    pub top_k: usize,
    /// Oldest records are evicted past this many.
    pub capacity: usize,
}

impl Default for WordOverlapMemory {
    fn default() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            top_k: 5,
            capacity: 512,
        }
    }
}

impl WordOverlapMemory {
    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn records(&self) -> Vec<MemoryRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn rank(&self, text: &str) -> anyhow::Result<Vec<ScoredMemory>> {
        let query = words(text);
        if query.is_empty() {
            return Ok(vec![]);
        }
        let records = self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store poisoned"))?;

        let mut scored: Vec<ScoredMemory> = records
            .iter()
            .filter_map(|r| {
                let overlap = words(&r.content).intersection(&query).count();
                (overlap > 0).then(|| ScoredMemory {
                    record: r.clone(),
                    score: overlap as f32 / query.len() as f32,
                })
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(self.top_k);
        Ok(scored)
    }
}

impl MemoryStore for WordOverlapMemory {
    fn query<'a>(&'a self, text: &'a str) -> BoxFuture<'a, anyhow::Result<Vec<ScoredMemory>>> {
        Box::pin(async move { self.rank(text) })
    }

    fn store<'a>(
        &'a self,
        kind: MemoryKind,
        content: &'a str,
        metadata: serde_json::Value,
    ) -> BoxFuture<'a, anyhow::Result<String>> {
        Box::pin(async move {
            let mut records = self
                .records
                .lock()
                .map_err(|_| anyhow::anyhow!("memory store poisoned"))?;
            let id = format!("mem-{}", chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default());
            let id = format!("{id}-{}", records.len());
            records.push(MemoryRecord {
                id: id.clone(),
                kind,
                content: content.to_string(),
                metadata,
            });
            while records.len() > self.capacity {
                records.remove(0);
            }
            Ok(id)
        })
    }
}
