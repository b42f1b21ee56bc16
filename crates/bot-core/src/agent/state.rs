use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Mutex;

use super::commands::CommandRegistry;
use super::executor::Executor;
use super::game_api::World;
use super::goal::{Agenda, Goal, GoalOutcome};
use super::history::{HistoryLog, Speaker, Summarizer, summarize_if_needed};
use super::memory::MemoryStore;
use super::oracle::Oracle;
use super::plan::ActionLogEntry;

/// Outcomes older than this are dropped from the goal-scoring prompt and the saved history.
pub const LAST_GOALS_KEPT: usize = 8;

/// Upper bounds for every oracle retry loop. Each bound is a count of oracle queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryLimits {
    pub scoring_attempts: u32,
    pub plan_attempts: u32,
    /// Initial refinement request plus corrective retries.
    pub refine_attempts: u32,
    pub verdict_attempts: u32,
    /// Resolver queries before escalating to the conversation loop.
    pub hallucination_attempts: u32,
    /// Refinement splices allowed in one goal cycle.
    pub max_refinements: u32,
}

impl Default for RetryLimits {
    fn default() -> Self {
        Self {
            scoring_attempts: 5,
            plan_attempts: 5,
            refine_attempts: 3,
            verdict_attempts: 5,
            hallucination_attempts: 10,
            max_refinements: 16,
        }
    }
}

impl RetryLimits {
    /// Names of limits set to zero, which would make a loop unable to ever succeed.
    pub fn zero_limits(&self) -> Vec<&'static str> {
        let named = [
            ("scoring_attempts", self.scoring_attempts),
            ("plan_attempts", self.plan_attempts),
            ("refine_attempts", self.refine_attempts),
            ("verdict_attempts", self.verdict_attempts),
            ("hallucination_attempts", self.hallucination_attempts),
        ];
        named
            .into_iter()
            .filter(|(_, v)| *v == 0)
            .map(|(n, _)| n)
            .collect()
    }
}

/// Cross-loop signals. Shared between the planning loop, the message loop and the runner.
#[derive(Debug, Default)]
pub struct AgentFlags {
    interrupt: AtomicBool,
    shut_up: AtomicBool,
    shutdown: AtomicBool,
    executing: AtomicBool,
}

impl AgentFlags {
    pub fn request_interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    /// Reads and clears the interrupt flag.
    pub fn take_interrupt(&self) -> bool {
        self.interrupt.swap(false, Ordering::SeqCst)
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    pub fn shut_up(&self) {
        self.shut_up.store(true, Ordering::SeqCst);
    }

    pub fn clear_shut_up(&self) {
        self.shut_up.store(false, Ordering::SeqCst);
    }

    pub fn is_shut_up(&self) -> bool {
        self.shut_up.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn is_executing(&self) -> bool {
        self.executing.load(Ordering::SeqCst)
    }

    pub(crate) fn executing_flag(&self) -> &AtomicBool {
        &self.executing
    }
}

/// History plus the goal outcomes persisted next to it.
#[derive(Debug)]
pub struct Journal {
    history: HistoryLog,
    last_goals: Vec<GoalOutcome>,
}

pub type SharedJournal = Arc<Mutex<Journal>>;

impl Journal {
    pub fn new(history: HistoryLog) -> Self {
        Self {
            history,
            last_goals: Vec::new(),
        }
    }

    /// Restores a previous session from the history store.
    pub fn restore(mut history: HistoryLog) -> anyhow::Result<Self> {
        let mut last_goals = history.load()?;
        if last_goals.len() > LAST_GOALS_KEPT {
            last_goals.drain(..last_goals.len() - LAST_GOALS_KEPT);
        }
        Ok(Self {
            history,
            last_goals,
        })
    }

    pub fn shared(self) -> SharedJournal {
        Arc::new(Mutex::new(self))
    }

    pub fn history(&self) -> &HistoryLog {
        &self.history
    }

    /// Appends without summarizing. Only for the final turn written on shutdown.
    pub fn add_system(&mut self, text: impl Into<String>) {
        self.history.add(Speaker::System, text);
    }

    /// Appends a turn, folds the oldest turns into memory once the log is over its limit, then
    /// saves. Conversation and planning turns all go through here.
    pub async fn append(&mut self, speaker: Speaker, text: impl Into<String>, summarizer: &dyn Summarizer) {
        self.history.add(speaker, text);
        if let Err(err) = summarize_if_needed(&mut self.history, summarizer).await {
            tracing::warn!(error = %format!("{err:#}"), "agent.history.summarize_failed");
        }
        self.save_logged();
    }

    pub fn last_goals(&self) -> &[GoalOutcome] {
        &self.last_goals
    }

    pub fn record_outcome(&mut self, outcome: GoalOutcome) {
        self.last_goals.push(outcome);
        if self.last_goals.len() > LAST_GOALS_KEPT {
            self.last_goals.remove(0);
        }
    }

    pub fn save(&self) -> anyhow::Result<()> {
        self.history.save(&self.last_goals)
    }

    /// Saves, logging instead of failing. History persistence never stops the agent.
    pub fn save_logged(&self) {
        if let Err(err) = self.save() {
            tracing::warn!(error = %format!("{err:#}"), "agent.history.save_failed");
        }
    }
}

/// Profile settings the agent components read at runtime.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Narrate the oracle's full message instead of `*used <command>*`.
    pub verbose_commands: bool,
    pub blueprints: Vec<String>,
    /// Pause after an abandoned cycle before selecting the next goal.
    pub error_backoff: Duration,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            verbose_commands: false,
            blueprints: Vec::new(),
            error_backoff: Duration::from_secs(2),
        }
    }
}

/// Handles every agent component needs. Cloning is cheap.
#[derive(Clone)]
pub struct AgentServices {
    pub name: String,
    pub oracle: Arc<dyn Oracle>,
    pub registry: Arc<CommandRegistry>,
    pub world: Arc<dyn World>,
    pub memory: Arc<dyn MemoryStore>,
    pub flags: Arc<AgentFlags>,
    pub journal: SharedJournal,
    pub executor: Arc<Executor>,
    pub limits: RetryLimits,
    pub settings: AgentSettings,
}

impl AgentServices {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        oracle: Arc<dyn Oracle>,
        registry: Arc<CommandRegistry>,
        world: Arc<dyn World>,
        memory: Arc<dyn MemoryStore>,
        journal: SharedJournal,
        limits: RetryLimits,
        settings: AgentSettings,
    ) -> Self {
        let flags = Arc::new(AgentFlags::default());
        let executor = Arc::new(Executor::new(registry.clone(), flags.clone()));
        Self {
            name: name.into(),
            oracle,
            registry,
            world,
            memory,
            flags,
            journal,
            executor,
            limits,
            settings,
        }
    }

    pub fn agent_speaker(&self) -> Speaker {
        Speaker::Agent(self.name.clone())
    }
}

impl std::fmt::Debug for AgentServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentServices")
            .field("name", &self.name)
            .field("registry", &self.registry)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

/// Planning state owned by the planning loop.
#[derive(Debug, Clone, Default)]
pub struct AgentState {
    pub agenda: Agenda,
    pub current_goal: Option<Goal>,
    /// Steps executed for the current goal. Reset when a new goal is selected.
    pub action_log: Vec<ActionLogEntry>,
    pub refinements: u32,
}

impl AgentState {
    pub fn new(agenda: Agenda) -> Self {
        Self {
            agenda,
            ..Self::default()
        }
    }

    pub fn begin_goal(&mut self, goal: Goal) {
        self.current_goal = Some(goal);
        self.action_log.clear();
        self.refinements = 0;
    }

    /// Clears the current goal, returning it.
    pub fn end_goal(&mut self) -> Option<Goal> {
        self.current_goal.take()
    }
}
