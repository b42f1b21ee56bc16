use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::wire::Invocation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Must map to exactly one registered command.
    Action,
    /// Evaluation checkpoint: re-assess whether earlier actions were enough.
    Logic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub kind: StepKind,
    pub text: String,
}

impl Step {
    pub fn action(text: impl Into<String>) -> Self {
        Self {
            kind: StepKind::Action,
            text: text.into(),
        }
    }

    pub fn logic(text: impl Into<String>) -> Self {
        Self {
            kind: StepKind::Logic,
            text: text.into(),
        }
    }

    pub fn is_logic(&self) -> bool {
        self.kind == StepKind::Logic
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            StepKind::Action => f.write_str(&self.text),
            StepKind::Logic => write!(f, "Logic: {}", self.text),
        }
    }
}

/// FIFO plan for the active goal. The front step is always the next one gated and executed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionList {
    steps: VecDeque<Step>,
}

impl ActionList {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            steps: steps.into_iter().collect(),
        }
    }

    pub fn front(&self) -> Option<&Step> {
        self.steps.front()
    }

    pub fn pop_front(&mut self) -> Option<Step> {
        self.steps.pop_front()
    }

    /// Replaces the front step with `refinement`, keeping every later step in place.
    pub fn splice_front(&mut self, refinement: Vec<Step>) {
        self.steps.pop_front();
        for step in refinement.into_iter().rev() {
            self.steps.push_front(step);
        }
    }

    /// Steps after the front one, in order.
    pub fn following(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().skip(1)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter()
    }
}

/// One executed (or checkpointed) step of the current goal cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionLogEntry {
    pub step: Step,
    /// `None` for logic checkpoints and escalated resolutions.
    pub command_invocation: Option<Invocation>,
    pub result: String,
}

impl fmt::Display for ActionLogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.command_invocation {
            Some(inv) => write!(f, "{} -> {} -> {}", self.step, inv, self.result),
            None => write!(f, "{} -> {}", self.step, self.result),
        }
    }
}

pub fn render_steps<'a>(steps: impl IntoIterator<Item = &'a Step>) -> String {
    let lines: Vec<String> = steps.into_iter().map(ToString::to_string).collect();
    lines.join("\n")
}

pub fn render_log(log: &[ActionLogEntry]) -> String {
    let lines: Vec<String> = log.iter().map(ToString::to_string).collect();
    lines.join("\n")
}
