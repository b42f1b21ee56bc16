//! Scripted fakes shared by the agent tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};

use super::commands::{CommandHandler, CommandRegistry};
use super::game_api::World;
use super::history::{HistoryConfig, HistoryLog, InMemoryHistoryStore, Turn};
use super::memory::NullMemory;
use super::oracle::Oracle;
use super::state::{AgentServices, AgentSettings, Journal, RetryLimits};
use super::wire::ArgValue;
use super::BoxFuture;

/// Oracle that replays queued responses in order and records every system prompt it was sent.
#[derive(Default)]
pub struct ScriptedOracle {
    responses: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
    /// Returned once the queue runs dry; without it an empty queue is an error.
    fallback: Mutex<Option<String>>,
}

impl ScriptedOracle {
    pub fn with_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let oracle = Self::default();
        for r in responses {
            oracle.push_response(r);
        }
        oracle
    }

    pub fn push_response(&self, response: impl Into<String>) {
        self.responses.lock().unwrap().push_back(response.into());
    }

    pub fn always(&self, response: impl Into<String>) {
        *self.fallback.lock().unwrap() = Some(response.into());
    }

    pub fn prompt_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.prompts.lock().unwrap().last().cloned()
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().unwrap().len()
    }
}

impl Oracle for ScriptedOracle {
    fn send_request<'a>(
        &'a self,
        turns: &'a [Turn],
        system_prompt: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<String>> {
        Box::pin(async move {
            let mut prompt = system_prompt.to_string();
            if !turns.is_empty() {
                prompt.push_str("\n[TURNS]\n");
                prompt.push_str(&super::history::stringify_turns(turns));
            }
            self.prompts.lock().unwrap().push(prompt);
            if let Some(next) = self.responses.lock().unwrap().pop_front() {
                return Ok(next);
            }
            self.fallback
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| anyhow::anyhow!("no oracle response queued"))
        })
    }
}

#[derive(Default)]
pub struct FakeWorld {
    chats: Mutex<Vec<String>>,
    interrupts: AtomicUsize,
    behavior: Mutex<String>,
}

impl FakeWorld {
    pub fn chats(&self) -> Vec<String> {
        self.chats.lock().unwrap().clone()
    }

    pub fn interrupt_count(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }

    pub fn push_behavior(&self, line: &str) {
        let mut log = self.behavior.lock().unwrap();
        log.push_str(line);
        log.push('\n');
    }
}

impl World for FakeWorld {
    fn chat<'a>(&'a self, message: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            self.chats.lock().unwrap().push(message.to_string());
            Ok(())
        })
    }

    fn request_interrupt<'a>(&'a self) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            self.interrupts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn flush_behavior_log<'a>(&'a self) -> BoxFuture<'a, anyhow::Result<String>> {
        Box::pin(async move { Ok(std::mem::take(&mut *self.behavior.lock().unwrap())) })
    }
}

pub struct EchoHandler;

impl CommandHandler for EchoHandler {
    fn perform<'a>(
        &'a self,
        _world: &'a dyn World,
        args: &'a [ArgValue],
    ) -> BoxFuture<'a, anyhow::Result<Option<String>>> {
        Box::pin(async move { Ok(Some(format!("ran with {} args", args.len()))) })
    }
}

/// Always reports the same output. Used for query commands such as `!stats`.
pub struct FixedHandler(pub Option<String>);

impl FixedHandler {
    pub fn text(text: &str) -> Self {
        Self(Some(text.to_string()))
    }
}

impl CommandHandler for FixedHandler {
    fn perform<'a>(
        &'a self,
        _world: &'a dyn World,
        _args: &'a [ArgValue],
    ) -> BoxFuture<'a, anyhow::Result<Option<String>>> {
        Box::pin(async move { Ok(self.0.clone()) })
    }
}

/// Replays queued outputs and records the arguments of every call.
#[derive(Default)]
pub struct ScriptedHandler {
    outputs: Mutex<VecDeque<Option<String>>>,
    calls: Mutex<Vec<Vec<ArgValue>>>,
}

impl ScriptedHandler {
    pub fn with_outputs(outputs: Vec<Option<&str>>) -> Self {
        let handler = Self::default();
        handler
            .outputs
            .lock()
            .unwrap()
            .extend(outputs.into_iter().map(|o| o.map(str::to_string)));
        handler
    }

    pub fn calls(&self) -> Vec<Vec<ArgValue>> {
        self.calls.lock().unwrap().clone()
    }
}

impl CommandHandler for ScriptedHandler {
    fn perform<'a>(
        &'a self,
        _world: &'a dyn World,
        args: &'a [ArgValue],
    ) -> BoxFuture<'a, anyhow::Result<Option<String>>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(args.to_vec());
            Ok(self.outputs.lock().unwrap().pop_front().flatten())
        })
    }
}

/// Sleeps before reporting, so a dispatch stays in flight long enough to be interrupted.
pub struct SlowHandler {
    pub delay: std::time::Duration,
    pub output: String,
}

impl SlowHandler {
    pub fn new(delay: std::time::Duration, output: &str) -> Self {
        Self {
            delay,
            output: output.to_string(),
        }
    }
}

impl CommandHandler for SlowHandler {
    fn perform<'a>(
        &'a self,
        _world: &'a dyn World,
        _args: &'a [ArgValue],
    ) -> BoxFuture<'a, anyhow::Result<Option<String>>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            Ok(Some(self.output.clone()))
        })
    }
}

pub fn services(oracle: Arc<ScriptedOracle>) -> AgentServices {
    services_with(oracle, CommandRegistry::new(), Arc::new(FakeWorld::default()))
}

/// Services over an in-memory history, no retrieval memory and default retry limits.
pub fn services_with(
    oracle: Arc<ScriptedOracle>,
    registry: CommandRegistry,
    world: Arc<FakeWorld>,
) -> AgentServices {
    let history = HistoryLog::new(HistoryConfig::default(), Box::new(InMemoryHistoryStore::default()));
    AgentServices::new(
        "civbot",
        oracle,
        Arc::new(registry),
        world,
        Arc::new(NullMemory),
        Journal::new(history).shared(),
        RetryLimits::default(),
        AgentSettings {
            error_backoff: std::time::Duration::ZERO,
            ..AgentSettings::default()
        },
    )
}
