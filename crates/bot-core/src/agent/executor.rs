use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;

use super::commands::CommandRegistry;
use super::error::{AgentError, AgentResult};
use super::game_api::{World, clean_chat};
use super::prompt;
use super::state::{AgentFlags, AgentServices};
use super::wire::{Invocation, command_index, contains_command, parse_invocation, trunc_command_message};

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved {
        command: String,
        invocation: Invocation,
        /// Oracle text cut right after the invocation.
        cleaned_message: String,
    },
    /// The resolver gave up; `prompt` carries every accumulated warning.
    Escalated { prompt: String, attempts: u32 },
}

/// Maps a natural-language step to one registered command.
pub struct CommandResolver {
    services: AgentServices,
}

impl CommandResolver {
    pub fn new(services: AgentServices) -> Self {
        Self { services }
    }

    fn check(&self, response: &str) -> Result<(String, Invocation, String), String> {
        let Some(command) = contains_command(response) else {
            return Err("Your answer did not contain any command. Answer with exactly one command from the list.".to_string());
        };
        if !self.services.registry.exists(&command) {
            return Err(format!("You have hallucinated the following command: {command}"));
        }
        let message = trunc_command_message(response);
        let invocation = parse_invocation(&message)
            .map_err(|err| format!("Your use of {command} could not be parsed: {err}"))?;
        self.services
            .registry
            .validate(&invocation)
            .map_err(|err| format!("Your use of {command} is invalid: {err}"))?;
        Ok((command, invocation, message))
    }

    /// Queries the oracle at most `hallucination_attempts` times.
    ///
    /// Warnings accumulate in the prompt across retries, so later attempts see every earlier
    /// mistake.
    pub async fn resolve(&self, action_context: &str) -> AgentResult<Resolution> {
        let mut prompt = prompt::command_resolution(action_context, &self.services.registry.docs());
        let attempts = self.services.limits.hallucination_attempts;

        for attempt in 1..=attempts {
            let res = self
                .services
                .oracle
                .send_request(&[], &prompt)
                .await
                .map_err(AgentError::Oracle)?;
            match self.check(&res) {
                Ok((command, invocation, cleaned_message)) => {
                    tracing::debug!(command = %command, attempt, "agent.resolve.resolved");
                    return Ok(Resolution::Resolved {
                        command,
                        invocation,
                        cleaned_message,
                    });
                }
                Err(warning) => {
                    tracing::warn!(attempt, warning = %warning, "agent.resolve.rejected");
                    prompt.push_str(&prompt::resolution_warning(&warning));
                }
            }
        }
        Ok(Resolution::Escalated { prompt, attempts })
    }
}

/// Chat line announcing a command. The verbose form repeats the oracle's whole message.
pub fn narration(cleaned_message: &str, command: &str, verbose: bool) -> String {
    if verbose {
        return clean_chat(cleaned_message);
    }
    let pre = command_index(cleaned_message)
        .map(|i| cleaned_message[..i].trim())
        .unwrap_or_default();
    let used = format!("*used {}*", command.trim_start_matches('!'));
    if pre.is_empty() {
        used
    } else {
        clean_chat(&format!("{pre} {used}"))
    }
}

pub async fn narrate(
    world: &dyn World,
    cleaned_message: &str,
    command: &str,
    verbose: bool,
) -> anyhow::Result<()> {
    world.chat(&narration(cleaned_message, command, verbose)).await
}

struct ExecutingGuard<'a>(&'a AtomicBool);

impl Drop for ExecutingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Runs validated invocations one at a time.
///
/// Both the planning loop and the conversation loop dispatch through the same executor; a second
/// dispatch waits until the first has finished.
pub struct Executor {
    registry: Arc<CommandRegistry>,
    flags: Arc<AgentFlags>,
    lock: Mutex<()>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("executing", &self.flags.is_executing())
            .finish_non_exhaustive()
    }
}

impl Executor {
    pub fn new(registry: Arc<CommandRegistry>, flags: Arc<AgentFlags>) -> Self {
        Self {
            registry,
            flags,
            lock: Mutex::new(()),
        }
    }

    pub fn is_executing(&self) -> bool {
        self.flags.is_executing()
    }

    pub async fn dispatch(
        &self,
        invocation: &Invocation,
        world: &dyn World,
    ) -> anyhow::Result<Option<String>> {
        let _idle = self.lock.lock().await;
        let executing = self.flags.executing_flag();
        executing.store(true, Ordering::SeqCst);
        let _guard = ExecutingGuard(executing);

        tracing::info!(command = %invocation, "agent.command.dispatch");
        let out = self.registry.perform(world, invocation).await;
        match &out {
            Ok(result) => tracing::debug!(command = %invocation.name, result = ?result, "agent.command.done"),
            Err(err) => tracing::warn!(command = %invocation.name, error = %format!("{err:#}"), "agent.command.failed"),
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;
    use crate::agent::BoxFuture;
    use crate::agent::commands::{CommandHandler, CommandSpec, ParamKind};
    use crate::agent::testing::{EchoHandler, FakeWorld, ScriptedOracle, services_with};
    use crate::agent::wire::ArgValue;

    fn registry() -> CommandRegistry {
        let mut reg = CommandRegistry::new();
        reg.register(
            CommandSpec::new("!collectBlocks", "Collect blocks.")
                .param("type", ParamKind::String, "block type")
                .param("num", ParamKind::Int, "count"),
            Arc::new(EchoHandler),
        )
        .unwrap();
        reg.register(CommandSpec::new("!stop", "Stop."), Arc::new(EchoHandler))
            .unwrap();
        reg
    }

    fn resolver(oracle: &Arc<ScriptedOracle>) -> CommandResolver {
        CommandResolver::new(services_with(
            oracle.clone(),
            registry(),
            Arc::new(FakeWorld::default()),
        ))
    }

    #[tokio::test]
    async fn resolves_first_valid_command() -> anyhow::Result<()> {
        let oracle = Arc::new(ScriptedOracle::with_responses([
            "Sure, collecting. !collectBlocks(\"oak_log\", 4) and then !stop",
        ]));
        let res = resolver(&oracle).resolve("ACTION: Collect oak logs").await?;
        let Resolution::Resolved {
            command,
            invocation,
            cleaned_message,
        } = res
        else {
            panic!("expected a resolved command");
        };
        assert_eq!(command, "!collectBlocks");
        assert_eq!(
            invocation.args,
            vec![ArgValue::Str("oak_log".to_string()), ArgValue::Int(4)]
        );
        assert_eq!(cleaned_message, "Sure, collecting. !collectBlocks(\"oak_log\", 4)");
        Ok(())
    }

    #[tokio::test]
    async fn hallucinated_command_escalates_after_exactly_the_ceiling() -> anyhow::Result<()> {
        let oracle = Arc::new(ScriptedOracle::default());
        oracle.always("!fly");
        let resolver = resolver(&oracle);
        let ceiling = resolver.services.limits.hallucination_attempts;

        let res = resolver.resolve("ACTION: fly to the moon").await?;
        let Resolution::Escalated { prompt, attempts } = res else {
            panic!("expected escalation");
        };
        assert_eq!(attempts, ceiling);
        assert_eq!(oracle.prompt_count(), ceiling as usize);
        assert_eq!(
            prompt.matches("You have hallucinated the following command: !fly").count(),
            ceiling as usize
        );
        Ok(())
    }

    #[tokio::test]
    async fn warnings_accumulate_across_attempts() -> anyhow::Result<()> {
        let oracle = Arc::new(ScriptedOracle::with_responses([
            "I would collect some logs",
            "!collectBlocks(4, 4)",
            "!collectBlocks(\"oak_log\", 4)",
        ]));
        let res = resolver(&oracle).resolve("ACTION: Collect oak logs").await?;
        assert!(matches!(res, Resolution::Resolved { .. }));

        let last = oracle.last_prompt().unwrap_or_default();
        assert!(last.contains("did not contain any command"));
        assert!(last.contains("Your use of !collectBlocks is invalid"));
        Ok(())
    }

    #[test]
    fn narration_forms() {
        assert_eq!(
            narration("On it!\n!collectBlocks(\"oak_log\", 4)", "!collectBlocks", false),
            "On it! *used collectBlocks*"
        );
        assert_eq!(narration("!stop", "!stop", false), "*used stop*");
        assert_eq!(
            narration("On it!\n!collectBlocks(\"oak_log\", 4)", "!collectBlocks", true),
            "On it! !collectBlocks(\"oak_log\", 4)"
        );
    }

    /// Counts concurrent executions; each call lingers so overlap would be observable.
    #[derive(Default)]
    struct Slow {
        running: AtomicUsize,
        max_seen: AtomicUsize,
    }

    impl CommandHandler for Slow {
        fn perform<'a>(
            &'a self,
            _world: &'a dyn World,
            _args: &'a [ArgValue],
        ) -> BoxFuture<'a, anyhow::Result<Option<String>>> {
            Box::pin(async move {
                let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                self.running.fetch_sub(1, Ordering::SeqCst);
                Ok(None)
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dispatches_never_overlap() -> anyhow::Result<()> {
        let slow = Arc::new(Slow::default());
        let mut reg = CommandRegistry::new();
        reg.register(CommandSpec::new("!wait", "Wait."), slow.clone())?;
        let flags = Arc::new(AgentFlags::default());
        let executor = Executor::new(Arc::new(reg), flags.clone());
        let world = FakeWorld::default();
        let inv = Invocation {
            name: "!wait".to_string(),
            args: vec![],
        };

        let (a, b) = tokio::join!(executor.dispatch(&inv, &world), executor.dispatch(&inv, &world));
        a?;
        b?;
        assert_eq!(slow.max_seen.load(Ordering::SeqCst), 1);
        assert!(!flags.is_executing());
        Ok(())
    }
}
