use std::sync::Arc;

use super::error::{AgentError, AgentResult};
use super::executor::narrate;
use super::game_api::clean_chat;
use super::history::{Speaker, Summarizer, Turn};
use super::oracle::Oracle;
use super::prompt::{PromptData, render};
use super::state::AgentServices;
use super::wire::{contains_command, parse_invocation, trunc_command_message};
use super::BoxFuture;

/// Server broadcasts that are not addressed to the agent.
pub const IGNORED_PREFIXES: &[&str] = &[
    "Set own game mode to",
    "Set the time to",
    "Set the difficulty to",
    "Teleported ",
    "Set the weather to",
    "Gamerule ",
];

/// Behavior logs longer than this keep only their tail.
pub const MAX_BEHAVIOR_LOG: usize = 500;

#[derive(Debug, Clone)]
pub struct ConversationConfig {
    /// System prompt template for replies (may use placeholders such as `$CONVO`).
    pub conversing: String,
    /// Template used to fold old turns into the running memory.
    pub saving_memory: String,
    /// Responses per message. `None` is unbounded.
    pub max_commands: Option<usize>,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            conversing: "You are a playful Minecraft bot named $NAME that can converse with players, see, move, mine, build, and interact with the world by using commands. Act human-like as if you were a typical Minecraft player, rather than an AI. Be very brief in your responses, don't apologize constantly, don't give instructions or make lists unless asked. $MEMORY\n$STATS\n$INVENTORY\n$COMMAND_DOCS\nConversation Begin:".to_string(),
            saving_memory: "You are a minecraft bot named $NAME that has been talking and playing minecraft by using commands. Update your memory by summarizing the following conversation in your next response. Store information that will help you improve as a Minecraft bot. Compress useful information, and do not exceed 500 characters.\nOld Memory: '$MEMORY'\nRecent conversation: \n$TO_SUMMARIZE\nSummarize your old memory and recent conversation into a new memory, and respond only with the memory text: ".to_string(),
            max_commands: None,
        }
    }
}

/// Summarizer that renders the memory-saving template and asks the oracle for the new memory.
pub struct OracleSummarizer {
    oracle: Arc<dyn Oracle>,
    name: String,
    template: String,
}

impl OracleSummarizer {
    pub fn new(oracle: Arc<dyn Oracle>, name: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            oracle,
            name: name.into(),
            template: template.into(),
        }
    }
}

impl Summarizer for OracleSummarizer {
    fn summarize<'a>(
        &'a self,
        memory: &'a str,
        turns: &'a [Turn],
    ) -> BoxFuture<'a, anyhow::Result<String>> {
        Box::pin(async move {
            let data = PromptData {
                name: Some(self.name.clone()),
                memory: Some(memory.to_string()),
                to_summarize: Some(turns.to_vec()),
                ..PromptData::default()
            };
            let prompt = render(&self.template, &data).into_text();
            let summary = self.oracle.send_request(&[], &prompt).await?;
            Ok(summary.trim().to_string())
        })
    }
}

fn tail_behavior_log(log: &str) -> String {
    let count = log.chars().count();
    if count <= MAX_BEHAVIOR_LOG {
        return log.trim_end().to_string();
    }
    let tail: String = log.chars().skip(count - MAX_BEHAVIOR_LOG).collect();
    format!("...{}", tail.trim_end())
}

/// Replies to chat messages and runs the commands the replies contain.
pub struct Conversation {
    services: AgentServices,
    cfg: ConversationConfig,
    summarizer: OracleSummarizer,
}

impl Conversation {
    pub fn new(services: AgentServices, cfg: ConversationConfig) -> Self {
        let summarizer = OracleSummarizer::new(
            services.oracle.clone(),
            services.name.clone(),
            cfg.saving_memory.clone(),
        );
        Self {
            services,
            cfg,
            summarizer,
        }
    }

    fn ignored(&self, source: &str, message: &str) -> bool {
        source == self.services.name || IGNORED_PREFIXES.iter().any(|p| message.starts_with(p))
    }

    async fn record_behavior(&self) {
        let log = match self.services.world.flush_behavior_log().await {
            Ok(log) => log,
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "agent.world.behavior_log_failed");
                return;
            }
        };
        if log.trim().is_empty() {
            return;
        }
        let text = format!("Recent behaviors log: \n{}", tail_behavior_log(&log));
        self.append(Speaker::System, &text).await;
    }

    /// Summarizer folding old turns with the `saving_memory` template.
    pub fn summarizer(&self) -> &OracleSummarizer {
        &self.summarizer
    }

    async fn append(&self, speaker: Speaker, text: &str) {
        self.services
            .journal
            .lock()
            .await
            .append(speaker, text, &self.summarizer)
            .await;
    }

    async fn respond(&self) -> AgentResult<String> {
        let mut data = PromptData::gather(&self.services, &self.cfg.conversing).await;
        let turns = {
            let journal = self.services.journal.lock().await;
            journal.history().turns().to_vec()
        };
        data.convo = Some(turns.clone());
        let prompt = render(&self.cfg.conversing, &data).into_text();
        self.services
            .oracle
            .send_request(&turns, &prompt)
            .await
            .map_err(AgentError::Oracle)
    }

    /// Handles one incoming message. Returns whether any command ran.
    ///
    /// `max_responses` overrides the profile's `max_commands`.
    pub async fn handle_message(
        &self,
        source: &str,
        message: &str,
        max_responses: Option<usize>,
    ) -> AgentResult<bool> {
        if message.trim().is_empty() {
            tracing::warn!(source, "agent.convo.empty_message");
            return Ok(false);
        }
        if self.ignored(source, message) {
            return Ok(false);
        }

        let speaker = Speaker::from_identity(source, &self.services.name);
        let from_user = matches!(speaker, Speaker::User(_));
        // Read before the first reply: gathering prompt data can wait on the running action.
        let busy_on_arrival = self.services.executor.is_executing();
        if from_user {
            self.services.flags.clear_shut_up();
        }
        tracing::info!(source, "agent.convo.message");

        self.record_behavior().await;
        self.append(speaker, message).await;

        let flags = &self.services.flags;
        let max = max_responses.or(self.cfg.max_commands).unwrap_or(usize::MAX);
        let mut used_command = false;

        for _ in 0..max {
            if flags.is_shut_up() || flags.is_shutdown() {
                tracing::debug!("agent.convo.silenced");
                break;
            }
            let res = self.respond().await?;

            let Some(command) = contains_command(&res) else {
                tracing::debug!("agent.convo.reply");
                self.append(self.services.agent_speaker(), &res).await;
                self.services
                    .world
                    .chat(&clean_chat(&res))
                    .await
                    .map_err(AgentError::World)?;
                break;
            };

            let cleaned = trunc_command_message(&res);
            self.append(self.services.agent_speaker(), &cleaned).await;
            if !self.services.registry.exists(&command) {
                tracing::warn!(command = %command, "agent.convo.hallucinated");
                self.append(Speaker::System, &format!("Command {command} does not exist."))
                    .await;
                continue;
            }
            let invocation = match parse_invocation(&cleaned) {
                Ok(inv) => inv,
                Err(err) => {
                    self.append(Speaker::System, &format!("Command {command} could not be parsed: {err}"))
                        .await;
                    continue;
                }
            };

            // User requests take over from whatever the planning loop is doing.
            if from_user && (busy_on_arrival || self.services.executor.is_executing()) {
                flags.request_interrupt();
                if let Err(err) = self.services.world.request_interrupt().await {
                    tracing::warn!(error = %format!("{err:#}"), "agent.world.interrupt_failed");
                }
            }

            narrate(
                self.services.world.as_ref(),
                &cleaned,
                &command,
                self.services.settings.verbose_commands,
            )
            .await
            .map_err(AgentError::World)?;

            used_command = true;
            match self
                .services
                .executor
                .dispatch(&invocation, self.services.world.as_ref())
                .await
            {
                Ok(Some(output)) => self.append(Speaker::System, &output).await,
                Ok(None) => break,
                Err(err) => {
                    self.append(Speaker::System, &format!("Command {command} failed: {err:#}"))
                        .await
                }
            }
        }

        Ok(used_command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::commands::{CommandRegistry, CommandSpec, ParamKind};
    use crate::agent::testing::{
        FakeWorld, FixedHandler, ScriptedHandler, ScriptedOracle, SlowHandler, services_with,
    };
    use crate::agent::wire::Invocation;
    use std::time::Duration;

    struct Fixture {
        oracle: Arc<ScriptedOracle>,
        world: Arc<FakeWorld>,
        handler: Arc<ScriptedHandler>,
        convo: Conversation,
    }

    fn fixture(outputs: Vec<Option<&str>>, cfg: ConversationConfig) -> Fixture {
        let oracle = Arc::new(ScriptedOracle::default());
        let world = Arc::new(FakeWorld::default());
        let handler = Arc::new(ScriptedHandler::with_outputs(outputs));
        let mut reg = CommandRegistry::new();
        reg.register(
            CommandSpec::new("!goToPlayer", "Go to the given player.")
                .param("player_name", ParamKind::String, "The name of the player to go to."),
            handler.clone(),
        )
        .unwrap();
        reg.register(CommandSpec::new("!stats", "Get your bot's stats."), Arc::new(FixedHandler::text("- Health: 20 / 20")))
            .unwrap();
        reg.register(CommandSpec::new("!stop", "Force stop all actions."), Arc::new(FixedHandler::text("Agent stopped.")))
            .unwrap();
        reg.register(
            CommandSpec::new("!wait", "Wait for a while."),
            Arc::new(SlowHandler::new(Duration::from_secs(2), "Waited.")),
        )
        .unwrap();
        let services = services_with(oracle.clone(), reg, world.clone());
        Fixture {
            oracle,
            world,
            handler,
            convo: Conversation::new(services, cfg),
        }
    }

    async fn turns(f: &Fixture) -> Vec<(Speaker, String)> {
        let services = &f.convo.services;
        let journal = services.journal.lock().await;
        journal
            .history()
            .turns()
            .iter()
            .map(|t| (t.speaker.clone(), t.text.clone()))
            .collect()
    }

    #[tokio::test]
    async fn command_reply_runs_and_loops_until_done() -> anyhow::Result<()> {
        let f = fixture(vec![Some("Arrived at steve."), None], ConversationConfig::default());
        f.oracle.push_response("On my way! !goToPlayer(\"steve\") then more");
        f.oracle.push_response("!goToPlayer(\"steve\")");

        let used = f.convo.handle_message("steve", "come here", None).await?;
        assert!(used);
        assert_eq!(f.handler.calls().len(), 2);
        assert_eq!(f.world.chats(), vec!["On my way! *used goToPlayer*", "*used goToPlayer*"]);

        let t = turns(&f).await;
        assert_eq!(t[0], (Speaker::User("steve".to_string()), "come here".to_string()));
        assert_eq!(
            t[1],
            (Speaker::Agent("civbot".to_string()), "On my way! !goToPlayer(\"steve\")".to_string())
        );
        assert_eq!(t[2], (Speaker::System, "Arrived at steve.".to_string()));
        assert_eq!(t.len(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn hallucinated_command_gets_a_system_turn() -> anyhow::Result<()> {
        let f = fixture(vec![None], ConversationConfig::default());
        f.oracle.push_response("!fly(\"up\")");
        f.oracle.push_response("Sorry, I can't fly.");

        let used = f.convo.handle_message("steve", "fly!", None).await?;
        assert!(!used);
        let t = turns(&f).await;
        assert!(t.contains(&(Speaker::System, "Command !fly does not exist.".to_string())));
        assert_eq!(f.world.chats(), vec!["Sorry, I can't fly."]);
        Ok(())
    }

    #[tokio::test]
    async fn max_responses_bounds_the_loop() -> anyhow::Result<()> {
        let f = fixture(vec![Some("still going"); 10], ConversationConfig::default());
        f.oracle.always("!goToPlayer(\"steve\")");

        let used = f.convo.handle_message("system", "escalated prompt", Some(5)).await?;
        assert!(used);
        assert_eq!(f.oracle.prompt_count(), 5);
        assert_eq!(f.handler.calls().len(), 5);
        Ok(())
    }

    #[tokio::test]
    async fn own_and_server_messages_are_ignored() -> anyhow::Result<()> {
        let f = fixture(vec![], ConversationConfig::default());
        assert!(!f.convo.handle_message("civbot", "hello", None).await?);
        assert!(!f.convo.handle_message("server", "Set the time to 1000", None).await?);
        assert!(!f.convo.handle_message("steve", "   ", None).await?);
        assert_eq!(f.oracle.prompt_count(), 0);
        assert!(turns(&f).await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn shut_up_stops_replies_until_next_user_message() -> anyhow::Result<()> {
        let f = fixture(vec![], ConversationConfig::default());
        f.convo.services.flags.shut_up();
        assert!(!f.convo.handle_message("system", "status update", None).await?);
        assert_eq!(f.oracle.prompt_count(), 0);

        f.oracle.push_response("hi steve");
        f.convo.handle_message("steve", "hello", None).await?;
        assert_eq!(f.oracle.prompt_count(), 1);
        assert!(!f.convo.services.flags.is_shut_up());
        Ok(())
    }

    #[tokio::test]
    async fn prompt_renders_profile_placeholders() -> anyhow::Result<()> {
        let cfg = ConversationConfig {
            conversing: "You are $NAME. $STATS $UNKNOWN_THING".to_string(),
            ..ConversationConfig::default()
        };
        let f = fixture(vec![], cfg);
        f.world.push_behavior("Self defense: killed zombie");
        f.oracle.push_response("ok");
        f.convo.handle_message("steve", "status?", None).await?;

        let sent = f.oracle.last_prompt().unwrap_or_default();
        assert!(sent.starts_with("You are civbot. - Health: 20 / 20 $UNKNOWN_THING"));
        let t = turns(&f).await;
        assert!(t[0].1.starts_with("Recent behaviors log: \nSelf defense: killed zombie"));
        Ok(())
    }

    #[tokio::test]
    async fn long_histories_are_summarized() -> anyhow::Result<()> {
        let f = fixture(vec![], ConversationConfig::default());
        for i in 0..7 {
            f.oracle.push_response(format!("reply {i}"));
            f.convo.handle_message("steve", &format!("message {i}"), None).await?;
        }
        // The reply to the eighth message is the 16th turn, one past the default limit.
        f.oracle.push_response("reply 7");
        f.oracle.push_response("summary of the first turns");
        f.convo.handle_message("steve", "message 7", None).await?;

        let journal = f.convo.services.journal.lock().await;
        assert_eq!(journal.history().memory(), "summary of the first turns");
        assert_eq!(journal.history().len(), 11);
        assert_eq!(journal.history().turns()[0].text, "reply 2");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn user_command_interrupts_the_running_action() -> anyhow::Result<()> {
        let f = fixture(vec![], ConversationConfig::default());
        f.oracle.push_response("!stop");
        let services = &f.convo.services;
        let wait = Invocation {
            name: "!wait".to_string(),
            args: vec![],
        };

        let (waited, used) = tokio::join!(services.executor.dispatch(&wait, services.world.as_ref()), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            f.convo.handle_message("steve", "stop what you are doing", Some(1)).await
        });
        assert_eq!(waited?, Some("Waited.".to_string()));
        assert!(used?);
        assert!(services.flags.is_interrupted());
        assert_eq!(f.world.interrupt_count(), 1);
        assert!(turns(&f).await.contains(&(Speaker::System, "Agent stopped.".to_string())));
        Ok(())
    }

    #[tokio::test]
    async fn idle_executor_is_not_interrupted() -> anyhow::Result<()> {
        let f = fixture(vec![], ConversationConfig::default());
        f.oracle.push_response("!stop");
        assert!(f.convo.handle_message("steve", "stop", Some(1)).await?);
        assert!(!f.convo.services.flags.is_interrupted());
        assert_eq!(f.world.interrupt_count(), 0);
        Ok(())
    }

    #[test]
    fn behavior_log_keeps_tail() {
        let long = "x".repeat(MAX_BEHAVIOR_LOG + 20);
        let out = tail_behavior_log(&long);
        assert!(out.starts_with("..."));
        assert_eq!(out.chars().count(), MAX_BEHAVIOR_LOG + 3);
    }
}
