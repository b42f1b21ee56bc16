use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, tcp::OwnedReadHalf, tcp::OwnedWriteHalf};
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

use civbot_core::agent::conversation::Conversation;
use civbot_core::agent::history::{HistoryLog, JsonFileStore};
use civbot_core::agent::memory::WordOverlapMemory;
use civbot_core::agent::state::Journal;
use civbot_core::agent::{
    AgentServices, ArgValue, BoxFuture, CommandHandler, CommandRegistry, CommandSpec, GatedOracle,
    Oracle, PlanningLoop, World,
};
use civbot_core::config::AgentProfile;
use civbot_core::llm::OllamaOracle;

const SPAWN_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const HISTORY_ROOT: &str = "bots";

struct ControlConn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ControlConn {
    async fn connect(addr: &str) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connect world control port {addr}"))?;
        let (read, write) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read),
            writer: write,
        })
    }

    async fn request_json(&mut self, req: serde_json::Value) -> anyhow::Result<serde_json::Value> {
        let line = format!("{req}\n");
        self.writer
            .write_all(line.as_bytes())
            .await
            .context("control write")?;
        self.writer.flush().await.context("control flush")?;

        let mut resp_line = String::new();
        let n = self
            .reader
            .read_line(&mut resp_line)
            .await
            .context("control read")?;
        if n == 0 {
            anyhow::bail!("world connection closed");
        }
        let v: serde_json::Value =
            serde_json::from_str(resp_line.trim()).context("invalid control json response")?;
        if v.get("ok").and_then(|v| v.as_bool()) != Some(true) {
            anyhow::bail!("world request failed: {v}");
        }
        Ok(v)
    }
}

#[derive(Debug, Deserialize)]
struct IncomingMessage {
    source: String,
    message: String,
}

/// One advertised command. `query` marks read-only commands that answer immediately.
#[derive(Debug, Deserialize)]
struct CatalogueEntry {
    #[serde(flatten)]
    spec: CommandSpec,
    #[serde(default)]
    query: bool,
}

/// World reached over a JSON-lines control port.
///
/// Long-running commands hold the action connection. Chat, interrupts, polling and query commands
/// use a second connection so they are never queued behind an action.
struct RemoteWorld {
    actions: Mutex<ControlConn>,
    control: Mutex<ControlConn>,
}

impl RemoteWorld {
    async fn connect(addr: &str) -> anyhow::Result<Self> {
        Ok(Self {
            actions: Mutex::new(ControlConn::connect(addr).await?),
            control: Mutex::new(ControlConn::connect(addr).await?),
        })
    }

    async fn control(&self, req: serde_json::Value) -> anyhow::Result<serde_json::Value> {
        self.control.lock().await.request_json(req).await
    }

    async fn catalogue(&self) -> anyhow::Result<Vec<CatalogueEntry>> {
        let v = self.control(json!({ "op": "catalogue" })).await?;
        let commands = v
            .get("commands")
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("missing commands in catalogue response"))?;
        serde_json::from_value(commands).context("decode command catalogue")
    }

    async fn poll_messages(&self) -> anyhow::Result<Vec<IncomingMessage>> {
        let v = self.control(json!({ "op": "poll_messages" })).await?;
        match v.get("messages") {
            Some(messages) => serde_json::from_value(messages.clone()).context("decode messages"),
            None => Ok(Vec::new()),
        }
    }

    async fn command(&self, name: &str, args: &[ArgValue], query: bool) -> anyhow::Result<Option<String>> {
        let req = command_request(name, args, query);
        let v = if query {
            self.control(req).await?
        } else {
            self.actions.lock().await.request_json(req).await?
        };
        Ok(v.get("result").and_then(|r| r.as_str()).map(str::to_string))
    }
}

fn command_request(name: &str, args: &[ArgValue], query: bool) -> serde_json::Value {
    let op = if query { "query" } else { "command" };
    json!({ "op": op, "name": name, "args": args })
}

impl World for RemoteWorld {
    fn chat<'a>(&'a self, message: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            self.control(json!({ "op": "chat", "message": message })).await?;
            Ok(())
        })
    }

    fn request_interrupt<'a>(&'a self) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            self.control(json!({ "op": "interrupt" })).await?;
            Ok(())
        })
    }

    fn flush_behavior_log<'a>(&'a self) -> BoxFuture<'a, anyhow::Result<String>> {
        Box::pin(async move {
            let v = self.control(json!({ "op": "behavior" })).await?;
            Ok(v.get("log").and_then(|l| l.as_str()).unwrap_or_default().to_string())
        })
    }
}

/// Forwards one catalogue command to the world that advertised it.
struct RemoteCommand {
    name: String,
    query: bool,
    world: Arc<RemoteWorld>,
}

impl CommandHandler for RemoteCommand {
    fn perform<'a>(
        &'a self,
        _world: &'a dyn World,
        args: &'a [ArgValue],
    ) -> BoxFuture<'a, anyhow::Result<Option<String>>> {
        Box::pin(async move { self.world.command(&self.name, args, self.query).await })
    }
}

fn env_override(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn load_profile() -> anyhow::Result<AgentProfile> {
    let path = env_override("CIVBOT_PROFILE").unwrap_or_else(|| "profiles/andy.toml".to_string());
    let mut profile = AgentProfile::load(&path).with_context(|| format!("load profile {path}"))?;
    if let Some(endpoint) = env_override("CIVBOT_LLM_ENDPOINT") {
        profile.model.endpoint = endpoint;
    }
    if let Some(model) = env_override("CIVBOT_LLM_MODEL") {
        profile.model.model = model;
    }
    if let Some(load) = env_override("CIVBOT_LOAD_MEMORY") {
        profile.load_memory = matches!(load.trim(), "1" | "true" | "yes");
    }
    profile.validate()?;
    Ok(profile)
}

async fn message_loop(world: &RemoteWorld, conversation: &Conversation) -> anyhow::Result<()> {
    let mut tick = tokio::time::interval(POLL_INTERVAL);
    loop {
        tick.tick().await;
        for msg in world.poll_messages().await? {
            if let Err(err) = conversation.handle_message(&msg.source, &msg.message, None).await {
                tracing::warn!(source = %msg.source, error = %err, "runner.message.failed");
            }
        }
    }
}

/// Records why the agent stopped, says goodbye and persists history.
async fn clean_kill(services: &AgentServices, reason: &str) {
    services.flags.request_shutdown();
    services
        .journal
        .lock()
        .await
        .add_system(format!("Agent process stopped: {reason}"));
    if let Err(err) = services.world.chat("Goodbye world.").await {
        tracing::warn!(error = %format!("{err:#}"), "runner.kill.chat_failed");
    }
    if let Err(err) = services.journal.lock().await.save() {
        tracing::error!(error = %format!("{err:#}"), "runner.kill.save_failed");
    }
    tracing::warn!(reason, "runner.kill");
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let profile = load_profile()?;
    let world_addr = env_override("CIVBOT_WORLD_ADDR").unwrap_or_else(|| "127.0.0.1:7878".to_string());
    tracing::info!(agent = %profile.name, world = %world_addr, model = %profile.model.model, "runner.start");

    let world = tokio::time::timeout(SPAWN_TIMEOUT, RemoteWorld::connect(&world_addr))
        .await
        .with_context(|| format!("world did not accept a connection within {SPAWN_TIMEOUT:?}"))??;
    let world = Arc::new(world);

    let mut registry = CommandRegistry::new();
    for entry in world.catalogue().await? {
        let name = entry.spec.name.clone();
        let handler = Arc::new(RemoteCommand {
            name: name.clone(),
            query: entry.query,
            world: world.clone(),
        });
        registry
            .register(entry.spec, handler)
            .with_context(|| format!("register command {name}"))?;
    }
    tracing::info!(commands = registry.len(), "runner.catalogue.loaded");

    let oracle: Arc<dyn Oracle> = Arc::new(GatedOracle::new(
        OllamaOracle::new((&profile.model).into()),
        profile.cooldown(),
    ));
    let history = HistoryLog::new(
        profile.history_config(),
        Box::new(JsonFileStore::new(HISTORY_ROOT, &profile.name)),
    );
    let journal = if profile.load_memory {
        Journal::restore(history).context("restore history")?
    } else {
        Journal::new(history)
    };

    let services = AgentServices::new(
        profile.name.clone(),
        oracle,
        Arc::new(registry),
        world.clone(),
        Arc::new(WordOverlapMemory::default()),
        journal.shared(),
        profile.retry,
        profile.settings(),
    );
    let conversation = Conversation::new(services.clone(), profile.conversation_config());
    let mut planner = PlanningLoop::new(
        services.clone(),
        Conversation::new(services.clone(), profile.conversation_config()),
        profile.initial_agenda(),
    );

    let reason = tokio::select! {
        res = planner.run() => match res {
            Ok(()) => "planning loop stopped".to_string(),
            Err(err) => format!("planning failed: {err}"),
        },
        res = message_loop(&world, &conversation) => match res {
            Ok(()) => "message loop stopped".to_string(),
            Err(err) => format!("world disconnected: {err:#}"),
        },
        _ = tokio::signal::ctrl_c() => "interrupted by signal".to_string(),
    };

    clean_kill(&services, &reason).await;
    std::process::exit(1);
}
