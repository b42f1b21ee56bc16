use anyhow::Context;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::agent::BoxFuture;
use crate::agent::history::{Speaker, Turn};
use crate::agent::oracle::Oracle;
use crate::config::ModelProfile;

/// Separates turns in a single-prompt rendering; generation is cut at the first one.
pub const STOP_SEQUENCE: &str = "***";

/// Role the model answers as in a single-prompt rendering.
const MODEL_ROLE: &str = "assistant";

/// Minimal config for an Ollama-style `POST /api/generate` endpoint.
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    /// Full endpoint URL, e.g. `http://127.0.0.1:11434/api/generate`.
    pub endpoint: String,
    pub model: String,
}

impl From<&ModelProfile> for OllamaConfig {
    fn from(profile: &ModelProfile) -> Self {
        Self {
            endpoint: profile.endpoint.clone(),
            model: profile.model.clone(),
        }
    }
}

#[derive(Serialize)]
struct OllamaOptions<'a> {
    stop: [&'a str; 1],
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: OllamaOptions<'a>,
}

#[derive(Deserialize)]
struct OllamaResponse {
    response: String,
}

/// Flattens a system prompt and turns into one completion prompt.
///
/// Every segment ends with [`STOP_SEQUENCE`]; the prompt ends with the model's role cue unless the
/// last turn was already the model's own.
pub fn to_single_prompt(turns: &[Turn], system_prompt: &str) -> String {
    let mut prompt = String::new();
    if !system_prompt.is_empty() {
        prompt.push_str(system_prompt);
        prompt.push_str(STOP_SEQUENCE);
    }
    let mut last_role = "";
    for turn in turns {
        last_role = match &turn.speaker {
            Speaker::Agent(_) => MODEL_ROLE,
            other => other.identity(),
        };
        prompt.push_str(&format!("{last_role}: {}{STOP_SEQUENCE}", turn.text));
    }
    if last_role != MODEL_ROLE {
        prompt.push_str(MODEL_ROLE);
        prompt.push_str(": ");
    }
    prompt
}

/// Generation up to the first stop sequence.
pub fn cut_at_stop(text: &str) -> &str {
    match text.find(STOP_SEQUENCE) {
        Some(idx) => &text[..idx],
        None => text,
    }
}

/// Sends a prompt to an Ollama-style generate endpoint and returns the raw response text.
pub async fn query_ollama_generate(
    client: &Client,
    prompt: &str,
    cfg: &OllamaConfig,
) -> anyhow::Result<String> {
    let request = OllamaRequest {
        model: &cfg.model,
        prompt,
        stream: false,
        options: OllamaOptions {
            stop: [STOP_SEQUENCE],
        },
    };

    let res = client
        .post(&cfg.endpoint)
        .json(&request)
        .send()
        .await
        .context("ollama request failed")?
        .error_for_status()
        .context("ollama non-2xx response")?
        .json::<OllamaResponse>()
        .await
        .context("ollama response decode failed")?;

    Ok(res.response)
}

/// Reference [`Oracle`] backed by an Ollama-style endpoint.
pub struct OllamaOracle {
    client: Client,
    cfg: OllamaConfig,
}

impl OllamaOracle {
    pub fn new(cfg: OllamaConfig) -> Self {
        Self {
            client: Client::new(),
            cfg,
        }
    }
}

impl Oracle for OllamaOracle {
    fn send_request<'a>(
        &'a self,
        turns: &'a [Turn],
        system_prompt: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<String>> {
        Box::pin(async move {
            let prompt = to_single_prompt(turns, system_prompt);
            tracing::debug!(model = %self.cfg.model, chars = prompt.len(), "llm.request");
            let text = query_ollama_generate(&self.client, &prompt, &self.cfg)
                .await
                .with_context(|| format!("model {}", self.cfg.model))?;
            Ok(cut_at_stop(&text).to_string())
        })
    }
}
