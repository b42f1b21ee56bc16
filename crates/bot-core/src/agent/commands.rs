use std::collections::HashMap;
use std::fmt::Write;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::game_api::World;
use super::wire::{ArgValue, COMMAND_PREFIX, Invocation};
use super::BoxFuture;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    Int,
    Float,
    Bool,
    String,
}

impl ParamKind {
    fn accepts(self, value: &ArgValue) -> bool {
        match self {
            ParamKind::Int => value.as_i64().is_some(),
            ParamKind::Float => value.as_f64().is_some(),
            ParamKind::Bool => value.as_bool().is_some(),
            ParamKind::String => value.as_str().is_some(),
        }
    }

    fn label(self) -> &'static str {
        match self {
            ParamKind::Int => "int",
            ParamKind::Float => "float",
            ParamKind::Bool => "boolean",
            ParamKind::String => "string",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    #[serde(default)]
    pub doc: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
}

impl CommandSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            params: vec![],
        }
    }

    pub fn param(mut self, name: impl Into<String>, kind: ParamKind, doc: impl Into<String>) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            kind,
            doc: doc.into(),
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("invalid command name {0:?}: must be '!' followed by letters, digits or '_'")]
    InvalidName(String),
    #[error("duplicate parameter {param:?} in {name}")]
    DuplicateParam { name: String, param: String },
    #[error("command {0} is already registered")]
    Duplicate(String),
    #[error("command {0} does not exist")]
    Unknown(String),
    #[error("{name} expects {expected} arguments, got {got}")]
    Arity {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("{name}: parameter {param:?} must be {expected}")]
    ArgType {
        name: String,
        param: String,
        expected: &'static str,
    },
}

/// Executes one command against the world. `Ok(None)` means the command finished with nothing to
/// report, which ends the current response cycle.
pub trait CommandHandler: Send + Sync {
    fn perform<'a>(
        &'a self,
        world: &'a dyn World,
        args: &'a [ArgValue],
    ) -> BoxFuture<'a, anyhow::Result<Option<String>>>;
}

struct Entry {
    spec: CommandSpec,
    handler: Arc<dyn CommandHandler>,
}

/// Catalogue of executable commands. Filled once at startup, read-only afterwards.
#[derive(Default)]
pub struct CommandRegistry {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.names())
            .finish()
    }
}

fn validate_name(name: &str) -> Result<(), CommandError> {
    let Some(rest) = name.strip_prefix(COMMAND_PREFIX) else {
        return Err(CommandError::InvalidName(name.to_string()));
    };
    let mut chars = rest.chars();
    let starts_ok = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !starts_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(CommandError::InvalidName(name.to_string()));
    }
    Ok(())
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        spec: CommandSpec,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<(), CommandError> {
        validate_name(&spec.name)?;
        if self.index.contains_key(&spec.name) {
            return Err(CommandError::Duplicate(spec.name));
        }
        for (i, p) in spec.params.iter().enumerate() {
            if spec.params[..i].iter().any(|q| q.name == p.name) {
                return Err(CommandError::DuplicateParam {
                    name: spec.name.clone(),
                    param: p.name.clone(),
                });
            }
        }
        self.index.insert(spec.name.clone(), self.entries.len());
        self.entries.push(Entry { spec, handler });
        Ok(())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&CommandSpec> {
        self.index.get(name).map(|&i| &self.entries[i].spec)
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.spec.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Checks an invocation against the registered schema without running it.
    pub fn validate(&self, invocation: &Invocation) -> Result<(), CommandError> {
        let spec = self
            .get(&invocation.name)
            .ok_or_else(|| CommandError::Unknown(invocation.name.clone()))?;
        if spec.params.len() != invocation.args.len() {
            return Err(CommandError::Arity {
                name: spec.name.clone(),
                expected: spec.params.len(),
                got: invocation.args.len(),
            });
        }
        for (param, arg) in spec.params.iter().zip(&invocation.args) {
            if !param.kind.accepts(arg) {
                return Err(CommandError::ArgType {
                    name: spec.name.clone(),
                    param: param.name.clone(),
                    expected: param.kind.label(),
                });
            }
        }
        Ok(())
    }

    /// Validates and runs an invocation. Schema violations come back as [`CommandError`] inside the
    /// `anyhow::Error`, handler failures as whatever the handler raised.
    pub async fn perform(
        &self,
        world: &dyn World,
        invocation: &Invocation,
    ) -> anyhow::Result<Option<String>> {
        self.validate(invocation)?;
        let idx = self.index[&invocation.name];
        self.entries[idx]
            .handler
            .perform(world, &invocation.args)
            .await
    }

    /// Catalogue text for prompts.
    pub fn docs(&self) -> String {
        let mut out = String::from(
            "\n*COMMAND DOCS\n You can use the following commands to perform actions and get information about the world. \
             Use the commands with the syntax: !commandName or !commandName(\"arg1\", 1.2, ...) if the command takes arguments.\n \
             Do not use codeblocks. Only use one command in each response, trailing commands and comments will be ignored.\n",
        );
        for entry in &self.entries {
            let spec = &entry.spec;
            let _ = writeln!(out, "{}: {}", spec.name, spec.description);
            if !spec.params.is_empty() {
                out.push_str("Params:\n");
                for p in &spec.params {
                    let _ = writeln!(out, "{}: ({}) {}", p.name, p.kind.label(), p.doc);
                }
            }
        }
        out.push('*');
        out
    }
}
