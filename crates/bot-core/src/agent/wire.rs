use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const COMMAND_PREFIX: char = '!';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("no command invocation found")]
    MissingCommand,
    #[error("unterminated argument list for {0}")]
    UnterminatedArgs(String),
    #[error("unterminated string argument for {0}")]
    UnterminatedString(String),
    #[error("empty argument at position {position} for {name}")]
    EmptyArgument { name: String, position: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ArgValue {
    fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if let Some(inner) = raw.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
            return ArgValue::Str(inner.to_string());
        }
        match raw {
            "true" => return ArgValue::Bool(true),
            "false" => return ArgValue::Bool(false),
            _ => {}
        }
        if let Ok(v) = raw.parse::<i64>() {
            return ArgValue::Int(v);
        }
        if let Ok(v) = raw.parse::<f64>() {
            return ArgValue::Float(v);
        }
        // Oracles regularly drop the quotes around block and item names.
        ArgValue::Str(raw.to_string())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ArgValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ArgValue::Int(v) => Some(*v as f64),
            ArgValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ArgValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Bool(v) => write!(f, "{v}"),
            ArgValue::Int(v) => write!(f, "{v}"),
            ArgValue::Float(v) => write!(f, "{v}"),
            ArgValue::Str(v) => write!(f, "\"{v}\""),
        }
    }
}

/// A command invocation extracted from free text: `!name` or `!name(arg, ...)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub name: String,
    #[serde(default)]
    pub args: Vec<ArgValue>,
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if self.args.is_empty() {
            return Ok(());
        }
        let args: Vec<String> = self.args.iter().map(ToString::to_string).collect();
        write!(f, "({})", args.join(", "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: usize,
    name_end: usize,
}

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn find_command(text: &str) -> Option<Span> {
    let mut iter = text.char_indices().peekable();
    while let Some((i, c)) = iter.next() {
        if c != COMMAND_PREFIX {
            continue;
        }
        let Some(&(_, next)) = iter.peek() else {
            return None;
        };
        if !is_name_start(next) {
            continue;
        }
        let rest = &text[i + 1..];
        let len = rest
            .char_indices()
            .find(|(_, c)| !is_name_char(*c))
            .map(|(j, _)| j)
            .unwrap_or(rest.len());
        return Some(Span {
            start: i,
            name_end: i + 1 + len,
        });
    }
    None
}

/// Byte offset one past the closing paren of an argument list starting at `open`.
fn find_args_end(text: &str, open: usize) -> Option<usize> {
    let mut in_string = false;
    for (j, c) in text[open..].char_indices() {
        match c {
            '"' => in_string = !in_string,
            ')' if !in_string => return Some(open + j + 1),
            '\n' if !in_string => return None,
            _ => {}
        }
    }
    None
}

/// Returns the first `!name` token in `text`, including the prefix.
pub fn contains_command(text: &str) -> Option<String> {
    let span = find_command(text)?;
    Some(text[span.start..span.name_end].to_string())
}

/// Byte offset of the first command token, if any.
pub fn command_index(text: &str) -> Option<usize> {
    find_command(text).map(|s| s.start)
}

/// Cuts `text` right after the first invocation; anything the oracle wrote afterwards is ignored.
pub fn trunc_command_message(text: &str) -> String {
    let Some(span) = find_command(text) else {
        return text.to_string();
    };
    let end = if text[span.name_end..].starts_with('(') {
        find_args_end(text, span.name_end).unwrap_or(span.name_end)
    } else {
        span.name_end
    };
    text[..end].to_string()
}

fn split_args(raw: &str, name: &str) -> Result<Vec<String>, WireError> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut in_string = false;
    for c in raw.chars() {
        match c {
            '"' => {
                in_string = !in_string;
                cur.push(c);
            }
            ',' if !in_string => out.push(std::mem::take(&mut cur)),
            _ => cur.push(c),
        }
    }
    if in_string {
        return Err(WireError::UnterminatedString(name.to_string()));
    }
    out.push(cur);

    if out.len() == 1 && out[0].trim().is_empty() {
        return Ok(vec![]);
    }
    if let Some(position) = out.iter().position(|a| a.trim().is_empty()) {
        return Err(WireError::EmptyArgument {
            name: name.to_string(),
            position,
        });
    }
    Ok(out)
}

/// Parses the first invocation embedded in `text`.
pub fn parse_invocation(text: &str) -> Result<Invocation, WireError> {
    let span = find_command(text).ok_or(WireError::MissingCommand)?;
    let name = text[span.start..span.name_end].to_string();

    if !text[span.name_end..].starts_with('(') {
        return Ok(Invocation { name, args: vec![] });
    }

    let open = span.name_end;
    let rest = &text[open + 1..];
    let mut in_string = false;
    let mut close = None;
    for (j, c) in rest.char_indices() {
        match c {
            '"' => in_string = !in_string,
            ')' if !in_string => {
                close = Some(j);
                break;
            }
            _ => {}
        }
    }
    let Some(close) = close else {
        return Err(if in_string {
            WireError::UnterminatedString(name)
        } else {
            WireError::UnterminatedArgs(name)
        });
    };

    let args = split_args(&rest[..close], &name)?
        .iter()
        .map(|raw| ArgValue::parse(raw))
        .collect();
    Ok(Invocation { name, args })
}
