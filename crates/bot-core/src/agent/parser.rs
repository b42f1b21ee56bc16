use std::sync::LazyLock;

use regex::Regex;

use super::plan::Step;

/// Steps this long are almost always the oracle ignoring the grammar and writing prose.
pub const MAX_STEP_CHARS: usize = 200;

static NUMBERED_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:[-*]\s+)?(?:step\s+)?\d+[.)]\s*(.*)$").expect("numbered line regex")
});
static TRAILING_EXPLANATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+[-–]\s+").expect("explanation regex"));
static LEADING_CONNECTIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:first|then|next|finally|lastly|afterwards)\b,?\s*")
        .expect("connective regex")
});
static LOGIC_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^logic\s*:\s*").expect("logic prefix regex"));
static ACTION_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^action\s*:\s*").expect("action prefix regex"));
static SCORE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:GOAL:\s*)?(.+):\s*(\d+)\s*$").expect("score line regex")
});
static GOAL_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*GOAL:\s*").expect("goal prefix regex"));

fn clean_step_text(raw: &str) -> String {
    let head = TRAILING_EXPLANATION
        .split(raw)
        .next()
        .unwrap_or_default();
    let head = LEADING_CONNECTIVE.replace(head.trim(), "");
    let head = head.trim();
    head.strip_suffix('.').unwrap_or(head).trim().to_string()
}

/// Parses a numbered list (`1.` or `1)`) into steps, one per numbered line.
///
/// Unnumbered lines are ignored, so preambles and sign-offs do not leak into the plan.
pub fn parse_action_list(text: &str) -> Vec<Step> {
    let mut steps = Vec::new();
    for line in text.lines() {
        let Some(caps) = NUMBERED_LINE.captures(line) else {
            continue;
        };
        let body = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let cleaned = clean_step_text(body);
        let len = cleaned.chars().count();
        if len == 0 || len >= MAX_STEP_CHARS {
            continue;
        }

        if let Some(m) = LOGIC_PREFIX.find(&cleaned) {
            let rest = cleaned[m.end()..].trim();
            if !rest.is_empty() {
                steps.push(Step::logic(rest));
            }
            continue;
        }
        let text = match ACTION_PREFIX.find(&cleaned) {
            Some(m) => cleaned[m.end()..].trim().to_string(),
            None => cleaned,
        };
        if !text.is_empty() {
            steps.push(Step::action(text));
        }
    }
    steps
}

/// Case-insensitive comparison key for goal descriptions, ignoring a leading `GOAL:` token.
pub fn normalize_goal(description: &str) -> String {
    GOAL_PREFIX
        .replace(description, "")
        .trim()
        .to_lowercase()
}

/// Extracts `description: score` lines, returning one slot per candidate goal (in `goals` order).
///
/// Scores outside 0..=100 and descriptions that match no candidate are dropped; the first score
/// given for a goal wins.
pub fn parse_goal_scores(text: &str, goals: &[String]) -> Vec<Option<u8>> {
    let keys: Vec<String> = goals.iter().map(|g| normalize_goal(g)).collect();
    let mut scores: Vec<Option<u8>> = vec![None; goals.len()];

    for line in text.lines() {
        let Some(caps) = SCORE_LINE.captures(line) else {
            continue;
        };
        let (Some(desc), Some(score)) = (caps.get(1), caps.get(2)) else {
            continue;
        };
        let Ok(score) = score.as_str().parse::<u32>() else {
            continue;
        };
        if score > 100 {
            continue;
        }
        let key = normalize_goal(desc.as_str());
        if let Some(i) = keys.iter().position(|k| *k == key)
            && scores[i].is_none()
        {
            scores[i] = Some(score as u8);
        }
    }
    scores
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Yes,
    No,
}

const HEDGE_PREFIXES: &[&str] = &[
    "let me", "i think", "based on", "after", "given", "analysis", "answer",
];

/// Reduces a yes/no answer to a [`Verdict`]; `None` means the oracle did not answer the question.
pub fn normalize_verdict(text: &str) -> Option<Verdict> {
    let mut cleaned = text.trim().to_lowercase();
    cleaned.retain(|c| !matches!(c, '.' | ',' | '!' | '?' | ':' | ';' | '\n' | '\r'));
    let mut rest = cleaned.trim();
    for prefix in HEDGE_PREFIXES {
        if let Some(r) = rest.strip_prefix(prefix) {
            rest = r.trim();
            break;
        }
    }

    if rest.contains("yes") {
        Some(Verdict::Yes)
    } else if rest.contains("no") {
        Some(Verdict::No)
    } else {
        None
    }
}
