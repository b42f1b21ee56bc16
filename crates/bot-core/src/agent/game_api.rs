use super::BoxFuture;

/// Boundary the agent uses to talk to the simulated world outside of command handlers.
///
/// Command handlers receive the same handle, so a single connection serves both narration and
/// physical actions.
pub trait World: Send + Sync {
    /// Posts a message to the world's chat channel.
    fn chat<'a>(&'a self, message: &'a str) -> BoxFuture<'a, anyhow::Result<()>>;

    /// Asks in-flight world actions to abort. Best effort; handlers observe it cooperatively.
    fn request_interrupt<'a>(&'a self) -> BoxFuture<'a, anyhow::Result<()>>;

    /// Drains what the agent's automatic behaviors (self defense, auto-eat, ...) did since the
    /// last call. Worlds without such behaviors report nothing.
    fn flush_behavior_log<'a>(&'a self) -> BoxFuture<'a, anyhow::Result<String>> {
        Box::pin(async { Ok(String::new()) })
    }
}

/// Chat channels split newlines into separate messages, which trips spam filters.
pub fn clean_chat(message: &str) -> String {
    message.replace('\n', " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_chat_flattens_newlines() {
        assert_eq!(clean_chat("on my way\n!goToPlayer(\"steve\")\n"), "on my way !goToPlayer(\"steve\")");
    }
}
