//! Chat command parser for chatrelay.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Help,
    Status,
    Cancel,
    Unknown(String),
}

/// Parses a slash command; plain messages yield `None`.
pub fn parse(input: &str) -> Option<ChatCommand> {
    let trimmed = input.trim();
    if !trimmed.starts_with('/') {
        return None;
    }
    // Telegram appends the bot name in groups: `/status@relay_bot`.
    let word = trimmed.split_whitespace().next().unwrap_or(trimmed);
    let name = word.split('@').next().unwrap_or(word).to_ascii_lowercase();
    Some(match name.as_str() {
        "/help" | "/start" => ChatCommand::Help,
        "/status" => ChatCommand::Status,
        "/cancel" | "/stop" => ChatCommand::Cancel,
        _ => ChatCommand::Unknown(word.to_string()),
    })
}

pub fn help_text() -> String {
    [
        "Send any message and the reply streams in as it is written.",
        "/status - relay status for this chat",
        "/cancel - stop the reply currently being written",
        "/help - this message",
    ]
    .join("\n")
}

pub fn unknown_text(command: &str) -> String {
    format!("Unknown command {command}. Supported: /help /status /cancel")
}

#[derive(Debug, Clone)]
pub struct StatusView<'a> {
    pub model: &'a str,
    pub channels: &'a [String],
    pub uptime: Duration,
    pub generating: bool,
    pub circuit: &'a str,
    pub interval: Duration,
    pub active_sessions: usize,
}

pub fn status_text(view: &StatusView<'_>) -> String {
    format!(
        "model={}\nchannels={}\nuptime_seconds={}\ngenerating={}\ncircuit={}\nupdate_interval_ms={}\nactive_sessions={}",
        view.model,
        view.channels.join(","),
        view.uptime.as_secs(),
        view.generating,
        view.circuit,
        view.interval.as_millis(),
        view.active_sessions,
    )
}
