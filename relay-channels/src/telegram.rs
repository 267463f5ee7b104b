use crate::error::{ChannelError, Result};
use crate::traits::ChannelAdapter;
use crate::types::{InboundMessage, MessageId, OutboundMessage};
use chrono::Utc;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::sync::mpsc;

const TELEGRAM_CHANNEL_ID: &str = "telegram";
const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const TELEGRAM_MAX_MESSAGE_CHARS: usize = 4096;
const TELEGRAM_LONG_POLL_TIMEOUT_SECS: &str = "30";
const TELEGRAM_ALLOWED_UPDATES: &str = r#"["message"]"#;
const TELEGRAM_NON_TEXT_PLACEHOLDER: &str = "[telegram non-text message]";
const TELEGRAM_NOT_MODIFIED: &str = "message is not modified";
const TELEGRAM_NON_TRANSIENT_DELAY: Duration = Duration::from_secs(10);
const TELEGRAM_RETRY_BASE_MS: u64 = 250;
const TELEGRAM_RETRY_MAX_MS: u64 = 30_000;

#[derive(Clone)]
pub struct TelegramAdapter {
    http: reqwest::Client,
    bot_token: String,
    api_base: String,
}

impl TelegramAdapter {
    pub fn new(bot_token: &str) -> Result<Self> {
        // Long polls hold the request open for TELEGRAM_LONG_POLL_TIMEOUT_SECS.
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(ChannelError::fatal)?;
        Ok(Self {
            http,
            bot_token: bot_token.to_string(),
            api_base: TELEGRAM_API_BASE.to_string(),
        })
    }

    /// Talks to a Bot API compatible server other than api.telegram.org.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, method: &str) -> Result<Url> {
        Url::parse(&format!(
            "{}/bot{}/{}",
            self.api_base, self.bot_token, method
        ))
        .map_err(|e| ChannelError::Fatal(format!("invalid telegram api url: {e}")))
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: serde_json::Value) -> Result<T> {
        let url = self.api_url(method)?;
        let response = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::Transient(format!("telegram {method} request failed: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ChannelError::Transient(format!("telegram {method} body read failed: {e}")))?;
        if !status.is_success() {
            return Err(classify_failure(status, &text));
        }

        let parsed: TelegramResponse<T> = serde_json::from_str(&text).map_err(|e| {
            ChannelError::Transient(format!("telegram {method} response parse failed: {e}"))
        })?;
        if !parsed.ok {
            return Err(classify_failure(status, &text));
        }
        parsed
            .result
            .ok_or_else(|| ChannelError::Transient(format!("telegram {method} response missing result")))
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for TelegramAdapter {
    fn channel_id(&self) -> &str {
        TELEGRAM_CHANNEL_ID
    }

    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        let adapter = self.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.run_poll_loop(tx).await {
                tracing::error!(%e, "telegram poll loop exited");
            }
        });
        Ok(())
    }

    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<MessageId> {
        let mut body = serde_json::json!({
            "chat_id": recipient_id,
            "text": message.content,
        });
        if let Some(reply_to) = message
            .reply_to_message_id
            .as_ref()
            .and_then(|id| id.parse::<i64>().ok())
        {
            body["reply_parameters"] = serde_json::json!({
                "message_id": reply_to,
                "allow_sending_without_reply": true,
            });
        }
        let sent: TelegramSentMessage = self.call("sendMessage", body).await?;
        Ok(MessageId::new(sent.message_id.to_string()))
    }

    async fn edit(&self, recipient_id: &str, message_id: &MessageId, content: &str) -> Result<()> {
        let numeric_id: i64 = message_id.parse().map_err(|_| {
            ChannelError::Fatal(format!("invalid telegram message id: {message_id}"))
        })?;
        let body = serde_json::json!({
            "chat_id": recipient_id,
            "message_id": numeric_id,
            "text": content,
        });
        match self.call::<serde_json::Value>("editMessageText", body).await {
            Ok(_) => Ok(()),
            Err(ChannelError::Fatal(msg)) if msg.contains(TELEGRAM_NOT_MODIFIED) => {
                tracing::debug!(%message_id, "telegram edit was a no-op");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn send_typing(&self, recipient_id: &str, active: bool) -> Result<()> {
        // Telegram clears the indicator on its own; there is no "stop" action.
        if !active {
            return Ok(());
        }
        let body = serde_json::json!({
            "chat_id": recipient_id,
            "action": "typing",
        });
        self.call::<bool>("sendChatAction", body).await.map(|_| ())
    }

    fn supports_edits(&self) -> bool {
        true
    }

    fn supports_typing_events(&self) -> bool {
        true
    }

    fn max_message_chars(&self) -> usize {
        TELEGRAM_MAX_MESSAGE_CHARS
    }
}

impl TelegramAdapter {
    #[tracing::instrument(level = "info", skip_all)]
    async fn run_poll_loop(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        let mut offset: i64 = 0;
        let mut consecutive_failures: u32 = 0;

        loop {
            let url = self.api_url("getUpdates")?;
            let response = match self
                .http
                .get(url)
                .query(&[
                    ("timeout", TELEGRAM_LONG_POLL_TIMEOUT_SECS),
                    ("offset", &offset.to_string()),
                    ("allowed_updates", TELEGRAM_ALLOWED_UPDATES),
                ])
                .send()
                .await
            {
                Ok(response) => response,
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates request failed; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_else(|error| {
                    format!("<failed to read telegram error body: {error}>")
                });
                match classify_failure(status, &body) {
                    ChannelError::RateLimited { retry_after } => {
                        consecutive_failures += 1;
                        let delay = retry_after
                            .unwrap_or_else(|| transient_retry_delay(consecutive_failures));
                        tracing::warn!(%status, ?delay, "telegram getUpdates rate limited");
                        tokio::time::sleep(delay).await;
                    }
                    ChannelError::Transient(_) => {
                        consecutive_failures += 1;
                        let delay = transient_retry_delay(consecutive_failures);
                        tracing::warn!(
                            %status,
                            %body,
                            attempt = consecutive_failures,
                            ?delay,
                            "telegram getUpdates transient failure; retrying with backoff"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    _ => {
                        consecutive_failures = 0;
                        tracing::error!(
                            %status,
                            %body,
                            ?TELEGRAM_NON_TRANSIENT_DELAY,
                            "telegram getUpdates non-transient failure; keeping poll loop alive"
                        );
                        tokio::time::sleep(TELEGRAM_NON_TRANSIENT_DELAY).await;
                    }
                }
                continue;
            }

            let parsed = match response.json::<TelegramResponse<Vec<TelegramUpdate>>>().await {
                Ok(parsed) => parsed,
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates payload parse failed; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            consecutive_failures = 0;

            let mut updates = parsed.result.unwrap_or_default();
            updates.sort_by_key(|update| update.update_id);
            for update in updates {
                // Advance offset before conversion to avoid poison-update replay loops.
                if update.update_id < offset {
                    continue;
                }
                offset = update.update_id.saturating_add(1);

                if let Some(inbound) = build_message_inbound(update.update_id, update.message.as_ref()) {
                    tx.send(inbound)
                        .await
                        .map_err(|e| ChannelError::Fatal(format!("telegram inbound queue closed: {e}")))?;
                }
            }
        }
    }
}

fn transient_retry_delay(attempt: u32) -> Duration {
    let multiplier = 1_u64 << attempt.saturating_sub(1).min(10);
    Duration::from_millis((TELEGRAM_RETRY_BASE_MS * multiplier).min(TELEGRAM_RETRY_MAX_MS))
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT || status.is_server_error()
}

/// Maps a failed Bot API call onto the relay's failure classes.
fn classify_failure(status: StatusCode, body: &str) -> ChannelError {
    let parsed = serde_json::from_str::<TelegramResponse<serde_json::Value>>(body).ok();
    let description = parsed
        .as_ref()
        .and_then(|p| p.description.clone())
        .unwrap_or_else(|| body.trim().to_string());
    let retry_after = parsed
        .as_ref()
        .and_then(|p| p.parameters.as_ref())
        .and_then(|p| p.retry_after)
        .map(Duration::from_secs);

    if status == StatusCode::TOO_MANY_REQUESTS || retry_after.is_some() {
        return ChannelError::RateLimited { retry_after };
    }
    if is_transient_status(status) {
        return ChannelError::Transient(format!("telegram status={status} {description}"));
    }
    ChannelError::Fatal(format!("telegram status={status} {description}"))
}

fn build_message_inbound(
    update_id: i64,
    message: Option<&TelegramMessage>,
) -> Option<InboundMessage> {
    let message = message?;
    let chat = message.chat.as_ref()?;
    let content = extract_message_content(message)?;
    let sender_id = message
        .from
        .as_ref()
        .map(|user| user.id.to_string())
        .unwrap_or_else(|| format!("chat:{}", chat.id));
    let message_id = message
        .message_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| format!("update:{update_id}:message"));

    Some(InboundMessage {
        message_id: message_id.into(),
        channel_id: TELEGRAM_CHANNEL_ID.into(),
        sender_id: sender_id.into(),
        thread_id: chat.id.to_string().into(),
        is_group: chat.r#type != "private",
        content,
        metadata: serde_json::to_value(message).unwrap_or(serde_json::Value::Null),
        received_at: Utc::now(),
    })
}

fn extract_message_content(message: &TelegramMessage) -> Option<String> {
    if let Some(text) = message.text.as_deref().map(str::trim) {
        if !text.is_empty() {
            return Some(text.to_string());
        }
    }
    if let Some(caption) = message.caption.as_deref().map(str::trim) {
        if !caption.is_empty() {
            return Some(caption.to_string());
        }
    }
    if message.has_non_text_payload() {
        return Some(TELEGRAM_NON_TEXT_PLACEHOLDER.to_string());
    }
    None
}

#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    #[serde(default)]
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<TelegramResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct TelegramResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TelegramSentMessage {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize, serde::Serialize)]
struct TelegramMessage {
    #[serde(default)]
    message_id: Option<i64>,
    #[serde(default)]
    from: Option<TelegramUser>,
    #[serde(default)]
    chat: Option<TelegramChat>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    photo: Vec<serde_json::Value>,
    #[serde(default)]
    sticker: Option<serde_json::Value>,
    #[serde(default)]
    document: Option<serde_json::Value>,
    #[serde(default)]
    voice: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, serde::Serialize)]
struct TelegramUser {
    id: i64,
}

#[derive(Debug, Deserialize, serde::Serialize)]
struct TelegramChat {
    id: i64,
    #[serde(rename = "type")]
    r#type: String,
}

impl TelegramMessage {
    fn has_non_text_payload(&self) -> bool {
        !self.photo.is_empty()
            || self.sticker.is_some()
            || self.document.is_some()
            || self.voice.is_some()
    }
}
