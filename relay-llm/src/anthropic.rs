use crate::error::{LlmError, Result};
use crate::sse::{SseEvent, decode_sse};
use crate::types::{ChatMessage, Role};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub(crate) const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 2048;

#[derive(Clone)]
pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(http: reqwest::Client, api_key: &str, model: &str, base_url: &str) -> Self {
        Self {
            http,
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %self.model))]
    pub async fn open_stream(
        &self,
        messages: &[ChatMessage],
    ) -> Result<BoxStream<'static, Result<String>>> {
        let req = AnthropicRequest::new(&self.model, messages)?;
        let url = format!("{}/messages", self.base_url);

        let response = self
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }
        tracing::debug!(%status, "anthropic stream opened");

        let sse = Box::pin(decode_sse(response.bytes_stream()));
        let stream = futures_util::stream::unfold(Some(sse), |state| async move {
            let mut sse = state?;
            loop {
                let event = match sse.as_mut().next().await? {
                    Ok(event) => event,
                    Err(e) => return Some((Err(e), None)),
                };
                match parse_event(&event) {
                    Ok(StreamStep::Text(text)) => return Some((Ok(text), Some(sse))),
                    Ok(StreamStep::Skip) => continue,
                    Ok(StreamStep::Done) => return None,
                    Err(e) => return Some((Err(e), None)),
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[derive(Debug, PartialEq, Eq)]
enum StreamStep {
    Text(String),
    Skip,
    Done,
}

fn parse_event(event: &SseEvent) -> Result<StreamStep> {
    let parsed: AnthropicStreamEvent = serde_json::from_str(&event.data).map_err(|e| {
        LlmError::StreamParse(format!(
            "anthropic event json error={e} event={:?} data={}",
            event.event, event.data
        ))
    })?;
    Ok(match parsed {
        AnthropicStreamEvent::ContentBlockDelta {
            delta: AnthropicDelta::TextDelta { text },
        } if !text.is_empty() => StreamStep::Text(text),
        AnthropicStreamEvent::MessageStop => StreamStep::Done,
        AnthropicStreamEvent::Error { error } => {
            return Err(LlmError::Api(format!("{}: {}", error.kind, error.message)));
        }
        _ => StreamStep::Skip,
    })
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicStreamEvent {
    ContentBlockDelta { delta: AnthropicDelta },
    MessageStop,
    Error { error: AnthropicErrorBody },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicDelta {
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorBody {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    system: String,
    messages: Vec<AnthropicMessage>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: String,
}

impl AnthropicRequest {
    fn new(model: &str, messages: &[ChatMessage]) -> Result<Self> {
        let mut system = String::new();
        let mut out_messages = Vec::new();

        for m in messages {
            match m.role {
                Role::System => {
                    if !system.is_empty() {
                        system.push('\n');
                    }
                    system.push_str(m.content.trim());
                }
                Role::User => out_messages.push(AnthropicMessage {
                    role: "user",
                    content: m.content.clone(),
                }),
                Role::Assistant => out_messages.push(AnthropicMessage {
                    role: "assistant",
                    content: m.content.clone(),
                }),
            }
        }

        if out_messages.is_empty() {
            return Err(LlmError::InvalidInput(
                "anthropic request needs at least one non-system message".to_string(),
            ));
        }

        Ok(Self {
            model: model.to_string(),
            max_tokens: MAX_TOKENS,
            system,
            messages: out_messages,
            stream: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(name: &str, data: &str) -> SseEvent {
        SseEvent {
            event: Some(name.to_string()),
            data: data.to_string(),
        }
    }

    #[test]
    fn text_deltas_become_text() {
        let step = parse_event(&event(
            "content_block_delta",
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#,
        ))
        .expect("parsed");
        assert_eq!(step, StreamStep::Text("Hi".into()));
    }

    #[test]
    fn bookkeeping_events_are_skipped() {
        for (name, data) in [
            ("message_start", r#"{"type":"message_start","message":{"id":"m1"}}"#),
            ("ping", r#"{"type":"ping"}"#),
            (
                "content_block_delta",
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{"}}"#,
            ),
            ("content_block_stop", r#"{"type":"content_block_stop","index":0}"#),
        ] {
            assert_eq!(parse_event(&event(name, data)).expect(name), StreamStep::Skip);
        }
    }

    #[test]
    fn message_stop_ends_stream() {
        let step = parse_event(&event("message_stop", r#"{"type":"message_stop"}"#));
        assert_eq!(step.expect("parsed"), StreamStep::Done);
    }

    #[test]
    fn error_event_is_surfaced() {
        let err = parse_event(&event(
            "error",
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        ))
        .expect_err("error event");
        assert!(matches!(err, LlmError::Api(msg) if msg == "overloaded_error: Overloaded"));
    }

    #[test]
    fn system_messages_move_to_the_system_field() {
        let req = AnthropicRequest::new(
            "claude-sonnet-4-5",
            &[
                ChatMessage::system("be brief"),
                ChatMessage::system(" reply in english "),
                ChatMessage::user("hi"),
            ],
        )
        .expect("request");
        let json = serde_json::to_value(&req).expect("serialize");
        assert_eq!(json["system"], "be brief\nreply in english");
        assert_eq!(json["messages"].as_array().map(Vec::len), Some(1));
        assert_eq!(json["stream"], true);
    }

    #[test]
    fn system_only_request_is_rejected() {
        assert!(matches!(
            AnthropicRequest::new("claude-x", &[ChatMessage::system("s")]),
            Err(LlmError::InvalidInput(_))
        ));
    }
}
