use crate::error::{LlmError, Result};
use crate::sse::{SseEvent, decode_sse};
use crate::types::{ChatMessage, Role};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub(crate) const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiClient {
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
        let req = OpenAiChatRequest::new(&self.model, messages);
        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
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
        tracing::debug!(%status, "openai stream opened");

        let sse = Box::pin(decode_sse(response.bytes_stream()));
        let stream = futures_util::stream::unfold(Some(sse), |state| async move {
            let mut sse = state?;
            loop {
                let event = match sse.as_mut().next().await? {
                    Ok(event) => event,
                    Err(e) => return Some((Err(e), None)),
                };
                match parse_chunk(&event) {
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

fn parse_chunk(event: &SseEvent) -> Result<StreamStep> {
    let data = event.data.trim();
    if data == "[DONE]" {
        return Ok(StreamStep::Done);
    }
    let chunk: OpenAiStreamChunk = serde_json::from_str(data)
        .map_err(|e| LlmError::StreamParse(format!("openai chunk json error={e} data={data}")))?;
    if let Some(error) = chunk.error {
        return Err(LlmError::Api(error.message));
    }
    let text = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|content| !content.is_empty());
    Ok(text.map_or(StreamStep::Skip, StreamStep::Text))
}

#[derive(Debug, Serialize)]
struct OpenAiChatRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    stream: bool,
}

impl OpenAiChatRequest {
    fn new(model: &str, messages: &[ChatMessage]) -> Self {
        Self {
            model: model.to_string(),
            messages: messages.iter().map(to_openai_message).collect(),
            stream: true,
        }
    }
}

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: &'static str,
    content: String,
}

fn to_openai_message(m: &ChatMessage) -> OpenAiMessage {
    let role = match m.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    };
    OpenAiMessage {
        role,
        content: m.content.clone(),
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    error: Option<OpenAiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    #[serde(default)]
    delta: OpenAiStreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiStreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorBody {
    #[serde(default)]
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(raw: &str) -> SseEvent {
        SseEvent {
            event: None,
            data: raw.to_string(),
        }
    }

    #[test]
    fn content_deltas_become_text() {
        let step = parse_chunk(&data(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#))
            .expect("parsed");
        assert_eq!(step, StreamStep::Text("Hel".into()));
    }

    #[test]
    fn role_only_and_empty_deltas_are_skipped() {
        let role = parse_chunk(&data(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#));
        assert_eq!(role.expect("parsed"), StreamStep::Skip);
        let usage = parse_chunk(&data(r#"{"choices":[],"usage":{"prompt_tokens":3}}"#));
        assert_eq!(usage.expect("parsed"), StreamStep::Skip);
    }

    #[test]
    fn done_marker_ends_stream() {
        assert_eq!(parse_chunk(&data("[DONE]")).expect("parsed"), StreamStep::Done);
    }

    #[test]
    fn malformed_chunk_is_a_parse_error() {
        assert!(matches!(
            parse_chunk(&data("{not json")),
            Err(LlmError::StreamParse(_))
        ));
    }

    #[test]
    fn in_band_error_is_surfaced() {
        let err = parse_chunk(&data(r#"{"error":{"message":"overloaded"}}"#))
            .expect_err("error chunk");
        assert!(matches!(err, LlmError::Api(msg) if msg == "overloaded"));
    }

    #[test]
    fn request_asks_for_a_stream() {
        let req = OpenAiChatRequest::new(
            "gpt-4o-mini",
            &[ChatMessage::system("be brief"), ChatMessage::user("hi")],
        );
        let json = serde_json::to_value(&req).expect("serialize");
        assert_eq!(json["stream"], true);
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "hi");
    }
}
