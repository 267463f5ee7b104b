use crate::anthropic::{ANTHROPIC_BASE_URL, AnthropicClient};
use crate::error::Result;
use crate::openai::{OPENAI_BASE_URL, OpenAiClient};
use crate::types::ChatMessage;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use relay_core::{FragmentStream, ProducerError};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    Anthropic,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAI => "openai",
            Self::Anthropic => "anthropic",
        }
    }
}

#[derive(Clone)]
pub struct LlmClient {
    provider: Provider,
    api_key: String,
    model: String,
    base_url: Option<String>,
    client: reqwest::Client,
}

impl LlmClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(api_key: &str, model: &str) -> Self {
        let provider = detect_provider(model);
        // No overall timeout: a streamed answer may legitimately run for minutes.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Self {
            provider,
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: None,
            client,
        }
    }

    /// Points the client at an API-compatible endpoint instead of the
    /// provider's public one.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Streams the assistant's reply as text fragments.
    ///
    /// Nothing is sent until the stream is first polled. Non-success
    /// statuses, transport failures and malformed chunks all surface as a
    /// single terminal `ProducerError`.
    pub fn stream_text(&self, messages: Vec<ChatMessage>) -> FragmentStream {
        let client = self.clone();
        futures_util::stream::once(async move { client.open_stream(&messages).await })
            .try_flatten()
            .map_err(|e| {
                tracing::warn!(error = %e, "llm stream failed");
                ProducerError::from(e)
            })
            .boxed()
    }

    async fn open_stream(
        &self,
        messages: &[ChatMessage],
    ) -> Result<BoxStream<'static, Result<String>>> {
        tracing::info!(
            provider = self.provider.as_str(),
            model = %self.model,
            messages = messages.len(),
            "opening llm stream"
        );
        match self.provider {
            Provider::OpenAI => {
                let base = self.base_url.as_deref().unwrap_or(OPENAI_BASE_URL);
                OpenAiClient::new(self.client.clone(), &self.api_key, &self.model, base)
                    .open_stream(messages)
                    .await
            }
            Provider::Anthropic => {
                let base = self.base_url.as_deref().unwrap_or(ANTHROPIC_BASE_URL);
                AnthropicClient::new(self.client.clone(), &self.api_key, &self.model, base)
                    .open_stream(messages)
                    .await
            }
        }
    }
}

fn detect_provider(model: &str) -> Provider {
    let m = model.to_ascii_lowercase();
    if m.starts_with("claude-") {
        return Provider::Anthropic;
    }
    Provider::OpenAI
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves exactly one canned HTTP response and returns its base URL.
    async fn serve_once(response: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buf = vec![0u8; 16 * 1024];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(response.as_bytes())
                .await
                .expect("write response");
            let _ = socket.shutdown().await;
        });
        format!("http://{addr}/v1")
    }

    fn sse_response(body: &str) -> String {
        format!(
            "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    #[test]
    fn provider_follows_model_name() {
        assert_eq!(detect_provider("claude-sonnet-4-5"), Provider::Anthropic);
        assert_eq!(detect_provider("Claude-3-haiku"), Provider::Anthropic);
        assert_eq!(detect_provider("gpt-4o-mini"), Provider::OpenAI);
        assert_eq!(detect_provider("llama3"), Provider::OpenAI);
    }

    #[tokio::test]
    async fn openai_stream_yields_text_fragments() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\", world\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        let base = serve_once(sse_response(body)).await;
        let client = LlmClient::new("sk-test", "gpt-4o-mini").with_base_url(base);

        let fragments: Vec<_> = client
            .stream_text(vec![ChatMessage::user("hi")])
            .collect()
            .await;
        let text: Vec<String> = fragments
            .into_iter()
            .map(|f| f.expect("fragment"))
            .collect();
        assert_eq!(text, vec!["Hello".to_string(), ", world".to_string()]);
    }

    #[tokio::test]
    async fn anthropic_stream_yields_text_fragments() {
        let body = concat!(
            "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{}}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\n",
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
        );
        let base = serve_once(sse_response(body)).await;
        let client = LlmClient::new("sk-ant-test", "claude-sonnet-4-5").with_base_url(base);

        let fragments: Vec<_> = client
            .stream_text(vec![ChatMessage::user("hi")])
            .collect()
            .await;
        assert_eq!(fragments, vec![Ok("Hi".to_string())]);
    }

    #[tokio::test]
    async fn error_status_becomes_producer_error() {
        let response =
            "HTTP/1.1 500 Internal Server Error\r\ncontent-length: 4\r\nconnection: close\r\n\r\nboom"
                .to_string();
        let base = serve_once(response).await;
        let client = LlmClient::new("sk-test", "gpt-4o-mini").with_base_url(base);

        let fragments: Vec<_> = client
            .stream_text(vec![ChatMessage::user("hi")])
            .collect()
            .await;
        assert_eq!(fragments.len(), 1);
        assert!(matches!(
            &fragments[0],
            Err(ProducerError::Backend(msg)) if msg.contains("500") && msg.contains("boom")
        ));
    }

    #[tokio::test]
    async fn malformed_chunk_ends_stream_with_error() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n\ndata: {oops\n\n";
        let base = serve_once(sse_response(body)).await;
        let client = LlmClient::new("sk-test", "gpt-4o-mini").with_base_url(base);

        let fragments: Vec<_> = client
            .stream_text(vec![ChatMessage::user("hi")])
            .collect()
            .await;
        assert_eq!(fragments[0], Ok("ok".to_string()));
        assert!(matches!(&fragments[1], Err(ProducerError::Malformed(_))));
        assert_eq!(fragments.len(), 2);
    }

    #[test]
    fn stream_is_lazy() {
        let client =
            LlmClient::new("sk-test", "gpt-4o-mini").with_base_url("http://127.0.0.1:1/v1");
        // Building the stream must not touch the network or need a runtime.
        let _stream = client.stream_text(vec![ChatMessage::user("hi")]);
    }
}
