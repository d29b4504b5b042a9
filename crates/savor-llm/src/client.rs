//! Ollama-compatible model server client.

use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use savor_common::{Error, Result};

/// Timeout applied to non-streaming calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Client for an Ollama-compatible model server.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
}

impl OllamaClient {
    /// Create a client against the given base URL (e.g. `http://localhost:11434`).
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into();
        if base_url.is_empty() {
            return Err(Error::Configuration("model base URL is required".into()));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(net_err)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Embed a single text. Returns the raw (un-normalized) vector.
    pub async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>> {
        let request = EmbedRequest {
            model: model.to_string(),
            input: text.to_string(),
        };

        let response = self
            .client
            .post(format!("{}/api/embed", self.base_url))
            .timeout(REQUEST_TIMEOUT)
            .json(&request)
            .send()
            .await
            .map_err(net_err)?;
        let response = check_status(response).await?;

        let body: EmbedResponse = response.json().await.map_err(net_err)?;
        let vector = body
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| Error::Model("empty embeddings response".into()))?;
        debug!(model, dims = vector.len(), "embedding generated");
        Ok(vector)
    }

    /// Run a chat completion constrained to emit a single JSON object.
    ///
    /// Temperature is pinned to zero: the caller parses the output, so
    /// determinism matters more than variety.
    pub async fn generate_json(&self, model: &str, system: &str, prompt: &str) -> Result<String> {
        let request = ChatRequest {
            model: model.to_string(),
            messages: vec![
                ChatMessage::system(system),
                ChatMessage::user(prompt),
            ],
            stream: false,
            format: Some("json".to_string()),
            options: ChatOptions { temperature: 0.0 },
        };

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .timeout(REQUEST_TIMEOUT)
            .json(&request)
            .send()
            .await
            .map_err(net_err)?;
        let response = check_status(response).await?;

        let body: ChatResponse = response.json().await.map_err(net_err)?;
        Ok(body.message.map(|m| m.content).unwrap_or_default())
    }

    /// Start a streaming chat completion.
    ///
    /// The server answers with newline-delimited JSON frames; pull them
    /// with [`ChatStream::next_chunk`]. Dropping the stream cancels the
    /// request.
    pub async fn chat_stream(
        &self,
        model: &str,
        system: &str,
        prompt: &str,
    ) -> Result<ChatStream> {
        let request = ChatRequest {
            model: model.to_string(),
            messages: vec![
                ChatMessage::system(system),
                ChatMessage::user(prompt),
            ],
            stream: true,
            format: None,
            options: ChatOptions { temperature: 0.0 },
        };

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(net_err)?;
        let response = check_status(response).await?;

        Ok(ChatStream {
            inner: response.bytes_stream().boxed(),
            buffer: BytesMut::new(),
            done: false,
        })
    }
}

/// A streaming chat completion in progress.
pub struct ChatStream {
    inner: BoxStream<'static, reqwest::Result<Bytes>>,
    buffer: BytesMut,
    done: bool,
}

impl ChatStream {
    /// Next content chunk, or `None` once the model reports completion.
    ///
    /// Frames without content (role-only deltas, the final `done` frame)
    /// are skipped internally.
    pub async fn next_chunk(&mut self) -> Result<Option<String>> {
        loop {
            if self.done {
                return Ok(None);
            }

            if let Some(line) = self.take_line() {
                let frame: ChatResponse = serde_json::from_slice(&line)
                    .map_err(|e| Error::Model(format!("malformed stream frame: {e}")))?;
                if frame.done {
                    self.done = true;
                }
                let content = frame.message.map(|m| m.content).unwrap_or_default();
                if !content.is_empty() {
                    return Ok(Some(content));
                }
                continue;
            }

            match self.inner.next().await {
                Some(Ok(bytes)) => self.buffer.extend_from_slice(&bytes),
                Some(Err(e)) => return Err(net_err(e)),
                None => {
                    // Stream ended without a done frame; treat any
                    // residual buffer as a final (possibly partial) frame.
                    self.done = true;
                    if !self.buffer.is_empty() {
                        let line = self.buffer.split().freeze();
                        if let Ok(frame) = serde_json::from_slice::<ChatResponse>(&line) {
                            let content = frame.message.map(|m| m.content).unwrap_or_default();
                            if !content.is_empty() {
                                return Ok(Some(content));
                            }
                        }
                    }
                    return Ok(None);
                }
            }
        }
    }

    fn take_line(&mut self) -> Option<Bytes> {
        let pos = self.buffer.iter().position(|&b| b == b'\n')?;
        let line = self.buffer.split_to(pos).freeze();
        self.buffer.advance(1);
        Some(line)
    }
}

fn net_err(e: reqwest::Error) -> Error {
    Error::Network(e.to_string())
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::Model(format!("model server error {status}: {body}")));
    }
    Ok(response)
}

#[derive(Debug, Serialize)]
struct EmbedRequest {
    model: String,
    input: String,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<String>,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

impl ChatMessage {
    fn system(content: &str) -> Self {
        Self {
            role: "system".to_string(),
            content: content.to_string(),
        }
    }

    fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: content.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    message: Option<ChatMessage>,
    #[serde(default)]
    done: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_base_url_fails() {
        assert!(OllamaClient::new("").is_err());
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let client = OllamaClient::new("http://localhost:11434/").unwrap();
        assert_eq!(client.base_url, "http://localhost:11434");
    }
}

#[cfg(test)]
mod mock_tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_embed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .and(body_partial_json(serde_json::json!({
                "model": "nomic-embed-text",
                "input": "spicy ramen"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "nomic-embed-text",
                "embeddings": [[0.1, 0.2, 0.3]]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = OllamaClient::new(server.uri()).unwrap();
        let vector = client.embed("nomic-embed-text", "spicy ramen").await.unwrap();
        assert_eq!(vector, vec![0.1, 0.2, 0.3]);
    }

    #[tokio::test]
    async fn test_embed_empty_response_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "embeddings": []
            })))
            .mount(&server)
            .await;

        let client = OllamaClient::new(server.uri()).unwrap();
        let result = client.embed("nomic-embed-text", "anything").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_embed_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(500).set_body_string("model not loaded"))
            .mount(&server)
            .await;

        let client = OllamaClient::new(server.uri()).unwrap();
        let err = client.embed("nomic-embed-text", "text").await.unwrap_err();
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn test_generate_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(serde_json::json!({
                "stream": false,
                "format": "json"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": {"role": "assistant", "content": "{\"query\":\"ramen\"}"},
                "done": true
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = OllamaClient::new(server.uri()).unwrap();
        let out = client
            .generate_json("llama3.1", "you are a parser", "parse this")
            .await
            .unwrap();
        assert_eq!(out, "{\"query\":\"ramen\"}");
    }

    #[tokio::test]
    async fn test_chat_stream_chunks() {
        let body = concat!(
            "{\"message\":{\"role\":\"assistant\",\"content\":\"Ramen \"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"House\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true}\n",
        );
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(body.as_bytes().to_vec(), "application/x-ndjson"),
            )
            .mount(&server)
            .await;

        let client = OllamaClient::new(server.uri()).unwrap();
        let mut stream = client
            .chat_stream("llama3.1", "summarize", "restaurants")
            .await
            .unwrap();

        assert_eq!(stream.next_chunk().await.unwrap().as_deref(), Some("Ramen "));
        assert_eq!(stream.next_chunk().await.unwrap().as_deref(), Some("House"));
        assert_eq!(stream.next_chunk().await.unwrap(), None);
        // Stays done once finished.
        assert_eq!(stream.next_chunk().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_chat_stream_malformed_frame() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(b"not json at all\n".to_vec(), "application/x-ndjson"),
            )
            .mount(&server)
            .await;

        let client = OllamaClient::new(server.uri()).unwrap();
        let mut stream = client
            .chat_stream("llama3.1", "summarize", "restaurants")
            .await
            .unwrap();
        assert!(stream.next_chunk().await.is_err());
    }
}
