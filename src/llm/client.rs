//! Streaming chat-completions client.
//!
//! Speaks the OpenAI-compatible SSE protocol used by both OpenRouter and
//! Ollama: one POST with `stream: true`, then `data:` events carrying
//! content deltas until a `[DONE]` marker or the connection closes.

use super::models::Backend;
use super::Message;
use crate::util::truncate;
use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use thiserror::Error;
use tracing::{debug, warn};

const OPENROUTER_REFERER: &str = "https://codenexus.dev";
const OPENROUTER_TITLE: &str = "CodeNexus";

/// A provider or transport failure while opening or consuming a stream.
/// Failover retries these against the next roster entry.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("{0}")]
    Api(String),
    #[error("stream transport failed: {0}")]
    Transport(String),
    #[error("stream payload was malformed: {0}")]
    Decode(String),
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    stream: bool,
    messages: &'a [Message],
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: Option<Delta>,
}

#[derive(Deserialize)]
struct Delta {
    content: Option<String>,
    images: Option<Vec<DeltaImage>>,
}

#[derive(Deserialize)]
struct DeltaImage {
    image_url: ImageRef,
}

#[derive(Deserialize)]
struct ImageRef {
    url: String,
}

/// One decoded stream delta: text plus any inline images (data: URLs).
#[derive(Debug, Clone, Default)]
pub struct ChatDelta {
    pub text: String,
    pub images: Vec<String>,
}

type SseEvents = Pin<Box<dyn Stream<Item = Result<Event, EventStreamError<reqwest::Error>>> + Send>>;

/// An open completion stream. Dropping it aborts the underlying transport.
pub struct ChatStream {
    events: SseEvents,
    done: bool,
}

impl ChatStream {
    /// Next content delta, or `None` once the stream ends. Keepalive and
    /// metadata chunks with no content are skipped.
    pub async fn next_delta(&mut self) -> Result<Option<ChatDelta>, StreamError> {
        if self.done {
            return Ok(None);
        }

        loop {
            match self.events.next().await {
                None => {
                    self.done = true;
                    return Ok(None);
                }
                Some(Err(err)) => {
                    self.done = true;
                    return Err(StreamError::Transport(err.to_string()));
                }
                Some(Ok(event)) => {
                    if event.data == "[DONE]" {
                        self.done = true;
                        return Ok(None);
                    }

                    if let Some(delta) = decode_chunk(&event.data)? {
                        return Ok(Some(delta));
                    }
                    // Empty choices with no content: keepalive, skip.
                }
            }
        }
    }
}

fn decode_chunk(data: &str) -> Result<Option<ChatDelta>, StreamError> {
    // Providers surface mid-stream API errors as a JSON error object.
    let value: serde_json::Value = serde_json::from_str(data)
        .map_err(|err| StreamError::Decode(format!("{}: {}", err, truncate(data, 200))))?;
    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .or_else(|| error.as_str())
            .unwrap_or("provider reported a streaming error");
        return Err(StreamError::Api(message.to_string()));
    }

    let chunk: StreamChunk = serde_json::from_value(value)
        .map_err(|err| StreamError::Decode(format!("{}: {}", err, truncate(data, 200))))?;

    let Some(delta) = chunk.choices.into_iter().next().and_then(|c| c.delta) else {
        return Ok(None);
    };

    let text = delta.content.unwrap_or_default();
    let images: Vec<String> = delta
        .images
        .unwrap_or_default()
        .into_iter()
        .map(|img| img.image_url.url)
        .collect();

    if text.is_empty() && images.is_empty() {
        return Ok(None);
    }

    Ok(Some(ChatDelta { text, images }))
}

/// Open a streaming completion against one model. Returns once headers are
/// in; deltas are pulled through [`ChatStream::next_delta`].
pub async fn open_stream(
    client: &reqwest::Client,
    backend: &Backend,
    api_key: Option<&str>,
    model: &str,
    messages: &[Message],
) -> Result<ChatStream, StreamError> {
    let request = ChatRequest {
        model,
        stream: true,
        messages,
    };

    let mut builder = client
        .post(backend.completions_url())
        .header("Content-Type", "application/json")
        .json(&request);

    if let Backend::OpenRouter = backend {
        builder = builder
            .header("HTTP-Referer", OPENROUTER_REFERER)
            .header("X-Title", OPENROUTER_TITLE);
    }

    match api_key {
        Some(key) => builder = builder.header("Authorization", format!("Bearer {}", key)),
        None if backend.needs_api_key() => {
            return Err(StreamError::Api(
                "No API key configured. Run 'codenexus --setup' to get started.".to_string(),
            ));
        }
        None => {}
    }

    debug!("opening stream against {} ({})", model, backend.label());
    let response = builder
        .send()
        .await
        .map_err(|err| StreamError::Transport(err.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        warn!("stream rejected with {}: {}", status, truncate(&body, 200));
        return Err(StreamError::Api(describe_status(status.as_u16(), &body)));
    }

    Ok(ChatStream {
        events: Box::pin(response.bytes_stream().eventsource()),
        done: false,
    })
}

fn describe_status(status: u16, body: &str) -> String {
    match status {
        401 => "Invalid API key. Run 'codenexus --setup' to update it.".to_string(),
        429 => "Rate limited by the provider. Try again in a few minutes.".to_string(),
        500..=599 => format!(
            "Provider server error ({}). The service may be temporarily unavailable.",
            status
        ),
        _ => format!("API error {}: {}", status, truncate(body, 200)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_content_delta() {
        let delta = decode_chunk(r#"{"choices":[{"delta":{"content":"hi"}}]}"#)
            .unwrap()
            .unwrap();
        assert_eq!(delta.text, "hi");
        assert!(delta.images.is_empty());
    }

    #[test]
    fn test_decode_image_delta() {
        let data = r#"{"choices":[{"delta":{"images":[{"image_url":{"url":"data:image/png;base64,AA"}}]}}]}"#;
        let delta = decode_chunk(data).unwrap().unwrap();
        assert!(delta.text.is_empty());
        assert_eq!(delta.images.len(), 1);
    }

    #[test]
    fn test_decode_keepalive_is_skipped() {
        assert!(decode_chunk(r#"{"choices":[]}"#).unwrap().is_none());
        assert!(decode_chunk(r#"{"choices":[{"delta":{}}]}"#).unwrap().is_none());
    }

    #[test]
    fn test_decode_api_error() {
        let err = decode_chunk(r#"{"error":{"message":"model overloaded"}}"#).unwrap_err();
        assert!(matches!(err, StreamError::Api(msg) if msg.contains("overloaded")));
    }

    #[test]
    fn test_decode_garbage_is_decode_error() {
        assert!(matches!(
            decode_chunk("not json"),
            Err(StreamError::Decode(_))
        ));
    }

    #[test]
    fn test_describe_status() {
        assert!(describe_status(401, "").contains("Invalid API key"));
        assert!(describe_status(503, "").contains("server error"));
        assert!(describe_status(404, "missing").contains("404"));
    }
}
