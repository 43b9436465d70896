use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::ServerError;
use crate::types::StreamChunk;

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Chunks produced by a generation worker, in generation order.
///
/// The stream ends when the worker exits. An `Err` item is always the last
/// one. Dropping the stream cancels the worker.
pub struct ChunkStream {
    rx: mpsc::Receiver<Result<String, ServerError>>,
    _cancel_on_drop: DropGuard,
}

impl ChunkStream {
    pub(crate) fn new(
        rx: mpsc::Receiver<Result<String, ServerError>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            rx,
            _cancel_on_drop: cancel.drop_guard(),
        }
    }

    /// Frame the chunks as newline-delimited JSON.
    pub fn into_ndjson(self) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
        self.map(|item| Ok(ndjson_line(item)))
    }
}

impl Stream for ChunkStream {
    type Item = Result<String, ServerError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// `{"chunk":"..."}\n` for text, `{"error":{...}}\n` for the terminal error.
pub fn ndjson_line(item: Result<String, ServerError>) -> Bytes {
    let encoded = match item {
        Ok(chunk) => serde_json::to_vec(&StreamChunk { chunk }),
        Err(e) => serde_json::to_vec(&e.to_api_error()),
    };
    // Both envelopes are plain string structs and always serialize.
    let mut line = encoded.unwrap_or_default();
    line.push(b'\n');
    Bytes::from(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_lines_have_a_single_key() {
        let line = ndjson_line(Ok("a \"quoted\"\nline".to_string()));
        assert_eq!(line.last(), Some(&b'\n'));

        let value: serde_json::Value = serde_json::from_slice(&line[..line.len() - 1]).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), 1);
        assert_eq!(obj["chunk"], "a \"quoted\"\nline");
    }

    #[test]
    fn error_lines_use_api_envelope() {
        let line = ndjson_line(Err(ServerError::inference("boom")));
        let value: serde_json::Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(value["error"]["type"], "inference_error");
        assert!(value["error"]["message"].as_str().unwrap().contains("boom"));
        assert_eq!(value["error"].as_object().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn dropping_the_stream_cancels_the_token() {
        let (_tx, rx) = mpsc::channel(1);
        let token = CancellationToken::new();
        let stream = ChunkStream::new(rx, token.clone());
        assert!(!token.is_cancelled());
        drop(stream);
        assert!(token.is_cancelled());
    }
}
