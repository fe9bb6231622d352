//! Accumulates the content of a streamed chat completion.

use std::{fmt::Display, pin::Pin, time::Duration};

use eventsource_stream::{EventStreamError, Eventsource};
use futures::{Stream, StreamExt, stream};

use crate::messages::StreamChunk;

/// Idle window used when none is configured.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(20);

/// Reading a chat stream failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// No bytes arrived within the idle window.
    #[error("Stream idle for {0:?}")]
    Idle(Duration),

    /// The underlying connection failed.
    #[error("Stream transport error: {0}")]
    Transport(String),
}

/// Reads server-sent events until `[DONE]` or the end of the stream and returns
/// the concatenated content of every well-formed chunk.
///
/// The idle timer is re-armed on every received byte chunk, so a slow but live
/// stream is never cut off. Lines that do not decode as a chunk are skipped.
pub async fn read_chat_stream<S, B, E>(bytes: S, idle_timeout: Duration) -> Result<String, StreamError>
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let idle = if idle_timeout.is_zero() {
        DEFAULT_IDLE_TIMEOUT
    } else {
        idle_timeout
    };

    let mut events = std::pin::pin!(idle_guarded(bytes, idle).eventsource());
    let mut content = String::new();

    while let Some(event) = events.next().await {
        let event = match event {
            Ok(event) => event,
            Err(EventStreamError::Transport(e)) => return Err(e),
            Err(e) => {
                log::warn!("Skipping undecodable stream event: {e}");
                continue;
            }
        };

        let data = event.data.trim();

        if data.is_empty() {
            continue;
        }

        if data == "[DONE]" {
            break;
        }

        match sonic_rs::from_str::<StreamChunk>(data) {
            Ok(chunk) => {
                if let Some(text) = chunk.choices.first().and_then(|choice| choice.content()) {
                    content.push_str(text);
                }
            }
            Err(e) => log::warn!("Skipping malformed stream chunk: {e}"),
        }
    }

    Ok(content)
}

type BoxedBytes<B, E> = Pin<Box<dyn Stream<Item = Result<B, E>> + Send>>;

/// Ends the stream with an error once `idle` passes without a new chunk.
fn idle_guarded<S, B, E>(bytes: S, idle: Duration) -> impl Stream<Item = Result<B, StreamError>>
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: Send + 'static,
    E: Display + Send + 'static,
{
    let inner: BoxedBytes<B, E> = Box::pin(bytes);

    stream::unfold(Some(inner), move |state| async move {
        let mut inner = state?;

        match tokio::time::timeout(idle, inner.next()).await {
            Ok(Some(Ok(chunk))) => Some((Ok(chunk), Some(inner))),
            Ok(Some(Err(e))) => Some((Err(StreamError::Transport(e.to_string())), None)),
            Ok(None) => None,
            Err(_) => Some((Err(StreamError::Idle(idle)), None)),
        }
    })
}

#[cfg(test)]
mod tests {
    use std::io;

    use futures::stream;
    use indoc::indoc;

    use super::*;

    fn chunks(parts: &[&str]) -> impl Stream<Item = Result<Vec<u8>, io::Error>> + Send + 'static {
        let owned: Vec<_> = parts.iter().map(|p| Ok(p.as_bytes().to_vec())).collect();
        stream::iter(owned)
    }

    #[tokio::test]
    async fn malformed_line_between_valid_chunks_is_skipped() {
        let body = indoc! {r#"
            data: {"choices":[{"delta":{"content":"Hello"}}]}

            data: {"choices":[{"delta":{"content":

            data: {"choices":[{"delta":{"content":", world"}}]}

            data: [DONE]

        "#};

        let content = read_chat_stream(chunks(&[body]), Duration::from_secs(1)).await.unwrap();

        assert_eq!(content, "Hello, world");
    }

    #[tokio::test]
    async fn comments_and_other_fields_are_ignored() {
        let body = indoc! {r#"
            : keep-alive

            event: message
            id: 7
            data: {"choices":[{"delta":{"content":"a"}}]}

            data: {"choices":[{"message":{"content":"b"}}]}

        "#};

        let content = read_chat_stream(chunks(&[body]), Duration::from_secs(1)).await.unwrap();

        assert_eq!(content, "ab");
    }

    #[tokio::test]
    async fn events_split_across_byte_chunks_are_joined() {
        let parts = [
            "data: {\"choices\":[{\"delta\":",
            "{\"content\":\"split\"}}]}\n",
            "\ndata: [DONE]\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"after done\"}}]}\n\n",
        ];

        let content = read_chat_stream(chunks(&parts), Duration::from_secs(1)).await.unwrap();

        assert_eq!(content, "split");
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_stream_fails_with_idle_timeout() {
        let first = chunks(&["data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n"]);
        let stalled = first.chain(stream::pending());

        let error = read_chat_stream(stalled, Duration::from_secs(3)).await.unwrap_err();

        assert_eq!(error, StreamError::Idle(Duration::from_secs(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_idle_timeout_uses_default() {
        let stalled = stream::pending::<Result<Vec<u8>, io::Error>>();

        let error = read_chat_stream(stalled, Duration::ZERO).await.unwrap_err();

        assert_eq!(error, StreamError::Idle(DEFAULT_IDLE_TIMEOUT));
    }

    #[tokio::test]
    async fn transport_error_aborts_the_read() {
        let parts: Vec<Result<Vec<u8>, io::Error>> = vec![
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n".to_vec()),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ];

        let error = read_chat_stream(stream::iter(parts), Duration::from_secs(1))
            .await
            .unwrap_err();

        assert_eq!(error, StreamError::Transport("reset".to_string()));
    }
}
