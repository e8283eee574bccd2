//! Token stream relay
//!
//! Converts inference event payloads into outbound [`WorkResponsePacket`]s.
//! The relay yields token packets in generation order, then exactly one
//! terminal packet, then nothing. A stream that ends without a completion
//! event yields a final [`ChatRelayError::IncompleteGeneration`] instead.

use chatrelay_common::{ChatRelayError, Result};
use chatrelay_proto::{StreamEvent, WorkResponsePacket};
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::trace;

/// Relay state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Consuming events
    Streaming,

    /// Terminal packet or error emitted; the inner stream is not polled again
    Finished,
}

/// Lazy packet stream over an inference event stream
pub struct StreamRelay<S> {
    events: S,
    state: RelayState,
    tokens: usize,
}

impl<S> StreamRelay<S>
where
    S: Stream<Item = Result<String>> + Unpin,
{
    pub fn new(events: S) -> Self {
        Self {
            events,
            state: RelayState::Streaming,
            tokens: 0,
        }
    }

    /// Number of token packets yielded so far
    pub fn tokens(&self) -> usize {
        self.tokens
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    fn packet_for(&mut self, payload: &str) -> Result<WorkResponsePacket> {
        let event: StreamEvent = serde_json::from_str(payload)
            .map_err(|e| ChatRelayError::malformed(format!("{}: {}", e, payload)))?;

        if let Some(message) = event.error {
            return Err(ChatRelayError::Inference(message));
        }

        if let Some(text) = event.completion() {
            self.state = RelayState::Finished;
            return Ok(WorkResponsePacket::end(text));
        }

        let token = event
            .token
            .ok_or_else(|| ChatRelayError::malformed(format!("event without token: {}", payload)))?;

        self.tokens += 1;
        Ok(WorkResponsePacket::token(token.text, token.logprob, token.id))
    }
}

impl<S> Stream for StreamRelay<S>
where
    S: Stream<Item = Result<String>> + Unpin,
{
    type Item = Result<WorkResponsePacket>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.state == RelayState::Finished {
            return Poll::Ready(None);
        }

        let item = match self.events.poll_next_unpin(cx) {
            Poll::Ready(item) => item,
            Poll::Pending => return Poll::Pending,
        };

        let result = match item {
            Some(Ok(payload)) => {
                trace!(payload = %payload, "Received inference event");
                self.packet_for(&payload)
            }
            Some(Err(e)) => Err(e),
            None => Err(ChatRelayError::incomplete(format!(
                "stream ended after {} tokens without a completion event",
                self.tokens
            ))),
        };

        if result.is_err() {
            self.state = RelayState::Finished;
        }

        Poll::Ready(Some(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn events(payloads: &[&str]) -> impl Stream<Item = Result<String>> + Unpin {
        stream::iter(
            payloads
                .iter()
                .map(|p| Ok(p.to_string()))
                .collect::<Vec<_>>(),
        )
    }

    async fn relay_all(payloads: &[&str]) -> Vec<Result<WorkResponsePacket>> {
        StreamRelay::new(events(payloads)).collect().await
    }

    #[tokio::test]
    async fn test_tokens_then_terminal() {
        let packets = relay_all(&[
            r#"{"token":{"id":1,"text":"Hello","logprob":-0.1}}"#,
            r#"{"token":{"id":2,"text":" there","logprob":-0.2}}"#,
            r#"{"generated_text":"Hello there"}"#,
        ])
        .await;
        let packets: Vec<WorkResponsePacket> = packets.into_iter().map(|p| p.unwrap()).collect();

        assert_eq!(
            packets,
            vec![
                WorkResponsePacket::token("Hello", -0.1, 1),
                WorkResponsePacket::token(" there", -0.2, 2),
                WorkResponsePacket::end("Hello there"),
            ]
        );
    }

    #[tokio::test]
    async fn test_nothing_after_terminal() {
        let mut relay = StreamRelay::new(events(&[
            r#"{"token":{"id":1,"text":"a","logprob":-0.1}}"#,
            r#"{"token":{"id":2,"text":"b","logprob":-0.1},"generated_text":"ab"}"#,
            r#"{"token":{"id":3,"text":"c","logprob":-0.1}}"#,
            r#"{"generated_text":"abc"}"#,
        ]));

        let mut packets = Vec::new();
        while let Some(packet) = relay.next().await {
            packets.push(packet.unwrap());
        }

        assert_eq!(packets.len(), 2);
        assert_eq!(packets[1], WorkResponsePacket::end("ab"));
        assert_eq!(relay.tokens(), 1);
        assert_eq!(relay.state(), RelayState::Finished);
        assert!(relay.next().await.is_none());
    }

    #[tokio::test]
    async fn test_terminal_text_is_authoritative() {
        let packets = relay_all(&[
            r#"{"token":{"id":1,"text":"Hi","logprob":-0.1}}"#,
            r#"{"token":{"id":2,"text":"\nUser:","logprob":-0.3}}"#,
            r#"{"generated_text":"Hi"}"#,
        ])
        .await;

        let concatenated: String = packets
            .iter()
            .filter_map(|p| match p {
                Ok(WorkResponsePacket::Token { token }) => Some(token.text.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(concatenated, "Hi\nUser:");
        assert_eq!(
            packets.last().unwrap().as_ref().unwrap(),
            &WorkResponsePacket::end("Hi")
        );
    }

    #[tokio::test]
    async fn test_empty_generated_text_is_a_token() {
        let packets = relay_all(&[
            r#"{"token":{"id":5,"text":"x","logprob":-1.0},"generated_text":""}"#,
            r#"{"generated_text":"x"}"#,
        ])
        .await;

        assert_eq!(packets.len(), 2);
        assert_eq!(
            packets[0].as_ref().unwrap(),
            &WorkResponsePacket::token("x", -1.0, 5)
        );
    }

    #[tokio::test]
    async fn test_missing_completion_fails() {
        let packets = relay_all(&[
            r#"{"token":{"id":1,"text":"a","logprob":-0.1}}"#,
            r#"{"token":{"id":2,"text":"b","logprob":-0.1}}"#,
        ])
        .await;

        assert_eq!(packets.len(), 3);
        assert!(packets[..2].iter().all(|p| p.is_ok()));
        assert!(matches!(
            packets[2],
            Err(ChatRelayError::IncompleteGeneration(_))
        ));
        assert!(!packets
            .iter()
            .any(|p| matches!(p, Ok(packet) if packet.is_terminal())));
    }

    #[tokio::test]
    async fn test_empty_stream_fails() {
        let packets = relay_all(&[]).await;

        assert_eq!(packets.len(), 1);
        assert!(matches!(
            packets[0],
            Err(ChatRelayError::IncompleteGeneration(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_event_stops_relay() {
        let packets = relay_all(&[
            r#"{"token":{"id":1,"text":"a","logprob":-0.1}}"#,
            "not json",
            r#"{"generated_text":"a"}"#,
        ])
        .await;

        assert_eq!(packets.len(), 2);
        assert!(matches!(packets[1], Err(ChatRelayError::MalformedEvent(_))));
    }

    #[tokio::test]
    async fn test_event_without_token_is_malformed() {
        let packets = relay_all(&[r#"{"details":null}"#]).await;

        assert_eq!(packets.len(), 1);
        assert!(matches!(packets[0], Err(ChatRelayError::MalformedEvent(_))));
    }

    #[tokio::test]
    async fn test_backend_error_event() {
        let packets = relay_all(&[
            r#"{"token":{"id":1,"text":"a","logprob":-0.1}}"#,
            r#"{"error":"Request failed during generation","error_type":"generation"}"#,
        ])
        .await;

        assert_eq!(packets.len(), 2);
        assert!(matches!(
            &packets[1],
            Err(ChatRelayError::Inference(message)) if message.contains("during generation")
        ));
    }
}
