//! Assignment handling
//!
//! Drives one assignment end to end: prompt, streaming inference request,
//! relay, and forwarding of every packet to the control connection.

use crate::inference::InferenceBackend;
use crate::prompt::build_prompt;
use crate::relay::StreamRelay;
use async_trait::async_trait;
use chatrelay_common::{ChatRelayError, Result, METRICS};
use chatrelay_proto::{GenerateRequest, WorkAssignment, WorkResponsePacket};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Send half of the control connection
///
/// This is the only capability the handler gets: it can emit packets but
/// cannot read or close the connection.
#[async_trait]
pub trait PacketSink: Send {
    async fn send_packet(&mut self, packet: &WorkResponsePacket) -> Result<()>;
}

#[async_trait]
impl PacketSink for Vec<WorkResponsePacket> {
    async fn send_packet(&mut self, packet: &WorkResponsePacket) -> Result<()> {
        self.push(packet.clone());
        Ok(())
    }
}

/// Result of a completed assignment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentOutcome {
    /// Text of the terminal packet
    pub generated_text: String,

    /// Token packets forwarded before it
    pub tokens: usize,
}

/// Runs assignments against an inference backend
#[derive(Clone)]
pub struct WorkHandler {
    backend: Arc<dyn InferenceBackend>,
    send_error_packets: bool,
}

impl WorkHandler {
    pub fn new(backend: Arc<dyn InferenceBackend>) -> Self {
        Self {
            backend,
            send_error_packets: false,
        }
    }

    /// Close failed assignments with an error packet instead of silence
    pub fn with_error_packets(mut self, enabled: bool) -> Self {
        self.send_error_packets = enabled;
        self
    }

    /// Serve one assignment
    ///
    /// Transport errors from `sink` are returned untouched. Any other error
    /// means the assignment failed; with error packets enabled the failure
    /// is reported on `sink` before returning. Completion and failure
    /// accounting belongs to the caller, which also sees abandoned runs.
    pub async fn handle<P>(&self, assignment: &WorkAssignment, sink: &mut P) -> Result<AssignmentOutcome>
    where
        P: PacketSink + ?Sized,
    {
        let start = Instant::now();

        match self.relay(assignment, sink).await {
            Ok(outcome) => {
                info!(
                    tokens = outcome.tokens,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Assignment completed"
                );
                Ok(outcome)
            }
            Err(e) => {
                if self.send_error_packets && !e.is_transport() {
                    sink.send_packet(&WorkResponsePacket::error(e.to_string()))
                        .await?;
                }
                Err(e)
            }
        }
    }

    async fn relay<P>(&self, assignment: &WorkAssignment, sink: &mut P) -> Result<AssignmentOutcome>
    where
        P: PacketSink + ?Sized,
    {
        let request = GenerateRequest {
            inputs: build_prompt(&assignment.conversation),
            parameters: assignment.parameters.clone(),
        };
        debug!(
            turns = assignment.conversation.len(),
            max_new_tokens = request.parameters.max_new_tokens,
            "Built prompt"
        );

        let requested_at = Instant::now();
        let events = self.backend.generate_stream(&request).await?;
        let mut relay = StreamRelay::new(events);
        let mut first_packet = true;

        while let Some(packet) = relay.next().await {
            let packet = packet?;

            if first_packet {
                METRICS
                    .inference
                    .time_to_first_token
                    .observe(requested_at.elapsed().as_secs_f64());
                first_packet = false;
            }

            sink.send_packet(&packet).await?;

            if let WorkResponsePacket::End { generated_text, .. } = packet {
                return Ok(AssignmentOutcome {
                    generated_text: generated_text.text,
                    tokens: relay.tokens(),
                });
            }
            METRICS.worker.tokens_relayed_total.inc();
        }

        Err(ChatRelayError::incomplete("relay closed without a terminal packet"))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sse::EventStream;
    use chatrelay_proto::ConversationMessage;
    use futures::stream;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Backend answering each request with the next scripted reply
    pub(crate) struct ScriptedBackend {
        replies: Mutex<VecDeque<Result<Vec<String>>>>,
        pub(crate) requests: Mutex<Vec<GenerateRequest>>,
    }

    impl ScriptedBackend {
        pub(crate) fn new(replies: Vec<Result<Vec<String>>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl InferenceBackend for ScriptedBackend {
        async fn generate_stream(&self, request: &GenerateRequest) -> Result<EventStream> {
            self.requests.lock().unwrap().push(request.clone());
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ChatRelayError::Internal("no scripted reply".into())));
            let events = reply?;
            Ok(stream::iter(events.into_iter().map(Ok)).boxed())
        }
    }

    /// Sink whose connection is already gone
    struct BrokenSink;

    #[async_trait]
    impl PacketSink for BrokenSink {
        async fn send_packet(&mut self, _packet: &WorkResponsePacket) -> Result<()> {
            Err(ChatRelayError::closed("peer went away"))
        }
    }

    fn hello_there() -> Vec<String> {
        vec![
            r#"{"token":{"id":1,"text":"Hello","logprob":-0.1}}"#.to_string(),
            r#"{"token":{"id":2,"text":" there","logprob":-0.2}}"#.to_string(),
            r#"{"generated_text":"Hello there"}"#.to_string(),
        ]
    }

    fn status_error() -> ChatRelayError {
        ChatRelayError::InferenceStatus {
            status: 500,
            body: "boom".to_string(),
        }
    }

    #[tokio::test]
    async fn test_relays_tokens_then_terminal() {
        let backend = Arc::new(ScriptedBackend::new(vec![Ok(hello_there())]));
        let handler = WorkHandler::new(backend.clone());
        let assignment = WorkAssignment::new(vec![ConversationMessage::user("Hi")]);
        let mut sink: Vec<WorkResponsePacket> = Vec::new();

        let outcome = handler.handle(&assignment, &mut sink).await.unwrap();

        assert_eq!(
            sink,
            vec![
                WorkResponsePacket::token("Hello", -0.1, 1),
                WorkResponsePacket::token(" there", -0.2, 2),
                WorkResponsePacket::end("Hello there"),
            ]
        );
        assert_eq!(outcome.generated_text, "Hello there");
        assert_eq!(outcome.tokens, 2);

        let requests = backend.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].inputs.ends_with("User: Hi\nAssistant:"));
        assert_eq!(requests[0].parameters, assignment.parameters);
    }

    #[tokio::test]
    async fn test_error_status_sends_nothing() {
        let backend = Arc::new(ScriptedBackend::new(vec![Err(status_error())]));
        let handler = WorkHandler::new(backend);
        let assignment = WorkAssignment::new(vec![ConversationMessage::user("Hi")]);
        let mut sink: Vec<WorkResponsePacket> = Vec::new();

        let result = handler.handle(&assignment, &mut sink).await;

        assert!(matches!(
            result,
            Err(ChatRelayError::InferenceStatus { status: 500, .. })
        ));
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_incomplete_stream_has_no_terminal() {
        let mut events = hello_there();
        events.pop();
        let backend = Arc::new(ScriptedBackend::new(vec![Ok(events)]));
        let handler = WorkHandler::new(backend);
        let assignment = WorkAssignment::new(vec![ConversationMessage::user("Hi")]);
        let mut sink: Vec<WorkResponsePacket> = Vec::new();

        let result = handler.handle(&assignment, &mut sink).await;

        assert!(matches!(result, Err(ChatRelayError::IncompleteGeneration(_))));
        assert_eq!(sink.len(), 2);
        assert!(sink.iter().all(|p| !p.is_terminal()));
    }

    #[tokio::test]
    async fn test_error_packets_when_enabled() {
        let backend = Arc::new(ScriptedBackend::new(vec![Err(status_error())]));
        let handler = WorkHandler::new(backend).with_error_packets(true);
        let assignment = WorkAssignment::new(vec![ConversationMessage::user("Hi")]);
        let mut sink: Vec<WorkResponsePacket> = Vec::new();

        let result = handler.handle(&assignment, &mut sink).await;

        assert!(result.is_err());
        assert_eq!(sink.len(), 1);
        assert!(matches!(
            &sink[0],
            WorkResponsePacket::Error { error } if error.message.contains("500")
        ));
    }

    #[tokio::test]
    async fn test_sink_failure_is_transport() {
        let backend = Arc::new(ScriptedBackend::new(vec![Ok(hello_there())]));
        let handler = WorkHandler::new(backend).with_error_packets(true);
        let assignment = WorkAssignment::new(vec![ConversationMessage::user("Hi")]);

        let result = handler.handle(&assignment, &mut BrokenSink).await;

        assert!(matches!(result, Err(ref e) if e.is_transport()));
    }
}
