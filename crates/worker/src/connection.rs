//! Control connection management
//!
//! Owns the websocket to the orchestration backend. The connection moves
//! through `Disconnected -> Connecting -> Handshaking -> Ready`, alternates
//! between `Ready` and `Busy` while serving assignments, and falls back to
//! `Disconnected` on close or transport error, after which it reconnects
//! after a fixed delay, forever.
//!
//! Exactly one assignment is served at a time. The inbound half is still
//! read while `Busy`: a close or transport error abandons the active
//! assignment immediately, and any assignment arriving meanwhile is
//! rejected (logged and counted, never queued or answered).

use crate::handler::{PacketSink, WorkHandler};
use async_trait::async_trait;
use chatrelay_common::config::WorkerConfig;
use chatrelay_common::{ChatRelayError, Result, METRICS};
use chatrelay_proto::{WorkAssignment, WorkResponsePacket, WorkerIdentity};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use std::fmt;
use std::time::Instant;
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Control connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    Busy,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Ready => "ready",
            ConnectionState::Busy => "busy",
        };
        f.write_str(name)
    }
}

/// Outbound half of the control connection
pub struct ControlSink<S> {
    inner: S,
}

impl<S> ControlSink<S>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin + Send,
{
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    /// Send a value as a JSON text frame
    pub async fn send_json<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        let text = serde_json::to_string(value)?;
        self.inner.send(Message::text(text)).await?;
        Ok(())
    }

    pub async fn close(&mut self) -> Result<()> {
        self.inner.close().await?;
        Ok(())
    }
}

#[async_trait]
impl<S> PacketSink for ControlSink<S>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin + Send,
{
    async fn send_packet(&mut self, packet: &WorkResponsePacket) -> Result<()> {
        self.send_json(packet).await
    }
}

/// Keeps the worker connected to the orchestration backend
pub struct ConnectionManager {
    config: WorkerConfig,
    identity: WorkerIdentity,
    handler: WorkHandler,
    state: watch::Sender<ConnectionState>,
}

impl ConnectionManager {
    pub fn new(config: WorkerConfig, identity: WorkerIdentity, handler: WorkHandler) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            identity,
            handler,
            state,
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "Connection state changed");
        }
    }

    /// Connect, serve and reconnect until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        let endpoint = self.config.work_endpoint();
        let delay = self.config.reconnect_delay();

        while !shutdown.is_cancelled() {
            match self.connect_and_serve(&endpoint, &shutdown).await {
                Ok(()) => info!("Control connection closed"),
                Err(e) if e.is_transport() => warn!(error = %e, "Control connection lost"),
                Err(e) => error!(error = %e, "Control connection failed"),
            }

            METRICS.worker.connected.set(0);
            self.set_state(ConnectionState::Disconnected);

            if shutdown.is_cancelled() {
                break;
            }

            info!(delay_ms = delay.as_millis() as u64, "Reconnecting after delay");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("Connection manager stopped");
    }

    async fn connect_and_serve(&self, endpoint: &str, shutdown: &CancellationToken) -> Result<()> {
        self.set_state(ConnectionState::Connecting);
        METRICS.worker.connection_attempts.inc();
        info!(endpoint, "Connecting to backend");

        let connect = tokio::time::timeout(self.config.connect_timeout(), connect_async(endpoint));
        let (socket, _response) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            connected = connect => connected.map_err(|_| {
                ChatRelayError::connection(format!("timed out connecting to {}", endpoint))
            })??,
        };

        let (sink, inbound) = socket.split();
        self.serve(ControlSink::new(sink), inbound, shutdown).await
    }

    /// Run the handshake and the message loop on an established connection
    ///
    /// Returns `Ok` on orderly close or shutdown, and an error when the
    /// connection is lost.
    pub async fn serve<S, R>(
        &self,
        mut sink: ControlSink<S>,
        mut inbound: R,
        shutdown: &CancellationToken,
    ) -> Result<()>
    where
        S: Sink<Message, Error = tungstenite::Error> + Unpin + Send,
        R: Stream<Item = std::result::Result<Message, tungstenite::Error>> + Unpin + Send,
    {
        self.set_state(ConnectionState::Handshaking);
        info!("Connected to backend, sending handshake");
        sink.send_json(&self.identity).await?;

        METRICS.worker.connected.set(1);
        self.set_state(ConnectionState::Ready);
        info!(model = %self.identity.model_name, "Handshake sent, waiting for work");

        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, closing control connection");
                    let _ = sink.close().await;
                    return Ok(());
                }
                message = inbound.next() => message,
            };

            match message.ok_or_else(|| ChatRelayError::closed("inbound stream ended"))?? {
                Message::Text(text) => match serde_json::from_str::<WorkAssignment>(&text) {
                    Ok(assignment) => {
                        self.run_assignment(assignment, &mut sink, &mut inbound)
                            .await?
                    }
                    Err(e) => warn!(error = %e, "Ignoring malformed message from backend"),
                },
                Message::Close(frame) => {
                    info!(?frame, "Backend closed the connection");
                    return Ok(());
                }
                Message::Binary(data) => {
                    warn!(len = data.len(), "Ignoring binary message from backend")
                }
                _ => {}
            }
        }
    }

    async fn run_assignment<S, R>(
        &self,
        assignment: WorkAssignment,
        sink: &mut ControlSink<S>,
        inbound: &mut R,
    ) -> Result<()>
    where
        S: Sink<Message, Error = tungstenite::Error> + Unpin + Send,
        R: Stream<Item = std::result::Result<Message, tungstenite::Error>> + Unpin + Send,
    {
        METRICS.worker.assignments_total.inc();
        self.set_state(ConnectionState::Busy);

        let span = info_span!("assignment", id = %assignment.id);
        info!(parent: &span, turns = assignment.conversation.len(), "Received assignment");
        let start = Instant::now();

        // every exit below, abandonment included, goes through the accounting after the loop
        let result = {
            let work = self
                .handler
                .handle(&assignment, sink)
                .instrument(span.clone());
            tokio::pin!(work);

            loop {
                tokio::select! {
                    biased;

                    result = &mut work => break result,
                    message = inbound.next() => match message {
                        None => {
                            warn!(parent: &span, "Connection closed, abandoning assignment");
                            break Err(ChatRelayError::closed("inbound stream ended during assignment"));
                        }
                        Some(Err(e)) => {
                            warn!(parent: &span, error = %e, "Transport error, abandoning assignment");
                            break Err(e.into());
                        }
                        Some(Ok(Message::Text(text))) => self.reject_overlapping(&assignment, &text),
                        Some(Ok(Message::Close(frame))) => {
                            warn!(parent: &span, ?frame, "Backend closed the connection, abandoning assignment");
                            break Err(ChatRelayError::closed("backend closed the connection during assignment"));
                        }
                        Some(Ok(_)) => {}
                    }
                }
            }
        };

        METRICS
            .worker
            .assignment_duration
            .observe(start.elapsed().as_secs_f64());

        match result {
            Ok(_) => {
                METRICS.worker.assignments_completed.inc();
                self.set_state(ConnectionState::Ready);
                Ok(())
            }
            Err(e) if e.is_transport() => {
                METRICS.worker.assignments_failed.inc();
                Err(e)
            }
            Err(e) => {
                METRICS.worker.assignments_failed.inc();
                error!(parent: &span, error = %e, "Assignment failed");
                self.set_state(ConnectionState::Ready);
                Ok(())
            }
        }
    }

    fn reject_overlapping(&self, active: &WorkAssignment, text: &str) {
        match serde_json::from_str::<WorkAssignment>(text) {
            Ok(rejected) => {
                METRICS.worker.assignments_rejected.inc();
                warn!(
                    active = %active.id,
                    rejected = %rejected.id,
                    "Rejecting assignment received while busy"
                );
            }
            Err(e) => warn!(error = %e, "Ignoring malformed message from backend"),
        }
    }
}
