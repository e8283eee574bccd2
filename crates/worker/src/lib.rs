//! ChatRelay Worker
//!
//! Bridges an orchestration backend and a text-generation server: accepts
//! one assignment at a time over a websocket control connection, turns it
//! into a streaming generation request, and relays the generated tokens
//! back in the control connection's packet format.

pub mod connection;
pub mod handler;
pub mod inference;
pub mod prompt;
pub mod relay;
pub mod sse;

pub use connection::{ConnectionManager, ConnectionState, ControlSink};
pub use handler::{AssignmentOutcome, PacketSink, WorkHandler};
pub use inference::{InferenceBackend, InferenceClient};
pub use prompt::build_prompt;
pub use relay::StreamRelay;
pub use sse::EventStream;
