//! ChatRelay wire types
//!
//! Message shapes exchanged on the two sides of the worker: the control
//! connection to the orchestration backend (`worker`) and the streaming
//! generation endpoint of the inference server (`inference`).

pub mod inference;
pub mod worker;

pub use inference::{GenerateRequest, StreamEvent, StreamToken};
pub use worker::{
    ConversationMessage, GeneratedTextResponse, GenerationParameters, Role, TokenResponse,
    WorkAssignment, WorkErrorResponse, WorkResponsePacket, WorkerIdentity,
};
