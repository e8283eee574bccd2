//! Control connection messages
//!
//! The worker sends a [`WorkerIdentity`] once per connection, receives
//! [`WorkAssignment`]s and answers each one with a sequence of
//! [`WorkResponsePacket`]s closed by exactly one terminal packet.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Handshake message sent immediately after connecting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerIdentity {
    /// Model served by this worker
    pub model_name: String,
}

impl WorkerIdentity {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
        }
    }
}

/// Author of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[serde(alias = "prompter")]
    User,
    Assistant,
}

/// One turn of the conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub text: String,
}

impl ConversationMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}

/// Sampling parameters forwarded verbatim to the inference server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParameters {
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: u32,

    #[serde(default = "default_do_sample")]
    pub do_sample: bool,

    #[serde(default = "default_top_k")]
    pub top_k: Option<u32>,

    #[serde(default = "default_top_p")]
    pub top_p: Option<f32>,

    #[serde(default = "default_temperature")]
    pub temperature: Option<f32>,

    #[serde(default = "default_seed")]
    pub seed: Option<u64>,
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self {
            max_new_tokens: default_max_new_tokens(),
            do_sample: default_do_sample(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            temperature: default_temperature(),
            seed: default_seed(),
        }
    }
}

fn default_max_new_tokens() -> u32 {
    100
}

fn default_do_sample() -> bool {
    true
}

fn default_top_k() -> Option<u32> {
    Some(50)
}

fn default_top_p() -> Option<f32> {
    Some(0.9)
}

fn default_temperature() -> Option<f32> {
    Some(1.0)
}

fn default_seed() -> Option<u64> {
    Some(42)
}

/// Unit of generation work sent by the orchestration backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkAssignment {
    /// Correlation id; generated locally when the backend omits it
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,

    /// Conversation history in turn order
    pub conversation: Vec<ConversationMessage>,

    #[serde(flatten)]
    pub parameters: GenerationParameters,
}

impl WorkAssignment {
    pub fn new(conversation: Vec<ConversationMessage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation,
            parameters: GenerationParameters::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub text: String,
    pub log_prob: f32,
    pub token_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedTextResponse {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkErrorResponse {
    pub message: String,
}

/// Outbound packet for an assignment
///
/// `End` and `Error` are terminal: nothing may follow them for the same
/// assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkResponsePacket {
    End {
        is_end: bool,
        generated_text: GeneratedTextResponse,
    },
    Error {
        error: WorkErrorResponse,
    },
    Token {
        token: TokenResponse,
    },
}

impl WorkResponsePacket {
    pub fn token(text: impl Into<String>, log_prob: f32, token_id: u32) -> Self {
        WorkResponsePacket::Token {
            token: TokenResponse {
                text: text.into(),
                log_prob,
                token_id,
            },
        }
    }

    pub fn end(text: impl Into<String>) -> Self {
        WorkResponsePacket::End {
            is_end: true,
            generated_text: GeneratedTextResponse { text: text.into() },
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        WorkResponsePacket::Error {
            error: WorkErrorResponse {
                message: message.into(),
            },
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkResponsePacket::Token { .. })
    }
}
