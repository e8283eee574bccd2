//! Inference server request and streamed events

use crate::worker::GenerationParameters;
use serde::{Deserialize, Serialize};

/// Body of a streaming generation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub inputs: String,
    pub parameters: GenerationParameters,
}

/// Token carried by a streamed event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamToken {
    pub id: u32,
    pub text: String,
    pub logprob: f32,
    #[serde(default)]
    pub special: bool,
}

/// One server-pushed event of a generation stream
///
/// A non-empty `generated_text` marks the end of generation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(default)]
    pub token: Option<StreamToken>,

    #[serde(default)]
    pub generated_text: Option<String>,

    #[serde(default)]
    pub error: Option<String>,
}

impl StreamEvent {
    /// Final text if this event completes the generation
    pub fn completion(&self) -> Option<&str> {
        self.generated_text
            .as_deref()
            .filter(|text| !text.is_empty())
    }
}
