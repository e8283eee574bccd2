//! Prompt construction
//!
//! Renders a conversation into the plain-text prompt expected by the model:
//! a fixed persona preamble with a scripted greeting, one `Role: text` line
//! per turn, and a trailing assistant cue.

use chatrelay_proto::{ConversationMessage, Role};

/// Persona description followed by the scripted assistant greeting
pub const PREAMBLE: &str = "The following is a conversation between a user and an assistant. \
The assistant is helpful, creative, clever, and very friendly.\n\
Assistant: Hello! How can I help you today?\n";

/// Cue asking the model for the next assistant turn
pub const ASSISTANT_CUE: &str = "\nAssistant:";

fn role_prefix(role: Role) -> &'static str {
    match role {
        Role::User => "User: ",
        Role::Assistant => "Assistant: ",
    }
}

/// Build the model prompt for a conversation
pub fn build_prompt(conversation: &[ConversationMessage]) -> String {
    let turns = conversation
        .iter()
        .map(|message| format!("{}{}", role_prefix(message.role), message.text))
        .collect::<Vec<_>>()
        .join("\n");

    let mut prompt = String::with_capacity(PREAMBLE.len() + turns.len() + ASSISTANT_CUE.len());
    prompt.push_str(PREAMBLE);
    prompt.push_str(&turns);
    prompt.push_str(ASSISTANT_CUE);
    prompt
}
