//! Response types

use super::message::Message;
use serde::{Deserialize, Serialize};

/// Characters per token used for payload-size usage estimates.
pub const CHARS_PER_TOKEN: usize = 4;

/// Non-streaming chat response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub message: Message,
    pub usage: Usage,
    /// Model that produced the response.
    pub model: String,
}

/// Token usage for one call.
///
/// `estimated` is true when the numbers come from the payload-size heuristic
/// rather than backend-reported counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub estimated: bool,
}

impl Usage {
    /// Estimate usage from request and response payload sizes in bytes.
    pub fn estimate(request_bytes: usize, response_bytes: usize) -> Self {
        let prompt = (request_bytes / CHARS_PER_TOKEN) as u32;
        let completion = (response_bytes / CHARS_PER_TOKEN) as u32;
        Self {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
            estimated: true,
        }
    }

    /// Usage reported by the backend.
    pub fn reported(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            estimated: false,
        }
    }
}
