//! Public types for the Huginn API.

mod message;
mod options;
mod response;
mod tool;

pub use message::{Message, Role};
pub use options::ChatOptions;
pub use response::{CHARS_PER_TOKEN, ChatResponse, Usage};
pub use tool::{ToolCall, ToolDefinition};
