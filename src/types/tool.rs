//! Tool types for function calling

use crate::HuginnError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tool definition for function calling.
///
/// Serialized in the OpenAI-style envelope the backend expects:
/// `{"type": "function", "function": {name, description, parameters}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireTool", try_from = "WireTool")]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: String,
    function: WireFunction,
}

#[derive(Serialize, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    parameters: Value,
}

impl From<ToolDefinition> for WireTool {
    fn from(tool: ToolDefinition) -> Self {
        WireTool {
            kind: "function".into(),
            function: WireFunction {
                name: tool.name,
                description: tool.description,
                parameters: tool.parameters,
            },
        }
    }
}

impl TryFrom<WireTool> for ToolDefinition {
    type Error = HuginnError;

    fn try_from(wire: WireTool) -> Result<Self, Self::Error> {
        if wire.kind != "function" {
            return Err(HuginnError::InvalidInput(format!(
                "unsupported tool type '{}'",
                wire.kind
            )));
        }
        Ok(ToolDefinition {
            name: wire.function.name,
            description: wire.function.description,
            parameters: wire.function.parameters,
        })
    }
}

/// A tool call made by the model.
///
/// The backend sends arguments as a JSON object rather than an encoded string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireToolCall", into = "WireToolCall")]
pub struct ToolCall {
    pub name: String,
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }

    /// Parse the arguments into a typed struct
    pub fn parse_arguments<T: serde::de::DeserializeOwned>(
        &self,
    ) -> std::result::Result<T, serde_json::Error> {
        serde_json::from_value(self.arguments.clone())
    }
}

#[derive(Serialize, Deserialize)]
struct WireToolCall {
    function: WireCall,
}

#[derive(Serialize, Deserialize)]
struct WireCall {
    name: String,
    #[serde(default)]
    arguments: Value,
}

impl From<WireToolCall> for ToolCall {
    fn from(wire: WireToolCall) -> Self {
        ToolCall {
            name: wire.function.name,
            arguments: wire.function.arguments,
        }
    }
}

impl From<ToolCall> for WireToolCall {
    fn from(call: ToolCall) -> Self {
        WireToolCall {
            function: WireCall {
                name: call.name,
                arguments: call.arguments,
            },
        }
    }
}
