//! Conversation items exchanged with the model and produced by a run.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::ToolOutput;
use crate::usage::Usage;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    Developer,
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    OutputText { text: String },
    Refusal { refusal: String },
}

/// An item of conversation history in the shape the model accepts as input.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputItem {
    Message {
        role: Role,
        content: String,
    },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
    ComputerCall {
        call_id: String,
        action: Value,
    },
    ComputerCallOutput {
        call_id: String,
        image_url: String,
    },
    Reasoning {
        summary: Vec<String>,
    },
    HostedToolCall {
        kind: String,
        payload: Value,
    },
    Raw {
        payload: Value,
    },
}

impl InputItem {
    pub fn user(content: impl Into<String>) -> Self {
        Self::Message {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Message {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::Message {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn function_output(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self::FunctionCallOutput {
            call_id: call_id.into(),
            output: output.into(),
        }
    }

    pub fn is_tool_related(&self) -> bool {
        matches!(
            self,
            Self::FunctionCall { .. }
                | Self::FunctionCallOutput { .. }
                | Self::ComputerCall { .. }
                | Self::ComputerCallOutput { .. }
                | Self::HostedToolCall { .. }
        )
    }
}

/// Caller-supplied input for a run.
#[derive(Clone, Debug, PartialEq)]
pub enum RunInput {
    Text(String),
    Items(Vec<InputItem>),
}

impl RunInput {
    pub fn to_items(&self) -> Vec<InputItem> {
        match self {
            Self::Text(text) => vec![InputItem::user(text.clone())],
            Self::Items(items) => items.clone(),
        }
    }
}

impl From<&str> for RunInput {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for RunInput {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<InputItem>> for RunInput {
    fn from(value: Vec<InputItem>) -> Self {
        Self::Items(value)
    }
}

/// One item of model output. New kinds from newer models land in `Unknown`.
#[derive(Clone, Debug, PartialEq)]
pub enum OutputItem {
    Message {
        id: Option<String>,
        content: Vec<ContentPart>,
    },
    FunctionCall {
        id: Option<String>,
        call_id: String,
        name: String,
        arguments: String,
    },
    ComputerCall {
        id: Option<String>,
        call_id: String,
        action: Value,
    },
    HostedToolCall {
        id: Option<String>,
        kind: String,
        payload: Value,
    },
    Reasoning {
        id: Option<String>,
        summary: Vec<String>,
    },
    Unknown {
        kind: String,
        payload: Value,
    },
}

impl OutputItem {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Message {
            id: None,
            content: vec![ContentPart::OutputText { text: text.into() }],
        }
    }

    pub fn function_call(
        call_id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self::FunctionCall {
            id: None,
            call_id: call_id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    pub fn to_input_item(&self) -> InputItem {
        match self {
            Self::Message { content, .. } => InputItem::assistant(message_text(content)),
            Self::FunctionCall {
                call_id,
                name,
                arguments,
                ..
            } => InputItem::FunctionCall {
                call_id: call_id.clone(),
                name: name.clone(),
                arguments: arguments.clone(),
            },
            Self::ComputerCall {
                call_id, action, ..
            } => InputItem::ComputerCall {
                call_id: call_id.clone(),
                action: action.clone(),
            },
            Self::HostedToolCall { kind, payload, .. } => InputItem::HostedToolCall {
                kind: kind.clone(),
                payload: payload.clone(),
            },
            Self::Reasoning { summary, .. } => InputItem::Reasoning {
                summary: summary.clone(),
            },
            Self::Unknown { kind, payload } => InputItem::Raw {
                payload: serde_json::json!({"type": kind, "payload": payload}),
            },
        }
    }
}

/// Concatenated `output_text` parts; refusals are skipped.
pub fn message_text(content: &[ContentPart]) -> String {
    content
        .iter()
        .filter_map(|part| match part {
            ContentPart::OutputText { text } => Some(text.as_str()),
            ContentPart::Refusal { .. } => None,
        })
        .collect()
}

/// The result of one model call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelResponse {
    pub output: Vec<OutputItem>,
    pub usage: Usage,
    pub response_id: Option<String>,
}

impl ModelResponse {
    pub fn to_input_items(&self) -> Vec<InputItem> {
        self.output.iter().map(OutputItem::to_input_item).collect()
    }
}

/// One step of history generated during a run, tagged with the agent that
/// produced it.
#[derive(Clone, Debug, PartialEq)]
pub enum RunItem {
    MessageOutput {
        agent: String,
        id: Option<String>,
        content: Vec<ContentPart>,
    },
    ToolCall {
        agent: String,
        call: OutputItem,
    },
    ToolCallOutput {
        agent: String,
        call_id: String,
        output: ToolOutput,
        raw: InputItem,
    },
    HandoffCall {
        agent: String,
        call_id: String,
        tool_name: String,
        arguments: String,
    },
    HandoffOutput {
        source: String,
        target: String,
        call_id: String,
        output: String,
    },
    Reasoning {
        agent: String,
        id: Option<String>,
        summary: Vec<String>,
    },
    Raw {
        agent: String,
        item: OutputItem,
    },
}

impl RunItem {
    pub fn agent_name(&self) -> &str {
        match self {
            Self::MessageOutput { agent, .. }
            | Self::ToolCall { agent, .. }
            | Self::ToolCallOutput { agent, .. }
            | Self::HandoffCall { agent, .. }
            | Self::Reasoning { agent, .. }
            | Self::Raw { agent, .. } => agent,
            Self::HandoffOutput { source, .. } => source,
        }
    }

    /// Stable name used for streamed item events.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::MessageOutput { .. } => "message_output_created",
            Self::ToolCall { .. } => "tool_called",
            Self::ToolCallOutput { .. } => "tool_output",
            Self::HandoffCall { .. } => "handoff_requested",
            Self::HandoffOutput { .. } => "handoff_occurred",
            Self::Reasoning { .. } => "reasoning_item_created",
            Self::Raw { .. } => "raw_item",
        }
    }

    pub fn to_input_item(&self) -> InputItem {
        match self {
            Self::MessageOutput { content, .. } => InputItem::assistant(message_text(content)),
            Self::ToolCall { call, .. } => call.to_input_item(),
            Self::ToolCallOutput { raw, .. } => raw.clone(),
            Self::HandoffCall {
                call_id,
                tool_name,
                arguments,
                ..
            } => InputItem::FunctionCall {
                call_id: call_id.clone(),
                name: tool_name.clone(),
                arguments: arguments.clone(),
            },
            Self::HandoffOutput {
                call_id, output, ..
            } => InputItem::function_output(call_id.clone(), output.clone()),
            Self::Reasoning { summary, .. } => InputItem::Reasoning {
                summary: summary.clone(),
            },
            Self::Raw { item, .. } => item.to_input_item(),
        }
    }

    pub fn is_tool_related(&self) -> bool {
        matches!(
            self,
            Self::ToolCall { .. }
                | Self::ToolCallOutput { .. }
                | Self::HandoffCall { .. }
                | Self::HandoffOutput { .. }
        )
    }
}

/// Text of the last message item in `items`, if any.
pub fn last_message_text(items: &[RunItem]) -> Option<String> {
    items.iter().rev().find_map(|item| match item {
        RunItem::MessageOutput { content, .. } => Some(message_text(content)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn input_items_serialize_with_type_tag() {
        let value = serde_json::to_value(InputItem::function_output("call_1", "4"))
            .expect("serializes");
        assert_eq!(
            value,
            json!({"type": "function_call_output", "call_id": "call_1", "output": "4"})
        );

        let message = serde_json::to_value(InputItem::user("hi")).expect("serializes");
        assert_eq!(message["role"], "user");
    }

    #[test]
    fn message_text_skips_refusals() {
        let content = vec![
            ContentPart::OutputText {
                text: "a".to_string(),
            },
            ContentPart::Refusal {
                refusal: "no".to_string(),
            },
            ContentPart::OutputText {
                text: "b".to_string(),
            },
        ];
        assert_eq!(message_text(&content), "ab");
    }

    #[test]
    fn handoff_items_convert_to_function_call_pair() {
        let call = RunItem::HandoffCall {
            agent: "triage".to_string(),
            call_id: "c1".to_string(),
            tool_name: "transfer_to_billing".to_string(),
            arguments: "{}".to_string(),
        };
        let output = RunItem::HandoffOutput {
            source: "triage".to_string(),
            target: "billing".to_string(),
            call_id: "c1".to_string(),
            output: "{\"assistant\": \"billing\"}".to_string(),
        };

        assert!(matches!(call.to_input_item(), InputItem::FunctionCall { .. }));
        assert!(matches!(
            output.to_input_item(),
            InputItem::FunctionCallOutput { .. }
        ));
        assert_eq!(output.agent_name(), "triage");
    }
}
