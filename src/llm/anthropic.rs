use anthropic_ai_sdk::client::AnthropicClient;
use anthropic_ai_sdk::types::message::{
    ContentBlock, CreateMessageParams, CreateMessageResponse, Message, MessageClient, MessageError,
    RequiredMessageParams, Role as MessageRole, Thinking, ThinkingType, Tool,
    ToolChoice as AnthropicToolChoice,
};
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::error::ProviderError;
use crate::items::{ContentPart, InputItem, ModelResponse, OutputItem, Role};
use crate::llm::{Model, ModelRequest, ToolChoice, ToolDefinition};
use crate::usage::Usage;

#[derive(Debug, Clone)]
/// Runtime configuration for [`AnthropicModel`].
pub struct AnthropicModelConfig {
    /// Anthropic API key.
    pub api_key: String,
    /// Model id (for example `claude-sonnet-4-5`).
    pub model: String,
    /// Anthropic API version header value.
    pub api_version: String,
    /// Optional base URL override for proxies or compatible endpoints.
    pub api_base_url: Option<String>,
    /// Output token cap used when the request settings leave it unset.
    pub max_tokens: u32,
}

impl AnthropicModelConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            api_version: AnthropicClient::DEFAULT_API_VERSION.to_string(),
            api_base_url: None,
            max_tokens: 4096,
        }
    }

    /// Reads `ANTHROPIC_API_KEY` from the environment.
    pub fn from_env(model: impl Into<String>) -> Result<Self, ProviderError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| ProviderError::Request("ANTHROPIC_API_KEY is not set".to_string()))?;
        Ok(Self::new(api_key, model))
    }
}

#[derive(Debug, Clone)]
/// [`Model`] backed by the Anthropic Messages API.
pub struct AnthropicModel {
    client: AnthropicClient,
    config: AnthropicModelConfig,
}

impl AnthropicModel {
    pub fn new(config: AnthropicModelConfig) -> Result<Self, ProviderError> {
        let mut builder =
            AnthropicClient::builder(config.api_key.clone(), config.api_version.clone());
        if let Some(url) = &config.api_base_url {
            builder = builder.with_api_base_url(url.clone());
        }

        let client = builder
            .build::<MessageError>()
            .map_err(|err| ProviderError::Request(err.to_string()))?;

        Ok(Self { client, config })
    }

    pub fn from_env(model: impl Into<String>) -> Result<Self, ProviderError> {
        Self::new(AnthropicModelConfig::from_env(model)?)
    }

    fn build_params(&self, request: &ModelRequest) -> Result<CreateMessageParams, ProviderError> {
        let (history, mut system_lines) = to_anthropic_messages(&request.input);
        if let Some(instructions) = &request.system_instructions {
            system_lines.insert(0, instructions.clone());
        }
        if let Some(output) = &request.output_schema {
            system_lines.push(format!(
                "Respond only with a JSON document matching this schema named {}:\n{}",
                output.name, output.schema
            ));
        }

        let settings = &request.model_settings;
        let required = RequiredMessageParams {
            model: self.config.model.clone(),
            messages: history,
            max_tokens: settings.max_tokens.unwrap_or(self.config.max_tokens),
        };

        let mut params = CreateMessageParams::new(required).with_stream(false);

        if !system_lines.is_empty() {
            params = params.with_system(system_lines.join("\n\n"));
        }
        if let Some(temperature) = settings.temperature {
            params = params.with_temperature(temperature);
        }
        if let Some(top_p) = settings.top_p {
            params = params.with_top_p(top_p);
        }
        if let Some(budget_tokens) = settings.reasoning_budget_tokens {
            params = params.with_thinking(Thinking {
                budget_tokens: budget_tokens as usize,
                type_: ThinkingType::Enabled,
            });
        }

        let mut tools = Vec::new();
        for tool in &request.tools {
            match tool {
                ToolDefinition::Function {
                    name,
                    description,
                    parameters,
                    ..
                } => tools.push(Tool {
                    name: name.clone(),
                    description: Some(description.clone()),
                    input_schema: parameters.clone(),
                }),
                other => {
                    return Err(ProviderError::Request(format!(
                        "anthropic backend does not support tool `{}`",
                        other.name()
                    )));
                }
            }
        }
        for handoff in &request.handoffs {
            tools.push(Tool {
                name: handoff.tool_name.clone(),
                description: Some(handoff.tool_description.clone()),
                input_schema: handoff.input_json_schema.clone(),
            });
        }

        if !tools.is_empty() {
            params = params.with_tools(tools);
            if let Some(choice) = &settings.tool_choice {
                params = params.with_tool_choice(match choice {
                    ToolChoice::Auto => AnthropicToolChoice::Auto,
                    ToolChoice::Required => AnthropicToolChoice::Any,
                    ToolChoice::None => AnthropicToolChoice::None,
                    ToolChoice::Named(name) => AnthropicToolChoice::Tool { name: name.clone() },
                });
            }
        }

        Ok(params)
    }
}

#[async_trait]
impl Model for AnthropicModel {
    async fn get_response(&self, request: &ModelRequest) -> Result<ModelResponse, ProviderError> {
        let params = self.build_params(request)?;

        let response = self
            .client
            .create_message(Some(&params))
            .await
            .map_err(|err| ProviderError::Request(err.to_string()))?;

        Ok(normalize_response(&response))
    }
}

/// Converts conversation items into Anthropic messages plus system lines.
///
/// Consecutive assistant text and tool calls share one assistant message;
/// consecutive tool results share one user message.
fn to_anthropic_messages(items: &[InputItem]) -> (Vec<Message>, Vec<String>) {
    let mut system_lines = Vec::new();
    let mut messages = Vec::new();
    // `Some(true)` while collecting a user message, `Some(false)` for assistant.
    let mut pending_user: Option<bool> = None;
    let mut pending: Vec<ContentBlock> = Vec::new();

    for item in items {
        let (role, block) = match item {
            InputItem::Message {
                role: Role::System | Role::Developer,
                content,
            } => {
                system_lines.push(content.clone());
                continue;
            }
            InputItem::Message {
                role: Role::User,
                content,
            } => (
                MessageRole::User,
                ContentBlock::Text {
                    text: content.clone(),
                },
            ),
            InputItem::Message {
                role: Role::Assistant,
                content,
            } => {
                if content.is_empty() {
                    continue;
                }
                (
                    MessageRole::Assistant,
                    ContentBlock::Text {
                        text: content.clone(),
                    },
                )
            }
            InputItem::FunctionCall {
                call_id,
                name,
                arguments,
            } => (
                MessageRole::Assistant,
                ContentBlock::ToolUse {
                    id: call_id.clone(),
                    name: name.clone(),
                    input: serde_json::from_str(arguments)
                        .unwrap_or_else(|_| Value::Object(Default::default())),
                },
            ),
            InputItem::FunctionCallOutput { call_id, output } => (
                MessageRole::User,
                ContentBlock::ToolResult {
                    tool_use_id: call_id.clone(),
                    content: output.clone(),
                },
            ),
            other => {
                debug!(item = ?other, "skipping input item unsupported by anthropic backend");
                continue;
            }
        };

        let is_user = matches!(role, MessageRole::User);
        if pending_user != Some(is_user) {
            flush(&mut messages, pending_user, &mut pending);
            pending_user = Some(is_user);
        }
        pending.push(block);
    }
    flush(&mut messages, pending_user, &mut pending);

    (messages, system_lines)
}

fn flush(messages: &mut Vec<Message>, pending_user: Option<bool>, blocks: &mut Vec<ContentBlock>) {
    let Some(is_user) = pending_user else {
        return;
    };
    if blocks.is_empty() {
        return;
    }
    let role = if is_user {
        MessageRole::User
    } else {
        MessageRole::Assistant
    };
    messages.push(Message::new_blocks(role, std::mem::take(blocks)));
}

fn normalize_response(response: &CreateMessageResponse) -> ModelResponse {
    let mut output = Vec::new();

    for block in &response.content {
        match block {
            ContentBlock::Text { text } => output.push(OutputItem::Message {
                id: Some(response.id.clone()),
                content: vec![ContentPart::OutputText { text: text.clone() }],
            }),
            ContentBlock::ToolUse { id, name, input } => output.push(OutputItem::FunctionCall {
                id: None,
                call_id: id.clone(),
                name: name.clone(),
                arguments: input.to_string(),
            }),
            ContentBlock::Thinking { thinking, .. } => output.push(OutputItem::Reasoning {
                id: None,
                summary: vec![thinking.clone()],
            }),
            ContentBlock::RedactedThinking { data } => output.push(OutputItem::Reasoning {
                id: None,
                summary: vec![format!("[redacted:{} bytes]", data.len())],
            }),
            other => debug!(block = ?other, "ignoring anthropic content block"),
        }
    }

    ModelResponse {
        output,
        usage: Usage::new(
            1,
            u64::from(response.usage.input_tokens),
            u64::from(response.usage.output_tokens),
        ),
        response_id: Some(response.id.clone()),
    }
}
