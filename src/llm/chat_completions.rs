use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::ProviderError;
use crate::items::{ContentPart, InputItem, ModelResponse, OutputItem, Role};
use crate::llm::{Model, ModelRequest, ToolChoice, ToolDefinition};
use crate::usage::{InputTokensDetails, OutputTokensDetails, Usage};

const DEFAULT_API_BASE_URL: &str = "https://api.openai.com/v1";
const EMPTY_USER_CONTENT_FALLBACK: &str = " ";

#[derive(Debug, Clone)]
pub struct ChatCompletionsConfig {
    pub api_key: String,
    pub model: String,
    pub api_base_url: Option<String>,
    pub organization: Option<String>,
    pub project: Option<String>,
}

impl ChatCompletionsConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            api_base_url: None,
            organization: None,
            project: None,
        }
    }

    /// Reads `OPENAI_API_KEY` and, when set, `OPENAI_BASE_URL`.
    pub fn from_env(model: impl Into<String>) -> Result<Self, ProviderError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ProviderError::Request("OPENAI_API_KEY is not set".to_string()))?;
        let mut config = Self::new(api_key, model);
        config.api_base_url = std::env::var("OPENAI_BASE_URL").ok();
        Ok(config)
    }
}

/// [`Model`] speaking the OpenAI-compatible `/chat/completions` protocol.
#[derive(Debug, Clone)]
pub struct ChatCompletionsModel {
    client: Client,
    config: ChatCompletionsConfig,
}

impl ChatCompletionsModel {
    pub fn new(config: ChatCompletionsConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .build()
            .map_err(|err| ProviderError::Request(err.to_string()))?;

        Ok(Self { client, config })
    }

    pub fn from_env(model: impl Into<String>) -> Result<Self, ProviderError> {
        Self::new(ChatCompletionsConfig::from_env(model)?)
    }

    fn endpoint(&self) -> String {
        let base = self
            .config
            .api_base_url
            .as_deref()
            .unwrap_or(DEFAULT_API_BASE_URL)
            .trim_end_matches('/');
        format!("{base}/chat/completions")
    }
}

#[async_trait]
impl Model for ChatCompletionsModel {
    async fn get_response(&self, request: &ModelRequest) -> Result<ModelResponse, ProviderError> {
        let payload = build_request(request, &self.config.model)?;

        let mut call = self
            .client
            .post(self.endpoint())
            .header("authorization", format!("Bearer {}", self.config.api_key))
            .header("content-type", "application/json");
        if let Some(organization) = &self.config.organization {
            call = call.header("OpenAI-Organization", organization);
        }
        if let Some(project) = &self.config.project {
            call = call.header("OpenAI-Project", project);
        }

        let response = call
            .json(&payload)
            .send()
            .await
            .map_err(|err| ProviderError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(ProviderError::Request(extract_api_error(response).await));
        }

        let payload = response
            .json::<ChatCompletionResponse>()
            .await
            .map_err(|err| ProviderError::Response(err.to_string()))?;

        normalize_response(payload)
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatRequestMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ChatToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<ChatToolChoicePayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parallel_tool_calls: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    store: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
enum ChatRequestMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ChatToolCall>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Debug, Serialize)]
struct ChatToolDefinition {
    #[serde(rename = "type")]
    type_: String,
    function: ChatToolFunctionDefinition,
}

#[derive(Debug, Serialize)]
struct ChatToolFunctionDefinition {
    name: String,
    description: String,
    parameters: Value,
    strict: bool,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ChatToolChoicePayload {
    Mode(String),
    Specific {
        #[serde(rename = "type")]
        type_: String,
        function: ChatToolChoiceFunction,
    },
}

#[derive(Debug, Serialize)]
struct ChatToolChoiceFunction {
    name: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    type_: String,
    json_schema: ResponseJsonSchema,
}

#[derive(Debug, Serialize)]
struct ResponseJsonSchema {
    name: String,
    schema: Value,
    strict: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct ChatToolCall {
    id: String,
    #[serde(rename = "type")]
    type_: String,
    function: ChatToolCallFunction,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct ChatToolCallFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatAssistantMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatAssistantMessage {
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ChatToolCall>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    total_tokens: Option<u64>,
    prompt_tokens_details: Option<PromptTokenDetails>,
    completion_tokens_details: Option<CompletionTokenDetails>,
}

#[derive(Debug, Deserialize)]
struct PromptTokenDetails {
    cached_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CompletionTokenDetails {
    reasoning_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: Option<String>,
    #[serde(rename = "type")]
    type_: Option<String>,
    code: Option<Value>,
}

fn function_definition(
    name: &str,
    description: &str,
    parameters: &Value,
    strict: bool,
) -> ChatToolDefinition {
    ChatToolDefinition {
        type_: "function".to_string(),
        function: ChatToolFunctionDefinition {
            name: name.to_string(),
            description: description.to_string(),
            parameters: parameters.clone(),
            strict,
        },
    }
}

fn build_request(
    request: &ModelRequest,
    model: &str,
) -> Result<ChatCompletionRequest, ProviderError> {
    let mut messages = Vec::new();
    if let Some(instructions) = request
        .system_instructions
        .as_ref()
        .filter(|text| !text.is_empty())
    {
        messages.push(ChatRequestMessage::System {
            content: instructions.clone(),
        });
    }
    messages.extend(to_chat_messages(&request.input));
    if messages.is_empty() {
        messages.push(ChatRequestMessage::User {
            content: EMPTY_USER_CONTENT_FALLBACK.to_string(),
        });
    }

    let mut tools = Vec::new();
    for tool in &request.tools {
        match tool {
            ToolDefinition::Function {
                name,
                description,
                parameters,
                strict,
            } => tools.push(function_definition(name, description, parameters, *strict)),
            other => {
                return Err(ProviderError::Request(format!(
                    "chat completions backend does not support tool `{}`",
                    other.name()
                )));
            }
        }
    }
    for handoff in &request.handoffs {
        tools.push(function_definition(
            &handoff.tool_name,
            &handoff.tool_description,
            &handoff.input_json_schema,
            handoff.strict,
        ));
    }

    let settings = &request.model_settings;
    let has_tools = !tools.is_empty();
    let tool_choice = settings
        .tool_choice
        .as_ref()
        .filter(|_| has_tools)
        .map(|choice| match choice {
            ToolChoice::Auto => ChatToolChoicePayload::Mode("auto".to_string()),
            ToolChoice::Required => ChatToolChoicePayload::Mode("required".to_string()),
            ToolChoice::None => ChatToolChoicePayload::Mode("none".to_string()),
            ToolChoice::Named(name) => ChatToolChoicePayload::Specific {
                type_: "function".to_string(),
                function: ChatToolChoiceFunction { name: name.clone() },
            },
        });

    let response_format = request.output_schema.as_ref().map(|spec| ResponseFormat {
        type_: "json_schema".to_string(),
        json_schema: ResponseJsonSchema {
            name: spec.name.clone(),
            schema: spec.schema.clone(),
            strict: spec.strict,
        },
    });

    Ok(ChatCompletionRequest {
        model: model.to_string(),
        messages,
        tools: has_tools.then_some(tools),
        tool_choice,
        parallel_tool_calls: settings.parallel_tool_calls.filter(|_| has_tools),
        response_format,
        temperature: settings.temperature,
        top_p: settings.top_p,
        frequency_penalty: settings.frequency_penalty,
        presence_penalty: settings.presence_penalty,
        max_tokens: settings.max_tokens,
        store: settings.store,
        metadata: settings.metadata.clone(),
    })
}

fn to_chat_messages(items: &[InputItem]) -> Vec<ChatRequestMessage> {
    let mut messages: Vec<ChatRequestMessage> = Vec::new();

    for item in items {
        match item {
            InputItem::Message { role, content } => {
                if content.is_empty() {
                    continue;
                }
                messages.push(match role {
                    Role::System | Role::Developer => ChatRequestMessage::System {
                        content: content.clone(),
                    },
                    Role::User => ChatRequestMessage::User {
                        content: content.clone(),
                    },
                    Role::Assistant => ChatRequestMessage::Assistant {
                        content: Some(content.clone()),
                        tool_calls: Vec::new(),
                    },
                });
            }
            InputItem::FunctionCall {
                call_id,
                name,
                arguments,
            } => {
                let call = ChatToolCall {
                    id: call_id.clone(),
                    type_: "function".to_string(),
                    function: ChatToolCallFunction {
                        name: name.clone(),
                        arguments: arguments.clone(),
                    },
                };
                match messages.last_mut() {
                    Some(ChatRequestMessage::Assistant { tool_calls, .. }) => tool_calls.push(call),
                    _ => messages.push(ChatRequestMessage::Assistant {
                        content: None,
                        tool_calls: vec![call],
                    }),
                }
            }
            InputItem::FunctionCallOutput { call_id, output } => {
                messages.push(ChatRequestMessage::Tool {
                    tool_call_id: call_id.clone(),
                    content: output.clone(),
                });
            }
            other => {
                debug!(item = ?other, "skipping input item unsupported by chat completions");
            }
        }
    }

    messages
}

fn normalize_response(response: ChatCompletionResponse) -> Result<ModelResponse, ProviderError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Response("response missing choices".to_string()))?;

    let message = choice
        .message
        .ok_or_else(|| ProviderError::Response("response missing choice message".to_string()))?;

    let mut output = Vec::new();
    if let Some(reasoning) = message.reasoning_content.filter(|text| !text.is_empty()) {
        output.push(OutputItem::Reasoning {
            id: None,
            summary: vec![reasoning],
        });
    }

    let mut content = Vec::new();
    if let Some(text) = message.content.filter(|text| !text.is_empty()) {
        content.push(ContentPart::OutputText { text });
    }
    if let Some(refusal) = message.refusal.filter(|text| !text.is_empty()) {
        content.push(ContentPart::Refusal { refusal });
    }
    if !content.is_empty() {
        output.push(OutputItem::Message {
            id: response.id.clone(),
            content,
        });
    }

    for tool_call in message.tool_calls {
        output.push(OutputItem::FunctionCall {
            id: None,
            call_id: tool_call.id,
            name: tool_call.function.name,
            arguments: tool_call.function.arguments,
        });
    }

    let usage = response
        .usage
        .map(|usage| {
            let input_tokens = usage.prompt_tokens.unwrap_or(0);
            let output_tokens = usage.completion_tokens.unwrap_or(0);
            Usage {
                requests: 1,
                input_tokens,
                output_tokens,
                total_tokens: usage.total_tokens.unwrap_or(input_tokens + output_tokens),
                input_tokens_details: InputTokensDetails {
                    cached_tokens: usage
                        .prompt_tokens_details
                        .and_then(|details| details.cached_tokens),
                },
                output_tokens_details: OutputTokensDetails {
                    reasoning_tokens: usage
                        .completion_tokens_details
                        .and_then(|details| details.reasoning_tokens),
                },
            }
        })
        .unwrap_or_else(|| Usage::new(1, 0, 0));

    Ok(ModelResponse {
        output,
        usage,
        response_id: response.id,
    })
}

async fn extract_api_error(response: reqwest::Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    if let Ok(parsed) = serde_json::from_str::<ApiErrorEnvelope>(&body) {
        let code = parsed
            .error
            .code
            .map(|value| match value {
                Value::String(value) => value,
                other => other.to_string(),
            })
            .unwrap_or_else(|| status.as_u16().to_string());
        let error_type = parsed
            .error
            .type_
            .unwrap_or_else(|| status.to_string().to_uppercase());
        let message = parsed
            .error
            .message
            .unwrap_or_else(|| "unknown api error".to_string());

        return format!("api error {code} {error_type}: {message}");
    }

    if body.is_empty() {
        format!("api request failed ({status})")
    } else {
        format!("api request failed ({status}): {body}")
    }
}
