use std::sync::Arc;

use crate::error::ProviderError;

use super::{
    AnthropicModel, AnthropicModelConfig, ChatCompletionsConfig, ChatCompletionsModel, Model,
    ModelProvider,
};

const DEFAULT_MODEL: &str = "gpt-4.1";

/// Routes model names to backends by prefix.
///
/// `anthropic/<model>` goes to the Anthropic backend; `openai/<model>` and
/// unprefixed names go to the chat-completions backend.
#[derive(Debug, Clone, Default)]
pub struct MultiProvider {
    anthropic_api_key: Option<String>,
    openai: Option<ChatCompletionsConfig>,
    default_model: Option<String>,
}

impl MultiProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Picks up `ANTHROPIC_API_KEY`, `OPENAI_API_KEY` and `OPENAI_BASE_URL`
    /// when present.
    pub fn from_env() -> Self {
        Self {
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            openai: ChatCompletionsConfig::from_env(DEFAULT_MODEL).ok(),
            default_model: None,
        }
    }

    pub fn with_anthropic_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.anthropic_api_key = Some(api_key.into());
        self
    }

    /// The model field of `config` is replaced per lookup.
    pub fn with_openai(mut self, config: ChatCompletionsConfig) -> Self {
        self.openai = Some(config);
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }
}

impl ModelProvider for MultiProvider {
    fn get_model(&self, name: Option<&str>) -> Result<Arc<dyn Model>, ProviderError> {
        let name = name
            .or(self.default_model.as_deref())
            .unwrap_or(DEFAULT_MODEL);

        let (prefix, model) = match name.split_once('/') {
            Some((prefix, model)) => (Some(prefix), model),
            None => (None, name),
        };

        match prefix {
            Some("anthropic") => {
                let api_key = self.anthropic_api_key.clone().ok_or_else(|| {
                    ProviderError::Request("anthropic api key is not configured".to_string())
                })?;
                let model = AnthropicModel::new(AnthropicModelConfig::new(api_key, model))?;
                Ok(Arc::new(model))
            }
            Some("openai") | None => {
                let mut config = self.openai.clone().ok_or_else(|| {
                    ProviderError::Request("openai api key is not configured".to_string())
                })?;
                config.model = model.to_string();
                Ok(Arc::new(ChatCompletionsModel::new(config)?))
            }
            Some(other) => Err(ProviderError::Request(format!(
                "unknown model prefix `{other}` in `{name}`"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_by_prefix() {
        let provider = MultiProvider::new()
            .with_anthropic_api_key("key")
            .with_openai(ChatCompletionsConfig::new("key", "unused"));

        assert!(provider.get_model(Some("anthropic/claude-sonnet-4-5")).is_ok());
        assert!(provider.get_model(Some("openai/gpt-4.1")).is_ok());
        assert!(provider.get_model(None).is_ok());
        assert!(provider.get_model(Some("mystery/model")).is_err());
    }

    #[test]
    fn missing_credentials_are_reported() {
        let provider = MultiProvider::new();
        let err = match provider.get_model(Some("anthropic/claude")) {
            Ok(_) => panic!("expected missing key"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("anthropic"));
    }
}
