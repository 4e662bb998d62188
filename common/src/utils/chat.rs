use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
        CreateChatCompletionRequestArgs, ResponseFormat, ResponseFormatJsonSchema,
    },
    Client,
};
use tracing::debug;

use crate::{error::AppError, utils::config::AppConfig};

/// Chat-model capability used by the graph builder for semantic entity
/// extraction and community summaries. Optional; everything structural works
/// without it.
#[derive(Clone)]
pub struct ChatModel {
    client: Client<OpenAIConfig>,
    model: String,
}

impl ChatModel {
    pub fn from_config(config: &AppConfig) -> Option<Self> {
        let model = config.chat_model.clone()?;
        let api_key = config.embedding.openai_api_key.clone()?;
        let client = Client::with_config(
            OpenAIConfig::new()
                .with_api_key(api_key)
                .with_api_base(&config.embedding.openai_base_url),
        );
        Some(Self { client, model })
    }

    pub async fn generate(&self, system: &str, user: &str) -> Result<String, AppError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(vec![
                ChatCompletionRequestSystemMessage::from(system).into(),
                ChatCompletionRequestUserMessage::from(user).into(),
            ])
            .build()?;

        let response = self.client.chat().create(request).await?;
        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| AppError::LLMParsing("chat completion returned no content".into()))?;

        Ok(content)
    }

    /// Request a completion constrained to a strict JSON schema and parse it.
    /// Malformed payloads are an `LLMParsing` error; callers are expected to
    /// fall back rather than write partial results.
    pub async fn generate_json(
        &self,
        system: &str,
        user: &str,
        schema_name: &str,
        schema: serde_json::Value,
    ) -> Result<serde_json::Value, AppError> {
        let response_format = ResponseFormat::JsonSchema {
            json_schema: ResponseFormatJsonSchema {
                description: None,
                name: schema_name.into(),
                schema: Some(schema),
                strict: Some(true),
            },
        };

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .response_format(response_format)
            .messages(vec![
                ChatCompletionRequestSystemMessage::from(system).into(),
                ChatCompletionRequestUserMessage::from(user).into(),
            ])
            .build()?;

        let response = self.client.chat().create(request).await?;
        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| AppError::LLMParsing("chat completion returned no content".into()))?;

        debug!(chars = content.len(), "parsing structured chat output");
        serde_json::from_str(&content)
            .map_err(|err| AppError::LLMParsing(format!("malformed structured output: {err}")))
    }
}
