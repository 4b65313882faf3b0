//! OpenAI 兼容回复生成器
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）。

use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::llm::ReplyGenerator;

const SYSTEM_ROLE: &str =
    "You are a graduate enrollment counselor at Illinois Institute of Technology.";

/// OpenAI 兼容客户端：持有 Client 与 model 名
pub struct OpenAiReplyGenerator {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiReplyGenerator {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl ReplyGenerator for OpenAiReplyGenerator {
    async fn generate(&self, prompt: &str, timeout: Duration) -> Result<String> {
        let messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(SYSTEM_ROLE)
                    .build()
                    .map_err(|e| Error::ActionFailed(e.to_string()))?,
            ),
            ChatCompletionRequestMessage::User(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(prompt.to_string())
                    .build()
                    .map_err(|e| Error::ActionFailed(e.to_string()))?,
            ),
        ];

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .build()
            .map_err(|e| Error::ActionFailed(e.to_string()))?;

        let response = tokio::time::timeout(timeout, self.client.chat().create(request))
            .await
            .map_err(|_| Error::Timeout(timeout.as_secs(), "generate".to_string()))?
            .map_err(|e| Error::ActionFailed(e.to_string()))?;

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        if content.is_empty() {
            return Err(Error::ActionFailed("Empty completion".to_string()));
        }
        Ok(content)
    }
}
