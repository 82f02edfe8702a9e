//! OpenAI chat-completions client. Venice exposes the same wire format.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::ProviderError;
use super::TextProvider;

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";
const VENICE_API_URL: &str = "https://api.venice.ai/api/v1/chat/completions";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Client for any OpenAI-compatible chat-completions endpoint.
pub struct OpenAiCompatibleProvider {
    name: String,
    client: Client,
    url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompatibleProvider {
    pub fn openai(api_key: String, model: String) -> Self {
        Self::with_url("openai", OPENAI_API_URL.to_string(), api_key, model)
    }

    pub fn venice(api_key: String, model: String, url: Option<String>) -> Self {
        Self::with_url(
            "venice",
            url.unwrap_or_else(|| VENICE_API_URL.to_string()),
            api_key,
            model,
        )
    }

    pub fn with_url(name: &str, url: String, api_key: String, model: String) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            name: name.to_string(),
            client,
            url,
            api_key,
            model,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[async_trait]
impl TextProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: 0.0,
        };

        let response = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(ProviderError::from_transport)?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(ProviderError::from_status(status.as_u16(), &body));
        }

        let parsed: ChatResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::parse_error(format!("Failed to parse response: {}, body: {}", e, body))
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or_else(|| ProviderError::parse_error("No content in response".to_string()))
    }
}
