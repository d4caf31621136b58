//! OpenAI-compatible chat completion client.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::types::{BridgeError, BridgeResult};

pub const MAX_TOKENS: u32 = 800;
pub const TEMPERATURE: f32 = 0.3;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CompletionClient {
    http: reqwest::Client,
    base: Url,
    api_key: Option<String>,
    model: String,
}

impl CompletionClient {
    pub fn new(http: reqwest::Client, base: Url, api_key: Option<String>, model: String) -> Self {
        Self {
            http,
            base,
            api_key,
            model,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Send a single user prompt and return the first choice's text.
    pub async fn complete(&self, prompt: &str) -> BridgeResult<String> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| BridgeError::Config(format!("{} cannot be a base URL", self.base)))?
            .pop_if_empty()
            .extend(["chat", "completions"]);

        let body = ChatRequest {
            model: &self.model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens: MAX_TOKENS,
            temperature: TEMPERATURE,
        };

        let mut request = self.http.post(url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let started = std::time::Instant::now();
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(BridgeError::status(response.status()));
        }
        let parsed: ChatResponse = response.json().await?;
        tracing::debug!(
            model = %self.model,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Completion received"
        );

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| BridgeError::Completion("Response had no content".to_string()))
    }
}
