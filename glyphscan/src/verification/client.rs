//! Verifier collaborator and an OpenAI-compatible chat-completions client.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose};
use serde::Deserialize;
use serde_json::{Value, json};

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const API_KEY_VAR: &str = "OPENAI_API_KEY";
pub const BASE_URL_VAR: &str = "OPENAI_BASE_URL";
/// Completion budget for one judgment.
pub const MAX_TOKENS: u32 = 400;

/// Everything a verifier needs to judge one candidate group.
#[derive(Clone)]
pub struct VerificationRequest {
    pub group_label: String,
    pub verifier_model: String,
    pub system_prompt: String,
    pub task_instructions: String,
    /// Darkened satellite composite, PNG.
    pub context_png: Vec<u8>,
    /// Stitched 8-bit prediction, PNG.
    pub prediction_png: Vec<u8>,
}

impl fmt::Debug for VerificationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationRequest")
            .field("group_label", &self.group_label)
            .field("verifier_model", &self.verifier_model)
            .field("context_png", &self.context_png.len())
            .field("prediction_png", &self.prediction_png.len())
            .finish_non_exhaustive()
    }
}

/// External judge of candidate groups.
///
/// Returns the raw payload text; callers treat it as untrusted.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, request: &VerificationRequest) -> anyhow::Result<String>;
}

pub fn png_data_url(png: &[u8]) -> String {
    format!("data:image/png;base64,{}", general_purpose::STANDARD.encode(png))
}

/// Chat-completions body: a system message, then the instructions followed by
/// the composite and prediction images.
pub fn chat_body(request: &VerificationRequest) -> Value {
    json!({
        "model": request.verifier_model,
        "max_tokens": MAX_TOKENS,
        "messages": [
            { "role": "system", "content": request.system_prompt },
            {
                "role": "user",
                "content": [
                    { "type": "text", "text": request.task_instructions },
                    {
                        "type": "image_url",
                        "image_url": { "url": png_data_url(&request.context_png), "detail": "auto" }
                    },
                    {
                        "type": "image_url",
                        "image_url": { "url": png_data_url(&request.prediction_png), "detail": "auto" }
                    }
                ]
            }
        ]
    })
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// Verifier backed by an OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiVerifier {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl fmt::Debug for OpenAiVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiVerifier")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl OpenAiVerifier {
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: OPENAI_BASE_URL.to_string(),
        })
    }

    /// Reads the API key from `OPENAI_API_KEY` and an optional base URL from
    /// `OPENAI_BASE_URL`.
    pub fn from_env(timeout: Duration) -> anyhow::Result<Self> {
        let api_key = std::env::var(API_KEY_VAR).with_context(|| format!("{API_KEY_VAR} is not set"))?;
        let verifier = Self::new(api_key, timeout)?;
        Ok(match std::env::var(BASE_URL_VAR) {
            Ok(url) => verifier.with_base_url(url),
            Err(_) => verifier,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Verifier for OpenAiVerifier {
    async fn verify(&self, request: &VerificationRequest) -> anyhow::Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        tracing::info!(group = %request.group_label, model = %request.verifier_model, "Calling verifier");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&chat_body(request))
            .send()
            .await
            .context("Failed to send verification request")?
            .error_for_status()
            .context("Verifier returned an error status")?;

        let chat: ChatResponse = response
            .json()
            .await
            .context("Failed to parse chat completion response")?;

        match chat.choices.into_iter().next().and_then(|c| c.message.content) {
            Some(content) => Ok(content),
            None => bail!("Chat completion has no message content"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> VerificationRequest {
        VerificationRequest {
            group_label: "group_0_coords_1_2".to_string(),
            verifier_model: "gpt-4o".to_string(),
            system_prompt: "system".to_string(),
            task_instructions: "judge".to_string(),
            context_png: vec![1, 2, 3],
            prediction_png: vec![255],
        }
    }

    #[test]
    fn data_url_is_base64_png() {
        assert_eq!(png_data_url(&[1, 2, 3]), "data:image/png;base64,AQID");
    }

    #[test]
    fn body_carries_prompts_and_both_images_in_order() {
        let body = chat_body(&request());
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["max_tokens"], 400);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "system");

        let parts = body["messages"][1]["content"].as_array().unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0]["text"], "judge");
        assert_eq!(parts[1]["image_url"]["url"], "data:image/png;base64,AQID");
        assert_eq!(parts[2]["image_url"]["url"], "data:image/png;base64,/w==");
        assert_eq!(parts[2]["image_url"]["detail"], "auto");
    }

    #[test]
    fn base_url_drops_trailing_slash() {
        let verifier = OpenAiVerifier::new("key", Duration::from_secs(5))
            .unwrap()
            .with_base_url("http://localhost:8080/v1/");
        assert_eq!(verifier.base_url(), "http://localhost:8080/v1");
        assert!(!format!("{verifier:?}").contains("key"));
    }

    #[test]
    fn debug_omits_image_bytes() {
        let text = format!("{:?}", request());
        assert!(text.contains("group_0_coords_1_2"));
        assert!(text.contains("context_png: 3"));
    }
}
