use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::Deserialize;

use crate::models::schema::Criticality;

/// Per-call knobs for document-grounded generation.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub temperature: Option<f64>,
    pub max_output_tokens: Option<u32>,
}

/// The language-model collaborator. Provider selection and fallback are
/// entirely internal to implementations; callers only express a
/// criticality hint.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Plain text-in/text-out completion.
    async fn ask(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        criticality: Criticality,
        max_output_tokens: Option<u32>,
    ) -> Result<String, ModelError>;

    /// Completion grounded in an attached file (e.g. a PDF page range).
    async fn generate_with_buffers(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        file_bytes: &[u8],
        mime_type: &str,
        criticality: Criticality,
        options: GenerateOptions,
        correlation_id: Option<&str>,
    ) -> Result<String, ModelError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("HTTP request to Workers AI failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Workers AI returned an error: {0}")]
    Provider(String),

    #[error("Workers AI response had no text payload")]
    EmptyResponse,
}

/// Client for Cloudflare Workers AI text models.
pub struct WorkersAiClient {
    http: Client,
    account_id: String,
    api_token: String,
}

#[derive(Deserialize)]
struct AiResponse {
    result: Option<AiResult>,
    #[serde(default)]
    errors: Vec<AiError>,
}

#[derive(Deserialize)]
struct AiResult {
    response: Option<String>,
}

#[derive(Deserialize)]
struct AiError {
    message: String,
}

impl WorkersAiClient {
    pub fn new(account_id: String, api_token: String) -> Self {
        Self {
            http: Client::new(),
            account_id,
            api_token,
        }
    }

    /// Map the caller's criticality hint to a concrete model tier.
    fn model_for(criticality: Criticality) -> &'static str {
        match criticality {
            Criticality::High => "@cf/meta/llama-3.3-70b-instruct-fp8-fast",
            Criticality::Medium | Criticality::Low => "@cf/meta/llama-3.1-8b-instruct",
        }
    }

    async fn run(
        &self,
        model: &str,
        body: serde_json::Value,
    ) -> Result<String, ModelError> {
        let url = format!(
            "https://api.cloudflare.com/client/v4/accounts/{}/ai/run/{}",
            self.account_id, model
        );

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&body)
            .send()
            .await?;

        let ai_resp: AiResponse = response.json().await?;

        if let Some(err) = ai_resp.errors.first() {
            return Err(ModelError::Provider(err.message.clone()));
        }

        ai_resp
            .result
            .and_then(|r| r.response)
            .ok_or(ModelError::EmptyResponse)
    }
}

#[async_trait]
impl ModelClient for WorkersAiClient {
    async fn ask(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        criticality: Criticality,
        max_output_tokens: Option<u32>,
    ) -> Result<String, ModelError> {
        let body = serde_json::json!({
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_prompt },
            ],
            "max_tokens": max_output_tokens.unwrap_or(4096),
        });

        self.run(Self::model_for(criticality), body).await
    }

    async fn generate_with_buffers(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        file_bytes: &[u8],
        mime_type: &str,
        criticality: Criticality,
        options: GenerateOptions,
        correlation_id: Option<&str>,
    ) -> Result<String, ModelError> {
        if let Some(id) = correlation_id {
            tracing::debug!(correlation_id = %id, mime_type = %mime_type, "Sending file-grounded generation request");
        }

        let encoded = base64::engine::general_purpose::STANDARD.encode(file_bytes);
        let body = serde_json::json!({
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_prompt },
            ],
            "attachments": [
                { "mime_type": mime_type, "data": encoded },
            ],
            "temperature": options.temperature.unwrap_or(0.0),
            "max_tokens": options.max_output_tokens.unwrap_or(8192),
        });

        self.run(Self::model_for(criticality), body).await
    }
}
