use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

const MAX_ERROR_BODY_CHARS: usize = 4 * 1024;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generation provider returned {status}: {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("invalid generation request: {0}")]
    InvalidRequest(String),
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
    #[error("generation timed out after {0:?}")]
    Timeout(Duration),
    #[error("generation was interrupted: {0}")]
    Interrupted(String),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<String>,
    /// Extra provider fields. Keys that collide with the fields above are
    /// ignored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_options: Option<Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<u64>,
    #[serde(default)]
    pub data: Vec<GeneratedImage>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneratedImage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub b64_json: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revised_prompt: Option<String>,
}

/// The rate-limited provider behind the admission queue. Implementations are
/// opaque remote calls; they are never retried by the gate.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationResponse, GenerationError>;
}

/// Calls an OpenAI-style `images/generations` endpoint.
#[derive(Clone)]
pub struct HttpGenerationBackend {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: Option<String>,
}

impl std::fmt::Debug for HttpGenerationBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpGenerationBackend")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .finish()
    }
}

impl HttpGenerationBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: None,
            model: None,
        }
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        let api_key = api_key.into();
        self.api_key = (!api_key.trim().is_empty()).then_some(api_key);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        let model = model.into();
        self.model = (!model.trim().is_empty()).then_some(model);
        self
    }

    fn images_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with("/images/generations") {
            base.to_string()
        } else {
            format!("{base}/images/generations")
        }
    }

    fn request_body(&self, request: GenerationRequest) -> Result<Map<String, Value>, GenerationError> {
        if request.prompt.trim().is_empty() {
            return Err(GenerationError::InvalidRequest(
                "prompt must not be empty".to_string(),
            ));
        }

        let mut body = Map::<String, Value>::new();
        let model = request
            .model
            .filter(|model| !model.trim().is_empty())
            .or_else(|| self.model.clone());
        if let Some(model) = model {
            body.insert("model".to_string(), Value::String(model));
        }
        body.insert("prompt".to_string(), Value::String(request.prompt));
        if let Some(n) = request.n {
            body.insert("n".to_string(), Value::Number(n.into()));
        }
        if let Some(size) = request.size.filter(|size| !size.trim().is_empty()) {
            body.insert("size".to_string(), Value::String(size));
        }
        if let Some(format) = request
            .response_format
            .filter(|format| !format.trim().is_empty())
        {
            body.insert("response_format".to_string(), Value::String(format));
        }

        if let Some(options) = request.provider_options {
            let Value::Object(options) = options else {
                return Err(GenerationError::InvalidRequest(
                    "provider_options must be a JSON object".to_string(),
                ));
            };
            for (key, value) in options {
                if body.contains_key(&key) {
                    tracing::debug!(key = %key, "provider option collides with a request field; ignoring");
                    continue;
                }
                body.insert(key, value);
            }
        }
        Ok(body)
    }
}

#[async_trait]
impl GenerationBackend for HttpGenerationBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationResponse, GenerationError> {
        let body = self.request_body(request)?;
        let mut req = self.http.post(self.images_url()).json(&body);
        if let Some(api_key) = self.api_key.as_deref() {
            req = req.bearer_auth(api_key);
        }

        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            let mut text = response.text().await.unwrap_or_default();
            if text.chars().count() > MAX_ERROR_BODY_CHARS {
                text = text.chars().take(MAX_ERROR_BODY_CHARS).collect();
                text.push_str("...(truncated)");
            }
            return Err(GenerationError::Api { status, body: text });
        }

        let parsed = response.json::<GenerationResponse>().await?;
        if parsed.data.is_empty() {
            return Err(GenerationError::InvalidResponse(
                "provider returned no images".to_string(),
            ));
        }
        Ok(parsed)
    }
}
