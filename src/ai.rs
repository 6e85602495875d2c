//! Client for the generative-AI completion backend.
//!
//! The hub never looks inside completions; this module only turns a prompt
//! (and optionally an image) into text, or into a classified failure.

use std::time::Duration;

use axum::http::StatusCode;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::{header::RETRY_AFTER, Client};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::{mask_key, Config};

#[derive(thiserror::Error, Debug)]
pub enum AiError {
    #[error("AI backend is not configured")]
    Disabled,

    #[error("Rate limited by the AI backend")]
    RateLimited { retry_after: Option<u64> },

    #[error("AI backend unreachable: {0}")]
    Unreachable(String),

    #[error("AI request timed out")]
    Timeout,

    #[error("AI backend returned {status}: {body}")]
    Server { status: u16, body: String },

    #[error("Unreadable AI response: {0}")]
    Decode(String),
}

impl AiError {
    pub fn status(&self) -> StatusCode {
        match self {
            AiError::Disabled => StatusCode::SERVICE_UNAVAILABLE,
            AiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AiError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            AiError::Server { status, .. } if (400..500).contains(status) => StatusCode::BAD_REQUEST,
            AiError::Unreachable(_) | AiError::Server { .. } | AiError::Decode(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn retryable(&self) -> bool {
        match self {
            AiError::Unreachable(_) => true,
            AiError::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for AiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            AiError::Timeout
        } else if e.is_decode() {
            AiError::Decode(e.to_string())
        } else {
            AiError::Unreachable(e.to_string())
        }
    }
}

#[derive(Clone)]
pub struct AiClient {
    http: Client,
    base: String,
    model: String,
    key: Option<String>,
    max_retries: u32,
}

impl AiClient {
    pub fn new(cfg: &Config) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(cfg.ai_timeout).build()?;
        Ok(Self {
            http,
            base: cfg.gemini_base.trim_end_matches('/').to_string(),
            model: cfg.gemini_model.clone(),
            key: cfg.gemini_key.clone(),
            max_retries: cfg.ai_max_retries,
        })
    }

    pub fn enabled(&self) -> bool {
        self.key.is_some()
    }

    /// One completion. `model` and `api_key` override the configured ones.
    /// 5xx answers and network failures are retried with linear back-off;
    /// a 429 is returned at once.
    pub async fn complete(
        &self,
        prompt: &str,
        image: Option<&[u8]>,
        model: Option<&str>,
        api_key: Option<&str>,
    ) -> Result<String, AiError> {
        let key = api_key.or(self.key.as_deref()).ok_or(AiError::Disabled)?;
        let model = model.filter(|m| !m.is_empty()).unwrap_or(self.model.as_str());
        let url = format!("{}/models/{}:generateContent", self.base, model);
        let body = request_body(prompt, image);
        info!(%model, key = %mask_key(key), image = image.is_some(), chars = prompt.len(), "ai request");

        let mut attempt = 0;
        loop {
            match self.attempt(&url, key, &body).await {
                Err(e) if e.retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(error = %e, attempt, "ai request failed, retrying");
                    tokio::time::sleep(Duration::from_millis(1500 * u64::from(attempt))).await;
                }
                res => return res,
            }
        }
    }

    async fn attempt(&self, url: &str, key: &str, body: &Value) -> Result<String, AiError> {
        let resp = self.http.post(url).query(&[("key", key)]).json(body).send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(AiError::RateLimited { retry_after });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AiError::Server { status: status.as_u16(), body });
        }
        let json: Value = resp.json().await?;
        completion_text(&json)
    }
}

fn image_mime(bytes: &[u8]) -> &'static str {
    match bytes {
        [0xFF, 0xD8, ..] => "image/jpeg",
        [b'G', b'I', b'F', ..] => "image/gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
        _ => "image/png",
    }
}

fn request_body(prompt: &str, image: Option<&[u8]>) -> Value {
    let mut parts = vec![json!({ "text": prompt })];
    if let Some(img) = image {
        parts.push(json!({
            "inline_data": { "mime_type": image_mime(img), "data": BASE64.encode(img) }
        }));
    }
    json!({ "contents": [{ "role": "user", "parts": parts }] })
}

/// Concatenated text parts of the first candidate.
fn completion_text(resp: &Value) -> Result<String, AiError> {
    let parts = resp
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .ok_or_else(|| AiError::Decode("no candidates in response".into()))?;
    let text: String = parts.iter().filter_map(|p| p.get("text").and_then(Value::as_str)).collect();
    if text.is_empty() {
        return Err(AiError::Decode("empty completion".into()));
    }
    Ok(text)
}
