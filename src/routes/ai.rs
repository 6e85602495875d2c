use std::sync::Arc;

use axum::{extract::Extension, routing::post, Json, Router};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    ai::AiClient,
    error::{bad, AppErr, AppResult},
};

const MATH_KEYWORDS: [&str; 8] = ["solve", "calculate", "compute", "find", "answer", "integral", "derivative", "equation"];
const MATH_SYMBOLS: [char; 9] = ['+', '-', '*', '/', '=', '^', '∫', '∑', '√'];

const MATH_INSTRUCTIONS: &str = "\n\nIMPORTANT MATH SOLVING INSTRUCTIONS:
- If this is a math problem, SOLVE IT STEP BY STEP with actual calculations
- Show your work clearly with numbered steps
- Provide the final numerical answer
- Use LaTeX formatting: $inline$ for inline math, $$display$$ for equations
- Don't just explain concepts - actually compute the solution
- For integrals, derivatives, equations: show the complete solution process
- For word problems: set up equations and solve them numerically\n\n";

#[derive(Deserialize)]
pub struct ChatReq {
    #[serde(default)]
    pub message: String,
    pub image_data: Option<String>,
    pub model: Option<String>,
    #[serde(rename = "customApiKey")]
    pub custom_api_key: Option<String>,
}

#[derive(Serialize)]
struct ChatResp {
    response: String,
    status: &'static str,
}

pub fn router() -> Router {
    Router::new().route("/api/chat", post(handler))
}

fn looks_like_math(message: &str) -> bool {
    let lower = message.to_lowercase();
    MATH_KEYWORDS.iter().any(|k| lower.contains(k)) || message.contains(&MATH_SYMBOLS[..])
}

fn prepare_prompt(message: &str) -> String {
    if !message.is_empty() && looks_like_math(message) {
        format!("{MATH_INSTRUCTIONS}{message}")
    } else {
        message.to_string()
    }
}

/// Accepts raw base64 or a `data:` URL.
fn decode_image(data: &str) -> Result<Vec<u8>, AppErr> {
    let payload = data.split_once("base64,").map_or(data, |(_, b64)| b64);
    BASE64.decode(payload.trim()).map_err(|e| bad(format!("Failed to process image: {e}")))
}

async fn handler(Extension(ai): Extension<Arc<AiClient>>, Json(req): Json<ChatReq>) -> AppResult<Json<ChatResp>> {
    let image = req.image_data.as_deref().filter(|d| !d.is_empty()).map(decode_image).transpose()?;
    if req.message.is_empty() && image.is_none() {
        return Err(bad("No message or image provided"));
    }
    let key = req.custom_api_key.as_deref().filter(|k| !k.is_empty());
    info!(chars = req.message.len(), image = image.is_some(), custom_key = key.is_some(), "ai chat request");

    let prompt = prepare_prompt(&req.message);
    let response = ai.complete(&prompt, image.as_deref(), req.model.as_deref(), key).await?;
    Ok(Json(ChatResp { response, status: "success" }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn math_prompts_get_instructions() {
        assert!(prepare_prompt("solve x^2 = 4").starts_with(MATH_INSTRUCTIONS));
        assert!(prepare_prompt("What is 2+2").ends_with("What is 2+2"));
        assert_eq!(prepare_prompt("hello there"), "hello there");
        assert_eq!(prepare_prompt(""), "");
    }

    #[test]
    fn image_accepts_data_urls() {
        assert_eq!(decode_image("data:image/png;base64,aGk=").unwrap(), b"hi");
        assert_eq!(decode_image("aGk=").unwrap(), b"hi");
        assert!(decode_image("***").is_err());
    }
}
