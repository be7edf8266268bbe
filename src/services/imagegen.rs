use crate::core::config::ImageConfig;
use crate::core::store::CachedImage;
use crate::services::assets::AssetError;
use crate::services::tts::api_error_message;
use async_trait::async_trait;
use base64::Engine as _;
use log::debug;
use serde::{Deserialize, Serialize};
use url::Url;

#[async_trait]
pub trait ImageGenerator: Send + Sync {
    fn is_configured(&self) -> bool;

    async fn generate(&self, prompt: &str) -> Result<CachedImage, AssetError>;
}

/// Which wrapper the page prompt is embedded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptStyle {
    /// On-demand generation while reading.
    Picturebook,
    /// Batch pre-generation of the on-disk asset set.
    Watercolor,
}

impl PromptStyle {
    pub fn wrap(self, prompt: &str) -> String {
        match self {
            PromptStyle::Picturebook => format!(
                "Create a cute, soft, child-friendly illustration for a Japanese storybook (ehon).

Style requirements:
- Gentle watercolor or soft digital art style
- Pastel colors (soft pink, light blue, soft yellow, mint green)
- Simple, round, kawaii character designs
- Warm and comforting atmosphere
- No text or words in the image
- Suitable for children aged 8-15

Scene to illustrate:
{}

Make it look like a professional Japanese picture book illustration.",
                prompt
            ),
            PromptStyle::Watercolor => format!(
                "Create a children's storybook illustration: {}.
Style: Soft watercolor, gentle colors, warm and comforting, suitable for ages 13-18 therapeutic storytelling.
The image should be emotionally supportive and healing.",
                prompt
            ),
        }
    }
}

// --- Gemini ---

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct GeminiContent {
    parts: Vec<GeminiTextPart>,
}

#[derive(Serialize)]
struct GeminiTextPart {
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<&'static str>,
}

#[derive(Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContentResponse>,
}

#[derive(Deserialize)]
struct GeminiContentResponse {
    #[serde(default)]
    parts: Vec<GeminiPartResponse>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPartResponse {
    text: Option<String>,
    inline_data: Option<InlineData>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

pub struct GeminiImageClient {
    client: reqwest::Client,
    config: ImageConfig,
    style: PromptStyle,
}

impl GeminiImageClient {
    pub fn new(config: ImageConfig, style: PromptStyle) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            style,
        }
    }

    fn url(&self, key: &str) -> Result<Url, AssetError> {
        let base = format!(
            "{}/{}:generateContent",
            self.config.endpoint.trim_end_matches('/'),
            self.config.model
        );
        Url::parse_with_params(&base, &[("key", key)])
            .map_err(|e| AssetError::NotConfigured(format!("Invalid image endpoint {}: {}", base, e)))
    }
}

fn extract_image(response: GeminiResponse) -> Result<CachedImage, AssetError> {
    let parts: Vec<GeminiPartResponse> = response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|c| c.parts)
        .unwrap_or_default();

    let mut text_reply = None;
    for part in parts {
        if let Some(inline) = part.inline_data {
            if inline.mime_type.starts_with("image/") {
                let data = base64::engine::general_purpose::STANDARD
                    .decode(inline.data.as_bytes())
                    .map_err(|e| AssetError::Generation(format!("Invalid image data: {}", e)))?;
                return Ok(CachedImage {
                    mime_type: inline.mime_type,
                    data,
                });
            }
        }
        if text_reply.is_none() {
            text_reply = part.text;
        }
    }

    match text_reply {
        Some(text) => Err(AssetError::Generation(format!(
            "Model answered with text instead of an image: {}",
            text.chars().take(100).collect::<String>()
        ))),
        None => Err(AssetError::Generation("Response contained no image".to_string())),
    }
}

#[async_trait]
impl ImageGenerator for GeminiImageClient {
    fn is_configured(&self) -> bool {
        self.config.api_key.is_some()
    }

    async fn generate(&self, prompt: &str) -> Result<CachedImage, AssetError> {
        let key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| AssetError::NotConfigured("Gemini API key is not set".to_string()))?;

        let request = GeminiRequest {
            contents: vec![GeminiContent {
                parts: vec![GeminiTextPart {
                    text: self.style.wrap(prompt),
                }],
            }],
            generation_config: GenerationConfig {
                response_modalities: vec!["TEXT", "IMAGE"],
            },
        };

        debug!("Requesting illustration from {}", self.config.model);
        let resp = self.client.post(self.url(key)?).json(&request).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            let message = if body.trim().is_empty() {
                format!("API Error: {}", status.as_u16())
            } else {
                api_error_message(&body)
            };
            return Err(AssetError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: GeminiResponse = serde_json::from_str(&body)
            .map_err(|e| AssetError::Generation(format!("Failed to parse Gemini response: {}", e)))?;
        extract_image(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::collections::HashMap;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/v1beta/models", addr)
    }

    fn client(endpoint: String, key: Option<&str>) -> GeminiImageClient {
        GeminiImageClient::new(
            ImageConfig {
                api_key: key.map(str::to_string),
                endpoint,
                model: "test-model".to_string(),
            },
            PromptStyle::Watercolor,
        )
    }

    #[test]
    fn test_extract_image_prefers_inline_data() {
        let response: GeminiResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[
                {"text":"Here you go"},
                {"inlineData":{"mimeType":"image/png","data":"AQID"}}
            ]}}]}"#,
        )
        .unwrap();
        let image = extract_image(response).unwrap();
        assert_eq!(image.mime_type, "image/png");
        assert_eq!(image.data, vec![1, 2, 3]);
    }

    #[test]
    fn test_text_only_reply_is_generation_error() {
        let response: GeminiResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"I cannot draw that"}]}}]}"#,
        )
        .unwrap();
        match extract_image(response) {
            Err(AssetError::Generation(msg)) => assert!(msg.contains("I cannot draw that")),
            _ => panic!("expected a generation error"),
        }

        let empty: GeminiResponse = serde_json::from_str("{}").unwrap();
        assert!(matches!(extract_image(empty), Err(AssetError::Generation(_))));
    }

    #[tokio::test]
    async fn test_generate_round_trip() {
        let app = Router::new().route(
            "/v1beta/models/{call}",
            post(
                |axum::extract::Path(call): axum::extract::Path<String>,
                 Query(q): Query<HashMap<String, String>>,
                 Json(body): Json<serde_json::Value>| async move {
                    assert_eq!(call, "test-model:generateContent");
                    assert_eq!(q.get("key").map(String::as_str), Some("gem-key"));
                    assert_eq!(body["generationConfig"]["responseModalities"][1], "IMAGE");
                    let prompt = body["contents"][0]["parts"][0]["text"].as_str().unwrap();
                    assert!(prompt.contains("a rabbit by the window"));
                    Json(serde_json::json!({
                        "candidates": [{"content": {"parts": [
                            {"inlineData": {"mimeType": "image/jpeg", "data": "/9j/"}}
                        ]}}]
                    }))
                },
            ),
        );
        let image = client(serve(app).await, Some("gem-key"))
            .generate("a rabbit by the window")
            .await
            .unwrap();
        assert_eq!(image.mime_type, "image/jpeg");
        assert_eq!(image.data, vec![0xFF, 0xD8, 0xFF]);
    }

    #[tokio::test]
    async fn test_api_error_is_surfaced() {
        let app = Router::new().route(
            "/v1beta/models/{call}",
            post(|| async {
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    r#"{"error":{"code":429,"message":"Resource has been exhausted"}}"#,
                )
            }),
        );
        match client(serve(app).await, Some("k")).generate("x").await {
            Err(AssetError::Http { status, message }) => {
                assert_eq!(status, 429);
                assert_eq!(message, "Resource has been exhausted");
            }
            other => panic!("unexpected: {:?}", other.map(|i| i.mime_type)),
        }
    }

    #[tokio::test]
    async fn test_missing_key() {
        let c = client("http://127.0.0.1:9".to_string(), None);
        assert!(!c.is_configured());
        assert!(matches!(c.generate("x").await, Err(AssetError::NotConfigured(_))));
    }
}
