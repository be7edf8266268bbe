use crate::core::config::OpenAiConfig;
use crate::services::tts::{api_error_message, TtsBackend, TtsEngine, TtsError, Voice};
use crate::utils::audio::AudioPlayer;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

pub const OPENAI_VOICES: &[(&str, &str)] = &[
    ("nova", "ノヴァ（明るい女性的な声）"),
    ("shimmer", "シマー（優しい女性的な声）"),
    ("fable", "フェイブル（物語向きの温かい声）"),
    ("alloy", "アロイ（中性的でバランスの良い声）"),
];

#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
    speed: f32,
}

pub struct OpenAiBackend {
    config: OpenAiConfig,
    client: reqwest::Client,
    player: Arc<dyn AudioPlayer>,
}

impl OpenAiBackend {
    pub fn new(config: OpenAiConfig, player: Arc<dyn AudioPlayer>) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            player,
        }
    }

    fn api_key(&self) -> Result<&str, TtsError> {
        self.config
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| TtsError::Configuration("OpenAI API key is not set".to_string()))
    }

    pub async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>, TtsError> {
        let key = self.api_key()?;
        let body = SpeechRequest {
            model: &self.config.model,
            input: text,
            voice,
            response_format: "mp3",
            speed: self.config.speed,
        };

        let resp = self
            .client
            .post(&self.config.url)
            .bearer_auth(key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let message = if text.trim().is_empty() {
                format!("OpenAI API Error: {}", status.as_u16())
            } else {
                api_error_message(&text)
            };
            return Err(TtsError::Http {
                status: status.as_u16(),
                message,
            });
        }

        Ok(resp.bytes().await?.to_vec())
    }
}

#[async_trait]
impl TtsBackend for OpenAiBackend {
    fn engine(&self) -> TtsEngine {
        TtsEngine::CloudVoice
    }

    async fn is_available(&self) -> bool {
        self.api_key().is_ok()
    }

    async fn list_voices(&self) -> Result<Vec<Voice>, TtsError> {
        Ok(OPENAI_VOICES
            .iter()
            .map(|(id, name)| Voice {
                id: id.to_string(),
                name: name.to_string(),
                language: None,
            })
            .collect())
    }

    fn default_voice(&self) -> String {
        self.config.voice.clone()
    }

    async fn speak(&self, text: &str, voice: &str, stop: watch::Receiver<bool>) -> Result<(), TtsError> {
        let voice = if OPENAI_VOICES.iter().any(|(id, _)| *id == voice) {
            voice
        } else {
            self.config.voice.as_str()
        };
        let audio = self.synthesize(text, voice).await?;
        if *stop.borrow() {
            return Ok(());
        }
        self.player.play(&audio, stop).await.map_err(TtsError::Playback)
    }
}
