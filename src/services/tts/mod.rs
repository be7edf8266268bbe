use crate::core::config::Config;
use crate::core::store::{StoreError, Versioned};
use crate::utils::audio::default_player;
use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TtsEngine {
    /// VOICEVOX-compatible server on the local machine.
    LocalVoice,
    /// OpenAI speech endpoint.
    CloudVoice,
    /// The platform speech engine. Always selectable.
    Browser,
}

impl TtsEngine {
    pub const ALL: [TtsEngine; 3] = [TtsEngine::LocalVoice, TtsEngine::CloudVoice, TtsEngine::Browser];

    pub fn as_str(self) -> &'static str {
        match self {
            TtsEngine::LocalVoice => "local-voice",
            TtsEngine::CloudVoice => "cloud-voice",
            TtsEngine::Browser => "browser",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            TtsEngine::LocalVoice => "🎤 VOICEVOX",
            TtsEngine::CloudVoice => "☁️ OpenAI",
            TtsEngine::Browser => "🔊 内蔵音声",
        }
    }
}

impl fmt::Display for TtsEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum TtsError {
    #[error("TTS configuration error: {0}")]
    Configuration(String),
    #[error("{engine} is unavailable: {reason}")]
    Unavailable { engine: TtsEngine, reason: String },
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("playback failed: {0:#}")]
    Playback(anyhow::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Voice {
    pub id: String,
    pub name: String,
    pub language: Option<String>,
}

#[async_trait]
pub trait TtsBackend: Send + Sync {
    fn engine(&self) -> TtsEngine;

    async fn is_available(&self) -> bool;

    async fn list_voices(&self) -> Result<Vec<Voice>, TtsError>;

    fn default_voice(&self) -> String;

    /// Speaks `text`, completing when playback ends or `stop` fires.
    async fn speak(&self, text: &str, voice: &str, stop: watch::Receiver<bool>) -> Result<(), TtsError>;
}

// --- Settings ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TtsSettings {
    pub engine: TtsEngine,
    pub voice: String,
}

impl Default for TtsSettings {
    fn default() -> Self {
        Self {
            engine: TtsEngine::LocalVoice,
            voice: crate::core::speakers::DEFAULT_SPEAKER.to_string(),
        }
    }
}

impl Versioned for TtsSettings {
    const VERSION: u32 = 2;

    // v1 used the engine names `voicevox`/`openai`/`browser` and VOICEVOX keys
    // with a style suffix.
    fn migrate(version: u32, data: serde_json::Value) -> Option<Self> {
        if version != 1 {
            return None;
        }
        let engine = match data.get("engine")?.as_str()? {
            "voicevox" => TtsEngine::LocalVoice,
            "openai" => TtsEngine::CloudVoice,
            "browser" => TtsEngine::Browser,
            _ => return None,
        };
        let voice = match data.get("voice").and_then(|v| v.as_str()).unwrap_or_default() {
            "zundamon_normal" | "" => "zundamon",
            "zundamon_tsuntsun" => "zundamon_tsun",
            "metan_normal" => "metan",
            other => other,
        };
        Some(TtsSettings {
            engine,
            voice: voice.to_string(),
        })
    }
}

// --- Backends ---

#[derive(Clone)]
pub struct Backends {
    pub local: Arc<dyn TtsBackend>,
    pub cloud: Arc<dyn TtsBackend>,
    pub browser: Arc<dyn TtsBackend>,
}

impl Backends {
    pub fn get(&self, engine: TtsEngine) -> &Arc<dyn TtsBackend> {
        match engine {
            TtsEngine::LocalVoice => &self.local,
            TtsEngine::CloudVoice => &self.cloud,
            TtsEngine::Browser => &self.browser,
        }
    }
}

pub fn create_backends(config: &Config) -> Backends {
    info!("Initializing TTS backends (configured: {})", config.audio.engine);
    let player = default_player(config.audio.player.clone());

    Backends {
        local: Arc::new(voicevox::VoicevoxBackend::new(
            voicevox::VoicevoxClient::new(
                &config.audio.voicevox.url,
                voicevox::Tuning {
                    speed_scale: config.audio.voicevox.speed_scale,
                    pitch_scale: config.audio.voicevox.pitch_scale,
                    volume_scale: None,
                },
            ),
            player.clone(),
        )),
        cloud: Arc::new(openai::OpenAiBackend::new(config.audio.openai.clone(), player)),
        browser: Arc::new(system::SystemVoiceBackend::new(config.audio.system.clone())),
    }
}

/// Pulls `error.message` out of a JSON error body, falling back to the raw text.
pub(crate) fn api_error_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: ErrorDetail,
    }
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ErrorDetail {
        Object { message: String },
        Text(String),
    }

    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody { error: ErrorDetail::Object { message } }) => message,
        Ok(ErrorBody { error: ErrorDetail::Text(message) }) => message,
        Err(_) => body.trim().to_string(),
    }
}

pub mod dispatcher;
pub mod openai;
pub mod system;
pub mod voicevox;

pub use dispatcher::{EngineSelection, TtsDispatcher};
