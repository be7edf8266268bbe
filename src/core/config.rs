use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::services::tts::TtsEngine;

const OPENAI_PLACEHOLDER_KEY: &str = "your-openai-api-key-here";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Cache and settings root (image cache, TTS settings).
    #[serde(default = "default_data")]
    pub data_folder: String,

    /// Pre-generated assets: `audio/{speaker}/{story}/page_{n}.wav`, `images/{story}/page_{n}.png`.
    #[serde(default = "default_public")]
    pub public_folder: String,

    /// Optional YAML catalog replacing the built-in stories.
    #[serde(default)]
    pub catalog: Option<String>,

    /// Base URL of the admin/log service. Logging is skipped when unset.
    #[serde(default)]
    pub log_service: Option<String>,

    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub image: ImageConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub pregen: PregenConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AudioConfig {
    #[serde(default = "default_engine")]
    pub engine: TtsEngine,
    #[serde(default = "default_voice")]
    pub voice: String,
    #[serde(default)]
    pub voicevox: VoicevoxConfig,
    #[serde(default)]
    pub openai: OpenAiConfig,
    #[serde(default)]
    pub system: SystemVoiceConfig,
    /// Player command for synthesized audio; the file path is appended.
    #[serde(default = "default_player")]
    pub player: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct VoicevoxConfig {
    #[serde(default = "default_voicevox_url")]
    pub url: String,
    #[serde(default = "default_reader_speed")]
    pub speed_scale: f32,
    #[serde(default = "default_pitch")]
    pub pitch_scale: f32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenAiConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_openai_url")]
    pub url: String,
    #[serde(default = "default_openai_model")]
    pub model: String,
    #[serde(default = "default_openai_voice")]
    pub voice: String,
    #[serde(default = "default_reader_speed")]
    pub speed: f32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SystemVoiceConfig {
    #[serde(default = "default_system_command")]
    pub command: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_preferred_voices")]
    pub preferred_voices: Vec<String>,
    /// Relative to the engine's normal speed.
    #[serde(default = "default_system_rate")]
    pub rate: f32,
    #[serde(default = "default_system_pitch")]
    pub pitch: f32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ImageConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_gemini_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_gemini_model")]
    pub model: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_queue_delay")]
    pub delay_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_database")]
    pub database: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PregenConfig {
    #[serde(default = "default_tool_speed")]
    pub speed_scale: f32,
    #[serde(default = "default_pitch")]
    pub pitch_scale: f32,
    #[serde(default = "default_tool_volume")]
    pub volume_scale: f32,
    #[serde(default = "default_audio_delay")]
    pub audio_delay_ms: u64,
    #[serde(default = "default_image_delay")]
    pub image_delay_ms: u64,
    #[serde(default = "default_image_error_delay")]
    pub image_error_delay_ms: u64,
}

fn default_data() -> String {
    "data".to_string()
}
fn default_public() -> String {
    "public".to_string()
}
fn default_engine() -> TtsEngine {
    TtsEngine::LocalVoice
}
fn default_voice() -> String {
    crate::core::speakers::DEFAULT_SPEAKER.to_string()
}
fn default_player() -> Vec<String> {
    ["ffplay", "-nodisp", "-autoexit", "-loglevel", "quiet"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_voicevox_url() -> String {
    "http://127.0.0.1:50021".to_string()
}
fn default_reader_speed() -> f32 {
    0.9
}
fn default_pitch() -> f32 {
    0.02
}
fn default_openai_url() -> String {
    "https://api.openai.com/v1/audio/speech".to_string()
}
fn default_openai_model() -> String {
    "tts-1".to_string()
}
fn default_openai_voice() -> String {
    "nova".to_string()
}
fn default_system_command() -> String {
    "espeak-ng".to_string()
}
fn default_language() -> String {
    "ja".to_string()
}
fn default_preferred_voices() -> Vec<String> {
    vec!["Kyoko".to_string(), "O-Ren".to_string()]
}
fn default_system_rate() -> f32 {
    0.85
}
fn default_system_pitch() -> f32 {
    1.1
}
fn default_gemini_endpoint() -> String {
    "https://generativelanguage.googleapis.com/v1beta/models".to_string()
}
fn default_gemini_model() -> String {
    "gemini-2.0-flash-exp".to_string()
}
fn default_queue_delay() -> u64 {
    500
}
fn default_bind() -> String {
    "127.0.0.1:3001".to_string()
}
fn default_database() -> String {
    "data/storybook.db".to_string()
}
fn default_tool_speed() -> f32 {
    0.85
}
fn default_tool_volume() -> f32 {
    1.2
}
fn default_audio_delay() -> u64 {
    300
}
fn default_image_delay() -> u64 {
    2000
}
fn default_image_error_delay() -> u64 {
    5000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_folder: default_data(),
            public_folder: default_public(),
            catalog: None,
            log_service: None,
            audio: AudioConfig::default(),
            image: ImageConfig::default(),
            queue: QueueConfig::default(),
            server: ServerConfig::default(),
            pregen: PregenConfig::default(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            voice: default_voice(),
            voicevox: VoicevoxConfig::default(),
            openai: OpenAiConfig::default(),
            system: SystemVoiceConfig::default(),
            player: default_player(),
        }
    }
}

impl Default for VoicevoxConfig {
    fn default() -> Self {
        Self {
            url: default_voicevox_url(),
            speed_scale: default_reader_speed(),
            pitch_scale: default_pitch(),
        }
    }
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            url: default_openai_url(),
            model: default_openai_model(),
            voice: default_openai_voice(),
            speed: default_reader_speed(),
        }
    }
}

impl Default for SystemVoiceConfig {
    fn default() -> Self {
        Self {
            command: default_system_command(),
            language: default_language(),
            preferred_voices: default_preferred_voices(),
            rate: default_system_rate(),
            pitch: default_system_pitch(),
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: default_gemini_endpoint(),
            model: default_gemini_model(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            delay_ms: default_queue_delay(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            database: default_database(),
        }
    }
}

impl Default for PregenConfig {
    fn default() -> Self {
        Self {
            speed_scale: default_tool_speed(),
            pitch_scale: default_pitch(),
            volume_scale: default_tool_volume(),
            audio_delay_ms: default_audio_delay(),
            image_delay_ms: default_image_delay(),
            image_error_delay_ms: default_image_error_delay(),
        }
    }
}

impl Config {
    /// Reads `config.yml` from the working directory. A missing file yields defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("config.yml"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config: Config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read {:?}", path))?;
            serde_yaml_ng::from_str(&content)
                .with_context(|| format!("Failed to parse {:?}", path))?
        } else {
            log::info!("{:?} not found, using defaults", path);
            Config::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_yaml_ng::to_string(self)?;
        fs::write("config.yml", content).context("Failed to write config.yml")?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.data_folder)?;
        fs::create_dir_all(&self.public_folder)?;
        if let Some(parent) = Path::new(&self.server.database).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    /// Credentials from the environment win over the file. Placeholder keys count as unset.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        let first = |names: &[&str]| names.iter().find_map(|n| var(n).filter(|v| !v.trim().is_empty()));

        if let Some(key) = first(&["GEMINI_API_KEY", "VITE_GEMINI_API_KEY"]) {
            self.image.api_key = Some(key);
        }
        if let Some(key) = first(&["OPENAI_API_KEY", "VITE_OPENAI_API_KEY"]) {
            self.audio.openai.api_key = Some(key);
        }

        self.image.api_key = sanitize_key(self.image.api_key.take());
        self.audio.openai.api_key = sanitize_key(self.audio.openai.api_key.take());
    }

    pub fn public_path(&self) -> PathBuf {
        PathBuf::from(&self.public_folder)
    }

    pub fn catalog_path(&self) -> Option<PathBuf> {
        self.catalog.as_ref().map(PathBuf::from)
    }
}

fn sanitize_key(key: Option<String>) -> Option<String> {
    key.map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty() && k != OPENAI_PLACEHOLDER_KEY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.audio.engine, TtsEngine::LocalVoice);
        assert_eq!(config.audio.voice, "zundamon");
        assert_eq!(config.audio.voicevox.url, "http://127.0.0.1:50021");
        assert_eq!(config.audio.voicevox.speed_scale, 0.9);
        assert_eq!(config.queue.delay_ms, 500);
        assert_eq!(config.pregen.speed_scale, 0.85);
        assert_eq!(config.pregen.volume_scale, 1.2);
        assert!(config.image.api_key.is_none());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
public_folder: assets
audio:
  engine: cloud-voice
  openai:
    voice: shimmer
queue:
  delay_ms: 50
"#;
        let config: Config = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(config.public_folder, "assets");
        assert_eq!(config.audio.engine, TtsEngine::CloudVoice);
        assert_eq!(config.audio.openai.voice, "shimmer");
        assert_eq!(config.audio.openai.model, "tts-1");
        assert_eq!(config.queue.delay_ms, 50);
        assert_eq!(config.data_folder, "data");
    }

    #[test]
    fn test_env_overrides_and_placeholders() {
        let env: HashMap<&str, &str> = [
            ("VITE_GEMINI_API_KEY", "gem-key"),
            ("OPENAI_API_KEY", "your-openai-api-key-here"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.image.api_key.as_deref(), Some("gem-key"));
        assert!(config.audio.openai.api_key.is_none());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("config.yml")).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:3001");
    }
}
