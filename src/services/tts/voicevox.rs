use crate::core::speakers::{self, DEFAULT_SPEAKER, SPEAKERS};
use crate::services::tts::{api_error_message, TtsBackend, TtsEngine, TtsError, Voice};
use crate::utils::audio::AudioPlayer;
use async_trait::async_trait;
use log::debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tuning {
    pub speed_scale: f32,
    pub pitch_scale: f32,
    pub volume_scale: Option<f32>,
}

/// HTTP client for a VOICEVOX engine: `audio_query` followed by `synthesis`.
#[derive(Clone)]
pub struct VoicevoxClient {
    client: reqwest::Client,
    base_url: String,
    tuning: Tuning,
}

impl VoicevoxClient {
    pub fn new(base_url: &str, tuning: Tuning) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            tuning,
        }
    }

    fn endpoint(&self, path: &str, params: &[(&str, &str)]) -> Result<Url, TtsError> {
        Url::parse_with_params(&format!("{}/{}", self.base_url, path), params)
            .map_err(|e| TtsError::Configuration(format!("Invalid VOICEVOX URL {}: {}", self.base_url, e)))
    }

    /// `GET /version`
    pub async fn version(&self) -> Result<String, TtsError> {
        let resp = self
            .client
            .get(self.endpoint("version", &[])?)
            .timeout(Duration::from_secs(3))
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(TtsError::Http {
                status: status.as_u16(),
                message: api_error_message(&body),
            });
        }
        Ok(body.trim().trim_matches('"').to_string())
    }

    pub async fn synthesize(&self, text: &str, speaker_id: u32) -> Result<Vec<u8>, TtsError> {
        let speaker = speaker_id.to_string();

        let resp = self
            .client
            .post(self.endpoint("audio_query", &[("text", text), ("speaker", &speaker)])?)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TtsError::Http {
                status: status.as_u16(),
                message: format!("audio_query failed: {}", api_error_message(&resp.text().await?)),
            });
        }

        let mut query: serde_json::Value = resp.json().await?;
        if let Some(obj) = query.as_object_mut() {
            obj.insert("speedScale".into(), self.tuning.speed_scale.into());
            obj.insert("pitchScale".into(), self.tuning.pitch_scale.into());
            if let Some(volume) = self.tuning.volume_scale {
                obj.insert("volumeScale".into(), volume.into());
            }
        }

        let resp = self
            .client
            .post(self.endpoint("synthesis", &[("speaker", &speaker)])?)
            .json(&query)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TtsError::Http {
                status: status.as_u16(),
                message: format!("synthesis failed: {}", api_error_message(&resp.text().await?)),
            });
        }

        let audio = resp.bytes().await?.to_vec();
        debug!("VOICEVOX synthesized {} bytes for speaker {}", audio.len(), speaker_id);
        Ok(audio)
    }
}

pub struct VoicevoxBackend {
    client: VoicevoxClient,
    player: Arc<dyn AudioPlayer>,
}

impl VoicevoxBackend {
    pub fn new(client: VoicevoxClient, player: Arc<dyn AudioPlayer>) -> Self {
        Self { client, player }
    }
}

#[async_trait]
impl TtsBackend for VoicevoxBackend {
    fn engine(&self) -> TtsEngine {
        TtsEngine::LocalVoice
    }

    async fn is_available(&self) -> bool {
        match self.client.version().await {
            Ok(v) => {
                debug!("VOICEVOX {} is reachable", v);
                true
            }
            Err(e) => {
                debug!("VOICEVOX probe failed: {}", e);
                false
            }
        }
    }

    async fn list_voices(&self) -> Result<Vec<Voice>, TtsError> {
        Ok(SPEAKERS
            .iter()
            .map(|s| Voice {
                id: s.key.to_string(),
                name: format!("{} {}", s.emoji, s.name),
                language: Some("ja".to_string()),
            })
            .collect())
    }

    fn default_voice(&self) -> String {
        DEFAULT_SPEAKER.to_string()
    }

    async fn speak(&self, text: &str, voice: &str, stop: watch::Receiver<bool>) -> Result<(), TtsError> {
        let speaker_id = speakers::speaker_id(voice).unwrap_or_else(|| {
            debug!("Unknown VOICEVOX speaker {}, using {}", voice, DEFAULT_SPEAKER);
            speakers::find_or_default(DEFAULT_SPEAKER).id
        });
        let audio = self.client.synthesize(text, speaker_id).await?;
        if *stop.borrow() {
            return Ok(());
        }
        self.player.play(&audio, stop).await.map_err(TtsError::Playback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::audio::create_dummy_wav;
    use axum::extract::Query;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::collections::HashMap;
    use std::sync::Mutex;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_synthesize_applies_tuning() {
        let seen: Arc<Mutex<Option<serde_json::Value>>> = Arc::new(Mutex::new(None));
        let seen_in = seen.clone();

        let app = Router::new()
            .route("/version", get(|| async { "\"0.14.0\"" }))
            .route(
                "/audio_query",
                post(|Query(q): Query<HashMap<String, String>>| async move {
                    Json(serde_json::json!({
                        "text": q.get("text"),
                        "speedScale": 1.0,
                        "pitchScale": 0.0,
                        "volumeScale": 1.0
                    }))
                }),
            )
            .route(
                "/synthesis",
                post(move |Query(q): Query<HashMap<String, String>>, Json(body): Json<serde_json::Value>| {
                    let seen = seen_in.clone();
                    async move {
                        assert_eq!(q.get("speaker").map(String::as_str), Some("2"));
                        *seen.lock().unwrap() = Some(body);
                        create_dummy_wav(16, 24000)
                    }
                }),
            );
        let base = serve(app).await;

        let client = VoicevoxClient::new(
            &base,
            Tuning { speed_scale: 0.85, pitch_scale: 0.02, volume_scale: Some(1.2) },
        );
        assert_eq!(client.version().await.unwrap(), "0.14.0");

        let audio = client.synthesize("こんにちは", 2).await.unwrap();
        assert_eq!(&audio[0..4], b"RIFF");

        let body = seen.lock().unwrap().clone().unwrap();
        assert_eq!(body["text"], "こんにちは");
        assert!((body["speedScale"].as_f64().unwrap() - 0.85).abs() < 1e-6);
        assert!((body["pitchScale"].as_f64().unwrap() - 0.02).abs() < 1e-6);
        assert!((body["volumeScale"].as_f64().unwrap() - 1.2).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_http_status_is_surfaced() {
        let app = Router::new().route(
            "/audio_query",
            post(|| async { (StatusCode::UNPROCESSABLE_ENTITY, r#"{"detail":"bad"}"#) }),
        );
        let base = serve(app).await;
        let client = VoicevoxClient::new(
            &base,
            Tuning { speed_scale: 0.9, pitch_scale: 0.02, volume_scale: None },
        );

        match client.synthesize("x", 3).await {
            Err(TtsError::Http { status, .. }) => assert_eq!(status, 422),
            other => panic!("unexpected: {:?}", other.map(|a| a.len())),
        }
    }

    #[tokio::test]
    async fn test_probe_reports_unreachable_server() {
        struct NoPlayer;
        #[async_trait]
        impl AudioPlayer for NoPlayer {
            async fn play(&self, _: &[u8], _: watch::Receiver<bool>) -> anyhow::Result<()> {
                Ok(())
            }
        }

        // Bind then drop to get a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let backend = VoicevoxBackend::new(
            VoicevoxClient::new(
                &format!("http://{}", addr),
                Tuning { speed_scale: 0.9, pitch_scale: 0.02, volume_scale: None },
            ),
            Arc::new(NoPlayer),
        );
        assert!(!backend.is_available().await);
    }

    #[tokio::test]
    async fn test_unknown_voice_uses_default_speaker() {
        struct NoPlayer;
        #[async_trait]
        impl AudioPlayer for NoPlayer {
            async fn play(&self, _: &[u8], _: watch::Receiver<bool>) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let speakers_seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_in = speakers_seen.clone();
        let app = Router::new()
            .route("/audio_query", post(|| async { Json(serde_json::json!({})) }))
            .route(
                "/synthesis",
                post(move |Query(q): Query<HashMap<String, String>>| {
                    let seen = seen_in.clone();
                    async move {
                        seen.lock().unwrap().extend(q.get("speaker").cloned());
                        create_dummy_wav(16, 24000)
                    }
                }),
            );
        let base = serve(app).await;

        let backend = VoicevoxBackend::new(
            VoicevoxClient::new(&base, Tuning { speed_scale: 0.9, pitch_scale: 0.02, volume_scale: None }),
            Arc::new(NoPlayer),
        );
        let (_tx, rx) = watch::channel(false);
        backend.speak("こんにちは", "nova", rx.clone()).await.unwrap();
        backend.speak("こんにちは", "metan", rx).await.unwrap();

        assert_eq!(*speakers_seen.lock().unwrap(), vec!["3", "2"]);
    }
}
