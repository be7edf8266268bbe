use crate::core::config::SystemVoiceConfig;
use crate::services::tts::{TtsBackend, TtsEngine, TtsError, Voice};
use crate::utils::audio::run_until_stopped;
use async_trait::async_trait;
use log::{debug, warn};
use tokio::process::Command;
use tokio::sync::{watch, OnceCell};

/// espeak-ng's default words per minute.
const BASE_WORDS_PER_MINUTE: f32 = 175.0;
/// espeak-ng's default pitch on its 0-99 scale.
const BASE_PITCH: f32 = 50.0;

/// Speaks through the platform speech engine (an `espeak-ng` compatible command).
pub struct SystemVoiceBackend {
    config: SystemVoiceConfig,
    voices: OnceCell<Vec<Voice>>,
}

impl SystemVoiceBackend {
    pub fn new(config: SystemVoiceConfig) -> Self {
        Self {
            config,
            voices: OnceCell::new(),
        }
    }

    async fn voices(&self) -> Result<&Vec<Voice>, TtsError> {
        self.voices
            .get_or_try_init(|| async {
                let output = Command::new(&self.config.command)
                    .arg("--voices")
                    .output()
                    .await
                    .map_err(|e| TtsError::Unavailable {
                        engine: TtsEngine::Browser,
                        reason: format!("{}: {}", self.config.command, e),
                    })?;
                let voices = parse_voice_list(&String::from_utf8_lossy(&output.stdout));
                debug!("{} reports {} voices", self.config.command, voices.len());
                Ok::<_, TtsError>(voices)
            })
            .await
    }

    fn build_command(&self, text: &str, voice: Option<&Voice>) -> Command {
        let mut cmd = Command::new(&self.config.command);
        let speed = (BASE_WORDS_PER_MINUTE * self.config.rate).round().max(80.0) as u32;
        let pitch = (BASE_PITCH * self.config.pitch).round().clamp(0.0, 99.0) as u32;
        cmd.arg("-s").arg(speed.to_string());
        cmd.arg("-p").arg(pitch.to_string());
        match voice {
            Some(v) => {
                cmd.arg("-v").arg(&v.id);
            }
            None => {
                cmd.arg("-v").arg(&self.config.language);
            }
        }
        cmd.arg("--").arg(text);
        cmd
    }
}

/// Parses `espeak-ng --voices` output. Voice ids are the language column,
/// which is what `-v` accepts.
pub fn parse_voice_list(output: &str) -> Vec<Voice> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 4 {
                return None;
            }
            Some(Voice {
                id: cols[1].to_string(),
                name: cols[3].to_string(),
                language: Some(cols[1].to_string()),
            })
        })
        .collect()
}

/// Preferred names first, then any voice for `language`, else `None` (engine default).
pub fn select_voice<'a>(voices: &'a [Voice], preferred: &[String], language: &str) -> Option<&'a Voice> {
    preferred
        .iter()
        .find_map(|p| voices.iter().find(|v| v.name.contains(p.as_str())))
        .or_else(|| {
            voices.iter().find(|v| {
                v.language
                    .as_deref()
                    .map(|l| l == language || l.starts_with(&format!("{}-", language)))
                    .unwrap_or(false)
            })
        })
}

#[async_trait]
impl TtsBackend for SystemVoiceBackend {
    fn engine(&self) -> TtsEngine {
        TtsEngine::Browser
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn list_voices(&self) -> Result<Vec<Voice>, TtsError> {
        Ok(self.voices().await?.clone())
    }

    fn default_voice(&self) -> String {
        String::new()
    }

    async fn speak(&self, text: &str, voice: &str, stop: watch::Receiver<bool>) -> Result<(), TtsError> {
        let voices: &[Voice] = match self.voices().await {
            Ok(v) => v.as_slice(),
            Err(e) => {
                warn!("Could not enumerate system voices: {}", e);
                &[]
            }
        };

        let chosen = voices
            .iter()
            .find(|v| !voice.is_empty() && (v.id == voice || v.name == voice))
            .or_else(|| select_voice(voices, &self.config.preferred_voices, &self.config.language));
        debug!("System voice: {:?}", chosen.map(|v| &v.name));

        let cmd = self.build_command(text, chosen);
        match run_until_stopped(cmd, stop).await {
            Ok(_) => Ok(()),
            Err(e) => match e.downcast_ref::<std::io::Error>() {
                Some(io) if io.kind() == std::io::ErrorKind::NotFound => Err(TtsError::Unavailable {
                    engine: TtsEngine::Browser,
                    reason: format!("{} not found", self.config.command),
                }),
                _ => Err(TtsError::Playback(e)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VOICES: &str = "\
Pty Language       Age/Gender VoiceName          File                 Other Languages
 5  af              --/M      Afrikaans          gmw/af
 5  en-us           --/M      English_(America)  gmw/en-US            (en 8)
 5  ja              --/M      Japanese           jpx/ja
";

    fn voice(id: &str, name: &str) -> Voice {
        Voice {
            id: id.to_string(),
            name: name.to_string(),
            language: Some(id.to_string()),
        }
    }

    #[test]
    fn test_parse_voice_list() {
        let voices = parse_voice_list(VOICES);
        assert_eq!(voices.len(), 3);
        assert_eq!(voices[2], voice("ja", "Japanese"));
    }

    #[test]
    fn test_select_voice_order() {
        let voices = vec![voice("en-us", "Samantha"), voice("ja-jp", "Hattori"), voice("ja-jp", "Kyoko")];
        let preferred = vec!["Kyoko".to_string(), "O-Ren".to_string()];

        assert_eq!(select_voice(&voices, &preferred, "ja").unwrap().name, "Kyoko");
        assert_eq!(select_voice(&voices, &[], "ja").unwrap().name, "Hattori");
        assert!(select_voice(&voices, &[], "fr").is_none());
    }

    #[test]
    fn test_command_arguments() {
        let backend = SystemVoiceBackend::new(SystemVoiceConfig::default());
        let cmd = backend.build_command("こんにちは", None);
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert_eq!(args, vec!["-s", "149", "-p", "55", "-v", "ja", "--", "こんにちは"]);
    }

    #[tokio::test]
    async fn test_missing_engine_is_unavailable() {
        let backend = SystemVoiceBackend::new(SystemVoiceConfig {
            command: "definitely-not-a-speech-engine".to_string(),
            ..SystemVoiceConfig::default()
        });
        let (_tx, rx) = watch::channel(false);
        assert!(matches!(
            backend.speak("x", "", rx).await,
            Err(TtsError::Unavailable { .. })
        ));
    }
}
