use crate::core::io::Storage;
use crate::core::store::TypedStore;
use crate::services::tts::{Backends, TtsEngine, TtsError, TtsSettings, Voice};
use log::{info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

const SETTINGS_NAMESPACE: &str = "settings";
const SETTINGS_KEY: &str = "tts";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSelection {
    pub engine: TtsEngine,
    /// Set when the configured engine could not be used.
    pub fallback_from: Option<TtsEngine>,
}

struct ActivePlayback {
    id: u64,
    stop: watch::Sender<bool>,
}

/// Routes speech to the selected backend and owns the single playback slot.
pub struct TtsDispatcher {
    backends: Backends,
    store: TypedStore<TtsSettings>,
    settings: Mutex<TtsSettings>,
    active: Mutex<Option<ActivePlayback>>,
    lane: tokio::sync::Mutex<()>,
    next_id: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl TtsDispatcher {
    /// Loads persisted settings, or uses `defaults` when none are stored or they cannot be read.
    pub async fn new(backends: Backends, storage: Arc<dyn Storage>, defaults: TtsSettings) -> Self {
        let store = TypedStore::new(storage, SETTINGS_NAMESPACE);
        let settings = match store.get(SETTINGS_KEY).await {
            Ok(Some(s)) => s,
            Ok(None) => defaults,
            Err(e) => {
                warn!("Ignoring stored TTS settings: {}", e);
                defaults
            }
        };
        info!("TTS engine: {} / voice: {}", settings.engine, settings.voice);

        Self {
            backends,
            store,
            settings: Mutex::new(settings),
            active: Mutex::new(None),
            lane: tokio::sync::Mutex::new(()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn settings(&self) -> TtsSettings {
        lock(&self.settings).clone()
    }

    async fn persist(&self, settings: TtsSettings) -> Result<(), TtsError> {
        *lock(&self.settings) = settings.clone();
        self.store.put(SETTINGS_KEY, &settings).await?;
        Ok(())
    }

    /// Probes the configured engine and falls back when it cannot be used.
    /// A fallback is persisted so later sessions start from it.
    pub async fn resolve_engine(&self) -> Result<EngineSelection, TtsError> {
        let configured = self.settings().engine;

        let engine = match configured {
            TtsEngine::LocalVoice => {
                if self.backends.local.is_available().await {
                    TtsEngine::LocalVoice
                } else if self.backends.cloud.is_available().await {
                    TtsEngine::CloudVoice
                } else {
                    TtsEngine::Browser
                }
            }
            TtsEngine::CloudVoice => {
                if self.backends.cloud.is_available().await {
                    TtsEngine::CloudVoice
                } else {
                    TtsEngine::Browser
                }
            }
            TtsEngine::Browser => TtsEngine::Browser,
        };

        if engine == configured {
            return Ok(EngineSelection {
                engine,
                fallback_from: None,
            });
        }

        warn!("{} is not usable, falling back to {}", configured, engine);
        self.persist(TtsSettings {
            engine,
            voice: self.backends.get(engine).default_voice(),
        })
        .await?;
        Ok(EngineSelection {
            engine,
            fallback_from: Some(configured),
        })
    }

    pub async fn available_engines(&self) -> Vec<TtsEngine> {
        let mut engines = Vec::new();
        for engine in TtsEngine::ALL {
            if self.backends.get(engine).is_available().await {
                engines.push(engine);
            }
        }
        engines
    }

    pub async fn voices(&self, engine: TtsEngine) -> Result<Vec<Voice>, TtsError> {
        self.backends.get(engine).list_voices().await
    }

    /// Switches engine (and voice; `None` picks the engine's default). Stops current playback.
    pub async fn set_engine(&self, engine: TtsEngine, voice: Option<&str>) -> Result<(), TtsError> {
        self.stop_speaking();
        let voice = voice
            .map(str::to_string)
            .unwrap_or_else(|| self.backends.get(engine).default_voice());
        info!("TTS settings changed: {} / {}", engine, voice);
        self.persist(TtsSettings { engine, voice }).await
    }

    /// Speaks with the selected engine. `voice` overrides the stored voice.
    /// Any utterance still playing is stopped first; completes when this one ends or is stopped.
    pub async fn speak(&self, text: &str, voice: Option<&str>) -> Result<(), TtsError> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        if let Some(previous) = lock(&self.active).replace(ActivePlayback { id, stop: stop_tx }) {
            let _ = previous.stop.send(true);
        }

        let _lane = self.lane.lock().await;
        let result = if *stop_rx.borrow() {
            Ok(())
        } else {
            let settings = self.settings();
            let voice = voice.unwrap_or(settings.voice.as_str());
            self.backends
                .get(settings.engine)
                .speak(text, voice, stop_rx)
                .await
        };

        let mut active = lock(&self.active);
        if active.as_ref().map(|p| p.id) == Some(id) {
            *active = None;
        }
        result
    }

    pub fn stop_speaking(&self) {
        if let Some(playback) = lock(&self.active).take() {
            let _ = playback.stop.send(true);
        }
    }

    pub fn is_speaking(&self) -> bool {
        lock(&self.active).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::MemoryStorage;
    use crate::services::tts::TtsBackend;
    use crate::utils::audio::wait_for_stop;
    use async_trait::async_trait;
    use std::time::Duration;

    type Events = Arc<Mutex<Vec<String>>>;

    struct FakeBackend {
        engine: TtsEngine,
        available: bool,
        events: Events,
        length: Duration,
    }

    #[async_trait]
    impl TtsBackend for FakeBackend {
        fn engine(&self) -> TtsEngine {
            self.engine
        }

        async fn is_available(&self) -> bool {
            self.available
        }

        async fn list_voices(&self) -> Result<Vec<Voice>, TtsError> {
            Ok(vec![])
        }

        fn default_voice(&self) -> String {
            format!("{}-default", self.engine)
        }

        async fn speak(&self, text: &str, voice: &str, mut stop: watch::Receiver<bool>) -> Result<(), TtsError> {
            if !self.available {
                return Err(TtsError::Configuration("not configured".to_string()));
            }
            self.events.lock().unwrap().push(format!("start {} {}", text, voice));
            tokio::select! {
                _ = tokio::time::sleep(self.length) => {
                    self.events.lock().unwrap().push(format!("end {}", text));
                }
                _ = wait_for_stop(&mut stop) => {
                    self.events.lock().unwrap().push(format!("stopped {}", text));
                }
            }
            Ok(())
        }
    }

    fn backends(local: bool, cloud: bool, events: &Events) -> Backends {
        let fake = |engine, available| -> Arc<dyn TtsBackend> {
            Arc::new(FakeBackend {
                engine,
                available,
                events: events.clone(),
                length: Duration::from_millis(300),
            })
        };
        Backends {
            local: fake(TtsEngine::LocalVoice, local),
            cloud: fake(TtsEngine::CloudVoice, cloud),
            browser: fake(TtsEngine::Browser, true),
        }
    }

    async fn dispatcher(local: bool, cloud: bool) -> (TtsDispatcher, Arc<MemoryStorage>, Events) {
        let events: Events = Arc::new(Mutex::new(Vec::new()));
        let storage = Arc::new(MemoryStorage::new());
        let d = TtsDispatcher::new(backends(local, cloud, &events), storage.clone(), TtsSettings::default()).await;
        (d, storage, events)
    }

    #[tokio::test]
    async fn test_local_down_falls_back_to_cloud() {
        let (d, storage, _) = dispatcher(false, true).await;
        let selection = d.resolve_engine().await.unwrap();
        assert_eq!(
            selection,
            EngineSelection { engine: TtsEngine::CloudVoice, fallback_from: Some(TtsEngine::LocalVoice) }
        );

        let store: TypedStore<TtsSettings> = TypedStore::new(storage, "settings");
        let saved = store.get("tts").await.unwrap().unwrap();
        assert_eq!(saved.engine, TtsEngine::CloudVoice);
        assert_eq!(saved.voice, "cloud-voice-default");
    }

    #[tokio::test]
    async fn test_nothing_configured_falls_back_to_browser() {
        let (d, _, _) = dispatcher(false, false).await;
        assert_eq!(d.resolve_engine().await.unwrap().engine, TtsEngine::Browser);
        assert_eq!(d.available_engines().await, vec![TtsEngine::Browser]);

        d.set_engine(TtsEngine::CloudVoice, Some("nova")).await.unwrap();
        let selection = d.resolve_engine().await.unwrap();
        assert_eq!(selection.engine, TtsEngine::Browser);
        assert_eq!(selection.fallback_from, Some(TtsEngine::CloudVoice));
    }

    #[tokio::test]
    async fn test_available_engine_is_kept() {
        let (d, _, _) = dispatcher(true, false).await;
        let selection = d.resolve_engine().await.unwrap();
        assert_eq!(selection.fallback_from, None);
        assert_eq!(d.settings(), TtsSettings::default());
        assert_eq!(
            d.available_engines().await,
            vec![TtsEngine::LocalVoice, TtsEngine::Browser]
        );
    }

    #[tokio::test]
    async fn test_unconfigured_cloud_reports_configuration_error() {
        let (d, _, _) = dispatcher(true, false).await;
        d.set_engine(TtsEngine::CloudVoice, None).await.unwrap();
        assert!(matches!(d.speak("x", None).await, Err(TtsError::Configuration(_))));
        assert!(!d.is_speaking());
    }

    #[tokio::test]
    async fn test_new_utterance_stops_previous() {
        let (d, _, events) = dispatcher(true, false).await;
        let d = Arc::new(d);

        let first = {
            let d = d.clone();
            tokio::spawn(async move { d.speak("one", None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(d.is_speaking());

        d.speak("two", Some("metan")).await.unwrap();
        first.await.unwrap().unwrap();

        let events = events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec!["start one zundamon", "stopped one", "start two metan", "end two"]
        );
        assert!(!d.is_speaking());
    }

    #[tokio::test]
    async fn test_switching_engine_stops_current_playback() {
        let (d, _, events) = dispatcher(true, false).await;
        let d = Arc::new(d);
        let task = {
            let d = d.clone();
            tokio::spawn(async move { d.speak("page", None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(d.is_speaking());

        d.set_engine(TtsEngine::Browser, None).await.unwrap();
        assert!(!d.is_speaking());
        task.await.unwrap().unwrap();

        d.speak("next", None).await.unwrap();
        let events = events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec!["start page zundamon", "stopped page", "start next browser-default", "end next"]
        );
    }

    #[tokio::test]
    async fn test_stop_speaking_is_idempotent() {
        let (d, _, events) = dispatcher(true, false).await;
        let d = Arc::new(d);
        let task = {
            let d = d.clone();
            tokio::spawn(async move { d.speak("long", None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        d.stop_speaking();
        d.stop_speaking();
        task.await.unwrap().unwrap();
        assert!(!d.is_speaking());
        assert_eq!(events.lock().unwrap().last().unwrap(), "stopped long");
    }
}
