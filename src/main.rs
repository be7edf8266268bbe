use anyhow::Result;
use ehon::core::catalog::Catalog;
use ehon::core::config::Config;
use ehon::core::io::{NativeStorage, Storage};
use ehon::core::state::Session;
use ehon::core::store::ImageCache;
use ehon::services::admin;
use ehon::services::assets::{AssetResolver, OnDemandImages, PregeneratedAssets};
use ehon::services::imagegen::{GeminiImageClient, PromptStyle};
use ehon::services::logclient::LogClient;
use ehon::services::pregen::{self, PregenArgs};
use ehon::services::queue::GenerationQueue;
use ehon::services::reader::Reader;
use ehon::services::tts::voicevox::{Tuning, VoicevoxClient};
use ehon::services::tts::{create_backends, TtsDispatcher, TtsSettings};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const USAGE: &str = "usage: ehon [read | serve | pregen-audio [--story=ID] [--speaker=KEY] | pregen-images [--story=ID]]";

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            eprintln!("Please check 'config.yml'.");
            return Err(e);
        }
    };
    config.ensure_directories()?;
    let catalog = Catalog::load_or_builtin(config.catalog_path().as_deref())?;

    let mut args = std::env::args().skip(1);
    let mode = args.next().unwrap_or_else(|| "read".to_string());
    match mode.as_str() {
        "read" => read(config, catalog).await,
        "serve" => admin::serve(&config, &catalog).await,
        "pregen-audio" => {
            let args = PregenArgs::parse(args);
            let stories = pregen::select_stories(&catalog, args.story.as_deref())?;
            let client = VoicevoxClient::new(
                &config.audio.voicevox.url,
                Tuning {
                    speed_scale: config.pregen.speed_scale,
                    pitch_scale: config.pregen.pitch_scale,
                    volume_scale: Some(config.pregen.volume_scale),
                },
            );
            let report = pregen::pregenerate_audio(
                &client,
                &PregeneratedAssets::new(config.public_path()),
                &stories,
                args.speaker.as_deref(),
                Duration::from_millis(config.pregen.audio_delay_ms),
            )
            .await?;
            println!("✨ {}", report);
            Ok(())
        }
        "pregen-images" => {
            let args = PregenArgs::parse(args);
            let stories = pregen::select_stories(&catalog, args.story.as_deref())?;
            let generator = GeminiImageClient::new(config.image.clone(), PromptStyle::Watercolor);
            let report = pregen::pregenerate_images(
                &generator,
                &PregeneratedAssets::new(config.public_path()),
                &stories,
                Duration::from_millis(config.pregen.image_delay_ms),
                Duration::from_millis(config.pregen.image_error_delay_ms),
            )
            .await?;
            println!("✨ {}", report);
            Ok(())
        }
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    }
}

async fn read(config: Config, catalog: Catalog) -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(NativeStorage::new(&config.data_folder));

    let defaults = TtsSettings {
        engine: config.audio.engine,
        voice: config.audio.voice.clone(),
    };
    let tts = Arc::new(TtsDispatcher::new(create_backends(&config), storage.clone(), defaults).await);

    let generator = Arc::new(GeminiImageClient::new(config.image.clone(), PromptStyle::Picturebook));
    let on_demand = Arc::new(OnDemandImages::new(ImageCache::new(storage.clone()), generator));
    let assets = Arc::new(AssetResolver::new(
        PregeneratedAssets::new(config.public_path()),
        on_demand.clone(),
    ));
    let queue = GenerationQueue::new(on_demand, Duration::from_millis(config.queue.delay_ms));

    let session = Session::new(Arc::new(catalog));
    let logs = config
        .log_service
        .as_deref()
        .map(|url| LogClient::new(url, session.data().session_id.clone()));

    let mut reader = Reader::new(session, tts, assets, queue, logs, PathBuf::from(&config.data_folder));
    reader.run().await
}
