//! Batch generation of the on-disk asset set: narration per speaker and one
//! illustration per page.

use crate::core::catalog::{Catalog, Story};
use crate::core::speakers::{self, Speaker, DEFAULT_SPEAKER};
use crate::services::assets::PregeneratedAssets;
use crate::services::imagegen::ImageGenerator;
use crate::services::tts::voicevox::VoicevoxClient;
use crate::utils::audio::wav_info;
use anyhow::{anyhow, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, error, info, warn};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PregenReport {
    pub generated: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl std::fmt::Display for PregenReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "generated: {}, skipped: {}, failed: {}",
            self.generated, self.skipped, self.failed
        )
    }
}

/// Command line selection: `--story=<id>` and `--speaker=<key>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PregenArgs {
    pub story: Option<String>,
    pub speaker: Option<String>,
}

impl PregenArgs {
    pub fn parse<I: IntoIterator<Item = String>>(args: I) -> Self {
        let mut parsed = Self::default();
        for arg in args {
            if let Some(v) = arg.strip_prefix("--story=") {
                parsed.story = Some(v.to_string());
            } else if let Some(v) = arg.strip_prefix("--speaker=") {
                parsed.speaker = Some(v.to_string());
            } else {
                warn!("Ignoring argument {}", arg);
            }
        }
        parsed
    }
}

/// All stories, or the one named.
pub fn select_stories<'a>(catalog: &'a Catalog, story: Option<&str>) -> Result<Vec<&'a Story>> {
    match story {
        Some(id) => catalog
            .get(id)
            .map(|s| vec![s])
            .ok_or_else(|| anyhow!("Unknown story '{}'", id)),
        None => Ok(catalog.stories().iter().collect()),
    }
}

/// Explicit speaker, then the story's recommended one, then the default.
/// An unknown explicit key yields `None`.
pub fn pick_speaker(explicit: Option<&str>, story_id: &str) -> Option<&'static Speaker> {
    match explicit {
        Some(key) => speakers::find(key),
        None => speakers::recommended_for(story_id).or_else(|| speakers::find(DEFAULT_SPEAKER)),
    }
}

fn progress_bar(len: usize) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

async fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {:?}", parent))?;
    }
    tokio::fs::write(path, data)
        .await
        .with_context(|| format!("Failed to write {:?}", path))
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Writes `audio/{speaker}/{story}/page_{n}.wav` for every page that lacks it.
/// Fails up front when the VOICEVOX engine cannot be reached.
pub async fn pregenerate_audio(
    client: &VoicevoxClient,
    assets: &PregeneratedAssets,
    stories: &[&Story],
    speaker: Option<&str>,
    delay: Duration,
) -> Result<PregenReport> {
    let version = client
        .version()
        .await
        .context("Cannot reach VOICEVOX. Start the engine and try again")?;
    info!("✅ VOICEVOX connected (version: {})", version);

    let total: usize = stories.iter().map(|s| s.pages.len()).sum();
    let pb = progress_bar(total)?;
    let mut report = PregenReport::default();

    for story in stories {
        let Some(speaker) = pick_speaker(speaker, &story.id) else {
            warn!("Unknown speaker {:?}, skipping {}", speaker, story.id);
            pb.inc(story.pages.len() as u64);
            continue;
        };
        pb.println(format!("📖 {} [{}]", story.title, speaker.name));

        for (index, page) in story.pages.iter().enumerate() {
            pb.set_message(format!("{} page {}", story.id, index + 1));
            let path = assets.audio_file(speaker, &story.id, index);
            if exists(&path).await {
                report.skipped += 1;
                pb.inc(1);
                continue;
            }

            // A truncated response would otherwise be skipped as existing on every rerun.
            let audio = client
                .synthesize(&page.text, speaker.id)
                .await
                .map_err(anyhow::Error::from)
                .and_then(|audio| wav_info(&audio).map(|info| (audio, info)));
            match audio {
                Ok((audio, info)) => {
                    debug!("{} page {}: {:?}", story.id, index + 1, info.duration());
                    write_file(&path, &audio).await?;
                    report.generated += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!("❌ {} page {}: {}", story.id, index + 1, e);
                    report.failed += 1;
                }
            }
            pb.inc(1);
        }
    }

    pb.finish_with_message("Audio complete");
    info!("✨ Audio {} ({:?})", report, assets.root().join("audio"));
    Ok(report)
}

/// Writes `images/{story}/page_{n}.{png|jpg}` for every page that has neither.
/// Waits `delay` after a success and `error_delay` after a failure.
pub async fn pregenerate_images(
    generator: &dyn ImageGenerator,
    assets: &PregeneratedAssets,
    stories: &[&Story],
    delay: Duration,
    error_delay: Duration,
) -> Result<PregenReport> {
    if !generator.is_configured() {
        return Err(anyhow!("GEMINI_API_KEY is not set"));
    }

    let total: usize = stories.iter().map(|s| s.pages.len()).sum();
    let pb = progress_bar(total)?;
    let mut report = PregenReport::default();

    for story in stories {
        pb.println(format!("📖 {}", story.title));
        for (index, page) in story.pages.iter().enumerate() {
            pb.set_message(format!("{} page {}", story.id, index + 1));
            if assets.find_image(&story.id, index).await.is_some() {
                report.skipped += 1;
                pb.inc(1);
                continue;
            }

            match generator.generate(&page.image_prompt).await {
                Ok(image) => {
                    let ext = if image.mime_type.contains("png") { "png" } else { "jpg" };
                    write_file(&assets.image_file(&story.id, index, ext), &image.data).await?;
                    report.generated += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!("❌ {} page {}: {}", story.id, index + 1, e);
                    report.failed += 1;
                    tokio::time::sleep(error_delay).await;
                }
            }
            pb.inc(1);
        }
    }

    pb.finish_with_message("Images complete");
    info!("✨ Images {} ({:?})", report, assets.root().join("images"));
    Ok(report)
}
