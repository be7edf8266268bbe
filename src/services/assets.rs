use crate::core::catalog::Story;
use crate::core::speakers::{Speaker, SPEAKERS};
use crate::core::store::{CachedImage, ImageCache, StoreError};
use crate::services::imagegen::ImageGenerator;
use log::{info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AssetError {
    #[error("image generation is not configured: {0}")]
    NotConfigured(String),
    #[error("image generation failed: {0}")]
    Generation(String),
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error("story '{story_id}' has no page {page_index}")]
    UnknownPage { story_id: String, page_index: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetStatus {
    pub index: usize,
    pub has_image: bool,
    pub has_audio: bool,
    /// URL-style path under the public folder, e.g. `/images/lonely/page_0.png`.
    pub image_path: Option<String>,
    pub audio_path: Option<String>,
    #[serde(skip)]
    pub image_file: Option<PathBuf>,
    #[serde(skip)]
    pub audio_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpeakerRef {
    pub key: &'static str,
    pub name: &'static str,
    pub folder: &'static str,
}

impl From<&Speaker> for SpeakerRef {
    fn from(s: &Speaker) -> Self {
        Self {
            key: s.key,
            name: s.name,
            folder: s.folder,
        }
    }
}

const IMAGE_EXTENSIONS: [&str; 2] = ["png", "jpg"];

async fn file_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Assets written ahead of time under the public folder:
/// `audio/{speaker}/{story}/page_{n}.wav` and `images/{story}/page_{n}.{png|jpg}`.
#[derive(Debug, Clone)]
pub struct PregeneratedAssets {
    root: PathBuf,
}

impl PregeneratedAssets {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn audio_file(&self, speaker: &Speaker, story_id: &str, page_index: usize) -> PathBuf {
        self.root
            .join("audio")
            .join(speaker.folder)
            .join(story_id)
            .join(format!("page_{}.wav", page_index))
    }

    pub fn image_file(&self, story_id: &str, page_index: usize, extension: &str) -> PathBuf {
        self.root
            .join("images")
            .join(story_id)
            .join(format!("page_{}.{}", page_index, extension))
    }

    /// PNG wins over JPEG when both exist.
    pub async fn find_image(&self, story_id: &str, page_index: usize) -> Option<(PathBuf, String)> {
        for ext in IMAGE_EXTENSIONS {
            let file = self.image_file(story_id, page_index, ext);
            if file_exists(&file).await {
                return Some((file, format!("/images/{}/page_{}.{}", story_id, page_index, ext)));
            }
        }
        None
    }

    pub async fn resolve(&self, story_id: &str, page_index: usize, speaker: &Speaker) -> AssetStatus {
        let audio_file = self.audio_file(speaker, story_id, page_index);
        let has_audio = file_exists(&audio_file).await;
        let image = self.find_image(story_id, page_index).await;

        AssetStatus {
            index: page_index,
            has_image: image.is_some(),
            has_audio,
            image_path: image.as_ref().map(|(_, url)| url.clone()),
            audio_path: has_audio
                .then(|| format!("/audio/{}/{}/page_{}.wav", speaker.folder, story_id, page_index)),
            image_file: image.map(|(file, _)| file),
            audio_file: has_audio.then_some(audio_file),
        }
    }

    /// Speakers with narration for the story, judged by the first page.
    pub async fn available_speakers(&self, story_id: &str) -> Vec<&'static Speaker> {
        let mut found = Vec::new();
        for speaker in SPEAKERS {
            if file_exists(&self.audio_file(speaker, story_id, 0)).await {
                found.push(speaker);
            }
        }
        found
    }

    pub async fn story_status(&self, story_id: &str, page_count: usize, speaker: &Speaker) -> Vec<AssetStatus> {
        let mut pages = Vec::with_capacity(page_count);
        for index in 0..page_count {
            pages.push(self.resolve(story_id, index, speaker).await);
        }
        pages
    }
}

/// Illustrations generated while reading and kept in the image cache.
pub struct OnDemandImages {
    cache: ImageCache,
    generator: Arc<dyn ImageGenerator>,
}

impl OnDemandImages {
    pub fn new(cache: ImageCache, generator: Arc<dyn ImageGenerator>) -> Self {
        Self { cache, generator }
    }

    pub fn is_configured(&self) -> bool {
        self.generator.is_configured()
    }

    pub async fn has_image(&self, story_id: &str, page_index: usize) -> Result<bool, AssetError> {
        Ok(self.cache.contains(story_id, page_index).await?)
    }

    pub async fn image(&self, story_id: &str, page_index: usize) -> Result<Option<CachedImage>, AssetError> {
        Ok(self.cache.get(story_id, page_index).await?)
    }

    /// Pages without a cached image, in page order.
    pub async fn missing_pages(&self, story: &Story) -> Result<Vec<usize>, AssetError> {
        let mut missing = Vec::new();
        for index in 0..story.pages.len() {
            if !self.cache.contains(&story.id, index).await? {
                missing.push(index);
            }
        }
        Ok(missing)
    }

    /// Generates and caches the page illustration. On failure the cache is left untouched.
    pub async fn generate(&self, story: &Story, page_index: usize) -> Result<CachedImage, AssetError> {
        let page = story.page(page_index).ok_or_else(|| AssetError::UnknownPage {
            story_id: story.id.clone(),
            page_index,
        })?;

        let image = self.generator.generate(&page.image_prompt).await?;
        self.cache.put(&story.id, page_index, &image).await?;
        info!("Generated image for {}/page_{} ({})", story.id, page_index, image.mime_type);
        Ok(image)
    }

    pub async fn regenerate(&self, story: &Story, page_index: usize) -> Result<CachedImage, AssetError> {
        self.cache.remove(&story.id, page_index).await?;
        self.generate(story, page_index).await
    }

    pub async fn delete(&self, story_id: &str, page_index: usize) -> Result<(), AssetError> {
        self.cache.remove(story_id, page_index).await?;
        Ok(())
    }
}

/// Looks for page media on disk first, then in the image cache.
pub struct AssetResolver {
    pub pregenerated: PregeneratedAssets,
    pub on_demand: Arc<OnDemandImages>,
}

impl AssetResolver {
    pub fn new(pregenerated: PregeneratedAssets, on_demand: Arc<OnDemandImages>) -> Self {
        Self {
            pregenerated,
            on_demand,
        }
    }

    pub async fn resolve(&self, story_id: &str, page_index: usize, speaker: &Speaker) -> AssetStatus {
        let mut status = self.pregenerated.resolve(story_id, page_index, speaker).await;
        if !status.has_image {
            status.has_image = match self.on_demand.has_image(story_id, page_index).await {
                Ok(cached) => cached,
                Err(e) => {
                    warn!("Image cache lookup failed for {}/page_{}: {}", story_id, page_index, e);
                    false
                }
            };
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::catalog::Catalog;
    use crate::core::io::MemoryStorage;
    use crate::core::speakers;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeGenerator {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ImageGenerator for FakeGenerator {
        fn is_configured(&self) -> bool {
            true
        }

        async fn generate(&self, prompt: &str) -> Result<CachedImage, AssetError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AssetError::Generation("quota".to_string()));
            }
            Ok(CachedImage {
                mime_type: "image/png".to_string(),
                data: prompt.as_bytes().to_vec(),
            })
        }
    }

    fn on_demand(fail: bool) -> (OnDemandImages, Arc<FakeGenerator>) {
        let generator = Arc::new(FakeGenerator { calls: AtomicUsize::new(0), fail });
        let cache = ImageCache::new(Arc::new(MemoryStorage::new()));
        (OnDemandImages::new(cache, generator.clone()), generator)
    }

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"x").unwrap();
    }

    #[tokio::test]
    async fn test_pregenerated_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let assets = PregeneratedAssets::new(dir.path());
        let zundamon = speakers::find("zundamon").unwrap();
        let metan = speakers::find("metan").unwrap();

        touch(&dir.path().join("images/lonely/page_0.jpg"));
        touch(&dir.path().join("images/lonely/page_0.png"));
        touch(&dir.path().join("images/lonely/page_1.jpg"));
        touch(&dir.path().join("audio/zundamon/lonely/page_0.wav"));

        let p0 = assets.resolve("lonely", 0, zundamon).await;
        assert!(p0.has_image && p0.has_audio);
        assert_eq!(p0.image_path.as_deref(), Some("/images/lonely/page_0.png"));
        assert_eq!(p0.audio_path.as_deref(), Some("/audio/zundamon/lonely/page_0.wav"));

        let p1 = assets.resolve("lonely", 1, zundamon).await;
        assert_eq!(p1.image_path.as_deref(), Some("/images/lonely/page_1.jpg"));
        assert!(!p1.has_audio);

        // No folder for this speaker at all.
        let other = assets.resolve("lonely", 0, metan).await;
        assert!(!other.has_audio);
        assert!(other.audio_path.is_none());

        let p2 = assets.resolve("lonely", 2, zundamon).await;
        assert!(!p2.has_image && !p2.has_audio);

        let available: Vec<&str> = assets
            .available_speakers("lonely")
            .await
            .iter()
            .map(|s| s.key)
            .collect();
        assert_eq!(available, vec!["zundamon"]);
    }

    #[tokio::test]
    async fn test_status_serializes_like_the_admin_api() {
        let dir = tempfile::tempdir().unwrap();
        let assets = PregeneratedAssets::new(dir.path());
        let status = assets.resolve("sad", 3, speakers::find_or_default("x")).await;
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "index": 3,
                "hasImage": false,
                "hasAudio": false,
                "imagePath": null,
                "audioPath": null
            })
        );
    }

    #[tokio::test]
    async fn test_generate_regenerate_delete() {
        let catalog = Catalog::builtin().unwrap();
        let story = catalog.get("angry").unwrap();
        let (images, generator) = on_demand(false);

        assert!(!images.has_image("angry", 1).await.unwrap());
        let image = images.generate(story, 1).await.unwrap();
        assert_eq!(image.data, story.pages[1].image_prompt.as_bytes());
        assert!(images.has_image("angry", 1).await.unwrap());
        assert_eq!(images.missing_pages(story).await.unwrap(), vec![0, 2, 3, 4]);

        images.regenerate(story, 1).await.unwrap();
        assert_eq!(generator.calls.load(Ordering::SeqCst), 2);

        images.delete("angry", 1).await.unwrap();
        assert!(!images.has_image("angry", 1).await.unwrap());

        assert!(matches!(
            images.generate(story, 99).await,
            Err(AssetError::UnknownPage { page_index: 99, .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_generation_leaves_page_missing() {
        let catalog = Catalog::builtin().unwrap();
        let story = catalog.get("tired").unwrap();
        let (images, _) = on_demand(true);

        assert!(images.generate(story, 0).await.is_err());
        assert!(!images.has_image("tired", 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_resolver_falls_back_to_cache() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::builtin().unwrap();
        let story = catalog.get("confused").unwrap();
        let (images, _) = on_demand(false);
        let resolver = AssetResolver::new(PregeneratedAssets::new(dir.path()), Arc::new(images));
        let speaker = speakers::find_or_default("zundamon");

        assert!(!resolver.resolve("confused", 0, speaker).await.has_image);
        resolver.on_demand.generate(story, 0).await.unwrap();
        let status = resolver.resolve("confused", 0, speaker).await;
        assert!(status.has_image);
        assert!(status.image_path.is_none());
    }
}
