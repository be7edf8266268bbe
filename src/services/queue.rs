use crate::core::catalog::Story;
use crate::services::assets::{AssetError, OnDemandImages};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueProgress {
    /// Pages attempted so far, failures included.
    pub completed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueueReport {
    pub attempted: usize,
    pub generated: Vec<usize>,
    pub failed: Vec<usize>,
    pub cancelled: bool,
}

/// Fills in missing page illustrations one at a time, pausing between requests.
pub struct GenerationQueue {
    images: Arc<OnDemandImages>,
    delay: Duration,
}

impl GenerationQueue {
    pub fn new(images: Arc<OnDemandImages>, delay: Duration) -> Self {
        Self { images, delay }
    }

    pub async fn start(&self, story: &Story) -> Result<QueueHandle, AssetError> {
        let missing = self.images.missing_pages(story).await?;
        let total = missing.len();
        let (progress_tx, progress_rx) = watch::channel(QueueProgress { completed: 0, total });
        let cancel = Arc::new(AtomicBool::new(false));

        info!("Background generation for {}: {} page(s) missing", story.id, total);
        let task = tokio::spawn(run(
            self.images.clone(),
            story.clone(),
            missing,
            self.delay,
            cancel.clone(),
            progress_tx,
        ));

        Ok(QueueHandle {
            cancel,
            progress: progress_rx,
            task: Some(task),
        })
    }
}

async fn run(
    images: Arc<OnDemandImages>,
    story: Story,
    pages: Vec<usize>,
    delay: Duration,
    cancel: Arc<AtomicBool>,
    progress: watch::Sender<QueueProgress>,
) -> QueueReport {
    let total = pages.len();
    let mut report = QueueReport::default();

    for (i, &index) in pages.iter().enumerate() {
        if i > 0 {
            tokio::time::sleep(delay).await;
        }
        if cancel.load(Ordering::SeqCst) {
            debug!("Background generation for {} cancelled", story.id);
            report.cancelled = true;
            break;
        }

        // The reader may have generated this page in the meantime.
        if !matches!(images.has_image(&story.id, index).await, Ok(true)) {
            match images.generate(&story, index).await {
                Ok(_) => report.generated.push(index),
                Err(e) => {
                    warn!("Background generation failed for {}/page_{}: {}", story.id, index, e);
                    report.failed.push(index);
                }
            }
        }

        report.attempted += 1;
        progress.send_replace(QueueProgress {
            completed: report.attempted,
            total,
        });
    }

    info!(
        "Background generation for {} finished: {} generated, {} failed",
        story.id,
        report.generated.len(),
        report.failed.len()
    );
    report
}

/// Dropping the handle cancels the run; the request in flight still completes.
pub struct QueueHandle {
    cancel: Arc<AtomicBool>,
    progress: watch::Receiver<QueueProgress>,
    task: Option<JoinHandle<QueueReport>>,
}

impl QueueHandle {
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn progress(&self) -> watch::Receiver<QueueProgress> {
        self.progress.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map(|t| t.is_finished()).unwrap_or(true)
    }

    pub async fn join(mut self) -> QueueReport {
        match self.task.take() {
            Some(task) => task.await.unwrap_or_else(|e| {
                warn!("Background generation task failed: {}", e);
                QueueReport::default()
            }),
            None => QueueReport::default(),
        }
    }
}

impl Drop for QueueHandle {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
    }
}
