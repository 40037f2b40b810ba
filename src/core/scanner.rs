use crate::core::asset::{Asset, AssetId, AssetSource, SourceError};
use crate::core::descriptor::FeatureDescriptor;
use crate::core::duplicate::{ClusterBuilder, DuplicateCluster};
use crate::core::extractor::{ExtractionError, FeatureExtractorAdapter};
use crate::core::fetcher::AssetFetcher;
use crate::core::thumbnail::DEFAULT_THUMBNAIL_SIZE;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Share of the progress range spent on extraction; clustering takes the rest.
const EXTRACTION_SHARE: f64 = 0.7;

/// Receives a fraction in `[0, 1]`, non-decreasing within one scan. A page
/// request that runs several scans reports each from 0 again, so a restart
/// marks the next batch.
pub type ProgressCallback<'a> = &'a (dyn Fn(f64) + Send + Sync);

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Access to the media library was denied")]
    AccessDenied,

    #[error("Asset source error: {0}")]
    Source(SourceError),

    #[error("Scan worker failed: {message}")]
    Worker { message: String },

    #[error("Operation cancelled")]
    Cancelled,
}

impl From<SourceError> for ScanError {
    fn from(error: SourceError) -> Self {
        match error {
            SourceError::AccessDenied => ScanError::AccessDenied,
            other => ScanError::Source(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub batch_size: usize,
    pub concurrency: usize,
    pub thumbnail_size: u32,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            concurrency: 8,
            thumbnail_size: DEFAULT_THUMBNAIL_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanMode {
    /// Restart from the newest asset.
    Full,
    /// Resume at the stored offset.
    Continue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanStatus {
    Idle,
    Scanning,
    Completed,
    Cancelled,
    Failed(String),
}

/// Incremental coverage of the library across scans.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanState {
    pub scan_offset: usize,
    pub total_scanned: usize,
    pub last_scan_at: Option<DateTime<Utc>>,
    pub exhausted: bool,
}

impl ScanState {
    pub fn start_offset(&self, mode: ScanMode) -> usize {
        match mode {
            ScanMode::Full => 0,
            ScanMode::Continue => self.scan_offset,
        }
    }

    pub fn commit(&mut self, mode: ScanMode, outcome: &ScanOutcome) {
        match mode {
            ScanMode::Full => self.total_scanned = outcome.fetched,
            ScanMode::Continue => self.total_scanned += outcome.fetched,
        }
        self.scan_offset = outcome.next_offset;
        self.exhausted = outcome.exhausted;
        self.last_scan_at = Some(outcome.finished_at);
    }

    /// Record a scan that could not read the library, so staleness checks
    /// back off instead of retrying immediately.
    pub fn mark_attempt(&mut self, at: DateTime<Utc>) {
        self.scan_offset = 0;
        self.total_scanned = 0;
        self.exhausted = true;
        self.last_scan_at = Some(at);
    }

    /// Pull the offset back after `count` already-scanned assets left the
    /// library, so the next continuation starts at the first unscanned one.
    pub fn forget_scanned(&mut self, count: usize) {
        self.scan_offset = self.scan_offset.saturating_sub(count);
        self.total_scanned = self.total_scanned.saturating_sub(count);
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Everything one scan produced. Nothing is applied until the caller commits.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub clusters: Vec<DuplicateCluster>,
    pub start_offset: usize,
    pub next_offset: usize,
    /// Items the source returned for this batch.
    pub fetched: usize,
    /// Images that produced a descriptor.
    pub described: usize,
    /// Images skipped because extraction failed.
    pub failed: usize,
    pub exhausted: bool,
    pub finished_at: DateTime<Utc>,
    /// Ids of every image in the batch, described or not.
    pub scanned_ids: Vec<AssetId>,
}

/// Runs one batch through fetch, bounded parallel extraction and clustering.
pub struct ScanCoordinator {
    fetcher: AssetFetcher,
    adapter: Arc<FeatureExtractorAdapter>,
    builder: Arc<ClusterBuilder>,
    config: ScanConfig,
}

impl ScanCoordinator {
    pub fn new(
        source: Arc<dyn AssetSource>,
        adapter: Arc<FeatureExtractorAdapter>,
        builder: ClusterBuilder,
        config: ScanConfig,
    ) -> Self {
        Self {
            fetcher: AssetFetcher::new(source),
            adapter,
            builder: Arc::new(builder),
            config,
        }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub async fn scan(
        &self,
        start_offset: usize,
        cancel: &CancellationToken,
        progress: Option<ProgressCallback<'_>>,
    ) -> Result<ScanOutcome, ScanError> {
        if cancel.is_cancelled() {
            return Err(ScanError::Cancelled);
        }

        let batch = self
            .fetcher
            .fetch_batch(start_offset, self.config.batch_size)
            .await?;
        log::info!(
            "Scanning {} images from offset {}",
            batch.assets.len(),
            start_offset
        );

        if cancel.is_cancelled() {
            return Err(ScanError::Cancelled);
        }

        let (descriptors, failed) = self.extract_all(&batch.assets, cancel, progress).await?;
        let described = descriptors.len();
        let next_offset = batch.next_offset();
        let scanned_ids: Vec<AssetId> = batch.assets.iter().map(|asset| asset.id.clone()).collect();
        let clusters = self
            .cluster(batch.assets, descriptors, cancel, progress)
            .await?;

        log::info!(
            "Scan complete: {} clusters from {} described images ({} failed)",
            clusters.len(),
            described,
            failed
        );
        report(progress, 1.0);

        Ok(ScanOutcome {
            clusters,
            start_offset,
            next_offset,
            fetched: batch.fetched,
            described,
            failed,
            exhausted: batch.exhausted,
            finished_at: Utc::now(),
            scanned_ids,
        })
    }

    /// Extract descriptors with at most `concurrency` tasks in flight. A
    /// finished task immediately frees its slot for the next asset.
    async fn extract_all(
        &self,
        assets: &[Asset],
        cancel: &CancellationToken,
        progress: Option<ProgressCallback<'_>>,
    ) -> Result<(HashMap<AssetId, Arc<FeatureDescriptor>>, usize), ScanError> {
        let total = assets.len();
        let mut descriptors = HashMap::with_capacity(total);
        let mut failed = 0;
        let mut completed = 0;

        let mut results = stream::iter(assets.iter().cloned())
            .map(|asset| {
                let adapter = self.adapter.clone();
                let cancel = cancel.clone();
                async move {
                    let id = asset.id.clone();
                    if cancel.is_cancelled() {
                        return (id, Err(ExtractionError::Cancelled));
                    }
                    let task = tokio::spawn(async move { adapter.extract(&asset, &cancel).await });
                    let result = task.await.unwrap_or_else(|e| {
                        Err(ExtractionError::FeaturePrintUnavailable {
                            message: format!("extraction task failed: {}", e),
                        })
                    });
                    (id, result)
                }
            })
            .buffer_unordered(self.config.concurrency.max(1));

        while let Some((id, result)) = results.next().await {
            completed += 1;
            match result {
                Ok(descriptor) => {
                    descriptors.insert(id, descriptor);
                }
                Err(ExtractionError::Cancelled) => {}
                Err(e) => {
                    failed += 1;
                    log::warn!("Skipping asset {}: {}", id, e);
                }
            }
            report(progress, EXTRACTION_SHARE * (completed as f64 / total as f64));
        }

        if cancel.is_cancelled() {
            log::info!("Scan cancelled after {} of {} extractions", completed, total);
            return Err(ScanError::Cancelled);
        }

        report(progress, EXTRACTION_SHARE);
        Ok((descriptors, failed))
    }

    /// Clustering is quadratic in the batch size, so it runs on a blocking
    /// thread and forwards progress back over a channel.
    async fn cluster(
        &self,
        assets: Vec<Asset>,
        descriptors: HashMap<AssetId, Arc<FeatureDescriptor>>,
        cancel: &CancellationToken,
        progress: Option<ProgressCallback<'_>>,
    ) -> Result<Vec<DuplicateCluster>, ScanError> {
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<f64>();
        let builder = self.builder.clone();
        let cancel = cancel.clone();

        let task = tokio::task::spawn_blocking(move || {
            builder.build(&assets, &descriptors, &cancel, |done, total| {
                if total > 0 {
                    let fraction = done as f64 / total as f64;
                    let _ = progress_tx.send(EXTRACTION_SHARE + (1.0 - EXTRACTION_SHARE) * fraction);
                }
            })
        });

        // The sender is dropped with the closure once clustering returns.
        while let Some(fraction) = progress_rx.recv().await {
            report(progress, fraction);
        }

        task.await
            .map_err(|e| ScanError::Worker {
                message: e.to_string(),
            })?
            .map_err(|_| ScanError::Cancelled)
    }
}

fn report(progress: Option<ProgressCallback<'_>>, fraction: f64) {
    if let Some(callback) = progress {
        callback(fraction.clamp(0.0, 1.0));
    }
}
