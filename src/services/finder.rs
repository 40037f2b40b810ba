use crate::config::FinderConfig;
use crate::core::asset::{AssetId, AssetSource};
use crate::core::descriptor::DescriptorCache;
use crate::core::duplicate::ClusterBuilder;
use crate::core::extractor::{FeatureExtractor, FeatureExtractorAdapter};
use crate::core::results::{ClusterPage, ResultCache};
use crate::core::scanner::{
    ProgressCallback, ScanCoordinator, ScanError, ScanMode, ScanState, ScanStatus,
};
use crate::core::thumbnail::ThumbnailService;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_PAGE_SIZE: usize = 20;

#[derive(Debug, Clone)]
pub struct PageRequest {
    pub page: usize,
    pub page_size: usize,
    /// Rescan from the newest asset even if the cache is fresh.
    pub force_refresh: bool,
    /// Keep scanning further batches until the page is filled.
    pub allow_deep_scan: bool,
    /// Assets the caller has already reviewed or deleted.
    pub excluding: HashSet<AssetId>,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 0,
            page_size: DEFAULT_PAGE_SIZE,
            force_refresh: false,
            allow_deep_scan: false,
            excluding: HashSet::new(),
        }
    }
}

/// Everything behind the single-writer boundary.
struct FinderState {
    scan_state: ScanState,
    status: ScanStatus,
    results: ResultCache,
    cancel: Option<CancellationToken>,
    /// Bumped by `invalidate_cache`; a scan that started under an older
    /// generation is discarded instead of committed.
    generation: u64,
    /// Assets before `scan_offset`, used to pull the offset back on deletion.
    scanned: HashSet<AssetId>,
}

/// Mode for a stale, unforced refresh: keep walking the library until it is
/// covered, then wrap around.
fn refresh_mode(scan_state: &ScanState, force_refresh: bool) -> ScanMode {
    if force_refresh || scan_state.last_scan_at.is_none() || scan_state.exhausted {
        ScanMode::Full
    } else {
        ScanMode::Continue
    }
}

/// Marks the one in-flight scan. Released on drop, including on error paths.
struct ScanGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> ScanGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Entry point for callers: pages of near-duplicate clusters, scanned and
/// cached on demand.
pub struct DuplicateFinder {
    source: Arc<dyn AssetSource>,
    descriptors: Arc<DescriptorCache>,
    coordinator: ScanCoordinator,
    state: Mutex<FinderState>,
    scanning: AtomicBool,
}

impl DuplicateFinder {
    pub fn new(
        source: Arc<dyn AssetSource>,
        extractor: Arc<dyn FeatureExtractor>,
        config: FinderConfig,
    ) -> Self {
        let descriptors = Arc::new(DescriptorCache::new());
        let adapter = FeatureExtractorAdapter::new(
            source.clone(),
            extractor,
            descriptors.clone(),
            ThumbnailService::with_size(config.scan.thumbnail_size),
        );
        let coordinator = ScanCoordinator::new(
            source.clone(),
            Arc::new(adapter),
            ClusterBuilder::new(config.cluster),
            config.scan,
        );

        Self {
            source,
            descriptors,
            coordinator,
            state: Mutex::new(FinderState {
                scan_state: ScanState::default(),
                status: ScanStatus::Idle,
                results: ResultCache::new(&config.cache),
                cancel: None,
                generation: 0,
                scanned: HashSet::new(),
            }),
            scanning: AtomicBool::new(false),
        }
    }

    pub fn descriptor_cache(&self) -> &Arc<DescriptorCache> {
        &self.descriptors
    }

    /// Serve one page of clusters, scanning first if the cache is stale.
    ///
    /// A stale cache resumes at the stored offset; a forced refresh, an
    /// empty or invalidated cache and a fully covered library start over
    /// from the newest asset. With `allow_deep_scan`, continuation batches
    /// run until the page is full or the library is exhausted, so a short
    /// page is always the last one.
    ///
    /// While another call is scanning, this returns whatever is cached and
    /// `on_progress` is never invoked.
    pub async fn request_page(
        &self,
        request: PageRequest,
        on_progress: Option<ProgressCallback<'_>>,
    ) -> Result<ClusterPage, ScanError> {
        if request.page_size == 0 {
            log::debug!("Zero page size requested; nothing to serve");
            return Ok(ClusterPage {
                clusters: Vec::new(),
                has_more: false,
            });
        }

        let Some(_guard) = ScanGuard::acquire(&self.scanning) else {
            log::debug!("Scan already in progress; serving cached clusters");
            return Ok(self.cached_page(&request).await);
        };

        let refresh = {
            let state = self.state.lock().await;
            state
                .results
                .is_stale(request.force_refresh)
                .then(|| refresh_mode(&state.scan_state, request.force_refresh))
        };
        if let Some(mode) = refresh {
            match mode {
                ScanMode::Full => log::info!(
                    "Cluster cache is {}; starting full scan",
                    if request.force_refresh { "being refreshed" } else { "stale" }
                ),
                ScanMode::Continue => log::info!("Cluster cache is stale; continuing scan"),
            }
            self.run_scan(mode, on_progress).await?;
        }

        let mut page = self.cached_page(&request).await;
        while page.clusters.len() < request.page_size && request.allow_deep_scan {
            let before = self.state.lock().await.scan_state.clone();
            if before.exhausted {
                break;
            }
            log::info!(
                "Page {} has {} of {} clusters; continuing scan",
                request.page,
                page.clusters.len(),
                request.page_size
            );
            self.run_scan(ScanMode::Continue, on_progress).await?;
            page = self.cached_page(&request).await;

            let after = self.state.lock().await.scan_state.clone();
            if after.scan_offset == before.scan_offset && !after.exhausted {
                log::warn!("Continuation scan made no progress at offset {}", after.scan_offset);
                break;
            }
        }

        Ok(page)
    }

    async fn cached_page(&self, request: &PageRequest) -> ClusterPage {
        let state = self.state.lock().await;
        let mut page = state
            .results
            .page(request.page, request.page_size, &request.excluding);
        page.has_more |= request.allow_deep_scan && !state.scan_state.exhausted;
        page
    }

    async fn run_scan(
        &self,
        mode: ScanMode,
        on_progress: Option<ProgressCallback<'_>>,
    ) -> Result<(), ScanError> {
        let (start_offset, cancel, generation) = {
            let mut state = self.state.lock().await;
            let cancel = CancellationToken::new();
            state.cancel = Some(cancel.clone());
            state.status = ScanStatus::Scanning;
            (state.scan_state.start_offset(mode), cancel, state.generation)
        };

        let result = self.coordinator.scan(start_offset, &cancel, on_progress).await;

        let mut state = self.state.lock().await;
        state.cancel = None;
        if state.generation != generation {
            log::info!("Cache was invalidated during the scan; discarding its results");
            state.status = ScanStatus::Idle;
            return Ok(());
        }

        match result {
            Ok(outcome) => {
                state.scan_state.commit(mode, &outcome);
                match mode {
                    ScanMode::Full => {
                        state.scanned = outcome.scanned_ids.into_iter().collect();
                        state.results.replace(outcome.clusters, outcome.finished_at);
                    }
                    ScanMode::Continue => {
                        state.scanned.extend(outcome.scanned_ids);
                        state.results.extend(outcome.clusters, outcome.finished_at);
                    }
                }
                state.status = ScanStatus::Completed;
                log::debug!(
                    "Committed scan: offset {}, {} scanned, {} clusters cached",
                    state.scan_state.scan_offset,
                    state.scan_state.total_scanned,
                    state.results.len()
                );
                Ok(())
            }
            Err(ScanError::AccessDenied) => {
                // Commit an empty, timestamped result so callers are not
                // rescanning on every request.
                let now = Utc::now();
                state.scan_state.mark_attempt(now);
                state.scanned.clear();
                state.results.replace(Vec::new(), now);
                state.status = ScanStatus::Failed(ScanError::AccessDenied.to_string());
                log::warn!("Media library access denied");
                Err(ScanError::AccessDenied)
            }
            Err(ScanError::Cancelled) => {
                state.status = ScanStatus::Cancelled;
                log::info!("Scan cancelled; cache left unchanged");
                Err(ScanError::Cancelled)
            }
            Err(e) => {
                state.status = ScanStatus::Failed(e.to_string());
                log::error!("Scan failed: {}", e);
                Err(e)
            }
        }
    }

    /// Drop clusters, descriptors and scan progress.
    pub async fn invalidate_cache(&self) {
        {
            let mut state = self.state.lock().await;
            state.results.invalidate();
            state.scan_state.reset();
            state.scanned.clear();
            state.generation += 1;
            if state.cancel.is_none() {
                state.status = ScanStatus::Idle;
            }
        }
        self.descriptors.clear().await;
        log::info!("Duplicate cache invalidated");
    }

    pub async fn has_cached_results(&self) -> bool {
        !self.state.lock().await.results.is_empty()
    }

    /// Returns true if a scan was running.
    pub async fn cancel_scan(&self) -> bool {
        match &self.state.lock().await.cancel {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn scan_status(&self) -> ScanStatus {
        self.state.lock().await.status.clone()
    }

    pub async fn scan_state(&self) -> ScanState {
        self.state.lock().await.scan_state.clone()
    }

    /// Delete assets through the source and forget them on success. On
    /// failure the cache is left as it was.
    pub async fn delete_assets(&self, ids: &HashSet<AssetId>) -> Result<usize, ScanError> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.source.delete(ids).await?;
        log::info!("Deleted {} assets", ids.len());
        Ok(self.forget_assets(ids).await)
    }

    /// For callers that delete through the source themselves. Returns the
    /// number of clusters dropped.
    ///
    /// Deleted assets that were already scanned shift the rest of the library
    /// down, so the scan offset moves back by that many.
    pub async fn forget_assets(&self, ids: &HashSet<AssetId>) -> usize {
        let removed = {
            let mut state = self.state.lock().await;
            let before = state.scanned.len();
            state.scanned.retain(|id| !ids.contains(id));
            let shifted = before - state.scanned.len();
            state.scan_state.forget_scanned(shifted);
            if shifted > 0 {
                log::debug!(
                    "{} deleted assets were already scanned; offset now {}",
                    shifted,
                    state.scan_state.scan_offset
                );
            }
            state.results.forget(ids)
        };
        for id in ids {
            self.descriptors.remove(id).await;
        }
        log::debug!("Forgot {} assets, dropping {} clusters", ids.len(), removed);
        removed
    }
}
