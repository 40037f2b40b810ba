use crate::core::asset::AssetId;
use crate::core::duplicate::DuplicateCluster;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub refresh_interval_secs: u64,
}

impl CacheConfig {
    pub fn refresh_interval(&self) -> TimeDelta {
        TimeDelta::seconds(self.refresh_interval_secs.min(i64::MAX as u64) as i64)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 15 * 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ClusterPage {
    pub clusters: Vec<DuplicateCluster>,
    pub has_more: bool,
}

/// The most recent cluster set, kept newest-representative first.
#[derive(Debug)]
pub struct ResultCache {
    clusters: Vec<DuplicateCluster>,
    last_scan_at: Option<DateTime<Utc>>,
    refresh_interval: TimeDelta,
}

impl ResultCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            clusters: Vec::new(),
            last_scan_at: None,
            refresh_interval: config.refresh_interval(),
        }
    }

    pub fn clusters(&self) -> &[DuplicateCluster] {
        &self.clusters
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn last_scan_at(&self) -> Option<DateTime<Utc>> {
        self.last_scan_at
    }

    pub fn is_stale(&self, force_refresh: bool) -> bool {
        self.is_stale_at(Utc::now(), force_refresh)
    }

    pub fn is_stale_at(&self, now: DateTime<Utc>, force_refresh: bool) -> bool {
        if force_refresh {
            return true;
        }
        match self.last_scan_at {
            None => true,
            Some(last) => now - last > self.refresh_interval,
        }
    }

    /// Swap in the result of a full scan.
    pub fn replace(&mut self, clusters: Vec<DuplicateCluster>, scanned_at: DateTime<Utc>) {
        self.clusters = clusters;
        self.last_scan_at = Some(scanned_at);
        self.sort();
    }

    /// Append the result of a continuation scan.
    pub fn extend(&mut self, clusters: Vec<DuplicateCluster>, scanned_at: DateTime<Utc>) {
        self.clusters.extend(clusters);
        self.last_scan_at = Some(scanned_at);
        self.sort();
    }

    /// Drop every cluster that references one of `asset_ids`. Returns how
    /// many clusters were removed.
    pub fn forget(&mut self, asset_ids: &HashSet<AssetId>) -> usize {
        let before = self.clusters.len();
        self.clusters
            .retain(|cluster| !cluster.member_asset_ids.iter().any(|id| asset_ids.contains(id)));
        before - self.clusters.len()
    }

    pub fn invalidate(&mut self) {
        self.clusters.clear();
        self.last_scan_at = None;
    }

    /// Clusters with at least one member outside `excluding`.
    pub fn visible_count(&self, excluding: &HashSet<AssetId>) -> usize {
        self.visible(excluding).count()
    }

    /// A contiguous slice of the visible clusters. A cluster stays visible,
    /// with its full membership, while any member is not excluded.
    pub fn page(&self, page: usize, page_size: usize, excluding: &HashSet<AssetId>) -> ClusterPage {
        let start = page.saturating_mul(page_size);
        let end = start.saturating_add(page_size);

        let visible: Vec<&DuplicateCluster> = self.visible(excluding).collect();
        let clusters = visible
            .iter()
            .skip(start)
            .take(page_size)
            .map(|cluster| (*cluster).clone())
            .collect();

        ClusterPage {
            clusters,
            has_more: page_size > 0 && visible.len() > end,
        }
    }

    fn visible<'a>(
        &'a self,
        excluding: &'a HashSet<AssetId>,
    ) -> impl Iterator<Item = &'a DuplicateCluster> + 'a {
        self.clusters
            .iter()
            .filter(move |cluster| !cluster.is_fully_excluded(excluding))
    }

    fn sort(&mut self) {
        self.clusters
            .sort_by_key(|cluster| Reverse(cluster.representative_date));
    }
}
