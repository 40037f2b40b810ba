//! In-memory collaborators for unit tests.
//!
//! `MemorySource` encodes each asset's feature vector into the red channel of
//! a one-row float image; `PixelVectorExtractor` reads it back, so tests can
//! choose exact distances between assets.

use crate::core::asset::{Asset, AssetId, AssetSource, MediaKind, SourceError, Thumbnail};
use crate::core::descriptor::FeatureVector;
use crate::core::extractor::{ExtractionError, FeatureExtractor};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use image::metadata::Orientation;
use image::{DynamicImage, GenericImageView, ImageBuffer, Rgb};
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration as StdDuration;
use tokio_util::sync::CancellationToken;

fn newest() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

#[derive(Debug, Clone)]
enum Pixels {
    Vector(Vec<f32>),
    Blank(u32, u32),
}

/// Assets are dated in insertion order: the first one added is the newest.
#[derive(Debug, Default)]
pub struct MemorySource {
    entries: Mutex<Vec<(Asset, Pixels)>>,
    unreadable: HashSet<AssetId>,
    access_denied: AtomicBool,
    fail_deletes: bool,
    pub fetch_calls: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(self, id: &str, kind: MediaKind, pixels: Pixels) -> Self {
        {
            let mut entries = self.entries.lock().unwrap();
            let date = newest() - Duration::minutes(entries.len() as i64);
            entries.push((
                Asset {
                    id: id.to_string(),
                    creation_date: Some(date),
                    media_kind: kind,
                },
                pixels,
            ));
        }
        self
    }

    pub fn with_image(self, id: &str, vector: Vec<f32>) -> Self {
        self.push(id, MediaKind::Image, Pixels::Vector(vector))
    }

    pub fn with_oversized(self, id: &str, width: u32, height: u32) -> Self {
        self.push(id, MediaKind::Image, Pixels::Blank(width, height))
    }

    pub fn with_video(self, id: &str) -> Self {
        self.push(id, MediaKind::Video, Pixels::Vector(vec![0.0]))
    }

    pub fn with_unreadable(mut self, id: &str) -> Self {
        self.unreadable.insert(id.to_string());
        self
    }

    pub fn with_access_denied(self) -> Self {
        self.set_access_denied(true);
        self
    }

    pub fn with_failing_deletes(mut self) -> Self {
        self.fail_deletes = true;
        self
    }

    pub fn set_access_denied(&self, denied: bool) {
        self.access_denied.store(denied, Ordering::SeqCst);
    }

    pub fn asset(&self, id: &str) -> Asset {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|(asset, _)| asset.id == id)
            .map(|(asset, _)| asset.clone())
            .unwrap()
    }

    pub fn ids(&self) -> Vec<AssetId> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|(asset, _)| asset.id.clone())
            .collect()
    }
}

#[async_trait]
impl AssetSource for MemorySource {
    async fn fetch(
        &self,
        offset: usize,
        limit: usize,
        kind: MediaKind,
    ) -> Result<Vec<Asset>, SourceError> {
        if self.access_denied.load(Ordering::SeqCst) {
            return Err(SourceError::AccessDenied);
        }
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);

        let mut assets: Vec<Asset> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(asset, _)| asset.media_kind == kind)
            .map(|(asset, _)| asset.clone())
            .collect();
        assets.sort_by_key(|asset| Reverse(asset.creation_date));

        Ok(assets.into_iter().skip(offset).take(limit).collect())
    }

    async fn load_thumbnail(&self, asset: &Asset, _max_side: u32) -> Result<Thumbnail, SourceError> {
        if self.unreadable.contains(&asset.id) {
            return Err(SourceError::ImageDataUnavailable {
                id: asset.id.clone(),
            });
        }

        let pixels = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .find(|(candidate, _)| candidate.id == asset.id)
            .map(|(_, pixels)| pixels.clone())
            .ok_or_else(|| SourceError::NotFound {
                id: asset.id.clone(),
            })?;

        let image = match pixels {
            Pixels::Vector(values) => {
                let buffer = ImageBuffer::from_fn(values.len() as u32, 1, |x, _| {
                    Rgb([values[x as usize], 0.0, 0.0])
                });
                DynamicImage::ImageRgb32F(buffer)
            }
            Pixels::Blank(width, height) => DynamicImage::new_rgb8(width, height),
        };

        Ok(Thumbnail::upright(image))
    }

    async fn delete(&self, ids: &HashSet<AssetId>) -> Result<(), SourceError> {
        if self.fail_deletes {
            return Err(SourceError::Deletion {
                message: "deletion refused".to_string(),
            });
        }
        self.entries
            .lock()
            .unwrap()
            .retain(|(asset, _)| !ids.contains(&asset.id));
        Ok(())
    }
}

/// Reads the vector back out of a `MemorySource` thumbnail. A NaN anywhere
/// in it is reported as an unavailable feature print.
#[derive(Debug, Default)]
pub struct PixelVectorExtractor {
    delay: Option<StdDuration>,
    cancel_after: Option<(usize, CancellationToken)>,
    in_flight: AtomicUsize,
    completed: AtomicUsize,
    pub calls: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub last_dimensions: Mutex<(u32, u32)>,
}

impl PixelVectorExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: StdDuration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Cancel `token` once `count` extractions have finished.
    pub fn cancel_after(mut self, count: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((count, token));
        self
    }
}

#[async_trait]
impl FeatureExtractor for PixelVectorExtractor {
    async fn extract_features(
        &self,
        image: &DynamicImage,
        _orientation: Orientation,
    ) -> Result<FeatureVector, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        match self.delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }

        *self.last_dimensions.lock().unwrap() = image.dimensions();
        let row = image.to_rgb32f();
        let values: Vec<f32> = (0..row.width()).map(|x| row.get_pixel(x, 0)[0]).collect();

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let finished = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((count, token)) = &self.cancel_after {
            if finished >= *count {
                token.cancel();
            }
        }

        if values.iter().any(|v| v.is_nan()) {
            return Err(ExtractionError::FeaturePrintUnavailable {
                message: "no usable pixels".to_string(),
            });
        }
        Ok(FeatureVector::new(values))
    }
}

/// Every asset id in `clusters`, for membership assertions.
pub fn clustered_ids(clusters: &[crate::core::duplicate::DuplicateCluster]) -> HashMap<AssetId, usize> {
    let mut seen = HashMap::new();
    for cluster in clusters {
        for id in &cluster.member_asset_ids {
            *seen.entry(id.clone()).or_insert(0) += 1;
        }
    }
    seen
}
