use crate::core::asset::{Asset, AssetId, AssetSource, SourceError, Thumbnail};
use crate::core::descriptor::{DescriptorCache, FeatureDescriptor, FeatureVector};
use crate::core::thumbnail::ThumbnailService;
use async_trait::async_trait;
use image::metadata::Orientation;
use image::{DynamicImage, GenericImageView};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Image data unavailable for asset {id}")]
    ImageDataUnavailable { id: AssetId },

    #[error("Feature print unavailable: {message}")]
    FeaturePrintUnavailable { message: String },

    #[error("Extraction cancelled")]
    Cancelled,
}

/// The vision capability that turns pixels into a descriptor.
///
/// Implementations are invoked concurrently from several workers and should
/// push CPU-heavy work onto a blocking thread.
#[async_trait]
pub trait FeatureExtractor: Send + Sync {
    async fn extract_features(
        &self,
        image: &DynamicImage,
        orientation: Orientation,
    ) -> Result<FeatureVector, ExtractionError>;
}

/// Fetches a thumbnail for an asset, runs the extractor on it and memoizes
/// the result in the shared [`DescriptorCache`].
pub struct FeatureExtractorAdapter {
    source: Arc<dyn AssetSource>,
    extractor: Arc<dyn FeatureExtractor>,
    cache: Arc<DescriptorCache>,
    thumbnails: ThumbnailService,
}

impl FeatureExtractorAdapter {
    pub fn new(
        source: Arc<dyn AssetSource>,
        extractor: Arc<dyn FeatureExtractor>,
        cache: Arc<DescriptorCache>,
        thumbnails: ThumbnailService,
    ) -> Self {
        Self {
            source,
            extractor,
            cache,
            thumbnails,
        }
    }

    pub fn cache(&self) -> &Arc<DescriptorCache> {
        &self.cache
    }

    pub async fn extract(
        &self,
        asset: &Asset,
        cancel: &CancellationToken,
    ) -> Result<Arc<FeatureDescriptor>, ExtractionError> {
        if let Some(cached) = self.cache.get(&asset.id).await {
            log::debug!("Descriptor cache hit for {}", asset.id);
            return Ok(cached);
        }

        let thumbnail = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ExtractionError::Cancelled),
            result = self.source.load_thumbnail(asset, self.thumbnails.thumbnail_size()) => {
                result.map_err(|e| self.image_unavailable(asset, e))?
            }
        };

        let Thumbnail { image, orientation } = thumbnail;
        let image = self.bound_size(asset, image).await?;

        let vector = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ExtractionError::Cancelled),
            result = self.extractor.extract_features(&image, orientation) => result?,
        };

        let descriptor = FeatureDescriptor::new(asset.id.clone(), vector);
        Ok(self.cache.insert_if_absent(descriptor).await)
    }

    /// Sources may hand back more pixels than asked for; never extract from
    /// anything larger than the thumbnail size.
    async fn bound_size(
        &self,
        asset: &Asset,
        image: DynamicImage,
    ) -> Result<DynamicImage, ExtractionError> {
        let (width, height) = image.dimensions();
        if width.max(height) <= self.thumbnails.thumbnail_size() {
            return Ok(image);
        }

        let thumbnails = self.thumbnails;
        tokio::task::spawn_blocking(move || thumbnails.fit(image))
            .await
            .map_err(|e| {
                log::warn!("Thumbnail resize for {} failed: {}", asset.id, e);
                ExtractionError::ImageDataUnavailable {
                    id: asset.id.clone(),
                }
            })
    }

    fn image_unavailable(&self, asset: &Asset, error: SourceError) -> ExtractionError {
        log::debug!("Thumbnail unavailable for {}: {}", asset.id, error);
        ExtractionError::ImageDataUnavailable {
            id: asset.id.clone(),
        }
    }
}
