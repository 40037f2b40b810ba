use async_trait::async_trait;
use chrono::{DateTime, Utc};
use image::DynamicImage;
use image::metadata::Orientation;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

pub type AssetId = String;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Access to the media library was denied")]
    AccessDenied,

    #[error("Image data unavailable for asset {id}")]
    ImageDataUnavailable { id: AssetId },

    #[error("Asset not found: {id}")]
    NotFound { id: AssetId },

    #[error("Failed to delete assets: {message}")]
    Deletion { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    Image,
    Video,
    Other,
}

/// A library item. Owned by the asset source and referenced here by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: AssetId,
    pub creation_date: Option<DateTime<Utc>>,
    pub media_kind: MediaKind,
}

impl Asset {
    pub fn image(id: impl Into<AssetId>, creation_date: Option<DateTime<Utc>>) -> Self {
        Self {
            id: id.into(),
            creation_date,
            media_kind: MediaKind::Image,
        }
    }

    pub fn is_image(&self) -> bool {
        self.media_kind == MediaKind::Image
    }
}

/// Decoded, size-bounded pixels handed to a feature extractor.
#[derive(Debug, Clone)]
pub struct Thumbnail {
    pub image: DynamicImage,
    pub orientation: Orientation,
}

impl Thumbnail {
    pub fn upright(image: DynamicImage) -> Self {
        Self {
            image,
            orientation: Orientation::NoTransforms,
        }
    }
}

/// The media library this crate indexes.
///
/// `fetch` must be deterministic: newest first, and an offset past a range
/// already returned never yields those items again.
#[async_trait]
pub trait AssetSource: Send + Sync {
    async fn fetch(
        &self,
        offset: usize,
        limit: usize,
        kind: MediaKind,
    ) -> Result<Vec<Asset>, SourceError>;

    /// Load pixels for `asset` with the longest side close to `max_side`.
    async fn load_thumbnail(&self, asset: &Asset, max_side: u32) -> Result<Thumbnail, SourceError>;

    async fn delete(&self, ids: &HashSet<AssetId>) -> Result<(), SourceError>;
}
