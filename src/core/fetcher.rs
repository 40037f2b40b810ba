use crate::core::asset::{Asset, AssetSource, MediaKind, SourceError};
use std::cmp::Reverse;
use std::sync::Arc;

/// One page of the library enumeration.
#[derive(Debug, Clone)]
pub struct AssetBatch {
    pub offset: usize,
    /// Image assets, newest first.
    pub assets: Vec<Asset>,
    /// Items the source returned, before filtering. The next batch starts at
    /// `offset + fetched`.
    pub fetched: usize,
    /// The source returned fewer items than requested.
    pub exhausted: bool,
}

impl AssetBatch {
    pub fn next_offset(&self) -> usize {
        self.offset + self.fetched
    }
}

/// Offset-based, image-only enumeration over an [`AssetSource`].
#[derive(Clone)]
pub struct AssetFetcher {
    source: Arc<dyn AssetSource>,
}

impl AssetFetcher {
    pub fn new(source: Arc<dyn AssetSource>) -> Self {
        Self { source }
    }

    pub async fn fetch_batch(&self, offset: usize, limit: usize) -> Result<AssetBatch, SourceError> {
        if limit == 0 {
            return Ok(AssetBatch {
                offset,
                assets: Vec::new(),
                fetched: 0,
                exhausted: false,
            });
        }

        let fetched = self.source.fetch(offset, limit, MediaKind::Image).await?;
        let count = fetched.len();

        let mut assets: Vec<Asset> = fetched.into_iter().filter(Asset::is_image).collect();
        if assets.len() < count {
            log::debug!(
                "Dropped {} non-image assets from batch at offset {}",
                count - assets.len(),
                offset
            );
        }
        // Stable, so a source that already orders newest-first is untouched.
        assets.sort_by_key(|asset| Reverse(asset.creation_date));

        log::debug!(
            "Fetched {} assets at offset {} (limit {})",
            assets.len(),
            offset,
            limit
        );

        Ok(AssetBatch {
            offset,
            assets,
            fetched: count,
            exhausted: count < limit,
        })
    }
}
