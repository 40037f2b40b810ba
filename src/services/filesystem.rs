use crate::core::asset::{Asset, AssetId, AssetSource, MediaKind, SourceError, Thumbnail};
use crate::core::thumbnail::ThumbnailService;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use walkdir::WalkDir;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "tiff", "tif", "webp"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "m4v", "avi", "mkv"];

/// Media kind from the file extension, or `None` for files that are not media.
pub fn classify(path: &Path) -> Option<MediaKind> {
    let ext = path.extension()?.to_string_lossy().to_lowercase();
    if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaKind::Image)
    } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaKind::Video)
    } else {
        None
    }
}

#[derive(Debug)]
struct Listing {
    /// Newest first, ties broken by path.
    assets: Vec<Asset>,
    paths: HashMap<AssetId, PathBuf>,
}

impl Listing {
    fn build(root: &Path) -> Result<Self, SourceError> {
        std::fs::read_dir(root).map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::NotFound => {
                log::warn!("Cannot read library root {:?}: {}", root, e);
                SourceError::AccessDenied
            }
            _ => SourceError::Io(e),
        })?;

        let files: Vec<(PathBuf, MediaKind)> = WalkDir::new(root)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    log::warn!("Walk error under {:?}: {}", root, e);
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| classify(entry.path()).map(|kind| (entry.into_path(), kind)))
            .collect();

        let mut entries: Vec<(Asset, PathBuf)> = files
            .into_par_iter()
            .map(|(path, media_kind)| {
                let asset = Asset {
                    id: path.to_string_lossy().into_owned(),
                    creation_date: file_date(&path),
                    media_kind,
                };
                (asset, path)
            })
            .collect();

        entries.sort_by(|(a, a_path), (b, b_path)| {
            b.creation_date
                .cmp(&a.creation_date)
                .then_with(|| a_path.cmp(b_path))
        });

        log::info!("Indexed {} media files under {:?}", entries.len(), root);

        let paths = entries
            .iter()
            .map(|(asset, path)| (asset.id.clone(), path.clone()))
            .collect();
        let assets = entries.into_iter().map(|(asset, _)| asset).collect();
        Ok(Self { assets, paths })
    }
}

/// Creation time, falling back to modification time.
fn file_date(path: &Path) -> Option<DateTime<Utc>> {
    let metadata = std::fs::metadata(path).ok()?;
    metadata
        .created()
        .or_else(|_| metadata.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

/// A directory tree treated as a media library.
///
/// The tree is walked once, on first use, and the listing is kept until a
/// deletion so offsets stay stable between batches.
pub struct FilesystemAssetSource {
    root: PathBuf,
    listing: RwLock<Option<Arc<Listing>>>,
}

impl FilesystemAssetSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            listing: RwLock::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Forget the cached listing; the next fetch walks the tree again.
    pub async fn refresh(&self) {
        *self.listing.write().await = None;
    }

    async fn listing(&self) -> Result<Arc<Listing>, SourceError> {
        if let Some(listing) = self.listing.read().await.as_ref() {
            return Ok(listing.clone());
        }

        let mut slot = self.listing.write().await;
        if let Some(listing) = slot.as_ref() {
            return Ok(listing.clone());
        }

        let root = self.root.clone();
        let listing = tokio::task::spawn_blocking(move || Listing::build(&root))
            .await
            .map_err(|e| SourceError::Io(std::io::Error::other(e)))??;
        let listing = Arc::new(listing);
        *slot = Some(listing.clone());
        Ok(listing)
    }

    async fn path_of(&self, id: &str) -> Result<PathBuf, SourceError> {
        self.listing()
            .await?
            .paths
            .get(id)
            .cloned()
            .ok_or_else(|| SourceError::NotFound { id: id.to_string() })
    }
}

#[async_trait]
impl AssetSource for FilesystemAssetSource {
    async fn fetch(
        &self,
        offset: usize,
        limit: usize,
        kind: MediaKind,
    ) -> Result<Vec<Asset>, SourceError> {
        let listing = self.listing().await?;
        Ok(listing
            .assets
            .iter()
            .filter(|asset| asset.media_kind == kind)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn load_thumbnail(&self, asset: &Asset, max_side: u32) -> Result<Thumbnail, SourceError> {
        let path = self.path_of(&asset.id).await?;
        let service = ThumbnailService::with_size(max_side);

        tokio::task::spawn_blocking(move || service.load(&path))
            .await
            .map_err(|e| SourceError::Io(std::io::Error::other(e)))?
            .map_err(|e| {
                log::debug!("Failed to decode {}: {}", asset.id, e);
                SourceError::ImageDataUnavailable {
                    id: asset.id.clone(),
                }
            })
    }

    async fn delete(&self, ids: &HashSet<AssetId>) -> Result<(), SourceError> {
        let listing = self.listing().await?;
        let mut paths = Vec::with_capacity(ids.len());
        for id in ids {
            let path = listing
                .paths
                .get(id)
                .ok_or_else(|| SourceError::NotFound { id: id.clone() })?;
            paths.push(path.clone());
        }

        let failures: Vec<String> = paths
            .iter()
            .filter_map(|path| match std::fs::remove_file(path) {
                Ok(()) => {
                    log::debug!("Deleted {:?}", path);
                    None
                }
                Err(e) => Some(format!("{}: {}", path.display(), e)),
            })
            .collect();

        // Even a partial deletion changes the tree.
        self.refresh().await;

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SourceError::Deletion {
                message: format!(
                    "{} of {} files could not be deleted ({})",
                    failures.len(),
                    paths.len(),
                    failures.join("; ")
                ),
            })
        }
    }
}
