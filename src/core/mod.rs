pub mod asset;
pub mod descriptor;
pub mod duplicate;
pub mod extractor;
pub mod fetcher;
pub mod results;
pub mod scanner;
pub mod thumbnail;

pub use asset::{Asset, AssetId, AssetSource, MediaKind, SourceError, Thumbnail};
pub use descriptor::{DescriptorCache, DistanceMetric, FeatureDescriptor, FeatureVector};
pub use duplicate::{ClusterBuilder, ClusterConfig, ClusterKind, DuplicateCluster};
pub use extractor::{ExtractionError, FeatureExtractor, FeatureExtractorAdapter};
pub use fetcher::{AssetBatch, AssetFetcher};
pub use results::{CacheConfig, ClusterPage, ResultCache};
pub use scanner::{
    ProgressCallback, ScanConfig, ScanCoordinator, ScanError, ScanMode, ScanOutcome, ScanState,
    ScanStatus,
};
pub use thumbnail::{ThumbnailError, ThumbnailService};
