use crate::core::asset::AssetId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    #[default]
    Euclidean,
    /// `1 - cos(a, b)`, in `[0, 2]`.
    Cosine,
}

/// Fixed-dimension descriptor produced by a feature extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector(Vec<f32>);

impl FeatureVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn dimension(&self) -> usize {
        self.0.len()
    }

    /// Symmetric, non-negative distance. Vectors of different dimension are
    /// infinitely far apart.
    pub fn distance(&self, other: &FeatureVector, metric: DistanceMetric) -> f32 {
        if self.0.len() != other.0.len() {
            return f32::INFINITY;
        }

        match metric {
            DistanceMetric::Euclidean => self
                .0
                .iter()
                .zip(&other.0)
                .map(|(a, b)| (a - b) * (a - b))
                .sum::<f32>()
                .sqrt(),
            DistanceMetric::Cosine => {
                let mut dot = 0.0f32;
                let mut norm_a = 0.0f32;
                let mut norm_b = 0.0f32;
                for (a, b) in self.0.iter().zip(&other.0) {
                    dot += a * b;
                    norm_a += a * a;
                    norm_b += b * b;
                }
                if norm_a == 0.0 || norm_b == 0.0 {
                    // Two zero vectors are the same picture; zero vs non-zero is not.
                    return if norm_a == norm_b { 0.0 } else { 1.0 };
                }
                let cos = dot / (norm_a.sqrt() * norm_b.sqrt());
                (1.0 - cos.clamp(-1.0, 1.0)).max(0.0)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureDescriptor {
    pub asset_id: AssetId,
    pub vector: FeatureVector,
    pub computed_at: DateTime<Utc>,
}

impl FeatureDescriptor {
    pub fn new(asset_id: AssetId, vector: FeatureVector) -> Self {
        Self {
            asset_id,
            vector,
            computed_at: Utc::now(),
        }
    }
}

/// Memoized descriptors keyed by asset id, shared by all extraction workers.
#[derive(Debug, Default)]
pub struct DescriptorCache {
    entries: RwLock<HashMap<AssetId, Arc<FeatureDescriptor>>>,
}

impl DescriptorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, asset_id: &str) -> Option<Arc<FeatureDescriptor>> {
        self.entries.read().await.get(asset_id).cloned()
    }

    /// Store `descriptor`, replacing any previous one for the same asset.
    pub async fn insert(&self, descriptor: FeatureDescriptor) -> Arc<FeatureDescriptor> {
        let descriptor = Arc::new(descriptor);
        self.entries
            .write()
            .await
            .insert(descriptor.asset_id.clone(), descriptor.clone());
        descriptor
    }

    /// Store `descriptor` unless one is already cached; returns the live entry.
    pub async fn insert_if_absent(&self, descriptor: FeatureDescriptor) -> Arc<FeatureDescriptor> {
        let mut entries = self.entries.write().await;
        entries
            .entry(descriptor.asset_id.clone())
            .or_insert_with(|| Arc::new(descriptor))
            .clone()
    }

    pub async fn remove(&self, asset_id: &str) -> Option<Arc<FeatureDescriptor>> {
        self.entries.write().await.remove(asset_id)
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
