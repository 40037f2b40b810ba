// Near-duplicate grouping over one scanned batch.
//
// Greedy, keyed off the representative: every member is compared against
// the representative only, never against other members.

use crate::core::asset::{Asset, AssetId};
use crate::core::descriptor::{DistanceMetric, FeatureDescriptor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Members stop being collected once this many exact matches are found.
const CONFIDENT_EXACT_MEMBERS: usize = 3;

#[derive(Debug, Error)]
#[error("Clustering cancelled")]
pub struct ClusteringCancelled;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterKind {
    Exact,
    Similar,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateCluster {
    pub id: String,
    pub representative_asset_id: AssetId,
    /// Representative first, then members in recency order.
    pub member_asset_ids: Vec<AssetId>,
    /// Distance of each member to the representative (0 for itself).
    pub distances: HashMap<AssetId, f32>,
    pub kind: ClusterKind,
    pub representative_date: Option<DateTime<Utc>>,
}

impl DuplicateCluster {
    pub fn len(&self) -> usize {
        self.member_asset_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.member_asset_ids.is_empty()
    }

    pub fn contains(&self, asset_id: &str) -> bool {
        self.member_asset_ids.iter().any(|id| id == asset_id)
    }

    /// True when no member is left outside `excluded`.
    pub fn is_fully_excluded(&self, excluded: &HashSet<AssetId>) -> bool {
        self.member_asset_ids.iter().all(|id| excluded.contains(id))
    }

    /// Everything except the representative.
    pub fn duplicates(&self) -> impl Iterator<Item = &AssetId> {
        self.member_asset_ids.iter().skip(1)
    }
}

/// Thresholds are calibrated per feature space; they do not carry over
/// between extractors or metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub exact_threshold: f32,
    pub similar_threshold: f32,
    pub max_group_size: usize,
    pub max_clusters: usize,
    pub metric: DistanceMetric,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            exact_threshold: 0.10,
            similar_threshold: 0.40,
            max_group_size: 8,
            max_clusters: 100,
            metric: DistanceMetric::Euclidean,
        }
    }
}

pub struct ClusterBuilder {
    config: ClusterConfig,
}

impl ClusterBuilder {
    pub fn new(config: ClusterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Group `assets` (newest first) into disjoint clusters.
    ///
    /// Assets without a descriptor are skipped. `on_progress` receives
    /// `(outer index, asset count)` as the scan advances.
    pub fn build(
        &self,
        assets: &[Asset],
        descriptors: &HashMap<AssetId, Arc<FeatureDescriptor>>,
        cancel: &CancellationToken,
        mut on_progress: impl FnMut(usize, usize),
    ) -> Result<Vec<DuplicateCluster>, ClusteringCancelled> {
        let config = &self.config;
        let member_cap = config.max_group_size.max(2) - 1;
        let total = assets.len();

        let mut consumed: HashSet<&str> = HashSet::new();
        let mut clusters = Vec::new();

        for (i, representative) in assets.iter().enumerate() {
            on_progress(i, total);

            if consumed.contains(representative.id.as_str()) {
                continue;
            }
            let Some(anchor) = descriptors.get(&representative.id) else {
                continue;
            };

            let mut members: Vec<(&Asset, f32)> = Vec::new();
            for candidate in &assets[i + 1..] {
                if cancel.is_cancelled() {
                    return Err(ClusteringCancelled);
                }
                if consumed.contains(candidate.id.as_str()) {
                    continue;
                }
                let Some(descriptor) = descriptors.get(&candidate.id) else {
                    continue;
                };

                let distance = anchor.vector.distance(&descriptor.vector, config.metric);
                if distance > config.similar_threshold {
                    continue;
                }

                members.push((candidate, distance));
                if distance <= config.exact_threshold && members.len() >= CONFIDENT_EXACT_MEMBERS {
                    break;
                }
                if members.len() >= member_cap {
                    break;
                }
            }

            if members.is_empty() {
                continue;
            }

            let kind = if members
                .iter()
                .any(|(_, distance)| *distance <= config.exact_threshold)
            {
                ClusterKind::Exact
            } else {
                ClusterKind::Similar
            };

            let mut member_asset_ids = Vec::with_capacity(members.len() + 1);
            let mut distances = HashMap::with_capacity(members.len() + 1);
            member_asset_ids.push(representative.id.clone());
            distances.insert(representative.id.clone(), 0.0);
            consumed.insert(representative.id.as_str());
            for (member, distance) in members {
                member_asset_ids.push(member.id.clone());
                distances.insert(member.id.clone(), distance);
                consumed.insert(member.id.as_str());
            }

            clusters.push(DuplicateCluster {
                id: format!("grp_{}", Uuid::new_v4().simple()),
                representative_asset_id: representative.id.clone(),
                member_asset_ids,
                distances,
                kind,
                representative_date: representative.creation_date,
            });

            if clusters.len() >= config.max_clusters {
                log::debug!("Reached cluster limit of {}", config.max_clusters);
                break;
            }
        }

        on_progress(total, total);
        Ok(clusters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::descriptor::FeatureVector;
    use chrono::{Duration, TimeZone};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn assets(count: usize) -> Vec<Asset> {
        let base = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        (0..count)
            .map(|i| Asset::image(format!("a{}", i), Some(base - Duration::minutes(i as i64))))
            .collect()
    }

    fn descriptors(
        assets: &[Asset],
        vectors: &[Vec<f32>],
    ) -> HashMap<AssetId, Arc<FeatureDescriptor>> {
        assets
            .iter()
            .zip(vectors)
            .map(|(asset, values)| {
                (
                    asset.id.clone(),
                    Arc::new(FeatureDescriptor::new(
                        asset.id.clone(),
                        FeatureVector::new(values.clone()),
                    )),
                )
            })
            .collect()
    }

    fn config(exact: f32, similar: f32) -> ClusterConfig {
        ClusterConfig {
            exact_threshold: exact,
            similar_threshold: similar,
            ..ClusterConfig::default()
        }
    }

    fn build(
        config: ClusterConfig,
        assets: &[Asset],
        descriptors: &HashMap<AssetId, Arc<FeatureDescriptor>>,
    ) -> Vec<DuplicateCluster> {
        ClusterBuilder::new(config)
            .build(assets, descriptors, &CancellationToken::new(), |_, _| {})
            .unwrap()
    }

    #[test]
    fn test_basic_pair_is_exact() {
        let assets = assets(2);
        let descriptors = descriptors(&assets, &[vec![0.0], vec![0.05]]);

        let clusters = build(config(0.5, 0.9), &assets, &descriptors);

        assert_eq!(clusters.len(), 1);
        let cluster = &clusters[0];
        assert_eq!(cluster.kind, ClusterKind::Exact);
        assert_eq!(cluster.member_asset_ids, vec!["a0", "a1"]);
        assert_eq!(cluster.representative_asset_id, "a0");
        assert_eq!(cluster.distances["a0"], 0.0);
        assert!((cluster.distances["a1"] - 0.05).abs() < 1e-6);
        assert_eq!(cluster.representative_date, assets[0].creation_date);
        assert!(cluster.id.starts_with("grp_"));
    }

    #[test]
    fn test_chain_beyond_threshold_stops_at_representative() {
        // A-B = 0.4, B-C = 0.95, A-C = 1.0
        let assets = assets(3);
        let descriptors = descriptors(
            &assets,
            &[vec![0.0, 0.0], vec![0.12875, 0.378_713], vec![1.0, 0.0]],
        );

        let clusters = build(config(0.5, 0.9), &assets, &descriptors);

        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].member_asset_ids, vec!["a0", "a1"]);
        assert!(!clusters.iter().any(|c| c.contains("a2")));
    }

    #[test]
    fn test_similar_kind_when_no_member_is_exact() {
        let assets = assets(2);
        let descriptors = descriptors(&assets, &[vec![0.0], vec![0.7]]);

        let clusters = build(config(0.5, 0.9), &assets, &descriptors);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].kind, ClusterKind::Similar);
    }

    #[test]
    fn test_confident_exact_early_exit() {
        let assets = assets(6);
        let descriptors = descriptors(&assets, &vec![vec![1.0, 1.0]; 6]);

        let clusters = build(config(0.5, 0.9), &assets, &descriptors);

        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].member_asset_ids, vec!["a0", "a1", "a2", "a3"]);
        assert_eq!(clusters[1].member_asset_ids, vec!["a4", "a5"]);
    }

    #[test]
    fn test_group_size_cap() {
        // Everything sits 0.3 from a0, above the exact threshold.
        let assets = assets(13);
        let mut vectors = vec![vec![0.0, 0.0]];
        for k in 0..12 {
            let angle = k as f32 * 0.1;
            vectors.push(vec![0.3 * angle.cos(), 0.3 * angle.sin()]);
        }
        let descriptors = descriptors(&assets, &vectors);

        let clusters = build(config(0.1, 0.9), &assets, &descriptors);

        assert_eq!(clusters[0].len(), 8);
        assert_eq!(clusters[0].kind, ClusterKind::Similar);
        assert!(clusters.iter().all(|c| c.len() >= 2 && c.len() <= 8));
    }

    #[test]
    fn test_max_clusters_stops_early() {
        let assets = assets(20);
        let vectors: Vec<Vec<f32>> = (0..20).map(|i| vec![(i / 2) as f32 * 10.0]).collect();
        let descriptors = descriptors(&assets, &vectors);

        let clusters = build(
            ClusterConfig {
                max_clusters: 3,
                ..config(0.5, 0.9)
            },
            &assets,
            &descriptors,
        );

        assert_eq!(clusters.len(), 3);
        assert_eq!(clusters[2].member_asset_ids, vec!["a4", "a5"]);
    }

    #[test]
    fn test_assets_without_descriptor_are_skipped() {
        let assets = assets(3);
        let mut descriptors = descriptors(&assets, &vec![vec![0.0]; 3]);
        descriptors.remove("a1");

        let clusters = build(config(0.5, 0.9), &assets, &descriptors);

        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].member_asset_ids, vec!["a0", "a2"]);
    }

    #[test]
    fn test_cancellation() {
        let assets = assets(4);
        let descriptors = descriptors(&assets, &vec![vec![0.0]; 4]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = ClusterBuilder::new(config(0.5, 0.9)).build(&assets, &descriptors, &cancel, |_, _| {});
        assert!(result.is_err());
    }

    #[test]
    fn test_invariants_on_random_library() {
        let mut rng = StdRng::seed_from_u64(42);
        let assets = assets(200);
        let vectors: Vec<Vec<f32>> = (0..200)
            .map(|i| {
                // Twenty loose blobs, members jittered around each centre.
                let centre = (i % 20) as f32;
                vec![centre + rng.random::<f32>() * 0.6, rng.random::<f32>() * 0.6]
            })
            .collect();
        let descriptors = descriptors(&assets, &vectors);
        let config = ClusterConfig {
            exact_threshold: 0.1,
            similar_threshold: 0.5,
            max_group_size: 5,
            max_clusters: 1000,
            metric: DistanceMetric::Euclidean,
        };

        let clusters = build(config.clone(), &assets, &descriptors);
        assert!(!clusters.is_empty());

        let mut seen = HashSet::new();
        for cluster in &clusters {
            assert!(cluster.len() > 1 && cluster.len() <= config.max_group_size);
            assert_eq!(cluster.member_asset_ids[0], cluster.representative_asset_id);

            let rep = &descriptors[&cluster.representative_asset_id];
            let mut any_exact = false;
            for member in cluster.duplicates() {
                let distance = rep
                    .vector
                    .distance(&descriptors[member].vector, config.metric);
                assert!(distance <= config.similar_threshold);
                assert!((cluster.distances[member] - distance).abs() < 1e-6);
                any_exact |= distance <= config.exact_threshold;
            }
            let expected = if any_exact {
                ClusterKind::Exact
            } else {
                ClusterKind::Similar
            };
            assert_eq!(cluster.kind, expected);

            for id in &cluster.member_asset_ids {
                assert!(seen.insert(id.clone()), "{} appears in two clusters", id);
            }
        }

        // Same input, same membership; only the ids change.
        let again = build(config, &assets, &descriptors);
        let members = |c: &[DuplicateCluster]| -> Vec<Vec<AssetId>> {
            c.iter().map(|c| c.member_asset_ids.clone()).collect()
        };
        assert_eq!(members(&clusters), members(&again));
        assert_ne!(clusters[0].id, again[0].id);
    }

    #[test]
    fn test_progress_reaches_total() {
        let assets = assets(5);
        let descriptors = descriptors(&assets, &vec![vec![0.0]; 5]);
        let mut last = (0, 0);

        ClusterBuilder::new(config(0.5, 0.9))
            .build(&assets, &descriptors, &CancellationToken::new(), |done, total| {
                last = (done, total);
            })
            .unwrap();

        assert_eq!(last, (5, 5));
    }
}
