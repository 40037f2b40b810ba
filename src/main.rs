use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use nearcull::core::{ClusterKind, DuplicateCluster, ProgressCallback};
use nearcull::services::{DeletionRecord, HistoryLog};
use nearcull::{DuplicateFinder, FilesystemAssetSource, FinderConfig, LumaGridExtractor, PageRequest};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(name = "nearcull", version, about = "Find and cull near-duplicate photos")]
struct Cli {
    /// Config file (default: `<config dir>/nearcull/config.toml`)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Duplicate workflows
    Duplicates {
        #[command(subcommand)]
        command: Dups,
    },

    /// Work with deletion history
    History {
        #[command(subcommand)]
        command: HistoryCmd,
    },
}

#[derive(Args, Debug)]
struct ScanArgs {
    /// Directory to scan
    #[arg(short, long, value_name = "DIR")]
    path: PathBuf,
    /// Keep scanning batches until the whole library is covered
    #[arg(long)]
    all: bool,
    /// Images per scan batch
    #[arg(long)]
    batch_size: Option<usize>,
    /// Distance at or below which a match counts as exact
    #[arg(long)]
    exact: Option<f32>,
    /// Distance at or below which a match counts as similar
    #[arg(long)]
    similar: Option<f32>,
}

#[derive(Subcommand, Debug)]
enum Dups {
    /// Find and list near-duplicate clusters
    Scan {
        #[command(flatten)]
        scan: ScanArgs,
        /// Print clusters as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete everything but the representative of each cluster
    Delete {
        #[command(flatten)]
        scan: ScanArgs,
        /// Only delete from exact clusters
        #[arg(long)]
        exact_only: bool,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
enum HistoryCmd {
    /// List all deletion records
    List {
        /// Directory containing the photos
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Duplicates { command } => match command {
            Dups::Scan { scan, json } => {
                let config = load_config(cli.config.as_deref(), &scan)?;
                let finder = build_finder(&scan.path, config);
                let clusters = collect_clusters(&finder, &scan).await?;

                if json {
                    println!("{}", serde_json::to_string_pretty(&clusters)?);
                } else if clusters.is_empty() {
                    println!("No duplicates found.");
                } else {
                    println!("Found {} duplicate cluster(s):", clusters.len());
                    for (i, cluster) in clusters.iter().enumerate() {
                        print_cluster(i, cluster);
                    }
                }
            }

            Dups::Delete {
                scan,
                exact_only,
                yes,
            } => {
                let config = load_config(cli.config.as_deref(), &scan)?;
                let finder = build_finder(&scan.path, config);
                let clusters: Vec<DuplicateCluster> = collect_clusters(&finder, &scan)
                    .await?
                    .into_iter()
                    .filter(|c| !exact_only || c.kind == ClusterKind::Exact)
                    .collect();

                if clusters.is_empty() {
                    println!("No duplicates found.");
                    return Ok(());
                }

                let doomed: usize = clusters.iter().map(|c| c.len() - 1).sum();
                for (i, cluster) in clusters.iter().enumerate() {
                    print_cluster(i, cluster);
                }

                if !yes {
                    let confirmed = Confirm::new()
                        .with_prompt(format!(
                            "Delete {} file(s) from {} cluster(s)?",
                            doomed,
                            clusters.len()
                        ))
                        .default(false)
                        .interact()
                        .context("Failed to read confirmation")?;
                    if !confirmed {
                        println!("Nothing deleted.");
                        return Ok(());
                    }
                }

                let history = HistoryLog::in_dir(&scan.path);
                let mut deleted = 0;
                for cluster in &clusters {
                    let ids: HashSet<String> = cluster.duplicates().cloned().collect();
                    match finder.delete_assets(&ids).await {
                        Ok(_) => {
                            deleted += ids.len();
                            let record = DeletionRecord {
                                timestamp: Utc::now(),
                                cluster_id: cluster.id.clone(),
                                kind: cluster.kind,
                                retained: cluster.representative_asset_id.clone(),
                                deleted: cluster.duplicates().cloned().collect(),
                            };
                            history.append(&record).with_context(|| {
                                format!("Failed to record history in {:?}", history.path())
                            })?;
                        }
                        Err(e) => eprintln!("Failed to delete cluster {}: {}", cluster.id, e),
                    }
                }

                println!(
                    "Deleted {} file(s); history recorded in {}",
                    deleted,
                    history.path().display()
                );
            }
        },

        Commands::History { command } => match command {
            HistoryCmd::List { path } => {
                let history = HistoryLog::in_dir(&path);
                let records = history
                    .read()
                    .with_context(|| format!("Could not read history file {:?}", history.path()))?;

                if records.is_empty() {
                    println!("No deletion history in {}", path.display());
                }
                for (i, record) in records.iter().enumerate() {
                    println!(
                        "[{}] {} ({:?})\n     kept: {}\n     deleted: {:?}\n",
                        i,
                        record.timestamp.to_rfc3339(),
                        record.kind,
                        record.retained,
                        record.deleted
                    );
                }
            }
        },
    }

    Ok(())
}

/// Config file first, then command-line overrides.
fn load_config(explicit: Option<&Path>, scan: &ScanArgs) -> Result<FinderConfig> {
    let mut config = FinderConfig::load(explicit).context("Failed to load configuration")?;
    if let Some(batch_size) = scan.batch_size {
        config.scan.batch_size = batch_size;
    }
    if let Some(exact) = scan.exact {
        config.cluster.exact_threshold = exact;
    }
    if let Some(similar) = scan.similar {
        config.cluster.similar_threshold = similar;
    }
    config.validate().context("Invalid command-line overrides")?;
    Ok(config)
}

fn build_finder(root: &Path, config: FinderConfig) -> DuplicateFinder {
    DuplicateFinder::new(
        Arc::new(FilesystemAssetSource::new(root)),
        Arc::new(LumaGridExtractor::new()),
        config,
    )
}

/// Page through every cached cluster, continuing the scan batch by batch
/// when `--all` is set.
async fn collect_clusters(finder: &DuplicateFinder, scan: &ScanArgs) -> Result<Vec<DuplicateCluster>> {
    println!("▶ Scanning for near-duplicates in: {}", scan.path.display());
    let start = Instant::now();

    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}% {msg}")?
            .progress_chars("#>-"),
    );
    let sink = bar.clone();
    let batches = AtomicUsize::new(1);
    // Each scan batch reports from zero again; start the bar over for it.
    let callback: ProgressCallback<'_> = &move |fraction: f64| {
        let position = (fraction * 100.0).round() as u64;
        if position < sink.position() {
            let batch = batches.fetch_add(1, Ordering::Relaxed) + 1;
            sink.reset();
            sink.set_message(format!("batch {}", batch));
        }
        sink.set_position(position);
    };

    let mut clusters = Vec::new();
    let mut page = 0;
    loop {
        let request = PageRequest {
            page,
            allow_deep_scan: scan.all,
            ..PageRequest::default()
        };
        let result = finder
            .request_page(request, Some(callback))
            .await
            .with_context(|| format!("Scan of {} failed", scan.path.display()))?;
        clusters.extend(result.clusters);
        if !result.has_more {
            break;
        }
        page += 1;
    }

    let state = finder.scan_state().await;
    bar.finish_with_message(format!("{} images scanned", state.total_scanned));
    println!("⏱ Scan took {:.2?}", start.elapsed());
    if !state.exhausted {
        println!("Library not fully covered; rerun with --all to scan every batch.");
    }
    Ok(clusters)
}

fn print_cluster(index: usize, cluster: &DuplicateCluster) {
    let kind = match cluster.kind {
        ClusterKind::Exact => "exact",
        ClusterKind::Similar => "similar",
    };
    println!("\n✨ Cluster {} ({}):", index + 1, kind);
    println!("   🏆 Keeping → {}", cluster.representative_asset_id);
    for id in cluster.duplicates() {
        let distance = cluster.distances.get(id).copied().unwrap_or_default();
        println!("   ▶ {} (distance {:.3})", id, distance);
    }
}
