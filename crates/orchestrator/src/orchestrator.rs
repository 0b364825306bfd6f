//! The phase driver: ingest, then transform, then build+publish, then
//! export and cleanup. Workers within a phase tolerate individual failures;
//! the orchestrator keeps going and reports what happened rather than
//! aborting the whole run.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;

use agg_artifact_store::ArtifactStore;
use agg_blob_store::BlobStore;
use agg_config::{RootConfig, SelectorConfig, SourceConfig};
use agg_connectors::{Destination, Publisher, SourceConnector};
use agg_formats::FormatRegistry;
use agg_pipeline::{ingest_source, process_pending, publish_build_artifact, run_build, RawBlobFetcher};
use agg_state::StateRepo;

use crate::error::OrchestratorError;
use crate::export::export_dev_outputs;

const BUNDLE_FORMATS: &[&str] = &[
    "ovpn", "npv4", "ehi", "hc", "hat", "sip", "nm", "dark", "opaque_bundle",
];
const ARCHIVE_RETENTION_DAYS: u64 = 4;

/// Mirrors the fetch-window knobs a real Telegram connector would consult
/// (message/file freshness on first run vs. subsequent runs). Concrete
/// connectors are out of scope here, so this struct is plumbed through for
/// parity with a production deployment and logged at run start.
#[derive(Debug, Clone)]
pub struct FetchWindows {
    pub msg_fresh_hours: u64,
    pub file_fresh_hours: u64,
    pub msg_subsequent_hours: u64,
    pub file_subsequent_hours: u64,
}

impl Default for FetchWindows {
    fn default() -> Self {
        Self {
            msg_fresh_hours: 2,
            file_fresh_hours: 48,
            msg_subsequent_hours: 0,
            file_subsequent_hours: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub sources_ok: u64,
    pub sources_err: u64,
    pub transform_processed: u64,
    pub transform_failed: u64,
    pub transform_ignored: u64,
    pub total_artifacts: usize,
    pub publish_attempts: u64,
    pub publish_failures: u64,
    pub failed_routes: Vec<String>,
    pub dev_outputs_written: usize,
    pub pruned_blobs: usize,
    pub pruned_archive: usize,
    pub duration_seconds: f64,
}

pub struct Orchestrator {
    config: RootConfig,
    max_workers: usize,
    fetch_windows: FetchWindows,
    raw_store: Arc<BlobStore>,
    artifact_store: Arc<ArtifactStore>,
    repo: Arc<StateRepo>,
    registry: Arc<FormatRegistry>,
    connectors: HashMap<String, Arc<dyn SourceConnector>>,
    publisher: Arc<dyn Publisher>,
    dev_output_dir: PathBuf,
    seen_channels: Arc<AsyncMutex<HashSet<String>>>,
}

impl Orchestrator {
    /// `connectors` holds one constructed connector per configured source
    /// id; a source without a matching entry is skipped with a warning,
    /// mirroring how the reference implementation treats an unsupported or
    /// misconfigured source type.
    pub fn new(
        config: RootConfig,
        data_dir: impl Into<PathBuf>,
        db_path: impl Into<PathBuf>,
        connectors: HashMap<String, Arc<dyn SourceConnector>>,
        publisher: Arc<dyn Publisher>,
        max_workers: usize,
        fetch_windows: FetchWindows,
    ) -> Result<Self, OrchestratorError> {
        let data_dir = data_dir.into();
        let raw_store = Arc::new(BlobStore::new(data_dir.join("raw"))?);
        let artifact_store = Arc::new(ArtifactStore::new(data_dir.join("artifacts"))?);
        let repo = Arc::new(StateRepo::open(db_path.into())?);
        let registry = Arc::new(FormatRegistry::with_builtin_handlers());
        let dev_output_dir = data_dir.join("outputs_dev");

        tracing::info!(
            sources = config.sources.len(),
            routes = config.publishing.routes.len(),
            max_workers,
            "orchestrator ready"
        );

        Ok(Self {
            config,
            max_workers,
            fetch_windows,
            raw_store,
            artifact_store,
            repo,
            registry,
            connectors,
            publisher,
            dev_output_dir,
            seen_channels: Arc::new(AsyncMutex::new(HashSet::new())),
        })
    }

    fn selectors(&self) -> HashMap<String, SelectorConfig> {
        self.config
            .sources
            .iter()
            .map(|s| (s.id.clone(), s.selector.clone()))
            .collect()
    }

    pub async fn run(&self, timeout: Option<Duration>) -> RunReport {
        let start = Instant::now();
        let deadline = timeout.map(|d| start + d);
        let mut report = RunReport::default();

        tracing::info!(
            fetch_windows = ?self.fetch_windows,
            timeout = ?timeout,
            "run starting"
        );

        let seen_file_cutoff_id = self.repo.max_seen_file_id().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "could not read seen_files max id, defaulting to 0");
            0
        });

        // ── Phase 1: Ingest ──────────────────────────────────────────
        let (ok, err) = self.run_ingest_phase(deadline).await;
        report.sources_ok = ok;
        report.sources_err = err;
        tracing::info!(ok, err, "phase 1 ingest done");

        // ── Phase 2: Transform ───────────────────────────────────────
        if deadline.map(|d| Instant::now() < d).unwrap_or(true) {
            match process_pending(
                &self.repo,
                Arc::clone(&self.raw_store),
                Arc::clone(&self.registry),
                Arc::new(self.selectors()),
                Some(self.max_workers.max(1)),
            )
            .await
            {
                Ok(stats) => {
                    report.transform_processed = stats.processed;
                    report.transform_failed = stats.failed;
                    report.transform_ignored = stats.ignored;
                }
                Err(e) => tracing::error!(error = %e, "transform phase failed"),
            }
        } else {
            tracing::warn!("phase 2 skipped, already past deadline");
        }

        // ── Phase 3: Build + Publish ─────────────────────────────────
        let mut all_output_names = Vec::new();
        let mut route_prefixes = Vec::new();
        let mut publish_set: JoinSet<(String, String, Result<bool, agg_pipeline::PipelineError>)> = JoinSet::new();

        for route in &self.config.publishing.routes {
            route_prefixes.push(route.name.clone());
            let repo = Arc::clone(&self.repo);
            let artifact_store = Arc::clone(&self.artifact_store);
            let registry = Arc::clone(&self.registry);
            let raw_store = Arc::clone(&self.raw_store);
            let route_name = route.name.clone();
            let formats = route.formats.clone();
            let source_ids = route.from_sources.clone();

            let build_result = tokio::task::spawn_blocking(move || {
                let fetcher = RawBlobFetcher(&raw_store);
                run_build(
                    &route_name,
                    &formats,
                    &source_ids,
                    Some(seen_file_cutoff_id),
                    &repo,
                    &artifact_store,
                    &registry,
                    &fetcher,
                )
            })
            .await;

            let artifacts = match build_result {
                Ok(Ok(artifacts)) => artifacts,
                Ok(Err(e)) => {
                    tracing::error!(route = %route.name, error = %e, "build failed");
                    report.failed_routes.push(route.name.clone());
                    continue;
                }
                Err(e) => {
                    tracing::error!(route = %route.name, error = %e, "build task panicked");
                    report.failed_routes.push(route.name.clone());
                    continue;
                }
            };
            if artifacts.is_empty() {
                tracing::info!(route = %route.name, "no artifacts produced");
                continue;
            }

            report.total_artifacts += artifacts.len();
            all_output_names.extend(artifacts.iter().map(|a| a.output_name.clone()));

            let destinations: Vec<Destination> = route
                .destinations
                .iter()
                .map(|d| Destination {
                    chat_id: d.chat_id.clone(),
                    mode: d.mode.clone(),
                    caption_template: d.caption_template.clone(),
                    token: d.token.clone(),
                })
                .collect();

            for artifact in artifacts {
                let repo = Arc::clone(&self.repo);
                let publisher = Arc::clone(&self.publisher);
                let destinations = destinations.clone();
                let route_name = route.name.clone();
                let unique_id = artifact.unique_id.clone();
                publish_set.spawn(async move {
                    let result = publish_build_artifact(&artifact, &destinations, publisher.as_ref(), &repo).await;
                    (route_name, unique_id, result)
                });
            }
        }

        while let Some(joined) = publish_set.join_next().await {
            report.publish_attempts += 1;
            match joined {
                Ok((route_name, unique_id, Ok(_))) => {
                    tracing::debug!(route = %route_name, artifact = %unique_id, "publish ok");
                }
                Ok((route_name, unique_id, Err(e))) => {
                    report.publish_failures += 1;
                    report.failed_routes.push(route_name.clone());
                    tracing::error!(route = %route_name, artifact = %unique_id, error = %e, "publish failed");
                }
                Err(e) => {
                    report.publish_failures += 1;
                    tracing::error!(error = %e, "publish task panicked");
                }
            }
        }

        // ── Phase 3b: Export ─────────────────────────────────────────
        match self.artifact_store.cleanup_stale_outputs(&route_prefixes, &all_output_names) {
            Ok(removed) => {
                if removed > 0 {
                    tracing::info!(removed, "cleaned stale output(s)");
                }
            }
            Err(e) => tracing::error!(error = %e, "output cleanup failed"),
        }

        let source_ids: Vec<String> = self.config.sources.iter().map(|s| s.id.clone()).collect();
        match export_dev_outputs(&self.dev_output_dir, &self.repo, &source_ids) {
            Ok(written) => report.dev_outputs_written = written,
            Err(e) => tracing::error!(error = %e, "dev export failed"),
        }

        // ── Phase 4: Cleanup ─────────────────────────────────────────
        match self.repo.get_processed_hashes(&BUNDLE_FORMATS.iter().map(|s| s.to_string()).collect::<Vec<_>>()) {
            Ok(prunable) => match self.raw_store.prune(prunable) {
                Ok(n) => report.pruned_blobs = n,
                Err(e) => tracing::error!(error = %e, "raw blob pruning failed"),
            },
            Err(e) => tracing::error!(error = %e, "could not compute prunable blobs"),
        }
        match self.artifact_store.prune_archive(ARCHIVE_RETENTION_DAYS) {
            Ok(n) => report.pruned_archive = n,
            Err(e) => tracing::error!(error = %e, "archive pruning failed"),
        }

        report.duration_seconds = start.elapsed().as_secs_f64();
        tracing::info!(
            duration = report.duration_seconds,
            sources_ok = report.sources_ok,
            sources_err = report.sources_err,
            artifacts = report.total_artifacts,
            publish_failures = report.publish_failures,
            "run complete"
        );
        report
    }

    async fn run_ingest_phase(&self, deadline: Option<Instant>) -> (u64, u64) {
        let effective_workers = self.max_workers.max(1).min(self.config.sources.len().max(1));
        let queue: Arc<AsyncMutex<VecDeque<SourceConfig>>> =
            Arc::new(AsyncMutex::new(self.config.sources.iter().cloned().collect()));

        let mut set = JoinSet::new();
        for _ in 0..effective_workers {
            let queue = Arc::clone(&queue);
            let connectors = self.connectors.clone();
            let repo = Arc::clone(&self.repo);
            let raw_store = Arc::clone(&self.raw_store);
            let seen_channels = Arc::clone(&self.seen_channels);
            set.spawn(worker_loop(queue, connectors, repo, raw_store, seen_channels, deadline));
        }

        let mut ok = 0u64;
        let mut err = 0u64;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((o, e)) => {
                    ok += o;
                    err += e;
                }
                Err(e) => {
                    tracing::error!(error = %e, "ingest worker panicked");
                    err += 1;
                }
            }
        }
        (ok, err)
    }
}

/// Pulls sources off the shared queue until it is empty. `resolve_channel_id`
/// lets `telegram_user`-style connectors advertise a canonical channel
/// identity; if another worker already claimed it this run, this source is
/// treated as successfully done (not an error, just a duplicate) and
/// skipped without touching the ingestion pipeline.
async fn worker_loop(
    queue: Arc<AsyncMutex<VecDeque<SourceConfig>>>,
    connectors: HashMap<String, Arc<dyn SourceConnector>>,
    repo: Arc<StateRepo>,
    raw_store: Arc<BlobStore>,
    seen_channels: Arc<AsyncMutex<HashSet<String>>>,
    deadline: Option<Instant>,
) -> (u64, u64) {
    let mut ok = 0u64;
    let mut err = 0u64;
    loop {
        if let Some(deadline) = deadline {
            if Instant::now() > deadline {
                tracing::warn!("ingest worker stopping, deadline exceeded");
                break;
            }
        }
        let source = {
            let mut q = queue.lock().await;
            q.pop_front()
        };
        let Some(source) = source else {
            break;
        };

        let Some(connector) = connectors.get(&source.id).cloned() else {
            tracing::warn!(source_id = %source.id, "skipping source: no connector configured");
            err += 1;
            continue;
        };

        if let Some(channel_id) = connector.resolve_channel_id() {
            let mut seen = seen_channels.lock().await;
            if !seen.insert(channel_id.clone()) {
                tracing::warn!(
                    source_id = %source.id,
                    channel_id,
                    "skipping source: channel already ingested by another source this run"
                );
                drop(seen);
                connector.cleanup().await;
                ok += 1;
                continue;
            }
        }

        let source_type = match source.source_type {
            agg_config::SourceType::Telegram => "telegram",
            agg_config::SourceType::TelegramUser => "telegram_user",
        };

        let result = ingest_source(&source.id, source_type, connector.as_ref(), &repo, &raw_store, deadline).await;
        connector.cleanup().await;

        match result {
            Ok(stats) => {
                tracing::info!(source_id = %source.id, files = stats.files_ingested, "source ingested");
                ok += 1;
            }
            Err(e) => {
                tracing::error!(source_id = %source.id, error = %e, "ingest failed");
                err += 1;
            }
        }
    }
    (ok, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agg_config::{DestinationConfig, PublishingConfig, RouteConfig, SelectorConfig, SourceType};
    use agg_connectors::{InMemoryConnector, Item, RecordingPublisher};

    fn config_with_one_route() -> RootConfig {
        RootConfig {
            sources: vec![SourceConfig {
                id: "chan1".into(),
                source_type: SourceType::Telegram,
                telegram: None,
                telegram_user: None,
                selector: SelectorConfig {
                    include_formats: vec!["all".into()],
                },
            }],
            publishing: PublishingConfig {
                routes: vec![RouteConfig {
                    name: "main".into(),
                    from_sources: vec!["chan1".into()],
                    formats: vec!["npvt".into()],
                    destinations: vec![DestinationConfig {
                        chat_id: "999".into(),
                        mode: "document".into(),
                        caption_template: "{format} x{count}".into(),
                        token: None,
                    }],
                }],
            },
        }
    }

    #[tokio::test]
    async fn full_run_ingests_transforms_builds_and_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_one_route();

        let mut connectors: HashMap<String, Arc<dyn SourceConnector>> = HashMap::new();
        connectors.insert(
            "chan1".into(),
            Arc::new(InMemoryConnector::new(vec![Item {
                external_id: "m1".into(),
                data: b"vless://user@host:443#ignored\ntrojan://user@host2:443#ignored2\n".to_vec(),
                filename: Some("dump.txt".into()),
                is_text: true,
            }])),
        );
        let publisher = Arc::new(RecordingPublisher::new());

        let orchestrator = Orchestrator::new(
            config,
            dir.path().join("data"),
            dir.path().join("state.db"),
            connectors,
            publisher.clone(),
            2,
            FetchWindows::default(),
        )
        .unwrap();

        let report = orchestrator.run(None).await;
        assert_eq!(report.sources_ok, 1);
        assert_eq!(report.sources_err, 0);
        assert_eq!(report.transform_processed, 1);
        assert!(report.total_artifacts >= 3, "expected base+decoded+b64sub artifacts");
        assert_eq!(report.publish_failures, 0);
        assert!(!publisher.calls().is_empty());
    }

    #[tokio::test]
    async fn missing_connector_counts_as_ingest_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_one_route();
        let connectors: HashMap<String, Arc<dyn SourceConnector>> = HashMap::new();
        let publisher = Arc::new(RecordingPublisher::new());

        let orchestrator = Orchestrator::new(
            config,
            dir.path().join("data"),
            dir.path().join("state.db"),
            connectors,
            publisher,
            1,
            FetchWindows::default(),
        )
        .unwrap();

        let report = orchestrator.run(None).await;
        assert_eq!(report.sources_ok, 0);
        assert_eq!(report.sources_err, 1);
        assert_eq!(report.total_artifacts, 0);
    }
}
