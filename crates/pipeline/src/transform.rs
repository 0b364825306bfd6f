//! Routes each pending seen-file to a handler, parses it into records, and
//! persists in batches. A parse failure taints only its own file; the batch
//! proceeds regardless.

use std::collections::HashMap;
use std::sync::Arc;

use agg_blob_store::BlobStore;
use agg_config::SelectorConfig;
use agg_formats::{decide_format, FormatRegistry, NoBlobs, ParseMeta};
use agg_state::{NewRecord, SeenFileRow, StateRepo};
use futures::stream::{self, StreamExt};

use crate::error::PipelineError;

const BATCH_SIZE: usize = 200;
const DEFAULT_MAX_WORKERS: usize = 4;

#[derive(Debug, Clone, Default)]
pub struct TransformStats {
    pub processed: u64,
    pub failed: u64,
    pub ignored: u64,
    pub format_counts: HashMap<String, u64>,
}

struct Outcome {
    raw_hash: String,
    status: &'static str,
    error_msg: Option<String>,
    format_id: Option<String>,
    records: Vec<NewRecord>,
}

fn process_one(
    row: &SeenFileRow,
    raw_store: &BlobStore,
    registry: &FormatRegistry,
    selectors: &HashMap<String, SelectorConfig>,
) -> Outcome {
    let bytes = match raw_store.get(&row.raw_hash) {
        Ok(bytes) => bytes,
        Err(_) => {
            return Outcome {
                raw_hash: row.raw_hash.clone(),
                status: "failed",
                error_msg: Some("raw data missing".to_string()),
                format_id: None,
                records: Vec::new(),
            }
        }
    };

    let format_id = decide_format(row.filename.as_deref(), &bytes).to_string();

    if let Some(selector) = selectors.get(&row.source_id) {
        if !selector.allows(&format_id) {
            return Outcome {
                raw_hash: row.raw_hash.clone(),
                status: "ignored",
                error_msg: Some(format!("format {format_id} not allowed for source")),
                format_id: Some(format_id),
                records: Vec::new(),
            };
        }
    }

    let Some(handler) = registry.get(&format_id) else {
        return Outcome {
            raw_hash: row.raw_hash.clone(),
            status: "failed",
            error_msg: Some(format!("no handler for format {format_id}")),
            format_id: Some(format_id),
            records: Vec::new(),
        };
    };

    let meta = ParseMeta {
        filename: row.filename.clone(),
        source_id: row.source_id.clone(),
    };
    match handler.parse(&bytes, &meta) {
        Ok(parsed) => {
            let records = parsed
                .into_iter()
                .map(|p| NewRecord {
                    source_file_hash: row.raw_hash.clone(),
                    record_type: format_id.clone(),
                    unique_hash: p.unique_hash,
                    data: p.data,
                })
                .collect();
            Outcome {
                raw_hash: row.raw_hash.clone(),
                status: "processed",
                error_msg: None,
                format_id: Some(format_id),
                records,
            }
        }
        Err(e) => Outcome {
            raw_hash: row.raw_hash.clone(),
            status: "failed",
            error_msg: Some(e.to_string()),
            format_id: Some(format_id),
            records: Vec::new(),
        },
    }
}

pub async fn process_pending(
    repo: &StateRepo,
    raw_store: Arc<BlobStore>,
    registry: Arc<FormatRegistry>,
    selectors: Arc<HashMap<String, SelectorConfig>>,
    max_workers: Option<usize>,
) -> Result<TransformStats, PipelineError> {
    let max_workers = max_workers.unwrap_or(DEFAULT_MAX_WORKERS);
    let pending = repo.get_pending_files()?;
    let mut stats = TransformStats::default();

    for chunk in pending.chunks(BATCH_SIZE) {
        let chunk = chunk.to_vec();
        let outcomes: Vec<Outcome> = stream::iter(chunk.into_iter())
            .map(|row| {
                let raw_store = Arc::clone(&raw_store);
                let registry = Arc::clone(&registry);
                let selectors = Arc::clone(&selectors);
                tokio::task::spawn_blocking(move || process_one(&row, &raw_store, &registry, &selectors))
            })
            .buffer_unordered(max_workers)
            .filter_map(|joined| async move { joined.ok() })
            .collect()
            .await;

        let mut new_records = Vec::new();
        let mut status_updates = Vec::new();
        for outcome in outcomes {
            match outcome.status {
                "processed" => {
                    stats.processed += 1;
                    if let Some(fmt) = &outcome.format_id {
                        *stats.format_counts.entry(fmt.clone()).or_insert(0) += 1;
                    }
                }
                "ignored" => stats.ignored += 1,
                _ => stats.failed += 1,
            }
            new_records.extend(outcome.records);
            status_updates.push((outcome.raw_hash, outcome.status.to_string(), outcome.error_msg));
        }

        repo.add_records_batch(&new_records)?;
        repo.update_file_status_batch(&status_updates)?;
    }

    tracing::info!(
        processed = stats.processed,
        failed = stats.failed,
        ignored = stats.ignored,
        "transform pass complete"
    );

    Ok(stats)
}

#[allow(dead_code)]
fn unused_no_blobs_reference() -> NoBlobs {
    NoBlobs
}

#[cfg(test)]
mod tests {
    use super::*;
    use agg_state::NewSeenFile;
    use std::collections::HashMap as Map;

    #[tokio::test]
    async fn transform_parses_pending_npvt_file() {
        let dir = tempfile::tempdir().unwrap();
        let repo = StateRepo::open_in_memory().unwrap();
        let raw_store = Arc::new(BlobStore::new(dir.path()).unwrap());
        let registry = Arc::new(FormatRegistry::with_builtin_handlers());
        let selectors = Arc::new(Map::new());

        let hash = raw_store.save(b"vless://u@h:443#A\n").unwrap();
        repo.record_files_batch(&[NewSeenFile {
            source_id: "s1".into(),
            external_id: "e1".into(),
            raw_hash: hash,
            file_size: 10,
            filename: Some("dump.txt".into()),
            metadata: None,
        }])
        .unwrap();

        let stats = process_pending(&repo, raw_store, registry, selectors, Some(2))
            .await
            .unwrap();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(repo.get_pending_files().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn transform_marks_missing_blob_as_failed() {
        let dir = tempfile::tempdir().unwrap();
        let repo = StateRepo::open_in_memory().unwrap();
        let raw_store = Arc::new(BlobStore::new(dir.path()).unwrap());
        let registry = Arc::new(FormatRegistry::with_builtin_handlers());
        let selectors = Arc::new(Map::new());

        repo.record_files_batch(&[NewSeenFile {
            source_id: "s1".into(),
            external_id: "e1".into(),
            raw_hash: "never-saved".into(),
            file_size: 0,
            filename: None,
            metadata: None,
        }])
        .unwrap();

        let stats = process_pending(&repo, raw_store, registry, selectors, Some(2))
            .await
            .unwrap();
        assert_eq!(stats.failed, 1);
    }
}
