//! Drains one source's connector, deduplicates by `(source_id, external_id)`,
//! persists raw bytes and seen-file rows in batches, and updates the
//! source's cursor.

use std::time::Instant;

use agg_blob_store::BlobStore;
use agg_connectors::{Item, SourceConnector};
use agg_state::{NewSeenFile, StateRepo};
use futures::StreamExt;
use serde_json::{json, Value};

use crate::error::PipelineError;

const DEFAULT_BUFFER_SIZE: usize = 100;

/// Outcome of flushing one buffer's worth of items.
struct FlushOutcome {
    files_ingested: u64,
    bytes_ingested: u64,
    skipped: u64,
}

/// Checks which buffered items are new against a single batched query, then
/// hashes and stages only those; flushes the ingest buffer in one round
/// trip instead of a presence check per item.
fn flush_buffer(
    source_id: &str,
    buffer: &[Item],
    repo: &StateRepo,
    raw_store: &BlobStore,
) -> Result<FlushOutcome, PipelineError> {
    let external_ids: Vec<String> = buffer.iter().map(|item| item.external_id.clone()).collect();
    let seen = repo.get_seen_files_batch(source_id, &external_ids)?;

    let mut rows = Vec::new();
    let mut bytes_ingested = 0u64;
    let mut skipped = 0u64;
    for item in buffer {
        if seen.contains(&item.external_id) {
            skipped += 1;
            continue;
        }
        let raw_hash = raw_store.save(&item.data)?;
        bytes_ingested += item.data.len() as u64;
        rows.push(NewSeenFile {
            source_id: source_id.to_string(),
            external_id: item.external_id.clone(),
            raw_hash,
            file_size: item.data.len() as i64,
            filename: item.filename.clone(),
            metadata: Some(json!({ "is_text": item.is_text })),
        });
    }
    let files_ingested = rows.len() as u64;
    repo.record_files_batch(&rows)?;
    Ok(FlushOutcome { files_ingested, bytes_ingested, skipped })
}

#[derive(Debug, Clone, Default)]
pub struct IngestStats {
    pub files_ingested: u64,
    pub bytes_ingested: u64,
    pub skipped_files: u64,
    pub duration_seconds: f64,
}

pub async fn ingest_source(
    source_id: &str,
    source_type: &str,
    connector: &dyn SourceConnector,
    repo: &StateRepo,
    raw_store: &BlobStore,
    deadline: Option<Instant>,
) -> Result<IngestStats, PipelineError> {
    let started = Instant::now();
    let prior = repo.get_source_state(source_id)?;
    let prior_state = prior.as_ref().map(|s| s.state.clone()).unwrap_or_else(|| json!({}));
    let prior_total: u64 = prior_state.get("total_files").and_then(Value::as_u64).unwrap_or(0);

    let mut stream = connector.list_new(prior_state).await?;
    let mut buffer: Vec<Item> = Vec::with_capacity(DEFAULT_BUFFER_SIZE);
    let mut stats = IngestStats::default();

    loop {
        if let Some(deadline) = deadline {
            if Instant::now() > deadline {
                tracing::warn!(source_id, "ingest deadline exceeded, flushing and stopping");
                break;
            }
        }
        let Some(item) = stream.next().await else {
            break;
        };
        let item = match item {
            Ok(item) => item,
            Err(e) => {
                if !buffer.is_empty() {
                    flush_buffer(source_id, &buffer, repo, raw_store)?;
                }
                return Err(e.into());
            }
        };
        buffer.push(item);

        if buffer.len() >= DEFAULT_BUFFER_SIZE {
            let outcome = flush_buffer(source_id, &buffer, repo, raw_store)?;
            stats.files_ingested += outcome.files_ingested;
            stats.bytes_ingested += outcome.bytes_ingested;
            stats.skipped_files += outcome.skipped;
            buffer.clear();
        }
    }
    if !buffer.is_empty() {
        let outcome = flush_buffer(source_id, &buffer, repo, raw_store)?;
        stats.files_ingested += outcome.files_ingested;
        stats.bytes_ingested += outcome.bytes_ingested;
        stats.skipped_files += outcome.skipped;
    }

    stats.duration_seconds = started.elapsed().as_secs_f64();

    let connector_state = connector.get_state().await;
    let merged = json!({
        "offset": connector_state.get("offset").cloned().unwrap_or(Value::Null),
        "total_files": prior_total + stats.files_ingested,
        "last_run": {
            "files_ingested": stats.files_ingested,
            "bytes_ingested": stats.bytes_ingested,
            "duration_seconds": stats.duration_seconds,
            "skipped_files": stats.skipped_files,
        },
    });
    repo.update_source_state(source_id, source_type, &merged)?;

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agg_connectors::{InMemoryConnector, Item};

    #[tokio::test]
    async fn ingest_is_idempotent_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let repo = StateRepo::open_in_memory().unwrap();
        let raw_store = BlobStore::new(dir.path()).unwrap();
        let connector = InMemoryConnector::new(vec![
            Item {
                external_id: "1".into(),
                data: b"hello".to_vec(),
                filename: None,
                is_text: true,
            },
            Item {
                external_id: "2".into(),
                data: b"world".to_vec(),
                filename: None,
                is_text: true,
            },
        ]);

        let stats1 = ingest_source("s1", "telegram", &connector, &repo, &raw_store, None)
            .await
            .unwrap();
        assert_eq!(stats1.files_ingested, 2);

        // Re-running against a connector with no further items yields no
        // new files; the unique constraint would also protect a re-run
        // against a connector that re-emitted the same external ids.
        let empty_connector = InMemoryConnector::new(vec![]);
        let stats2 = ingest_source("s1", "telegram", &empty_connector, &repo, &raw_store, None)
            .await
            .unwrap();
        assert_eq!(stats2.files_ingested, 0);

        let pending = repo.get_pending_files().unwrap();
        assert_eq!(pending.len(), 2);
    }
}
