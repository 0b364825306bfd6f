//! Per route, fetch deduplicated records and invoke each format's `build`,
//! deriving decoded-JSON and base64-subscription variants for the text
//! proxy formats.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde_json::json;

use agg_artifact_store::ArtifactStore;
use agg_blob_store::BlobStore;
use agg_formats::{BlobFetcher, BuildRecord, FormatRegistry};
use agg_proxy_uri::decode_uri;
use agg_state::StateRepo;

use crate::error::PipelineError;

const MIN_NONEMPTY_ZIP_SIZE: usize = 22;
const TEXT_FORMATS_WITH_DERIVATIVES: &[&str] = &["npvt", "npvtsub"];

/// Adapts the on-disk raw store to the format handlers' narrow blob-fetch
/// contract, keeping `agg_formats` free of a direct storage dependency.
pub struct RawBlobFetcher<'a>(pub &'a BlobStore);

impl BlobFetcher for RawBlobFetcher<'_> {
    fn fetch(&self, hash_hex: &str) -> Option<Vec<u8>> {
        self.0.get(hash_hex).ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Base,
    Decoded,
    B64Sub,
}

#[derive(Debug, Clone)]
pub struct BuildArtifact {
    pub route: String,
    pub format: String,
    pub kind: ArtifactKind,
    pub unique_id: String,
    pub output_name: String,
    pub artifact_hash: String,
    pub bytes: Vec<u8>,
    pub count: usize,
}

pub fn run_build(
    route_name: &str,
    formats: &[String],
    source_ids: &[String],
    min_seen_file_id: Option<i64>,
    repo: &StateRepo,
    artifact_store: &ArtifactStore,
    registry: &FormatRegistry,
    blobs: &dyn BlobFetcher,
) -> Result<Vec<BuildArtifact>, PipelineError> {
    let all_records = repo.get_records_for_build(formats, source_ids, min_seen_file_id)?;
    let mut out = Vec::new();

    for format_id in formats {
        let filtered: Vec<BuildRecord> = all_records
            .iter()
            .filter(|r| &r.record_type == format_id)
            .map(|r| BuildRecord {
                record_type: r.record_type.clone(),
                data: r.data.clone(),
            })
            .collect();
        if filtered.is_empty() {
            continue;
        }

        let Some(handler) = registry.get(format_id) else {
            tracing::warn!(route = route_name, format = %format_id, "no handler registered, skipping build");
            continue;
        };

        let built = handler.build(&filtered, blobs)?;
        if built.skipped > 0 {
            tracing::warn!(
                route = route_name,
                format = %format_id,
                skipped = built.skipped,
                "build skipped records whose blob was pruned"
            );
        }
        if built.bytes.is_empty() {
            continue;
        }
        if handler.is_blob_dependent() && built.bytes.len() <= MIN_NONEMPTY_ZIP_SIZE {
            continue;
        }

        let artifact_hash = artifact_store.save_artifact(route_name, format_id, &built.bytes)?;
        let output_name = format!("{route_name}.{format_id}");
        artifact_store.save_output(&output_name, &built.bytes)?;

        out.push(BuildArtifact {
            route: route_name.to_string(),
            format: format_id.clone(),
            kind: ArtifactKind::Base,
            unique_id: format!("{route_name}:{format_id}"),
            output_name,
            artifact_hash,
            bytes: built.bytes.clone(),
            count: filtered.len(),
        });

        if TEXT_FORMATS_WITH_DERIVATIVES.contains(&format_id.as_str()) {
            out.push(derive_decoded(route_name, format_id, &built.bytes, artifact_store)?);
            out.push(derive_b64sub(route_name, format_id, &built.bytes, artifact_store)?);
        }
    }

    Ok(out)
}

fn derive_decoded(
    route_name: &str,
    format_id: &str,
    base_bytes: &[u8],
    artifact_store: &ArtifactStore,
) -> Result<BuildArtifact, PipelineError> {
    let text = String::from_utf8_lossy(base_bytes);
    let mut protocols = std::collections::HashMap::new();
    let mut entries = Vec::new();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let entry = decode_uri(line.trim());
        *protocols.entry(entry.protocol.clone()).or_insert(0u64) += 1;
        entries.push(entry);
    }
    let payload = json!({
        "total": entries.len(),
        "protocols": protocols,
        "entries": entries,
    });
    let bytes = serde_json::to_vec_pretty(&payload)?;
    let hash = artifact_store.save_artifact(route_name, &format!("{format_id}.decoded"), &bytes)?;
    let output_name = format!("{route_name}_{format_id}_decoded.json");
    artifact_store.save_output(&output_name, &bytes)?;
    Ok(BuildArtifact {
        route: route_name.to_string(),
        format: format_id.to_string(),
        kind: ArtifactKind::Decoded,
        unique_id: format!("{route_name}:{format_id}.decoded"),
        output_name,
        artifact_hash: hash,
        count: entries.len(),
        bytes,
    })
}

fn derive_b64sub(
    route_name: &str,
    format_id: &str,
    base_bytes: &[u8],
    artifact_store: &ArtifactStore,
) -> Result<BuildArtifact, PipelineError> {
    let encoded = B64.encode(base_bytes);
    let bytes = encoded.into_bytes();
    let hash = artifact_store.save_artifact(route_name, &format!("{format_id}.b64sub"), &bytes)?;
    let output_name = format!("{route_name}_{format_id}_b64sub.txt");
    artifact_store.save_output(&output_name, &bytes)?;
    Ok(BuildArtifact {
        route: route_name.to_string(),
        format: format_id.to_string(),
        kind: ArtifactKind::B64Sub,
        unique_id: format!("{route_name}:{format_id}.b64sub"),
        output_name,
        artifact_hash: hash,
        count: 0,
        bytes,
    })
}
