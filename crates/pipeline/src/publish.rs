//! Compares an artifact's hash against the last published hash for its
//! `unique_id`, and if it changed, uploads it to every configured
//! destination. State only advances when at least one destination
//! succeeds, so a fully-failed publish is retried next run.

use agg_connectors::{Destination, PublishRequest, Publisher};
use agg_state::StateRepo;
use chrono::Utc;

use crate::build::{ArtifactKind, BuildArtifact};
use crate::error::PipelineError;

const BUNDLE_FORMATS: &[&str] = &[
    "ovpn", "npv4", "ehi", "hc", "hat", "sip", "nm", "dark", "opaque_bundle",
];

fn extension_for(artifact: &BuildArtifact) -> &'static str {
    match artifact.kind {
        ArtifactKind::Decoded => ".json",
        ArtifactKind::B64Sub => ".txt",
        ArtifactKind::Base => {
            if artifact.format == "conf_lines" {
                ".conf"
            } else if BUNDLE_FORMATS.contains(&artifact.format.as_str()) {
                ".zip"
            } else {
                ".txt"
            }
        }
    }
}

fn filename_for(artifact: &BuildArtifact) -> String {
    let hash8 = &artifact.artifact_hash[..artifact.artifact_hash.len().min(8)];
    format!("{}_{}_{}{}", artifact.route, artifact.format, hash8, extension_for(artifact))
}

fn format_caption(template: &str, artifact: &BuildArtifact) -> String {
    let sha12 = &artifact.artifact_hash[..artifact.artifact_hash.len().min(12)];
    template
        .replace("{timestamp}", &Utc::now().to_rfc3339())
        .replace("{sha12}", sha12)
        .replace("{count}", &artifact.count.to_string())
        .replace("{format}", &artifact.format)
}

/// Returns whether the artifact was published to at least one destination.
pub async fn publish_build_artifact(
    artifact: &BuildArtifact,
    destinations: &[Destination],
    publisher: &dyn Publisher,
    repo: &StateRepo,
) -> Result<bool, PipelineError> {
    let last = repo.get_last_published_hash(&artifact.unique_id)?;
    if last.as_deref() == Some(artifact.artifact_hash.as_str()) {
        tracing::debug!(unique_id = %artifact.unique_id, "artifact unchanged, skipping publish");
        return Ok(false);
    }

    let filename = filename_for(artifact);
    let mut any_success = false;
    for destination in destinations {
        let caption = format_caption(&destination.caption_template, artifact);
        let req = PublishRequest {
            destination,
            filename: filename.clone(),
            bytes: &artifact.bytes,
            caption,
        };
        match publisher.publish(req).await {
            Ok(()) => any_success = true,
            Err(e) => {
                tracing::warn!(
                    unique_id = %artifact.unique_id,
                    chat_id = %destination.chat_id,
                    error = %e,
                    "publish failed for destination"
                );
            }
        }
    }

    if any_success {
        repo.mark_published(&artifact.unique_id, &artifact.artifact_hash, None)?;
    }
    Ok(any_success)
}
