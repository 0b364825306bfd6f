//! Phase 3b output export: the repo-tree "latest" outputs are handled by
//! `ArtifactStore::save_output`/`cleanup_stale_outputs`; this module covers
//! the cumulative `outputs_dev/` tree, which never forgets a URI it has
//! ever seen.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use agg_proxy_uri::{add_clean_remark, strip_proxy_remark};
use agg_state::StateRepo;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chrono::Utc;
use serde_json::{json, Value};

use crate::error::OrchestratorError;

const DEV_RECORD_TYPES: &[&str] = &["npvt", "npvtsub"];

/// All-time cumulative history of deduplicated proxy URIs, keyed by their
/// canonical (remark-stripped) form, mapping to the unix timestamp they
/// were first observed.
type Manifest = HashMap<String, i64>;

pub fn export_dev_outputs(
    dev_dir: &Path,
    repo: &StateRepo,
    source_ids: &[String],
) -> Result<usize, OrchestratorError> {
    fs::create_dir_all(dev_dir)?;
    let manifest_path = dev_dir.join("_manifest.json");
    let now = chrono_unix_now();

    let mut manifest: Manifest = if manifest_path.exists() {
        match fs::read_to_string(&manifest_path).ok().and_then(|s| serde_json::from_str(&s).ok()) {
            Some(m) => m,
            None => {
                tracing::warn!("could not read outputs_dev manifest, starting fresh");
                Manifest::new()
            }
        }
    } else {
        Manifest::new()
    };

    let record_types: Vec<String> = DEV_RECORD_TYPES.iter().map(|s| s.to_string()).collect();
    let history = repo.get_records_for_build(&record_types, source_ids, None)?;

    let mut added = 0usize;
    for record in &history {
        let Some(line) = record.data.get("line").and_then(Value::as_str) else {
            continue;
        };
        let uri = line.trim();
        if uri.is_empty() || !uri.contains("://") {
            continue;
        }
        let key = strip_proxy_remark(uri);
        manifest.entry(key).or_insert_with(|| {
            added += 1;
            now
        });
    }

    tracing::info!(
        existing = manifest.len() - added,
        added,
        total = manifest.len(),
        "outputs_dev manifest updated"
    );

    if manifest.is_empty() {
        tracing::warn!("no proxy URIs found, outputs_dev not updated");
        return Ok(0);
    }

    fs::write(&manifest_path, serde_json::to_vec(&manifest)?)?;

    let mut sorted_uris: Vec<&String> = manifest.keys().collect();
    sorted_uris.sort_by(|a, b| manifest[*b].cmp(&manifest[*a]).then_with(|| a.cmp(b)));

    let ts = Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();

    let mut remark_counter: HashMap<String, u64> = HashMap::new();
    let remarked: Vec<String> = sorted_uris.iter().map(|u| add_clean_remark(u, &mut remark_counter)).collect();

    let txt_path = dev_dir.join("proxies.txt");
    let header = format!(
        "# aggregator proxy list — {ts}\n# All-time cumulative history — {} unique URIs\n# One proxy URI per line\n\n",
        remarked.len()
    );
    fs::write(&txt_path, format!("{header}{}\n", remarked.join("\n")))?;

    let b64_path = dev_dir.join("proxies_b64sub.txt");
    let plain = remarked.join("\n");
    fs::write(&b64_path, format!("{}\n", B64.encode(plain.as_bytes())))?;

    let json_path = dev_dir.join("proxies.json");
    let proxies: Vec<Value> = sorted_uris
        .iter()
        .zip(remarked.iter())
        .map(|(raw, remarked)| json!({ "uri": remarked, "first_seen": manifest[*raw] }))
        .collect();
    let wrapped = json!({
        "_generated": ts,
        "_scope": "all_time_cumulative",
        "_count": sorted_uris.len(),
        "proxies": proxies,
    });
    fs::write(&json_path, serde_json::to_vec_pretty(&wrapped)?)?;

    tracing::info!(path = %dev_dir.display(), "exported 3 dev output file(s)");
    Ok(3)
}

fn chrono_unix_now() -> i64 {
    Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use agg_state::{NewRecord, NewSeenFile};
    use serde_json::json;

    #[test]
    fn export_is_cumulative_across_two_runs() {
        let dir = tempfile::tempdir().unwrap();
        let dev_dir = dir.path().join("outputs_dev");
        let repo = StateRepo::open_in_memory().unwrap();

        repo.record_files_batch(&[NewSeenFile {
            source_id: "s1".into(),
            external_id: "e1".into(),
            raw_hash: "h1".into(),
            file_size: 1,
            filename: None,
            metadata: None,
        }])
        .unwrap();
        repo.add_records_batch(&[NewRecord {
            source_file_hash: "h1".into(),
            record_type: "npvt".into(),
            unique_hash: "u1".into(),
            data: json!({"line": "vless://u@h:443#A"}),
        }])
        .unwrap();

        let written = export_dev_outputs(&dev_dir, &repo, &["s1".to_string()]).unwrap();
        assert_eq!(written, 3);
        assert!(dev_dir.join("proxies.txt").exists());
        assert!(dev_dir.join("proxies.json").exists());
        assert!(dev_dir.join("proxies_b64sub.txt").exists());

        // Second run with no new records should still find the manifest entry.
        let written2 = export_dev_outputs(&dev_dir, &repo, &["s1".to_string()]).unwrap();
        assert_eq!(written2, 3);
        let manifest: Manifest =
            serde_json::from_str(&fs::read_to_string(dev_dir.join("_manifest.json")).unwrap()).unwrap();
        assert_eq!(manifest.len(), 1);
    }

    #[test]
    fn export_skips_write_when_no_uris_seen() {
        let dir = tempfile::tempdir().unwrap();
        let dev_dir = dir.path().join("outputs_dev");
        let repo = StateRepo::open_in_memory().unwrap();
        let written = export_dev_outputs(&dev_dir, &repo, &["s1".to_string()]).unwrap();
        assert_eq!(written, 0);
        assert!(!dev_dir.join("proxies.txt").exists());
    }
}
