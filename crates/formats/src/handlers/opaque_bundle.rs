//! The opaque-bundle handler family: `ovpn`, `npv4`, `ehi`, `hc`, `hat`,
//! `sip`, `nm`, `dark`, and the generic `opaque_bundle` fallback. None of
//! these proprietary binary containers are decrypted or validated — each
//! whole file is one record, carried through to a ZIP bundle at build time.

use std::collections::HashSet;
use std::io::{Cursor, Write};

use agg_common::sha256_hex;
use serde_json::json;
use zip::write::{SimpleFileOptions, ZipWriter};

use crate::handler::{BlobFetcher, BuildOutput, BuildRecord, FormatError, FormatHandler, ParseMeta, ParsedRecord};

pub struct OpaqueBundleHandler {
    format_id: &'static str,
}

impl OpaqueBundleHandler {
    pub fn new(format_id: &'static str) -> Self {
        Self { format_id }
    }
}

impl FormatHandler for OpaqueBundleHandler {
    fn format_id(&self) -> &'static str {
        self.format_id
    }

    fn is_blob_dependent(&self) -> bool {
        true
    }

    fn parse(&self, bytes: &[u8], meta: &ParseMeta) -> Result<Vec<ParsedRecord>, FormatError> {
        let unique_hash = sha256_hex(bytes);
        let filename = meta
            .filename
            .clone()
            .unwrap_or_else(|| format!("{}.bin", self.format_id));
        Ok(vec![ParsedRecord {
            unique_hash: unique_hash.clone(),
            data: json!({
                "filename": filename,
                "blob_hash": unique_hash,
                "size": bytes.len(),
            }),
        }])
    }

    fn build(
        &self,
        records: &[BuildRecord],
        blobs: &dyn BlobFetcher,
    ) -> Result<BuildOutput, FormatError> {
        let mut used_names: HashSet<String> = HashSet::new();
        let mut skipped = 0usize;
        let buf = Cursor::new(Vec::new());
        let mut zip = ZipWriter::new(buf);
        let options = SimpleFileOptions::default();

        for rec in records {
            let Some(blob_hash) = rec.data.get("blob_hash").and_then(|v| v.as_str()) else {
                skipped += 1;
                continue;
            };
            let Some(bytes) = blobs.fetch(blob_hash) else {
                skipped += 1;
                continue;
            };
            let original_name = rec
                .data
                .get("filename")
                .and_then(|v| v.as_str())
                .unwrap_or("file")
                .to_string();

            let mut name = original_name.clone();
            let mut counter = 1u32;
            while used_names.contains(&name) {
                name = format!("{counter}_{original_name}");
                counter += 1;
            }
            used_names.insert(name.clone());

            zip.start_file(&name, options)?;
            zip.write_all(&bytes)?;
        }

        let cursor = zip.finish()?;
        Ok(BuildOutput {
            bytes: cursor.into_inner(),
            skipped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeBlobs(HashMap<String, Vec<u8>>);
    impl BlobFetcher for FakeBlobs {
        fn fetch(&self, hash_hex: &str) -> Option<Vec<u8>> {
            self.0.get(hash_hex).cloned()
        }
    }

    #[test]
    fn parse_captures_whole_blob() {
        let handler = OpaqueBundleHandler::new("ovpn");
        let meta = ParseMeta {
            filename: Some("client.ovpn".into()),
            source_id: "s1".into(),
        };
        let parsed = handler.parse(b"binary-ish-content", &meta).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(
            parsed[0].data.get("filename").unwrap().as_str().unwrap(),
            "client.ovpn"
        );
    }

    #[test]
    fn build_resolves_name_collisions() {
        let handler = OpaqueBundleHandler::new("ovpn");
        let mut blobs = HashMap::new();
        blobs.insert("h1".to_string(), b"one".to_vec());
        blobs.insert("h2".to_string(), b"two".to_vec());
        let records = vec![
            BuildRecord {
                record_type: "ovpn".into(),
                data: json!({"filename": "client.ovpn", "blob_hash": "h1"}),
            },
            BuildRecord {
                record_type: "ovpn".into(),
                data: json!({"filename": "client.ovpn", "blob_hash": "h2"}),
            },
        ];
        let out = handler.build(&records, &FakeBlobs(blobs)).unwrap();
        assert_eq!(out.skipped, 0);
        assert!(out.bytes.len() > 22);
    }

    #[test]
    fn build_skips_missing_blobs() {
        let handler = OpaqueBundleHandler::new("ehi");
        let records = vec![BuildRecord {
            record_type: "ehi".into(),
            data: json!({"filename": "x.ehi", "blob_hash": "missing"}),
        }];
        let out = handler.build(&records, &FakeBlobs(HashMap::new())).unwrap();
        assert_eq!(out.skipped, 1);
    }
}
