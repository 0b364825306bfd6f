//! `conf_lines`: the degenerate text handler for arbitrary config-line
//! dumps that carry no proxy-URI semantics (no remark stripping, no
//! re-tagging) — each non-empty, non-comment line is its own record.

use agg_common::sha256_hex;
use serde_json::json;

use crate::handler::{BlobFetcher, BuildOutput, BuildRecord, FormatError, FormatHandler, ParseMeta, ParsedRecord};

pub struct ConfLinesHandler;

impl FormatHandler for ConfLinesHandler {
    fn format_id(&self) -> &'static str {
        "conf_lines"
    }

    fn parse(&self, bytes: &[u8], _meta: &ParseMeta) -> Result<Vec<ParsedRecord>, FormatError> {
        let text = String::from_utf8_lossy(bytes);
        let mut out = Vec::new();
        for raw_line in text.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            out.push(ParsedRecord {
                unique_hash: sha256_hex(line.as_bytes()),
                data: json!({ "line": line }),
            });
        }
        Ok(out)
    }

    fn build(
        &self,
        records: &[BuildRecord],
        _blobs: &dyn BlobFetcher,
    ) -> Result<BuildOutput, FormatError> {
        let mut body = String::new();
        for rec in records {
            if let Some(line) = rec.data.get("line").and_then(|v| v.as_str()) {
                body.push_str(line);
                body.push('\n');
            }
        }
        Ok(BuildOutput {
            bytes: body.into_bytes(),
            skipped: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::NoBlobs;

    #[test]
    fn skips_blank_and_comment_lines() {
        let handler = ConfLinesHandler;
        let input = b"# comment\nclient\ndev tun\n\n";
        let parsed = handler.parse(input, &ParseMeta::default()).unwrap();
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn build_joins_lines_in_order() {
        let handler = ConfLinesHandler;
        let records = vec![
            BuildRecord {
                record_type: "conf_lines".into(),
                data: json!({"line": "client"}),
            },
            BuildRecord {
                record_type: "conf_lines".into(),
                data: json!({"line": "dev tun"}),
            },
        ];
        let out = handler.build(&records, &NoBlobs).unwrap();
        assert_eq!(String::from_utf8(out.bytes).unwrap(), "client\ndev tun\n");
    }
}
