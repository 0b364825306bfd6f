//! Text proxy-list handlers: `npvt` (plain proxy-uri dumps) and `npvtsub`
//! (subscription-flavored dumps). Both share the same line-oriented
//! parse/build semantics; only the registered `format_id` differs, which
//! matters to the router and to route configuration, not to content
//! handling.

use std::collections::HashSet;

use agg_common::sha256_hex;
use agg_proxy_uri::{
    add_clean_remark, b64_decode_lenient, extract_proxy_uris, is_recognized_scheme,
    starts_with_recognized_scheme, strip_proxy_remark,
};
use serde_json::json;
use unicode_normalization::UnicodeNormalization;

use crate::handler::{BlobFetcher, BuildOutput, BuildRecord, FormatError, FormatHandler, ParseMeta, ParsedRecord};

pub struct TextProxyHandler {
    format_id: &'static str,
}

impl TextProxyHandler {
    pub fn new(format_id: &'static str) -> Self {
        Self { format_id }
    }
}

fn normalize_line(line: &str) -> String {
    line.nfkc().collect::<String>().trim().to_string()
}

/// If `text` looks like a whole-blob base64 dump (no scheme marker, no
/// whitespace, long enough to be meaningful), try to decode it and accept
/// only if the result actually contains a recognized scheme.
fn maybe_unwrap_base64(text: &str) -> String {
    let looks_like_b64 = !text.contains("://") && !text.contains(char::is_whitespace) && text.trim().len() > 10;
    if !looks_like_b64 {
        return text.to_string();
    }
    match b64_decode_lenient(text.trim()) {
        Some(decoded) if RECOGNIZED_SCHEME_RE.is_match(&decoded) => decoded,
        _ => text.to_string(),
    }
}

static RECOGNIZED_SCHEME_RE: once_cell::sync::Lazy<regex::Regex> = once_cell::sync::Lazy::new(|| {
    let alt = agg_proxy_uri::RECOGNIZED_SCHEMES.join("|");
    regex::Regex::new(&format!(r"(?i)(?:{alt})://")).unwrap()
});

impl FormatHandler for TextProxyHandler {
    fn format_id(&self) -> &'static str {
        self.format_id
    }

    fn parse(&self, bytes: &[u8], _meta: &ParseMeta) -> Result<Vec<ParsedRecord>, FormatError> {
        let text = String::from_utf8_lossy(bytes).into_owned();
        let text = maybe_unwrap_base64(&text);

        let mut seen: HashSet<String> = HashSet::new();
        let mut out = Vec::new();

        for raw_line in text.lines() {
            let line = normalize_line(raw_line);
            if line.is_empty() {
                continue;
            }

            let candidates: Vec<String> = if starts_with_recognized_scheme(&line) {
                vec![line.clone()]
            } else {
                extract_proxy_uris(&line)
            };

            for uri in candidates {
                let canonical = strip_proxy_remark(&uri);
                if !seen.insert(canonical.clone()) {
                    continue;
                }
                let unique_hash = sha256_hex(canonical.as_bytes());
                out.push(ParsedRecord {
                    unique_hash,
                    data: json!({ "line": canonical }),
                });
            }
        }

        Ok(out)
    }

    fn build(
        &self,
        records: &[BuildRecord],
        _blobs: &dyn BlobFetcher,
    ) -> Result<BuildOutput, FormatError> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut ordered: Vec<String> = Vec::new();

        for rec in records {
            let Some(line) = rec
                .data
                .get("line")
                .and_then(|v| v.as_str())
                .map(str::to_string)
            else {
                continue;
            };
            let canonical = strip_proxy_remark(&line);
            if seen.insert(canonical.clone()) {
                ordered.push(canonical);
            }
        }

        let mut counter = std::collections::HashMap::new();
        let tagged: Vec<String> = ordered
            .iter()
            .map(|uri| add_clean_remark(uri, &mut counter))
            .collect();

        let body = tagged.join("\n");
        let mut bytes = body.into_bytes();
        if !bytes.is_empty() {
            bytes.push(b'\n');
        }
        Ok(BuildOutput { bytes, skipped: 0 })
    }
}

#[allow(dead_code)]
fn is_proxy_scheme(s: &str) -> bool {
    is_recognized_scheme(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::NoBlobs;

    #[test]
    fn dedups_by_stripped_remark() {
        let handler = TextProxyHandler::new("npvt");
        let input = b"vless://u@h:443#A\nvless://u@h:443#B\ntrojan://p@h2:443#C\n";
        let parsed = handler.parse(input, &ParseMeta::default()).unwrap();
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn build_retags_sequentially() {
        let handler = TextProxyHandler::new("npvt");
        let records = vec![
            BuildRecord {
                record_type: "npvt".into(),
                data: json!({"line": "vless://u@h:443"}),
            },
            BuildRecord {
                record_type: "npvt".into(),
                data: json!({"line": "vless://u2@h2:443"}),
            },
        ];
        let out = handler.build(&records, &NoBlobs).unwrap();
        let text = String::from_utf8(out.bytes).unwrap();
        assert!(text.contains("#vless-1"));
        assert!(text.contains("#vless-2"));
    }

    #[test]
    fn extracts_embedded_uris_from_prose() {
        let handler = TextProxyHandler::new("npvt");
        let input = b"free proxy today: trojan://pw@host:443#promo enjoy!\n";
        let parsed = handler.parse(input, &ParseMeta::default()).unwrap();
        assert_eq!(parsed.len(), 1);
    }
}
