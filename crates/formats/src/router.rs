//! Decides a `format_id` from a filename and a content prefix, without ever
//! needing the full file in memory.

use agg_proxy_uri::b64_decode_lenient;
use once_cell::sync::Lazy;
use regex::Regex;

const CONTENT_SNIFF_WINDOW: usize = 2048;
const BASE64_PREVIEW_WINDOW: usize = 512;

static SCHEME_SUBSTRING_RE: Lazy<Regex> = Lazy::new(|| {
    let alt = agg_proxy_uri::RECOGNIZED_SCHEMES.join("|");
    Regex::new(&format!(r"(?i)(?:{alt})://")).unwrap()
});

fn extension_format(filename: &str) -> Option<&'static str> {
    let lower = filename.to_lowercase();
    let fmt = if lower.ends_with(".ovpn") {
        "ovpn"
    } else if lower.ends_with(".npv4") {
        "npv4"
    } else if lower.ends_with(".conf") {
        "conf_lines"
    } else if lower.ends_with(".ehi") {
        "ehi"
    } else if lower.ends_with(".hc") {
        "hc"
    } else if lower.ends_with(".hat") {
        "hat"
    } else if lower.ends_with(".sip") {
        "sip"
    } else if lower.ends_with(".nm") {
        "nm"
    } else if lower.ends_with(".dark") {
        "dark"
    } else if lower.ends_with(".npvtsub") {
        "npvtsub"
    } else {
        return None;
    };
    Some(fmt)
}

/// Decide the format identifier for one ingested file. `content` need only
/// contain the first couple of kilobytes — callers may pass the whole blob
/// when it is already small.
pub fn decide_format(filename: Option<&str>, content: &[u8]) -> &'static str {
    if let Some(filename) = filename {
        if let Some(fmt) = extension_format(filename) {
            return fmt;
        }
    }

    let head_len = content.len().min(CONTENT_SNIFF_WINDOW);
    let head_text = String::from_utf8_lossy(&content[..head_len]);
    if SCHEME_SUBSTRING_RE.is_match(&head_text) {
        return "npvt";
    }

    let preview_len = content.len().min(BASE64_PREVIEW_WINDOW);
    let preview = String::from_utf8_lossy(&content[..preview_len]);
    let trimmed = preview.trim();
    let looks_like_b64 =
        !trimmed.contains("://") && !trimmed.contains(char::is_whitespace) && trimmed.len() > 20;
    if looks_like_b64 {
        if let Some(decoded) = b64_decode_lenient(trimmed) {
            if SCHEME_SUBSTRING_RE.is_match(&decoded) {
                return "npvt";
            }
        }
    }

    "opaque_bundle"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_rules_win_first() {
        assert_eq!(decide_format(Some("client.ovpn"), b"anything"), "ovpn");
        assert_eq!(decide_format(Some("a.conf"), b"client\n"), "conf_lines");
        assert_eq!(decide_format(Some("sub.npvtsub"), b""), "npvtsub");
    }

    #[test]
    fn content_sniff_detects_scheme() {
        let content = b"here is a proxy: vless://user@host:443#tag";
        assert_eq!(decide_format(None, content), "npvt");
    }

    #[test]
    fn unknown_binary_defaults_to_opaque_bundle() {
        let content = vec![0u8, 1, 2, 3, 255, 254];
        assert_eq!(decide_format(Some("file.bin"), &content), "opaque_bundle");
    }
}
