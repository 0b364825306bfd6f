//! agg_proxy_uri
//!
//! The proxy-URI canonicalization engine strips cosmetic remarks for
//! dedup, re-tags surviving URIs with stable labels, and produces a
//! structured per-URI decode used by the build pipeline's `.decoded.json`
//! derivation.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of schemes this engine recognizes for detection and
/// canonicalization.
pub const RECOGNIZED_SCHEMES: &[&str] = &[
    "vmess", "vless", "trojan", "ss", "ssr", "hysteria2", "hy2", "hysteria", "tuic", "wireguard",
    "wg", "socks", "socks5", "socks4", "anytls", "juicity", "warp", "dns", "dnstt",
];

pub fn is_recognized_scheme(scheme: &str) -> bool {
    RECOGNIZED_SCHEMES.contains(&scheme)
}

/// True if `line` begins with `"<scheme>://"` for a recognized scheme.
pub fn starts_with_recognized_scheme(line: &str) -> bool {
    RECOGNIZED_SCHEMES
        .iter()
        .any(|s| line.starts_with(&format!("{s}://")))
}

static SCHEME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    let alt = RECOGNIZED_SCHEMES.join("|");
    Regex::new(&format!(r#"(?i)\b(?:{alt})://[^\s<>"']+"#)).unwrap()
});

/// Lift every proxy URI embedded in free text (used for messages that
/// interleave prose with configuration links).
pub fn extract_proxy_uris(text: &str) -> Vec<String> {
    SCHEME_PATTERN
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Tolerant base64 decode: accepts URL-safe alphabet and missing padding.
/// Falls back to the original string, verbatim, on any decode failure —
/// callers treat that as "could not canonicalize, keep as-is".
fn b64_decode_safe(data: &str) -> String {
    match b64_decode_lenient(data) {
        Some(decoded) => decoded,
        None => data.to_string(),
    }
}

/// Public tolerant base64 decode: URL-safe alphabet, auto-padded, returning
/// `None` (rather than falling back to the input) on failure. Used by
/// callers that need to distinguish "decoded successfully" from "not
/// base64 at all", such as the whole-blob base64 heuristic in the text
/// format handlers.
pub fn b64_decode_lenient(data: &str) -> Option<String> {
    let mut normalized = data.replace('-', "+").replace('_', "/");
    let rem = normalized.len() % 4;
    if rem != 0 {
        normalized.push_str(&"=".repeat(4 - rem));
    }
    B64.decode(normalized.as_bytes())
        .ok()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

fn scheme_of(uri: &str) -> String {
    match uri.split_once("://") {
        Some((scheme, _)) => scheme.to_lowercase(),
        None => "proxy".to_string(),
    }
}

/// Remove the cosmetic remark from a proxy URI so equivalent endpoints
/// collapse to the same identity. Idempotent: `strip(strip(u)) == strip(u)`.
pub fn strip_proxy_remark(uri: &str) -> String {
    if let Some(rest) = uri.strip_prefix("vmess://") {
        if let Some(stripped) = strip_vmess_remark(rest) {
            return stripped;
        }
        // fall through to generic fragment stripping on any decode failure
    }
    match uri.rfind('#') {
        Some(idx) if idx > 0 => uri[..idx].to_string(),
        _ => uri.to_string(),
    }
}

fn strip_vmess_remark(b64_part: &str) -> Option<String> {
    let decoded = b64_decode_safe(b64_part);
    let mut obj: Value = serde_json::from_str(&decoded).ok()?;
    let map = obj.as_object_mut()?;
    map.remove("ps");
    let sorted = sort_object_keys(Value::Object(map.clone()));
    let compact = serde_json::to_string(&sorted).ok()?;
    let re_b64 = B64.encode(compact.as_bytes());
    Some(format!("vmess://{re_b64}"))
}

fn sort_object_keys(v: Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut out = serde_json::Map::new();
            for (k, v) in entries {
                out.insert(k, sort_object_keys(v));
            }
            Value::Object(out)
        }
        Value::Array(arr) => Value::Array(arr.into_iter().map(sort_object_keys).collect()),
        other => other,
    }
}

/// Re-tag a (already-stripped) URI with a stable `<scheme>-<N>` label, `N`
/// being a 1-based sequential counter per protocol across the build.
pub fn add_clean_remark(uri: &str, counter: &mut HashMap<String, u64>) -> String {
    let scheme = scheme_of(uri);
    let n = counter.entry(scheme.clone()).or_insert(0);
    *n += 1;
    let tag = format!("{scheme}-{n}");

    if scheme == "vmess" {
        if let Some(rest) = uri.strip_prefix("vmess://") {
            if let Some(tagged) = tag_vmess_remark(rest, &tag) {
                return tagged;
            }
        }
        return uri.to_string();
    }

    let base = match uri.find('#') {
        Some(idx) => &uri[..idx],
        None => uri,
    };
    format!("{base}#{tag}")
}

fn tag_vmess_remark(b64_part: &str, tag: &str) -> Option<String> {
    let decoded = b64_decode_safe(b64_part);
    let mut obj: Value = serde_json::from_str(&decoded).ok()?;
    let map = obj.as_object_mut()?;
    map.insert("ps".to_string(), Value::String(tag.to_string()));
    let compact = serde_json::to_string(&Value::Object(map.clone())).ok()?;
    let re_b64 = B64.encode(compact.as_bytes());
    Some(format!("vmess://{re_b64}"))
}

/// Structured per-URI decode for the `.decoded.json` derivation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodedEntry {
    pub protocol: String,
    pub raw: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub userinfo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vmess: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssr_fields: Option<SsrFields>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SsrFields {
    pub host: String,
    pub port: String,
    pub protocol: String,
    pub method: String,
    pub obfs: String,
    pub password_b64: String,
}

/// Decode one canonicalized URI into a structured entry. Never fails: a URI
/// this engine cannot parse still yields an entry with `protocol` set and the
/// rest left absent, carrying `raw` so nothing is silently dropped.
pub fn decode_uri(uri: &str) -> DecodedEntry {
    let protocol = scheme_of(uri);
    let mut entry = DecodedEntry {
        protocol: protocol.clone(),
        raw: uri.to_string(),
        host: None,
        port: None,
        userinfo: None,
        tag: None,
        vmess: None,
        ssr_fields: None,
    };

    match protocol.as_str() {
        "vmess" => {
            if let Some(rest) = uri.strip_prefix("vmess://") {
                let decoded = b64_decode_safe(rest);
                if let Ok(obj) = serde_json::from_str::<Value>(&decoded) {
                    entry.host = obj.get("add").and_then(|v| v.as_str()).map(str::to_string);
                    entry.port = obj
                        .get("port")
                        .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
                        .map(|p| p as u16);
                    entry.tag = obj.get("ps").and_then(|v| v.as_str()).map(str::to_string);
                    entry.vmess = Some(obj);
                }
            }
        }
        "ssr" => {
            if let Some(rest) = uri.strip_prefix("ssr://") {
                let decoded = b64_decode_safe(rest);
                let mut parts = decoded.splitn(6, ':');
                if let (Some(host), Some(port), Some(proto), Some(method), Some(rest5)) = (
                    parts.next(),
                    parts.next(),
                    parts.next(),
                    parts.next(),
                    parts.next(),
                ) {
                    let mut obfs_and_pass = rest5.splitn(2, '/');
                    let obfs = obfs_and_pass.next().unwrap_or_default();
                    let password_b64 = obfs_and_pass
                        .next()
                        .unwrap_or_default()
                        .trim_start_matches('?')
                        .split('=')
                        .nth(1)
                        .unwrap_or_default();
                    entry.host = Some(host.to_string());
                    entry.port = port.parse().ok();
                    entry.ssr_fields = Some(SsrFields {
                        host: host.to_string(),
                        port: port.to_string(),
                        protocol: proto.to_string(),
                        method: method.to_string(),
                        obfs: obfs.to_string(),
                        password_b64: password_b64.to_string(),
                    });
                }
            }
        }
        "ss" => decode_ss(uri, &mut entry),
        _ => decode_generic(uri, &mut entry),
    }
    entry
}

fn decode_ss(uri: &str, entry: &mut DecodedEntry) {
    let rest = uri.strip_prefix("ss://").unwrap_or(uri);
    let (body, tag) = match rest.find('#') {
        Some(idx) => (&rest[..idx], Some(rest[idx + 1..].to_string())),
        None => (rest, None),
    };
    entry.tag = tag;

    if let Some((userinfo_b64, hostport)) = body.split_once('@') {
        // SIP002: ss://base64(method:pass)@host:port#tag
        entry.userinfo = Some(b64_decode_safe(userinfo_b64));
        if let Some((host, port)) = hostport.split_once(':') {
            entry.host = Some(host.to_string());
            entry.port = port.parse().ok();
        }
    } else {
        // Legacy: ss://base64(method:pass@host:port)
        let decoded = b64_decode_safe(body);
        if let Some((userinfo, hostport)) = decoded.rsplit_once('@') {
            entry.userinfo = Some(userinfo.to_string());
            if let Some((host, port)) = hostport.split_once(':') {
                entry.host = Some(host.to_string());
                entry.port = port.parse().ok();
            }
        }
    }
}

fn decode_generic(uri: &str, entry: &mut DecodedEntry) {
    let Some((_, rest)) = uri.split_once("://") else {
        return;
    };
    let (rest, tag) = match rest.find('#') {
        Some(idx) => (&rest[..idx], Some(rest[idx + 1..].to_string())),
        None => (rest, None),
    };
    entry.tag = tag;
    let authority = rest.split(['/', '?']).next().unwrap_or(rest);
    let (userinfo, hostport) = match authority.rsplit_once('@') {
        Some((u, h)) => (Some(u.to_string()), h),
        None => (None, authority),
    };
    entry.userinfo = userinfo;
    if let Some((host, port)) = hostport.rsplit_once(':') {
        entry.host = Some(host.to_string());
        entry.port = port.parse().ok();
    } else if !hostport.is_empty() {
        entry.host = Some(hostport.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_is_idempotent_for_fragment_schemes() {
        let uri = "vless://user@host:443#hello-world";
        let once = strip_proxy_remark(uri);
        let twice = strip_proxy_remark(&once);
        assert_eq!(once, twice);
        assert_eq!(once, "vless://user@host:443");
    }

    #[test]
    fn differing_fragments_collapse_to_same_identity() {
        let a = strip_proxy_remark("trojan://pw@h:443#A");
        let b = strip_proxy_remark("trojan://pw@h:443#B");
        assert_eq!(a, b);
    }

    #[test]
    fn vmess_ps_field_is_stripped_and_retagged() {
        let inner = serde_json::json!({"add": "1.2.3.4", "port": 443, "ps": "first-tag"});
        let encoded = B64.encode(inner.to_string());
        let uri = format!("vmess://{encoded}");

        let stripped = strip_proxy_remark(&uri);
        assert!(!stripped.contains("first-tag"));

        let mut counter = HashMap::new();
        let tagged = add_clean_remark(&stripped, &mut counter);
        let decoded = decode_uri(&tagged);
        assert_eq!(decoded.tag.as_deref(), Some("vmess-1"));
    }

    #[test]
    fn add_clean_remark_increments_per_protocol() {
        let mut counter = HashMap::new();
        let a = add_clean_remark("ss://x@h:1", &mut counter);
        let b = add_clean_remark("ss://y@h:2", &mut counter);
        let c = add_clean_remark("vless://z@h:3", &mut counter);
        assert!(a.ends_with("#ss-1"));
        assert!(b.ends_with("#ss-2"));
        assert!(c.ends_with("#vless-1"));
    }

    #[test]
    fn extract_proxy_uris_finds_embedded_links() {
        let text = "check this out: vmess://abc123 and also trojan://pw@host:443#x thanks";
        let found = extract_proxy_uris(text);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0], "vmess://abc123");
    }

    #[test]
    fn malformed_base64_falls_back_to_original() {
        let uri = "vmess://not-valid-base64!!!";
        let result = strip_proxy_remark(uri);
        assert_eq!(result, uri);
    }

    #[test]
    fn decode_ss_sip002_form() {
        let userinfo = B64.encode("aes-256-gcm:password");
        let uri = format!("ss://{userinfo}@example.com:8388#tag");
        let entry = decode_uri(&uri);
        assert_eq!(entry.host.as_deref(), Some("example.com"));
        assert_eq!(entry.port, Some(8388));
        assert_eq!(entry.tag.as_deref(), Some("tag"));
    }
}
