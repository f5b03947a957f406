use base64::Engine;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha1::Sha1;
use std::time::{SystemTime, UNIX_EPOCH};

// ─── TURN long-term credentials ─────────────────────────────────────────────
//
// Room rows carry an opaque `ice_servers_json` array. Entries may embed a
// shared TURN secret under `__turn_secret__` (plus an optional
// `__turn_ttl__`, seconds). Before an entry reaches a client the server
// mints an ephemeral long-term credential from the secret and strips the
// private fields:
//
//   username   = "<now + ttl>:soundcast"
//   credential = base64( HMAC-SHA1( secret, username ) )
//
// This is the coturn `use-auth-secret` convention — the relay recomputes the
// HMAC from the same shared secret and rejects expired usernames.

type HmacSha1 = Hmac<Sha1>;

const TURN_SECRET_FIELD: &str = "__turn_secret__";
const TURN_TTL_FIELD: &str = "__turn_ttl__";
const DEFAULT_TURN_TTL_SECS: u64 = 86_400;
const TURN_USERNAME_SUFFIX: &str = "soundcast";

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs()
}

/// Mint a `(username, credential)` pair from a shared TURN secret.
pub fn ephemeral_credential(secret: &str, ttl_secs: u64, now: u64) -> (String, String) {
    let username = format!("{}:{}", now + ttl_secs, TURN_USERNAME_SUFFIX);
    let mut mac =
        HmacSha1::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(username.as_bytes());
    let credential = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
    (username, credential)
}

/// Resolve a room's raw ICE server list into the client-safe form.
///
/// Entries carrying `__turn_secret__` get an ephemeral credential; the
/// secret fields never leave the server. Entries without a secret pass
/// through untouched. Non-object entries are dropped.
pub fn resolve_ice_servers(raw: &Value) -> Vec<Value> {
    let Some(entries) = raw.as_array() else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| {
            let mut obj = entry.as_object()?.clone();
            if let Some(secret) = obj.get(TURN_SECRET_FIELD).and_then(Value::as_str) {
                let ttl = obj
                    .get(TURN_TTL_FIELD)
                    .and_then(Value::as_u64)
                    .unwrap_or(DEFAULT_TURN_TTL_SECS);
                let (username, credential) = ephemeral_credential(secret, ttl, unix_now());
                obj.insert("username".into(), Value::String(username));
                obj.insert("credential".into(), Value::String(credential));
            }
            obj.remove(TURN_SECRET_FIELD);
            obj.remove(TURN_TTL_FIELD);
            Some(Value::Object(obj))
        })
        .collect()
}

// ─── SFU URL rewriting for secure origins ───────────────────────────────────

/// Rewrite a room's advertised SFU URL for a client that connected over
/// HTTPS: `ws://` becomes `wss://` and an explicit HTTP port is substituted
/// with the HTTPS port.
pub fn rewrite_sfu_url_for_tls(sfu_url: &str, http_port: u16, https_port: u16) -> String {
    let Some(rest) = sfu_url.strip_prefix("ws://") else {
        return sfu_url.to_string();
    };
    let http_suffix = format!(":{http_port}");
    let rewritten = match rest.find('/') {
        Some(idx) => {
            let (authority, path) = rest.split_at(idx);
            format!(
                "{}{}",
                authority.replace(&http_suffix, &format!(":{https_port}")),
                path
            )
        }
        None => rest.replace(&http_suffix, &format!(":{https_port}")),
    };
    format!("wss://{rewritten}")
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn credential_matches_reference_hmac() {
        // Fixed inputs so the digest is reproducible.
        let (username, credential) = ephemeral_credential("north", 600, 1_700_000_000);
        assert_eq!(username, "1700000600:soundcast");

        let mut mac = HmacSha1::new_from_slice(b"north").unwrap();
        mac.update(username.as_bytes());
        let expected =
            base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
        assert_eq!(credential, expected);
    }

    #[test]
    fn zero_ttl_username_prefix_is_now() {
        let now = unix_now();
        let (username, _) = ephemeral_credential("s", 0, now);
        let prefix: u64 = username.split(':').next().unwrap().parse().unwrap();
        assert_eq!(prefix, now);
    }

    #[test]
    fn secret_fields_are_stripped() {
        let raw = json!([
            { "urls": "stun:stun.example.org:3478" },
            {
                "urls": "turn:turn.example.org:3478",
                "__turn_secret__": "shh",
                "__turn_ttl__": 120
            }
        ]);

        let resolved = resolve_ice_servers(&raw);
        assert_eq!(resolved.len(), 2);

        // The STUN entry is untouched.
        assert!(resolved[0].get("username").is_none());

        // The TURN entry gained credentials and lost the secret.
        let turn = resolved[1].as_object().unwrap();
        assert!(turn.get(TURN_SECRET_FIELD).is_none());
        assert!(turn.get(TURN_TTL_FIELD).is_none());
        assert!(turn["username"].as_str().unwrap().ends_with(":soundcast"));
        assert!(!turn["credential"].as_str().unwrap().is_empty());
    }

    #[test]
    fn non_array_input_yields_empty() {
        assert!(resolve_ice_servers(&json!("not an array")).is_empty());
        assert!(resolve_ice_servers(&json!(null)).is_empty());
    }

    #[test]
    fn rewrites_ws_to_wss_with_port_substitution() {
        assert_eq!(
            rewrite_sfu_url_for_tls("ws://sfu.example.org:3000/ws", 3000, 3443),
            "wss://sfu.example.org:3443/ws"
        );
        // No explicit port — scheme only.
        assert_eq!(
            rewrite_sfu_url_for_tls("ws://sfu.example.org/ws", 3000, 3443),
            "wss://sfu.example.org/ws"
        );
        // Already secure — untouched.
        assert_eq!(
            rewrite_sfu_url_for_tls("wss://sfu.example.org/ws", 3000, 3443),
            "wss://sfu.example.org/ws"
        );
    }

    #[test]
    fn port_in_path_is_not_rewritten() {
        assert_eq!(
            rewrite_sfu_url_for_tls("ws://sfu.example.org:3000/ws/:3000", 3000, 3443),
            "wss://sfu.example.org:3443/ws/:3000"
        );
    }
}
