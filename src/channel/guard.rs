//! Forbidden secret-field scan for outbound payloads.
//!
//! Keys are compared after lowercasing and stripping `_` and `-`, so
//! `private_key`, `privateKey` and `PRIVATE-KEY` all hit the same entry.

use serde_json::Value;

/// Normalized names of fields that must never cross a context boundary
pub const FORBIDDEN_SECRET_FIELDS: &[&str] = &[
    "privatekey",
    "nearprivatekey",
    "secretkey",
    "vrfsecretkey",
    "vrfprivatekey",
    "vrfkeypairbytes",
    "signingkey",
    "prfoutput",
    "seed",
    "seedphrase",
    "mnemonic",
    "kek",
];

/// Lowercase and drop separators
pub fn normalize_field_name(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(|c| c.to_lowercase())
        .collect()
}

pub fn is_forbidden_field(name: &str) -> bool {
    let normalized = normalize_field_name(name);
    FORBIDDEN_SECRET_FIELDS.contains(&normalized.as_str())
}

/// Path of the first forbidden key found, depth first, rooted at `payload`
pub fn find_forbidden_field(payload: &Value) -> Option<String> {
    scan(payload, "payload")
}

fn scan(value: &Value, path: &str) -> Option<String> {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let child_path = format!("{}.{}", path, key);
                if is_forbidden_field(key) {
                    return Some(child_path);
                }
                if let Some(hit) = scan(child, &child_path) {
                    return Some(hit);
                }
            }
            None
        }
        Value::Array(items) => items
            .iter()
            .enumerate()
            .find_map(|(i, item)| scan(item, &format!("{}[{}]", path, i))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalization() {
        assert!(is_forbidden_field("privateKey"));
        assert!(is_forbidden_field("private_key"));
        assert!(is_forbidden_field("PRIVATE-KEY"));
        assert!(is_forbidden_field("Vrf_Secret_Key"));
        assert!(!is_forbidden_field("encryptedPrivateKey"));
        assert!(!is_forbidden_field("kek_s_b64u"));
    }

    #[test]
    fn test_nested_object_and_array() {
        let payload = json!({
            "accountId": "alice.near",
            "keys": [
                {"publicKey": "ed25519:abc"},
                {"meta": {"near_private_key": "ed25519:secret"}}
            ]
        });
        assert_eq!(
            find_forbidden_field(&payload).as_deref(),
            Some("payload.keys[1].meta.near_private_key")
        );
    }

    #[test]
    fn test_clean_payload() {
        let payload = json!({
            "accountId": "alice.near",
            "encryptedVrfKeypair": {"encryptedVrfDataB64u": "AAAA", "chacha20NonceB64u": "BBBB"},
            "credential": {"id": "cred", "prf": {"first": "CCCC"}}
        });
        assert!(find_forbidden_field(&payload).is_none());
        assert!(find_forbidden_field(&json!(null)).is_none());
    }
}
