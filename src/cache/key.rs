use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Deterministic cache key for `base` and a set of request parameters.
///
/// Parameters are sorted before hashing, so insertion order never changes
/// the key.
pub fn cache_key<I, K, V>(base: &str, params: I) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let sorted: BTreeMap<String, String> = params
        .into_iter()
        .map(|(k, v)| (k.as_ref().to_string(), v.as_ref().to_string()))
        .collect();

    let mut hasher = Sha256::new();
    for (k, v) in &sorted {
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.as_bytes());
        hasher.update(b"&");
    }
    let digest = hex::encode(hasher.finalize());
    format!("{}_{}", base, &digest[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_order_does_not_matter() {
        let a = cache_key("lastfm_recent", [("user", "rj"), ("limit", "10")]);
        let b = cache_key("lastfm_recent", [("limit", "10"), ("user", "rj")]);
        assert_eq!(a, b);
        assert!(a.starts_with("lastfm_recent_"));
    }

    #[test]
    fn different_parameters_give_different_keys() {
        let a = cache_key("trakt_history", [("limit", "10")]);
        let b = cache_key("trakt_history", [("limit", "11")]);
        assert_ne!(a, b);
    }

    #[test]
    fn empty_parameters_are_allowed() {
        let key = cache_key::<[(&str, &str); 0], _, _>("trakt_watching", []);
        assert_eq!(key.len(), "trakt_watching_".len() + 16);
    }
}
