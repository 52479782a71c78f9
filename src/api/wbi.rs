//! WBI query-string signing.
//!
//! A subset of the web API requires a `w_rid` parameter: the MD5 hex digest
//! of the sorted, urlencoded query concatenated with a mixin key. The mixin
//! is derived from two rotating server-issued key halves by a fixed 64-entry
//! permutation.

use std::time::Instant;

use md5::{Digest, Md5};

use crate::settings::WBI_KEY_MAX_AGE;

/// Fixed permutation applied to `img_key || sub_key`; only the first 32
/// output bytes form the mixin.
const MIXIN_KEY_ENC_TAB: [usize; 64] = [
    46, 47, 18, 2, 53, 8, 23, 32, 15, 50, 10, 31, 58, 3, 45, 35, 27, 43, 5, 49, 33, 9, 42, 19, 29,
    28, 14, 39, 12, 38, 41, 13, 37, 48, 7, 16, 24, 55, 40, 61, 26, 17, 0, 1, 60, 51, 30, 4, 22,
    25, 54, 21, 56, 59, 6, 63, 57, 62, 11, 36, 20, 34, 44, 52,
];

/// Characters the signer strips from parameter values before encoding.
const UNWANTED_CHARS: [char; 5] = ['!', '\'', '(', ')', '*'];

#[derive(Debug, Default)]
pub struct WbiKeys {
    pub img_key: String,
    pub sub_key: String,
    mixin: String,
    last_update: Option<Instant>,
}

impl WbiKeys {
    /// True when the keys have never been fetched or have aged out.
    pub fn is_stale(&self) -> bool {
        match self.last_update {
            Some(at) => at.elapsed() >= WBI_KEY_MAX_AGE,
            None => true,
        }
    }

    /// Install fresh key halves and derive the mixin.
    pub fn set_keys(&mut self, img_key: String, sub_key: String) {
        self.img_key = img_key;
        self.sub_key = sub_key;
        self.mixin = mixin_key(&self.img_key, &self.sub_key);
        self.last_update = Some(Instant::now());
    }

    /// Sign the given parameters, returning the complete encoded query string
    /// including `wts` and `w_rid`.
    pub fn sign(&self, params: &[(&str, String)], wts: i64) -> String {
        let mut pairs: Vec<(String, String)> = params
            .iter()
            .map(|(k, v)| {
                let cleaned: String = v.chars().filter(|c| !UNWANTED_CHARS.contains(c)).collect();
                (k.to_string(), cleaned)
            })
            .collect();
        pairs.push(("wts".to_string(), wts.to_string()));
        pairs.sort();

        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in &pairs {
            serializer.append_pair(k, v);
        }
        let query = serializer.finish();

        let mut hasher = Md5::new();
        hasher.update(query.as_bytes());
        hasher.update(self.mixin.as_bytes());
        let w_rid = hex_string(&hasher.finalize());

        format!("{}&w_rid={}", query, w_rid)
    }
}

fn mixin_key(img_key: &str, sub_key: &str) -> String {
    let concat: Vec<u8> = img_key.bytes().chain(sub_key.bytes()).collect();
    MIXIN_KEY_ENC_TAB[..32]
        .iter()
        .map(|&i| concat[i] as char)
        .collect()
}

fn hex_string(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys_from(img: &str, sub: &str) -> WbiKeys {
        let mut keys = WbiKeys::default();
        keys.set_keys(img.to_string(), sub.to_string());
        keys
    }

    #[test]
    fn test_mixin_applies_permutation() {
        // Synthetic 64-char concat where every position holds a distinct
        // character, so each output byte pins one table entry.
        let concat = "0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ!@";
        let (img, sub) = concat.split_at(32);

        assert_eq!(mixin_key(img, sub), "KLi2R8nwfOavW3JzrH5Nx9GjtseDcCFd");
    }

    #[test]
    fn test_fresh_keys_are_stale() {
        assert!(WbiKeys::default().is_stale());
    }

    #[test]
    fn test_set_keys_clears_staleness() {
        let keys = keys_from("7cd084941338484aae1ad9425b84077c", "4932caff0ff746eab6f01bf08b70ac45");
        assert!(!keys.is_stale());
    }

    #[test]
    fn test_sign_is_deterministic_and_order_independent() {
        let keys = keys_from("7cd084941338484aae1ad9425b84077c", "4932caff0ff746eab6f01bf08b70ac45");

        let a = keys.sign(&[("foo", "114".to_string()), ("bar", "514".to_string())], 1702204169);
        let b = keys.sign(&[("bar", "514".to_string()), ("foo", "114".to_string())], 1702204169);

        assert_eq!(a, b);
        assert!(a.starts_with("bar=514&foo=114&wts=1702204169&w_rid="));
    }

    #[test]
    fn test_sign_produces_32_hex_digest() {
        let keys = keys_from("7cd084941338484aae1ad9425b84077c", "4932caff0ff746eab6f01bf08b70ac45");

        let query = keys.sign(&[("mid", "42".to_string())], 1702204169);
        let w_rid = query.rsplit("w_rid=").next().unwrap();

        assert_eq!(w_rid.len(), 32);
        assert!(w_rid.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn test_sign_strips_unwanted_chars() {
        let keys = keys_from("7cd084941338484aae1ad9425b84077c", "4932caff0ff746eab6f01bf08b70ac45");

        let query = keys.sign(&[("name", "a!b'c(d)e*f".to_string())], 1);
        assert!(query.starts_with("name=abcdef&wts=1&"));
    }
}
