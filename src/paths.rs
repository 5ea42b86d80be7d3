//! Mirror directory layout under the user cache root.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Versioned namespace; bumped whenever the on-disk mirror format changes so
/// that old directories are simply abandoned instead of migrated.
pub const CACHE_NAMESPACE: &str = "gitv4";

const BASE32_ALPHABET: &[u8; 32] = b"0123456789abcdfghijklmnpqrsvwxyz";

/// Base32-render a byte string with the store alphabet (no padding).
pub fn to_base32(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len().div_ceil(5) * 8);
    let mut buffer: u32 = 0;
    let mut bits = 0u32;
    for &byte in bytes {
        buffer = (buffer << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

/// Stable hash of a URL, usable as a directory name.
pub fn url_hash(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    to_base32(&hasher.finalize())
}

/// Deterministic mirror directory for a URL. Pure: the directory is not
/// created here.
pub fn mirror_dir(cache_root: &Path, url: &str) -> PathBuf {
    cache_root.join(CACHE_NAMESPACE).join(url_hash(url))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn mirror_dir_is_deterministic() {
        let root = Path::new("/cache");
        let a = mirror_dir(root, "https://example.org/repo.git");
        let b = mirror_dir(root, "https://example.org/repo.git");
        assert_eq!(a, b);
        assert!(a.starts_with("/cache/gitv4"));
    }

    #[test]
    fn different_urls_get_different_mirrors() {
        let root = Path::new("/cache");
        assert_ne!(
            mirror_dir(root, "https://example.org/a.git"),
            mirror_dir(root, "https://example.org/b.git")
        );
    }

    #[test]
    fn base32_of_sha256_is_52_chars() {
        assert_eq!(url_hash("anything").len(), 52);
    }

    #[test]
    fn base32_uses_store_alphabet_only() {
        let encoded = url_hash("https://example.org/repo.git");
        assert!(encoded
            .bytes()
            .all(|b| BASE32_ALPHABET.contains(&b)));
    }
}
