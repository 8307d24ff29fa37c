use sha2::{Digest, Sha256};

pub mod assets;
pub mod classify;
pub mod coverage;
pub mod crawl;
pub mod curate;
pub mod extract;
pub mod identity;
pub mod relabel;
pub mod render_playwright;
pub mod sanitize;
pub mod store;
pub mod taxonomy;
pub mod textprep;
pub mod throttle;

pub use store::checksum;

pub(crate) fn env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub(crate) fn env_u64(key: &str, default: u64) -> u64 {
    env(key)
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(default)
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(bytes);
    hex::encode(h.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_content_sensitive() {
        let assets = vec!["https://x/a.png".to_string()];
        assert_eq!(checksum("<p>1</p>", &assets), checksum("<p>1</p>", &assets));
        assert_ne!(checksum("<p>1</p>", &assets), checksum("<p>2</p>", &assets));
        assert_ne!(checksum("<p>1</p>", &assets), checksum("<p>1</p>", &[]));
    }

    #[test]
    fn checksum_field_boundaries_are_unambiguous() {
        assert_ne!(checksum("ab", &["c".to_string()]), checksum("a", &["bc".to_string()]));
    }

    #[test]
    fn sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
