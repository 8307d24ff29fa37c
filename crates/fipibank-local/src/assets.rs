//! Localize card images into a public directory, addressed by URL hash.

use crate::throttle::Throttle;
use fipibank_core::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub const PUBLIC_PREFIX: &str = "/fipi";
const DEFAULT_EXT: &str = ".png";

/// `{sha256(url)}{ext}`; the extension comes from the URL path, `.png` when there is none.
pub fn asset_file_name(url: &url::Url) -> String {
    let ext = url
        .path_segments()
        .and_then(|mut s| s.next_back())
        .and_then(|last| last.rsplit_once('.'))
        .map(|(_, ext)| ext)
        .filter(|ext| (1..=5).contains(&ext.len()) && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_else(|| DEFAULT_EXT.to_string());
    format!("{}{ext}", crate::sha256_hex(url.as_str().as_bytes()))
}

#[derive(Debug, Clone)]
pub struct AssetStore {
    client: reqwest::Client,
    /// Files land in `{public_dir}/fipi/`.
    public_dir: PathBuf,
}

impl AssetStore {
    pub fn new(public_dir: impl Into<PathBuf>, user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::limited(10))
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Fetch(e.to_string()))?;
        Ok(Self {
            client,
            public_dir: public_dir.into(),
        })
    }

    fn asset_dir(&self) -> PathBuf {
        self.public_dir.join(PUBLIC_PREFIX.trim_start_matches('/'))
    }

    pub fn local_path(&self, url: &url::Url) -> PathBuf {
        self.asset_dir().join(asset_file_name(url))
    }

    /// Download once; returns the public path (`/fipi/<hash><ext>`).
    pub async fn download(&self, raw_url: &str, throttle: &Throttle) -> Result<String> {
        let url = url::Url::parse(raw_url).map_err(|e| Error::InvalidUrl(format!("{raw_url}: {e}")))?;
        let name = asset_file_name(&url);
        let public = format!("{PUBLIC_PREFIX}/{name}");
        let path = self.asset_dir().join(&name);
        if path.exists() {
            debug!(url = %url, "asset already present");
            return Ok(public);
        }

        throttle.wait().await;
        let resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| Error::Fetch(format!("{url}: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Fetch(format!("{url}: HTTP {status}")));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| Error::Fetch(format!("{url}: {e}")))?;
        write_atomic(&path, &bytes).await?;
        Ok(public)
    }

    /// Localize every URL; failures are logged and left out of the result.
    pub async fn localize(&self, urls: &[String], throttle: &Throttle) -> Vec<String> {
        let mut out = Vec::with_capacity(urls.len());
        for u in urls {
            match self.download(u, throttle).await {
                Ok(p) => out.push(p),
                Err(e) => warn!(url = %u, error = %e, "asset download failed"),
            }
        }
        out
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::io(path.display(), "path has no parent directory"))?;
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| Error::io(dir.display(), e))?;
    let tmp = path.with_extension("part");
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| Error::io(tmp.display(), e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| Error::io(path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u(s: &str) -> url::Url {
        url::Url::parse(s).unwrap()
    }

    #[test]
    fn file_name_keeps_a_sane_extension() {
        let name = asset_file_name(&u("https://bank.test/docs/IMG/A1B2.GIF"));
        assert_eq!(name.len(), 64 + 4);
        assert!(name.ends_with(".gif"));
        assert!(asset_file_name(&u("https://bank.test/img?id=5")).ends_with(".png"));
        assert!(asset_file_name(&u("https://bank.test/a.weird-ext!")).ends_with(".png"));
        assert_ne!(
            asset_file_name(&u("https://bank.test/a.png")),
            asset_file_name(&u("https://bank.test/b.png"))
        );
    }

    #[tokio::test]
    async fn present_files_are_not_downloaded_again() {
        let tmp = tempfile::tempdir().unwrap();
        let store = AssetStore::new(tmp.path(), "fipibank-test").unwrap();
        // Unroutable host: any network attempt would fail.
        let url = "http://127.0.0.1:9/pic.png";
        let path = store.local_path(&u(url));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"png").unwrap();

        let throttle = Throttle::new(0.0).with_jitter_ms(0..0);
        let got = store
            .localize(&[url.to_string(), "not a url".to_string()], &throttle)
            .await;
        assert_eq!(got, vec![format!("/fipi/{}", asset_file_name(&u(url)))]);
    }
}
