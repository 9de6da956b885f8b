//! External artifact source: where a published binary release comes from.
//!
//! The core treats the source as opaque; it only needs the latest version
//! string and a way to download the latest binary to a path. The shipped
//! implementation talks to the GitHub releases API.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::fsutil;

const API_TIMEOUT: Duration = Duration::from_secs(30);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("artifact request failed: {0}")]
    Request(String),
    #[error("artifact source returned status {0}")]
    Status(u16),
    #[error("no release asset matches {os}/{arch}")]
    NoMatchingAsset { os: &'static str, arch: &'static str },
    #[error("artifact I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Opaque source of published binary releases.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Version string of the latest published release.
    async fn get_latest_version(&self) -> Result<String, ArtifactError>;

    /// Download the latest release binary to `dest` and mark it executable.
    async fn download_latest(&self, dest: &Path) -> Result<(), ArtifactError>;
}

#[derive(Debug, Deserialize)]
struct Release {
    tag_name: String,
    #[serde(default)]
    assets: Vec<Asset>,
}

#[derive(Debug, Deserialize)]
struct Asset {
    name: String,
    browser_download_url: String,
}

/// GitHub releases implementation.
pub struct GitHubReleases {
    client: reqwest::Client,
    owner: String,
    repo: String,
}

impl GitHubReleases {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(API_TIMEOUT)
            .user_agent("vigil")
            .build()
            .unwrap_or_default();
        Self {
            client,
            owner: owner.into(),
            repo: repo.into(),
        }
    }

    async fn latest_release(&self) -> Result<Release, ArtifactError> {
        let url = format!(
            "https://api.github.com/repos/{}/{}/releases/latest",
            self.owner, self.repo
        );
        let resp = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.github.v3+json")
            .send()
            .await
            .map_err(|e| ArtifactError::Request(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ArtifactError::Status(resp.status().as_u16()));
        }
        resp.json::<Release>()
            .await
            .map_err(|e| ArtifactError::Request(e.to_string()))
    }

    /// Pick the asset built for this platform by os/arch substring match
    /// (release assets are named like `vigil_0.3.0_linux_x86_64`).
    fn matching_asset(release: &Release) -> Result<&Asset, ArtifactError> {
        let os = std::env::consts::OS;
        let arch = std::env::consts::ARCH;
        release
            .assets
            .iter()
            .find(|a| a.name.contains(os) && a.name.contains(arch))
            .ok_or(ArtifactError::NoMatchingAsset { os, arch })
    }
}

#[async_trait]
impl ArtifactSource for GitHubReleases {
    async fn get_latest_version(&self) -> Result<String, ArtifactError> {
        let release = self.latest_release().await?;
        Ok(release
            .tag_name
            .strip_prefix('v')
            .unwrap_or(&release.tag_name)
            .to_string())
    }

    async fn download_latest(&self, dest: &Path) -> Result<(), ArtifactError> {
        let release = self.latest_release().await?;
        let asset = Self::matching_asset(&release)?;
        info!(asset = %asset.name, tag = %release.tag_name, "downloading release asset");

        let resp = self
            .client
            .get(&asset.browser_download_url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await
            .map_err(|e| ArtifactError::Request(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ArtifactError::Status(resp.status().as_u16()));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ArtifactError::Request(e.to_string()))?;

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        fsutil::atomic_write(dest, &bytes)?;
        fsutil::mark_executable(dest)?;
        Ok(())
    }
}

/// Download the latest release into a fresh temp directory, returning the
/// binary path. Caller owns cleanup of the parent directory.
pub async fn download_to_temp(source: &dyn ArtifactSource) -> Result<PathBuf, ArtifactError> {
    let dir = std::env::temp_dir().join(format!("vigil-fetch-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir)?;
    let dest = dir.join("vigil");
    match source.download_latest(&dest).await {
        Ok(()) => Ok(dest),
        Err(e) => {
            let _ = std::fs::remove_dir_all(&dir);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn release(assets: &[&str]) -> Release {
        Release {
            tag_name: "v1.2.3".into(),
            assets: assets
                .iter()
                .map(|n| Asset {
                    name: n.to_string(),
                    browser_download_url: format!("https://example.invalid/{n}"),
                })
                .collect(),
        }
    }

    #[test]
    fn asset_matching_uses_os_and_arch() {
        let os = std::env::consts::OS;
        let arch = std::env::consts::ARCH;
        let named = format!("vigil_1.2.3_{os}_{arch}.bin");
        let rel = release(&["vigil_1.2.3_other_mips.bin", &named]);
        assert_eq!(GitHubReleases::matching_asset(&rel).unwrap().name, named);
    }

    #[test]
    fn no_matching_asset_is_an_error() {
        let rel = release(&["vigil_1.2.3_plan9_mips.bin"]);
        assert!(matches!(
            GitHubReleases::matching_asset(&rel),
            Err(ArtifactError::NoMatchingAsset { .. })
        ));
    }
}
