//! Release check against the GitHub releases API.
//!
//! Best effort throughout: any network, status, parse or file error just
//! means "no update" and is logged at debug level.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use crate::config::UpdateConfig;

const REQUEST_TIMEOUT_SECS: u64 = 10;
const CONNECT_TIMEOUT_SECS: u64 = 5;
const GITHUB_ACCEPT: &str = "application/vnd.github.v3+json";
const USER_AGENT: &str = concat!("tweak-gate/", env!("CARGO_PKG_VERSION"));
const DISMISSED_KEY: &str = "dismissed_version";

/// Subset of the release JSON we care about.
#[derive(Debug, Deserialize)]
struct Release {
    tag_name: String,
    html_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateInfo {
    pub version: String,
    pub url: String,
}

pub struct UpdateChecker {
    client: reqwest::Client,
    releases_url: String,
    prefs_path: PathBuf,
    current_version: String,
}

impl UpdateChecker {
    pub fn new(config: &UpdateConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            releases_url: config.releases_url.clone(),
            prefs_path: config.prefs_path.clone(),
            current_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Returns the latest release when it is newer than this build and
    /// was not dismissed.
    pub async fn check(&self) -> Option<UpdateInfo> {
        let release = match self.fetch().await {
            Ok(release) => release,
            Err(e) => {
                debug!("Update check failed: {e}");
                return None;
            }
        };
        self.evaluate(release)
    }

    async fn fetch(&self) -> reqwest::Result<Release> {
        self.client
            .get(&self.releases_url)
            .header(reqwest::header::ACCEPT, GITHUB_ACCEPT)
            .send()
            .await?
            .error_for_status()?
            .json::<Release>()
            .await
    }

    fn evaluate(&self, release: Release) -> Option<UpdateInfo> {
        let version = release
            .tag_name
            .strip_prefix('v')
            .unwrap_or(&release.tag_name)
            .to_string();

        if !is_newer_version(&self.current_version, &version) {
            debug!(
                "Current version {} is up to date (remote: {version})",
                self.current_version
            );
            return None;
        }
        if self.is_dismissed(&version) {
            debug!("Version {version} was previously dismissed");
            return None;
        }
        if !(release.html_url.starts_with("https://") || release.html_url.starts_with("http://")) {
            debug!("Ignoring release with non-HTTP url: {}", release.html_url);
            return None;
        }

        info!("Version {version} is available: {}", release.html_url);
        Some(UpdateInfo {
            version,
            url: release.html_url,
        })
    }

    pub fn is_dismissed(&self, version: &str) -> bool {
        read_dismissed(&self.prefs_path).as_deref() == Some(version)
    }

    /// Remembers `version` so it is no longer announced. Overwrites any
    /// earlier choice.
    pub fn dismiss(&self, version: &str) {
        let content = format!("# tweak-gate update preferences\n{DISMISSED_KEY}={version}\n");
        if let Some(parent) = self.prefs_path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                debug!("Failed to create {}: {e}", parent.display());
            }
        }
        match std::fs::write(&self.prefs_path, content) {
            Ok(()) => info!("Dismissed version {version}"),
            Err(e) => debug!("Failed to save update preferences: {e}"),
        }
    }
}

fn read_dismissed(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .find_map(|line| {
            let (key, value) = line.split_once('=')?;
            (key.trim() == DISMISSED_KEY).then(|| value.trim().to_string())
        })
}

/// Compares `major.minor.patch`; missing or non-numeric parts count as 0.
pub fn is_newer_version(current: &str, remote: &str) -> bool {
    parse_version(remote) > parse_version(current)
}

fn parse_version(version: &str) -> [u64; 3] {
    let mut parts = [0; 3];
    for (slot, part) in parts.iter_mut().zip(version.split('.')) {
        *slot = part.trim().parse().unwrap_or(0);
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker(prefs_path: PathBuf, current: &str) -> UpdateChecker {
        let config = UpdateConfig {
            enabled: true,
            releases_url: "http://127.0.0.1:9/releases/latest".to_string(),
            prefs_path,
        };
        let mut checker = UpdateChecker::new(&config);
        checker.current_version = current.to_string();
        checker
    }

    fn release(tag: &str) -> Release {
        Release {
            tag_name: tag.to_string(),
            html_url: "https://example.com/release".to_string(),
        }
    }

    // ── version comparison ──────────────────────────────

    #[test]
    fn test_is_newer_version() {
        assert!(is_newer_version("1.0.0", "1.0.1"));
        assert!(is_newer_version("1.9.9", "2.0.0"));
        assert!(is_newer_version("1.0", "1.0.1"));
        assert!(!is_newer_version("1.0.0", "1.0.0"));
        assert!(!is_newer_version("2.0.0", "1.9.9"));
        assert!(!is_newer_version("1.0.0", "1.0.0-beta"));
        assert!(is_newer_version("abc", "0.0.1"));
    }

    // ── release parsing ─────────────────────────────────

    #[test]
    fn test_release_json() {
        let json = r#"{ "tag_name" : "v2.0.0", "html_url": "https://example.com/r", "draft": false }"#;
        let release: Release = serde_json::from_str(json).unwrap();
        assert_eq!(release.tag_name, "v2.0.0");
        assert_eq!(release.html_url, "https://example.com/r");

        assert!(serde_json::from_str::<Release>(r#"{"tag_name": "v1.0.0"}"#).is_err());
    }

    #[test]
    fn test_evaluate_strips_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let checker = checker(dir.path().join("prefs"), "1.0.0");

        let info = checker.evaluate(release("v1.2.3")).unwrap();
        assert_eq!(info.version, "1.2.3");
        assert_eq!(info.url, "https://example.com/release");

        assert!(checker.evaluate(release("1.0.0")).is_none());
    }

    #[test]
    fn test_evaluate_rejects_odd_urls() {
        let dir = tempfile::tempdir().unwrap();
        let checker = checker(dir.path().join("prefs"), "1.0.0");
        let mut odd = release("v9.0.0");
        odd.html_url = "file:///etc/passwd".to_string();
        assert!(checker.evaluate(odd).is_none());
    }

    // ── dismissal ───────────────────────────────────────

    #[test]
    fn test_dismiss_suppresses_version() {
        let dir = tempfile::tempdir().unwrap();
        let checker = checker(dir.path().join("nested").join("prefs"), "1.0.0");

        assert!(!checker.is_dismissed("1.2.3"));
        checker.dismiss("1.2.3");
        assert!(checker.is_dismissed("1.2.3"));
        assert!(checker.evaluate(release("v1.2.3")).is_none());
        // A newer release is announced again
        assert!(checker.evaluate(release("v1.2.4")).is_some());

        checker.dismiss("1.2.4");
        assert!(!checker.is_dismissed("1.2.3"));
        assert!(checker.is_dismissed("1.2.4"));
    }

    #[test]
    fn test_reads_properties_style_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs");
        std::fs::write(&path, "#PleaseTweakWindows update preferences\n#Mon\ndismissed_version=3.1.0\n")
            .unwrap();
        assert_eq!(read_dismissed(&path).as_deref(), Some("3.1.0"));
        assert_eq!(read_dismissed(&dir.path().join("missing")), None);
    }

    #[tokio::test]
    async fn test_check_unreachable_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let checker = checker(dir.path().join("prefs"), "1.0.0");
        assert!(checker.check().await.is_none());
    }
}
