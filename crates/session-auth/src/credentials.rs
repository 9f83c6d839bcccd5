//! Credential pair and its on-disk file
//!
//! The file holds a single JSON object with the well-known keys
//! `access_token`, `refresh_token` and `expires_at`. All writes use atomic
//! temp-file + rename to prevent corruption on crash, and the file is created
//! with 0600 permissions since it contains bearer tokens.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::Secret;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// The session's credential pair.
///
/// `expires_at` is a unix timestamp in milliseconds (absolute, not a delta),
/// or `None` when the server did not say how long the access token lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Bearer token for API calls and the channel handshake
    pub access_token: Secret<String>,
    /// Token exchanged for a new pair on refresh
    pub refresh_token: Secret<String>,
    /// Expiration as unix timestamp in milliseconds
    #[serde(default)]
    pub expires_at: Option<u64>,
}

impl Credential {
    pub fn new(
        access_token: impl Into<Secret<String>>,
        refresh_token: impl Into<Secret<String>>,
        expires_at: Option<u64>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_at,
        }
    }

    /// Seed credential holding only a refresh token. It is already expired,
    /// so the first request refreshes before dispatch.
    pub fn from_refresh_token(refresh_token: impl Into<Secret<String>>) -> Self {
        Self::new(String::new(), refresh_token, Some(0))
    }

    pub fn has_access_token(&self) -> bool {
        !self.access_token.is_empty()
    }

    pub fn has_refresh_token(&self) -> bool {
        !self.refresh_token.is_empty()
    }

    /// Whether the access token expires within `skew` of `now_ms`.
    /// A credential without an expiry never counts as expiring.
    pub fn expires_within_at(&self, skew: Duration, now_ms: u64) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now_ms.saturating_add(skew.as_millis() as u64),
            None => false,
        }
    }

    /// `expires_within_at` against the wall clock.
    pub fn expires_within(&self, skew: Duration) -> bool {
        self.expires_within_at(skew, now_millis())
    }
}

/// Current wall-clock time as unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The credential file on disk.
///
/// Writers are serialized by the owning `TokenStore`; this type only knows
/// how to read, replace and remove the file.
#[derive(Debug, Clone)]
pub struct CredentialFile {
    path: PathBuf,
}

impl CredentialFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored credential. A missing file is a cold start, not an
    /// error.
    pub async fn read(&self) -> Result<Option<Credential>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "credential file not found, starting logged out");
                return Ok(None);
            }
            Err(e) => return Err(Error::Io(format!("reading credential file: {e}"))),
        };
        if contents.trim().is_empty() {
            return Ok(None);
        }
        let credential: Credential = serde_json::from_str(&contents)
            .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))?;
        info!(
            path = %self.path.display(),
            expires_at = ?credential.expires_at,
            "loaded credential"
        );
        Ok(Some(credential))
    }

    /// Replace the stored credential atomically.
    pub async fn write(&self, credential: &Credential) -> Result<()> {
        write_atomic(&self.path, credential).await
    }

    /// Delete the stored credential. Removing a missing file succeeds.
    pub async fn remove(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "removed credential file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(format!("removing credential file: {e}"))),
        }
    }
}

/// Write the credential to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Sets file permissions to 0600 (owner read/write only).
async fn write_atomic(path: &Path, credential: &Credential) -> Result<()> {
    let json = serde_json::to_string_pretty(credential)
        .map_err(|e| Error::CredentialParse(format!("serializing credential: {e}")))?;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    let tmp_path = dir.join(format!(".credentials.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credential");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_credential(suffix: &str) -> Credential {
        Credential::new(
            format!("at_{suffix}"),
            format!("rt_{suffix}"),
            Some(1735500000000),
        )
    }

    #[tokio::test]
    async fn roundtrip_write_read() {
        let dir = tempfile::tempdir().unwrap();
        let file = CredentialFile::new(dir.path().join("credentials.json"));

        file.write(&test_credential("1")).await.unwrap();

        let loaded = file.read().await.unwrap().unwrap();
        assert_eq!(loaded.access_token.as_str(), "at_1");
        assert_eq!(loaded.refresh_token.as_str(), "rt_1");
        assert_eq!(loaded.expires_at, Some(1735500000000));
    }

    #[tokio::test]
    async fn file_uses_well_known_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        CredentialFile::new(&path)
            .write(&test_credential("1"))
            .await
            .unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(value["access_token"], "at_1");
        assert_eq!(value["refresh_token"], "rt_1");
        assert_eq!(value["expires_at"], 1735500000000u64);
    }

    #[tokio::test]
    async fn missing_file_is_cold_start() {
        let dir = tempfile::tempdir().unwrap();
        let file = CredentialFile::new(dir.path().join("credentials.json"));
        assert!(file.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        tokio::fs::write(&path, "{not json").await.unwrap();

        let err = CredentialFile::new(&path).read().await.unwrap_err();
        assert!(matches!(err, Error::CredentialParse(_)));
    }

    #[tokio::test]
    async fn remove_deletes_and_tolerates_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let file = CredentialFile::new(&path);

        file.write(&test_credential("1")).await.unwrap();
        assert!(path.exists());
        file.remove().await.unwrap();
        assert!(!path.exists());
        file.remove().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        CredentialFile::new(&path)
            .write(&test_credential("1"))
            .await
            .unwrap();

        let metadata = tokio::fs::metadata(&path).await.unwrap();
        let mode = metadata.permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "credential file must be 0600, got {mode:o}");
    }

    #[test]
    fn expiry_window() {
        let credential = Credential::new("at", "rt", Some(10_000));
        assert!(!credential.expires_within_at(Duration::from_secs(5), 4_000));
        assert!(credential.expires_within_at(Duration::from_secs(5), 5_000));
        assert!(credential.expires_within_at(Duration::ZERO, 10_000));

        let no_expiry = Credential::new("at", "rt", None);
        assert!(!no_expiry.expires_within_at(Duration::from_secs(3600), u64::MAX - 1));
    }

    #[test]
    fn seed_credential_is_expired_without_access_token() {
        let seed = Credential::from_refresh_token("rt_seed");
        assert!(!seed.has_access_token());
        assert!(seed.has_refresh_token());
        assert!(seed.expires_within(Duration::ZERO));
    }

    #[test]
    fn debug_redacts_tokens() {
        let debug = format!("{:?}", test_credential("secret"));
        assert!(!debug.contains("at_secret"));
        assert!(!debug.contains("rt_secret"));
    }
}
