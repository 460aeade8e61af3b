//! Stable Host identity.
//!
//! The agent advertises an 8-digit decimal Host ID. Clients must present it
//! to create a session. The ID is persisted at `{data_dir}/host-id` in the
//! canonical form `Host ID: NNNNNNNN\n`; a bare `NNNNNNNN` line is accepted
//! on read. Rotation writes a fresh ID and the caller invalidates every
//! session in the same step.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand_core::{OsRng, RngCore};
use tokio::sync::RwLock;
use tracing::info;

const FILE_NAME: &str = "host-id";
const PREFIX: &str = "Host ID: ";

pub struct HostIdentity {
    path: PathBuf,
    current: RwLock<String>,
}

impl HostIdentity {
    /// Read the persisted Host ID, generating and writing one on first run.
    pub fn load_or_create(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(FILE_NAME);

        if let Ok(contents) = std::fs::read_to_string(&path) {
            if let Some(id) = parse_host_id(&contents) {
                return Ok(Self {
                    path,
                    current: RwLock::new(id),
                });
            }
        }

        let id = generate_host_id();
        persist(&path, &id)?;
        info!(host_id = %id, "generated new host identity");
        Ok(Self {
            path,
            current: RwLock::new(id),
        })
    }

    pub async fn current(&self) -> String {
        self.current.read().await.clone()
    }

    pub async fn matches(&self, candidate: &str) -> bool {
        *self.current.read().await == candidate.trim()
    }

    /// Replace the Host ID on disk and in memory, returning the new value.
    /// The caller must invalidate all sessions in the same operation.
    pub async fn rotate(&self) -> Result<String> {
        let id = generate_host_id();
        persist(&self.path, &id)?;
        let mut guard = self.current.write().await;
        let old = std::mem::replace(&mut *guard, id.clone());
        info!(old = %old, new = %id, "host identity rotated");
        Ok(id)
    }
}

/// Accepts `Host ID: NNNNNNNN` or a bare `NNNNNNNN` first line.
fn parse_host_id(contents: &str) -> Option<String> {
    let line = contents.lines().next()?.trim();
    let digits = line.strip_prefix(PREFIX).unwrap_or(line).trim();
    if digits.len() == 8 && digits.bytes().all(|b| b.is_ascii_digit()) {
        Some(digits.to_string())
    } else {
        None
    }
}

fn generate_host_id() -> String {
    format!("{:08}", OsRng.next_u32() % 100_000_000)
}

/// Write the canonical form with owner-only permissions from the start, so
/// there is no window where the file is world-readable.
fn persist(path: &Path, id: &str) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    let body = format!("{PREFIX}{id}\n");

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        f.write_all(body.as_bytes())?;
    }
    #[cfg(not(unix))]
    std::fs::write(path, &body).with_context(|| format!("failed to write {}", path.display()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_eight_decimal_digits() {
        let id = generate_host_id();
        assert_eq!(id.len(), 8);
        assert!(id.bytes().all(|b| b.is_ascii_digit()));
    }

    #[test]
    fn parses_canonical_and_bare_forms() {
        assert_eq!(
            parse_host_id("Host ID: 27539093\n"),
            Some("27539093".into())
        );
        assert_eq!(parse_host_id("27539093\n"), Some("27539093".into()));
        assert_eq!(parse_host_id("27539093"), Some("27539093".into()));
        assert!(parse_host_id("Host ID: 123\n").is_none());
        assert!(parse_host_id("not-a-host-id\n").is_none());
        assert!(parse_host_id("").is_none());
    }

    #[tokio::test]
    async fn load_persists_and_rereads_same_id() {
        let dir = tempfile::tempdir().unwrap();
        let first = HostIdentity::load_or_create(dir.path()).unwrap();
        let id = first.current().await;
        drop(first);

        let contents = std::fs::read_to_string(dir.path().join(FILE_NAME)).unwrap();
        assert_eq!(contents, format!("Host ID: {id}\n"));

        let second = HostIdentity::load_or_create(dir.path()).unwrap();
        assert_eq!(second.current().await, id);
    }

    #[tokio::test]
    async fn rotation_changes_id_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let identity = HostIdentity::load_or_create(dir.path()).unwrap();
        let before = identity.current().await;
        let after = identity.rotate().await.unwrap();
        assert_ne!(before, after);
        assert!(identity.matches(&after).await);
        assert!(!identity.matches(&before).await);

        let contents = std::fs::read_to_string(dir.path().join(FILE_NAME)).unwrap();
        assert_eq!(contents, format!("Host ID: {after}\n"));
    }
}
