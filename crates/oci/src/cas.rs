//! Content-addressed storage for materialized packets.
//!
//! Discipline: one advisory-locked writer per digest, staging directory,
//! atomic rename into `cas/<digest>/payload/`, never a partial entry. Files
//! under a published digest are immutable from then on.

use crate::error::{OciError, Result};
use fs2::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static STAGING_COUNTER: AtomicU64 = AtomicU64::new(0);

pub struct DigestLock {
    file: std::fs::File,
}

impl Drop for DigestLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Acquire the per-digest advisory lock, blocking off the async executor.
pub async fn acquire_digest_lock(lock_path: PathBuf) -> Result<DigestLock> {
    if let Some(parent) = lock_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let lock = tokio::task::spawn_blocking(move || -> Result<DigestLock> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;
        file.lock_exclusive()?;
        Ok(DigestLock { file })
    })
    .await
    .map_err(|err| OciError::Io(std::io::Error::other(format!("join lock task: {err}"))))??;
    Ok(lock)
}

/// A fresh staging directory adjacent to the CAS (same filesystem, so the
/// final publish is a rename, never a copy).
pub fn create_staging_dir(cpm_root: &Path, digest: &str) -> Result<PathBuf> {
    let serial = STAGING_COUNTER.fetch_add(1, Ordering::SeqCst);
    let staging = cpm_root.join("cas").join(".staging").join(format!(
        "{}-{}-{serial}",
        cpm_packet::safe_key(digest),
        std::process::id()
    ));
    std::fs::create_dir_all(&staging)?;
    Ok(staging)
}

/// Validate a staged payload before publication: the packet manifest must
/// be present and no entry may be a symlink.
pub fn validate_staged_payload(staging: &Path) -> Result<()> {
    if !staging.join(cpm_packet::MANIFEST_FILE).exists()
        && !staging.join(cpm_packet::PACKET_METADATA_FILE).exists()
    {
        return Err(OciError::MetadataMissing(format!(
            "pulled artifact has no manifest at {}",
            staging.display()
        )));
    }
    reject_symlinks(staging)?;
    Ok(())
}

fn reject_symlinks(dir: &Path) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_symlink() {
            return Err(OciError::PathUnsafe(format!(
                "symlink in artifact: {}",
                entry.path().display()
            )));
        }
        if file_type.is_dir() {
            reject_symlinks(&entry.path())?;
        }
    }
    Ok(())
}

/// Atomically publish a staged payload. If another writer won the race the
/// staging directory is discarded and the existing entry is kept.
pub fn publish_staged_payload(staging: &Path, payload_dir: &Path) -> Result<()> {
    if let Some(parent) = payload_dir.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if payload_dir.exists() {
        std::fs::remove_dir_all(staging)?;
        return Ok(());
    }
    match std::fs::rename(staging, payload_dir) {
        Ok(()) => Ok(()),
        Err(_) if payload_dir.exists() => {
            std::fs::remove_dir_all(staging)?;
            Ok(())
        }
        Err(err) => {
            let _ = std::fs::remove_dir_all(staging);
            Err(err.into())
        }
    }
}

/// Discard a staging directory after a failed pull; the CAS never keeps a
/// partial entry.
pub fn discard_staging(staging: &Path) {
    if let Err(err) = std::fs::remove_dir_all(staging) {
        if staging.exists() {
            log::warn!("failed to remove staging dir {}: {err}", staging.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn lock_is_exclusive_across_tasks() {
        let tmp = TempDir::new().unwrap();
        let lock_path = tmp.path().join("cas/sha256_x.lock");

        let first = acquire_digest_lock(lock_path.clone()).await.unwrap();

        let contender = tokio::spawn(acquire_digest_lock(lock_path.clone()));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!contender.is_finished(), "second locker should block");

        drop(first);
        contender.await.unwrap().unwrap();
    }

    #[test]
    fn publish_is_atomic_and_race_tolerant() {
        let tmp = TempDir::new().unwrap();
        let payload = tmp.path().join("cas/sha256_x/payload");

        let staging_a = create_staging_dir(tmp.path(), "sha256:x").unwrap();
        std::fs::write(staging_a.join("manifest.json"), "{}\n").unwrap();
        publish_staged_payload(&staging_a, &payload).unwrap();
        assert!(payload.join("manifest.json").exists());
        assert!(!staging_a.exists());

        // Losing writer: existing entry is preserved, staging discarded.
        let staging_b = create_staging_dir(tmp.path(), "sha256:x").unwrap();
        std::fs::write(staging_b.join("manifest.json"), "{\"other\":1}\n").unwrap();
        publish_staged_payload(&staging_b, &payload).unwrap();
        assert_eq!(
            std::fs::read_to_string(payload.join("manifest.json")).unwrap(),
            "{}\n"
        );
        assert!(!staging_b.exists());
    }

    #[test]
    fn validation_requires_manifest() {
        let tmp = TempDir::new().unwrap();
        let staging = create_staging_dir(tmp.path(), "sha256:y").unwrap();
        assert!(matches!(
            validate_staged_payload(&staging),
            Err(OciError::MetadataMissing(_))
        ));
        std::fs::write(staging.join("manifest.json"), "{}\n").unwrap();
        validate_staged_payload(&staging).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn validation_rejects_symlinks() {
        let tmp = TempDir::new().unwrap();
        let staging = create_staging_dir(tmp.path(), "sha256:z").unwrap();
        std::fs::write(staging.join("manifest.json"), "{}\n").unwrap();
        std::os::unix::fs::symlink("/etc/passwd", staging.join("evil")).unwrap();
        assert!(matches!(
            validate_staged_payload(&staging),
            Err(OciError::PathUnsafe(_))
        ));
    }
}
