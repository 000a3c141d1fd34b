use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

const KEY_MAX_CHARS: usize = 48;
const FALLBACK_KEY: &str = "articles";

const SYNC_POLL_ATTEMPTS: usize = 10;
const SYNC_POLL_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("destination {path:?} already exists (pass overwrite to replace it)")]
    Conflict { path: PathBuf },
    #[error("artifact write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("sidecar encoding failed: {0}")]
    Sidecar(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct PersistOptions {
    pub out_dir: PathBuf,
    pub overwrite: bool,
}

/// Audit metadata written next to the artifact so `inspect` never has to
/// open the EPUB itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sidecar {
    pub created_at: DateTime<Utc>,
    pub source_domain: String,
    pub article_count: usize,
    pub size_bytes: u64,
    pub title: String,
    pub generated_by: String,
}

#[derive(Debug, Clone)]
pub struct PersistedArtifact {
    pub local_path: PathBuf,
    pub sidecar_path: PathBuf,
    pub destination_key: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub article_count: usize,
}

// ── Destination keys ──

/// Deterministic destination key: the explicit name when given, otherwise
/// the dominant source domain. Same inputs, same key, every run; never
/// derived from timestamps.
pub fn derive_key(explicit: Option<&str>, source_urls: &[Url]) -> String {
    let raw = match explicit {
        Some(name) => name.to_string(),
        None => dominant_domain(source_urls).unwrap_or_default(),
    };
    let key = normalize_key(&raw);
    if key.is_empty() {
        FALLBACK_KEY.to_string()
    } else {
        key
    }
}

/// Most frequent host across the inputs; first seen wins a tie.
pub fn dominant_domain(urls: &[Url]) -> Option<String> {
    let mut counts: Vec<(String, usize)> = Vec::new();
    for url in urls {
        if let Some(host) = url.host_str() {
            let host = host.to_ascii_lowercase();
            match counts.iter_mut().find(|(h, _)| *h == host) {
                Some((_, n)) => *n += 1,
                None => counts.push((host, 1)),
            }
        }
    }
    let mut best: Option<(String, usize)> = None;
    for (host, n) in counts {
        if best.as_ref().map_or(true, |(_, bn)| n > *bn) {
            best = Some((host, n));
        }
    }
    best.map(|(host, _)| host)
}

fn normalize_key(raw: &str) -> String {
    let mut out = String::new();
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if !out.is_empty() && !out.ends_with('_') {
            out.push('_');
        }
    }
    out.truncate(KEY_MAX_CHARS);
    while out.ends_with('_') {
        out.pop();
    }
    out
}

// ── Local writes ──

/// Write artifact then sidecar under `out_dir/<key>`. Re-running with the
/// same key either conflicts (default) or replaces the previous artifact
/// atomically; it never half-writes or duplicates.
pub fn persist(
    bytes: &[u8],
    key: &str,
    sidecar: &Sidecar,
    options: &PersistOptions,
) -> Result<PersistedArtifact, PersistError> {
    fs::create_dir_all(&options.out_dir)?;
    let local_path = options.out_dir.join(format!("{}.epub", key));
    let sidecar_path = options.out_dir.join(format!("{}.json", key));

    if local_path.exists() && !options.overwrite {
        return Err(PersistError::Conflict { path: local_path });
    }

    write_atomic(&local_path, bytes)?;
    let json = serde_json::to_vec_pretty(sidecar)?;
    write_atomic(&sidecar_path, &json)?;

    Ok(PersistedArtifact {
        local_path,
        sidecar_path,
        destination_key: key.to_string(),
        size_bytes: bytes.len() as u64,
        created_at: sidecar.created_at,
        article_count: sidecar.article_count,
    })
}

// Write into a sibling temp file, then rename into place. Readers see the
// old bytes or the new bytes, nothing in between.
fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

// ── Remote sync ──

/// Optional post-write replication target. Implementations own their path
/// and naming conventions; callers only hand over key and bytes.
#[async_trait]
pub trait SyncBackend: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> anyhow::Result<()>;
    async fn exists(&self, key: &str) -> anyhow::Result<bool>;
}

/// Shipped backend: drop the artifact into a watched folder (Dropbox-style
/// sync directories, network mounts).
pub struct DirSync {
    dir: PathBuf,
}

impl DirSync {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn target(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.epub", key))
    }
}

#[async_trait]
impl SyncBackend for DirSync {
    async fn put(&self, key: &str, bytes: &[u8]) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir)?;
        write_atomic(&self.target(key), bytes)?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.target(key).exists())
    }
}

/// Best-effort replication: push, then optionally poll for visibility a
/// bounded number of times. Sync trouble is worth a warning, never a
/// failed run; the local artifact already exists.
pub async fn sync_artifact(backend: &dyn SyncBackend, key: &str, bytes: &[u8], wait: bool) {
    if let Err(e) = backend.put(key, bytes).await {
        warn!("Sync push failed for {}: {}", key, e);
        return;
    }
    if !wait {
        return;
    }
    for _ in 0..SYNC_POLL_ATTEMPTS {
        match backend.exists(key).await {
            Ok(true) => {
                info!("Sync confirmed for {}", key);
                return;
            }
            Ok(false) => tokio::time::sleep(SYNC_POLL_DELAY).await,
            Err(e) => {
                warn!("Sync check failed for {}: {}", key, e);
                return;
            }
        }
    }
    warn!(
        "Sync not confirmed for {} after {} checks",
        key, SYNC_POLL_ATTEMPTS
    );
}

// ── Tests ──
