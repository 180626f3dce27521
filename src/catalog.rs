//! Durable index of received files.
//!
//! Layout under the received directory:
//!
//! ```text
//! received/
//!   photo.png
//!   .vdrop/manifest.json          records, oldest first
//!   .vdrop/previews/<id>.png      thumbnails
//!   .vdrop/tmp/<uuid>.part        bodies still in flight
//! ```
//!
//! Partial bodies live under the metadata directory so no name a peer can
//! send ever matches them.
//!
//! The catalog is the only writer. Appends are serialized by an async mutex
//! and published by swapping an `Arc` snapshot, so `list()` returns either the
//! state before an append or after it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{Error, Result};

const META_DIR: &str = ".vdrop";
const MANIFEST: &str = "manifest.json";
const PREVIEWS: &str = "previews";
const PARTS: &str = "tmp";
const PART_SUFFIX: &str = ".part";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedEntry {
    pub id: Uuid,
    pub name: String,
    pub stored_path: PathBuf,
    /// PNG thumbnail; empty when the file has no preview.
    pub preview: Vec<u8>,
    /// Unix time in milliseconds.
    pub received_at: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct ManifestRecord {
    id: Uuid,
    name: String,
    stored_path: String,
    received_at: u64,
    #[serde(default)]
    preview: Option<String>,
}

pub struct Catalog {
    root: PathBuf,
    records: Mutex<Vec<ManifestRecord>>,
    snapshot: RwLock<Arc<Vec<ReceivedEntry>>>,
}

impl Catalog {
    /// Opens (or creates) the catalog rooted at `root`, dropping entries whose
    /// files have disappeared and removing leftover partial transfers.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let previews = root.join(META_DIR).join(PREVIEWS);
        let parts = root.join(META_DIR).join(PARTS);
        for dir in [&previews, &parts] {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| Error::storage(dir, e))?;
        }

        remove_stale_parts(&parts).await;

        let manifest_path = root.join(META_DIR).join(MANIFEST);
        let loaded = load_manifest(&manifest_path).await;

        let mut records = Vec::with_capacity(loaded.len());
        let mut entries = Vec::with_capacity(loaded.len());
        for record in loaded {
            let stored_path = resolve(&root, &record.stored_path);
            if !fs::try_exists(&stored_path).await.unwrap_or(false) {
                tracing::debug!("Dropping catalog entry {}: file is gone", record.name);
                continue;
            }
            let preview = match &record.preview {
                Some(file) => fs::read(previews.join(file)).await.unwrap_or_default(),
                None => Vec::new(),
            };
            entries.push(ReceivedEntry {
                id: record.id,
                name: record.name.clone(),
                stored_path,
                preview,
                received_at: record.received_at,
            });
            records.push(record);
        }
        // Manifest order is oldest first; stable sort keeps ties in append order.
        entries.reverse();
        entries.sort_by(|a, b| b.received_at.cmp(&a.received_at));

        tracing::info!(
            "Catalog at {} holds {} entries",
            root.display(),
            entries.len()
        );

        Ok(Self {
            root,
            records: Mutex::new(records),
            snapshot: RwLock::new(Arc::new(entries)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Most recent first.
    pub fn list(&self) -> Arc<Vec<ReceivedEntry>> {
        self.snapshot.read().clone()
    }

    /// Fresh temp path for an inbound body, on the same filesystem as the
    /// final location so `commit` is a rename. `open` sweeps leftovers.
    pub fn temp_path(&self) -> PathBuf {
        self.root
            .join(META_DIR)
            .join(PARTS)
            .join(format!("{}{}", Uuid::new_v4(), PART_SUFFIX))
    }

    /// Moves a fully written temp file to a unique final name and records it.
    ///
    /// On error the file is back at `temp` (or was never moved) and no entry
    /// exists; the caller owns cleanup of `temp`.
    pub async fn commit(&self, temp: &Path, name: &str, preview: Vec<u8>) -> Result<ReceivedEntry> {
        let mut records = self.records.lock().await;

        let final_path = unique_path(&self.root, name).await;
        fs::rename(temp, &final_path)
            .await
            .map_err(|e| Error::storage(&final_path, e))?;

        let stored_name = final_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| name.to_string());
        let entry = ReceivedEntry {
            id: Uuid::new_v4(),
            name: stored_name,
            stored_path: final_path.clone(),
            preview,
            received_at: now_millis(),
        };

        if let Err(e) = self.persist(&mut records, &entry).await {
            if let Err(undo) = fs::rename(&final_path, temp).await {
                tracing::error!(
                    "Could not move {} back after catalog failure: {}",
                    final_path.display(),
                    undo
                );
            }
            return Err(e);
        }
        Ok(entry)
    }

    /// Records an entry whose file is already in place.
    pub async fn append(&self, entry: ReceivedEntry) -> Result<()> {
        let mut records = self.records.lock().await;
        self.persist(&mut records, &entry).await
    }

    async fn persist(&self, records: &mut Vec<ManifestRecord>, entry: &ReceivedEntry) -> Result<()> {
        let meta = self.root.join(META_DIR);

        let preview_file = if entry.preview.is_empty() {
            None
        } else {
            let file = format!("{}.png", entry.id);
            let path = meta.join(PREVIEWS).join(&file);
            write_synced(&path, &entry.preview).await?;
            Some(file)
        };

        let record = ManifestRecord {
            id: entry.id,
            name: entry.name.clone(),
            stored_path: relative(&self.root, &entry.stored_path),
            received_at: entry.received_at,
            preview: preview_file.clone(),
        };

        let mut next = records.clone();
        next.push(record);
        if let Err(e) = write_manifest(&meta, &next).await {
            if let Some(file) = preview_file {
                let _ = fs::remove_file(meta.join(PREVIEWS).join(file)).await;
            }
            return Err(e);
        }
        *records = next;

        let mut entries = Vec::with_capacity(records.len());
        entries.push(entry.clone());
        entries.extend(self.list().iter().cloned());
        *self.snapshot.write() = Arc::new(entries);

        tracing::info!("Catalogued {} ({} preview bytes)", entry.name, entry.preview.len());
        Ok(())
    }
}

async fn load_manifest(path: &Path) -> Vec<ManifestRecord> {
    let content = match fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            tracing::error!("Failed to read manifest {}: {}", path.display(), e);
            return Vec::new();
        }
    };
    match serde_json::from_str::<Vec<ManifestRecord>>(&content) {
        Ok(records) => records,
        Err(e) => {
            let aside = path.with_extension("json.corrupt");
            tracing::error!(
                "Failed to parse manifest {}: {}; moving it to {}",
                path.display(),
                e,
                aside.display()
            );
            let _ = fs::rename(path, &aside).await;
            Vec::new()
        }
    }
}

async fn write_manifest(meta: &Path, records: &[ManifestRecord]) -> Result<()> {
    let path = meta.join(MANIFEST);
    let tmp = meta.join(format!("{}.tmp", MANIFEST));
    let json = serde_json::to_vec_pretty(records)?;
    // Durable before it replaces the old manifest; a crash leaves one or the other.
    write_synced(&tmp, &json).await?;
    fs::rename(&tmp, &path)
        .await
        .map_err(|e| Error::storage(&path, e))
}

async fn write_synced(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = File::create(path)
        .await
        .map_err(|e| Error::storage(path, e))?;
    file.write_all(data)
        .await
        .map_err(|e| Error::storage(path, e))?;
    file.sync_all().await.map_err(|e| Error::storage(path, e))
}

async fn remove_stale_parts(parts: &Path) {
    let mut dir = match fs::read_dir(parts).await {
        Ok(d) => d,
        Err(e) => {
            tracing::warn!("Cannot scan {} for partial files: {}", parts.display(), e);
            return;
        }
    };
    while let Ok(Some(item)) = dir.next_entry().await {
        let name = item.file_name().to_string_lossy().to_string();
        if name.ends_with(PART_SUFFIX) {
            tracing::info!("Removing partial transfer {}", name);
            let _ = fs::remove_file(item.path()).await;
        }
    }
}

/// `name`, or `name (1)`, `name (2)`, ... keeping the extension.
async fn unique_path(root: &Path, name: &str) -> PathBuf {
    let candidate = root.join(name);
    if !fs::try_exists(&candidate).await.unwrap_or(false) {
        return candidate;
    }

    let as_path = Path::new(name);
    let stem = as_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| name.to_string());
    let ext = as_path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let mut n = 1u32;
    loop {
        let candidate = root.join(format!("{} ({}){}", stem, n, ext));
        if !fs::try_exists(&candidate).await.unwrap_or(false) {
            return candidate;
        }
        n += 1;
    }
}

fn relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .to_string()
}

fn resolve(root: &Path, stored: &str) -> PathBuf {
    let path = Path::new(stored);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
