//! Per-data-directory identity: the device id and the collection last synced.

use anyhow::{Context, Result};
use notesync_core::fs::FileSystem;
use notesync_core::{DeviceId, SyncKey};
use tracing::info;

pub const DEVICE_ID_PATH: &str = ".sync/device_id";
pub const COLLECTION_PATH: &str = ".sync/collection";

async fn read_text<F: FileSystem>(fs: &F, path: &str) -> Result<Option<String>> {
    if !fs.exists(path).await? {
        return Ok(None);
    }
    let bytes = fs.read(path).await?;
    Ok(Some(String::from_utf8_lossy(&bytes).trim().to_string()))
}

/// The device id for this data directory. An explicit id wins and is
/// persisted; otherwise the stored one is used, or a new one generated.
pub async fn device_id<F: FileSystem>(fs: &F, explicit: Option<&str>) -> Result<DeviceId> {
    if let Some(explicit) = explicit {
        let id: DeviceId = explicit
            .parse()
            .with_context(|| format!("Invalid device id {:?}", explicit))?;
        fs.write(DEVICE_ID_PATH, id.to_string().as_bytes()).await?;
        return Ok(id);
    }

    if let Some(stored) = read_text(fs, DEVICE_ID_PATH).await? {
        return stored
            .parse()
            .with_context(|| format!("Corrupt {}", DEVICE_ID_PATH));
    }

    let id = DeviceId::generate();
    fs.write(DEVICE_ID_PATH, id.to_string().as_bytes()).await?;
    info!("Generated device ID: {}", id);
    Ok(id)
}

/// Whether `key` selects a different collection than the one this data
/// directory last synced with. A directory that never synced has not
/// switched.
pub async fn key_switched<F: FileSystem>(fs: &F, key: &SyncKey) -> Result<bool> {
    Ok(read_text(fs, COLLECTION_PATH)
        .await?
        .is_some_and(|stored| stored != key.collection()))
}

/// Remember the collection for `key`. Only the derived name is stored.
pub async fn remember_collection<F: FileSystem>(fs: &F, key: &SyncKey) -> Result<()> {
    fs.write(COLLECTION_PATH, key.collection().as_bytes()).await?;
    Ok(())
}
