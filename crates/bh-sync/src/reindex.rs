use std::path::PathBuf;

use anyhow::{Context, Result};
use bh_storage::{battle_ids_in_file, StoreRegistry};
use serde::Serialize;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct ReindexSummary {
    pub files_scanned: usize,
    pub files_skipped: Vec<PathBuf>,
    pub ids_read: usize,
    pub indexed: i64,
}

/// Rebuild the dedup index from every structured store on disk.
///
/// Store files are opened read-only; files without a `battles` table or that cannot be
/// read are skipped with a log line. The index is cleared and refilled in one transaction.
pub async fn rebuild_index(stores: &StoreRegistry) -> Result<ReindexSummary> {
    let files = stores.layout().structured_store_files().await?;
    if files.is_empty() {
        warn!(root = %stores.layout().season_root.display(), "no structured stores found; index will be empty");
    } else {
        info!(files = files.len(), "rebuilding battle index");
    }

    let mut ids = Vec::new();
    let mut files_skipped = Vec::new();
    for file in &files {
        match battle_ids_in_file(file).await {
            Ok(Some(found)) => {
                info!(file = %file.display(), battles = found.len(), "read structured store");
                ids.extend(found);
            }
            Ok(None) => {
                warn!(file = %file.display(), "no battles table; skipping file");
                files_skipped.push(file.clone());
            }
            Err(err) => {
                error!(file = %file.display(), error = %format!("{err:#}"), "cannot read structured store; skipping file");
                files_skipped.push(file.clone());
            }
        }
    }

    let index = stores.index().await.context("opening battle index")?;
    let indexed = index.rebuild(&ids).await?;
    info!(indexed, "battle index rebuilt");

    Ok(ReindexSummary {
        files_scanned: files.len(),
        files_skipped,
        ids_read: ids.len(),
        indexed,
    })
}
