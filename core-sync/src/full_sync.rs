//! Full synchronization: reconcile the store with a complete remote listing.
//!
//! 1. List every sub-folder once and build a folder id → path map.
//! 2. List every image below the root.
//! 3. Walk the listing in order, inserting new items in batches and updating
//!    changed ones in place, resuming after the job's checkpoint if it has one.
//! 4. Delete stored items missing from the listing (orphans).
//! 5. Fetch a fresh change token for later incremental runs.

use crate::context::{percent_of, SyncContext, SyncOutcome};
use crate::paths::build_folder_paths;
use crate::{Result, SyncError, SyncJob};
use bridge_traits::change_feed::RemoteFile;
use core_library::models::{SyncedFolder, SyncedItem};
use core_runtime::events::{CoreEvent, ItemEvent, SyncCounts};
use std::collections::{HashMap, HashSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[instrument(skip_all, fields(job_id = %job.id, folder_id = %folder.id))]
pub(crate) async fn run_full_sync(
    ctx: &SyncContext,
    job: &mut SyncJob,
    folder: &SyncedFolder,
    cancel: &CancellationToken,
) -> Result<SyncOutcome> {
    let root = folder.remote_folder_id.as_str();
    let credentials = &folder.credentials;
    job.metadata.is_incremental = false;
    job.metadata.current_folder = Some(root.to_string());
    job.metadata.page_token = None;

    let folder_paths = match ctx
        .remote("list_folders_recursive", &folder.id, cancel, || {
            ctx.client.list_folders_recursive(credentials, root)
        })
        .await
    {
        Ok(folders) => {
            let paths = build_folder_paths(root, &folder.name, &folders);
            if let Err(e) = ctx.folders.replace_folder_paths(&folder.id, &paths).await {
                warn!(error = %e, "Failed to cache folder paths");
            }
            debug!(folders = paths.len(), "Built folder path map");
            Some(paths)
        }
        Err(e) if e.is_fatal() || matches!(e, SyncError::Cancelled) => return Err(e),
        Err(e) => {
            warn!(error = %e, "Folder listing failed, resolving paths per file");
            None
        }
    };
    ctx.heartbeat(job).await;

    let files = ctx
        .remote("list_images_recursive", &folder.id, cancel, || {
            ctx.client.list_images_recursive(credentials, root)
        })
        .await?;
    ctx.heartbeat(job).await;

    let total = files.len() as u64;
    let listed: HashSet<String> = files.iter().map(|f| f.id.clone()).collect();
    let start = resume_index(&files, job.metadata.last_processed_id.as_deref());

    let mut counts = if start > 0 {
        info!(resume_at = start, total, "Resuming full sync from checkpoint");
        SyncCounts {
            total,
            processed: start as u64,
            ..job.counts
        }
    } else {
        job.metadata.clear_checkpoint();
        SyncCounts {
            total,
            ..SyncCounts::default()
        }
    };

    let step = ctx.config.progress_percent_step.max(1);
    let checkpoint_every = ctx.config.checkpoint_every.max(1) as u64;
    let batch_size = ctx.config.insert_batch_size.max(1);

    let mut pending: Vec<SyncedItem> = Vec::with_capacity(batch_size);
    let mut resolved: HashMap<String, String> = HashMap::new();
    let mut last_percent = percent_of(counts.processed, total);
    let mut last_id = job.metadata.last_processed_id.clone();

    for file in files.iter().skip(start) {
        if cancel.is_cancelled() {
            return interrupt(ctx, job, folder, &mut pending, counts, last_id).await;
        }

        let path = match path_for(ctx, folder, file, folder_paths.as_ref(), &mut resolved, cancel).await {
            Ok(path) => path,
            Err(SyncError::Cancelled) => {
                return interrupt(ctx, job, folder, &mut pending, counts, last_id).await;
            }
            Err(e) => return Err(e),
        };

        match ctx.items.find_by_remote_id(&folder.id, &file.id).await {
            Ok(None) => {
                pending.push(SyncedItem::from_remote(&folder.id, file, path, ctx.now()));
                if pending.len() >= batch_size {
                    ctx.flush_inserts(&folder.id, &mut pending, &mut counts).await;
                }
            }
            Ok(Some(mut existing)) => {
                if existing.needs_update(file, &path) {
                    existing.apply_remote(file, path, ctx.now());
                    match ctx.items.update(&existing).await {
                        Ok(()) => counts.updated += 1,
                        Err(e) => {
                            warn!(remote_id = %file.id, error = %e, "Failed to update item");
                            counts.failed += 1;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(remote_id = %file.id, error = %e, "Failed to look up item");
                counts.failed += 1;
            }
        }

        counts.processed += 1;
        last_id = Some(file.id.clone());

        let percent = percent_of(counts.processed, total);
        if percent >= last_percent.saturating_add(step) || counts.processed == total {
            last_percent = percent;
            ctx.report_progress(job, &folder.id, counts, percent, false).await;
        }

        if counts.processed % checkpoint_every == 0 {
            // Never checkpoint past an item that is still only in memory
            ctx.flush_inserts(&folder.id, &mut pending, &mut counts).await;
            job.metadata.checkpoint(file.id.clone(), counts.processed);
            job.counts = counts;
            if let Err(e) = ctx
                .jobs
                .save_checkpoint(&job.id, &counts, &job.metadata, ctx.now())
                .await
            {
                warn!(error = %e, "Failed to save checkpoint");
            }
        }
    }

    ctx.flush_inserts(&folder.id, &mut pending, &mut counts).await;

    match ctx.items.delete_not_in(&folder.id, &listed).await {
        Ok(0) => {}
        Ok(deleted) => {
            info!(deleted, "Removed items missing from the remote listing");
            counts.deleted += deleted;
            ctx.emit(CoreEvent::Item(ItemEvent::Deleted {
                folder_id: folder.id.clone(),
                count: deleted,
                reason: "cleanup_orphaned".to_string(),
            }));
        }
        Err(e) => warn!(error = %e, "Orphan cleanup failed"),
    }

    let change_token = ctx
        .remote("get_start_token", &folder.id, cancel, || {
            ctx.client.get_start_token(credentials)
        })
        .await?;

    job.metadata.clear_checkpoint();
    job.counts = counts;

    info!(
        new = counts.new,
        updated = counts.updated,
        deleted = counts.deleted,
        failed = counts.failed,
        "Full sync finished"
    );

    Ok(SyncOutcome::Completed {
        counts,
        change_token,
        no_changes: false,
    })
}

/// Index of the first file after the checkpointed one. A checkpoint that no
/// longer appears in the listing restarts from the beginning.
pub(crate) fn resume_index(files: &[RemoteFile], last_processed_id: Option<&str>) -> usize {
    last_processed_id
        .and_then(|last| files.iter().position(|f| f.id == last))
        .map(|index| index + 1)
        .unwrap_or(0)
}

async fn path_for(
    ctx: &SyncContext,
    folder: &SyncedFolder,
    file: &RemoteFile,
    folder_paths: Option<&HashMap<String, String>>,
    resolved: &mut HashMap<String, String>,
    cancel: &CancellationToken,
) -> Result<String> {
    let Some(parent) = file.parent_id.as_deref() else {
        return Ok(folder.name.clone());
    };

    if let Some(paths) = folder_paths {
        return Ok(paths.get(parent).cloned().unwrap_or_else(|| folder.name.clone()));
    }
    if let Some(path) = resolved.get(parent) {
        return Ok(path.clone());
    }

    let path = match ctx
        .remote("resolve_folder_path", &folder.id, cancel, || {
            ctx.client.resolve_folder_path(&folder.credentials, parent)
        })
        .await
    {
        Ok(path) => path,
        Err(e) if e.is_fatal() || matches!(e, SyncError::Cancelled) => return Err(e),
        Err(e) => {
            warn!(parent, error = %e, "Could not resolve folder path");
            folder.name.clone()
        }
    };
    resolved.insert(parent.to_string(), path.clone());
    Ok(path)
}

/// Flush what was processed, persist the checkpoint and hand back control.
async fn interrupt(
    ctx: &SyncContext,
    job: &mut SyncJob,
    folder: &SyncedFolder,
    pending: &mut Vec<SyncedItem>,
    mut counts: SyncCounts,
    last_id: Option<String>,
) -> Result<SyncOutcome> {
    ctx.flush_inserts(&folder.id, pending, &mut counts).await;

    if let Some(last_id) = last_id {
        job.metadata.checkpoint(last_id, counts.processed);
    }
    job.counts = counts;
    ctx.jobs
        .save_checkpoint(&job.id, &counts, &job.metadata, ctx.now())
        .await?;

    info!(
        processed = counts.processed,
        total = counts.total,
        "Full sync interrupted, checkpoint saved"
    );
    Ok(SyncOutcome::Interrupted { counts })
}
