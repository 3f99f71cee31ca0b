//! Incremental synchronization: apply the remote change feed since the
//! folder's stored change token.
//!
//! The new token is only handed back once every change was applied, so an
//! interrupted or failed run re-reads the same changes next time. Every
//! change is idempotent to re-apply.
//!
//! A change that cannot be applied (store write, unresolvable parent) counts
//! as a failed item and the run moves on. Only credential and configuration
//! errors abort the job.

use crate::context::{percent_of, SyncContext, SyncOutcome};
use crate::paths::is_within_root;
use crate::{Result, SyncError, SyncJob};
use bridge_traits::change_feed::{ChangeEntry, RemoteFile};
use core_library::models::{SyncedFolder, SyncedItem};
use core_runtime::events::{CoreEvent, ItemEvent, SyncCounts};
use core_runtime::logging::{strip_path, truncate_token};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[instrument(skip_all, fields(job_id = %job.id, folder_id = %folder.id))]
pub(crate) async fn run_incremental_sync(
    ctx: &SyncContext,
    job: &mut SyncJob,
    folder: &SyncedFolder,
    cancel: &CancellationToken,
) -> Result<SyncOutcome> {
    let token = folder.change_token.clone();
    job.metadata.is_incremental = true;
    job.metadata.page_token = Some(token.clone());
    job.metadata.current_folder = Some(folder.remote_folder_id.clone());

    debug!(token = %truncate_token(&token), "Requesting remote changes");
    let (changes, next_token) = ctx
        .remote("get_changes", &folder.id, cancel, || {
            ctx.client.get_changes(&folder.credentials, &token)
        })
        .await?;
    ctx.heartbeat(job).await;

    if changes.is_empty() {
        debug!("No remote changes");
        return Ok(SyncOutcome::Completed {
            counts: SyncCounts::default(),
            change_token: next_token,
            no_changes: true,
        });
    }

    let total = changes.len() as u64;
    info!(changes = total, "Applying remote changes");

    let mut known_paths = match ctx.folders.folder_paths(&folder.id).await {
        Ok(paths) => paths,
        Err(e) => {
            warn!(error = %e, "Folder path cache unavailable");
            HashMap::new()
        }
    };
    known_paths.insert(folder.remote_folder_id.clone(), folder.name.clone());

    let every = ctx.config.progress_broadcast_every.max(1) as u64;
    let mut counts = SyncCounts {
        total,
        ..SyncCounts::default()
    };

    for change in &changes {
        if cancel.is_cancelled() {
            info!(processed = counts.processed, "Incremental sync interrupted");
            return Ok(SyncOutcome::Interrupted { counts });
        }

        match apply_change(ctx, folder, change, &mut known_paths, &mut counts, cancel).await {
            Ok(()) => {}
            Err(SyncError::Cancelled) => {
                info!(processed = counts.processed, "Incremental sync interrupted");
                return Ok(SyncOutcome::Interrupted { counts });
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(file_id = %change.file_id, error = %e, "Failed to apply change");
                counts.failed += 1;
            }
        }

        counts.processed += 1;
        if counts.processed % every == 0 || counts.processed == total {
            let percent = percent_of(counts.processed, total);
            ctx.report_progress(job, &folder.id, counts, percent, true).await;
        }
    }

    job.counts = counts;
    info!(
        new = counts.new,
        updated = counts.updated,
        deleted = counts.deleted,
        failed = counts.failed,
        "Incremental sync finished"
    );

    Ok(SyncOutcome::Completed {
        counts,
        change_token: next_token,
        no_changes: false,
    })
}

async fn apply_change(
    ctx: &SyncContext,
    folder: &SyncedFolder,
    change: &ChangeEntry,
    known_paths: &mut HashMap<String, String>,
    counts: &mut SyncCounts,
    cancel: &CancellationToken,
) -> Result<()> {
    let file = match (&change.file, change.removed) {
        (Some(file), false) => file,
        // Deleted or no longer shared with us
        _ => return remove(ctx, folder, &change.file_id, "removed", counts).await,
    };

    if file.trashed {
        return remove(ctx, folder, &file.id, "trashed", counts).await;
    }

    if file.is_folder() {
        return apply_folder_change(ctx, folder, file, known_paths, counts, cancel).await;
    }

    if !file.is_image() {
        return Ok(());
    }

    if !within_subtree(ctx, folder, file, known_paths, cancel).await? {
        debug!(file_id = %file.id, "Change outside synced folder, ignored");
        return Ok(());
    }

    let path = match file.parent_id.as_deref() {
        Some(parent) => match known_paths.get(parent) {
            Some(path) => path.clone(),
            None => match ctx
                .remote("resolve_folder_path", &folder.id, cancel, || {
                    ctx.client.resolve_folder_path(&folder.credentials, parent)
                })
                .await
            {
                Ok(resolved) => {
                    known_paths.insert(parent.to_string(), resolved.clone());
                    resolved
                }
                Err(e) if e.is_fatal() || matches!(e, SyncError::Cancelled) => return Err(e),
                Err(e) => {
                    warn!(parent, error = %e, "Could not resolve folder path");
                    folder.name.clone()
                }
            },
        },
        None => folder.name.clone(),
    };

    match ctx.items.find_by_remote_id(&folder.id, &file.id).await? {
        None => {
            let item = SyncedItem::from_remote(&folder.id, file, path, ctx.now());
            let item_ids = ctx.items.insert_batch(std::slice::from_ref(&item)).await?;
            counts.new += item_ids.len() as u64;
            if !item_ids.is_empty() {
                ctx.emit(CoreEvent::Item(ItemEvent::Added {
                    folder_id: folder.id.clone(),
                    item_ids,
                }));
            }
        }
        Some(mut existing) => {
            if existing.needs_update(file, &path) {
                existing.apply_remote(file, path, ctx.now());
                ctx.items.update(&existing).await?;
                counts.updated += 1;
            }
        }
    }

    Ok(())
}

/// Delete the item with this remote identity and, when the identity is a
/// sub-folder, every item filed under it.
async fn remove(
    ctx: &SyncContext,
    folder: &SyncedFolder,
    remote_id: &str,
    reason: &str,
    counts: &mut SyncCounts,
) -> Result<()> {
    let mut deleted = u64::from(ctx.items.delete_by_remote_id(&folder.id, remote_id).await?);
    deleted += ctx
        .items
        .delete_by_remote_folder_id(&folder.id, remote_id)
        .await?;

    if deleted > 0 {
        debug!(remote_id, deleted, reason, "Deleted items for remote change");
        counts.deleted += deleted;
        ctx.emit(CoreEvent::Item(ItemEvent::Deleted {
            folder_id: folder.id.clone(),
            count: deleted,
            reason: reason.to_string(),
        }));
    }
    Ok(())
}

/// A renamed or moved sub-folder: recompute its path and rewrite the paths of
/// every item below it.
async fn apply_folder_change(
    ctx: &SyncContext,
    folder: &SyncedFolder,
    entry: &RemoteFile,
    known_paths: &mut HashMap<String, String>,
    counts: &mut SyncCounts,
    cancel: &CancellationToken,
) -> Result<()> {
    // The synced root keeps its display name
    if entry.id == folder.remote_folder_id {
        return Ok(());
    }
    if !within_subtree(ctx, folder, entry, known_paths, cancel).await? {
        return Ok(());
    }

    let parent_path = entry
        .parent_id
        .as_deref()
        .and_then(|parent| known_paths.get(parent).cloned());
    let new_path = match parent_path {
        Some(parent_path) => format!("{}/{}", parent_path, entry.name),
        None => {
            ctx.remote("resolve_folder_path", &folder.id, cancel, || {
                ctx.client.resolve_folder_path(&folder.credentials, &entry.id)
            })
            .await?
        }
    };

    if known_paths.get(&entry.id) == Some(&new_path) {
        return Ok(());
    }

    let outcome = ctx
        .folders
        .rename_subfolder(&folder.id, &entry.id, &new_path, ctx.now())
        .await?;
    counts.updated += outcome.items_updated;

    debug!(
        remote_folder_id = %entry.id,
        folder = strip_path(&new_path),
        items_updated = outcome.items_updated,
        "Applied folder rename"
    );

    // Descendant paths were rewritten in the store; mirror them in memory
    match outcome.old_path {
        Some(old) if old != new_path => {
            let prefix = format!("{}/", old);
            for path in known_paths.values_mut() {
                if let Some(rest) = path.strip_prefix(&prefix) {
                    *path = format!("{}/{}", new_path, rest);
                }
            }
        }
        _ => {}
    }
    known_paths.insert(entry.id.clone(), new_path);
    Ok(())
}

async fn within_subtree(
    ctx: &SyncContext,
    folder: &SyncedFolder,
    entry: &RemoteFile,
    known_paths: &HashMap<String, String>,
    cancel: &CancellationToken,
) -> Result<bool> {
    let Some(parent) = entry.parent_id.clone() else {
        return Ok(false);
    };
    let parents = [parent];
    let root = folder.remote_folder_id.as_str();
    let max_depth = ctx.config.max_parent_depth;

    let within = ctx
        .remote("get_parent_ids", &folder.id, cancel, || {
            is_within_root(
                ctx.client.as_ref(),
                &folder.credentials,
                root,
                &parents,
                known_paths,
                max_depth,
            )
        })
        .await;

    match within {
        Ok(within) => Ok(within),
        Err(e) if e.is_fatal() || matches!(e, SyncError::Cancelled) => Err(e),
        Err(e) => {
            warn!(entry_id = %entry.id, error = %e, "Parent lookup failed, treating as outside");
            Ok(false)
        }
    }
}
