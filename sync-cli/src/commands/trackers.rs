//! List queued and in-flight transfers.

use anyhow::Result;
use objsync_client::{PendingTransfers, SqliteStore};
use objsync_core::DeletionTarget;

use super::repository;
use crate::store::print_json;

/// Gather every persisted tracker in queue order.
pub async fn report(store: &SqliteStore) -> Result<PendingTransfers> {
    Ok(PendingTransfers::load(&repository(store)).await?)
}

/// Run the trackers command.
pub async fn run(store: &SqliteStore, json: bool) -> Result<()> {
    let pending = report(store).await?;
    if json {
        return print_json(&pending);
    }

    if pending.is_empty() {
        println!("No pending transfers.");
        return Ok(());
    }

    if !pending.uploads.is_empty() {
        println!("Uploads:");
        for upload in &pending.uploads {
            let object = &upload.object;
            println!(
                "  #{} {} {} ({})",
                object.created_seq,
                object.object_type,
                object.group_id,
                if object.v0_upload { "v0" } else { "vN" },
            );
            if let Some(deferred) = object.deferred_id {
                println!("    awaiting deferred {}", deferred);
            }
            for file in &upload.files {
                println!(
                    "    [{}/{}] {:<12} {:?} -> {} attempts={}",
                    file.upload_index,
                    file.upload_count,
                    file.file_label,
                    file.status,
                    file.target_version,
                    file.attempts,
                );
            }
        }
    }

    if !pending.downloads.is_empty() {
        println!("Downloads:");
        for download in &pending.downloads {
            println!("  #{} {}", download.object.created_seq, download.object.group_id);
            for file in &download.files {
                println!(
                    "    {:<12} {:?} v{} attempts={}",
                    file.file_label, file.status, file.version, file.attempts,
                );
            }
        }
    }

    if !pending.deletions.is_empty() {
        println!("Deletions:");
        for deletion in &pending.deletions {
            let target = match &deletion.target {
                DeletionTarget::Object(group_id) => format!("object {}", group_id),
                DeletionTarget::File { file_id, .. } => format!("file {}", file_id),
            };
            print!("  #{} {} {:?}", deletion.created_seq, target, deletion.status);
            match deletion.deferred_id {
                Some(deferred) => println!(" deferred={}", deferred),
                None => println!(),
            }
        }
    }

    Ok(())
}
