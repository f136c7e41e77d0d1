//! Trigger pass selection.
//!
//! Given the tracker rows and the current time, pick what should go to the
//! network now. At most one object tracker per object is active for each
//! transfer kind; queued trackers for a busy object wait their turn.

use objsync_types::{FileGroupId, TrackerId};
use std::collections::{BTreeMap, BTreeSet};

use crate::deletion::{DeletionStatus, DeletionTracker};
use crate::download::{self, DownloadFileTracker, DownloadObjectTracker, DownloadStatus};
use crate::upload::{self, UploadFileTracker, UploadObjectTracker, UploadStatus};

/// Which pipeline a transfer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TransferKind {
    /// Upload of a file.
    Upload,
    /// Download of a file.
    Download,
    /// Deletion of an object or file.
    Deletion,
}

/// Shape shared by upload and download object trackers.
trait QueuedObject {
    fn id(&self) -> TrackerId;
    fn group_id(&self) -> FileGroupId;
    fn created_seq(&self) -> u64;
}

/// Shape shared by upload and download file trackers.
trait QueuedFile {
    fn id(&self) -> TrackerId;
    fn object_tracker(&self) -> TrackerId;
    fn not_started(&self) -> bool;
    fn stalled(&self, now: u64) -> bool;
}

impl QueuedObject for UploadObjectTracker {
    fn id(&self) -> TrackerId {
        self.id
    }
    fn group_id(&self) -> FileGroupId {
        self.group_id
    }
    fn created_seq(&self) -> u64 {
        self.created_seq
    }
}

impl QueuedObject for DownloadObjectTracker {
    fn id(&self) -> TrackerId {
        self.id
    }
    fn group_id(&self) -> FileGroupId {
        self.group_id
    }
    fn created_seq(&self) -> u64 {
        self.created_seq
    }
}

impl QueuedFile for UploadFileTracker {
    fn id(&self) -> TrackerId {
        self.id
    }
    fn object_tracker(&self) -> TrackerId {
        self.object_tracker
    }
    fn not_started(&self) -> bool {
        self.status == UploadStatus::NotStarted
    }
    fn stalled(&self, now: u64) -> bool {
        self.is_stalled(now)
    }
}

impl QueuedFile for DownloadFileTracker {
    fn id(&self) -> TrackerId {
        self.id
    }
    fn object_tracker(&self) -> TrackerId {
        self.object_tracker
    }
    fn not_started(&self) -> bool {
        self.status == DownloadStatus::NotStarted
    }
    fn stalled(&self, now: u64) -> bool {
        self.is_stalled(now)
    }
}

/// File tracker ids to dispatch, retries of active objects first.
fn select<O, F>(objects: &[O], files: &[F], active: impl Fn(&O) -> bool, now: u64) -> Vec<TrackerId>
where
    O: QueuedObject,
    F: QueuedFile,
{
    let mut ordered: Vec<&O> = objects.iter().collect();
    ordered.sort_by_key(|o| o.created_seq());

    let busy: BTreeSet<FileGroupId> = ordered
        .iter()
        .filter(|o| active(o))
        .map(|o| o.group_id())
        .collect();

    let files_of = move |object: TrackerId| files.iter().filter(move |f| f.object_tracker() == object);

    let mut selected = Vec::new();

    // Retries and stalls of objects already in flight
    for object in ordered.iter().filter(|o| active(o)) {
        selected.extend(
            files_of(object.id())
                .filter(|f| f.not_started() || f.stalled(now))
                .map(|f| f.id()),
        );
    }

    // Oldest queued object of every idle group
    let mut oldest: BTreeMap<FileGroupId, &O> = BTreeMap::new();
    for object in ordered.iter().filter(|o| !busy.contains(&o.group_id())) {
        oldest.entry(object.group_id()).or_insert(*object);
    }
    for object in oldest.values() {
        selected.extend(
            files_of(object.id())
                .filter(|f| f.not_started())
                .map(|f| f.id()),
        );
    }

    selected
}

/// Upload file trackers to dispatch now.
pub fn select_uploads(
    objects: &[UploadObjectTracker],
    files: &[UploadFileTracker],
    now: u64,
) -> Vec<TrackerId> {
    select(objects, files, |o| upload::object_is_active(o, files), now)
}

/// Download file trackers to dispatch now.
pub fn select_downloads(
    objects: &[DownloadObjectTracker],
    files: &[DownloadFileTracker],
    now: u64,
) -> Vec<TrackerId> {
    select(objects, files, |o| download::object_is_active(o, files), now)
}

/// Upload object trackers that have not started and can be re-targeted.
pub fn idle_uploads<'a>(
    objects: &'a [UploadObjectTracker],
    files: &'a [UploadFileTracker],
) -> impl Iterator<Item = &'a UploadObjectTracker> + 'a {
    objects
        .iter()
        .filter(move |o| !upload::object_is_active(o, files))
}

/// Deletion trackers to dispatch now.
///
/// A group with an active upload, or with another deletion in flight, is
/// skipped.
pub fn select_deletions(
    deletions: &[DeletionTracker],
    upload_objects: &[UploadObjectTracker],
    upload_files: &[UploadFileTracker],
    now: u64,
) -> Vec<TrackerId> {
    let uploading: BTreeSet<FileGroupId> = upload_objects
        .iter()
        .filter(|o| upload::object_is_active(o, upload_files))
        .map(|o| o.group_id)
        .collect();

    let mut ordered: Vec<&DeletionTracker> = deletions.iter().collect();
    ordered.sort_by_key(|d| d.created_seq);

    let mut claimed: BTreeSet<FileGroupId> = ordered
        .iter()
        .filter(|d| d.is_active() && !d.is_stalled(now))
        .map(|d| d.target.group_id())
        .collect();

    let mut selected = Vec::new();
    for deletion in ordered {
        let group = deletion.target.group_id();
        if uploading.contains(&group) {
            continue;
        }
        let eligible = deletion.status == DeletionStatus::NotStarted || deletion.is_stalled(now);
        if eligible && claimed.insert(group) {
            selected.push(deletion.id);
        }
    }
    selected
}
