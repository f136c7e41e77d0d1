//! Download trackers.
//!
//! Mirrors the upload side: an object tracker per queued download and a file
//! tracker per file, moving `NotStarted → Downloading → Downloaded`. Failed
//! files are retried until the retry limit, then evicted.

use objsync_types::{FileGroupId, FileId, FileVersion, GoneReason, SharingGroupId, TrackerId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::directory::{FileEntry, ObjectEntry};
use crate::tracker::{deadline, TrackerError, ValidationError};

/// Per-file download state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadStatus {
    /// Waiting for a trigger pass.
    NotStarted,
    /// Handed to the network.
    Downloading,
    /// Finished, successfully or gone.
    Downloaded,
}

impl DownloadStatus {
    fn name(&self) -> &'static str {
        match self {
            Self::NotStarted => "not started",
            Self::Downloading => "downloading",
            Self::Downloaded => "downloaded",
        }
    }
}

/// A queued or in-flight download for one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadObjectTracker {
    /// Tracker id.
    pub id: TrackerId,
    /// The object.
    pub group_id: FileGroupId,
    /// Queue order.
    pub created_seq: u64,
}

/// One file of a download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadFileTracker {
    /// Tracker id.
    pub id: TrackerId,
    /// Owning object tracker.
    pub object_tracker: TrackerId,
    /// The object.
    pub group_id: FileGroupId,
    /// The file.
    pub file_id: FileId,
    /// Label of the file.
    pub file_label: String,
    /// Requested version; replaced by the delivered one on success.
    pub version: FileVersion,
    /// Current state.
    pub status: DownloadStatus,
    /// Stall deadline while downloading, in unix seconds.
    pub expires_at: Option<u64>,
    /// Failed attempts so far.
    pub attempts: u32,
    /// Where the bytes landed.
    pub location: Option<PathBuf>,
    /// The server reported the file gone.
    pub gone: bool,
}

/// What to do after a failed download attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadFailure {
    /// Put back in the queue.
    Retry,
    /// Retry limit exceeded; drop the tracker.
    Evict,
    /// The tracker already finished; ignore the failure.
    Ignored,
}

impl DownloadFileTracker {
    /// Hand the file to the network.
    pub fn start(&mut self, now: u64, expiry_secs: u64) -> Result<(), TrackerError> {
        let allowed = match self.status {
            DownloadStatus::NotStarted => true,
            DownloadStatus::Downloading => self.is_stalled(now),
            DownloadStatus::Downloaded => false,
        };
        if !allowed {
            return Err(TrackerError::InvalidTransition {
                tracker: self.id,
                from: self.status.name(),
                to: DownloadStatus::Downloading.name(),
            });
        }
        self.status = DownloadStatus::Downloading;
        self.expires_at = Some(deadline(now, expiry_secs));
        Ok(())
    }

    /// Record a delivered version. Returns false on replay.
    pub fn complete(&mut self, location: PathBuf, version: FileVersion) -> bool {
        if self.status == DownloadStatus::Downloaded {
            return false;
        }
        self.status = DownloadStatus::Downloaded;
        self.expires_at = None;
        self.location = Some(location);
        self.version = version;
        true
    }

    /// Record a gone answer. It counts toward completion.
    pub fn mark_gone(&mut self) -> bool {
        if self.status == DownloadStatus::Downloaded {
            return false;
        }
        self.status = DownloadStatus::Downloaded;
        self.expires_at = None;
        self.gone = true;
        true
    }

    /// Count a failed attempt against `retry_limit`.
    pub fn fail(&mut self, retry_limit: u32) -> DownloadFailure {
        if self.status == DownloadStatus::Downloaded {
            return DownloadFailure::Ignored;
        }
        self.status = DownloadStatus::NotStarted;
        self.expires_at = None;
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts > retry_limit {
            DownloadFailure::Evict
        } else {
            DownloadFailure::Retry
        }
    }

    /// Downloading past its deadline.
    pub fn is_stalled(&self, now: u64) -> bool {
        self.status == DownloadStatus::Downloading && self.expires_at.map_or(true, |at| now >= at)
    }
}

/// An object tracker is active once any of its files left `NotStarted`.
pub fn object_is_active(object: &DownloadObjectTracker, files: &[DownloadFileTracker]) -> bool {
    files
        .iter()
        .filter(|f| f.object_tracker == object.id)
        .any(|f| f.status != DownloadStatus::NotStarted)
}

/// True when the object tracker has files and all of them are downloaded.
pub fn is_complete(object: &DownloadObjectTracker, files: &[DownloadFileTracker]) -> bool {
    let mut members = files
        .iter()
        .filter(|f| f.object_tracker == object.id)
        .peekable();
    members.peek().is_some() && members.all(|f| f.status == DownloadStatus::Downloaded)
}

/// One file to download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDownload {
    /// The file.
    pub file_id: FileId,
    /// Version to fetch.
    pub version: FileVersion,
}

/// A download request for one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDownload {
    /// The object.
    pub group_id: FileGroupId,
    /// Files to fetch.
    pub files: Vec<FileDownload>,
}

impl ObjectDownload {
    /// Request every file of the object that has a newer server version.
    pub fn latest<'a>(group_id: FileGroupId, files: impl IntoIterator<Item = &'a FileEntry>) -> Self {
        Self {
            group_id,
            files: files
                .into_iter()
                .filter(|f| f.group_id == group_id && f.needs_download())
                .filter_map(|f| {
                    f.server_version.map(|version| FileDownload {
                        file_id: f.file_id,
                        version,
                    })
                })
                .collect(),
        }
    }
}

/// Validate a download request and build its trackers.
pub fn plan(
    request: &ObjectDownload,
    object: Option<&ObjectEntry>,
    known: &[FileEntry],
    created_seq: u64,
) -> Result<(DownloadObjectTracker, Vec<DownloadFileTracker>), ValidationError> {
    if request.files.is_empty() {
        return Err(ValidationError::EmptyRequest);
    }
    let object = object.ok_or(ValidationError::UnknownObject(request.group_id))?;
    if object.is_deleted() {
        return Err(ValidationError::ObjectDeleted(request.group_id));
    }

    let tracker = DownloadObjectTracker {
        id: TrackerId::new(),
        group_id: request.group_id,
        created_seq,
    };

    let mut seen = BTreeSet::new();
    let mut files = Vec::with_capacity(request.files.len());
    for wanted in &request.files {
        if !seen.insert(wanted.file_id) {
            return Err(ValidationError::DuplicateFileId(wanted.file_id));
        }
        let entry = known
            .iter()
            .find(|f| f.file_id == wanted.file_id)
            .ok_or(ValidationError::UnknownFile(wanted.file_id))?;
        if entry.group_id != request.group_id {
            return Err(ValidationError::FileInOtherGroup {
                file_id: wanted.file_id,
                actual: entry.group_id,
            });
        }
        if entry.is_deleted() {
            return Err(ValidationError::FileDeleted(wanted.file_id));
        }
        match entry.server_version {
            Some(server) if wanted.version <= server => {}
            _ => {
                return Err(ValidationError::VersionNotOnServer {
                    file_id: wanted.file_id,
                    version: wanted.version,
                })
            }
        }

        files.push(DownloadFileTracker {
            id: TrackerId::new(),
            object_tracker: tracker.id,
            group_id: request.group_id,
            file_id: wanted.file_id,
            file_label: entry.file_label.clone(),
            version: wanted.version,
            status: DownloadStatus::NotStarted,
            expires_at: None,
            attempts: 0,
            location: None,
            gone: false,
        });
    }

    Ok((tracker, files))
}

/// One file of a completed download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadedFile {
    /// The file.
    pub file_id: FileId,
    /// Label of the file.
    pub file_label: String,
    /// Delivered version.
    pub version: FileVersion,
    /// Where the bytes landed. `None` when gone.
    pub location: Option<PathBuf>,
    /// Why the file was gone, if it was.
    pub gone: Option<GoneReason>,
}

/// Every file of a completed download, delivered as one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadedObject {
    /// The object.
    pub group_id: FileGroupId,
    /// Owning sharing group.
    pub sharing_group: SharingGroupId,
    /// Declared object type.
    pub object_type: String,
    /// The downloaded files.
    pub files: Vec<DownloadedFile>,
}

/// Assemble the delivery for a completed object tracker.
///
/// Gone reasons live on the directory rows, so `directory` supplies them.
pub fn assemble(
    object: &ObjectEntry,
    tracker: &DownloadObjectTracker,
    files: &[DownloadFileTracker],
    directory: &[FileEntry],
) -> DownloadedObject {
    let files = files
        .iter()
        .filter(|f| f.object_tracker == tracker.id)
        .map(|f| DownloadedFile {
            file_id: f.file_id,
            file_label: f.file_label.clone(),
            version: f.version,
            location: f.location.clone(),
            gone: if f.gone {
                directory
                    .iter()
                    .find(|d| d.file_id == f.file_id)
                    .and_then(|d| d.gone_reason)
            } else {
                None
            },
        })
        .collect();

    DownloadedObject {
        group_id: object.group_id,
        sharing_group: object.sharing_group,
        object_type: object.object_type.clone(),
        files,
    }
}

/// Files with a newer server version that no download tracker covers,
/// grouped by object. Files of deleted objects are skipped.
pub fn needing_download(
    objects: &[ObjectEntry],
    files: &[FileEntry],
    trackers: &[DownloadFileTracker],
) -> Vec<ObjectDownload> {
    let live: BTreeSet<FileGroupId> = objects
        .iter()
        .filter(|o| !o.is_deleted())
        .map(|o| o.group_id)
        .collect();
    let queued: BTreeSet<FileId> = trackers.iter().map(|t| t.file_id).collect();

    let mut wanted: BTreeMap<FileGroupId, Vec<FileDownload>> = BTreeMap::new();
    for file in files {
        if !live.contains(&file.group_id) || queued.contains(&file.file_id) || !file.needs_download() {
            continue;
        }
        if let Some(version) = file.server_version {
            wanted.entry(file.group_id).or_default().push(FileDownload {
                file_id: file.file_id,
                version,
            });
        }
    }
    wanted
        .into_iter()
        .map(|(group_id, files)| ObjectDownload { group_id, files })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (ObjectEntry, Vec<FileEntry>) {
        let object = ObjectEntry::new(FileGroupId::new(), SharingGroupId::new(), "note");
        let mut body = FileEntry::new_local(FileId::new(), object.group_id, "body", "text/plain");
        body.record_server_version(FileVersion::new(2)).unwrap();
        let mut image = FileEntry::new_local(FileId::new(), object.group_id, "image", "image/png");
        image.record_server_version(FileVersion::zero()).unwrap();
        (object, vec![body, image])
    }

    #[test]
    fn latest_requests_newer_versions() {
        let (object, mut files) = setup();
        files[1].record_downloaded_version(FileVersion::zero()).unwrap();
        let request = ObjectDownload::latest(object.group_id, &files);
        assert_eq!(
            request.files,
            vec![FileDownload {
                file_id: files[0].file_id,
                version: FileVersion::new(2)
            }]
        );
    }

    #[test]
    fn plan_builds_trackers() {
        let (object, files) = setup();
        let request = ObjectDownload::latest(object.group_id, &files);
        let (tracker, trackers) = plan(&request, Some(&object), &files, 3).unwrap();
        assert_eq!(tracker.created_seq, 3);
        assert_eq!(trackers.len(), 2);
        assert!(trackers.iter().all(|t| t.object_tracker == tracker.id));
        assert_eq!(trackers[0].file_label, "body");
    }

    #[test]
    fn plan_rejects_future_version() {
        let (object, files) = setup();
        let request = ObjectDownload {
            group_id: object.group_id,
            files: vec![FileDownload {
                file_id: files[0].file_id,
                version: FileVersion::new(3),
            }],
        };
        assert!(matches!(
            plan(&request, Some(&object), &files, 1),
            Err(ValidationError::VersionNotOnServer { .. })
        ));
    }

    #[test]
    fn plan_rejects_unknown_and_deleted() {
        let (mut object, mut files) = setup();
        let request = ObjectDownload::latest(object.group_id, &files);
        assert!(matches!(
            plan(&request, None, &files, 1),
            Err(ValidationError::UnknownObject(_))
        ));

        files[0].mark_deleted_locally();
        assert!(matches!(
            plan(&request, Some(&object), &files, 1),
            Err(ValidationError::FileDeleted(_))
        ));

        object.mark_deleted_on_server();
        assert!(matches!(
            plan(&request, Some(&object), &files, 1),
            Err(ValidationError::ObjectDeleted(_))
        ));
    }

    #[test]
    fn failure_evicts_after_limit() {
        let (object, files) = setup();
        let request = ObjectDownload::latest(object.group_id, &files);
        let (_, mut trackers) = plan(&request, Some(&object), &files, 1).unwrap();
        let file = &mut trackers[0];

        for _ in 0..3 {
            file.start(0, 10).unwrap();
            assert_eq!(file.fail(3), DownloadFailure::Retry);
        }
        file.start(0, 10).unwrap();
        assert_eq!(file.fail(3), DownloadFailure::Evict);
        assert_eq!(file.attempts, 4);
    }

    #[test]
    fn completion_counts_gone_files() {
        let (object, mut files) = setup();
        let request = ObjectDownload::latest(object.group_id, &files);
        let (tracker, mut trackers) = plan(&request, Some(&object), &files, 1).unwrap();
        assert!(!object_is_active(&tracker, &trackers));

        trackers[0].start(0, 10).unwrap();
        assert!(object_is_active(&tracker, &trackers));
        assert!(trackers[0].complete(PathBuf::from("/dl/body"), FileVersion::new(2)));
        assert!(!is_complete(&tracker, &trackers));

        assert!(trackers[1].mark_gone());
        assert!(is_complete(&tracker, &trackers));
        assert_eq!(trackers[1].fail(3), DownloadFailure::Ignored);

        files[1].mark_gone(GoneReason::UserRemoved);
        let delivered = assemble(&object, &tracker, &trackers, &files);
        assert_eq!(delivered.files.len(), 2);
        assert_eq!(delivered.files[0].location, Some(PathBuf::from("/dl/body")));
        assert_eq!(delivered.files[1].gone, Some(GoneReason::UserRemoved));
    }

    #[test]
    fn needing_download_skips_queued_and_deleted() {
        let (object, files) = setup();
        let request = ObjectDownload::latest(object.group_id, &files[..1]);
        let (_, queued) = plan(&request, Some(&object), &files, 1).unwrap();

        let needed = needing_download(std::slice::from_ref(&object), &files, &queued);
        assert_eq!(needed.len(), 1);
        assert_eq!(needed[0].files.len(), 1);
        assert_eq!(needed[0].files[0].file_id, files[1].file_id);

        let mut deleted = object.clone();
        deleted.mark_deleted_on_server();
        assert!(needing_download(&[deleted], &files, &[]).is_empty());
    }
}
