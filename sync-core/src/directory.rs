//! Local mirror of the objects and files the server knows about.
//!
//! The directory holds plain rows plus the checks that keep them honest:
//! object types and group membership never change, versions never move
//! backwards and deletion flags only ever go from `false` to `true`.
//!
//! [`upsert_from_server_index`] folds a server index into the rows and
//! reports what changed, without touching any storage.

use objsync_types::{FileGroupId, FileId, FileRecord, FileVersion, GoneReason, SharingGroupId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::registry::{ObjectRegistry, RegistryError};

/// Errors raised by directory invariant checks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    /// A version would move backwards.
    #[error("version of file {file_id} would regress from {current} to {proposed}")]
    VersionRegression {
        /// The file.
        file_id: FileId,
        /// The stored version.
        current: FileVersion,
        /// The rejected version.
        proposed: FileVersion,
    },

    /// A deletion flag would be cleared.
    #[error("deletion flag of {id} cannot be cleared")]
    DeletionFlagRegression {
        /// Display form of the object or file id.
        id: String,
    },

    /// A batch contains files with and without a server version.
    #[error("batch mixes first uploads with changes to existing files")]
    MixedVersions,

    /// A batch contains no files.
    #[error("batch contains no files")]
    EmptyBatch,

    /// The server reports a different object type than the one stored.
    #[error("object {group_id} is a {stored}, server reports {reported}")]
    ObjectTypeChanged {
        /// The object.
        group_id: FileGroupId,
        /// The stored type.
        stored: String,
        /// The type the server reported.
        reported: String,
    },

    /// The server reports a different sharing group than the one stored.
    #[error("object {group_id} changed sharing group")]
    SharingGroupChanged {
        /// The object.
        group_id: FileGroupId,
    },

    /// A file would move to a different object.
    #[error("file {file_id} cannot move to another object")]
    FileMoved {
        /// The file.
        file_id: FileId,
    },

    /// A file's label would change.
    #[error("file {file_id} is labelled {stored}, server reports {reported}")]
    LabelChanged {
        /// The file.
        file_id: FileId,
        /// The stored label.
        stored: String,
        /// The label the server reported.
        reported: String,
    },

    /// Two server files claim the same label within one object.
    #[error("label {label} of object {group_id} is already in use")]
    LabelInUse {
        /// The object.
        group_id: FileGroupId,
        /// The contested label.
        label: String,
    },

    /// The entry does not match any registered declaration.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Clear-to-set transition shared by all deletion flags.
fn advance_flag(flag: &mut bool, value: bool, id: impl ToString) -> Result<bool, DirectoryError> {
    match (*flag, value) {
        (true, false) => Err(DirectoryError::DeletionFlagRegression { id: id.to_string() }),
        (false, true) => {
            *flag = true;
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// An object (file group) known to this device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEntry {
    /// The object.
    pub group_id: FileGroupId,
    /// Owning sharing group.
    pub sharing_group: SharingGroupId,
    /// Declared object type. Never changes once stored.
    pub object_type: String,
    /// The app deleted the object, or acknowledged its server deletion.
    pub deleted_locally: bool,
    /// The server no longer has the object.
    pub deleted_on_server: bool,
}

impl ObjectEntry {
    /// Create a live object.
    pub fn new(group_id: FileGroupId, sharing_group: SharingGroupId, object_type: &str) -> Self {
        Self {
            group_id,
            sharing_group,
            object_type: object_type.to_string(),
            deleted_locally: false,
            deleted_on_server: false,
        }
    }

    /// True if either deletion flag is set.
    pub fn is_deleted(&self) -> bool {
        self.deleted_locally || self.deleted_on_server
    }

    /// Set or confirm the local deletion flag.
    ///
    /// Returns whether the flag changed.
    pub fn set_deleted_locally(&mut self, deleted: bool) -> Result<bool, DirectoryError> {
        advance_flag(&mut self.deleted_locally, deleted, self.group_id)
    }

    /// Set or confirm the server deletion flag.
    ///
    /// Returns whether the flag changed.
    pub fn set_deleted_on_server(&mut self, deleted: bool) -> Result<bool, DirectoryError> {
        advance_flag(&mut self.deleted_on_server, deleted, self.group_id)
    }

    /// Mark deleted locally. Returns whether the flag changed.
    pub fn mark_deleted_locally(&mut self) -> bool {
        !std::mem::replace(&mut self.deleted_locally, true)
    }

    /// Mark deleted on the server. Returns whether the flag changed.
    pub fn mark_deleted_on_server(&mut self) -> bool {
        !std::mem::replace(&mut self.deleted_on_server, true)
    }

    /// The server deleted the object and the app has not dealt with it yet.
    pub fn needs_local_deletion(&self) -> bool {
        self.deleted_on_server && !self.deleted_locally
    }
}

/// A file known to this device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// The file.
    pub file_id: FileId,
    /// Owning object. Never changes once stored.
    pub group_id: FileGroupId,
    /// Label, unique within the object.
    pub file_label: String,
    /// MIME type of the latest known version.
    pub mime_type: String,
    /// Last version this device produced or downloaded.
    pub local_version: Option<FileVersion>,
    /// Last version known to exist on the server.
    pub server_version: Option<FileVersion>,
    /// Why the server reported the file gone, if it did.
    pub gone_reason: Option<GoneReason>,
    /// The app deleted the file.
    pub deleted_locally: bool,
    /// The server no longer has the file.
    pub deleted_on_server: bool,
}

impl FileEntry {
    /// Create an entry for a file that exists only on this device.
    pub fn new_local(file_id: FileId, group_id: FileGroupId, file_label: &str, mime_type: &str) -> Self {
        Self {
            file_id,
            group_id,
            file_label: file_label.to_string(),
            mime_type: mime_type.to_string(),
            local_version: None,
            server_version: None,
            gone_reason: None,
            deleted_locally: false,
            deleted_on_server: false,
        }
    }

    /// Create an entry for a file first seen in the server index.
    pub fn from_record(record: &FileRecord) -> Self {
        Self {
            file_id: record.file_id,
            group_id: record.group_id,
            file_label: record.file_label.clone(),
            mime_type: record.mime_type.clone(),
            local_version: None,
            server_version: Some(record.server_version),
            gone_reason: None,
            deleted_locally: false,
            deleted_on_server: record.deleted,
        }
    }

    /// True if either deletion flag is set.
    pub fn is_deleted(&self) -> bool {
        self.deleted_locally || self.deleted_on_server
    }

    /// Record a version known to exist on the server.
    ///
    /// Returns whether the stored version changed.
    pub fn record_server_version(&mut self, version: FileVersion) -> Result<bool, DirectoryError> {
        match self.server_version {
            Some(current) if version < current => Err(DirectoryError::VersionRegression {
                file_id: self.file_id,
                current,
                proposed: version,
            }),
            Some(current) if version == current => Ok(false),
            _ => {
                self.server_version = Some(version);
                Ok(true)
            }
        }
    }

    /// Record a version this device now holds.
    ///
    /// A downloaded version newer than the known server version raises the
    /// server version with it, keeping `local <= server`.
    pub fn record_downloaded_version(&mut self, version: FileVersion) -> Result<bool, DirectoryError> {
        if let Some(current) = self.local_version {
            if version < current {
                return Err(DirectoryError::VersionRegression {
                    file_id: self.file_id,
                    current,
                    proposed: version,
                });
            }
        }

        let raised = match self.server_version {
            Some(server) if server >= version => false,
            _ => self.record_server_version(version)?,
        };
        let changed = self.local_version != Some(version);
        self.local_version = Some(version);
        Ok(changed || raised)
    }

    /// Record a version this device uploaded and the server accepted.
    ///
    /// The server may already know a newer version from another device;
    /// that version is kept and only `local_version` moves up. Fails only
    /// when this device already holds something newer than `version`.
    pub fn record_uploaded_version(&mut self, version: FileVersion) -> Result<bool, DirectoryError> {
        if let Some(local) = self.local_version {
            if version < local {
                return Err(DirectoryError::VersionRegression {
                    file_id: self.file_id,
                    current: local,
                    proposed: version,
                });
            }
        }
        self.record_downloaded_version(version)
    }

    /// Apply a server-reported deletion state.
    pub fn set_deleted_on_server(&mut self, deleted: bool) -> Result<bool, DirectoryError> {
        advance_flag(&mut self.deleted_on_server, deleted, self.file_id)
    }

    /// Mark deleted locally. Returns whether the flag changed.
    pub fn mark_deleted_locally(&mut self) -> bool {
        !std::mem::replace(&mut self.deleted_locally, true)
    }

    /// Mark deleted on the server. Returns whether the flag changed.
    pub fn mark_deleted_on_server(&mut self) -> bool {
        !std::mem::replace(&mut self.deleted_on_server, true)
    }

    /// The server reported the file gone. Every reason counts as deletion.
    pub fn mark_gone(&mut self, reason: GoneReason) -> bool {
        let changed = self.gone_reason != Some(reason);
        self.gone_reason = Some(reason);
        self.mark_deleted_on_server() || changed
    }

    /// The server has a version this device does not hold yet.
    pub fn needs_download(&self) -> bool {
        if self.is_deleted() {
            return false;
        }
        match (self.local_version, self.server_version) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(local), Some(server)) => local < server,
        }
    }
}

/// A sharing group the user belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharingGroupEntry {
    /// The sharing group.
    pub sharing_group: SharingGroupId,
    /// Optional display name.
    pub name: Option<String>,
    /// The group was removed on the server.
    pub deleted: bool,
}

/// Whether a batch creates files or changes existing ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchKind {
    /// No file has a server version yet.
    AllV0,
    /// Every file already has a server version.
    AllVN,
}

impl BatchKind {
    /// True for a first-upload batch.
    pub fn is_v0(&self) -> bool {
        matches!(self, Self::AllV0)
    }
}

/// Classify a batch by the server versions of its members.
pub fn batch_kind(
    server_versions: impl IntoIterator<Item = Option<FileVersion>>,
) -> Result<BatchKind, DirectoryError> {
    let mut with_version = 0usize;
    let mut without = 0usize;
    for version in server_versions {
        match version {
            Some(_) => with_version += 1,
            None => without += 1,
        }
    }
    match (with_version, without) {
        (0, 0) => Err(DirectoryError::EmptyBatch),
        (0, _) => Ok(BatchKind::AllV0),
        (_, 0) => Ok(BatchKind::AllVN),
        _ => Err(DirectoryError::MixedVersions),
    }
}

/// Classify a batch of stored files.
pub fn versions_of_all_files<'a>(
    files: impl IntoIterator<Item = &'a FileEntry>,
) -> Result<BatchKind, DirectoryError> {
    batch_kind(files.into_iter().map(|f| f.server_version))
}

/// Files of one object the server deleted during a reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDeletion {
    /// The object.
    pub group_id: FileGroupId,
    /// Files newly marked deleted on the server.
    pub files: Vec<FileId>,
    /// Every file of the object is gone, so the object is too.
    pub whole_object: bool,
}

/// A server record the directory refused to merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRecord {
    /// The file named by the record.
    pub file_id: FileId,
    /// The object named by the record.
    pub group_id: FileGroupId,
    /// Why it was rejected.
    pub error: DirectoryError,
}

/// A server file that took a label still held by a file this device has
/// not finished uploading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelConflict {
    /// The object.
    pub group_id: FileGroupId,
    /// The contested label.
    pub file_label: String,
    /// Id of the local, never-uploaded file.
    pub local_file_id: FileId,
    /// Id of the file the server kept.
    pub server_file_id: FileId,
    /// Version of the server file.
    pub server_version: FileVersion,
}

/// Everything [`upsert_from_server_index`] decided.
#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    /// Object rows to write.
    pub objects: Vec<ObjectEntry>,
    /// File rows to write.
    pub files: Vec<FileEntry>,
    /// Newly detected server deletions, per object.
    pub deletions: Vec<ServerDeletion>,
    /// Records that were not merged.
    pub rejected: Vec<RejectedRecord>,
    /// New server files colliding with local-only files.
    pub label_conflicts: Vec<LabelConflict>,
}

impl Reconciliation {
    /// True if nothing needs to be written or reported.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
            && self.files.is_empty()
            && self.deletions.is_empty()
            && self.rejected.is_empty()
            && self.label_conflicts.is_empty()
    }
}

/// Merge server index records into the stored directory.
///
/// `objects` and `files` are the current rows. Nothing is mutated; the
/// returned [`Reconciliation`] lists the rows to write and what the caller
/// should report.
pub fn upsert_from_server_index(
    objects: &BTreeMap<FileGroupId, ObjectEntry>,
    files: &BTreeMap<FileId, FileEntry>,
    records: &[FileRecord],
    registry: &ObjectRegistry,
) -> Reconciliation {
    let mut merge = Merge {
        objects,
        files,
        registry,
        changed_objects: BTreeMap::new(),
        changed_files: BTreeMap::new(),
        labels: files
            .values()
            .filter(|f| !f.is_deleted())
            .map(|f| ((f.group_id, f.file_label.clone()), f.file_id))
            .collect(),
        newly_deleted: BTreeMap::new(),
        out: Reconciliation::default(),
    };

    for record in records {
        if let Err(error) = merge.apply(record) {
            merge.out.rejected.push(RejectedRecord {
                file_id: record.file_id,
                group_id: record.group_id,
                error,
            });
        }
    }

    merge.finish()
}

struct Merge<'a> {
    objects: &'a BTreeMap<FileGroupId, ObjectEntry>,
    files: &'a BTreeMap<FileId, FileEntry>,
    registry: &'a ObjectRegistry,
    changed_objects: BTreeMap<FileGroupId, ObjectEntry>,
    changed_files: BTreeMap<FileId, FileEntry>,
    labels: BTreeMap<(FileGroupId, String), FileId>,
    newly_deleted: BTreeMap<FileGroupId, Vec<FileId>>,
    out: Reconciliation,
}

impl Merge<'_> {
    fn object(&self, group_id: &FileGroupId) -> Option<&ObjectEntry> {
        self.changed_objects
            .get(group_id)
            .or_else(|| self.objects.get(group_id))
    }

    fn file(&self, file_id: &FileId) -> Option<&FileEntry> {
        self.changed_files
            .get(file_id)
            .or_else(|| self.files.get(file_id))
    }

    fn apply(&mut self, record: &FileRecord) -> Result<(), DirectoryError> {
        self.registry
            .validate_labels(&record.object_type, [record.file_label.as_str()])?;

        let new_object = match self.object(&record.group_id) {
            Some(object) => {
                if object.object_type != record.object_type {
                    return Err(DirectoryError::ObjectTypeChanged {
                        group_id: record.group_id,
                        stored: object.object_type.clone(),
                        reported: record.object_type.clone(),
                    });
                }
                if object.sharing_group != record.sharing_group {
                    return Err(DirectoryError::SharingGroupChanged {
                        group_id: record.group_id,
                    });
                }
                None
            }
            None => Some(ObjectEntry::new(
                record.group_id,
                record.sharing_group,
                &record.object_type,
            )),
        };

        match self.file(&record.file_id).cloned() {
            Some(existing) => self.merge_known(existing, record)?,
            None => {
                if !self.merge_new(record)? {
                    return Ok(());
                }
            }
        }

        if let Some(object) = new_object {
            self.changed_objects.insert(object.group_id, object);
        }
        Ok(())
    }

    fn merge_known(&mut self, existing: FileEntry, record: &FileRecord) -> Result<(), DirectoryError> {
        if existing.group_id != record.group_id {
            return Err(DirectoryError::FileMoved {
                file_id: record.file_id,
            });
        }
        if existing.file_label != record.file_label {
            return Err(DirectoryError::LabelChanged {
                file_id: record.file_id,
                stored: existing.file_label.clone(),
                reported: record.file_label.clone(),
            });
        }

        let mut updated = existing.clone();
        let newly_deleted = updated.set_deleted_on_server(record.deleted)?;
        updated.record_server_version(record.server_version)?;
        if !record.deleted && updated.mime_type != record.mime_type {
            updated.mime_type = record.mime_type.clone();
        }

        if newly_deleted {
            self.newly_deleted
                .entry(record.group_id)
                .or_default()
                .push(record.file_id);
        }
        if updated != existing {
            self.changed_files.insert(updated.file_id, updated);
        }
        Ok(())
    }

    /// Returns false when the record was diverted into a label conflict.
    fn merge_new(&mut self, record: &FileRecord) -> Result<bool, DirectoryError> {
        let key = (record.group_id, record.file_label.clone());
        if let Some(holder) = self.labels.get(&key).and_then(|id| self.file(id)) {
            if holder.server_version.is_some() {
                return Err(DirectoryError::LabelInUse {
                    group_id: record.group_id,
                    label: record.file_label.clone(),
                });
            }
            self.out.label_conflicts.push(LabelConflict {
                group_id: record.group_id,
                file_label: record.file_label.clone(),
                local_file_id: holder.file_id,
                server_file_id: record.file_id,
                server_version: record.server_version,
            });
            return Ok(false);
        }

        let entry = FileEntry::from_record(record);
        if !entry.is_deleted() {
            self.labels.insert(key, entry.file_id);
        }
        self.changed_files.insert(entry.file_id, entry);
        Ok(true)
    }

    fn finish(mut self) -> Reconciliation {
        let touched: BTreeSet<FileGroupId> = self
            .changed_files
            .values()
            .map(|f| f.group_id)
            .collect();

        let mut whole: BTreeSet<FileGroupId> = BTreeSet::new();
        for group_id in touched {
            let mut members = self
                .files
                .values()
                .filter(|f| f.group_id == group_id)
                .map(|f| self.changed_files.get(&f.file_id).unwrap_or(f))
                .chain(
                    self.changed_files
                        .values()
                        .filter(|f| f.group_id == group_id && !self.files.contains_key(&f.file_id)),
                )
                .peekable();

            if members.peek().is_none() || !members.all(|f| f.deleted_on_server) {
                continue;
            }

            let Some(mut object) = self.object(&group_id).cloned() else {
                continue;
            };
            if object.mark_deleted_on_server() {
                if self.objects.contains_key(&group_id) {
                    whole.insert(group_id);
                }
                self.changed_objects.insert(group_id, object);
            }
        }

        let groups: BTreeSet<FileGroupId> = self
            .newly_deleted
            .keys()
            .copied()
            .chain(whole.iter().copied())
            .collect();
        for group_id in groups {
            self.out.deletions.push(ServerDeletion {
                group_id,
                files: self.newly_deleted.remove(&group_id).unwrap_or_default(),
                whole_object: whole.contains(&group_id),
            });
        }

        self.out.objects = self.changed_objects.into_values().collect();
        self.out.files = self.changed_files.into_values().collect();
        self.out
    }
}
