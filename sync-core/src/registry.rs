//! Declared-object registry.
//!
//! Applications describe each kind of object they sync as an
//! [`ObjectDeclaration`]: a named set of file labels, the MIME types each
//! label accepts, and optionally the name of the server-side change resolver
//! that merges incremental (vN) uploads for that label.
//!
//! Declarations evolve across app versions. Labels may be added, but once a
//! label has been registered it can never be removed, because objects already
//! on the server may carry files under it.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Errors from registering or validating against declarations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The object type name is empty.
    #[error("object type name must not be empty")]
    EmptyObjectType,

    /// The declaration has no file labels.
    #[error("object type {object_type} declares no files")]
    NoFiles {
        /// The offending object type.
        object_type: String,
    },

    /// A label was declared twice.
    #[error("object type {object_type} declares label {label} more than once")]
    DuplicateLabel {
        /// The offending object type.
        object_type: String,
        /// The repeated label.
        label: String,
    },

    /// A label accepts no MIME types.
    #[error("label {label} of {object_type} accepts no mime types")]
    NoMimeTypes {
        /// The offending object type.
        object_type: String,
        /// The label without MIME types.
        label: String,
    },

    /// A re-registration dropped a previously registered label.
    #[error("label {label} of {object_type} was registered before and cannot be removed")]
    LabelRemoved {
        /// The offending object type.
        object_type: String,
        /// The missing label.
        label: String,
    },

    /// No declaration exists for the object type.
    #[error("unknown object type: {0}")]
    UnknownObjectType(String),

    /// The label is not part of the object type's declaration.
    #[error("label {label} is not declared for {object_type}")]
    UndeclaredLabel {
        /// The object type.
        object_type: String,
        /// The undeclared label.
        label: String,
    },

    /// The MIME type is not accepted for the label.
    #[error("mime type {mime_type} is not allowed for label {label}")]
    MimeTypeNotAllowed {
        /// The label.
        label: String,
        /// The rejected MIME type.
        mime_type: String,
    },
}

/// Declaration of one file within an object type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDeclaration {
    /// Label identifying the file within its object.
    pub file_label: String,
    /// MIME types accepted for this file.
    pub mime_types: BTreeSet<String>,
    /// Server-side resolver applied to vN uploads, if the file may change.
    pub change_resolver: Option<String>,
}

impl FileDeclaration {
    /// Declare a file accepting a single MIME type.
    pub fn new(file_label: &str, mime_type: &str) -> Self {
        Self {
            file_label: file_label.to_string(),
            mime_types: BTreeSet::from([mime_type.to_string()]),
            change_resolver: None,
        }
    }

    /// Accept an additional MIME type.
    pub fn with_mime_type(mut self, mime_type: &str) -> Self {
        self.mime_types.insert(mime_type.to_string());
        self
    }

    /// Set the change resolver that allows vN uploads.
    pub fn with_change_resolver(mut self, resolver: &str) -> Self {
        self.change_resolver = Some(resolver.to_string());
        self
    }

    /// Check whether the MIME type is accepted.
    pub fn allows(&self, mime_type: &str) -> bool {
        self.mime_types.contains(mime_type)
    }
}

/// Declaration of an object type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDeclaration {
    /// Name of the object type.
    pub object_type: String,
    /// Declared files.
    pub files: Vec<FileDeclaration>,
}

impl ObjectDeclaration {
    /// Start a declaration with no files.
    pub fn new(object_type: &str) -> Self {
        Self {
            object_type: object_type.to_string(),
            files: Vec::new(),
        }
    }

    /// Add a file declaration.
    pub fn with_file(mut self, file: FileDeclaration) -> Self {
        self.files.push(file);
        self
    }

    /// Look up the declaration of a label.
    pub fn file(&self, label: &str) -> Option<&FileDeclaration> {
        self.files.iter().find(|f| f.file_label == label)
    }

    /// All declared labels.
    pub fn labels(&self) -> BTreeSet<&str> {
        self.files.iter().map(|f| f.file_label.as_str()).collect()
    }

    /// Check the declaration is well formed on its own.
    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.object_type.trim().is_empty() {
            return Err(RegistryError::EmptyObjectType);
        }
        if self.files.is_empty() {
            return Err(RegistryError::NoFiles {
                object_type: self.object_type.clone(),
            });
        }

        let mut seen = BTreeSet::new();
        for file in &self.files {
            if !seen.insert(file.file_label.as_str()) {
                return Err(RegistryError::DuplicateLabel {
                    object_type: self.object_type.clone(),
                    label: file.file_label.clone(),
                });
            }
            if file.mime_types.is_empty() {
                return Err(RegistryError::NoMimeTypes {
                    object_type: self.object_type.clone(),
                    label: file.file_label.clone(),
                });
            }
        }
        Ok(())
    }

    /// Validate a file against this declaration.
    ///
    /// Returns the file's declaration on success.
    pub fn check_file(&self, label: &str, mime_type: &str) -> Result<&FileDeclaration, RegistryError> {
        let file = self.file(label).ok_or_else(|| RegistryError::UndeclaredLabel {
            object_type: self.object_type.clone(),
            label: label.to_string(),
        })?;
        if !file.allows(mime_type) {
            return Err(RegistryError::MimeTypeNotAllowed {
                label: label.to_string(),
                mime_type: mime_type.to_string(),
            });
        }
        Ok(file)
    }
}

/// Result of a successful registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// First time this object type was registered.
    Added,
    /// Identical to the stored declaration.
    Unchanged,
    /// Labels were added or MIME types / resolvers changed.
    Updated,
}

/// The set of declared object types known to this device.
#[derive(Debug, Clone, Default)]
pub struct ObjectRegistry {
    declarations: BTreeMap<String, ObjectDeclaration>,
}

impl ObjectRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a registry from previously persisted declarations.
    ///
    /// Persisted declarations were validated when they were registered, so
    /// they are taken as-is.
    pub fn from_declarations(declarations: impl IntoIterator<Item = ObjectDeclaration>) -> Self {
        Self {
            declarations: declarations
                .into_iter()
                .map(|d| (d.object_type.clone(), d))
                .collect(),
        }
    }

    /// Register or update an object type.
    pub fn register(&mut self, declaration: ObjectDeclaration) -> Result<Registration, RegistryError> {
        declaration.validate()?;

        let Some(existing) = self.declarations.get(&declaration.object_type) else {
            self.declarations
                .insert(declaration.object_type.clone(), declaration);
            return Ok(Registration::Added);
        };

        if *existing == declaration {
            return Ok(Registration::Unchanged);
        }

        let new_labels = declaration.labels();
        if let Some(removed) = existing.labels().into_iter().find(|l| !new_labels.contains(l)) {
            return Err(RegistryError::LabelRemoved {
                object_type: declaration.object_type.clone(),
                label: removed.to_string(),
            });
        }

        self.declarations
            .insert(declaration.object_type.clone(), declaration);
        Ok(Registration::Updated)
    }

    /// Look up a declaration.
    pub fn declaration(&self, object_type: &str) -> Option<&ObjectDeclaration> {
        self.declarations.get(object_type)
    }

    /// Look up a declaration, failing for unknown object types.
    pub fn require(&self, object_type: &str) -> Result<&ObjectDeclaration, RegistryError> {
        self.declaration(object_type)
            .ok_or_else(|| RegistryError::UnknownObjectType(object_type.to_string()))
    }

    /// Check that every label belongs to the object type's declaration.
    pub fn validate_labels<'a>(
        &self,
        object_type: &str,
        labels: impl IntoIterator<Item = &'a str>,
    ) -> Result<&ObjectDeclaration, RegistryError> {
        let declaration = self.require(object_type)?;
        for label in labels {
            if declaration.file(label).is_none() {
                return Err(RegistryError::UndeclaredLabel {
                    object_type: object_type.to_string(),
                    label: label.to_string(),
                });
            }
        }
        Ok(declaration)
    }

    /// Number of registered object types.
    pub fn len(&self) -> usize {
        self.declarations.len()
    }

    /// Check if nothing has been registered.
    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }

    /// Iterate over all declarations.
    pub fn iter(&self) -> impl Iterator<Item = &ObjectDeclaration> {
        self.declarations.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document() -> ObjectDeclaration {
        ObjectDeclaration::new("document")
            .with_file(FileDeclaration::new("body", "text/plain").with_change_resolver("append"))
            .with_file(FileDeclaration::new("cover", "image/jpeg").with_mime_type("image/png"))
    }

    #[test]
    fn register_new_type() {
        let mut registry = ObjectRegistry::new();
        assert_eq!(registry.register(document()).unwrap(), Registration::Added);
        assert_eq!(registry.len(), 1);
        assert!(registry.declaration("document").is_some());
    }

    #[test]
    fn register_same_declaration_is_unchanged() {
        let mut registry = ObjectRegistry::new();
        registry.register(document()).unwrap();
        assert_eq!(registry.register(document()).unwrap(), Registration::Unchanged);
    }

    #[test]
    fn adding_a_label_is_an_update() {
        let mut registry = ObjectRegistry::new();
        registry.register(document()).unwrap();

        let extended = document().with_file(FileDeclaration::new("notes", "text/markdown"));
        assert_eq!(registry.register(extended).unwrap(), Registration::Updated);
        assert!(registry.require("document").unwrap().file("notes").is_some());
    }

    #[test]
    fn removing_a_label_is_rejected() {
        let mut registry = ObjectRegistry::new();
        registry.register(document()).unwrap();

        let shrunk = ObjectDeclaration::new("document")
            .with_file(FileDeclaration::new("body", "text/plain"));
        let err = registry.register(shrunk).unwrap_err();
        assert_eq!(
            err,
            RegistryError::LabelRemoved {
                object_type: "document".into(),
                label: "cover".into()
            }
        );
        // Original stays in place
        assert_eq!(registry.require("document").unwrap().files.len(), 2);
    }

    #[test]
    fn duplicate_labels_are_rejected() {
        let decl = ObjectDeclaration::new("pair")
            .with_file(FileDeclaration::new("a", "text/plain"))
            .with_file(FileDeclaration::new("a", "text/plain"));
        assert!(matches!(
            decl.validate(),
            Err(RegistryError::DuplicateLabel { .. })
        ));
    }

    #[test]
    fn empty_declarations_are_rejected() {
        assert_eq!(
            ObjectDeclaration::new("  ").validate(),
            Err(RegistryError::EmptyObjectType)
        );
        assert!(matches!(
            ObjectDeclaration::new("empty").validate(),
            Err(RegistryError::NoFiles { .. })
        ));
    }

    #[test]
    fn label_without_mime_types_is_rejected() {
        let mut file = FileDeclaration::new("raw", "application/octet-stream");
        file.mime_types.clear();
        let decl = ObjectDeclaration::new("raw").with_file(file);
        assert!(matches!(
            decl.validate(),
            Err(RegistryError::NoMimeTypes { .. })
        ));
    }

    #[test]
    fn validate_labels_finds_undeclared() {
        let mut registry = ObjectRegistry::new();
        registry.register(document()).unwrap();

        assert!(registry.validate_labels("document", ["body", "cover"]).is_ok());
        assert!(matches!(
            registry.validate_labels("document", ["body", "thumbnail"]),
            Err(RegistryError::UndeclaredLabel { .. })
        ));
        assert!(matches!(
            registry.validate_labels("photo", ["body"]),
            Err(RegistryError::UnknownObjectType(_))
        ));
    }

    #[test]
    fn check_file_validates_mime_type() {
        let decl = document();
        assert!(decl.check_file("cover", "image/png").is_ok());
        assert!(matches!(
            decl.check_file("cover", "text/plain"),
            Err(RegistryError::MimeTypeNotAllowed { .. })
        ));
    }

    #[test]
    fn from_declarations_restores_types() {
        let registry = ObjectRegistry::from_declarations(vec![document()]);
        assert_eq!(registry.iter().count(), 1);
        assert!(!registry.is_empty());
    }
}
