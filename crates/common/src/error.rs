//! Error types for meshsync
//!
//! The taxonomy follows how failures propagate through a reconciliation pass:
//! load and auth failures abort the request, control-plane failures are
//! recorded per entity, validation failures block an apply before any
//! mutation.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for control-plane calls
pub type ControlPlaneResult<T> = std::result::Result<T, ControlPlaneError>;

/// The three desired-state documents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Document {
    Users,
    Routes,
    Acl,
}

impl Document {
    /// File name of the document inside the data directory
    pub fn file_name(&self) -> &'static str {
        match self {
            Document::Users => "users.yaml",
            Document::Routes => "routes.yaml",
            Document::Acl => "acls.yaml",
        }
    }
}

impl std::fmt::Display for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Document::Users => write!(f, "users"),
            Document::Routes => write!(f, "routes"),
            Document::Acl => write!(f, "ACL"),
        }
    }
}

/// A desired-state document could not be loaded
#[derive(Error, Debug)]
#[error("failed to load {document} document {}: {kind}", .path.display())]
pub struct LoadError {
    pub document: Document,
    pub path: PathBuf,
    #[source]
    pub kind: LoadErrorKind,
}

#[derive(Error, Debug)]
pub enum LoadErrorKind {
    #[error("document not found")]
    Missing,

    #[error("read failed: {0}")]
    Read(std::io::Error),

    #[error("malformed document: {0}")]
    Malformed(serde_yaml::Error),
}

impl LoadError {
    pub fn is_missing(&self) -> bool {
        matches!(self.kind, LoadErrorKind::Missing)
    }
}

/// A call to the remote control plane failed
#[derive(Error, Debug)]
pub enum ControlPlaneError {
    #[error("{operation}: transport error: {message}")]
    Transport {
        operation: &'static str,
        message: String,
    },

    #[error("{operation}: control plane returned HTTP {status}: {body}")]
    Status {
        operation: &'static str,
        status: u16,
        body: String,
    },

    #[error("{operation}: unexpected response: {message}")]
    Decode {
        operation: &'static str,
        message: String,
    },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{operation}: {message}")]
    Rejected {
        operation: &'static str,
        message: String,
    },
}

impl ControlPlaneError {
    pub fn rejected(operation: &'static str, message: impl Into<String>) -> Self {
        ControlPlaneError::Rejected {
            operation,
            message: message.into(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        ControlPlaneError::NotFound {
            kind,
            id: id.into(),
        }
    }
}

/// Referential integrity or syntax violations in desired state
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}", .issues.join("; "))]
pub struct ValidationError {
    pub issues: Vec<String>,
}

/// Bearer credential missing or wrong
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing bearer token")]
    Missing,

    #[error("invalid bearer token")]
    Invalid,
}

/// A write to the desired-state store failed
#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to encode {document} document: {source}")]
    Encode {
        document: Document,
        source: serde_yaml::Error,
    },

    #[error("{kind} {id} not found in config")]
    NotFound { kind: &'static str, id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_error_names_document() {
        let err = LoadError {
            document: Document::Routes,
            path: PathBuf::from("/data/routes.yaml"),
            kind: LoadErrorKind::Missing,
        };
        let msg = err.to_string();
        assert!(msg.contains("routes"));
        assert!(msg.contains("/data/routes.yaml"));
        assert!(err.is_missing());
    }

    #[test]
    fn test_validation_error_joins_issues() {
        let err = ValidationError {
            issues: vec![
                "undefined tag reference: tag:eng".to_string(),
                "undefined group reference: group:ops".to_string(),
            ],
        };
        assert_eq!(
            err.to_string(),
            "undefined tag reference: tag:eng; undefined group reference: group:ops"
        );
    }

    #[test]
    fn test_control_plane_error_display() {
        let err = ControlPlaneError::Status {
            operation: "create user",
            status: 500,
            body: "boom".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "create user: control plane returned HTTP 500: boom"
        );
    }
}
