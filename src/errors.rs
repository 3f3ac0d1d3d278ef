//! Classified failures.
//!
//! Most code propagates `anyhow::Error` with context. The conditions below
//! need to be recognized by callers, so they are raised as [`ObjSimError`]
//! and found again with `downcast_ref`.
//!
//! | Class | Examples | Effect |
//! |-------|----------|--------|
//! | Input | bad CSV row, unnormalizable test name | run refuses to start |
//! | Fatal | backup/restore failure, unresolved member name | run aborts, no further patches |
//! | Session | worker crash, protocol violation | partial results, patch still scored |

use std::fmt;
use std::path::PathBuf;

use objsim_types::DomainKind;

#[derive(Debug)]
pub enum ObjSimError {
    /// A patch record could not be parsed.
    InvalidRecord { row: usize, reason: String },

    /// Installing a replacement class file (or backing up the installed one)
    /// failed.
    PatchInstall {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The build directory could not be put back into its original state.
    PatchRestore { path: PathBuf, reason: String },

    /// A name expected in a reloaded index domain is missing.
    UnresolvedMember { domain: DomainKind, name: String },

    /// A class file could not be parsed.
    MalformedClassFile { path: PathBuf, reason: String },
}

impl ObjSimError {
    /// Whether the run must stop immediately.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ObjSimError::PatchInstall { .. }
                | ObjSimError::PatchRestore { .. }
                | ObjSimError::UnresolvedMember { .. }
        )
    }
}

impl fmt::Display for ObjSimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjSimError::InvalidRecord { row, reason } => {
                write!(f, "invalid patch record at row {}: {}", row, reason)
            }
            ObjSimError::PatchInstall { path, source } => {
                write!(f, "failed to install class file {}: {}", path.display(), source)
            }
            ObjSimError::PatchRestore { path, reason } => write!(
                f,
                "FATAL: failed to restore original class file {}: {}",
                path.display(),
                reason
            ),
            ObjSimError::UnresolvedMember { domain, name } => write!(
                f,
                "FATAL: {} domain has no entry for {}",
                domain.file_stem(),
                name
            ),
            ObjSimError::MalformedClassFile { path, reason } => {
                write!(f, "malformed class file {}: {}", path.display(), reason)
            }
        }
    }
}

impl std::error::Error for ObjSimError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ObjSimError::PatchInstall { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Whether any error in the chain is a fatal [`ObjSimError`].
pub fn is_fatal(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<ObjSimError>())
        .any(ObjSimError::is_fatal)
}
