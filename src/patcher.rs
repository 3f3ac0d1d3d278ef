//! Transactional class-file substitution.
//!
//! A patch is installed by copying each replacement class file over the
//! installed one in the build directory, after backing the installed file up.
//! Restoring copies the backup back. The build directory is shared by every
//! patch of a run, so a failed backup or restore leaves it in an unknown
//! state and is reported as fatal.

use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

use crate::class_file;
use crate::errors::ObjSimError;

/// One substituted class file that can be put back.
#[derive(Debug)]
pub struct ReversibleEdit {
    class_name: String,
    installed: PathBuf,
    backup: PathBuf,
}

impl ReversibleEdit {
    /// Install `replacement` over the class it defines under `build_dir`.
    pub fn substitute(build_dir: &Path, replacement: &Path, backup_dir: &Path) -> Result<Self> {
        let bytes = std::fs::read(replacement).map_err(|source| ObjSimError::PatchInstall {
            path: replacement.to_path_buf(),
            source,
        })?;
        let class_name =
            class_file::class_name(&bytes).map_err(|e| ObjSimError::MalformedClassFile {
                path: replacement.to_path_buf(),
                reason: e.to_string(),
            })?;
        let installed = class_file::installed_path(build_dir, &class_name);
        let backup = backup_dir.join(format!("{}.class.bak", class_name));

        std::fs::create_dir_all(backup_dir).map_err(|source| ObjSimError::PatchInstall {
            path: backup_dir.to_path_buf(),
            source,
        })?;
        std::fs::copy(&installed, &backup).map_err(|source| ObjSimError::PatchInstall {
            path: installed.clone(),
            source,
        })?;

        let edit = Self {
            class_name,
            installed,
            backup,
        };
        if let Err(source) = std::fs::write(&edit.installed, &bytes) {
            let path = edit.installed.clone();
            // Partial writes must not survive.
            edit.restore()?;
            return Err(ObjSimError::PatchInstall { path, source }.into());
        }
        debug!(
            class = %edit.class_name,
            installed = %edit.installed.display(),
            "substituted class file"
        );
        Ok(edit)
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn installed_path(&self) -> &Path {
        &self.installed
    }

    /// Copy the backup back over the installed file and delete the backup.
    pub fn restore(self) -> Result<(), ObjSimError> {
        std::fs::copy(&self.backup, &self.installed).map_err(|e| ObjSimError::PatchRestore {
            path: self.installed.clone(),
            reason: format!("copy from backup {} failed: {}", self.backup.display(), e),
        })?;
        std::fs::remove_file(&self.backup).map_err(|e| ObjSimError::PatchRestore {
            path: self.installed.clone(),
            reason: format!("could not delete backup {}: {}", self.backup.display(), e),
        })?;
        debug!(class = %self.class_name, "restored class file");
        Ok(())
    }
}

/// All class-file substitutions of one patch.
///
/// Dropping a transaction that was never restored restores it on a
/// best-effort basis.
#[derive(Debug)]
pub struct PatchTransaction {
    patch_id: u64,
    edits: Vec<ReversibleEdit>,
}

impl PatchTransaction {
    /// Install every replacement, or none of them.
    pub fn apply(
        patch_id: u64,
        build_dir: &Path,
        replacements: &[PathBuf],
        backup_dir: &Path,
    ) -> Result<Self> {
        let mut txn = Self {
            patch_id,
            edits: Vec::with_capacity(replacements.len()),
        };
        for replacement in replacements {
            match ReversibleEdit::substitute(build_dir, replacement, backup_dir) {
                Ok(edit) => txn.edits.push(edit),
                Err(e) => {
                    warn!(
                        patch_id,
                        file = %replacement.display(),
                        "substitution failed, rolling back"
                    );
                    txn.restore()?;
                    return Err(e);
                }
            }
        }
        Ok(txn)
    }

    pub fn edits(&self) -> &[ReversibleEdit] {
        &self.edits
    }

    /// Restore every edit, most recent first.
    ///
    /// Every edit is attempted even after a failure; the first failure is
    /// returned.
    pub fn restore(mut self) -> Result<(), ObjSimError> {
        self.restore_all()
    }

    fn restore_all(&mut self) -> Result<(), ObjSimError> {
        let mut first_err = None;
        while let Some(edit) = self.edits.pop() {
            if let Err(e) = edit.restore() {
                error!(patch_id = self.patch_id, error = %e, "restore failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for PatchTransaction {
    fn drop(&mut self) {
        if !self.edits.is_empty() {
            warn!(patch_id = self.patch_id, "patch dropped while applied, restoring");
            let _ = self.restore_all();
        }
    }
}
