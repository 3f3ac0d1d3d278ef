//! Name <-> dense index bijections.
//!
//! Instrumented code refers to methods and fields by small integers; the
//! domains translate them back. A domain only grows, and indices are handed
//! out in first-seen order starting at zero, so a saved domain reloads to the
//! exact same mapping. Domains are not synchronized; wrap one in a mutex when
//! several threads register names.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use objsim_types::DomainKind;

use crate::errors::ObjSimError;
use crate::paths::atomic_write_json;

#[derive(Debug, Clone)]
pub struct IndexDomain {
    kind: DomainKind,
    names: Vec<String>,
    index: HashMap<String, u32>,
}

impl IndexDomain {
    pub fn new(kind: DomainKind) -> Self {
        Self {
            kind,
            names: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Rebuild a domain from names listed in index order.
    pub fn from_names<I, S>(kind: DomainKind, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut domain = Self::new(kind);
        for name in names {
            domain.get_or_add(name.into());
        }
        domain
    }

    pub fn kind(&self) -> DomainKind {
        self.kind
    }

    pub fn get_or_add(&mut self, name: impl Into<String>) -> u32 {
        let name = name.into();
        if let Some(&idx) = self.index.get(&name) {
            return idx;
        }
        let idx = self.names.len() as u32;
        self.index.insert(name.clone(), idx);
        self.names.push(name);
        idx
    }

    pub fn get(&self, index: u32) -> Option<&str> {
        self.names.get(index as usize).map(String::as_str)
    }

    pub fn index_of(&self, name: &str) -> Option<u32> {
        self.index.get(name).copied()
    }

    /// Like [`index_of`](Self::index_of), but a missing name is fatal.
    pub fn resolve(&self, name: &str) -> Result<u32, ObjSimError> {
        self.index_of(name)
            .ok_or_else(|| ObjSimError::UnresolvedMember {
                domain: self.kind,
                name: name.to_string(),
            })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn file_path(dir: &Path, kind: DomainKind) -> PathBuf {
        dir.join(format!("{}.dom.json", kind.file_stem()))
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        atomic_write_json(&Self::file_path(dir, self.kind), &self.names)
    }

    pub fn load(dir: &Path, kind: DomainKind) -> Result<Self> {
        let path = Self::file_path(dir, kind);
        let data = std::fs::read(&path)
            .with_context(|| format!("Failed to read index domain {}", path.display()))?;
        let names: Vec<String> = serde_json::from_slice(&data)
            .with_context(|| format!("Failed to parse index domain {}", path.display()))?;
        let listed = names.len();
        let domain = Self::from_names(kind, names);
        if domain.len() != listed {
            bail!(
                "Index domain {} lists {} names but only {} are distinct",
                path.display(),
                listed,
                domain.len()
            );
        }
        Ok(domain)
    }

    /// Load the domain if it was saved, otherwise start empty.
    pub fn load_or_new(dir: &Path, kind: DomainKind) -> Result<Self> {
        if Self::file_path(dir, kind).exists() {
            Self::load(dir, kind)
        } else {
            Ok(Self::new(kind))
        }
    }
}
