//! Syntax-oracle capability.
//!
//! The rewriter never parses Swift itself. Identifier occurrences, their
//! syntactic kind and inferred type text come from an external oracle
//! (typically a SourceKit syntax-map dump) behind [`SyntaxOracle`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// One identifier occurrence reported by the oracle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntaxSite {
    /// Byte offset of the occurrence in the unpatched file
    pub offset: usize,
    /// Syntactic kind tag, e.g. `source.lang.swift.decl.var.parameter`
    pub kind: String,
    /// Inferred type text, when the oracle knows it
    #[serde(default)]
    pub type_name: Option<String>,
}

impl SyntaxSite {
    pub fn new(offset: usize, kind: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            offset,
            kind: kind.into(),
            type_name: Some(type_name.into()),
        }
    }
}

#[derive(Error, Debug)]
pub enum OracleError {
    #[error("Cannot read site dump {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed site dump {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Source of syntax sites for a file.
pub trait SyntaxOracle {
    fn enumerate_sites(&self, file: &Path) -> Result<Vec<SyntaxSite>, OracleError>;
}

/// Sites loaded from a JSON dump keyed by file path.
///
/// Relative keys are resolved against the project root. Files absent from the
/// dump have no sites.
#[derive(Debug, Clone, Default)]
pub struct SiteMap {
    files: HashMap<PathBuf, Vec<SyntaxSite>>,
}

impl SiteMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `{ "<path>": [ {"offset": .., "kind": .., "type_name": ..} ] }`.
    pub fn load(path: &Path, project_root: &Path) -> Result<Self, OracleError> {
        let contents = fs::read_to_string(path).map_err(|source| OracleError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&contents, project_root).map_err(|source| OracleError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_json(json: &str, project_root: &Path) -> Result<Self, serde_json::Error> {
        let raw: HashMap<PathBuf, Vec<SyntaxSite>> = serde_json::from_str(json)?;
        let mut map = Self::new();
        for (file, sites) in raw {
            let file = if file.is_absolute() {
                file
            } else {
                project_root.join(file)
            };
            map.insert(file, sites);
        }
        Ok(map)
    }

    pub fn insert(&mut self, file: impl Into<PathBuf>, sites: Vec<SyntaxSite>) {
        self.files.entry(file.into()).or_default().extend(sites);
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl SyntaxOracle for SiteMap {
    fn enumerate_sites(&self, file: &Path) -> Result<Vec<SyntaxSite>, OracleError> {
        Ok(self.files.get(file).cloned().unwrap_or_default())
    }
}
