//! Resolution of the project argument.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Build system owning the project.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectKind {
    /// SwiftPM package (`Package.swift`)
    Package,
    /// Xcode project bundle (`.xcodeproj`)
    Xcode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub kind: ProjectKind,
    /// `Package.swift` or the `.xcodeproj` bundle
    pub path: PathBuf,
    /// Directory the build runs in; all sources live below it
    pub root: PathBuf,
    pub name: String,
}

#[derive(Error, Debug)]
pub enum ProjectError {
    #[error("Project path does not exist: {path}")]
    NotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Not a Package.swift, .xcodeproj or package directory: {0}")]
    Unsupported(PathBuf),
}

impl Project {
    /// Accepts a `Package.swift`, an `.xcodeproj`, or a directory containing
    /// `Package.swift`.
    pub fn resolve(path: &Path) -> Result<Self, ProjectError> {
        let path = path.canonicalize().map_err(|source| ProjectError::NotFound {
            path: path.to_path_buf(),
            source,
        })?;

        if path.is_dir() && path.join("Package.swift").is_file() {
            return Self::resolve(&path.join("Package.swift"));
        }

        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| ProjectError::Unsupported(path.clone()))?;

        if path.file_name().is_some_and(|name| name == "Package.swift") {
            let name = dir_name(&parent);
            return Ok(Self {
                kind: ProjectKind::Package,
                path,
                root: parent,
                name,
            });
        }

        if path.extension().is_some_and(|ext| ext == "xcodeproj") {
            let name = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
            return Ok(Self {
                kind: ProjectKind::Xcode,
                path,
                root: parent,
                name,
            });
        }

        Err(ProjectError::Unsupported(path))
    }
}

fn dir_name(dir: &Path) -> String {
    dir.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
