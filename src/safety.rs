use std::fs;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Safety checks for files named by diagnostics before they are rewritten.
///
/// Diagnostics may point anywhere: into the project, into a vendored
/// dependency checkout, or into the toolchain itself. Only the first two are
/// ever patched.
#[derive(Debug, Clone)]
pub struct ProjectGuard {
    /// Absolute path to project root
    project_root: PathBuf,
    /// Canonical paths to forbidden directories
    forbidden_paths: Vec<PathBuf>,
}

/// Where a validated file lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOrigin {
    /// Source owned by the project being rewritten
    Project,
    /// Source inside a dependency checkout, normally read-only
    Dependency {
        /// Root directory of the checked-out package
        package: PathBuf,
    },
}

impl FileOrigin {
    /// Manifest to re-verify as an independent sub-project.
    pub fn package_manifest(&self) -> Option<PathBuf> {
        match self {
            FileOrigin::Project => None,
            FileOrigin::Dependency { package } => Some(package.join("Package.swift")),
        }
    }
}

#[derive(Error, Debug)]
pub enum SafetyError {
    #[error("Path is outside project: {path} (project: {project})")]
    OutsideProject { path: PathBuf, project: PathBuf },

    #[error("Path is in forbidden directory: {path} (forbidden: {forbidden})")]
    ForbiddenPath { path: PathBuf, forbidden: PathBuf },

    #[error("Failed to canonicalize path: {0}")]
    Canonicalize(#[from] std::io::Error),
}

impl ProjectGuard {
    /// Create a guard for the given project root.
    ///
    /// The toolchain directory, when known, is never writable.
    pub fn new(
        project_root: impl AsRef<Path>,
        toolchain: Option<&Path>,
    ) -> Result<Self, SafetyError> {
        let project_root = project_root.as_ref().canonicalize()?;

        let mut forbidden_paths = Vec::new();

        if let Some(toolchain) = toolchain {
            if let Ok(toolchain) = toolchain.canonicalize() {
                forbidden_paths.push(toolchain);
            }
        }

        // ~/Library/Developer/Toolchains - downloaded toolchains
        if let Some(home) = home::home_dir() {
            if let Ok(toolchains) = home.join("Library/Developer/Toolchains").canonicalize() {
                forbidden_paths.push(toolchains);
            }
        }

        // .build/ artifacts (checkouts are classified before this applies)
        if let Ok(build_dir) = project_root.join(".build").canonicalize() {
            forbidden_paths.push(build_dir);
        }

        Ok(Self {
            project_root,
            forbidden_paths,
        })
    }

    /// Check if a path is safe to rewrite and classify it.
    ///
    /// Returns the canonical path together with its origin.
    pub fn validate_path(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<(PathBuf, FileOrigin), SafetyError> {
        let path = path.as_ref();

        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_root.join(path)
        };

        let canonical = absolute.canonicalize()?;

        if let Some(package) = dependency_package(&canonical) {
            return Ok((canonical, FileOrigin::Dependency { package }));
        }

        if !canonical.starts_with(&self.project_root) {
            return Err(SafetyError::OutsideProject {
                path: canonical,
                project: self.project_root.clone(),
            });
        }

        for forbidden in &self.forbidden_paths {
            if canonical.starts_with(forbidden) {
                return Err(SafetyError::ForbiddenPath {
                    path: canonical,
                    forbidden: forbidden.clone(),
                });
            }
        }

        Ok((canonical, FileOrigin::Project))
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }
}

/// Package root for files under `.build/checkouts/<pkg>` or
/// `SourcePackages/checkouts/<pkg>`.
pub fn dependency_package(path: &Path) -> Option<PathBuf> {
    let components: Vec<Component<'_>> = path.components().collect();

    for (index, window) in components.windows(3).enumerate() {
        let (parent, checkouts, package) = (&window[0], &window[1], &window[2]);
        let is_checkouts = checkouts.as_os_str() == "checkouts"
            && (parent.as_os_str() == ".build" || parent.as_os_str() == "SourcePackages");
        if is_checkouts && matches!(package, Component::Normal(_)) {
            return Some(components[..index + 3].iter().collect());
        }
    }

    None
}

/// Dependency checkouts are read-only; make a file writable before patching.
pub fn make_writable(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o644))
    }

    #[cfg(not(unix))]
    {
        let mut permissions = fs::metadata(path)?.permissions();
        permissions.set_readonly(false);
        fs::set_permissions(path, permissions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_path_inside_project() {
        let temp_dir = tempfile::tempdir().unwrap();
        let project = temp_dir.path();
        let guard = ProjectGuard::new(project, None).unwrap();

        let file = project.join("Sources/App/Foo.swift");
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(&file, b"").unwrap();

        let (_, origin) = guard.validate_path(&file).unwrap();
        assert_eq!(origin, FileOrigin::Project);
    }

    #[test]
    fn test_validate_relative_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        let project = temp_dir.path();
        fs::write(project.join("Foo.swift"), b"").unwrap();

        let guard = ProjectGuard::new(project, None).unwrap();
        assert!(guard.validate_path("Foo.swift").is_ok());
    }

    #[test]
    fn test_validate_path_outside_project() {
        let temp_dir = tempfile::tempdir().unwrap();
        let project = temp_dir.path().join("project");
        fs::create_dir_all(&project).unwrap();
        let guard = ProjectGuard::new(&project, None).unwrap();

        let outside = temp_dir.path().join("Outside.swift");
        fs::write(&outside, b"").unwrap();

        let result = guard.validate_path(&outside);
        assert!(matches!(result, Err(SafetyError::OutsideProject { .. })));
    }

    #[test]
    fn test_validate_path_forbidden_toolchain() {
        let temp_dir = tempfile::tempdir().unwrap();
        let project = temp_dir.path();
        let toolchain = project.join("Xcode.app");
        let file = toolchain.join("usr/lib/Foundation.swiftinterface");
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(&file, b"").unwrap();

        let guard = ProjectGuard::new(project, Some(&toolchain)).unwrap();
        let result = guard.validate_path(&file);
        assert!(matches!(result, Err(SafetyError::ForbiddenPath { .. })));
    }

    #[test]
    fn test_build_artifacts_forbidden_but_checkouts_allowed() {
        let temp_dir = tempfile::tempdir().unwrap();
        let project = temp_dir.path();

        let artifact = project.join(".build/debug/Gen.swift");
        fs::create_dir_all(artifact.parent().unwrap()).unwrap();
        fs::write(&artifact, b"").unwrap();

        let checkout = project.join(".build/checkouts/Popen/Sources/Popen.swift");
        fs::create_dir_all(checkout.parent().unwrap()).unwrap();
        fs::write(&checkout, b"").unwrap();

        let guard = ProjectGuard::new(project, None).unwrap();
        assert!(matches!(
            guard.validate_path(&artifact),
            Err(SafetyError::ForbiddenPath { .. })
        ));

        let (_, origin) = guard.validate_path(&checkout).unwrap();
        let manifest = origin.package_manifest().unwrap();
        assert!(manifest.ends_with(".build/checkouts/Popen/Package.swift"));
    }

    #[test]
    fn test_dependency_package_detection() {
        let path = Path::new("/p/.build/checkouts/SwiftRegex5/Sources/SwiftRegex/Regex.swift");
        assert_eq!(
            dependency_package(path),
            Some(PathBuf::from("/p/.build/checkouts/SwiftRegex5"))
        );

        let path = Path::new("/d/SourcePackages/checkouts/DLKit/Sources/DLKit.swift");
        assert_eq!(
            dependency_package(path),
            Some(PathBuf::from("/d/SourcePackages/checkouts/DLKit"))
        );

        assert_eq!(dependency_package(Path::new("/p/Sources/checkouts/Foo.swift")), None);
    }

    #[test]
    #[cfg(unix)]
    fn test_make_writable() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = tempfile::tempdir().unwrap();
        let file = temp_dir.path().join("Dep.swift");
        fs::write(&file, b"").unwrap();
        fs::set_permissions(&file, fs::Permissions::from_mode(0o444)).unwrap();

        make_writable(&file).unwrap();
        let mode = fs::metadata(&file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }
}
