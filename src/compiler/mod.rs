//! Compiler integration: building the project, parsing diagnostics and
//! applying the fixes they imply.
//!
//! The build itself is behind [`BuildSystem`] so the feedback loop can be
//! driven by a scripted build in tests. [`ShellToolchain`] is the real
//! implementation for SwiftPM packages and Xcode projects.
//!
//! # Example
//!
//! ```no_run
//! use existential_patcher::compiler::{FeedbackLoop, ShellToolchain};
//! use existential_patcher::project::Project;
//! use existential_patcher::{ProjectGuard, ProtocolRegistry, RewriteConfig};
//! use std::path::Path;
//!
//! let project = Project::resolve(Path::new("/path/to/Package.swift")).unwrap();
//! let guard = ProjectGuard::new(&project.root, None).unwrap();
//! let mut registry = ProtocolRegistry::discover(&project.root).unwrap();
//! let mut build = ShellToolchain::new(project, "/Applications/Xcode.app");
//!
//! let config = RewriteConfig::default();
//! let report = FeedbackLoop::new(&mut build, &guard, &mut registry, &config).run();
//! println!("{:?}", report.outcome);
//! ```

pub mod autofix;
pub mod diagnostic;
pub mod feedback;
pub mod invocation;

pub use autofix::apply_error_patches;
pub use diagnostic::{DiagnosticError, DiagnosticParser, ErrorPatch, LineRewrite, ParseOutcome};
pub use feedback::{FeedbackLoop, Outcome, VerifyReport};
pub use invocation::{capture_invocations, sanitize};

use crate::project::{Project, ProjectKind};
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::debug;

/// Exit status and merged stdout/stderr of one child process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub success: bool,
    pub lines: Vec<String>,
}

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` could not be executed (exit status {code})")]
    NotRunnable { command: String, code: i32 },

    #[error("Checkpoint failed: {0}")]
    Checkpoint(String),
}

/// Build capabilities consumed by the feedback loop.
pub trait BuildSystem {
    /// Rebuild the whole project with the existential feature enabled.
    ///
    /// `Err` means the build could not be run at all, not that it failed.
    fn build(&mut self) -> Result<ProcessOutput, RunnerError>;

    /// Run one sanitised per-file compiler invocation.
    fn compile(&mut self, invocation: &str) -> Result<ProcessOutput, RunnerError>;

    /// Record the tree's state before the first diagnostic fixup.
    fn checkpoint(&mut self) -> Result<(), RunnerError>;

    /// Per-file invocations available for the fallback compile.
    fn invocations(&self) -> &[String] {
        &[]
    }
}

/// Shell-backed builds for SwiftPM packages and Xcode projects.
#[derive(Debug)]
pub struct ShellToolchain {
    project: Project,
    toolchain: PathBuf,
    invocations: Vec<String>,
}

impl ShellToolchain {
    /// `toolchain` is either an Xcode application bundle or a toolchain root
    /// containing `usr/bin/swift`.
    pub fn new(project: Project, toolchain: impl Into<PathBuf>) -> Self {
        Self {
            project,
            toolchain: toolchain.into(),
            invocations: Vec::new(),
        }
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    fn swift(&self) -> PathBuf {
        let standalone = self.toolchain.join("usr/bin/swift");
        if standalone.exists() {
            return standalone;
        }
        self.toolchain
            .join("Contents/Developer/Toolchains/XcodeDefault.xctoolchain/usr/bin/swift")
    }

    fn xcodebuild(&self) -> PathBuf {
        self.toolchain.join("Contents/Developer/usr/bin/xcodebuild")
    }

    /// Clean verbose build, keeping every per-file frontend invocation.
    pub fn capture_invocations(&mut self) -> Result<usize, RunnerError> {
        let command = match self.project.kind {
            ProjectKind::Package => {
                let swift = shell_quote(&self.swift());
                format!("{swift} package clean && {swift} build -v")
            }
            ProjectKind::Xcode => {
                let xcodebuild = shell_quote(&self.xcodebuild());
                let project = shell_quote(&self.project.path);
                format!("{xcodebuild} clean -project {project}; {xcodebuild} -project {project}")
            }
        };
        let output = run_shell(&command, &self.project.root)?;
        self.invocations = capture_invocations(&output.lines);
        Ok(self.invocations.len())
    }
}

impl BuildSystem for ShellToolchain {
    fn build(&mut self) -> Result<ProcessOutput, RunnerError> {
        let command = match self.project.kind {
            ProjectKind::Package => format!(
                "{} build -Xswiftc -enable-upcoming-feature -Xswiftc ExistentialAny",
                shell_quote(&self.swift())
            ),
            ProjectKind::Xcode => {
                let xcodebuild = shell_quote(&self.xcodebuild());
                let build = format!(
                    "{xcodebuild} OTHER_SWIFT_FLAGS='-DDEBUG -enable-upcoming-feature ExistentialAny' -project {}",
                    shell_quote(&self.project.path)
                );
                format!("{build} || ({xcodebuild} clean && {build})")
            }
        };
        let mut output = run_shell(&command, &self.project.root)?;
        output.lines.sort();
        output.lines.dedup();
        Ok(output)
    }

    fn compile(&mut self, invocation: &str) -> Result<ProcessOutput, RunnerError> {
        run_shell(invocation, &self.project.root)
    }

    fn checkpoint(&mut self) -> Result<(), RunnerError> {
        let output = run_shell("git add .", &self.project.root)?;
        if output.success {
            Ok(())
        } else {
            Err(RunnerError::Checkpoint(output.lines.join("\n")))
        }
    }

    fn invocations(&self) -> &[String] {
        &self.invocations
    }
}

/// Run `command` through `sh`, merging stderr into stdout.
fn run_shell(command: &str, dir: &Path) -> Result<ProcessOutput, RunnerError> {
    debug!(%command, dir = %dir.display(), "running");
    let output = Command::new("sh")
        .arg("-c")
        .arg(format!("({command}) 2>&1"))
        .current_dir(dir)
        .output()
        .map_err(|source| RunnerError::Spawn {
            command: command.to_string(),
            source,
        })?;

    // 126/127: the shell could not find or execute the program
    if let Some(code @ (126 | 127)) = output.status.code() {
        return Err(RunnerError::NotRunnable {
            command: command.to_string(),
            code,
        });
    }

    Ok(ProcessOutput {
        success: output.status.success(),
        lines: String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect(),
    })
}

fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', r"'\''"))
}
