//! Recognition of Swift compiler diagnostics.
//!
//! Each recognised `error:` line becomes an [`ErrorPatch`]: a line/column
//! anchor plus a [`LineRewrite`] that is resolved against the file later.
//! Protocols named by diagnostics are added to the registry as they appear.

use crate::cache;
use crate::registry::{ProtocolOrigin, ProtocolRegistry};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// A pattern/template pair applied to one line.
///
/// The pattern's first capture group is the text replaced; the template may
/// refer to any group of the pattern (`$2`).
#[derive(Debug, Clone)]
pub struct LineRewrite {
    pub pattern: Regex,
    pub template: String,
}

/// A fix anchored at a diagnostic's position.
#[derive(Debug, Clone)]
pub struct ErrorPatch {
    /// File as named by the diagnostic
    pub file: PathBuf,
    /// 1-based line
    pub line: usize,
    /// 1-based column, when reported
    pub column: Option<usize>,
    pub rewrite: LineRewrite,
}

/// Result of parsing one build or compile output.
#[derive(Debug)]
pub enum ParseOutcome {
    /// Every line was consumed
    Completed {
        patches: Vec<ErrorPatch>,
        /// Error lines matching no known shape, verbatim
        unrecognized: Vec<String>,
    },
    /// The build environment was repaired; diagnostics from this pass are
    /// not meaningful and the pass should be retried
    Aborted,
}

#[derive(Error, Debug)]
pub enum DiagnosticError {
    #[error("No precompiled header matching {prefix}*{suffix}")]
    NoPchCandidate { prefix: String, suffix: String },

    #[error("Cannot link precompiled header {path}: {source}")]
    PchLink {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid fixup pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Line-oriented parser for compiler output.
pub struct DiagnosticParser {
    location: Regex,
    use_as_type: Regex,
    no_effect: Regex,
    override_mismatch: Regex,
    opaque_return: Regex,
    constrained_opaque: Regex,
    missing_pch: Regex,
}

impl Default for DiagnosticParser {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagnosticParser {
    pub fn new() -> Self {
        let compile = |pattern: &str| Regex::new(pattern).expect("diagnostic pattern is valid");
        Self {
            location: compile(r"^([^:]+):(\d+)(?::(\d+))?: error: (.*)$"),
            use_as_type: compile(
                r"use of (?:protocol )?'(?:[^'.]+\.)*?(\w+)(?:\.Type)?' (?:\(aka '[^']+'\) )?as a type",
            ),
            no_effect: compile(
                r"'any' has no effect on (?:type parameter|concrete type) '(?:[^'.]+\.)*?(\w+\??)(?:\.Type)?'",
            ),
            override_mismatch: compile(
                r"instance method cannot be (?:an implementation|a member) of an @objc|method does not override any method from its superclass|initializer does not override a designated initializer",
            ),
            opaque_return: compile(r"'some' return types are only available in"),
            constrained_opaque: compile(
                r"type 'some ([^']+)' constrained to non-protocol, non-class type",
            ),
            missing_pch: compile(
                r"PCH file '(([^']+?-Bridging-Header-swift_)\w+(-clang_\w+\.pch))' not found:",
            ),
        }
    }

    /// Parse `lines`, registering newly diagnosed protocols.
    ///
    /// A missing precompiled header triggers the symlink repair and aborts
    /// the pass immediately.
    pub fn parse<I, S>(&self, lines: I, registry: &mut ProtocolRegistry) -> ParseOutcome
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut patches = Vec::new();
        let mut unrecognized = Vec::new();

        for line in lines {
            let line = line.as_ref();

            if let Some(caps) = self.missing_pch.captures(line) {
                match repair_pch(&caps[1], &caps[2], &caps[3]) {
                    Ok(target) => info!(
                        missing = &caps[1],
                        target = %target.display(),
                        "linked precompiled header"
                    ),
                    Err(e) => warn!(error = %e, "precompiled header repair failed"),
                }
                return ParseOutcome::Aborted;
            }

            let Some(caps) = self.location.captures(line) else {
                continue;
            };
            let file = PathBuf::from(&caps[1]);
            let Ok(line_number) = caps[2].parse::<usize>() else {
                continue;
            };
            let column = caps.get(3).and_then(|m| m.as_str().parse::<usize>().ok());
            let message = &caps[4];

            match self.classify(message, &file, registry) {
                Ok(Some(rewrite)) => {
                    debug!(file = %file.display(), line = line_number, %message, "recognised diagnostic");
                    patches.push(ErrorPatch {
                        file,
                        line: line_number,
                        column,
                        rewrite,
                    });
                }
                Ok(None) => unrecognized.push(line.to_string()),
                Err(e) => {
                    warn!(error = %e, %message, "cannot build fixup");
                    unrecognized.push(line.to_string());
                }
            }
        }

        ParseOutcome::Completed {
            patches,
            unrecognized,
        }
    }

    /// Map a message to its rewrite, or `None` when it has no known shape.
    fn classify(
        &self,
        message: &str,
        file: &Path,
        registry: &mut ProtocolRegistry,
    ) -> Result<Option<LineRewrite>, DiagnosticError> {
        if let Some(caps) = self.use_as_type.captures(message) {
            let name = &caps[1];
            register(registry, name, file);
            return rewrite(
                &format!(r"\b((?:\w+\.)?{})\b", regex::escape(name)),
                "any ${1}",
            )
            .map(Some);
        }

        if let Some(caps) = self.no_effect.captures(message) {
            let name = &caps[1];
            register(registry, name.trim_end_matches('?'), file);
            return rewrite(
                &format!(r"(any ((?:\w+\.)*{}))", regex::escape(name)),
                "${2}",
            )
            .map(Some);
        }

        if self.override_mismatch.is_match(message) {
            return rewrite(r"[^)]+ (some) ", "any").map(Some);
        }

        if self.opaque_return.is_match(message) {
            return rewrite(r"-> (some) ", "any").map(Some);
        }

        if let Some(caps) = self.constrained_opaque.captures(message) {
            return rewrite(&format!("(some ){}", regex::escape(&caps[1])), "").map(Some);
        }

        Ok(None)
    }
}

fn rewrite(pattern: &str, template: &str) -> Result<LineRewrite, DiagnosticError> {
    Ok(LineRewrite {
        pattern: cache::get_or_compile(pattern)?,
        template: template.to_string(),
    })
}

fn register(registry: &mut ProtocolRegistry, name: &str, file: &Path) {
    if registry.insert(name, ProtocolOrigin::File(file.to_path_buf())) {
        info!(protocol = name, file = %file.display(), "registered protocol from diagnostic");
    }
}

/// Link a missing `<prefix><hash><suffix>` header to an existing sibling
/// sharing the same prefix and suffix.
pub fn repair_pch(missing: &str, prefix: &str, suffix: &str) -> Result<PathBuf, DiagnosticError> {
    let missing_path = Path::new(missing);
    let prefix_path = Path::new(prefix);
    let no_candidate = || DiagnosticError::NoPchCandidate {
        prefix: prefix.to_string(),
        suffix: suffix.to_string(),
    };

    let dir = prefix_path.parent().ok_or_else(no_candidate)?;
    let stem = prefix_path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(no_candidate)?;

    let mut candidates: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|source| DiagnosticError::PchLink {
            path: missing_path.to_path_buf(),
            source,
        })?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.as_path() != missing_path)
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(stem) && name.ends_with(suffix))
        })
        .collect();
    candidates.sort();

    let target = candidates.into_iter().next().ok_or_else(no_candidate)?;
    symlink(&target, missing_path).map_err(|source| DiagnosticError::PchLink {
        path: missing_path.to_path_buf(),
        source,
    })?;
    Ok(target)
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    fs::copy(target, link).map(|_| ())
}
