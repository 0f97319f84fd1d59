//! The compile → diagnose → patch loop.
//!
//! Runs as an explicit state machine:
//!
//! ```text
//! Rebuild ──Ok──▶ Parse ──▶ Patch ──(patches)──▶ Rebuild (next round)
//!    │              │         └──(none)──▶ Done
//!    └──Err──▶ Fallback ──▶ Patch
//! ```
//!
//! The round budget bounds the number of builds. A parse aborted by an
//! environment repair consumes its round.

use crate::compiler::autofix::apply_error_patches;
use crate::compiler::diagnostic::{DiagnosticParser, ErrorPatch, ParseOutcome};
use crate::compiler::invocation::{primary_file, sanitize};
use crate::compiler::BuildSystem;
use crate::config::RewriteConfig;
use crate::edit::SourceFile;
use crate::patch::fix_optionals;
use crate::registry::ProtocolRegistry;
use crate::safety::{make_writable, FileOrigin, ProjectGuard};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, warn};

/// How verification ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The project built with no errors after `rounds` fixup rounds
    Converged { rounds: usize },
    /// Nothing left to fix automatically, but errors remain
    Unresolved { errors: Vec<String> },
    /// The round budget ran out while fixups were still being produced
    BudgetExhausted { rounds: usize, pending: usize },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Converged { .. })
    }
}

#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub outcome: Outcome,
    /// Diagnostic fixups attempted across all rounds
    pub fixups: usize,
    /// Manifests of dependency packages that were patched and should be
    /// verified on their own
    pub dependency_manifests: Vec<PathBuf>,
}

#[derive(Debug)]
enum State {
    Rebuild {
        round: usize,
    },
    Fallback {
        round: usize,
        reason: String,
    },
    Parse {
        round: usize,
        lines: Vec<String>,
    },
    Patch {
        round: usize,
        patches: Vec<ErrorPatch>,
        unrecognized: Vec<String>,
    },
    Done(Outcome),
}

/// Bounded diagnostic-driven repair of a rewritten project.
pub struct FeedbackLoop<'a, B: BuildSystem> {
    build: &'a mut B,
    guard: &'a ProjectGuard,
    registry: &'a mut ProtocolRegistry,
    parser: DiagnosticParser,
    rounds: usize,
    compile_retries: usize,
    strip_flags: Vec<String>,
    checkpointed: bool,
    fixups: usize,
    dependency_manifests: BTreeSet<PathBuf>,
    started: Instant,
}

impl<'a, B: BuildSystem> FeedbackLoop<'a, B> {
    pub fn new(
        build: &'a mut B,
        guard: &'a ProjectGuard,
        registry: &'a mut ProtocolRegistry,
        config: &RewriteConfig,
    ) -> Self {
        Self {
            build,
            guard,
            registry,
            parser: DiagnosticParser::new(),
            rounds: config.budget.rounds.max(1),
            compile_retries: config.budget.compile_retries.max(1),
            strip_flags: config.build.strip_flags.clone(),
            checkpointed: false,
            fixups: 0,
            dependency_manifests: BTreeSet::new(),
            started: Instant::now(),
        }
    }

    /// Drive the loop to a terminal outcome.
    pub fn run(mut self) -> VerifyReport {
        let mut state = State::Rebuild { round: 1 };

        let outcome = loop {
            state = match state {
                State::Rebuild { round } => self.rebuild(round),
                State::Fallback { round, reason } => self.fallback(round, reason),
                State::Parse { round, lines } => self.parse(round, lines),
                State::Patch {
                    round,
                    patches,
                    unrecognized,
                } => self.patch(round, patches, unrecognized),
                State::Done(outcome) => break outcome,
            };
        };

        VerifyReport {
            outcome,
            fixups: self.fixups,
            dependency_manifests: self.dependency_manifests.into_iter().collect(),
        }
    }

    fn rebuild(&mut self, round: usize) -> State {
        info!(round, "rebuilding to verify");
        match self.build.build() {
            Ok(output) => {
                if !output.success {
                    debug!(round, lines = output.lines.len(), "build reported failure");
                }
                State::Parse {
                    round,
                    lines: output.lines,
                }
            }
            Err(e) => {
                warn!(error = %e, "build could not run, compiling files individually");
                State::Fallback {
                    round,
                    reason: e.to_string(),
                }
            }
        }
    }

    fn parse(&mut self, round: usize, lines: Vec<String>) -> State {
        match self.parser.parse(&lines, self.registry) {
            ParseOutcome::Completed {
                patches,
                unrecognized,
            } => State::Patch {
                round,
                patches,
                unrecognized,
            },
            ParseOutcome::Aborted => {
                info!(round, "build environment repaired, rebuilding");
                self.next_round(round, 0)
            }
        }
    }

    /// Compile each captured invocation on its own, retrying passes that were
    /// aborted by an environment repair.
    fn fallback(&mut self, round: usize, reason: String) -> State {
        let invocations = self.build.invocations().to_vec();
        if invocations.is_empty() {
            warn!("no captured compiler invocations to fall back on");
            return State::Done(Outcome::Unresolved {
                errors: vec![reason],
            });
        }

        let mut patches = Vec::new();
        let mut unrecognized = Vec::new();

        for invocation in &invocations {
            let command = sanitize(invocation, &self.strip_flags);
            let file = primary_file(invocation).unwrap_or("<unknown>");

            for attempt in 1..=self.compile_retries {
                let output = match self.build.compile(&command) {
                    Ok(output) => output,
                    Err(e) => {
                        warn!(file, error = %e, "could not compile");
                        break;
                    }
                };
                match self.parser.parse(&output.lines, self.registry) {
                    ParseOutcome::Completed {
                        patches: found,
                        unrecognized: errors,
                    } => {
                        patches.extend(found);
                        unrecognized.extend(errors);
                        break;
                    }
                    ParseOutcome::Aborted => {
                        debug!(file, attempt, "compile aborted by environment repair");
                    }
                }
            }
        }

        State::Patch {
            round,
            patches,
            unrecognized,
        }
    }

    fn patch(
        &mut self,
        round: usize,
        patches: Vec<ErrorPatch>,
        unrecognized: Vec<String>,
    ) -> State {
        if patches.is_empty() {
            let errors: BTreeSet<String> = unrecognized.into_iter().collect();
            info!(
                rounds = round - 1,
                errors = errors.len(),
                elapsed_secs = self.started.elapsed().as_secs(),
                "completed fixups"
            );
            return State::Done(if errors.is_empty() {
                Outcome::Converged { rounds: round - 1 }
            } else {
                Outcome::Unresolved {
                    errors: errors.into_iter().collect(),
                }
            });
        }

        let count = patches.len();
        let mut by_file: BTreeMap<PathBuf, Vec<ErrorPatch>> = BTreeMap::new();
        for patch in patches {
            by_file.entry(patch.file.clone()).or_default().push(patch);
        }

        let mut applied = 0;
        for (file, file_patches) in &by_file {
            applied += self.patch_file(file, file_patches);
        }

        self.fixups += count;
        info!(
            round,
            fixups = count,
            applied,
            elapsed_secs = self.started.elapsed().as_secs(),
            "fixups after round"
        );

        self.next_round(round, count)
    }

    fn next_round(&self, round: usize, pending: usize) -> State {
        if round >= self.rounds {
            State::Done(Outcome::BudgetExhausted {
                rounds: round,
                pending,
            })
        } else {
            State::Rebuild { round: round + 1 }
        }
    }

    /// Apply one file's fixups. Failures are logged and the file skipped.
    fn patch_file(&mut self, file: &PathBuf, patches: &[ErrorPatch]) -> usize {
        let (path, origin) = match self.guard.validate_path(file) {
            Ok(validated) => validated,
            Err(e) => {
                warn!(file = %file.display(), error = %e, "refusing to patch");
                return 0;
            }
        };

        if !self.checkpointed {
            self.checkpointed = true;
            if let Err(e) = self.build.checkpoint() {
                warn!(error = %e, "checkpoint failed, continuing without it");
            }
        }

        if let FileOrigin::Dependency { .. } = &origin {
            warn!(file = %path.display(), "patching file in dependency");
            if let Err(e) = make_writable(&path) {
                warn!(file = %path.display(), error = %e, "cannot make dependency writable");
            }
            if let Some(manifest) = origin.package_manifest() {
                self.dependency_manifests.insert(manifest);
            }
        }

        let mut source = match SourceFile::read(&path) {
            Ok(source) => source,
            Err(e) => {
                warn!(error = %e, "skipping unreadable file");
                return 0;
            }
        };

        let refs: Vec<&ErrorPatch> = patches.iter().collect();
        let (patched, applied) = apply_error_patches(source.content(), &refs);
        let (patched, _) = fix_optionals(&patched, self.registry);
        source.set_content(patched);

        if let Err(e) = source.commit() {
            warn!(file = %path.display(), error = %e, "failed to write fixups");
            return 0;
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{ProcessOutput, RunnerError};
    use std::collections::VecDeque;
    use std::fs;
    use std::path::Path;

    /// Build whose outputs are scripted per call.
    struct ScriptedBuild {
        builds: VecDeque<Result<ProcessOutput, RunnerError>>,
        compiles: VecDeque<ProcessOutput>,
        invocations: Vec<String>,
        build_calls: usize,
        compile_calls: usize,
        checkpoints: usize,
    }

    impl ScriptedBuild {
        fn new() -> Self {
            Self {
                builds: VecDeque::new(),
                compiles: VecDeque::new(),
                invocations: Vec::new(),
                build_calls: 0,
                compile_calls: 0,
                checkpoints: 0,
            }
        }

        fn then_build(mut self, lines: &[String]) -> Self {
            self.builds.push_back(Ok(ProcessOutput {
                success: lines.is_empty(),
                lines: lines.to_vec(),
            }));
            self
        }
    }

    impl BuildSystem for ScriptedBuild {
        fn build(&mut self) -> Result<ProcessOutput, RunnerError> {
            self.build_calls += 1;
            self.builds.pop_front().unwrap_or_else(|| Ok(ProcessOutput::default()))
        }

        fn compile(&mut self, _invocation: &str) -> Result<ProcessOutput, RunnerError> {
            self.compile_calls += 1;
            Ok(self.compiles.pop_front().unwrap_or_default())
        }

        fn checkpoint(&mut self) -> Result<(), RunnerError> {
            self.checkpoints += 1;
            Ok(())
        }

        fn invocations(&self) -> &[String] {
            &self.invocations
        }
    }

    fn not_runnable() -> RunnerError {
        RunnerError::NotRunnable {
            command: "xcodebuild".to_string(),
            code: 127,
        }
    }

    fn use_as_type(file: &Path, line: usize) -> String {
        format!(
            "{}:{line}:8: error: use of protocol 'Worker' as a type",
            file.display()
        )
    }

    fn project(lines: usize) -> (tempfile::TempDir, PathBuf) {
        let temp_dir = tempfile::tempdir().unwrap();
        let file = temp_dir.path().join("Foo.swift");
        let source: String = (1..=lines).map(|n| format!("let w{n}: Worker\n")).collect();
        fs::write(&file, source).unwrap();
        let file = file.canonicalize().unwrap();
        (temp_dir, file)
    }

    fn run(build: &mut ScriptedBuild, root: &Path, config: &RewriteConfig) -> VerifyReport {
        let guard = ProjectGuard::new(root, None).unwrap();
        let mut registry = ProtocolRegistry::new();
        FeedbackLoop::new(build, &guard, &mut registry, config).run()
    }

    #[test]
    fn test_converges_after_k_rounds() {
        let (temp_dir, file) = project(3);
        let mut build = ScriptedBuild::new();
        for line in 1..=3 {
            build = build.then_build(&[use_as_type(&file, line)]);
        }

        let report = run(&mut build, temp_dir.path(), &RewriteConfig::default());

        assert_eq!(report.outcome, Outcome::Converged { rounds: 3 });
        assert_eq!(build.build_calls, 4);
        assert_eq!(build.checkpoints, 1);
        assert_eq!(report.fixups, 3);
        assert_eq!(
            fs::read_to_string(&file).unwrap(),
            "let w1: any Worker\nlet w2: any Worker\nlet w3: any Worker\n"
        );
    }

    #[test]
    fn test_budget_is_enforced() {
        let (temp_dir, file) = project(1);
        let mut config = RewriteConfig::default();
        config.budget.rounds = 4;

        let mut build = ScriptedBuild::new();
        // Points at a line that never changes
        for _ in 0..10 {
            build = build.then_build(&[use_as_type(&file, 7)]);
        }

        let report = run(&mut build, temp_dir.path(), &config);

        assert_eq!(
            report.outcome,
            Outcome::BudgetExhausted {
                rounds: 4,
                pending: 1
            }
        );
        assert_eq!(build.build_calls, 4);
    }

    #[test]
    fn test_unrecognized_errors_are_unresolved() {
        let (temp_dir, file) = project(1);
        let error = format!("{}:1:1: error: cannot find 'x' in scope", file.display());
        let mut build = ScriptedBuild::new().then_build(&[error.clone(), error.clone()]);

        let report = run(&mut build, temp_dir.path(), &RewriteConfig::default());

        assert_eq!(report.outcome, Outcome::Unresolved { errors: vec![error] });
        assert_eq!(build.checkpoints, 0);
    }

    #[test]
    fn test_clean_build_converges_immediately() {
        let (temp_dir, _) = project(1);
        let mut build = ScriptedBuild::new();

        let report = run(&mut build, temp_dir.path(), &RewriteConfig::default());

        assert_eq!(report.outcome, Outcome::Converged { rounds: 0 });
        assert_eq!(build.build_calls, 1);
    }

    #[test]
    fn test_fallback_compiles_each_invocation() {
        let (temp_dir, file) = project(1);
        let mut build = ScriptedBuild::new();
        build.builds.push_back(Err(not_runnable()));
        build.invocations = vec![format!(
            "swift-frontend -frontend -c -primary-file {} -o Foo.o",
            file.display()
        )];
        // First attempt hits the PCH repair and is retried.
        build.compiles.push_back(ProcessOutput {
            success: false,
            lines: vec!["<unknown>:0: error: PCH file '/nonexistent/X-Bridging-Header-swift_A-clang_B.pch' not found: gone".to_string()],
        });
        build.compiles.push_back(ProcessOutput {
            success: false,
            lines: vec![use_as_type(&file, 1)],
        });

        let report = run(&mut build, temp_dir.path(), &RewriteConfig::default());

        assert_eq!(build.compile_calls, 2);
        assert_eq!(report.outcome, Outcome::Converged { rounds: 1 });
        assert_eq!(fs::read_to_string(&file).unwrap(), "let w1: any Worker\n");
    }

    #[test]
    fn test_fallback_without_invocations_is_unresolved() {
        let (temp_dir, _) = project(1);
        let mut build = ScriptedBuild::new();
        build.builds.push_back(Err(not_runnable()));

        let report = run(&mut build, temp_dir.path(), &RewriteConfig::default());

        assert!(matches!(report.outcome, Outcome::Unresolved { .. }));
    }

    #[test]
    fn test_files_outside_project_are_not_patched() {
        let (temp_dir, _) = project(1);
        let outside = tempfile::tempdir().unwrap();
        let foreign = outside.path().join("Other.swift");
        fs::write(&foreign, "let w: Worker\n").unwrap();

        let mut build = ScriptedBuild::new().then_build(&[use_as_type(&foreign, 1)]);
        let report = run(&mut build, temp_dir.path(), &RewriteConfig::default());

        assert_eq!(fs::read_to_string(&foreign).unwrap(), "let w: Worker\n");
        assert_eq!(report.outcome, Outcome::Converged { rounds: 1 });
    }

    #[test]
    fn test_dependency_files_are_made_writable_and_recorded() {
        let temp_dir = tempfile::tempdir().unwrap();
        let package = temp_dir.path().join(".build/checkouts/Popen");
        fs::create_dir_all(package.join("Sources")).unwrap();
        let file = package.join("Sources/Popen.swift");
        fs::write(&file, "let w: Worker\n").unwrap();
        let mut permissions = fs::metadata(&file).unwrap().permissions();
        permissions.set_readonly(true);
        fs::set_permissions(&file, permissions).unwrap();

        let mut build = ScriptedBuild::new().then_build(&[use_as_type(&file, 1)]);
        let report = run(&mut build, temp_dir.path(), &RewriteConfig::default());

        assert_eq!(fs::read_to_string(&file).unwrap(), "let w: any Worker\n");
        assert_eq!(report.dependency_manifests.len(), 1);
        assert!(report.dependency_manifests[0].ends_with("Popen/Package.swift"));
    }
}
