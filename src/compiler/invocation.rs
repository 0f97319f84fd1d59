//! Per-file compiler invocations captured from a verbose build.
//!
//! When the whole project cannot be rebuilt, each captured `swift-frontend`
//! command line is replayed on its own. Build-system-only flags are removed
//! and the existential feature is switched on.

use crate::cache;
use tracing::warn;

const FEATURE_FLAG: &str = "-enable-upcoming-feature ExistentialAny";

/// Literal fragments the frontend rejects when run outside the build system.
const BUILD_SYSTEM_FLAGS: &[&str] = &["builtin-swiftTaskExecution -- ", "-frontend-parseable-output "];

/// Keep only frontend invocations that compile a primary file.
pub fn capture_invocations<I, S>(lines: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    lines
        .into_iter()
        .filter(|line| line.as_ref().contains(" -primary-file "))
        .map(|line| line.as_ref().trim().to_string())
        .collect()
}

/// Primary source file of an invocation.
pub fn primary_file(invocation: &str) -> Option<&str> {
    let (_, rest) = invocation.split_once(" -primary-file ")?;
    rest.split_whitespace().next()
}

/// Make a captured invocation runnable on its own.
///
/// `extra_flags` are removed verbatim after the built-in ones.
pub fn sanitize(invocation: &str, extra_flags: &[String]) -> String {
    let mut command = invocation.to_string();

    for flag in BUILD_SYSTEM_FLAGS {
        command = command.replace(flag, "");
    }
    command = replace_pattern(&command, r"-supplementary-output-file-map \S+ ", "");
    // The bridging header PCH hash changes between builds.
    command = replace_pattern(&command, r"Bridging-Header-swift_\w+", "Bridging-Header-swift_*");
    for flag in extra_flags {
        command = command.replace(flag.as_str(), "");
    }

    if !command.contains(FEATURE_FLAG) {
        command = command.replacen(" -c ", &format!(" -c {FEATURE_FLAG} "), 1);
    }

    command
}

fn replace_pattern(text: &str, pattern: &str, replacement: &str) -> String {
    match cache::get_or_compile(pattern) {
        Ok(re) => re.replace_all(text, replacement).into_owned(),
        Err(e) => {
            warn!(%pattern, error = %e, "invocation pattern rejected");
            text.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAPTURED: &str = "builtin-swiftTaskExecution -- /usr/bin/swift-frontend -frontend -c \
/p/A.swift -primary-file /p/B.swift -supplementary-output-file-map /tmp/map.yaml \
-frontend-parseable-output -import-objc-header /d/App-Bridging-Header-swift_3KQ1-clang_9Z.pch -o B.o";

    #[test]
    fn test_capture_keeps_primary_file_lines() {
        let lines = [
            "Compiling App B.swift",
            "  /usr/bin/swift-frontend -frontend -c -primary-file /p/B.swift -o B.o  ",
            "Linking App",
        ];
        let captured = capture_invocations(lines);
        assert_eq!(
            captured,
            vec!["/usr/bin/swift-frontend -frontend -c -primary-file /p/B.swift -o B.o"]
        );
        assert_eq!(primary_file(&captured[0]), Some("/p/B.swift"));
    }

    #[test]
    fn test_sanitize_strips_build_system_flags() {
        let command = sanitize(CAPTURED, &[]);
        assert_eq!(
            command,
            "/usr/bin/swift-frontend -frontend -c -enable-upcoming-feature ExistentialAny \
/p/A.swift -primary-file /p/B.swift -import-objc-header /d/App-Bridging-Header-swift_*-clang_9Z.pch -o B.o"
        );
    }

    #[test]
    fn test_sanitize_extra_flags_and_idempotence() {
        let extra = vec!["-import-objc-header ".to_string()];
        let once = sanitize(CAPTURED, &extra);
        assert!(!once.contains("-import-objc-header"));
        assert_eq!(sanitize(&once, &extra), once);
        assert_eq!(once.matches(FEATURE_FLAG).count(), 1);
    }
}
