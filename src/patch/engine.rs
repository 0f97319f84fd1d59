//! Offset-addressed site patching.
//!
//! Each [`Patch`] names a byte offset reported by the syntax oracle and the
//! protocol identifier found in that site's type. The annotation is inserted
//! before every unguarded occurrence of the identifier between the offset and
//! the end of its line.

use crate::cache;
use crate::classify::Annotation;
use crate::edit::{Edit, EditResult};
use tracing::{debug, warn};

/// Text before an occurrence that marks it as already annotated or as a
/// declaration, qualification, constraint or composition.
const GUARD_PRECEDED_BY: &[&str] = &[
    "any ",
    "some ",
    "protocol ",
    "extension ",
    "where ",
    "& ",
    ".",
    "<",
];

/// One rewritable site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    /// Byte offset into the unpatched content
    pub offset: usize,
    /// Protocol identifier to annotate
    pub identifier: String,
    pub annotation: Annotation,
}

impl Patch {
    pub fn new(offset: usize, identifier: impl Into<String>, annotation: Annotation) -> Self {
        Self {
            offset,
            identifier: identifier.into(),
            annotation,
        }
    }
}

/// Apply a batch of site patches to `content`.
///
/// All offsets refer to `content` as passed in. Patches are applied from the
/// highest offset down, and each window ends where the previously applied
/// (higher) window began, so no edit ever shifts an offset still to be
/// consumed. Returns the new content and the number of annotations inserted.
pub fn apply_site_patches(content: &str, patches: &[Patch]) -> (String, usize) {
    let mut ordered: Vec<&Patch> = patches.iter().collect();
    ordered.sort_by(|a, b| b.offset.cmp(&a.offset));

    let mut output = content.to_string();
    let mut inserted = 0;
    let mut ceiling = content.len();

    for patch in ordered {
        if patch.annotation == Annotation::Unchanged {
            continue;
        }
        if patch.offset > content.len() || !content.is_char_boundary(patch.offset) {
            warn!(
                offset = patch.offset,
                identifier = %patch.identifier,
                "skipping patch with invalid offset"
            );
            continue;
        }

        let window_end = ceiling.max(patch.offset);
        ceiling = patch.offset;
        inserted += patch_window(&mut output, patch, window_end);
    }

    (output, inserted)
}

/// Annotate occurrences of the identifier in `[patch.offset, window_end)`,
/// clipped to the end of the line.
fn patch_window(content: &mut String, patch: &Patch, window_end: usize) -> usize {
    let offset = patch.offset;
    let line_start = content[..offset].rfind('\n').map_or(0, |i| i + 1);
    let line_end = content[offset..]
        .find('\n')
        .map_or(content.len(), |i| offset + i);
    let window_end = window_end.min(line_end);

    // Generic parameter declaration: `<T: Worker>` is a constraint, not a use.
    let constraint = format!("<{}: ", patch.identifier);
    if content[line_start..offset].contains(&constraint) {
        return 0;
    }

    let pattern = format!(
        r"\b((?:\w+\.)*{}(?:\.Type)?)\b",
        regex::escape(&patch.identifier)
    );
    let re = match cache::get_or_compile(&pattern) {
        Ok(re) => re,
        Err(e) => {
            warn!(identifier = %patch.identifier, error = %e, "cannot compile site pattern");
            return 0;
        }
    };

    // Search the clipped line from the offset so `\b` still sees the text
    // before the window.
    let haystack = &content[line_start..window_end];
    let mut starts = Vec::new();
    let mut at = offset - line_start;
    while let Some(m) = re.find_at(haystack, at) {
        let (start, end) = (line_start + m.start(), line_start + m.end());
        let before = &content[line_start..start];
        let after = &content[end..line_end];
        if !is_guarded_before(before) && !is_guarded_after(after) {
            starts.push(start);
        }
        at = m.end();
    }

    let prefix = patch.annotation.prefix();
    let mut inserted = 0;
    for start in starts.into_iter().rev() {
        match Edit::new(start, start, prefix, "").apply_to(content) {
            Ok(EditResult::Applied { .. }) => {
                debug!(offset = start, identifier = %patch.identifier, %prefix, "annotated site");
                inserted += 1;
            }
            Ok(EditResult::AlreadyApplied) => {}
            Err(e) => warn!(offset = start, error = %e, "site edit rejected"),
        }
    }
    inserted
}

fn is_guarded_before(before: &str) -> bool {
    GUARD_PRECEDED_BY.iter().any(|guard| before.ends_with(guard))
}

/// Declarations, calls, metatype references and empty initializers.
fn is_guarded_after(after: &str) -> bool {
    if after.starts_with(':')
        || after.starts_with('(')
        || after.starts_with(">(")
        || after.starts_with(".self")
    {
        return true;
    }
    after.starts_with(char::is_whitespace) && after.trim_start().starts_with("{}")
}
