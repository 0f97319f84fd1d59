//! Resolution of [`ErrorPatch`]es against file content.
//!
//! A diagnostic anchors a fix at a line and column. The fix's pattern is
//! searched only on that line, starting up to twenty characters before the
//! reported column, and only the first acceptable match is rewritten.

use crate::compiler::diagnostic::ErrorPatch;
use crate::edit::{Edit, EditResult};
use tracing::{debug, warn};

/// Characters before the reported column still searched.
const COLUMN_SLACK: usize = 20;

/// Apply `patches` to `content`, most recent line first.
///
/// Returns the new content and the number of patches that changed it.
pub fn apply_error_patches(content: &str, patches: &[&ErrorPatch]) -> (String, usize) {
    let mut ordered: Vec<&ErrorPatch> = patches.to_vec();
    ordered.sort_by(|a, b| b.line.cmp(&a.line));

    let mut output = content.to_string();
    let mut applied = 0;

    for patch in ordered {
        match apply_one(&mut output, patch) {
            Some(true) => applied += 1,
            Some(false) => {}
            None => warn!(
                file = %patch.file.display(),
                line = patch.line,
                "diagnostic line is past end of file"
            ),
        }
    }

    (output, applied)
}

/// `None` when the line does not exist, otherwise whether the line changed.
fn apply_one(content: &mut String, patch: &ErrorPatch) -> Option<bool> {
    let (line_start, line_end) = line_span(content, patch.line)?;
    let Some(edit) = resolve(&content[line_start..line_end], line_start, patch) else {
        return Some(false);
    };

    match edit.apply_to(content) {
        Ok(EditResult::Applied { .. }) => {
            debug!(file = %patch.file.display(), line = patch.line, "applied diagnostic fixup");
            Some(true)
        }
        Ok(EditResult::AlreadyApplied) => Some(false),
        Err(e) => {
            warn!(file = %patch.file.display(), line = patch.line, error = %e, "fixup rejected");
            Some(false)
        }
    }
}

/// Find the first acceptable match in the window and build its edit.
fn resolve(line: &str, line_start: usize, patch: &ErrorPatch) -> Option<Edit> {
    let skip_chars = patch
        .column
        .map_or(0, |column| column.saturating_sub(1 + COLUMN_SLACK));
    let window_start = line
        .char_indices()
        .nth(skip_chars)
        .map_or(line.len(), |(index, _)| index);

    let pattern = &patch.rewrite.pattern;
    let mut at = window_start;
    while at <= line.len() {
        let caps = pattern.captures_at(line, at)?;
        let whole = caps.get(0)?;

        // Never re-annotate an annotated type, nor the tail of a qualified one.
        let before = &line[..whole.start()];
        if before.ends_with("any ") || before.ends_with("some ") || before.ends_with('.') {
            at = if whole.is_empty() {
                next_char(line, whole.start())
            } else {
                whole.end()
            };
            continue;
        }

        let target = caps.get(1)?;
        let mut replacement = String::new();
        caps.expand(&patch.rewrite.template, &mut replacement);

        return Some(Edit::new(
            line_start + target.start(),
            line_start + target.end(),
            replacement,
            target.as_str(),
        ));
    }

    None
}

/// Byte range of 1-based `line`, without its newline.
fn line_span(content: &str, line: usize) -> Option<(usize, usize)> {
    if line == 0 {
        return None;
    }
    let mut start = 0;
    for _ in 1..line {
        start += content[start..].find('\n')? + 1;
    }
    let end = content[start..]
        .find('\n')
        .map_or(content.len(), |i| start + i);
    Some((start, end))
}

fn next_char(text: &str, index: usize) -> usize {
    text[index..]
        .chars()
        .next()
        .map_or(text.len() + 1, |c| index + c.len_utf8())
}
