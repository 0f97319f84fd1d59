//! Whole-file cleanup passes run after site patching.
//!
//! The structural pass only sees what the syntax oracle reports. These
//! substitutions repair the contexts where its choice is illegal and cover
//! positions it never visits. Every pass is a no-op on its own output.

use crate::cache;
use crate::classify::{ClassLookup, SitePolicy};
use crate::config::RewriteConfig;
use crate::registry::ProtocolRegistry;
use regex::{Captures, Regex};
use tracing::{debug, warn};

/// Tunables for the cleanup passes.
#[derive(Debug, Clone)]
pub struct CleanupOptions {
    /// Protocols whose `-> any P {` returns stay existential
    pub keep_any_returns: Vec<String>,
    /// Repetitions of the `@objc`/`case` pass
    pub adhoc_rounds: usize,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        Self::from_config(&RewriteConfig::default())
    }
}

impl CleanupOptions {
    pub fn from_config(config: &RewriteConfig) -> Self {
        Self {
            keep_any_returns: config.policy.keep_any_returns.clone(),
            adhoc_rounds: config.budget.adhoc_rounds.max(1),
        }
    }
}

/// Run every cleanup pass over `content`.
///
/// Returns the new content and the number of substitutions made.
pub fn cleanup<C: ClassLookup>(
    content: &str,
    registry: &ProtocolRegistry,
    policy: &SitePolicy<C>,
    options: &CleanupOptions,
) -> (String, usize) {
    let Some(protocols) = registry.protocol_pattern() else {
        return (content.to_string(), 0);
    };

    let mut source = content.to_string();
    let mut total = 0;

    total += revert_illegal_opaque(&mut source, &protocols);
    total += strip_constraint_annotations(&mut source);
    total += annotate_casts(&mut source, &protocols, policy);
    total += promote_returns(&mut source, &protocols, &options.keep_any_returns);
    total += objc_and_case_lines(&mut source, options.adhoc_rounds);
    total += optionals(&mut source, &protocols);
    total += collapse_doubled(&mut source);

    (source, total)
}

/// Parenthesise annotated optionals: `any P?` becomes `(any P)?`.
///
/// Also run on its own after diagnostic fixups.
pub fn fix_optionals(content: &str, registry: &ProtocolRegistry) -> (String, usize) {
    let Some(protocols) = registry.protocol_pattern() else {
        return (content.to_string(), 0);
    };
    let mut source = content.to_string();
    let count = optionals(&mut source, &protocols);
    (source, count)
}

fn compile(pattern: &str) -> Option<Regex> {
    match cache::get_or_compile(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!(error = %e, "cleanup pattern rejected, pass skipped");
            None
        }
    }
}

/// Replace every match through `rewrite`, counting matches it changed.
fn substitute<F>(source: &mut String, re: &Regex, mut rewrite: F) -> usize
where
    F: FnMut(&Captures<'_>, &str) -> Option<String>,
{
    let mut count = 0;
    let haystack = source.as_str();
    let replaced = re.replace_all(haystack, |caps: &Captures<'_>| {
        let whole = caps.get(0).map_or("", |m| m.as_str());
        match rewrite(caps, haystack) {
            Some(text) if text != whole => {
                count += 1;
                text
            }
            _ => whole.to_string(),
        }
    });
    if count > 0 {
        *source = replaced.into_owned();
    }
    count
}

fn qualified(protocols: &str) -> String {
    format!(r"(?:\w+\.)*{protocols}(?:\.Type)?")
}

/// `some P` is illegal for varargs, defaulted parameters, metatypes and
/// closure parameter lists.
fn revert_illegal_opaque(source: &mut String, protocols: &str) -> usize {
    let pattern = format!(
        r"\bsome ({}\s*)(\.\.\.| =|\.Type|\) in)",
        qualified(protocols)
    );
    let Some(re) = compile(&pattern) else {
        return 0;
    };
    let count = substitute(source, &re, |caps, _| {
        Some(format!("any {}{}", &caps[1], &caps[2]))
    });
    debug!(count, "reverted opaque annotations");
    count
}

/// `<T: any P>` is a constraint, not a use.
fn strip_constraint_annotations(source: &mut String) -> usize {
    let Some(re) = compile(r"<(\w+):( any| some) ") else {
        return 0;
    };
    substitute(source, &re, |caps, _| Some(format!("<{}: ", &caps[1])))
}

/// Cast targets are never reported as sites.
fn annotate_casts<C: ClassLookup>(
    source: &mut String,
    protocols: &str,
    policy: &SitePolicy<C>,
) -> usize {
    let pattern = format!(
        r"(\s+(?:is|as[?!]?)\s+)((?:\w+\.)?({protocols})(?:\.Type)?)"
    );
    let Some(re) = compile(&pattern) else {
        return 0;
    };
    let count = substitute(source, &re, |caps, haystack| {
        let end = caps.get(0).map_or(0, |m| m.end());
        // Labels and longer identifiers
        if haystack[end..]
            .chars()
            .next()
            .is_some_and(|c| c == ':' || c.is_ascii_lowercase())
        {
            return None;
        }
        let name = &caps[3];
        if policy.is_class(name) || name.starts_with("Any") {
            return None;
        }
        Some(format!("{}any {}", &caps[1], &caps[2]))
    });
    debug!(count, "annotated cast targets");
    count
}

/// A function returning one existential can usually return an opaque type.
fn promote_returns(source: &mut String, protocols: &str, keep_any: &[String]) -> usize {
    let pattern = format!(r"-> any ({protocols}) \{{");
    let (Some(re), Some(objc_or_case)) = (compile(&pattern), compile(OBJC_OR_CASE_LINE)) else {
        return 0;
    };
    substitute(source, &re, |caps, haystack| {
        let name = &caps[1];
        if keep_any.iter().any(|keep| keep == name) {
            return None;
        }
        // The @objc/case pass would turn it straight back.
        let start = caps.get(0).map_or(0, |m| m.start());
        let line_start = haystack[..start].rfind('\n').map_or(0, |i| i + 1);
        if objc_or_case.is_match(&haystack[line_start..start]) {
            return None;
        }
        Some(format!("-> some {name} {{"))
    })
}

/// Lines where generic parameters, and so `some`, are not allowed.
const OBJC_OR_CASE_LINE: &str = r"(?:@objc|\bcase)\s";

/// `@objc` members and enum cases cannot take generic parameters.
///
/// Each round rewrites the last `some` on a line; `case .some` is left alone.
fn objc_and_case_lines(source: &mut String, rounds: usize) -> usize {
    let Some(re) = compile(r"(?:@objc|\bcase)\s+.*[^.]\b(some)\b") else {
        return 0;
    };
    let mut total = 0;
    for _ in 0..rounds {
        let count = substitute(source, &re, |caps, _| {
            let whole = &caps[0];
            Some(format!("{}any", &whole[..whole.len() - "some".len()]))
        });
        if count == 0 {
            break;
        }
        total += count;
    }
    total
}

fn optionals(source: &mut String, protocols: &str) -> usize {
    let pattern = format!(r"\b(?:any|some)\s+({})([?!])", qualified(protocols));
    let Some(re) = compile(&pattern) else {
        return 0;
    };
    let count = substitute(source, &re, |caps, _| {
        Some(format!("(any {}){}", &caps[1], &caps[2]))
    });
    debug!(count, "parenthesised optionals");
    count
}

/// Overlapping passes can stack keywords; a mixed pair resolves to `any`.
fn collapse_doubled(source: &mut String) -> usize {
    let Some(re) = compile(r"\b(any|some) +(any|some)\b") else {
        return 0;
    };
    let mut total = 0;
    loop {
        let count = substitute(source, &re, |caps, _| {
            if &caps[1] == "some" && &caps[2] == "some" {
                Some("some".to_string())
            } else {
                Some("any".to_string())
            }
        });
        if count == 0 {
            break;
        }
        total += count;
    }
    total
}
