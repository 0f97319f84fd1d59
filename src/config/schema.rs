use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Default round budget for diagnostic-driven convergence.
pub const DEFAULT_ROUNDS: usize = 10;
/// Default repetition budget for the ad-hoc cleanup passes.
pub const DEFAULT_ADHOC_ROUNDS: usize = 5;
/// Default attempts per file in the per-file compile fallback.
pub const DEFAULT_COMPILE_RETRIES: usize = 3;

/// Optional `existential-patcher.toml` at the project root.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct RewriteConfig {
    /// JSON site dump produced by the syntax oracle
    #[serde(default)]
    pub sites: Option<PathBuf>,
    /// Names of concrete classes that never take an annotation
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default)]
    pub protocols: ProtocolTables,
    #[serde(default)]
    pub budget: Budget,
    #[serde(default)]
    pub build: BuildSettings,
    #[serde(default)]
    pub policy: PolicySettings,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct ProtocolTables {
    /// Known protocol name -> origin (a `$s` mangled prefix or a file path)
    #[serde(default)]
    pub known: BTreeMap<String, String>,
    /// Extra names that must never be treated as protocols
    #[serde(default)]
    pub denylist: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Budget {
    #[serde(default = "default_rounds")]
    pub rounds: usize,
    #[serde(default = "default_adhoc_rounds")]
    pub adhoc_rounds: usize,
    #[serde(default = "default_compile_retries")]
    pub compile_retries: usize,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            rounds: DEFAULT_ROUNDS,
            adhoc_rounds: DEFAULT_ADHOC_ROUNDS,
            compile_retries: DEFAULT_COMPILE_RETRIES,
        }
    }
}

fn default_rounds() -> usize {
    DEFAULT_ROUNDS
}

fn default_adhoc_rounds() -> usize {
    DEFAULT_ADHOC_ROUNDS
}

fn default_compile_retries() -> usize {
    DEFAULT_COMPILE_RETRIES
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct BuildSettings {
    /// Extra flags (literal text) removed from captured invocations
    #[serde(default)]
    pub strip_flags: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PolicySettings {
    /// Protocols whose `-> any P {` returns are never promoted to `some`
    #[serde(default = "default_keep_any_returns")]
    pub keep_any_returns: Vec<String>,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            keep_any_returns: default_keep_any_returns(),
        }
    }
}

fn default_keep_any_returns() -> Vec<String> {
    ["Encoder", "Decoder", "Disposable"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl RewriteConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut issues = Vec::new();

        if self.budget.rounds == 0 {
            issues.push(ValidationIssue::ZeroBudget { field: "budget.rounds" });
        }
        if self.budget.adhoc_rounds == 0 {
            issues.push(ValidationIssue::ZeroBudget {
                field: "budget.adhoc_rounds",
            });
        }
        if self.budget.compile_retries == 0 {
            issues.push(ValidationIssue::ZeroBudget {
                field: "budget.compile_retries",
            });
        }

        let names = self
            .protocols
            .known
            .keys()
            .map(|name| ("protocols.known", name))
            .chain(self.protocols.denylist.iter().map(|n| ("protocols.denylist", n)))
            .chain(self.classes.iter().map(|n| ("classes", n)))
            .chain(
                self.policy
                    .keep_any_returns
                    .iter()
                    .map(|n| ("policy.keep_any_returns", n)),
            );
        for (field, name) in names {
            if !is_identifier(name) {
                issues.push(ValidationIssue::InvalidIdentifier {
                    field,
                    value: name.clone(),
                });
            }
        }

        for (name, origin) in &self.protocols.known {
            if origin.trim().is_empty() {
                issues.push(ValidationIssue::EmptyOrigin {
                    protocol: name.clone(),
                });
            }
        }

        if self.build.strip_flags.iter().any(|f| f.trim().is_empty()) {
            issues.push(ValidationIssue::EmptyFlag);
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { issues })
        }
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, issue) in self.issues.iter().enumerate() {
            if idx > 0 {
                writeln!(f)?;
            }
            write!(f, "{issue}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug, Clone)]
pub enum ValidationIssue {
    ZeroBudget { field: &'static str },
    InvalidIdentifier { field: &'static str, value: String },
    EmptyOrigin { protocol: String },
    EmptyFlag,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::ZeroBudget { field } => write!(f, "'{field}' must be at least 1"),
            ValidationIssue::InvalidIdentifier { field, value } => {
                write!(f, "'{field}' entry '{value}' is not an identifier")
            }
            ValidationIssue::EmptyOrigin { protocol } => {
                write!(f, "known protocol '{protocol}' has an empty origin")
            }
            ValidationIssue::EmptyFlag => write!(f, "'build.strip_flags' contains an empty flag"),
        }
    }
}
