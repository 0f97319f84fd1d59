//! Registry of identifiers known to name protocols.
//!
//! Built once per run by scanning the project for `protocol <Name>`
//! declarations, merged with externally supplied tables, then threaded by
//! reference through the rewrite and verification phases. Diagnostics may
//! add entries between rounds.

use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Names that look like protocols but must never be annotated.
pub const DENYLIST: &[&str] = &["Sendable", "Sequence", "Subscript", "Collection"];

/// Mangled-symbol prefixes of standard library and platform modules.
const SYSTEM_PREFIXES: &[&str] = &["$ss", "$sS", "$s7Combine", "$s10Foundation"];

/// Where a protocol was first seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolOrigin {
    /// Declared in (or first diagnosed in) this file
    File(PathBuf),
    /// Built-in protocol, identified by its mangled-symbol prefix
    System(String),
}

impl ProtocolOrigin {
    /// Parse an origin from a known-protocol table entry.
    ///
    /// Values starting with `$s` are mangled symbols, anything else is a path.
    pub fn parse(value: &str) -> Self {
        if value.starts_with("$s") {
            ProtocolOrigin::System(value.to_string())
        } else {
            ProtocolOrigin::File(PathBuf::from(value))
        }
    }

    pub fn is_system(&self) -> bool {
        match self {
            ProtocolOrigin::System(symbol) => {
                SYSTEM_PREFIXES.iter().any(|prefix| symbol.starts_with(prefix))
            }
            ProtocolOrigin::File(_) => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Cannot enumerate project at {path}: {source}")]
    Enumerate {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

/// Mapping of protocol identifiers to their origin.
///
/// First writer wins: a later discovery never replaces an existing origin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolRegistry {
    entries: BTreeMap<String, ProtocolOrigin>,
}

impl ProtocolRegistry {
    /// Empty registry, without the built-in seeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry seeded with the system protocols every project can see.
    pub fn with_system_seeds() -> Self {
        let mut registry = Self::new();
        for (name, symbol) in [
            ("Error", "$ss5ErrorP"),
            ("Encoder", "$ss7EncoderP"),
            ("Decoder", "$ss7DecoderP"),
        ] {
            registry.insert(name, ProtocolOrigin::System(symbol.to_string()));
        }
        registry
    }

    /// Scan all Swift sources under `root` for protocol declarations.
    ///
    /// Unreadable files are skipped; failing to enumerate `root` itself is fatal.
    pub fn discover(root: &Path) -> Result<Self, RegistryError> {
        let mut registry = Self::with_system_seeds();
        let declaration = declaration_pattern();

        for file in swift_sources(root, true)? {
            let source = match fs::read_to_string(&file) {
                Ok(source) => source,
                Err(e) => {
                    warn!(file = %file.display(), error = %e, "skipping unreadable source");
                    continue;
                }
            };

            let relative = file.strip_prefix(root).unwrap_or(&file).to_path_buf();
            for caps in declaration.captures_iter(&source) {
                let name = &caps[1];
                if registry.insert(name, ProtocolOrigin::File(relative.clone())) {
                    debug!(protocol = name, file = %relative.display(), "discovered protocol");
                }
            }
        }

        Ok(registry)
    }

    /// Insert if absent. Returns `true` when the name was new.
    pub fn insert(&mut self, name: impl Into<String>, origin: ProtocolOrigin) -> bool {
        let name = name.into();
        if self.entries.contains_key(&name) {
            return false;
        }
        self.entries.insert(name, origin);
        true
    }

    /// Merge an externally supplied table without overwriting existing entries.
    pub fn merge<'a>(&mut self, known: impl IntoIterator<Item = (&'a String, &'a String)>) {
        for (name, origin) in known {
            self.insert(name.clone(), ProtocolOrigin::parse(origin));
        }
    }

    /// Apply the fixed denylist plus any extra names.
    pub fn finalize(&mut self, extra_denylist: &[String]) {
        for name in DENYLIST {
            self.entries.remove(*name);
        }
        for name in extra_denylist {
            self.entries.remove(name);
        }
    }

    pub fn get(&self, name: &str) -> Option<&ProtocolOrigin> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// System protocols are never elided to `some`.
    ///
    /// Objective-C protocols are recognised by their `NS` prefix.
    pub fn is_system(&self, name: &str) -> bool {
        name.starts_with("NS") || self.get(name).is_some_and(ProtocolOrigin::is_system)
    }

    /// Alternation matching any registered identifier at word boundaries.
    ///
    /// `None` for an empty registry; passes that need it become no-ops.
    pub fn protocol_pattern(&self) -> Option<String> {
        if self.entries.is_empty() {
            return None;
        }
        let names: Vec<String> = self.entries.keys().map(|name| regex::escape(name)).collect();
        Some(format!(r"\b(?:{})\b", names.join("|")))
    }
}

fn declaration_pattern() -> Regex {
    Regex::new(r"\bprotocol\s+(\w+)\b").expect("declaration pattern is valid")
}

/// Enumerate `.swift` files under `root`, sorted.
///
/// With `include_checkouts` false, build products, dependency checkouts and
/// hidden directories are skipped.
pub fn swift_sources(root: &Path, include_checkouts: bool) -> Result<Vec<PathBuf>, RegistryError> {
    let mut files = Vec::new();

    let walker = WalkDir::new(root).follow_links(false).into_iter();
    let walker = walker.filter_entry(|entry| {
        if entry.depth() == 0 || !entry.file_type().is_dir() {
            return true;
        }
        let name = entry.file_name().to_string_lossy();
        if include_checkouts {
            name != ".git"
        } else {
            !name.starts_with('.') && name != "DerivedData"
        }
    });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => {
                return Err(RegistryError::Enumerate {
                    path: root.to_path_buf(),
                    source: e,
                });
            }
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };

        if entry.file_type().is_file()
            && entry.path().extension().and_then(|s| s.to_str()) == Some("swift")
        {
            files.push(entry.into_path());
        }
    }

    files.sort();
    Ok(files)
}
