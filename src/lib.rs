//! Existential Patcher: migrates Swift sources to explicit `any`/`some`
//! annotations on protocol types.
//!
//! # Architecture
//!
//! All source mutations compile down to a single primitive: [`Edit`], a
//! verified byte-span replacement. Intelligence lives in span acquisition
//! (syntax sites from an oracle, compiler diagnostics), not in the
//! application logic.
//!
//! A run has two phases:
//!
//! 1. [`rewrite::Rewriter`] classifies every reported protocol use site with a
//!    [`SitePolicy`] and patches it, then runs the whole-file cleanup passes.
//! 2. [`compiler::FeedbackLoop`] rebuilds with `ExistentialAny` enabled and
//!    repairs what the compiler still rejects, for a bounded number of
//!    rounds.
//!
//! # Safety
//!
//! - Edits verify the expected before-text before applying
//! - Atomic file writes (tempfile + fsync + rename)
//! - Diagnostic paths are confined to the project
//! - Idempotent: an annotation is never inserted where one already sits
//!
//! # Example
//!
//! ```no_run
//! use existential_patcher::oracle::SiteMap;
//! use existential_patcher::patch::CleanupOptions;
//! use existential_patcher::rewrite::Rewriter;
//! use existential_patcher::{ProtocolRegistry, SitePolicy};
//! use std::path::Path;
//!
//! let root = Path::new("/path/to/package");
//! let mut registry = ProtocolRegistry::discover(root).unwrap();
//! registry.finalize(&[]);
//! let sites = SiteMap::load(Path::new("sites.json"), root).unwrap();
//!
//! let policy = SitePolicy::default();
//! let report = Rewriter::new(&sites, &registry, &policy, CleanupOptions::default())
//!     .run(root)
//!     .unwrap();
//! println!("{} files changed", report.stats.files_changed);
//! ```

pub mod cache;
pub mod classify;
pub mod compiler;
pub mod config;
pub mod edit;
pub mod oracle;
pub mod patch;
pub mod project;
pub mod registry;
pub mod rewrite;
pub mod safety;

// Re-exports
pub use classify::{Annotation, ClassLookup, KnownClasses, SitePolicy};
pub use config::{
    load_for_project, load_from_path, load_from_str, ConfigError, RewriteConfig, CONFIG_FILE_NAME,
};
pub use edit::{Edit, EditError, EditResult, EditVerification, SourceFile};
pub use oracle::{SiteMap, SyntaxOracle, SyntaxSite};
pub use registry::{ProtocolOrigin, ProtocolRegistry, RegistryError};
pub use safety::{FileOrigin, ProjectGuard, SafetyError};
