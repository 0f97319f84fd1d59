//! Phase one: annotate every protocol use site reported by the oracle.
//!
//! Each project file is read once. Its sites are classified, patched in
//! descending offset order, and the whole-file cleanup passes run over the
//! result before it is written back.

use crate::cache;
use crate::classify::{ClassLookup, KnownClasses, SitePolicy};
use crate::edit::SourceFile;
use crate::oracle::{SyntaxOracle, SyntaxSite};
use crate::patch::{apply_site_patches, cleanup, CleanupOptions, Patch};
use crate::registry::{swift_sources, ProtocolRegistry, RegistryError};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Counters for one rewrite run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteStats {
    pub files_scanned: usize,
    pub files_changed: usize,
    /// Sites whose type text named a registered protocol
    pub sites: usize,
    /// Substitutions made by site patches and cleanup passes together
    pub substitutions: usize,
    /// Files skipped because they or their sites could not be read
    pub skipped: usize,
}

/// Before and after text of a rewritten file.
#[derive(Debug, Clone)]
pub struct FileChange {
    pub path: PathBuf,
    pub original: String,
    pub patched: String,
}

#[derive(Debug, Clone, Default)]
pub struct RewriteReport {
    pub stats: RewriteStats,
    /// Populated only when changes are being recorded
    pub changes: Vec<FileChange>,
}

pub struct Rewriter<'a, O: SyntaxOracle, C: ClassLookup = KnownClasses> {
    oracle: &'a O,
    registry: &'a ProtocolRegistry,
    policy: &'a SitePolicy<C>,
    options: CleanupOptions,
    record_changes: bool,
}

impl<'a, O: SyntaxOracle, C: ClassLookup> Rewriter<'a, O, C> {
    pub fn new(
        oracle: &'a O,
        registry: &'a ProtocolRegistry,
        policy: &'a SitePolicy<C>,
        options: CleanupOptions,
    ) -> Self {
        Self {
            oracle,
            registry,
            policy,
            options,
            record_changes: false,
        }
    }

    /// Keep the before/after text of every changed file in the report.
    pub fn record_changes(mut self, record: bool) -> Self {
        self.record_changes = record;
        self
    }

    /// Rewrite every project source under `root`.
    ///
    /// Dependency checkouts are left alone; diagnostics reach them later if
    /// they need changes.
    pub fn run(&self, root: &Path) -> Result<RewriteReport, RegistryError> {
        let started = Instant::now();
        let mut report = RewriteReport::default();

        let Some(protocols) = self.protocol_regex() else {
            info!("no protocols registered, nothing to rewrite");
            return Ok(report);
        };

        for file in swift_sources(root, false)? {
            report.stats.files_scanned += 1;
            self.rewrite_file(&file, &protocols, &mut report);
        }

        info!(
            files = report.stats.files_scanned,
            changed = report.stats.files_changed,
            sites = report.stats.sites,
            substitutions = report.stats.substitutions,
            skipped = report.stats.skipped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "rewrite complete"
        );

        Ok(report)
    }

    fn protocol_regex(&self) -> Option<Regex> {
        let pattern = self.registry.protocol_pattern()?;
        match cache::get_or_compile(&pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(error = %e, "protocol pattern rejected");
                None
            }
        }
    }

    /// Classify the sites of one file into patches.
    pub fn patches_for(&self, sites: &[SyntaxSite]) -> Vec<Patch> {
        let Some(protocols) = self.protocol_regex() else {
            return Vec::new();
        };
        self.classify_sites(sites, &protocols)
    }

    fn classify_sites(&self, sites: &[SyntaxSite], protocols: &Regex) -> Vec<Patch> {
        sites
            .iter()
            .filter_map(|site| {
                let type_text = site.type_name.as_deref()?;
                let identifier = protocols.find(type_text)?.as_str();
                let annotation =
                    self.policy
                        .decide(identifier, &site.kind, type_text, self.registry);
                Some(Patch::new(site.offset, identifier, annotation))
            })
            .collect()
    }

    fn rewrite_file(&self, file: &Path, protocols: &Regex, report: &mut RewriteReport) {
        let sites = match self.oracle.enumerate_sites(file) {
            Ok(sites) => sites,
            Err(e) => {
                warn!(file = %file.display(), error = %e, "no syntax sites, skipping");
                report.stats.skipped += 1;
                return;
            }
        };

        let patches = self.classify_sites(&sites, protocols);
        if patches.is_empty() {
            return;
        }
        report.stats.sites += patches.len();

        let mut source = match SourceFile::read(file) {
            Ok(source) => source,
            Err(e) => {
                warn!(error = %e, "skipping unreadable file");
                report.stats.skipped += 1;
                return;
            }
        };

        let (patched, inserted) = apply_site_patches(source.content(), &patches);
        let (patched, cleaned) = cleanup(&patched, self.registry, self.policy, &self.options);
        source.set_content(patched);

        if !source.is_modified() {
            return;
        }

        match source.commit() {
            Ok(_) => {
                debug!(file = %file.display(), inserted, cleaned, "rewrote file");
                report.stats.files_changed += 1;
                report.stats.substitutions += inserted + cleaned;
                if self.record_changes {
                    report.changes.push(FileChange {
                        path: file.to_path_buf(),
                        original: source.original().to_string(),
                        patched: source.content().to_string(),
                    });
                }
            }
            Err(e) => {
                warn!(file = %file.display(), error = %e, "failed to write rewrite");
                report.stats.skipped += 1;
            }
        }
    }
}
