use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use existential_patcher::compiler::{FeedbackLoop, Outcome, ShellToolchain, VerifyReport};
use existential_patcher::patch::CleanupOptions;
use existential_patcher::project::Project;
use existential_patcher::rewrite::{RewriteReport, Rewriter};
use existential_patcher::{
    load_for_project, load_from_path, KnownClasses, ProjectGuard, ProtocolRegistry,
    RewriteConfig, SiteMap, SitePolicy,
};
use similar::{ChangeTag, TextDiff};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "existential-patcher")]
#[command(
    about = "Migrate Swift sources to explicit any/some protocol annotations",
    long_about = None
)]
#[command(version)]
struct Cli {
    /// Package.swift, an .xcodeproj, or a directory containing Package.swift
    project: PathBuf,

    /// Xcode.app or toolchain root; enables build verification
    toolchain: Option<PathBuf>,

    /// Configuration file (default: existential-patcher.toml in the project)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// JSON dump of syntax sites (overrides the configured one)
    #[arg(short, long)]
    sites: Option<PathBuf>,

    /// Show unified diff of rewritten files
    #[arg(short, long)]
    diff: bool,

    /// Skip the clean verbose build that captures per-file invocations
    #[arg(long)]
    skip_build: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("existential_patcher=info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let project = match Project::resolve(&cli.project) {
        Ok(project) => project,
        Err(e) => {
            eprintln!("{} {}", "✗".red(), e);
            return ExitCode::FAILURE;
        }
    };

    match run(&cli, project) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "✗ Error:".red().bold(), e);
            eprintln!(
                "{}",
                "If this looks like a bug, please file a report including the output above."
                    .yellow()
            );
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli, project: Project) -> Result<ExitCode> {
    println!("Project: {} ({})", project.name, project.path.display());

    let config = match &cli.config {
        Some(path) => load_from_path(path)?,
        None => load_for_project(&project.root)?,
    };

    let mut registry = ProtocolRegistry::discover(&project.root)?;
    registry.merge(&config.protocols.known);
    registry.finalize(&config.protocols.denylist);
    info!(protocols = registry.len(), "protocol registry ready");

    let guard = ProjectGuard::new(&project.root, cli.toolchain.as_deref())?;

    let mut build = cli
        .toolchain
        .as_ref()
        .map(|toolchain| ShellToolchain::new(project.clone(), toolchain));

    if let Some(build) = build.as_mut().filter(|_| !cli.skip_build) {
        println!("{}", "Capturing compiler invocations...".dimmed());
        let captured = build
            .capture_invocations()
            .context("capturing compiler invocations")?;
        info!(invocations = captured, "captured compiler invocations");
    }

    let report = rewrite(cli, &project, &config, &registry)?;
    print_rewrite_summary(&report);

    let Some(build) = build.as_mut() else {
        return Ok(ExitCode::SUCCESS);
    };

    println!();
    println!("{}", "Verifying with ExistentialAny enabled...".bold());
    let verify = FeedbackLoop::new(build, &guard, &mut registry, &config).run();
    Ok(print_verify_summary(&verify))
}

fn rewrite(
    cli: &Cli,
    project: &Project,
    config: &RewriteConfig,
    registry: &ProtocolRegistry,
) -> Result<RewriteReport> {
    let sites_path = cli
        .sites
        .clone()
        .or_else(|| config.sites.as_ref().map(|path| project.root.join(path)));

    let sites = match sites_path {
        Some(path) => SiteMap::load(&path, &project.root)?,
        None => {
            eprintln!(
                "{}",
                "Warning: no syntax sites given, only diagnostics will run".yellow()
            );
            SiteMap::new()
        }
    };

    let policy = SitePolicy::new(KnownClasses::new(config.classes.iter()));
    let rewriter = Rewriter::new(&sites, registry, &policy, CleanupOptions::from_config(config))
        .record_changes(cli.diff);
    let report = rewriter.run(&project.root)?;

    for change in &report.changes {
        display_diff(&change.path, &change.original, &change.patched);
    }

    Ok(report)
}

fn display_diff(file: &Path, original: &str, modified: &str) {
    println!(
        "\n{}",
        format!("--- {} (original)", file.display()).dimmed()
    );
    println!("{}", format!("+++ {} (patched)", file.display()).dimmed());

    let diff = TextDiff::from_lines(original, modified);

    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Delete => format!("-{}", change).red(),
            ChangeTag::Insert => format!("+{}", change).green(),
            ChangeTag::Equal => format!(" {}", change).normal(),
        };
        print!("{}", sign);
    }
}

fn print_rewrite_summary(report: &RewriteReport) {
    let stats = &report.stats;
    println!();
    println!("{}", "Summary:".bold());
    println!("  {} files scanned", stats.files_scanned);
    println!(
        "  {} files changed",
        format!("{}", stats.files_changed).green()
    );
    println!("  {} sites classified", stats.sites);
    println!("  {} substitutions", stats.substitutions);
    if stats.skipped > 0 {
        println!("  {} skipped", format!("{}", stats.skipped).yellow());
    }
}

fn print_verify_summary(report: &VerifyReport) -> ExitCode {
    for manifest in &report.dependency_manifests {
        println!(
            "{} Patched dependency, verify separately: {}",
            "⚠".yellow(),
            manifest.display()
        );
    }

    match &report.outcome {
        Outcome::Converged { rounds } => {
            println!(
                "{} Project built successfully ({} fixups over {} rounds)",
                "✓".green(),
                report.fixups,
                rounds
            );
            ExitCode::SUCCESS
        }
        Outcome::Unresolved { errors } => {
            for error in errors {
                eprintln!("  {}", error.dimmed());
            }
            eprintln!(
                "{} {} errors remain, correct manually",
                "✗".red(),
                errors.len()
            );
            ExitCode::FAILURE
        }
        Outcome::BudgetExhausted { rounds, pending } => {
            eprintln!(
                "{} Gave up after {} rounds; {} errors remain, correct manually",
                "✗".red(),
                rounds,
                pending
            );
            ExitCode::FAILURE
        }
    }
}
