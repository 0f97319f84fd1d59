//! End-to-end migration scenarios through the public API.

use existential_patcher::compiler::{apply_error_patches, DiagnosticParser, ErrorPatch, ParseOutcome};
use existential_patcher::patch::{cleanup, CleanupOptions};
use existential_patcher::rewrite::Rewriter;
use existential_patcher::{ProtocolRegistry, SiteMap, SitePolicy, SyntaxSite};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const PARAMETER: &str = "source.lang.swift.decl.var.parameter";
const LOCAL: &str = "source.lang.swift.decl.var.local";

/// Package with a `Worker` protocol and one source file.
fn package(source: &str) -> (TempDir, PathBuf, PathBuf) {
    let dir = TempDir::new().unwrap();
    let root = dir.path().canonicalize().unwrap();
    fs::write(root.join("Package.swift"), "// swift-tools-version:5.9\n").unwrap();
    fs::create_dir_all(root.join("Sources/App")).unwrap();
    fs::write(root.join("Sources/App/Worker.swift"), "public protocol Worker {}\n").unwrap();
    let file = root.join("Sources/App/Main.swift");
    fs::write(&file, source).unwrap();
    (dir, root, file)
}

fn registry(root: &Path) -> ProtocolRegistry {
    let mut registry = ProtocolRegistry::discover(root).unwrap();
    registry.finalize(&[]);
    registry
}

fn parse(lines: &[&str], registry: &mut ProtocolRegistry) -> Vec<ErrorPatch> {
    match DiagnosticParser::new().parse(lines.iter().copied(), registry) {
        ParseOutcome::Completed { patches, .. } => patches,
        ParseOutcome::Aborted => panic!("parse aborted"),
    }
}

#[test]
fn parameter_becomes_opaque() {
    let source = "func run(w: Worker) {\n    w.start()\n}\n";
    let (_dir, root, file) = package(source);
    let registry = registry(&root);

    let json = format!(
        r#"{{ "Sources/App/Main.swift": [ {{"offset": {}, "kind": "{PARAMETER}", "type_name": "Worker"}} ] }}"#,
        source.find("w: Worker").unwrap()
    );
    let sites = SiteMap::from_json(&json, &root).unwrap();

    let policy = SitePolicy::default();
    Rewriter::new(&sites, &registry, &policy, CleanupOptions::default())
        .run(&root)
        .unwrap();

    assert_eq!(
        fs::read_to_string(&file).unwrap(),
        "func run(w: some Worker) {\n    w.start()\n}\n"
    );
}

#[test]
fn array_element_becomes_existential() {
    let source = "let ws: [Worker] = []\n";
    let (_dir, root, file) = package(source);
    let registry = registry(&root);

    let mut sites = SiteMap::new();
    sites.insert(&file, vec![SyntaxSite::new(4, LOCAL, "[Worker]")]);

    let policy = SitePolicy::default();
    let report = Rewriter::new(&sites, &registry, &policy, CleanupOptions::default())
        .run(&root)
        .unwrap();

    assert_eq!(fs::read_to_string(&file).unwrap(), "let ws: [any Worker] = []\n");
    assert_eq!(report.stats.files_changed, 1);
    // The protocol declaration is never rewritten.
    assert_eq!(
        fs::read_to_string(root.join("Sources/App/Worker.swift")).unwrap(),
        "public protocol Worker {}\n"
    );
}

#[test]
fn cast_missed_by_structural_pass() {
    let (_dir, root, _) = package("");
    let registry = registry(&root);

    let (output, count) = cleanup(
        "if x as? Worker {\n}\n",
        &registry,
        &SitePolicy::default(),
        &CleanupOptions::default(),
    );

    assert_eq!(output, "if x as? any Worker {\n}\n");
    assert_eq!(count, 1);
}

#[test]
fn diagnostic_inserts_and_registers() {
    let mut source = String::new();
    for n in 1..10 {
        source.push_str(&format!("// {n}\n"));
    }
    source.push_str("let g: Gadget = make()\n");
    let (_dir, root, file) = package(&source);
    let mut registry = registry(&root);
    assert!(!registry.contains("Gadget"));

    let diagnostic = format!(
        "{}:10:8: error: use of protocol 'Gadget' as a type",
        file.display()
    );
    let patches = parse(&[diagnostic.as_str()], &mut registry);
    let refs: Vec<&ErrorPatch> = patches.iter().collect();
    let (output, applied) = apply_error_patches(&source, &refs);

    assert!(registry.contains("Gadget"));
    assert_eq!(applied, 1);
    assert_eq!(output.lines().nth(9), Some("let g: any Gadget = make()"));
    assert_eq!(output.lines().count(), 10);
}

#[test]
fn over_annotation_removed() {
    let source = "struct Box {\n    let w: any Widget\n}\n";
    let (_dir, root, file) = package(source);
    let mut registry = registry(&root);

    let diagnostic = format!(
        "{}:2:12: error: 'any' has no effect on concrete type 'Widget'",
        file.display()
    );
    let patches = parse(&[diagnostic.as_str()], &mut registry);
    let refs: Vec<&ErrorPatch> = patches.iter().collect();
    let (output, _) = apply_error_patches(source, &refs);

    assert_eq!(output, "struct Box {\n    let w: Widget\n}\n");
}

#[test]
fn denylisted_names_are_excluded() {
    let (_dir, root, _) = package("");
    fs::write(root.join("Sources/App/Seq.swift"), "protocol Sequence {}\n").unwrap();

    let mut registry = ProtocolRegistry::discover(&root).unwrap();
    registry.insert("Tracker", existential_patcher::ProtocolOrigin::File("x.swift".into()));
    registry.finalize(&["Tracker".to_string()]);

    assert!(registry.contains("Worker"));
    assert!(!registry.contains("Sequence"));
    assert!(!registry.contains("Tracker"));
    assert!(registry.contains("Error"));
}
