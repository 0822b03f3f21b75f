//! Resolution across a fake install: tier precedence, determinism, and the
//! candidate list reported on failure.
#![cfg(unix)]

use std::fs;

use simai::Error;
use simai::core::resources::{self, ANALYTICAL_BINARY, ResourceKind, SIMAI_PATH_VAR, Tier};
use simai::test_support::{FakeInstall, write_executable};

#[test]
fn dev_checkout_binary_resolves_when_nothing_else_exists() {
    let fx = FakeInstall::new();
    let built = fx.source_binary(ANALYTICAL_BINARY, "exit 0");

    let resolved = fx
        .resolver_with_override()
        .resolve_binary(ANALYTICAL_BINARY)
        .expect("resolve");
    assert_eq!(resolved, built);
}

#[test]
fn repeated_resolution_is_stable() {
    let fx = FakeInstall::new();
    fx.source_binary(ANALYTICAL_BINARY, "exit 0");
    let bundled = fx.bundled_binary(ANALYTICAL_BINARY, "exit 0");
    let resolver = fx.resolver_with_override();

    let runs: Vec<_> = (0..3)
        .map(|_| resolver.resolve_binary(ANALYTICAL_BINARY).expect("resolve"))
        .collect();
    assert!(runs.iter().all(|path| *path == bundled));
}

#[test]
fn override_beats_dev_checkout() {
    let fx = FakeInstall::new();
    fx.source_binary("SimAI_simulator", "exit 0");
    let overridden = fx.root.join("override/SimAI_simulator");
    write_executable(&overridden, "exit 0");

    let resolved = fx
        .resolver_with_override()
        .resolve_binary("SimAI_simulator")
        .expect("resolve");
    assert_eq!(resolved, overridden);
}

#[test]
fn failure_lists_every_probed_path_in_tier_order() {
    let fx = FakeInstall::new();
    let path_dir = fx.root.join("path");
    let override_dir = fx.root.join("override");
    let resolver = fx.resolver(&[
        ("SIMAI_BIN_PATH", &override_dir.display().to_string()),
        ("PATH", &path_dir.display().to_string()),
    ]);

    let err = resolver.resolve_binary("SimAI_m4").unwrap_err();
    let Error::ResourceNotFound {
        kind, candidates, ..
    } = &err
    else {
        panic!("expected ResourceNotFound, got {err:?}");
    };
    assert_eq!(*kind, ResourceKind::Binary);
    let probed: Vec<_> = candidates.iter().map(|c| (c.tier, c.path.clone())).collect();
    assert_eq!(
        probed,
        vec![
            (Tier::Bundled, fx.root.join("pkg/_binaries/SimAI_m4")),
            (Tier::EnvOverride, override_dir.join("SimAI_m4")),
            (Tier::SourceTree, fx.root.join("src/build/bin/SimAI_m4")),
            (Tier::SearchPath, path_dir.join("SimAI_m4")),
        ]
    );
    let message = err.to_string();
    assert!(message.contains("SimAI_m4"), "{message}");
}

#[test]
fn data_tree_override_is_used_when_not_bundled() {
    let fx = FakeInstall::new();
    let tree = fx.root.join("simai-data");
    fs::create_dir_all(tree.join(resources::ASTRA_SIM_DIR)).expect("mkdir");
    let resolver = fx.resolver(&[(SIMAI_PATH_VAR, &tree.display().to_string())]);

    let resolved = resolver
        .resolve(&resources::astra_sim_root())
        .expect("resolve");
    assert_eq!(resolved, tree.join(resources::ASTRA_SIM_DIR));
}
