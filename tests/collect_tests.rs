//! Directory assembler tests: tree layout, the path-traversal guard, and
//! the always-rebuild contract.

mod helpers;

use helpers::TestEnv;

use frostpack::archive::container;
use frostpack::{Collect, CollectOptions, Entry, EntryKind, Executable, ExeOptions, NodeInput, Toc};
use std::fs;
use std::os::unix::fs::PermissionsExt;

#[test]
fn test_tree_layout_and_executable_bits() {
    let env = TestEnv::new();
    let mut toc = Toc::new();
    toc.push(Entry::new(
        "app_data/readme.txt",
        env.write_source("readme.txt", "docs"),
        EntryKind::Data,
    ));
    toc.push(Entry::new(
        "liba.so",
        env.write_source("liba.so", "shared"),
        EntryKind::Binary,
    ));

    let mut collect = Collect::new(
        &env.config,
        "app",
        vec![NodeInput::Entries(toc)],
        CollectOptions::default(),
    );
    collect.build().unwrap();

    let out = env.config.distpath.join("app");
    assert_eq!(
        fs::read_to_string(out.join("app_data/readme.txt")).unwrap(),
        "docs"
    );
    let mode = fs::metadata(out.join("liba.so"))
        .unwrap()
        .permissions()
        .mode();
    assert_ne!(mode & 0o111, 0);
}

#[test]
fn test_every_build_starts_from_a_clean_directory() {
    let env = TestEnv::new();
    let mut toc = Toc::new();
    toc.push(Entry::new(
        "data.txt",
        env.write_source("data.txt", "data"),
        EntryKind::Data,
    ));

    let mut collect = Collect::new(
        &env.config,
        "app",
        vec![NodeInput::Entries(toc)],
        CollectOptions::default(),
    );
    collect.build().unwrap();

    // Cruft from outside the build is wiped on the next run.
    let cruft = env.config.distpath.join("app/stale.tmp");
    fs::write(&cruft, "leftover").unwrap();
    collect.build().unwrap();
    assert!(!cruft.exists());
    assert!(env.config.distpath.join("app/data.txt").exists());
}

#[test]
fn test_traversal_attempt_aborts_before_writing() {
    let env = TestEnv::new();
    let mut toc = Toc::new();
    toc.push(Entry::new(
        "fine.txt",
        env.write_source("fine.txt", "ok"),
        EntryKind::Data,
    ));
    toc.push(Entry::new(
        "../escape.txt",
        env.write_source("escape.txt", "bad"),
        EntryKind::Data,
    ));

    let mut collect = Collect::new(
        &env.config,
        "evil",
        vec![NodeInput::Entries(toc)],
        CollectOptions::default(),
    );
    let err = collect.build().unwrap_err();
    assert!(err.to_string().contains("outside the output directory"));
    // Nothing was written, not even the valid entry.
    assert!(!env.config.distpath.join("evil").exists());
}

#[test]
fn test_absolute_internal_name_rejected() {
    let env = TestEnv::new();
    let mut toc = Toc::new();
    toc.push(Entry::new(
        "/etc/planted",
        env.write_source("planted.txt", "bad"),
        EntryKind::Data,
    ));

    let mut collect = Collect::new(
        &env.config,
        "evil",
        vec![NodeInput::Entries(toc)],
        CollectOptions::default(),
    );
    assert!(collect.build().is_err());
}

#[test]
fn test_dependency_and_directive_entries_not_copied() {
    let env = TestEnv::new();
    let mut toc = Toc::new();
    toc.push(Entry::new(
        "data.txt",
        env.write_source("data.txt", "data"),
        EntryKind::Data,
    ));
    toc.push(Entry::new(
        "../other/app:liba.so",
        "/abs/liba.so",
        EntryKind::Dependency,
    ));
    toc.push(Entry::directive("fp-ignore-signals"));

    let mut collect = Collect::new(
        &env.config,
        "app",
        vec![NodeInput::Entries(toc)],
        CollectOptions::default(),
    );
    collect.build().unwrap();

    let out = env.config.distpath.join("app");
    let names: Vec<String> = fs::read_dir(&out)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, ["data.txt"]);
}

#[test]
fn test_destination_type_conflict_is_fatal() {
    let env = TestEnv::new();
    let mut toc = Toc::new();
    toc.push(Entry::new(
        "slot",
        env.write_source("slot.txt", "a file"),
        EntryKind::Data,
    ));
    toc.push(Entry::new(
        "slot/inner.txt",
        env.write_source("inner.txt", "needs a directory"),
        EntryKind::Data,
    ));

    let mut collect = Collect::new(
        &env.config,
        "app",
        vec![NodeInput::Entries(toc)],
        CollectOptions::default(),
    );
    let err = collect.build().unwrap_err();
    assert!(err.to_string().contains("a file already exists"));
}

#[test]
fn test_directory_mode_pipeline() {
    let env = TestEnv::new();
    env.install_bootstrap("run", b"MOCK-BOOTSTRAP-BINARY");

    let mut toc = Toc::new();
    toc.push(Entry::new(
        "main",
        env.write_source("main.src", "entry point"),
        EntryKind::Source,
    ));
    toc.push(Entry::new(
        "liba.so",
        env.write_source("liba.so", "shared"),
        EntryKind::Binary,
    ));

    let mut exe = Executable::new(
        &env.config,
        "app",
        vec![NodeInput::Entries(toc.clone())],
        ExeOptions {
            exclude_binaries: true,
            append_archive: false,
            ..ExeOptions::default()
        },
    )
    .unwrap();
    exe.build().unwrap();
    // Directory-mode executables land in the work directory first.
    assert!(env.config.workpath.join("app").exists());

    // Binaries were forwarded out of the archive for the collector.
    let (_, entries) = container::read_index(&env.config.workpath.join("app.fpk")).unwrap();
    assert!(entries.iter().all(|e| e.name != "liba.so"));
    assert!(entries.iter().any(|e| e.name == "main"));

    let mut collect = Collect::new(
        &env.config,
        "app",
        vec![
            NodeInput::Built(exe.artifact()),
            NodeInput::Entries(toc),
        ],
        CollectOptions::default(),
    );
    collect.build().unwrap();

    let out = env.config.distpath.join("app");
    assert!(out.join("app").exists());
    assert!(out.join("app.fpk").exists());
    assert!(out.join("liba.so").exists());
}

#[test]
fn test_directory_entries_copied_recursively() {
    let env = TestEnv::new();
    env.write_source("assets/style/main.css", "css");
    env.write_source("assets/logo.svg", "svg");

    let mut toc = Toc::new();
    toc.push(Entry::new(
        "assets",
        env.src.join("assets"),
        EntryKind::Data,
    ));

    let mut collect = Collect::new(
        &env.config,
        "app",
        vec![NodeInput::Entries(toc)],
        CollectOptions::default(),
    );
    collect.build().unwrap();

    let out = env.config.distpath.join("app");
    assert!(out.join("assets/style/main.css").exists());
    assert!(out.join("assets/logo.svg").exists());
}
