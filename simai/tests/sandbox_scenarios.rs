//! End-to-end sandbox runs against fake simulators: relocation into file and
//! directory destinations, failure reporting, and cleanup on every path.
#![cfg(unix)]

use std::fs;
use std::thread;
use std::time::{Duration, Instant};

use simai::Error;
use simai::core::resources::ANALYTICAL_BINARY;
use simai::io::process::{CancelToken, RunLimits};
use simai::io::sandbox::{Destination, OutputSpec, RunRequest, Sandbox, StagedInput};
use simai::test_support::{FakeInstall, entry_count};

fn analytical_outputs() -> OutputSpec {
    OutputSpec::new(["results/*"]).with_primary("results/*EndToEnd.csv")
}

#[test]
fn end_to_end_csv_lands_at_requested_file() {
    let fx = FakeInstall::new();
    fx.source_binary(
        ANALYTICAL_BINARY,
        "mkdir -p results\nprintf 'layer,time\\n' > results/result_EndToEnd.csv",
    );
    let binary = fx
        .resolver_with_override()
        .resolve_binary(ANALYTICAL_BINARY)
        .expect("resolve");
    let sandboxes = fx.work().join("sandboxes");
    let out = fx.work().join("out/summary.csv");

    let report = Sandbox::default()
        .with_root(&sandboxes)
        .run(RunRequest::new("analytical", binary, Destination::File(out.clone())).outputs(analytical_outputs()))
        .expect("run");

    assert_eq!(report.primary.as_deref(), Some(out.as_path()));
    assert_eq!(fs::read_to_string(&out).expect("read"), "layer,time\n");
    assert_eq!(entry_count(&fx.work().join("out")), 1);
    assert_eq!(entry_count(&sandboxes), 0);
}

#[test]
fn secondary_outputs_sit_beside_the_primary() {
    let fx = FakeInstall::new();
    let binary = fx.source_binary(
        ANALYTICAL_BINARY,
        "mkdir -p results\necho e2e > results/run_EndToEnd.csv\necho dim > results/run_dimension_utilization.csv",
    );
    let out_dir = fx.work().join("out");

    let report = Sandbox::default()
        .with_root(fx.work().join("sandboxes"))
        .run(
            RunRequest::new("analytical", binary, Destination::File(out_dir.join("summary.csv")))
                .outputs(analytical_outputs()),
        )
        .expect("run");

    assert_eq!(report.relocated.len(), 2);
    assert_eq!(fs::read_to_string(out_dir.join("summary.csv")).expect("read"), "e2e\n");
    assert!(out_dir.join("run_dimension_utilization.csv").is_file());
}

#[test]
fn failed_run_relocates_nothing_and_keeps_stderr() {
    let fx = FakeInstall::new();
    let binary = fx.source_binary(
        ANALYTICAL_BINARY,
        "mkdir -p results\necho partial > results/x_EndToEnd.csv\necho 'topology: bad link on line 3' >&2\nexit 1",
    );
    let sandboxes = fx.work().join("sandboxes");
    let out = fx.work().join("out");

    let err = Sandbox::default()
        .with_root(&sandboxes)
        .run(RunRequest::new("analytical", binary, Destination::Directory(out.clone())).outputs(analytical_outputs()))
        .unwrap_err();

    let Error::ExecutionFailed {
        exit_code, stderr, ..
    } = err
    else {
        panic!("expected ExecutionFailed, got {err:?}");
    };
    assert_eq!(exit_code, Some(1));
    assert_eq!(stderr, "topology: bad link on line 3\n");
    assert_eq!(entry_count(&out), 0);
    assert_eq!(entry_count(&sandboxes), 0);
}

/// Writes a matching output, then outlives any reasonable timeout.
const WRITE_THEN_HANG: &str = "mkdir -p results\necho early > results/x_EndToEnd.csv\nsleep 30\necho late";

#[test]
fn cancelled_run_relocates_nothing_and_cleans_up() {
    let fx = FakeInstall::new();
    let binary = fx.source_binary(ANALYTICAL_BINARY, WRITE_THEN_HANG);
    let sandboxes = fx.work().join("sandboxes");
    let out = fx.work().join("out");
    let cancel = CancelToken::new();
    cancel.cancel();

    let started = Instant::now();
    let err = Sandbox::new(RunLimits::default(), cancel)
        .with_root(&sandboxes)
        .run(RunRequest::new("analytical", binary, Destination::Directory(out.clone())).outputs(analytical_outputs()))
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());
    let Error::Cancelled { reason, .. } = &err else {
        panic!("expected Cancelled, got {err:?}");
    };
    assert_eq!(reason, "interrupted");
    assert_eq!(entry_count(&out), 0);
    assert_eq!(entry_count(&sandboxes), 0);
}

#[test]
fn timed_out_run_relocates_nothing_and_cleans_up() {
    let fx = FakeInstall::new();
    let binary = fx.source_binary(ANALYTICAL_BINARY, WRITE_THEN_HANG);
    let sandboxes = fx.work().join("sandboxes");
    let out = fx.work().join("out/summary.csv");
    let limits = RunLimits {
        timeout: Some(Duration::from_millis(200)),
        ..RunLimits::default()
    };

    let started = Instant::now();
    let err = Sandbox::new(limits, CancelToken::new())
        .with_root(&sandboxes)
        .run(RunRequest::new("analytical", binary, Destination::File(out.clone())).outputs(analytical_outputs()))
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());
    let Error::Cancelled { reason, .. } = &err else {
        panic!("expected Cancelled, got {err:?}");
    };
    assert_eq!(reason, "timed out after 200ms");
    assert!(!out.exists());
    assert_eq!(entry_count(&fx.work().join("out")), 0);
    assert_eq!(entry_count(&sandboxes), 0);
}

#[test]
fn launch_failure_cleans_up() {
    let fx = FakeInstall::new();
    let not_a_program = fx.work().join("bin/SimAI_simulator");
    fs::create_dir_all(not_a_program.parent().expect("parent")).expect("mkdir");
    fs::write(&not_a_program, "plain text").expect("write");
    let sandboxes = fx.work().join("sandboxes");

    let err = Sandbox::default()
        .with_root(&sandboxes)
        .run(RunRequest::new(
            "ns3",
            &not_a_program,
            Destination::Directory(fx.work().join("out")),
        ))
        .unwrap_err();

    assert!(matches!(err, Error::LaunchFailed { .. }), "{err:?}");
    assert_eq!(entry_count(&sandboxes), 0);
}

#[test]
fn concurrent_sessions_do_not_see_each_other() {
    let fx = FakeInstall::new();
    // Each run writes a marker, waits, then lists its working directory.
    let binary = fx.source_binary(
        "SimAI_simulator",
        "echo \"$1\" > mine.txt\nsleep 0.2\nLC_ALL=C ls > listing.txt",
    );
    let sandbox = Sandbox::default().with_root(fx.work().join("sandboxes"));
    let conf = fx.work().join("SimAI.conf");
    fs::write(&conf, "ENABLE_QCN 1\n").expect("write");

    thread::scope(|scope| {
        let handles: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|tag| {
                let (sandbox, binary, conf) = (&sandbox, &binary, &conf);
                let out = fx.work().join(format!("out_{tag}"));
                scope.spawn(move || {
                    sandbox
                        .run(
                            RunRequest::new("ns3", binary, Destination::Directory(out.clone()))
                                .arg(tag)
                                .stage(StagedInput::copy(conf, "SimAI.conf"))
                                .outputs(OutputSpec::new(["mine.txt", "listing.txt"])),
                        )
                        .expect("run");
                    out
                })
            })
            .collect();
        for (handle, tag) in handles.into_iter().zip(["a", "b", "c"]) {
            let out = handle.join().expect("join");
            assert_eq!(fs::read_to_string(out.join("mine.txt")).expect("read"), format!("{tag}\n"));
            let listing = fs::read_to_string(out.join("listing.txt")).expect("read");
            let names: Vec<&str> = listing.lines().collect();
            assert_eq!(names, ["SimAI.conf", "listing.txt", "mine.txt"]);
        }
    });
    assert_eq!(entry_count(&fx.work().join("sandboxes")), 0);
}
