/*!
 * Orchestrator tick-loop integration tests
 *
 * Drive the reap-then-dispatch loop against a scripted in-memory launcher:
 * dispatch bounds, retry/backoff, stop and pause, bandwidth sharing, and
 * the end-to-end scenarios a run must satisfy.
 */

mod common;

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::tempdir;

use common::{build_tree, log_with_summary, FakeLauncher, SharedLauncher};
use robocurse::config::{
    ChunkLimits, Config, CopyOptions, GlobalSettings, Profile, ScanMode,
};
use robocurse::error::RobocurseError;
use robocurse::orchestrator::{Callbacks, Orchestrator, RunEvent, RunOptions};
use robocurse::state::Phase;

const TICK: Duration = Duration::from_millis(1);

fn profile(name: &str, source: &Path, dest: &Path, max_bytes: u64) -> Profile {
    Profile {
        name: name.to_string(),
        source: source.to_path_buf(),
        destination: dest.to_path_buf(),
        scan_mode: ScanMode::Smart,
        chunk_limits: ChunkLimits {
            max_bytes,
            max_files: 10_000,
            max_depth: 4,
        },
        options: CopyOptions::default(),
        use_vss: false,
        mismatch_severity: None,
        credential: None,
    }
}

fn settings(state_dir: &Path) -> GlobalSettings {
    GlobalSettings {
        state_dir: Some(state_dir.to_path_buf()),
        // Tests never want to sleep through real backoff windows.
        retry_backoff_base_secs: 0,
        ..Default::default()
    }
}

#[test]
fn test_single_chunk_dry_run_completes_cleanly() {
    let source = tempdir().unwrap();
    let dest = tempdir().unwrap();
    let state_dir = tempdir().unwrap();
    build_tree(
        source.path(),
        &[("a.bin", 100), ("b.bin", 200), ("c.bin", 300)],
        &[],
    );

    let launcher = FakeLauncher::new(1);
    *launcher.log_template.lock() = Some(log_with_summary(3, 600));

    let config = Config {
        profiles: vec![profile("solo", source.path(), dest.path(), 1 << 30)],
        settings: settings(state_dir.path()),
    };
    let mut orchestrator = Orchestrator::new(
        config,
        Box::new(SharedLauncher(launcher.clone())),
        RunOptions {
            dry_run: true,
            ..Default::default()
        },
    )
    .unwrap();
    let state = orchestrator.state();

    orchestrator.start().unwrap();
    orchestrator.run_to_completion(TICK).unwrap();

    assert_eq!(state.phase(), Phase::Complete);
    assert_eq!(state.completed_count(), 1);
    assert_eq!(state.completed_chunk_bytes(), 600);
    assert!(!state.any_failures());

    let results = state.profile_results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].completed_chunks, 1);
    assert_eq!(results[0].failed_chunks, 0);
    assert_eq!(results[0].bytes_copied, 600);
    assert_eq!(results[0].files_copied, 3);

    // Dry-run reached the launcher, and the checkpoint is gone.
    assert!(launcher.launches.lock()[0].dry_run);
    assert!(!state_dir.path().join("robocurse-checkpoint.json").exists());
}

#[test]
fn test_warning_exit_completes_and_fatal_with_copy_errors_retries() {
    let source = tempdir().unwrap();
    let dest = tempdir().unwrap();
    let state_dir = tempdir().unwrap();
    let subdirs = build_tree(source.path(), &[], &[("alpha", 500), ("beta", 500)]);

    let launcher = FakeLauncher::new(1);
    // alpha: copy errors only -> warning, not retried.
    launcher.script(&subdirs[0], &[8]);
    // beta: fatal + copy errors -> retried once, then clean.
    launcher.script(&subdirs[1], &[24, 1]);

    let config = Config {
        profiles: vec![profile("two", source.path(), dest.path(), 600)],
        settings: settings(state_dir.path()),
    };
    let mut orchestrator = Orchestrator::new(
        config,
        Box::new(SharedLauncher(launcher.clone())),
        RunOptions::default(),
    )
    .unwrap();
    let state = orchestrator.state();

    orchestrator.start().unwrap();
    orchestrator.run_to_completion(TICK).unwrap();

    assert_eq!(state.phase(), Phase::Complete);
    let results = state.profile_results();
    // Loose-files chunk + alpha + beta all completed; nothing failed.
    assert_eq!(results[0].completed_chunks, 3);
    assert_eq!(results[0].failed_chunks, 0);
    assert!(state.drain_errors().is_empty());

    // beta ran twice.
    let beta_launches = launcher
        .launches
        .lock()
        .iter()
        .filter(|record| record.source == subdirs[1])
        .count();
    assert_eq!(beta_launches, 2);
}

#[test]
fn test_concurrency_bound_and_at_most_once_dispatch() {
    let source = tempdir().unwrap();
    let dest = tempdir().unwrap();
    let state_dir = tempdir().unwrap();
    let names: Vec<String> = (0..8).map(|i| format!("dir{}", i)).collect();
    let dirs: Vec<(&str, usize)> = names.iter().map(|name| (name.as_str(), 500)).collect();
    build_tree(source.path(), &[], &dirs);

    let launcher = FakeLauncher::new(1);
    // Jobs linger for a few ticks so concurrency actually builds up.
    launcher.polls_before_exit.store(2, Ordering::SeqCst);

    let mut config = Config {
        profiles: vec![profile("many", source.path(), dest.path(), 600)],
        settings: settings(state_dir.path()),
    };
    config.settings.max_concurrent_jobs = 3;

    let mut orchestrator = Orchestrator::new(
        config,
        Box::new(SharedLauncher(launcher.clone())),
        RunOptions::default(),
    )
    .unwrap();
    let state = orchestrator.state();

    orchestrator.start().unwrap();
    let total = state.profile_total_chunks();
    assert_eq!(total, 9); // loose-files chunk + 8 directories

    let mut max_active = 0;
    while !orchestrator.is_finished() {
        orchestrator.tick().unwrap();
        max_active = max_active.max(state.active_jobs.len());
        assert!(state.active_jobs.len() <= 3, "concurrency limit breached");
    }
    assert_eq!(max_active, 3);

    // Every chunk launched exactly once; the counters reconcile.
    let launches = launcher.launches.lock();
    let mut ids: Vec<u64> = launches.iter().map(|record| record.chunk_id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), launches.len(), "a chunk was dispatched twice");
    assert_eq!(launches.len() as u64, total);

    let results = state.profile_results();
    assert_eq!(
        state.completed_count(),
        results[0].completed_chunks as u64 + results[0].failed_chunks as u64
            + state.skipped_count()
    );
    assert_eq!(results[0].completed_chunks as u64, total);
}

#[test]
fn test_launch_failure_is_retried() {
    let source = tempdir().unwrap();
    let dest = tempdir().unwrap();
    let state_dir = tempdir().unwrap();
    build_tree(source.path(), &[("a.bin", 100)], &[]);

    let launcher = FakeLauncher::new(1);
    launcher.launch_failures.store(1, Ordering::SeqCst);

    let config = Config {
        profiles: vec![profile("flaky", source.path(), dest.path(), 1 << 30)],
        settings: settings(state_dir.path()),
    };
    let mut orchestrator = Orchestrator::new(
        config,
        Box::new(SharedLauncher(launcher.clone())),
        RunOptions::default(),
    )
    .unwrap();
    let state = orchestrator.state();

    orchestrator.start().unwrap();
    orchestrator.run_to_completion(TICK).unwrap();

    assert_eq!(state.phase(), Phase::Complete);
    assert_eq!(state.profile_results()[0].completed_chunks, 1);
    assert_eq!(launcher.launch_count(), 1);
    assert!(!state.any_failures());
}

#[test]
fn test_launch_failures_exhaust_to_terminal_failure() {
    let source = tempdir().unwrap();
    let dest = tempdir().unwrap();
    let state_dir = tempdir().unwrap();
    build_tree(source.path(), &[("a.bin", 100)], &[]);

    let launcher = FakeLauncher::new(1);
    launcher.launch_failures.store(100, Ordering::SeqCst);

    let mut config = Config {
        profiles: vec![profile("doomed", source.path(), dest.path(), 1 << 30)],
        settings: settings(state_dir.path()),
    };
    config.settings.max_chunk_retries = 2;

    let mut orchestrator = Orchestrator::new(
        config,
        Box::new(SharedLauncher(launcher)),
        RunOptions::default(),
    )
    .unwrap();
    let state = orchestrator.state();

    orchestrator.start().unwrap();
    orchestrator.run_to_completion(TICK).unwrap();

    assert_eq!(state.phase(), Phase::Complete);
    let results = state.profile_results();
    assert_eq!(results[0].completed_chunks, 0);
    assert_eq!(results[0].failed_chunks, 1);
    assert!(state.any_failures());

    let errors = state.drain_errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("failed"));

    // The health surface latched unhealthy on the failure.
    let health = robocurse::read_health(
        &state_dir.path().join("robocurse-health.json"),
        Duration::from_secs(3600),
    )
    .unwrap()
    .unwrap();
    assert!(!health.healthy);
}

#[test]
fn test_stop_kills_active_jobs_and_skips_remaining_profiles() {
    let source_a = tempdir().unwrap();
    let source_b = tempdir().unwrap();
    let dest = tempdir().unwrap();
    let state_dir = tempdir().unwrap();
    let names: Vec<String> = (0..10).map(|i| format!("dir{}", i)).collect();
    let dirs: Vec<(&str, usize)> = names.iter().map(|name| (name.as_str(), 500)).collect();
    build_tree(source_a.path(), &[], &dirs);
    build_tree(source_b.path(), &[("later.bin", 10)], &[]);

    let launcher = FakeLauncher::new(1);
    launcher.hold_jobs.store(true, Ordering::SeqCst);

    let mut config = Config {
        profiles: vec![
            profile("first", source_a.path(), dest.path(), 600),
            profile("second", source_b.path(), dest.path(), 1 << 30),
        ],
        settings: settings(state_dir.path()),
    };
    config.settings.max_concurrent_jobs = 3;

    let mut orchestrator = Orchestrator::new(
        config,
        Box::new(SharedLauncher(launcher.clone())),
        RunOptions::default(),
    )
    .unwrap();
    let state = orchestrator.state();

    orchestrator.start().unwrap();
    orchestrator.tick().unwrap();
    assert_eq!(state.active_jobs.len(), 3);

    orchestrator.request_stop();
    orchestrator.tick().unwrap();

    assert_eq!(state.phase(), Phase::Stopped);
    assert!(state.active_jobs.is_empty());
    assert!(orchestrator.is_finished());
    assert!(state.profile_results().is_empty());

    // Nothing from the second profile was ever dispatched.
    assert!(launcher
        .launches
        .lock()
        .iter()
        .all(|record| record.source.starts_with(source_a.path())));
}

#[test]
fn test_pause_reaps_but_does_not_dispatch() {
    let source = tempdir().unwrap();
    let dest = tempdir().unwrap();
    let state_dir = tempdir().unwrap();
    build_tree(source.path(), &[], &[("one", 500), ("two", 500)]);

    let launcher = FakeLauncher::new(1);

    let mut config = Config {
        profiles: vec![profile("paced", source.path(), dest.path(), 600)],
        settings: settings(state_dir.path()),
    };
    config.settings.max_concurrent_jobs = 1;

    let mut orchestrator = Orchestrator::new(
        config,
        Box::new(SharedLauncher(launcher.clone())),
        RunOptions::default(),
    )
    .unwrap();
    let state = orchestrator.state();

    orchestrator.start().unwrap();
    orchestrator.request_pause();

    for _ in 0..5 {
        orchestrator.tick().unwrap();
    }
    // Paused before anything launched: the queue holds, nothing runs.
    assert_eq!(launcher.launch_count(), 0);
    assert_eq!(state.completed_count(), 0);
    assert_eq!(state.phase(), Phase::Replicating);

    orchestrator.request_resume();
    orchestrator.run_to_completion(TICK).unwrap();
    assert_eq!(state.phase(), Phase::Complete);
    assert_eq!(state.profile_results()[0].completed_chunks, 3);
}

#[test]
fn test_profiles_run_in_order_with_events() {
    let source_a = tempdir().unwrap();
    let source_b = tempdir().unwrap();
    let dest = tempdir().unwrap();
    let state_dir = tempdir().unwrap();
    build_tree(source_a.path(), &[("a.bin", 10)], &[]);
    build_tree(source_b.path(), &[("b.bin", 20)], &[]);

    let launcher = FakeLauncher::new(1);
    let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();

    let config = Config {
        profiles: vec![
            profile("first", source_a.path(), dest.path(), 1 << 30),
            profile("second", source_b.path(), dest.path(), 1 << 30),
        ],
        settings: settings(state_dir.path()),
    };
    let mut orchestrator = Orchestrator::new(
        config,
        Box::new(SharedLauncher(launcher)),
        RunOptions::default(),
    )
    .unwrap()
    .with_callbacks(Callbacks {
        on_event: Some(Box::new(move |event: &RunEvent| {
            let label = match event {
                RunEvent::SessionStart { .. } => "session-start".to_string(),
                RunEvent::ProfileStart { profile } => format!("start:{}", profile),
                RunEvent::ChunkFailed { .. } => "chunk-failed".to_string(),
                RunEvent::ProfileComplete { profile, success } => {
                    format!("complete:{}:{}", profile, success)
                }
                RunEvent::SessionEnd { success } => format!("session-end:{}", success),
            };
            sink.lock().push(label);
        })),
        ..Default::default()
    });
    let state = orchestrator.state();

    orchestrator.start().unwrap();
    orchestrator.run_to_completion(TICK).unwrap();

    let results = state.profile_results();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].profile_name, "first");
    assert_eq!(results[1].profile_name, "second");

    let events = events.lock();
    assert_eq!(events[0], "session-start");
    let start_first = events.iter().position(|e| e == "start:first").unwrap();
    let start_second = events.iter().position(|e| e == "start:second").unwrap();
    assert!(start_first < start_second);
    assert_eq!(events.last().unwrap(), "session-end:true");
}

#[test]
fn test_unreadable_profile_is_skipped_but_run_continues() {
    let source_good = tempdir().unwrap();
    let dest = tempdir().unwrap();
    let state_dir = tempdir().unwrap();
    build_tree(source_good.path(), &[("ok.bin", 10)], &[]);

    let launcher = FakeLauncher::new(1);
    let config = Config {
        profiles: vec![
            profile(
                "missing",
                &state_dir.path().join("does-not-exist"),
                dest.path(),
                1 << 30,
            ),
            profile("good", source_good.path(), dest.path(), 1 << 30),
        ],
        settings: settings(state_dir.path()),
    };
    let mut orchestrator = Orchestrator::new(
        config,
        Box::new(SharedLauncher(launcher)),
        RunOptions::default(),
    )
    .unwrap();
    let state = orchestrator.state();

    orchestrator.start().unwrap();
    orchestrator.run_to_completion(TICK).unwrap();

    assert_eq!(state.phase(), Phase::Complete);
    let results = state.profile_results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].profile_name, "good");

    let errors = state.drain_errors();
    assert!(errors.iter().any(|message| message.contains("missing")));
}

#[test]
fn test_headless_unc_without_credential_aborts_start() {
    let dest = tempdir().unwrap();
    let state_dir = tempdir().unwrap();

    let launcher = FakeLauncher::new(1);
    let config = Config {
        profiles: vec![profile(
            "unc",
            Path::new(r"\\nas01\archive\data"),
            dest.path(),
            1 << 30,
        )],
        settings: settings(state_dir.path()),
    };
    let mut orchestrator = Orchestrator::new(
        config,
        Box::new(SharedLauncher(launcher.clone())),
        RunOptions {
            headless: true,
            ..Default::default()
        },
    )
    .unwrap();

    let err = orchestrator.start().unwrap_err();
    assert!(matches!(err, RobocurseError::UncRequiresCredential(_)));
    assert_eq!(launcher.launch_count(), 0);
}

#[test]
fn test_dynamic_ipg_grows_with_active_jobs() {
    let source = tempdir().unwrap();
    let dest = tempdir().unwrap();
    let state_dir = tempdir().unwrap();
    let names: Vec<String> = (0..4).map(|i| format!("dir{}", i)).collect();
    let dirs: Vec<(&str, usize)> = names.iter().map(|name| (name.as_str(), 500)).collect();
    build_tree(source.path(), &[], &dirs);

    let launcher = FakeLauncher::new(1);
    launcher.polls_before_exit.store(50, Ordering::SeqCst);

    let mut config = Config {
        profiles: vec![profile("throttled", source.path(), dest.path(), 600)],
        settings: settings(state_dir.path()),
    };
    config.settings.bandwidth_limit_mbps = 100;
    config.settings.max_concurrent_jobs = 8;

    let mut orchestrator = Orchestrator::new(
        config,
        Box::new(SharedLauncher(launcher.clone())),
        RunOptions::default(),
    )
    .unwrap();

    orchestrator.start().unwrap();
    orchestrator.run_to_completion(TICK).unwrap();

    let launches = launcher.launches.lock();
    assert_eq!(launches.len(), 5);
    // The first job gets the whole budget; each later one a smaller share.
    assert_eq!(launches[0].ipg_ms, robocurse::compute_ipg(100, 0, true));
    for pair in launches.windows(2) {
        assert!(pair[1].ipg_ms >= pair[0].ipg_ms);
    }
    assert!(launches[4].ipg_ms > launches[0].ipg_ms);
}

#[test]
fn test_fixed_ipg_override_wins() {
    let source = tempdir().unwrap();
    let dest = tempdir().unwrap();
    let state_dir = tempdir().unwrap();
    build_tree(source.path(), &[("a.bin", 10)], &[]);

    let launcher = FakeLauncher::new(1);
    let mut config = Config {
        profiles: vec![profile("fixed", source.path(), dest.path(), 1 << 30)],
        settings: settings(state_dir.path()),
    };
    config.settings.bandwidth_limit_mbps = 100;
    config.profiles[0].options.inter_packet_gap_ms = 77;

    let mut orchestrator = Orchestrator::new(
        config,
        Box::new(SharedLauncher(launcher.clone())),
        RunOptions::default(),
    )
    .unwrap();

    orchestrator.start().unwrap();
    orchestrator.run_to_completion(TICK).unwrap();

    assert_eq!(launcher.launches.lock()[0].ipg_ms, 77);
}

#[test]
fn test_chunk_logs_live_under_jobs_directory() {
    let source = tempdir().unwrap();
    let dest = tempdir().unwrap();
    let state_dir = tempdir().unwrap();
    build_tree(source.path(), &[("a.bin", 10)], &[]);

    let launcher = FakeLauncher::new(1);
    let config = Config {
        profiles: vec![profile("logs", source.path(), dest.path(), 1 << 30)],
        settings: settings(state_dir.path()),
    };
    let mut orchestrator = Orchestrator::new(
        config,
        Box::new(SharedLauncher(launcher.clone())),
        RunOptions::default(),
    )
    .unwrap();
    let session = orchestrator.state().session_id.to_string();

    orchestrator.start().unwrap();
    orchestrator.run_to_completion(TICK).unwrap();

    let log_path: PathBuf = launcher.launches.lock()[0].log_path.clone();
    assert!(log_path.starts_with(state_dir.path().join("Jobs")));
    let name = log_path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with(&session));
    assert!(name.contains("_Chunk_"));
}
