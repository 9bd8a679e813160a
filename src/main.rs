/*!
 * Robocurse - Scheduled Parallel Directory Replication
 *
 * Headless entry point: loads the JSON configuration, recovers orphaned
 * snapshots and mounts from prior crashes, then drives the orchestrator's
 * tick loop until every profile has replicated or a stop is requested.
 */

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use robocurse::config::{default_state_dir, Config};
use robocurse::copier::RobocopyLauncher;
use robocurse::error::RobocurseError;
use robocurse::logging;
use robocurse::mount::MountCoordinator;
use robocurse::orchestrator::{Orchestrator, RunOptions, TICK_INTERVAL};
use robocurse::vss::{self, VssCoordinator};

#[derive(Debug, Parser)]
#[command(
    name = "robocurse",
    version,
    about = "Scheduled parallel directory replication driving robocopy"
)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Run without a console session (scheduled mode)
    #[arg(long)]
    headless: bool,

    /// List work without copying (/L on every copier invocation)
    #[arg(long)]
    dry_run: bool,

    /// Start fresh even if a resume checkpoint exists
    #[arg(long)]
    ignore_checkpoint: bool,

    /// Probe remote-management connectivity to a server, then exit
    #[arg(long, value_name = "SERVER")]
    test_remote: Option<String>,

    /// Persist an explicit copier binary override, then exit
    #[arg(long, value_name = "PATH")]
    set_copier_path: Option<PathBuf>,

    /// Debug-level logging
    #[arg(long, short)]
    verbose: bool,
}

/// Small operator-level preferences persisted outside the config file
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredPrefs {
    copier_path: Option<PathBuf>,
}

fn prefs_path() -> PathBuf {
    default_state_dir().join("robocurse-prefs.json")
}

fn load_prefs() -> StoredPrefs {
    robocurse::persist::read_json(&prefs_path())
        .ok()
        .flatten()
        .unwrap_or_default()
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("error: {:#}", e);
            let code = e
                .downcast_ref::<RobocurseError>()
                .map(|err| err.exit_code())
                .unwrap_or(1);
            ExitCode::from(code as u8)
        }
    }
}

fn run() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let log_file = cli
        .headless
        .then(|| default_state_dir().join("logs").join("robocurse.log"));
    logging::init_logging(cli.verbose, log_file.as_deref())
        .context("failed to initialize logging")?;

    if let Some(path) = &cli.set_copier_path {
        return set_copier_path(path);
    }

    if let Some(server) = &cli.test_remote {
        return test_remote(server);
    }

    let config_path = cli.config.as_deref().ok_or_else(|| {
        RobocurseError::ConfigInvalid("--config is required".to_string())
    })?;
    let config = Config::load(config_path)?;
    info!(
        profiles = config.profiles.len(),
        config = %config_path.display(),
        "configuration loaded"
    );

    run_replication(config, &cli)
}

fn run_replication(mut config: Config, cli: &Cli) -> anyhow::Result<ExitCode> {
    // An operator-stored copier override applies when the config is silent.
    if config.settings.copier_path.is_none() {
        config.settings.copier_path = load_prefs().copier_path;
    }

    let launcher = RobocopyLauncher::new(config.settings.copier_path.as_deref())?;
    info!(copier = %launcher.copier_path().display(), "copier resolved");

    let state_dir = config.state_dir();
    let wants_vss = config.profiles.iter().any(|profile| profile.use_vss);
    let wants_mounts = config.profiles.iter().any(|profile| profile.touches_network());

    let opts = RunOptions {
        ignore_checkpoint: cli.ignore_checkpoint,
        dry_run: cli.dry_run,
        skip_init: false,
        headless: cli.headless,
    };

    let mut orchestrator = Orchestrator::new(config, Box::new(launcher), opts)?;

    if wants_vss {
        match vss::platform_backend() {
            Ok(backend) => {
                orchestrator = orchestrator.with_vss(VssCoordinator::new(backend, &state_dir));
            }
            Err(e) => warn!(error = %e, "snapshots requested but unavailable; copying live sources"),
        }
    }

    if wants_mounts {
        match platform_mount_coordinator(&state_dir) {
            Ok(coordinator) => orchestrator = orchestrator.with_mounts(coordinator),
            Err(e) => warn!(error = %e, "UNC profiles present but mounting is unavailable"),
        }
    }

    let state = orchestrator.state();
    orchestrator.start()?;
    orchestrator.run_to_completion(TICK_INTERVAL)?;

    for result in state.profile_results() {
        info!(
            profile = %result.profile_name,
            completed = result.completed_chunks,
            failed = result.failed_chunks,
            skipped = result.skipped_chunks,
            copied = %robocurse::report::format_bytes(result.bytes_copied),
            "profile summary"
        );
    }

    if state.any_failures() {
        Ok(ExitCode::from(1))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

fn platform_mount_coordinator(state_dir: &Path) -> robocurse::Result<MountCoordinator> {
    #[cfg(windows)]
    {
        Ok(MountCoordinator::new(
            Box::new(robocurse::mount::windows_backend::NetUseBackend::new()),
            robocurse::mount::platform_lock(),
            state_dir,
        ))
    }
    #[cfg(not(windows))]
    {
        let _ = state_dir;
        Err(RobocurseError::Unsupported(
            "drive-letter mounting requires Windows".to_string(),
        ))
    }
}

fn set_copier_path(path: &Path) -> anyhow::Result<ExitCode> {
    if !path.is_file() {
        return Err(RobocurseError::CopierNotFound.into());
    }
    let prefs = StoredPrefs {
        copier_path: Some(path.to_path_buf()),
    };
    robocurse::persist::write_json_atomic(&prefs_path(), &prefs)
        .context("failed to store copier path")?;
    println!("copier path set to {}", path.display());
    Ok(ExitCode::SUCCESS)
}

/// Probe the management path to a server: session, share resolution, and
/// remote command execution, reporting each step.
fn test_remote(server: &str) -> anyhow::Result<ExitCode> {
    let backend = vss::platform_backend()?;

    println!("probing {} ...", server);

    match backend.resolve_share(server, "ADMIN$", None) {
        Ok(path) => println!("  share resolution: ok (ADMIN$ -> {})", path),
        Err(e) => {
            println!("  share resolution: FAILED ({})", e);
            return Ok(ExitCode::from(1));
        }
    }

    match backend.remote_exec(server, "ver", None, vss::REMOTE_CALL_TIMEOUT) {
        Ok(_) => println!("  remote execution: ok"),
        Err(e) => {
            println!("  remote execution: FAILED ({})", e);
            return Ok(ExitCode::from(1));
        }
    }

    println!("remote management to {} looks healthy", server);
    Ok(ExitCode::SUCCESS)
}
