/*!
 * Copier argument synthesis
 *
 * Builds the full robocopy argument vector for one chunk. Paths are quoted
 * here (the vector is handed to the process raw on Windows), user switches
 * are filtered against the managed set and the safety whitelist, and the
 * dynamic inter-packet gap is attached when bandwidth is limited.
 */

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::config::CopyOptions;
use crate::error::Result;
use crate::planner::Chunk;
use crate::safety;

/// Per-launch context owned by the orchestrator
#[derive(Debug, Clone)]
pub struct ArgContext {
    /// `/MT:<n>` copier threads
    pub threads_per_job: u32,
    /// `/IPG:<ms>`; 0 omits the switch
    pub ipg_ms: u32,
    /// Append `/L` so the copier only lists work
    pub dry_run: bool,
    /// `/LOG:<path>` target for this chunk
    pub log_path: PathBuf,
}

/// Pacing constants for the inter-packet-gap computation. The copier sends
/// 512-byte packets and honors the gap across an 800-packet window per
/// second of budget.
const PACKET_BYTES: u64 = 512;
const PACKETS_PER_WINDOW: u64 = 800;
const IPG_MIN_MS: u64 = 1;
const IPG_MAX_MS: u64 = 10_000;

/// Compute the dynamic inter-packet gap in milliseconds.
///
/// The aggregate limit is split evenly across the jobs that will be running
/// once the pending job starts; 0 disables throttling.
pub fn compute_ipg(limit_mbps: u32, active_jobs: usize, pending_start: bool) -> u32 {
    if limit_mbps == 0 {
        return 0;
    }

    let effective_jobs = (active_jobs as u64 + u64::from(pending_start)).max(1);
    let bytes_per_sec_per_job = (u64::from(limit_mbps) * 125_000) / effective_jobs;
    if bytes_per_sec_per_job == 0 {
        return IPG_MAX_MS as u32;
    }

    let window_ms = PACKET_BYTES * PACKETS_PER_WINDOW * 1000;
    let ipg = window_ms.div_ceil(bytes_per_sec_per_job);
    ipg.clamp(IPG_MIN_MS, IPG_MAX_MS) as u32
}

/// Quote a path argument.
///
/// A trailing backslash is doubled before the closing quote so the command
/// line parser does not read `\"` as an escaped quote.
pub fn quote_path(path: &Path) -> String {
    let text = path.to_string_lossy();
    if text.ends_with('\\') {
        format!("\"{}\\\"", text)
    } else {
        format!("\"{}\"", text)
    }
}

/// Synthesize the full argument vector for one chunk.
pub fn build_args(chunk: &Chunk, options: &CopyOptions, ctx: &ArgContext) -> Result<Vec<String>> {
    let source = safety::sanitize_path(&chunk.source)?;
    let destination = safety::sanitize_path(&chunk.destination)?;

    let mut args = Vec::new();
    args.push(quote_path(&source));
    args.push(quote_path(&destination));

    // Copy mode: mirror-with-delete unless the profile opted out.
    if options.no_mirror {
        args.push("/E".to_string());
    } else {
        args.push("/MIR".to_string());
    }

    // Profile switches, minus anything the orchestrator manages itself.
    for switch in &options.switches {
        let trimmed = switch.trim();
        if trimmed.is_empty() {
            continue;
        }
        if safety::is_managed_switch(trimmed) {
            warn!(switch = %trimmed, "stripping orchestrator-managed switch from profile options");
            continue;
        }
        if !safety::validate_arg(trimmed) {
            warn!(switch = %trimmed, "dropping unsafe profile switch");
            continue;
        }
        args.push(trimmed.to_string());
    }

    // Managed switches.
    args.push(format!("/MT:{}", ctx.threads_per_job));
    args.push("/J".to_string());
    args.push(format!("/R:{}", options.retry_count));
    args.push(format!("/W:{}", options.retry_wait_secs));
    args.push(format!("/LOG:{}", quote_path(&ctx.log_path)));
    args.push("/TEE".to_string());
    args.push("/NDL".to_string());
    args.push("/BYTES".to_string());

    if options.skip_junctions {
        args.push("/XJD".to_string());
        args.push("/XJF".to_string());
    }

    if ctx.ipg_ms > 0 {
        args.push(format!("/IPG:{}", ctx.ipg_ms));
    }

    let exclude_files =
        safety::sanitize_exclude_patterns(&options.exclude_files, safety::ExcludeKind::Files);
    if !exclude_files.is_empty() {
        args.push("/XF".to_string());
        args.extend(exclude_files);
    }

    let exclude_dirs =
        safety::sanitize_exclude_patterns(&options.exclude_dirs, safety::ExcludeKind::Directories);
    if !exclude_dirs.is_empty() {
        args.push("/XD".to_string());
        args.extend(exclude_dirs);
    }

    args.extend(safety::sanitize_chunk_args(&chunk.extra_args));

    if ctx.dry_run {
        args.push("/L".to_string());
    }

    Ok(args)
}
