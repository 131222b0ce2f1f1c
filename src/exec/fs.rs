//! Filesystem executors: stat, read, list, tree, constrained command run.

use std::time::Duration;

use tracing::debug;

use crate::error::{Result, ScoutError};
use crate::inventory::HostRecord;
use crate::validate::{shell_quote, validate_command, validate_depth, validate_path};

use super::{clamp_to_budget, normalize, piped, CommandRunner};

/// What `stat` said a path is. Anything that is neither a directory nor
/// missing (symlink, device, fifo, ...) counts as a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    File,
    Directory,
    Missing,
}

/// Slack added on top of the shell-level `timeout` so the scheduler
/// deadline only fires when the transport itself has stalled.
const DEADLINE_SLACK: Duration = Duration::from_secs(5);

pub(crate) fn stat_cmd(path: &str) -> String {
    format!("stat -c '%F' {} 2>/dev/null", shell_quote(path))
}

pub(crate) fn cat_cmd(path: &str, max_bytes: usize) -> String {
    // one byte beyond the budget, so "exactly max_bytes" and "cut" are
    // distinguishable
    format!("head -c {} {}", max_bytes + 1, shell_quote(path))
}

pub(crate) fn ls_cmd(path: &str, budget: usize) -> String {
    piped(&format!("ls -la {}", shell_quote(path)), budget + 1)
}

pub(crate) fn tree_cmd(path: &str, depth: u32, budget: usize) -> String {
    piped(
        &format!("tree -L {depth} --noreport {}", shell_quote(path)),
        budget + 1,
    )
}

pub(crate) fn tree_fallback_cmd(path: &str, depth: u32) -> String {
    format!(
        "find {} -maxdepth {depth} \\( -type f -o -type d \\) | head -100",
        shell_quote(path)
    )
}

pub(crate) fn run_cmd(
    working_dir: &str,
    program: &str,
    args: &[String],
    timeout_secs: u64,
    budget: usize,
) -> String {
    let mut payload = format!(
        "cd {} && timeout {timeout_secs} {}",
        shell_quote(working_dir),
        shell_quote(program)
    );
    for arg in args {
        payload.push(' ');
        payload.push_str(&shell_quote(arg));
    }
    piped(&payload, budget + 1)
}

pub async fn stat_path(
    runner: &dyn CommandRunner,
    host: &HostRecord,
    path: &str,
) -> Result<PathKind> {
    let path = validate_path(path)?;
    let out = normalize(runner.run(host, &stat_cmd(&path)).await?);
    if out.exit_code != 0 {
        return Ok(PathKind::Missing);
    }
    Ok(match out.stdout.trim() {
        "directory" => PathKind::Directory,
        _ => PathKind::File,
    })
}

/// Read up to `max_bytes` of a file. The flag reports whether the
/// content was cut, strictly: a file of exactly `max_bytes` is not
/// truncated, and the returned text never exceeds the bound.
pub async fn cat_file(
    runner: &dyn CommandRunner,
    host: &HostRecord,
    path: &str,
    max_bytes: usize,
) -> Result<(String, bool)> {
    let path = validate_path(path)?;
    let out = normalize(runner.run(host, &cat_cmd(&path, max_bytes)).await?);
    if out.exit_code != 0 {
        return Err(ScoutError::Remote {
            host: host.name.clone(),
            stderr: out.stderr,
            exit_code: out.exit_code,
        });
    }
    Ok(clamp_to_budget(out.stdout, max_bytes))
}

pub async fn ls_dir(
    runner: &dyn CommandRunner,
    host: &HostRecord,
    path: &str,
    budget: usize,
) -> Result<(String, bool)> {
    let path = validate_path(path)?;
    let out = normalize(runner.run(host, &ls_cmd(&path, budget)).await?);
    if out.exit_code != 0 {
        return Err(ScoutError::Remote {
            host: host.name.clone(),
            stderr: out.stderr,
            exit_code: out.exit_code,
        });
    }
    Ok(clamp_to_budget(out.stdout, budget))
}

/// Directory tree, `tree` when installed, `find` otherwise. Degrades
/// instead of failing.
pub async fn tree_dir(
    runner: &dyn CommandRunner,
    host: &HostRecord,
    path: &str,
    depth: u32,
    budget: usize,
) -> Result<String> {
    let depth = validate_depth(i64::from(depth))?;
    let path = validate_path(path)?;
    let out = normalize(runner.run(host, &tree_cmd(&path, depth, budget)).await?);
    if out.exit_code == 0 {
        let (text, _) = clamp_to_budget(out.stdout, budget);
        return Ok(text);
    }
    debug!(host = %host.name, "tree unavailable, falling back to find");
    let fallback = normalize(runner.run(host, &tree_fallback_cmd(&path, depth)).await?);
    Ok(fallback.stdout)
}

/// Output of [`run_command`], with the server-side truncation flag.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: u32,
    pub truncated: bool,
}

/// Run an allowlisted caller command under `timeout`. Non-zero exits are
/// part of the result, never an error; a shell-level timeout surfaces as
/// exit code 124.
pub async fn run_command(
    runner: &dyn CommandRunner,
    host: &HostRecord,
    working_dir: &str,
    command: &str,
    timeout_secs: u64,
    budget: usize,
) -> Result<RunResult> {
    let working_dir = validate_path(working_dir)?;
    let spec = validate_command(command)?;
    let line = run_cmd(&working_dir, &spec.program, &spec.args, timeout_secs, budget);

    let deadline = Duration::from_secs(timeout_secs) + DEADLINE_SLACK;
    let raw = match tokio::time::timeout(deadline, runner.run(host, &line)).await {
        Ok(result) => result?,
        Err(_) => {
            // The shell-level timeout should have fired first; if it did
            // not, the transport is stalled. Callers still observe the
            // timeout convention.
            debug!(host = %host.name, "run_command scheduler deadline fired");
            return Ok(RunResult {
                stdout: String::new(),
                stderr: "command deadline exceeded".to_string(),
                exit_code: 124,
                truncated: false,
            });
        }
    };
    let out = normalize(raw);
    let (stdout, truncated) = clamp_to_budget(out.stdout, budget);
    Ok(RunResult {
        stdout,
        stderr: out.stderr,
        exit_code: out.exit_code,
        truncated,
    })
}
