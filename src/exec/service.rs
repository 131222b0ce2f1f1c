//! Service-state executors: containers, compose stacks, ZFS, system logs.
//!
//! These all share one failure posture: the subsystem being absent on a
//! host is ordinary (a host without Docker reports no containers), so
//! nothing here throws for a non-zero exit. Transport failures still
//! propagate.

use tracing::debug;

use crate::error::Result;
use crate::inventory::HostRecord;
use crate::validate::{
    shell_quote, validate_container_name, validate_line_count, validate_project_name,
};

use super::{clamp_to_budget, normalize, piped, CommandRunner};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub name: String,
    pub status: String,
    pub image: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZpoolInfo {
    pub name: String,
    pub size: String,
    pub alloc: String,
    pub free: String,
    pub health: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetInfo {
    pub name: String,
    pub used: String,
    pub avail: String,
    pub refer: String,
    pub mountpoint: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub name: String,
    pub creation: String,
    pub used: String,
}

pub(crate) fn docker_ps_cmd(budget: usize) -> String {
    piped(
        "docker ps --format '{{.Names}}\\t{{.Status}}\\t{{.Image}}' 2>/dev/null",
        budget + 1,
    )
}

pub(crate) fn docker_logs_cmd(container: &str, tail: u32, budget: usize) -> String {
    piped(
        &format!(
            "docker logs --tail {tail} --timestamps {} 2>&1",
            shell_quote(container)
        ),
        budget + 1,
    )
}

pub(crate) fn compose_logs_cmd(project: &str, tail: u32, budget: usize) -> String {
    piped(
        &format!(
            "docker compose -p {} logs --tail {tail} --no-color 2>&1",
            shell_quote(project)
        ),
        budget + 1,
    )
}

pub(crate) fn zpool_list_cmd(budget: usize) -> String {
    piped(
        "zpool list -Hp -o name,size,alloc,free,health 2>/dev/null",
        budget + 1,
    )
}

pub(crate) fn zfs_datasets_cmd(pool: &str, budget: usize) -> String {
    piped(
        &format!(
            "zfs list -Hp -r {} -o name,used,avail,refer,mountpoint 2>/dev/null",
            shell_quote(pool)
        ),
        budget + 1,
    )
}

pub(crate) fn zfs_snapshots_cmd(pool: Option<&str>, budget: usize) -> String {
    let scope = match pool {
        Some(p) => format!(" -r {}", shell_quote(p)),
        None => String::new(),
    };
    piped(
        &format!("zfs list -t snapshot -Hp -o name,creation,used{scope} 2>/dev/null"),
        budget + 1,
    )
}

pub(crate) fn journal_cmd(lines: u32, budget: usize) -> String {
    piped(&format!("journalctl -n {lines} --no-pager 2>&1"), budget + 1)
}

pub(crate) fn syslog_fallback_cmd(lines: u32, budget: usize) -> String {
    piped(&format!("tail -n {lines} /var/log/syslog 2>&1"), budget + 1)
}

fn split_tabs(line: &str, want: usize) -> Option<Vec<&str>> {
    let fields: Vec<&str> = line.split('\t').collect();
    (fields.len() >= want).then_some(fields)
}

pub(crate) fn parse_containers(text: &str) -> Vec<ContainerInfo> {
    text.lines()
        .filter_map(|line| {
            let f = split_tabs(line, 3)?;
            Some(ContainerInfo {
                name: f[0].to_string(),
                status: f[1].to_string(),
                image: f[2].to_string(),
            })
        })
        .collect()
}

pub(crate) fn parse_zpools(text: &str) -> Vec<ZpoolInfo> {
    text.lines()
        .filter_map(|line| {
            let f = split_tabs(line, 5)?;
            Some(ZpoolInfo {
                name: f[0].to_string(),
                size: f[1].to_string(),
                alloc: f[2].to_string(),
                free: f[3].to_string(),
                health: f[4].to_string(),
            })
        })
        .collect()
}

pub(crate) fn parse_datasets(text: &str) -> Vec<DatasetInfo> {
    text.lines()
        .filter_map(|line| {
            let f = split_tabs(line, 5)?;
            Some(DatasetInfo {
                name: f[0].to_string(),
                used: f[1].to_string(),
                avail: f[2].to_string(),
                refer: f[3].to_string(),
                mountpoint: f[4].to_string(),
            })
        })
        .collect()
}

pub(crate) fn parse_snapshots(text: &str) -> Vec<SnapshotInfo> {
    text.lines()
        .filter_map(|line| {
            let f = split_tabs(line, 3)?;
            Some(SnapshotInfo {
                name: f[0].to_string(),
                creation: f[1].to_string(),
                used: f[2].to_string(),
            })
        })
        .collect()
}

/// Running containers. A host without Docker yields an empty list.
pub async fn docker_ps(
    runner: &dyn CommandRunner,
    host: &HostRecord,
    budget: usize,
) -> Result<Vec<ContainerInfo>> {
    let out = normalize(runner.run(host, &docker_ps_cmd(budget)).await?);
    if out.exit_code != 0 {
        debug!(host = %host.name, exit = out.exit_code, "docker unavailable");
        return Ok(Vec::new());
    }
    Ok(parse_containers(&out.stdout))
}

/// Container log tail. Errors from the docker CLI come back merged into
/// the text (the recipe folds stderr into stdout), not as exceptions.
pub async fn docker_logs(
    runner: &dyn CommandRunner,
    host: &HostRecord,
    container: &str,
    tail: i64,
    budget: usize,
) -> Result<(String, bool)> {
    let container = validate_container_name(container)?;
    let tail = validate_line_count(tail)?;
    let out = normalize(runner.run(host, &docker_logs_cmd(container, tail, budget)).await?);
    Ok(clamp_to_budget(out.stdout, budget))
}

pub async fn compose_logs(
    runner: &dyn CommandRunner,
    host: &HostRecord,
    project: &str,
    tail: i64,
    budget: usize,
) -> Result<(String, bool)> {
    let project = validate_project_name(project)?;
    let tail = validate_line_count(tail)?;
    let out = normalize(runner.run(host, &compose_logs_cmd(project, tail, budget)).await?);
    Ok(clamp_to_budget(out.stdout, budget))
}

pub async fn zpool_list(
    runner: &dyn CommandRunner,
    host: &HostRecord,
    budget: usize,
) -> Result<Vec<ZpoolInfo>> {
    let out = normalize(runner.run(host, &zpool_list_cmd(budget)).await?);
    if out.exit_code != 0 {
        debug!(host = %host.name, exit = out.exit_code, "zfs unavailable");
        return Ok(Vec::new());
    }
    Ok(parse_zpools(&out.stdout))
}

pub async fn zfs_datasets(
    runner: &dyn CommandRunner,
    host: &HostRecord,
    pool: &str,
    budget: usize,
) -> Result<Vec<DatasetInfo>> {
    let pool = validate_project_name(pool)?;
    let out = normalize(runner.run(host, &zfs_datasets_cmd(pool, budget)).await?);
    if out.exit_code != 0 {
        return Ok(Vec::new());
    }
    Ok(parse_datasets(&out.stdout))
}

pub async fn zfs_snapshots(
    runner: &dyn CommandRunner,
    host: &HostRecord,
    pool: Option<&str>,
    budget: usize,
) -> Result<Vec<SnapshotInfo>> {
    let pool = match pool {
        Some(p) => Some(validate_project_name(p)?),
        None => None,
    };
    let out = normalize(runner.run(host, &zfs_snapshots_cmd(pool, budget)).await?);
    if out.exit_code != 0 {
        return Ok(Vec::new());
    }
    Ok(parse_snapshots(&out.stdout))
}

/// System log tail: journalctl where available, /var/log/syslog
/// otherwise.
pub async fn journal_tail(
    runner: &dyn CommandRunner,
    host: &HostRecord,
    lines: i64,
    budget: usize,
) -> Result<(String, bool)> {
    let lines = validate_line_count(lines)?;
    let out = normalize(runner.run(host, &journal_cmd(lines, budget)).await?);
    if out.exit_code == 0 {
        return Ok(clamp_to_budget(out.stdout, budget));
    }
    debug!(host = %host.name, "journalctl unavailable, reading syslog");
    let fallback = normalize(runner.run(host, &syslog_fallback_cmd(lines, budget)).await?);
    Ok(clamp_to_budget(fallback.stdout, budget))
}
