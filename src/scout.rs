//! The scout operation: parse a target, resolve the host, route to the
//! right executor, format the result.
//!
//! Two entry families share this core. The tool entry returns plain
//! text and folds typed errors into error strings; the resource entry
//! (`<scheme>://<host>/<sub-path>`) propagates typed errors to the
//! pipeline. The variant is a property of the entry point, not of the
//! executors.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::config::Config;
use crate::error::{Result, ScoutError};
use crate::exec::fs::{cat_file, ls_dir, run_command, stat_path, tree_dir, PathKind, RunResult};
use crate::exec::service::{
    compose_logs, docker_logs, docker_ps, journal_tail, zfs_datasets, zfs_snapshots, zpool_list,
    ContainerInfo, DatasetInfo, SnapshotInfo, ZpoolInfo,
};
use crate::exec::transfer::transfer_file;
use crate::exec::{CommandRunner, RawOutput};
use crate::inventory::{HostInventory, HostRecord};
use crate::pool::SshPool;
use crate::probe::{probe_hosts, PROBE_TIMEOUT};
use crate::validate::{validate_host_name, validate_path};

/// Tree depth used when a directory is inspected with `tree=true`.
const DEFAULT_TREE_DEPTH: u32 = 3;
/// Log tail length when a resource URI does not say otherwise.
const DEFAULT_TAIL: i64 = 100;

// ====================================================================
// Target parsing
// ====================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// The sentinel target `"hosts"`.
    Hosts,
    Path { host: String, path: String },
}

pub fn parse_target(s: &str) -> Result<Target> {
    let trimmed = s.trim();
    if trimmed.eq_ignore_ascii_case("hosts") {
        return Ok(Target::Hosts);
    }
    let (host, path) = trimmed.split_once(':').ok_or_else(|| {
        ScoutError::validation(format!(
            "target '{trimmed}' must be 'hosts' or '<host>:<path>'"
        ))
    })?;
    if host.is_empty() || path.is_empty() {
        return Err(ScoutError::validation(format!(
            "target '{trimmed}' must name both a host and a path"
        )));
    }
    validate_host_name(host)?;
    let path = validate_path(path)?;
    Ok(Target::Path {
        host: host.to_string(),
        path,
    })
}

/// Parameters of the scout operation.
#[derive(Debug, Clone, Deserialize)]
pub struct ScoutParams {
    pub target: String,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub tree: bool,
    #[serde(default)]
    pub max_bytes: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferReport {
    pub source: String,
    pub target: String,
    pub bytes_copied: u64,
}

// ====================================================================
// Pooled runner with the connection-retry protocol
// ====================================================================

/// Runs commands through the pool, one borrow per command. A transport
/// failure is retried exactly once after evicting the host's pooled
/// session; every other error propagates untouched.
struct PoolRunner {
    pool: Arc<SshPool>,
}

impl PoolRunner {
    async fn attempt(&self, host: &HostRecord, command: &str) -> Result<RawOutput> {
        let session = self.pool.get(host).await?;
        session.exec(command).await
    }
}

#[async_trait]
impl CommandRunner for PoolRunner {
    async fn run(&self, host: &HostRecord, command: &str) -> Result<RawOutput> {
        match self.attempt(host, command).await {
            Err(e) if e.is_connection() => {
                debug!(host = %host.name, err = %e, "transport error, evicting and retrying once");
                self.pool.evict(&host.name).await;
                self.attempt(host, command).await
            }
            other => other,
        }
    }
}

// ====================================================================
// Dispatcher
// ====================================================================

pub struct Scout {
    cfg: Arc<Config>,
    inventory: Arc<dyn HostInventory>,
    runner: Arc<dyn CommandRunner>,
    pool: Option<Arc<SshPool>>,
}

impl Scout {
    /// Wire the dispatcher to a live pool.
    pub fn with_pool(
        cfg: Arc<Config>,
        inventory: Arc<dyn HostInventory>,
        pool: Arc<SshPool>,
    ) -> Self {
        Self {
            cfg,
            inventory,
            runner: Arc::new(PoolRunner {
                pool: Arc::clone(&pool),
            }),
            pool: Some(pool),
        }
    }

    /// Wire the dispatcher to an arbitrary runner. Transfers are
    /// unavailable without a pool.
    pub fn new(
        cfg: Arc<Config>,
        inventory: Arc<dyn HostInventory>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            cfg,
            inventory,
            runner,
            pool: None,
        }
    }

    // ---- tool entry --------------------------------------------------

    /// Tool-style entry: always returns text; typed errors become error
    /// strings that preserve kind and reason.
    pub async fn scout(&self, params: ScoutParams) -> String {
        match self.scout_core(&params).await {
            Ok(text) => text,
            Err(e) => format!("Error ({}): {e}", e.kind()),
        }
    }

    // ---- resource entry ----------------------------------------------

    /// Resource-style entry: `<scheme>://<host>/<sub-path>`. Errors are
    /// thrown, not stringified.
    pub async fn read_resource(&self, uri: &str) -> Result<String> {
        let url = Url::parse(uri)
            .map_err(|e| ScoutError::validation(format!("invalid resource uri '{uri}': {e}")))?;
        let budget = self.cfg.max_output_bytes;
        match url.scheme() {
            "hosts" => self.list_hosts().await,
            "file" => {
                let host = self.resolve(host_of(&url)?).await?;
                let path = url.path();
                if path.is_empty() || path == "/" {
                    return Err(ScoutError::validation(
                        "file resource uri must include a path",
                    ));
                }
                self.inspect_path(&host, path, false, self.cfg.max_file_bytes)
                    .await
            }
            "docker" => {
                let host = self.resolve(host_of(&url)?).await?;
                match sub_path(&url) {
                    None => {
                        let containers = docker_ps(self.runner.as_ref(), &host, budget).await?;
                        Ok(format_containers(&containers))
                    }
                    Some(container) => {
                        let tail = query_int(&url, "tail").unwrap_or(DEFAULT_TAIL);
                        let (text, truncated) =
                            docker_logs(self.runner.as_ref(), &host, container, tail, budget)
                                .await?;
                        Ok(with_notice(text, truncated, budget))
                    }
                }
            }
            "compose" => {
                let host = self.resolve(host_of(&url)?).await?;
                let project = sub_path(&url).ok_or_else(|| {
                    ScoutError::validation("compose resource uri must name a project")
                })?;
                let tail = query_int(&url, "tail").unwrap_or(DEFAULT_TAIL);
                let (text, truncated) =
                    compose_logs(self.runner.as_ref(), &host, project, tail, budget).await?;
                Ok(with_notice(text, truncated, budget))
            }
            "zfs" => {
                let host = self.resolve(host_of(&url)?).await?;
                match sub_path(&url) {
                    None => {
                        let pools = zpool_list(self.runner.as_ref(), &host, budget).await?;
                        Ok(format_zpools(&pools))
                    }
                    Some(pool) => {
                        let datasets =
                            zfs_datasets(self.runner.as_ref(), &host, pool, budget).await?;
                        let snapshots =
                            zfs_snapshots(self.runner.as_ref(), &host, Some(pool), budget).await?;
                        Ok(format_zfs_detail(pool, &datasets, &snapshots))
                    }
                }
            }
            "syslog" => {
                let host = self.resolve(host_of(&url)?).await?;
                let lines = query_int(&url, "lines").unwrap_or(DEFAULT_TAIL);
                let (text, truncated) =
                    journal_tail(self.runner.as_ref(), &host, lines, budget).await?;
                Ok(with_notice(text, truncated, budget))
            }
            other => Err(ScoutError::validation(format!(
                "unsupported resource scheme '{other}'"
            ))),
        }
    }

    // ---- transfer ----------------------------------------------------

    pub async fn transfer(&self, source: &str, target: &str) -> Result<TransferReport> {
        let pool = self.pool.as_ref().ok_or_else(|| {
            ScoutError::validation("transfer requires a live connection pool")
        })?;
        let (src_host, src_path) = parse_endpoint(source)?;
        let (dst_host, dst_path) = parse_endpoint(target)?;
        let src_record = self.resolve(&src_host).await?;
        let dst_record = self.resolve(&dst_host).await?;

        let src_session = pool.get(&src_record).await?;
        let dst_session = pool.get(&dst_record).await?;
        let bytes_copied =
            transfer_file(&src_session, &src_path, &dst_session, &dst_path).await?;
        Ok(TransferReport {
            source: source.to_string(),
            target: target.to_string(),
            bytes_copied,
        })
    }

    // ---- shared core -------------------------------------------------

    async fn scout_core(&self, params: &ScoutParams) -> Result<String> {
        match parse_target(&params.target)? {
            Target::Hosts => self.list_hosts().await,
            Target::Path { host, path } => {
                let record = self.resolve(&host).await?;
                match &params.query {
                    Some(query) => {
                        let result = run_command(
                            self.runner.as_ref(),
                            &record,
                            &path,
                            query,
                            self.cfg.command_timeout,
                            self.cfg.max_output_bytes,
                        )
                        .await?;
                        Ok(format_run_result(&result, self.cfg.max_output_bytes))
                    }
                    None => {
                        let max_bytes = params.max_bytes.unwrap_or(self.cfg.max_file_bytes);
                        self.inspect_path(&record, &path, params.tree, max_bytes)
                            .await
                    }
                }
            }
        }
    }

    async fn resolve(&self, name: &str) -> Result<Arc<HostRecord>> {
        match self.inventory.get_host(name).await {
            Some(record) => Ok(record),
            None => Err(ScoutError::UnknownHost {
                host: name.to_string(),
                available: self.inventory.get_hosts().await.into_keys().collect(),
            }),
        }
    }

    async fn list_hosts(&self) -> Result<String> {
        let hosts = self.inventory.get_hosts().await;
        if hosts.is_empty() {
            return Ok("no hosts configured\n".to_string());
        }
        let records: Vec<Arc<HostRecord>> = hosts.values().cloned().collect();
        let reachable = probe_hosts(&records, PROBE_TIMEOUT).await;
        let mut out = String::new();
        for (name, host) in &hosts {
            let state = if reachable.get(name).copied().unwrap_or(false) {
                "online"
            } else {
                "offline"
            };
            out.push_str(&format!(
                "{name}  {}:{} user={}  {state}\n",
                host.address, host.port, host.user
            ));
        }
        Ok(out)
    }

    async fn inspect_path(
        &self,
        host: &HostRecord,
        path: &str,
        tree: bool,
        max_bytes: usize,
    ) -> Result<String> {
        match stat_path(self.runner.as_ref(), host, path).await? {
            PathKind::Missing => Err(ScoutError::PathNotFound {
                host: host.name.clone(),
                path: path.to_string(),
            }),
            PathKind::File => {
                let (text, truncated) =
                    cat_file(self.runner.as_ref(), host, path, max_bytes).await?;
                Ok(with_notice(text, truncated, max_bytes))
            }
            PathKind::Directory if tree => {
                tree_dir(
                    self.runner.as_ref(),
                    host,
                    path,
                    DEFAULT_TREE_DEPTH,
                    self.cfg.max_output_bytes,
                )
                .await
            }
            PathKind::Directory => {
                let (text, truncated) =
                    ls_dir(self.runner.as_ref(), host, path, self.cfg.max_output_bytes).await?;
                Ok(with_notice(text, truncated, self.cfg.max_output_bytes))
            }
        }
    }
}

/// A transfer endpoint is the targeted form of a scout target.
fn parse_endpoint(s: &str) -> Result<(String, String)> {
    match parse_target(s)? {
        Target::Path { host, path } => Ok((host, path)),
        Target::Hosts => Err(ScoutError::validation(
            "transfer endpoints must be '<host>:<path>'",
        )),
    }
}

fn host_of(url: &Url) -> Result<&str> {
    url.host_str()
        .ok_or_else(|| ScoutError::validation("resource uri must name a host"))
}

fn sub_path(url: &Url) -> Option<&str> {
    let sub = url.path().trim_start_matches('/');
    (!sub.is_empty()).then_some(sub)
}

fn query_int(url: &Url, key: &str) -> Option<i64> {
    url.query_pairs()
        .find(|(k, _)| k == key)
        .and_then(|(_, v)| v.parse().ok())
}

// ====================================================================
// Formatting
// ====================================================================

fn truncation_notice(budget: usize) -> String {
    format!("\n[output truncated at {budget} bytes]")
}

fn with_notice(mut text: String, truncated: bool, budget: usize) -> String {
    if truncated {
        text.push_str(&truncation_notice(budget));
    }
    text
}

fn format_run_result(result: &RunResult, budget: usize) -> String {
    let mut out = result.stdout.clone();
    if result.truncated {
        out.push_str(&truncation_notice(budget));
    }
    if !result.stderr.is_empty() {
        out.push_str(&format!("\n[stderr]\n{}", result.stderr));
    }
    if result.exit_code != 0 {
        out.push_str(&format!("\n[exit code: {}]", result.exit_code));
    }
    out
}

fn format_containers(containers: &[ContainerInfo]) -> String {
    if containers.is_empty() {
        return "no containers running\n".to_string();
    }
    containers
        .iter()
        .map(|c| format!("{}  {}  {}\n", c.name, c.status, c.image))
        .collect()
}

fn format_zpools(pools: &[ZpoolInfo]) -> String {
    if pools.is_empty() {
        return "no zfs pools\n".to_string();
    }
    pools
        .iter()
        .map(|p| {
            format!(
                "{}  size={} alloc={} free={}  {}\n",
                p.name, p.size, p.alloc, p.free, p.health
            )
        })
        .collect()
}

fn format_zfs_detail(
    pool: &str,
    datasets: &[DatasetInfo],
    snapshots: &[SnapshotInfo],
) -> String {
    let mut out = format!("datasets in {pool}:\n");
    if datasets.is_empty() {
        out.push_str("  (none)\n");
    }
    for d in datasets {
        out.push_str(&format!(
            "  {}  used={} avail={} refer={}  {}\n",
            d.name, d.used, d.avail, d.refer, d.mountpoint
        ));
    }
    out.push_str("snapshots:\n");
    if snapshots.is_empty() {
        out.push_str("  (none)\n");
    }
    for s in snapshots {
        out.push_str(&format!(
            "  {}  created={} used={}\n",
            s.name, s.creation, s.used
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::StaticInventory;
    use std::sync::Mutex;

    fn record(name: &str, address: &str, port: u16) -> HostRecord {
        HostRecord {
            name: name.into(),
            address: address.into(),
            port,
            user: "ops".into(),
            identity_file: None,
        }
    }

    /// Routes each command line to a canned response by prefix match, in
    /// order, and remembers what ran.
    struct ScriptRunner {
        script: Vec<(&'static str, RawOutput)>,
        seen: Mutex<Vec<String>>,
    }

    impl ScriptRunner {
        fn new(script: Vec<(&'static str, RawOutput)>) -> Arc<Self> {
            Arc::new(Self {
                script,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptRunner {
        async fn run(&self, _host: &HostRecord, command: &str) -> Result<RawOutput> {
            self.seen.lock().unwrap().push(command.to_string());
            for (prefix, output) in &self.script {
                if command.starts_with(prefix) || command.contains(prefix) {
                    return Ok(RawOutput {
                        stdout: output.stdout.clone(),
                        stderr: output.stderr.clone(),
                        exit_code: output.exit_code,
                    });
                }
            }
            panic!("unscripted command: {command}");
        }
    }

    fn ok(stdout: &str) -> RawOutput {
        RawOutput {
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
            exit_code: Some(0),
        }
    }

    fn scout_with(script: Vec<(&'static str, RawOutput)>) -> Scout {
        let cfg = Arc::new(Config::default());
        let inventory = Arc::new(
            StaticInventory::new(vec![
                record("h1", "127.0.0.1", 22),
                record("h2", "127.0.0.1", 22),
            ])
            .unwrap(),
        );
        Scout::new(cfg, inventory, ScriptRunner::new(script))
    }

    #[test]
    fn target_parsing_round_trips() {
        assert_eq!(parse_target("hosts").unwrap(), Target::Hosts);
        assert_eq!(parse_target("HOSTS").unwrap(), Target::Hosts);
        assert_eq!(
            parse_target("h1:/etc/hostname").unwrap(),
            Target::Path {
                host: "h1".into(),
                path: "/etc/hostname".into()
            }
        );
        assert!(parse_target("h1:").is_err());
        assert!(parse_target(":/x").is_err());
        assert!(parse_target("just-a-host").is_err());
        assert!(parse_target("h1:/etc/../shadow").is_err());
        assert!(parse_target("bad host:/x").is_err());
    }

    #[tokio::test]
    async fn file_target_returns_exact_contents() {
        let scout = scout_with(vec![
            ("stat -c '%F'", ok("regular file\n")),
            ("head -c", ok("myhost\n")),
        ]);
        let result = scout
            .scout(ScoutParams {
                target: "h1:/etc/hostname".into(),
                query: None,
                tree: false,
                max_bytes: None,
            })
            .await;
        assert_eq!(result, "myhost\n");
    }

    #[tokio::test]
    async fn directory_target_lists() {
        let scout = scout_with(vec![
            ("stat -c '%F'", ok("directory\n")),
            ("{ ls -la", ok("total 0\n")),
        ]);
        let result = scout
            .scout(ScoutParams {
                target: "h1:/var/log".into(),
                query: None,
                tree: false,
                max_bytes: None,
            })
            .await;
        assert_eq!(result, "total 0\n");
    }

    #[tokio::test]
    async fn tree_flag_uses_depth_three() {
        let scout = scout_with(vec![
            ("stat -c '%F'", ok("directory\n")),
            ("{ tree -L 3", ok("/srv\n")),
        ]);
        let result = scout
            .scout(ScoutParams {
                target: "h1:/srv".into(),
                query: None,
                tree: true,
                max_bytes: None,
            })
            .await;
        assert_eq!(result, "/srv\n");
    }

    #[tokio::test]
    async fn query_with_clean_exit_has_no_exit_line() {
        let scout = scout_with(vec![("{ cd '/var/log'", ok("file1\nfile2\n"))]);
        let result = scout
            .scout(ScoutParams {
                target: "h1:/var/log".into(),
                query: Some("ls -la".into()),
                tree: false,
                max_bytes: None,
            })
            .await;
        assert!(result.contains("file1"));
        assert!(!result.contains("[exit code"));
        assert!(!result.contains("[stderr]"));
    }

    #[tokio::test]
    async fn query_failure_appends_stderr_and_exit_code() {
        let scout = scout_with(vec![(
            "{ cd '/var/log'",
            RawOutput {
                stdout: Vec::new(),
                stderr: b"grep: no such file\n__fleetscout_exit:2\n".to_vec(),
                exit_code: Some(0),
            },
        )]);
        let result = scout
            .scout(ScoutParams {
                target: "h1:/var/log".into(),
                query: Some("grep pattern missing-file".into()),
                tree: false,
                max_bytes: None,
            })
            .await;
        assert!(result.contains("[stderr]\ngrep: no such file"));
        assert!(result.contains("[exit code: 2]"));
    }

    #[tokio::test]
    async fn metacharacters_inside_quoted_arguments_run_as_data() {
        let scout = scout_with(vec![("{ cd '/var/log'", ok("match\n"))]);
        let result = scout
            .scout(ScoutParams {
                target: "h1:/var/log".into(),
                query: Some("grep 'TODO; rm -rf /' f".into()),
                tree: false,
                max_bytes: None,
            })
            .await;
        assert_eq!(result, "match\n");
    }

    #[tokio::test]
    async fn unknown_host_names_the_alternatives() {
        let scout = scout_with(vec![]);
        let result = scout
            .scout(ScoutParams {
                target: "unknown:/x".into(),
                query: None,
                tree: false,
                max_bytes: None,
            })
            .await;
        assert!(result.starts_with("Error (UnknownHost)"));
        assert!(result.contains("h1, h2"));
    }

    #[tokio::test]
    async fn missing_path_tool_vs_resource() {
        let script = vec![("stat -c '%F'", RawOutput {
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: Some(1),
        })];
        let scout = scout_with(script);

        let text = scout
            .scout(ScoutParams {
                target: "h1:/missing".into(),
                query: None,
                tree: false,
                max_bytes: None,
            })
            .await;
        assert!(text.contains("not found"));
        assert!(text.contains("/missing"));

        let err = scout.read_resource("file://h1/missing").await.unwrap_err();
        assert_eq!(err.kind(), "PathNotFound");
    }

    #[tokio::test]
    async fn truncated_file_carries_notice_and_stays_in_budget() {
        let body = "x".repeat(11);
        let scout = scout_with(vec![
            ("stat -c '%F'", ok("regular file\n")),
            ("head -c", ok(&body)),
        ]);
        let result = scout
            .scout(ScoutParams {
                target: "h1:/big".into(),
                query: None,
                tree: false,
                max_bytes: Some(10),
            })
            .await;
        let (payload, notice) = result
            .split_once('\n')
            .expect("notice is separated from the payload");
        assert_eq!(payload, "x".repeat(10));
        assert_eq!(notice, "[output truncated at 10 bytes]");
    }

    #[tokio::test]
    async fn docker_resource_lists_containers() {
        let scout = scout_with(vec![(
            "docker ps",
            ok("web\tUp 3 days\tnginx:1.27\n"),
        )]);
        let text = scout.read_resource("docker://h1").await.unwrap();
        assert!(text.contains("web  Up 3 days  nginx:1.27"));
    }

    #[tokio::test]
    async fn docker_resource_tails_container_logs() {
        let scout = scout_with(vec![("docker logs --tail 50", ok("log line\n"))]);
        let text = scout
            .read_resource("docker://h1/web?tail=50")
            .await
            .unwrap();
        assert_eq!(text, "log line\n");
    }

    #[tokio::test]
    async fn zfs_resource_reports_pools_and_detail() {
        let scout = scout_with(vec![
            ("zpool list", ok("tank\t100\t40\t60\tONLINE\n")),
            ("zfs list -Hp -r 'tank'", ok("tank/data\t1\t2\t3\t/srv\n")),
            ("zfs list -t snapshot", ok("tank/data@n\t1721900000\t4\n")),
        ]);
        let pools = scout.read_resource("zfs://h1").await.unwrap();
        assert!(pools.contains("tank"));
        assert!(pools.contains("ONLINE"));
        let detail = scout.read_resource("zfs://h1/tank").await.unwrap();
        assert!(detail.contains("tank/data"));
        assert!(detail.contains("tank/data@n"));
    }

    #[tokio::test]
    async fn unsupported_scheme_is_rejected() {
        let scout = scout_with(vec![]);
        let err = scout.read_resource("gopher://h1/x").await.unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
    }

    #[tokio::test]
    async fn transfer_requires_pool() {
        let scout = scout_with(vec![]);
        let err = scout.transfer("h1:/a", "h2:/b").await.unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
    }

    #[tokio::test]
    async fn hosts_listing_marks_reachability() {
        use tokio::net::TcpListener;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open_port = listener.local_addr().unwrap().port();
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed_port = probe.local_addr().unwrap().port();
        drop(probe);

        let cfg = Arc::new(Config::default());
        let inventory = Arc::new(
            StaticInventory::new(vec![
                record("up", "127.0.0.1", open_port),
                record("down", "127.0.0.1", closed_port),
            ])
            .unwrap(),
        );
        let scout = Scout::new(cfg, inventory, ScriptRunner::new(vec![]));
        let text = scout
            .scout(ScoutParams {
                target: "hosts".into(),
                query: None,
                tree: false,
                max_bytes: None,
            })
            .await;
        assert!(text.contains("up  127.0.0.1"));
        assert!(text.lines().any(|l| l.starts_with("up") && l.ends_with("online")));
        assert!(text.lines().any(|l| l.starts_with("down") && l.ends_with("offline")));
    }
}
