//! Pooled SSH sessions.
//!
//! The pool owns every live session: at most one per host, at most
//! `max_pool_size` overall, least-recently-used evicted first. Borrows
//! of the same host serialize on a per-host mutex so concurrent
//! requests share one dial; borrows of different hosts never contend.
//! The map structure itself is guarded by a single "meta" mutex that is
//! only ever held for in-memory work.
//!
//! Lock order is per-host mutex first, meta mutex second, never the
//! reverse. Session close can block on network I/O and therefore always
//! happens outside both locks.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use russh::keys::PrivateKeyWithHashAlg;
use russh::ChannelMsg;
use russh_sftp::client::SftpSession;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, KnownHostsPolicy};
use crate::error::{Result, ScoutError};
use crate::exec::{RawOutput, MAX_STDERR_BYTES};
use crate::inventory::HostRecord;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

// ====================================================================
// Host key verification
// ====================================================================

struct HostKeyVerifier {
    address: String,
    port: u16,
    policy: KnownHostsPolicy,
}

impl russh::client::Handler for HostKeyVerifier {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        match &self.policy {
            KnownHostsPolicy::AcceptAny => {
                warn!(
                    address = %self.address,
                    "accepting unverified host key (known_hosts_path = \"none\")"
                );
                Ok(true)
            }
            KnownHostsPolicy::File(path) => {
                match russh::keys::check_known_hosts_path(
                    &self.address,
                    self.port,
                    server_public_key,
                    path,
                ) {
                    Ok(true) => Ok(true),
                    Ok(false) => {
                        warn!(
                            address = %self.address,
                            port = self.port,
                            "host key not present in known_hosts, rejecting"
                        );
                        Ok(false)
                    }
                    Err(e) => {
                        warn!(
                            address = %self.address,
                            port = self.port,
                            err = %e,
                            "host key verification failed"
                        );
                        Ok(false)
                    }
                }
            }
        }
    }
}

// ====================================================================
// Sessions
// ====================================================================

/// One live SSH session, owned by the pool and borrowed by executors
/// for the duration of a single remote call. Borrowers never close it.
pub struct SshSession {
    handle: russh::client::Handle<HostKeyVerifier>,
    host: String,
    created_at: Instant,
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("host", &self.host)
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl SshSession {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_open(&self) -> bool {
        !self.handle.is_closed()
    }

    /// Run one command line and collect its output. Stdout is bounded by
    /// the recipes; stderr is capped here.
    pub async fn exec(&self, command: &str) -> Result<RawOutput> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| ScoutError::connection(&self.host, format!("channel open failed: {e}")))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| ScoutError::connection(&self.host, format!("exec failed: {e}")))?;

        let mut out = RawOutput::default();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => out.stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                    let room = MAX_STDERR_BYTES.saturating_sub(out.stderr.len());
                    let take = room.min(data.len());
                    out.stderr.extend_from_slice(&data[..take]);
                }
                ChannelMsg::ExitStatus { exit_status } => out.exit_code = Some(exit_status),
                _ => {}
            }
        }
        Ok(out)
    }

    /// Open an SFTP channel on this session.
    pub async fn sftp(&self) -> Result<SftpSession> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| ScoutError::connection(&self.host, format!("channel open failed: {e}")))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| ScoutError::connection(&self.host, format!("sftp request failed: {e}")))?;
        SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| ScoutError::connection(&self.host, format!("sftp handshake failed: {e}")))
    }

    async fn close(&self) {
        let _ = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await;
    }
}

#[derive(Debug)]
struct PoolEntry {
    session: Arc<SshSession>,
    last_used: Instant,
}

#[derive(Debug)]
struct PoolMap {
    sessions: HashMap<String, PoolEntry>,
    // Grows with the set of distinct host names, which the inventory
    // bounds. Structural changes happen under the meta mutex; the locks
    // themselves serialize borrow/dial/evict per host.
    locks: HashMap<String, Arc<Mutex<()>>>,
}

/// A session is reaped when it has sat unused past the idle threshold
/// or outlived the optional hard lifetime cap.
fn expired(
    last_used: Instant,
    created_at: Instant,
    now: Instant,
    idle: Duration,
    max_lifetime: Option<Duration>,
) -> bool {
    if now.duration_since(last_used) > idle {
        return true;
    }
    matches!(max_lifetime, Some(limit) if now.duration_since(created_at) > limit)
}

fn oldest<K>(entries: impl Iterator<Item = (K, Instant)>) -> Option<K> {
    entries.min_by_key(|(_, t)| *t).map(|(k, _)| k)
}

#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub open_sessions: usize,
}

// ====================================================================
// Pool
// ====================================================================

#[derive(Debug)]
pub struct SshPool {
    max_pool_size: usize,
    idle_timeout: Duration,
    max_lifetime: Option<Duration>,
    connect_timeout: Duration,
    known_hosts: KnownHostsPolicy,
    meta: Mutex<PoolMap>,
    closing: CancellationToken,
}

impl SshPool {
    /// Build the pool and start its reaper. Fails when the host key
    /// policy is unset (fail closed).
    pub fn new(cfg: &Config) -> Result<Arc<Self>> {
        let known_hosts = cfg.known_hosts()?;
        if known_hosts == KnownHostsPolicy::AcceptAny {
            error!("SSH host key verification is DISABLED; any server key will be accepted");
        }
        let pool = Arc::new(Self {
            max_pool_size: cfg.max_pool_size.max(1),
            idle_timeout: cfg.idle_timeout(),
            max_lifetime: cfg.max_lifetime(),
            connect_timeout: cfg.connect_timeout(),
            known_hosts,
            meta: Mutex::new(PoolMap {
                sessions: HashMap::new(),
                locks: HashMap::new(),
            }),
            closing: CancellationToken::new(),
        });

        let weak = Arc::downgrade(&pool);
        let token = pool.closing.clone();
        let interval = (pool.idle_timeout / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(pool) = weak.upgrade() else { break };
                pool.reap().await;
            }
            debug!("pool reaper exited");
        });

        Ok(pool)
    }

    async fn host_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut meta = self.meta.lock().await;
        Arc::clone(meta.locks.entry(name.to_string()).or_default())
    }

    /// Borrow the session for `host`, dialing if necessary.
    ///
    /// Concurrent borrows of one host serialize here: the first dials,
    /// the rest reuse. The dial itself runs outside the meta mutex.
    pub async fn get(&self, host: &HostRecord) -> Result<Arc<SshSession>> {
        if self.closing.is_cancelled() {
            return Err(ScoutError::connection(&host.name, "pool is shut down"));
        }

        let lock = self.host_lock(&host.name).await;
        let _serialize = lock.lock().await;

        let mut reuse = None;
        let mut broken = None;
        {
            let mut meta = self.meta.lock().await;
            if let Some(entry) = meta.sessions.get_mut(&host.name) {
                if entry.session.is_open() {
                    entry.last_used = Instant::now();
                    reuse = Some(Arc::clone(&entry.session));
                }
            }
            if reuse.is_none() {
                broken = meta.sessions.remove(&host.name).map(|e| e.session);
            }
        }
        if let Some(session) = reuse {
            debug!(host = %host.name, "reusing pooled session");
            return Ok(session);
        }
        if let Some(session) = broken {
            debug!(host = %host.name, "discarding broken session");
            tokio::spawn(async move { session.close().await });
        }

        // Make room before the dial so the cap holds at insert time.
        let victims = {
            let mut meta = self.meta.lock().await;
            let mut victims = Vec::new();
            while meta.sessions.len() >= self.max_pool_size {
                let Some(name) =
                    oldest(meta.sessions.iter().map(|(k, e)| (k.clone(), e.last_used)))
                else {
                    break;
                };
                if let Some(entry) = meta.sessions.remove(&name) {
                    info!(host = %name, "evicting least-recently-used session");
                    victims.push(entry.session);
                }
            }
            victims
        };
        for session in victims {
            tokio::spawn(async move { session.close().await });
        }

        let session = Arc::new(self.dial(host).await?);
        {
            let mut meta = self.meta.lock().await;
            meta.sessions.insert(
                host.name.clone(),
                PoolEntry {
                    session: Arc::clone(&session),
                    last_used: Instant::now(),
                },
            );
        }
        Ok(session)
    }

    /// Drop and close the pooled session for `name`, if any. Used by the
    /// dispatcher's connection-retry protocol and by shutdown paths.
    pub async fn evict(&self, name: &str) {
        let lock = self.host_lock(name).await;
        let _serialize = lock.lock().await;
        let victim = {
            let mut meta = self.meta.lock().await;
            meta.sessions.remove(name).map(|e| e.session)
        };
        if let Some(session) = victim {
            info!(host = %name, "evicting session");
            session.close().await;
        }
    }

    async fn dial(&self, host: &HostRecord) -> Result<SshSession> {
        debug!(host = %host.name, address = %host.address, port = host.port, "dialing");
        let handshake = async {
            let config = Arc::new(russh::client::Config::default());
            let verifier = HostKeyVerifier {
                address: host.address.clone(),
                port: host.port,
                policy: self.known_hosts.clone(),
            };
            let mut handle =
                russh::client::connect(config, (host.address.as_str(), host.port), verifier)
                    .await
                    .map_err(|e| ScoutError::connection(&host.name, e))?;
            authenticate(&mut handle, host).await?;
            Ok::<_, ScoutError>(handle)
        };
        let handle = tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| {
                ScoutError::connection(
                    &host.name,
                    format!("dial timed out after {}s", self.connect_timeout.as_secs()),
                )
            })??;
        info!(host = %host.name, "ssh session established");
        Ok(SshSession {
            handle,
            host: host.name.clone(),
            created_at: Instant::now(),
        })
    }

    async fn reap(&self) {
        let now = Instant::now();
        let candidates: Vec<(String, Arc<Mutex<()>>)> = {
            let meta = self.meta.lock().await;
            meta.sessions
                .iter()
                .filter(|(_, e)| {
                    expired(
                        e.last_used,
                        e.session.created_at,
                        now,
                        self.idle_timeout,
                        self.max_lifetime,
                    )
                })
                .filter_map(|(name, _)| {
                    meta.locks
                        .get(name)
                        .map(|lock| (name.clone(), Arc::clone(lock)))
                })
                .collect()
        };
        for (name, lock) in candidates {
            // A held lock means a borrow is in flight; that session is
            // not idle, skip it.
            let Ok(_serialize) = lock.try_lock() else {
                continue;
            };
            let victim = {
                let mut meta = self.meta.lock().await;
                let still_expired = meta.sessions.get(&name).is_some_and(|e| {
                    expired(
                        e.last_used,
                        e.session.created_at,
                        Instant::now(),
                        self.idle_timeout,
                        self.max_lifetime,
                    )
                });
                if still_expired {
                    meta.sessions.remove(&name).map(|e| e.session)
                } else {
                    None
                }
            };
            if let Some(session) = victim {
                info!(host = %name, "reaping idle session");
                session.close().await;
            }
        }
    }

    pub async fn stats(&self) -> PoolStats {
        let meta = self.meta.lock().await;
        PoolStats {
            open_sessions: meta.sessions.len(),
        }
    }

    /// Stop accepting borrows, stop the reaper, close everything.
    pub async fn shutdown(&self) {
        self.closing.cancel();
        let sessions: Vec<Arc<SshSession>> = {
            let mut meta = self.meta.lock().await;
            meta.sessions.drain().map(|(_, e)| e.session).collect()
        };
        let count = sessions.len();
        let closes = sessions.into_iter().map(|s| async move { s.close().await });
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, futures::future::join_all(closes))
            .await
            .is_err()
        {
            warn!("timed out closing pooled sessions");
        }
        info!(closed = count, "connection pool shut down");
    }
}

async fn authenticate(
    handle: &mut russh::client::Handle<HostKeyVerifier>,
    host: &HostRecord,
) -> Result<()> {
    let key_path = match &host.identity_file {
        Some(path) => path.clone(),
        None => default_identity().ok_or_else(|| {
            ScoutError::connection(
                &host.name,
                "no identity_file configured and no default key under ~/.ssh",
            )
        })?,
    };
    let key = russh::keys::load_secret_key(&key_path, None).map_err(|e| {
        ScoutError::connection(
            &host.name,
            format!("cannot load identity {}: {e}", key_path.display()),
        )
    })?;
    let rsa_hash = handle
        .best_supported_rsa_hash()
        .await
        .map_err(|e| ScoutError::connection(&host.name, e))?
        .flatten();
    let outcome = handle
        .authenticate_publickey(
            &host.user,
            PrivateKeyWithHashAlg::new(Arc::new(key), rsa_hash),
        )
        .await
        .map_err(|e| ScoutError::connection(&host.name, e))?;
    if !outcome.success() {
        return Err(ScoutError::connection(
            &host.name,
            format!("public key authentication rejected for user '{}'", host.user),
        ));
    }
    Ok(())
}

fn default_identity() -> Option<PathBuf> {
    let home = std::env::var_os("HOME")?;
    for name in ["id_ed25519", "id_rsa"] {
        let path = PathBuf::from(&home).join(".ssh").join(name);
        if path.exists() {
            return Some(path);
        }
    }
    None
}
