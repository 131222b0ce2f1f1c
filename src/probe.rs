//! TCP-level reachability probe for host listings.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

use crate::inventory::HostRecord;

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Probe every endpoint concurrently. A host counts as online when a TCP
/// connection to its SSH port completes within the timeout; nothing is
/// written to the socket.
pub async fn probe_hosts(
    hosts: &[Arc<HostRecord>],
    timeout: Duration,
) -> BTreeMap<String, bool> {
    let checks = hosts.iter().map(|host| {
        let host = Arc::clone(host);
        async move {
            let online = tokio::time::timeout(
                timeout,
                TcpStream::connect((host.address.as_str(), host.port)),
            )
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);
            debug!(host = %host.name, online, "probe finished");
            (host.name.clone(), online)
        }
    });
    futures::future::join_all(checks).await.into_iter().collect()
}
