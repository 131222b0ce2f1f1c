//! Host-to-host file transfer over two SFTP channels.
//!
//! The file streams through this process in fixed-size chunks; nothing
//! is staged on disk on the mediating host.

use russh_sftp::protocol::OpenFlags;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::error::{Result, ScoutError};
use crate::pool::SshSession;
use crate::validate::validate_path;

pub const CHUNK_SIZE: usize = 64 * 1024;

/// Copy `source_path` on the source session's host to `target_path` on
/// the target session's host. Returns the number of bytes copied.
pub async fn transfer_file(
    source: &SshSession,
    source_path: &str,
    target: &SshSession,
    target_path: &str,
) -> Result<u64> {
    let source_path = validate_path(source_path)?;
    let target_path = validate_path(target_path)?;

    let src_sftp = source.sftp().await?;
    let dst_sftp = target.sftp().await?;

    if src_sftp.metadata(&source_path).await.is_err() {
        return Err(ScoutError::PathNotFound {
            host: source.host().to_string(),
            path: source_path,
        });
    }

    let mut src = src_sftp
        .open_with_flags(&source_path, OpenFlags::READ)
        .await
        .map_err(|e| ScoutError::Transfer {
            bytes_written: 0,
            reason: format!("cannot open {source_path} on '{}': {e}", source.host()),
        })?;
    let mut dst = dst_sftp
        .open_with_flags(
            &target_path,
            OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
        )
        .await
        .map_err(|e| ScoutError::Transfer {
            bytes_written: 0,
            reason: format!("cannot open {target_path} on '{}': {e}", target.host()),
        })?;

    let mut written: u64 = 0;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = src.read(&mut buf).await.map_err(|e| ScoutError::Transfer {
            bytes_written: written,
            reason: format!("read from '{}' failed: {e}", source.host()),
        })?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n])
            .await
            .map_err(|e| ScoutError::Transfer {
                bytes_written: written,
                reason: format!("write to '{}' failed: {e}", target.host()),
            })?;
        written += n as u64;
        debug!(written, "transfer progress");
    }
    dst.shutdown().await.map_err(|e| ScoutError::Transfer {
        bytes_written: written,
        reason: format!("finalizing write on '{}' failed: {e}", target.host()),
    })?;

    info!(
        source = %source.host(),
        target = %target.host(),
        bytes = written,
        "transfer complete"
    );
    Ok(written)
}
