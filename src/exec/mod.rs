//! Executors: stateless async operations that run one shell recipe on a
//! pooled session and normalize its output.
//!
//! Shell commands are assembled from constants and [`shell_quote`]d
//! caller values only. Recipes whose output is bounded with a trailing
//! `head -c` print the payload's exit status to stderr behind a marker,
//! because the shell otherwise reports `head`'s status instead of the
//! command's; [`normalize`] strips the marker back out.
//!
//! [`shell_quote`]: crate::validate::shell_quote

pub mod fs;
pub mod service;
pub mod transfer;

use async_trait::async_trait;

use crate::error::Result;
use crate::inventory::HostRecord;

/// Client-side cap on captured stderr. Stdout is bounded by the recipes
/// themselves.
pub const MAX_STDERR_BYTES: usize = 1_048_576;

const EXIT_MARKER: &str = "__fleetscout_exit:";

/// Undecoded output of one remote command. `exit_code` is the status the
/// transport reported, which for piped recipes is the tail of the
/// pipeline, not the payload.
#[derive(Debug, Default)]
pub struct RawOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<u32>,
}

/// Decoded, marker-stripped result. This is the only form in which
/// remote bytes leave the executor layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: u32,
}

/// Seam between executors and the session pool: run one command line on
/// one host, one borrow per call. The pooled implementation lives with
/// the dispatcher, which also owns the connection-retry protocol.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, host: &HostRecord, command: &str) -> Result<RawOutput>;
}

/// Lossy UTF-8 decoding: invalid sequences become U+FFFD, never silently
/// dropped.
pub fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Wrap a payload so its exit status survives the `head -c` bound:
/// the status is printed to stderr (not piped) once the payload exits.
pub(crate) fn piped(payload: &str, budget: usize) -> String {
    format!("{{ {payload}; printf '\\n{EXIT_MARKER}%d\\n' \"$?\" >&2; }} | head -c {budget}")
}

/// Split the exit marker off decoded stderr. Returns the remaining
/// stderr text and the payload's status, if the marker was present.
pub(crate) fn split_exit_marker(stderr: String) -> (String, Option<u32>) {
    let Some(pos) = stderr.rfind(EXIT_MARKER) else {
        return (stderr, None);
    };
    let after = &stderr[pos + EXIT_MARKER.len()..];
    let code: Option<u32> = after.trim().parse().ok();
    let mut rest = stderr[..pos].to_string();
    // drop the newline the marker printf added
    if rest.ends_with('\n') {
        rest.pop();
    }
    (rest, code)
}

/// Decode and strip the marker. The marker's status wins over the
/// transport's; absent both, exit code 0 is assumed.
pub fn normalize(raw: RawOutput) -> CommandOutput {
    let stdout = decode(&raw.stdout);
    let (stderr, marker) = split_exit_marker(decode(&raw.stderr));
    CommandOutput {
        stdout,
        stderr,
        exit_code: marker.or(raw.exit_code).unwrap_or(0),
    }
}

/// Clamp text fetched with a `budget + 1` byte bound back to the
/// budget. The flag is strictly greater-than, so content of exactly
/// `budget` bytes is returned whole and not reported as cut; anything
/// larger is trimmed to at most `budget` bytes on a char boundary
/// before it leaves the executor layer.
pub fn clamp_to_budget(mut text: String, budget: usize) -> (String, bool) {
    if text.len() <= budget {
        return (text, false);
    }
    let mut cut = budget;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    (text, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_replaces_invalid_sequences() {
        assert_eq!(decode(b"ok"), "ok");
        let decoded = decode(&[0x66, 0x80, 0x6f]);
        assert!(decoded.contains('\u{FFFD}'));
        assert!(decoded.starts_with('f'));
        assert!(decoded.ends_with('o'));
    }

    #[test]
    fn ascii_round_trips() {
        let text = decode(b"total 4\n-rw-r--r-- 1 root root 6 x\n");
        assert_eq!(text.as_bytes(), b"total 4\n-rw-r--r-- 1 root root 6 x\n");
    }

    #[test]
    fn marker_is_split_off() {
        let (rest, code) =
            split_exit_marker("warning: x\n__fleetscout_exit:124\n".to_string());
        assert_eq!(rest, "warning: x");
        assert_eq!(code, Some(124));
    }

    #[test]
    fn missing_marker_passes_through() {
        let (rest, code) = split_exit_marker("plain stderr".to_string());
        assert_eq!(rest, "plain stderr");
        assert_eq!(code, None);
    }

    #[test]
    fn normalize_prefers_marker_status() {
        let raw = RawOutput {
            stdout: b"out".to_vec(),
            stderr: b"\n__fleetscout_exit:2\n".to_vec(),
            exit_code: Some(0), // head's status
        };
        let out = normalize(raw);
        assert_eq!(out.exit_code, 2);
        assert_eq!(out.stderr, "");
        assert_eq!(out.stdout, "out");
    }

    #[test]
    fn piped_recipe_shape() {
        let cmd = piped("ls -la '/var/log'", 1001);
        assert!(cmd.starts_with("{ ls -la '/var/log'; printf"));
        assert!(cmd.ends_with("| head -c 1001"));
        assert!(cmd.contains(">&2"));
    }

    #[test]
    fn budget_boundary_is_strict() {
        let (text, truncated) = clamp_to_budget("x".repeat(100), 100);
        assert!(!truncated);
        assert_eq!(text.len(), 100);

        let (text, truncated) = clamp_to_budget("x".repeat(101), 100);
        assert!(truncated);
        assert_eq!(text.len(), 100);
    }

    #[test]
    fn clamp_lands_on_a_char_boundary() {
        // 3 bytes per char; a 10-byte budget falls mid-character and
        // must back up to 9 rather than split the sequence.
        let (text, truncated) = clamp_to_budget("\u{20AC}".repeat(4), 10);
        assert!(truncated);
        assert_eq!(text.len(), 9);
        assert_eq!(text, "\u{20AC}".repeat(3));
    }
}
