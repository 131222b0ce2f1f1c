//! Input validation and shell quoting.
//!
//! Every string that originates from a caller and ends up inside a shell
//! command line must pass through one of these helpers first. Executors
//! never interpolate caller text directly.

use crate::error::{Result, ScoutError};

/// Commands the caller-supplied `query` parameter may invoke.
pub const COMMAND_ALLOWLIST: &[&str] = &[
    "grep", "rg", "find", "ls", "tree", "cat", "head", "tail", "wc", "sort", "uniq", "diff",
    "stat", "file", "du", "df",
];

const MAX_HOST_NAME_LEN: usize = 64;

/// A caller command after tokenization: the allowlisted program plus its
/// arguments, verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

pub fn validate_host_name(s: &str) -> Result<&str> {
    if s.is_empty() || s.len() > MAX_HOST_NAME_LEN {
        return Err(ScoutError::validation(format!(
            "host name must be 1..{MAX_HOST_NAME_LEN} characters"
        )));
    }
    if !s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(ScoutError::validation(format!(
            "host name '{s}' contains characters outside [A-Za-z0-9._-]"
        )));
    }
    Ok(s)
}

/// Vet a remote path and collapse duplicate slashes.
///
/// This is defense-in-depth, not canonicalization: the remote OS stays
/// the final authority, but traversal sequences and shell-relevant
/// characters are stopped at the boundary.
pub fn validate_path(s: &str) -> Result<String> {
    if s.is_empty() {
        return Err(ScoutError::validation("path must not be empty"));
    }
    if s.contains(['\0', '\r', '\n']) {
        return Err(ScoutError::validation("path contains control characters"));
    }
    if s.contains("..") {
        return Err(ScoutError::validation(format!(
            "path '{s}' contains a parent-directory sequence"
        )));
    }
    if let Some(bad) = s.chars().find(|c| matches!(c, '~' | '$' | '`' | '(' | ')')) {
        return Err(ScoutError::validation(format!(
            "path '{s}' contains forbidden character '{bad}'"
        )));
    }
    let mut out = String::with_capacity(s.len());
    let mut prev_slash = false;
    for c in s.chars() {
        if c == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        out.push(c);
    }
    Ok(out)
}

pub fn validate_container_name(s: &str) -> Result<&str> {
    if s.is_empty()
        || !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Err(ScoutError::validation(format!(
            "container name '{s}' must match [A-Za-z0-9_.-]+"
        )));
    }
    Ok(s)
}

pub fn validate_project_name(s: &str) -> Result<&str> {
    if s.is_empty()
        || !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
    {
        return Err(ScoutError::validation(format!(
            "project name '{s}' must match [A-Za-z0-9_-]+"
        )));
    }
    Ok(s)
}

pub fn validate_depth(n: i64) -> Result<u32> {
    if !(1..=10).contains(&n) {
        return Err(ScoutError::validation(format!(
            "depth must be between 1 and 10, got {n}"
        )));
    }
    Ok(n as u32)
}

/// Bound for tail/line counts on log reads.
pub fn validate_line_count(n: i64) -> Result<u32> {
    if !(1..=100_000).contains(&n) {
        return Err(ScoutError::validation(format!(
            "line count must be between 1 and 100000, got {n}"
        )));
    }
    Ok(n as u32)
}

/// Tokenize a caller command and check the program against the allowlist.
///
/// Arguments are preserved verbatim as argv words; they are individually
/// shell-quoted when the command line is built, so metacharacters inside
/// an argument are data, never syntax.
pub fn validate_command(s: &str) -> Result<CommandSpec> {
    let tokens = shlex::split(s).ok_or_else(|| {
        ScoutError::validation(format!("command '{s}' has unbalanced quoting"))
    })?;
    let mut iter = tokens.into_iter();
    let program = iter
        .next()
        .ok_or_else(|| ScoutError::validation("command must not be empty"))?;
    if !program
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(ScoutError::validation(format!(
            "command name '{program}' contains shell metacharacters"
        )));
    }
    if !COMMAND_ALLOWLIST.contains(&program.as_str()) {
        return Err(ScoutError::validation(format!(
            "command '{program}' is not allowed; permitted commands: {}",
            COMMAND_ALLOWLIST.join(", ")
        )));
    }
    Ok(CommandSpec {
        program,
        args: iter.collect(),
    })
}

/// Produce a single-quoted fragment safe against all shell interpretation.
/// Embedded single quotes become `'\''` per POSIX.
pub fn shell_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_names() {
        assert!(validate_host_name("web-01.prod").is_ok());
        assert!(validate_host_name("a").is_ok());
        assert!(validate_host_name("").is_err());
        assert!(validate_host_name("host name").is_err());
        assert!(validate_host_name("host;rm").is_err());
        assert!(validate_host_name(&"x".repeat(65)).is_err());
        assert!(validate_host_name(&"x".repeat(64)).is_ok());
    }

    #[test]
    fn paths() {
        assert_eq!(validate_path("/var/log").unwrap(), "/var/log");
        assert_eq!(validate_path("/var//log///x").unwrap(), "/var/log/x");
        assert!(validate_path("").is_err());
        assert!(validate_path("/etc/../shadow").is_err());
        assert!(validate_path("~/secrets").is_err());
        assert!(validate_path("/tmp/$(id)").is_err());
        assert!(validate_path("/tmp/`id`").is_err());
        assert!(validate_path("/tmp/a\nb").is_err());
        assert!(validate_path("/tmp/a\0b").is_err());
        // spaces and quotes are data, handled by quoting
        assert!(validate_path("/srv/my files/x'y").is_ok());
    }

    #[test]
    fn container_and_project_names() {
        assert!(validate_container_name("nginx-1.2").is_ok());
        assert!(validate_container_name("a b").is_err());
        assert!(validate_project_name("stack_prod").is_ok());
        assert!(validate_project_name("stack.prod").is_err());
    }

    #[test]
    fn depth_bounds() {
        assert!(validate_depth(0).is_err());
        assert!(validate_depth(11).is_err());
        assert_eq!(validate_depth(1).unwrap(), 1);
        assert_eq!(validate_depth(10).unwrap(), 10);
    }

    #[test]
    fn command_allowlist() {
        let spec = validate_command("grep -r TODO src").unwrap();
        assert_eq!(spec.program, "grep");
        assert_eq!(spec.args, vec!["-r", "TODO", "src"]);

        assert!(validate_command("rm -rf /").is_err());
        assert!(validate_command("").is_err());
        assert!(validate_command("   ").is_err());
    }

    #[test]
    fn command_metacharacters_in_arguments_are_data() {
        // A ';' inside a quoted argument is a grep pattern, not a command
        // separator; it survives tokenization as a single argv word.
        let spec = validate_command("grep 'TODO; rm -rf /' f").unwrap();
        assert_eq!(spec.args[0], "TODO; rm -rf /");
    }

    #[test]
    fn command_name_metacharacters_rejected() {
        assert!(validate_command("grep;id x").is_err());
        assert!(validate_command("$(id) x").is_err());
    }

    #[test]
    fn unbalanced_quoting_rejected() {
        assert!(validate_command("grep 'unterminated").is_err());
    }

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("a'b"), "'a'\\''b'");
        assert_eq!(shell_quote("$(id); rm -rf /"), "'$(id); rm -rf /'");
        assert_eq!(shell_quote(""), "''");
    }
}
