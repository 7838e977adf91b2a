//! Request validation collaborators: path safety and git URL trust.
//!
//! The full security pattern blocklist lives in the orchestrator; this module
//! is the in-container surface the router calls before touching the file
//! system or the network.

use std::path::{Component, Path, PathBuf};

use crate::error::ApiError;

/// Hosts the git checkout endpoint will clone from.
const GIT_HOST_WHITELIST: &[&str] = &["github.com", "gitlab.com", "bitbucket.org"];

/// Validate that a user-supplied path is absolute, has no `..` traversal, and
/// contains no null bytes.
pub fn validate_path(path: &str) -> Result<PathBuf, ApiError> {
    if path.is_empty() {
        return Err(ApiError::InvalidPath("Path must not be empty".to_string()));
    }
    let p = Path::new(path);
    if !p.is_absolute() {
        return Err(ApiError::InvalidPath("Path must be absolute".to_string()));
    }
    if path.contains('\0') {
        return Err(ApiError::PathSecurityViolation(
            "Path contains null bytes".to_string(),
        ));
    }
    for component in p.components() {
        if let Component::ParentDir = component {
            return Err(ApiError::PathSecurityViolation(
                "Path traversal (..) not allowed".to_string(),
            ));
        }
    }
    Ok(p.to_path_buf())
}

/// Validate a git repository URL: https (or git@ scp-like) against the host
/// whitelist, no shell metacharacters.
pub fn validate_git_url(url: &str) -> Result<(), ApiError> {
    if url.chars().any(|c| {
        matches!(
            c,
            ';' | '|' | '&' | '$' | '`' | '<' | '>' | '(' | ')' | '{' | '}' | '\n' | '\0' | ' '
        )
    }) {
        return Err(ApiError::GitUrlSecurityViolation(
            "Repository URL contains forbidden characters".to_string(),
        ));
    }

    let host = if let Some(rest) = url.strip_prefix("https://") {
        rest.split('/').next().unwrap_or_default()
    } else if let Some(rest) = url.strip_prefix("git@") {
        rest.split(':').next().unwrap_or_default()
    } else {
        return Err(ApiError::GitUrlSecurityViolation(
            "Only https:// and git@ repository URLs are accepted".to_string(),
        ));
    };

    if GIT_HOST_WHITELIST.contains(&host) {
        Ok(())
    } else {
        Err(ApiError::GitUrlSecurityViolation(format!(
            "Host {host:?} is not in the allowed list"
        )))
    }
}

/// Reject obviously malformed command strings (empty, NUL bytes). The pattern
/// blocklist proper is enforced upstream by the orchestrator.
pub fn validate_command(command: &str) -> Result<(), ApiError> {
    if command.trim().is_empty() {
        return Err(ApiError::InvalidCommand(
            "Command must not be empty".to_string(),
        ));
    }
    if command.contains('\0') {
        return Err(ApiError::CommandSecurityViolation(
            "Command contains null bytes".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_must_be_absolute() {
        assert!(validate_path("/tmp/ok").is_ok());
        assert!(matches!(
            validate_path("relative/path"),
            Err(ApiError::InvalidPath(_))
        ));
        assert!(matches!(validate_path(""), Err(ApiError::InvalidPath(_))));
    }

    #[test]
    fn path_traversal_rejected() {
        assert!(matches!(
            validate_path("/tmp/../etc/passwd"),
            Err(ApiError::PathSecurityViolation(_))
        ));
        assert!(matches!(
            validate_path("/tmp/bad\0name"),
            Err(ApiError::PathSecurityViolation(_))
        ));
    }

    #[test]
    fn git_whitelist() {
        assert!(validate_git_url("https://github.com/org/repo.git").is_ok());
        assert!(validate_git_url("git@gitlab.com:org/repo.git").is_ok());
        assert!(matches!(
            validate_git_url("https://evil.example.com/repo.git"),
            Err(ApiError::GitUrlSecurityViolation(_))
        ));
        assert!(matches!(
            validate_git_url("https://github.com/a; rm -rf /"),
            Err(ApiError::GitUrlSecurityViolation(_))
        ));
        assert!(matches!(
            validate_git_url("ftp://github.com/org/repo"),
            Err(ApiError::GitUrlSecurityViolation(_))
        ));
    }

    #[test]
    fn command_sanity() {
        assert!(validate_command("echo hello").is_ok());
        assert!(matches!(
            validate_command("   "),
            Err(ApiError::InvalidCommand(_))
        ));
        assert!(matches!(
            validate_command("echo \0"),
            Err(ApiError::CommandSecurityViolation(_))
        ));
    }
}
