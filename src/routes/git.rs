//! Git checkout endpoint.
//!
//! `POST /api/git/checkout` clones a repository from a whitelisted host into
//! the workspace. The clone runs as a one-shot child with a hard timeout; it
//! never goes through a session shell.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::error::ApiError;
use crate::security::{validate_git_url, validate_path};
use crate::state::AppState;

/// Hard cap on clone time.
const CLONE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Deserialize)]
pub struct CheckoutRequest {
    #[serde(rename = "repoUrl")]
    pub repo_url: String,
    pub branch: Option<String>,
    #[serde(rename = "targetDir")]
    pub target_dir: Option<String>,
}

/// `POST /api/git/checkout`.
pub async fn checkout(
    State(state): State<AppState>,
    Json(payload): Json<CheckoutRequest>,
) -> Result<Json<Value>, ApiError> {
    validate_git_url(&payload.repo_url)?;

    let target = match payload.target_dir {
        Some(dir) => validate_path(&dir)?.to_string_lossy().into_owned(),
        None => {
            let name = repo_name(&payload.repo_url);
            let base = if Path::new(&state.config.shell.workspace_dir).is_dir() {
                state.config.shell.workspace_dir.clone()
            } else {
                std::env::var("HOME").unwrap_or_else(|_| "/".to_string())
            };
            format!("{base}/{name}")
        }
    };

    if Path::new(&target).exists() {
        return Err(ApiError::InvalidRequest(format!(
            "Target directory {target} already exists"
        )));
    }

    let mut cmd = tokio::process::Command::new("git");
    cmd.arg("clone");
    if let Some(branch) = &payload.branch {
        if branch.contains(['\0', '\n', ' ']) || branch.starts_with('-') {
            return Err(ApiError::Validation(format!(
                "Invalid branch name: {branch:?}"
            )));
        }
        cmd.arg("--branch").arg(branch);
    }
    cmd.arg(&payload.repo_url)
        .arg(&target)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(CLONE_TIMEOUT, async {
        let child = cmd.spawn().map_err(|e| {
            ApiError::ProcessStartError(format!("Failed to run git: {e}"))
        })?;
        child
            .wait_with_output()
            .await
            .map_err(|e| ApiError::Internal(format!("git clone failed: {e}")))
    })
    .await
    .map_err(|_| {
        ApiError::Timeout(format!(
            "git clone exceeded {} s",
            CLONE_TIMEOUT.as_secs()
        ))
    })??;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ApiError::Internal(format!(
            "git clone failed: {}",
            stderr.trim()
        )));
    }

    info!("Checked out {} into {target}", payload.repo_url);
    Ok(Json(json!({
        "success": true,
        "targetDirectory": target,
    })))
}

/// The repository's directory name: last path segment, `.git` stripped.
fn repo_name(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    let last = trimmed
        .rsplit(['/', ':'])
        .next()
        .unwrap_or("repository");
    let name = last.strip_suffix(".git").unwrap_or(last);
    if name.is_empty() {
        "repository".to_string()
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_name_extraction() {
        assert_eq!(repo_name("https://github.com/org/repo.git"), "repo");
        assert_eq!(repo_name("https://github.com/org/repo"), "repo");
        assert_eq!(repo_name("git@github.com:org/tool.git"), "tool");
        assert_eq!(repo_name("https://github.com/org/repo/"), "repo");
    }
}
