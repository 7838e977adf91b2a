//! File operation endpoints.
//!
//! All operations take JSON bodies with absolute paths (validated against
//! traversal and NUL bytes). Binary content travels base64-encoded via the
//! `encoding` option; reads of non-UTF-8 files fall back to base64 and say
//! so. Writes are atomic: temp file in the target directory, then rename.

use std::os::unix::fs::PermissionsExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use axum::extract::State;
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::security::validate_path;
use crate::state::AppState;

/// Monotonic counter to uniquify temp file names across concurrent writes.
static WRITE_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Deserialize)]
pub struct ReadRequest {
    pub path: String,
    /// `"base64"` to force base64 content in the response.
    pub encoding: Option<String>,
}

#[derive(Deserialize)]
pub struct WriteRequest {
    pub path: String,
    pub content: String,
    /// `"base64"` when `content` is base64-encoded binary.
    pub encoding: Option<String>,
}

#[derive(Deserialize)]
pub struct DeleteRequest {
    pub path: String,
    /// Required `true` to delete a directory (recursively).
    #[serde(default)]
    pub recursive: bool,
}

#[derive(Deserialize)]
pub struct RenameRequest {
    #[serde(rename = "oldPath")]
    pub old_path: String,
    #[serde(rename = "newPath")]
    pub new_path: String,
}

#[derive(Deserialize)]
pub struct MoveRequest {
    #[serde(rename = "sourcePath")]
    pub source_path: String,
    #[serde(rename = "destinationPath")]
    pub destination_path: String,
}

#[derive(Deserialize)]
pub struct MkdirRequest {
    pub path: String,
    #[serde(default)]
    pub recursive: bool,
}

#[derive(Deserialize)]
pub struct ListRequest {
    pub path: String,
}

/// A single entry within a directory listing.
#[derive(Serialize)]
pub struct DirEntry {
    pub name: String,
    /// One of `"file"`, `"dir"`, `"symlink"`, or `"other"`.
    #[serde(rename = "type")]
    pub entry_type: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<u64>,
}

/// `POST /api/read` — read a file, optionally base64-encoded.
pub async fn read_file(
    State(_state): State<AppState>,
    Json(payload): Json<ReadRequest>,
) -> Result<Json<Value>, ApiError> {
    let path = validate_path(&payload.path)?;
    let bytes = tokio::fs::read(&path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ApiError::FileNotFound(payload.path.clone())
        } else {
            ApiError::Internal(e.to_string())
        }
    })?;

    let want_base64 = payload.encoding.as_deref() == Some("base64");
    let (content, encoding) = if want_base64 {
        (BASE64.encode(&bytes), Some("base64"))
    } else {
        match String::from_utf8(bytes) {
            Ok(text) => (text, None),
            // Binary files degrade to base64 rather than lossy text.
            Err(e) => (BASE64.encode(e.as_bytes()), Some("base64")),
        }
    };

    let mut body = json!({
        "success": true,
        "path": payload.path,
        "content": content,
    });
    if let Some(encoding) = encoding {
        body["encoding"] = json!(encoding);
    }
    Ok(Json(body))
}

/// `POST /api/write` — write a file atomically (temp file + rename).
pub async fn write_file(
    State(_state): State<AppState>,
    Json(payload): Json<WriteRequest>,
) -> Result<Json<Value>, ApiError> {
    let path = validate_path(&payload.path)?;

    let bytes = if payload.encoding.as_deref() == Some("base64") {
        BASE64
            .decode(payload.content.as_bytes())
            .map_err(|e| ApiError::InvalidRequest(format!("Invalid base64 content: {e}")))?
    } else {
        payload.content.into_bytes()
    };

    let parent = path
        .parent()
        .ok_or_else(|| ApiError::InvalidPath("Path has no parent directory".to_string()))?;
    tokio::fs::create_dir_all(parent).await?;

    // Unique temp name so concurrent writes to one target never collide.
    let counter = WRITE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let temp = parent.join(format!(
        ".{}.sandboxd-{}-{counter}.tmp",
        path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
        std::process::id(),
    ));
    tokio::fs::write(&temp, &bytes).await?;
    if let Err(e) = tokio::fs::rename(&temp, &path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e.into());
    }

    Ok(Json(json!({
        "success": true,
        "path": payload.path,
        "bytesWritten": bytes.len(),
    })))
}

/// `POST /api/delete` — delete a file, or a directory with `recursive: true`.
pub async fn delete_file(
    State(_state): State<AppState>,
    Json(payload): Json<DeleteRequest>,
) -> Result<Json<Value>, ApiError> {
    let path = validate_path(&payload.path)?;
    let meta = tokio::fs::symlink_metadata(&path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ApiError::FileNotFound(payload.path.clone())
        } else {
            ApiError::Internal(e.to_string())
        }
    })?;

    if meta.is_dir() {
        if !payload.recursive {
            return Err(ApiError::CannotDeleteDirectory(payload.path));
        }
        tokio::fs::remove_dir_all(&path).await?;
    } else {
        tokio::fs::remove_file(&path).await?;
    }
    Ok(Json(json!({"success": true})))
}

/// `POST /api/rename` — rename within the file system.
pub async fn rename_file(
    State(_state): State<AppState>,
    Json(payload): Json<RenameRequest>,
) -> Result<Json<Value>, ApiError> {
    let old = validate_path(&payload.old_path)?;
    let new = validate_path(&payload.new_path)?;
    tokio::fs::rename(&old, &new).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ApiError::FileNotFound(payload.old_path.clone())
        } else {
            ApiError::Internal(e.to_string())
        }
    })?;
    Ok(Json(json!({"success": true, "path": payload.new_path})))
}

/// `POST /api/move` — move a file, creating destination parents as needed.
pub async fn move_file(
    State(_state): State<AppState>,
    Json(payload): Json<MoveRequest>,
) -> Result<Json<Value>, ApiError> {
    let source = validate_path(&payload.source_path)?;
    let destination = validate_path(&payload.destination_path)?;
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::rename(&source, &destination).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ApiError::FileNotFound(payload.source_path.clone())
        } else {
            ApiError::Internal(e.to_string())
        }
    })?;
    Ok(Json(
        json!({"success": true, "path": payload.destination_path}),
    ))
}

/// `POST /api/mkdir` — create a directory.
pub async fn mkdir(
    State(_state): State<AppState>,
    Json(payload): Json<MkdirRequest>,
) -> Result<Json<Value>, ApiError> {
    let path = validate_path(&payload.path)?;
    if payload.recursive {
        tokio::fs::create_dir_all(&path).await?;
    } else {
        tokio::fs::create_dir(&path).await?;
    }
    Ok(Json(json!({"success": true, "path": payload.path})))
}

/// `POST /api/list` — list a directory, sorted by name.
pub async fn list_dir(
    State(_state): State<AppState>,
    Json(payload): Json<ListRequest>,
) -> Result<Json<Value>, ApiError> {
    let path = validate_path(&payload.path)?;
    let mut reader = tokio::fs::read_dir(&path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ApiError::FileNotFound(payload.path.clone())
        } else {
            ApiError::Internal(e.to_string())
        }
    })?;

    let mut entries = Vec::new();
    while let Ok(Some(entry)) = reader.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        let meta = match entry.metadata().await {
            Ok(meta) => meta,
            Err(_) => continue,
        };
        let entry_type = if meta.is_dir() {
            "dir"
        } else if meta.is_file() {
            "file"
        } else if meta.file_type().is_symlink() {
            "symlink"
        } else {
            "other"
        };
        entries.push(DirEntry {
            name,
            entry_type: entry_type.to_string(),
            size: if meta.is_file() { meta.len() } else { 0 },
            mode: Some(format!("{:04o}", meta.permissions().mode() & 0o7777)),
            modified: meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
                .map(|d| d.as_secs()),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(Json(json!({
        "success": true,
        "path": payload.path,
        "entries": entries,
    })))
}
