//! S3-compatible bucket mounting via a FUSE helper.
//!
//! The helper binary (default `s3fs`) does the actual mounting; this module
//! probes for FUSE support, stages credentials in a 0600 passwd file (never
//! on the command line), and surfaces the helper's stderr on failure.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::Config;
use crate::error::ApiError;
use crate::shell::spawn::which;

/// Caller-supplied credentials and endpoint for a mount.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MountOptions {
    pub endpoint: Option<String>,
    #[serde(rename = "accessKeyId")]
    pub access_key_id: Option<String>,
    #[serde(rename = "secretAccessKey")]
    pub secret_access_key: Option<String>,
}

/// Mounts object-store buckets into the container file system.
#[derive(Clone)]
pub struct BucketMounter {
    helper: String,
    /// Mounted paths, so a repeat mount of the same target is rejected early.
    mounts: Arc<Mutex<HashMap<String, String>>>,
}

impl BucketMounter {
    pub fn new(config: &Config) -> Self {
        Self {
            helper: config.bucket.fuse_helper.clone(),
            mounts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Mount `bucket` at `mount_path`. After success the bucket contents are
    /// ordinary files under the mount path.
    pub async fn mount(
        &self,
        bucket: &str,
        mount_path: &str,
        options: &MountOptions,
    ) -> Result<(), ApiError> {
        if bucket.is_empty() {
            return Err(ApiError::InvalidRequest(
                "Bucket name must not be empty".to_string(),
            ));
        }
        crate::security::validate_path(mount_path)?;
        self.probe_fuse()?;

        let mut mounts = self.mounts.lock().await;
        if mounts.contains_key(mount_path) {
            return Err(ApiError::InvalidRequest(format!(
                "{mount_path} already has a bucket mounted"
            )));
        }

        tokio::fs::create_dir_all(mount_path).await?;

        let mut cmd = tokio::process::Command::new(&self.helper);
        cmd.arg(bucket).arg(mount_path);

        // Credentials travel via a 0600 passwd file, not argv.
        let passwd_file = if let (Some(key), Some(secret)) = (
            options.access_key_id.as_deref(),
            options.secret_access_key.as_deref(),
        ) {
            let path = format!("/tmp/sandboxd-bucket-{}", uuid::Uuid::new_v4().simple());
            tokio::fs::write(&path, format!("{key}:{secret}\n")).await?;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
            cmd.arg("-o").arg(format!("passwd_file={path}"));
            Some(path)
        } else {
            None
        };

        if let Some(endpoint) = options.endpoint.as_deref() {
            cmd.arg("-o").arg(format!("url={endpoint}"));
            cmd.arg("-o").arg("use_path_request_style");
        }

        let output = cmd.output().await.map_err(|e| {
            ApiError::FuseNotAvailable(format!(
                "Failed to run FUSE helper {}: {e}",
                self.helper
            ))
        });

        if let Some(path) = passwd_file {
            let _ = tokio::fs::remove_file(&path).await;
        }
        let output = output?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ApiError::Internal(format!(
                "Mount of {bucket} at {mount_path} failed: {}",
                stderr.trim()
            )));
        }

        mounts.insert(mount_path.to_string(), bucket.to_string());
        info!("Bucket {bucket} mounted at {mount_path}");
        Ok(())
    }

    /// FUSE needs both the device node and the helper binary.
    fn probe_fuse(&self) -> Result<(), ApiError> {
        if !Path::new("/dev/fuse").exists() {
            return Err(ApiError::FuseNotAvailable(
                "/dev/fuse is not present; run the container with FUSE enabled \
                 (e.g. --device /dev/fuse --cap-add SYS_ADMIN)"
                    .to_string(),
            ));
        }
        if which(&self.helper).is_none() && !Path::new(&self.helper).is_file() {
            return Err(ApiError::FuseNotAvailable(format!(
                "FUSE helper {} is not installed in this image",
                self.helper
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_fuse_is_a_typed_error() {
        let mut config = Config::default();
        config.bucket.fuse_helper = "definitely-not-s3fs".to_string();
        let mounter = BucketMounter::new(&config);
        let err = mounter
            .mount("my-bucket", "/tmp/mnt-test", &MountOptions::default())
            .await
            .unwrap_err();
        // Whichever probe fails first, the error is the FUSE capability one.
        assert_eq!(err.code(), "FUSE_NOT_AVAILABLE");
    }

    #[tokio::test]
    async fn bad_mount_path_is_rejected() {
        let mounter = BucketMounter::new(&Config::default());
        let err = mounter
            .mount("bucket", "relative/path", &MountOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_PATH");
    }

    #[tokio::test]
    async fn empty_bucket_is_rejected() {
        let mounter = BucketMounter::new(&Config::default());
        let err = mounter
            .mount("", "/tmp/mnt", &MountOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
    }
}
