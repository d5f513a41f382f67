//! Encryption by spawning the `lcpencrypt` executable.
//!
//! In this mode the executable encrypts the upload and registers it with the LCP server itself.
//! The service only relays whatever the process printed.

use crate::config::RelayPolicy;
use crate::content_id::ContentId;
use crate::errors::{Error, Result};
use crate::storage::StoredUpload;
use bon::Builder;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Captured output of one encryption process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayedOutput {
    /// stdout followed by stderr
    pub body: Vec<u8>,
    /// None when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub success: bool,
}

#[derive(Clone, Builder)]
pub struct ExternalInvoker {
    #[builder(into)]
    executable: PathBuf,
    timeout: Duration,
    #[builder(default)]
    relay: RelayPolicy,
    lcp_server: Url,
    #[builder(into)]
    username: String,
    #[builder(into)]
    password: String,
    /// Directory the executable writes the protected file into
    #[builder(into)]
    output_dir: PathBuf,
    /// Cancelled on server shutdown; kills running processes
    #[builder(default)]
    shutdown: CancellationToken,
}

impl ExternalInvoker {
    pub fn args(&self, upload: &StoredUpload, content_id: &ContentId) -> Vec<OsString> {
        vec![
            "-input".into(),
            upload.path.clone().into_os_string(),
            "-output".into(),
            self.output_dir.clone().into_os_string(),
            "-lcpsv".into(),
            self.lcp_server.as_str().into(),
            "-login".into(),
            self.username.as_str().into(),
            "-password".into(),
            self.password.as_str().into(),
            "-contentid".into(),
            content_id.as_str().into(),
        ]
    }

    #[tracing::instrument(skip(self, upload), fields(content_id = %content_id, executable = %self.executable.display()))]
    pub async fn encrypt(&self, upload: &StoredUpload, content_id: &ContentId) -> Result<RelayedOutput> {
        let mut command = Command::new(&self.executable);
        command
            .args(self.args(upload, content_id))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| Error::Encryption {
            message: format!("Failed to start {}: {e}", self.executable.display()),
        })?;
        tracing::debug!(pid = child.id(), "Spawned encryption process");

        // Dropping the wait future drops the child, which kills it
        let output = tokio::select! {
            waited = tokio::time::timeout(self.timeout, child.wait_with_output()) => match waited {
                Ok(output) => output.map_err(|e| Error::Encryption {
                    message: format!("Failed to collect output of {}: {e}", self.executable.display()),
                })?,
                Err(_) => return Err(Error::EncryptionTimeout { timeout: self.timeout }),
            },
            _ = self.shutdown.cancelled() => return Err(Error::EncryptionCancelled),
        };

        let mut body = output.stdout;
        body.extend_from_slice(&output.stderr);
        let relayed = RelayedOutput {
            body,
            exit_code: output.status.code(),
            success: output.status.success(),
        };

        if relayed.success {
            tracing::info!(bytes = relayed.body.len(), "Encryption process finished");
            return Ok(relayed);
        }

        match self.relay {
            RelayPolicy::Strict => Err(Error::Encryption {
                message: format!(
                    "{} exited with {}: {}",
                    self.executable.display(),
                    output.status,
                    String::from_utf8_lossy(&relayed.body).trim()
                ),
            }),
            RelayPolicy::BestEffort => {
                tracing::warn!(
                    exit_code = ?relayed.exit_code,
                    bytes = relayed.body.len(),
                    "Encryption process failed, relaying its output anyway"
                );
                Ok(relayed)
            }
        }
    }
}
