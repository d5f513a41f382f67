//! Test utilities (available with `test-utils` feature).

use crate::api::models::publications::PublicationRecord;
use crate::config::{Config, EncryptionConfig, LcpServerConfig, StorageConfig};
use crate::content_id::ContentId;
use crate::encryption::{
    EPUB_CONTENT_TYPE, EncryptionArtifact, EncryptionEngine, LCPDF_CONTENT_TYPE, Packager, ProtectionProfile,
};
use crate::errors::{Error, Result};
use crate::notifier::{ContentNotifier, NotificationOutcome};
use anyhow::bail;
use async_trait::async_trait;
use std::path::Path;
use std::sync::{Mutex, Once};
use std::time::Duration;
use url::Url;

/// reqwest is built without a default TLS provider; install the one `main` uses.
pub fn install_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

pub fn create_test_config(storage_root: &Path, lcp_server_url: &str) -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        enable_metrics: false,
        enable_otel_export: false,
        storage: StorageConfig {
            root: storage_root.to_path_buf(),
            max_upload_size: 5 * 1024 * 1024,
        },
        lcp_server: LcpServerConfig {
            url: Some(Url::parse(lcp_server_url).unwrap()),
            username: "admin".to_string(),
            password: "secret".to_string(),
            timeout: Duration::from_secs(5),
        },
        encryption: EncryptionConfig::default(),
    }
}

/// Engine that records its calls and writes a placeholder output.
#[derive(Default)]
pub struct RecordingEngine {
    failure: Option<String>,
    calls: Mutex<Vec<String>>,
}

impl RecordingEngine {
    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String, output: &Path, content_type: &str) -> anyhow::Result<EncryptionArtifact> {
        self.calls.lock().unwrap().push(call);
        if let Some(message) = &self.failure {
            bail!("{message}");
        }

        std::fs::write(output, b"encrypted")?;
        Ok(EncryptionArtifact {
            path: output.to_path_buf(),
            encryption_key: vec![0x42; 32],
            size: 9,
            checksum: crate::encryption::engine::hash_file(output)?,
            content_disposition: output
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            content_type: content_type.to_string(),
        })
    }
}

impl EncryptionEngine for RecordingEngine {
    fn encrypt_epub(&self, input: &Path, output: &Path) -> anyhow::Result<EncryptionArtifact> {
        self.record(
            format!("epub {} -> {}", input.display(), output.display()),
            output,
            EPUB_CONTENT_TYPE,
        )
    }

    fn encrypt_webpub(&self, profile: ProtectionProfile, input: &Path, output: &Path) -> anyhow::Result<EncryptionArtifact> {
        let profile = match profile {
            ProtectionProfile::Basic => "basic",
        };
        self.record(
            format!("webpub {profile} {} -> {}", input.display(), output.display()),
            output,
            LCPDF_CONTENT_TYPE,
        )
    }
}

/// Packager that records its calls and writes an empty package.
#[derive(Default)]
pub struct RecordingPackager {
    failure: Option<String>,
    calls: Mutex<Vec<String>>,
}

impl RecordingPackager {
    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Packager for RecordingPackager {
    fn build_webpub_from_pdf(&self, title: &str, input: &Path, output: &Path) -> anyhow::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{title} {} -> {}", input.display(), output.display()));
        if let Some(message) = &self.failure {
            bail!("{message}");
        }
        std::fs::write(output, b"package")?;
        Ok(())
    }
}

/// Notifier that records every record it is given.
#[derive(Default)]
pub struct MockNotifier {
    status: Option<u16>,
    calls: Mutex<Vec<(ContentId, PublicationRecord)>>,
}

impl MockNotifier {
    /// Answer every notification with a non-acknowledging status.
    pub fn failing_with_status(status: u16) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<(ContentId, PublicationRecord)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContentNotifier for MockNotifier {
    async fn notify(&self, content_id: &ContentId, record: &PublicationRecord) -> Result<NotificationOutcome> {
        self.calls.lock().unwrap().push((content_id.clone(), record.clone()));
        match self.status {
            Some(status) => Err(Error::Notification { status }),
            None => Ok(NotificationOutcome { status: 200 }),
        }
    }
}
