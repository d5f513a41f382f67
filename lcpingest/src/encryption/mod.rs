//! Encryption of stored uploads.
//!
//! Uploads are dispatched on their declared filename: `.epub` files are encrypted directly, anything
//! else is treated as a PDF, packaged as a web publication first and then encrypted with the basic
//! protection profile.
//!
//! - [`engine`]: the [`EncryptionEngine`] seam and the built-in [`engine::ContainerEngine`]
//! - [`packaging`]: the [`Packager`] seam and the built-in [`packaging::WebPubPackager`]
//! - [`external`]: encryption by spawning the `lcpencrypt` executable

pub mod engine;
pub mod external;
pub mod packaging;

use crate::content_id::ContentId;
use crate::errors::{Error, Result};
use crate::storage::{StoredUpload, UploadStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use engine::{ContainerEngine, EncryptionEngine};
pub use external::{ExternalInvoker, RelayedOutput};
pub use packaging::{Packager, WebPubPackager};

pub const EPUB_CONTENT_TYPE: &str = "application/epub+zip";
pub const LCPDF_CONTENT_TYPE: &str = "application/pdf+lcp";

/// Input format, decided from the declared filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicationFormat {
    Epub,
    Pdf,
}

impl PublicationFormat {
    /// Case-sensitive: only a literal `.epub` suffix is an EPUB, everything else is a PDF.
    pub fn detect(declared_name: &str) -> Self {
        if declared_name.ends_with(".epub") {
            PublicationFormat::Epub
        } else {
            PublicationFormat::Pdf
        }
    }

    /// Extension of the protected output
    pub fn output_extension(self) -> &'static str {
        match self {
            PublicationFormat::Epub => "epub",
            PublicationFormat::Pdf => "lcpdf",
        }
    }
}

/// LCP protection profile applied to web publication packages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionProfile {
    Basic,
}

impl ProtectionProfile {
    pub fn uri(self) -> &'static str {
        match self {
            ProtectionProfile::Basic => "http://readium.org/lcp/basic-profile",
        }
    }
}

/// Result of encrypting one publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionArtifact {
    pub path: PathBuf,
    pub encryption_key: Vec<u8>,
    pub size: u64,
    /// Lowercase hex SHA-256 of the protected file
    pub checksum: String,
    /// Filename offered to readers downloading the protected file
    pub content_disposition: String,
    pub content_type: String,
}

/// What the encryption stage produced.
#[derive(Debug)]
pub enum EncryptionOutcome {
    /// The publication was encrypted here; the LCP server still has to be told about it
    Artifact(EncryptionArtifact),
    /// The external executable ran and notified the LCP server itself
    Relayed(RelayedOutput),
}

/// Runs the engine and packager linked into this process.
#[derive(Clone)]
pub struct InProcessInvoker {
    engine: Arc<dyn EncryptionEngine>,
    packager: Arc<dyn Packager>,
    store: UploadStore,
}

impl InProcessInvoker {
    pub fn new(engine: Arc<dyn EncryptionEngine>, packager: Arc<dyn Packager>, store: UploadStore) -> Self {
        Self { engine, packager, store }
    }

    #[tracing::instrument(skip(self, upload), fields(content_id = %content_id, input = %upload.path.display()))]
    pub async fn encrypt(&self, upload: &StoredUpload, content_id: &ContentId) -> Result<EncryptionArtifact> {
        let format = PublicationFormat::detect(&upload.declared_name);
        let output = self.store.output_path(content_id, format.output_extension());
        let input = upload.path.clone();
        let title = upload.declared_name.clone();
        let engine = self.engine.clone();
        let packager = self.packager.clone();

        // Engine and packager do synchronous file IO and CPU work
        tokio::task::spawn_blocking(move || match format {
            PublicationFormat::Epub => {
                tracing::info!("Encrypting epub");
                engine
                    .encrypt_epub(&input, &output)
                    .map_err(|e| Error::Encryption { message: format!("{e:#}") })
            }
            PublicationFormat::Pdf => {
                tracing::info!("Encrypting pdf");
                let package = webpub_path(&input);
                packager
                    .build_webpub_from_pdf(&title, &input, &package)
                    .map_err(|e| Error::Packaging { message: format!("{e:#}") })?;
                engine
                    .encrypt_webpub(ProtectionProfile::Basic, &package, &output)
                    .map_err(|e| Error::Encryption { message: format!("{e:#}") })
            }
        })
        .await
        .map_err(|e| Error::Encryption {
            message: format!("Encryption task failed: {e}"),
        })?
    }
}

/// The intermediate web publication package sits next to the uploaded PDF.
pub fn webpub_path(input: &Path) -> PathBuf {
    let mut path = input.as_os_str().to_owned();
    path.push(".webpub");
    PathBuf::from(path)
}

/// The configured encryption realization.
#[derive(Clone)]
pub enum EncryptionInvoker {
    InProcess(InProcessInvoker),
    External(ExternalInvoker),
}

impl EncryptionInvoker {
    pub async fn encrypt(&self, upload: &StoredUpload, content_id: &ContentId) -> Result<EncryptionOutcome> {
        match self {
            EncryptionInvoker::InProcess(invoker) => invoker.encrypt(upload, content_id).await.map(EncryptionOutcome::Artifact),
            EncryptionInvoker::External(invoker) => invoker.encrypt(upload, content_id).await.map(EncryptionOutcome::Relayed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{RecordingEngine, RecordingPackager};

    fn stored(dir: &Path, name: &str) -> StoredUpload {
        let path = dir.join(name);
        std::fs::write(&path, b"content").unwrap();
        StoredUpload {
            declared_name: name.to_string(),
            path,
            size: 7,
        }
    }

    #[test]
    fn detects_format_case_sensitively() {
        assert_eq!(PublicationFormat::detect("book.epub"), PublicationFormat::Epub);
        assert_eq!(PublicationFormat::detect("report.pdf"), PublicationFormat::Pdf);
        assert_eq!(PublicationFormat::detect("BOOK.EPUB"), PublicationFormat::Pdf);
        assert_eq!(PublicationFormat::detect("book.epub.zip"), PublicationFormat::Pdf);
        assert_eq!(PublicationFormat::detect("noextension"), PublicationFormat::Pdf);
    }

    #[test]
    fn webpub_path_appends_suffix() {
        assert_eq!(
            webpub_path(Path::new("/srv/uploads/1/report.pdf")),
            PathBuf::from("/srv/uploads/1/report.pdf.webpub")
        );
    }

    #[tokio::test]
    async fn epub_skips_packaging() {
        let root = tempfile::tempdir().unwrap();
        let engine = Arc::new(RecordingEngine::default());
        let packager = Arc::new(RecordingPackager::default());
        let invoker = InProcessInvoker::new(engine.clone(), packager.clone(), UploadStore::new(root.path(), 1024));

        let upload = stored(root.path(), "book.epub");
        let id = ContentId::parse("book1").unwrap();
        let artifact = invoker.encrypt(&upload, &id).await.unwrap();

        assert_eq!(artifact.path, root.path().join("book1.epub"));
        assert!(packager.calls().is_empty());
        assert_eq!(engine.calls(), vec![format!("epub {} -> {}", upload.path.display(), artifact.path.display())]);
    }

    #[tokio::test]
    async fn pdf_is_packaged_before_encryption() {
        let root = tempfile::tempdir().unwrap();
        let engine = Arc::new(RecordingEngine::default());
        let packager = Arc::new(RecordingPackager::default());
        let invoker = InProcessInvoker::new(engine.clone(), packager.clone(), UploadStore::new(root.path(), 1024));

        let upload = stored(root.path(), "report.pdf");
        let id = ContentId::parse("doc42").unwrap();
        let artifact = invoker.encrypt(&upload, &id).await.unwrap();

        let package = webpub_path(&upload.path);
        assert_eq!(artifact.path, root.path().join("doc42.lcpdf"));
        assert_eq!(packager.calls(), vec![format!("report.pdf {} -> {}", upload.path.display(), package.display())]);
        assert_eq!(
            engine.calls(),
            vec![format!("webpub basic {} -> {}", package.display(), artifact.path.display())]
        );
    }

    #[tokio::test]
    async fn packaging_failure_prevents_encryption() {
        let root = tempfile::tempdir().unwrap();
        let engine = Arc::new(RecordingEngine::default());
        let packager = Arc::new(RecordingPackager::failing("not a pdf"));
        let invoker = InProcessInvoker::new(engine.clone(), packager.clone(), UploadStore::new(root.path(), 1024));

        let upload = stored(root.path(), "report.pdf");
        let err = invoker.encrypt(&upload, &ContentId::parse("doc42").unwrap()).await.unwrap_err();

        assert!(matches!(err, Error::Packaging { .. }), "{err}");
        assert_eq!(packager.calls().len(), 1);
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn engine_failure_is_an_encryption_error() {
        let root = tempfile::tempdir().unwrap();
        let engine = Arc::new(RecordingEngine::failing("bad container"));
        let invoker = InProcessInvoker::new(
            engine,
            Arc::new(RecordingPackager::default()),
            UploadStore::new(root.path(), 1024),
        );

        let upload = stored(root.path(), "book.epub");
        let err = invoker.encrypt(&upload, &ContentId::parse("book1").unwrap()).await.unwrap_err();

        assert!(matches!(err, Error::Encryption { .. }));
        assert!(err.to_string().contains("bad container"));
    }
}
