//! The upload-to-notification pipeline.
//!
//! A request moves strictly forward through
//! `Received → Stored → Identified → Encrypted → Notified → Responded`, or ends in `Aborted` from
//! any non-terminal stage. There are no retries. The HTTP handler drives `Received → Stored`
//! while reading the multipart body; [`Pipeline::process`] drives the rest.

use crate::api::models::publications::{PublicationRecord, UploadRecord};
use crate::content_id::ContentId;
use crate::encryption::{EncryptionInvoker, EncryptionOutcome};
use crate::errors::{Error, Result};
use crate::notifier::ContentNotifier;
use crate::storage::{StoredUpload, UploadStore};
use axum::{
    Json,
    http::header,
    response::{IntoResponse, Response},
};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Stored,
    Identified,
    Encrypted,
    Notified,
    Responded,
    Aborted,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Responded | Stage::Aborted)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Progress of one upload request.
#[derive(Debug)]
pub struct PipelineRun {
    request_id: Uuid,
    stage: Stage,
}

impl PipelineRun {
    pub fn new(request_id: Uuid) -> Self {
        tracing::debug!(request_id = %request_id, stage = %Stage::Received, "Upload received");
        Self {
            request_id,
            stage: Stage::Received,
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Move to the next stage. Terminal runs stay where they are.
    pub fn advance(&mut self, next: Stage) {
        if self.stage.is_terminal() {
            tracing::warn!(request_id = %self.request_id, from = %self.stage, to = %next, "Ignoring transition out of terminal stage");
            return;
        }

        if next == Stage::Responded {
            tracing::info!(request_id = %self.request_id, from = %self.stage, "Upload completed");
        } else {
            tracing::debug!(request_id = %self.request_id, from = %self.stage, to = %next, "Upload advanced");
        }
        self.stage = next;
        if next == Stage::Responded {
            metrics::counter!("lcpingest_uploads_total", "outcome" => "success").increment(1);
        }
    }

    pub fn abort(&mut self, error: &Error) {
        if self.stage.is_terminal() {
            return;
        }

        match error {
            Error::Upload { .. } => {
                tracing::warn!(request_id = %self.request_id, from = %self.stage, kind = error.kind(), "Upload aborted")
            }
            _ => tracing::error!(request_id = %self.request_id, from = %self.stage, kind = error.kind(), "Upload aborted"),
        }
        self.stage = Stage::Aborted;
        metrics::counter!("lcpingest_uploads_total", "outcome" => error.kind()).increment(1);
    }
}

/// Body of a successful upload.
#[derive(Debug)]
pub enum UploadResponse {
    /// Encrypted in-process and acknowledged by the LCP server
    Record(PublicationRecord),
    /// Output of the external encryption process, passed through untouched
    Relayed(Vec<u8>),
}

impl IntoResponse for UploadResponse {
    fn into_response(self) -> Response {
        match self {
            UploadResponse::Record(record) => Json(UploadRecord::from(record)).into_response(),
            UploadResponse::Relayed(body) => ([(header::CONTENT_TYPE, "application/json")], body).into_response(),
        }
    }
}

/// Runs the stages after storage for every upload.
pub struct Pipeline {
    store: UploadStore,
    invoker: EncryptionInvoker,
    notifier: Arc<dyn ContentNotifier>,
}

impl Pipeline {
    pub fn new(store: UploadStore, invoker: EncryptionInvoker, notifier: Arc<dyn ContentNotifier>) -> Self {
        Self { store, invoker, notifier }
    }

    pub fn store(&self) -> &UploadStore {
        &self.store
    }

    /// Identify, encrypt and register a stored upload.
    ///
    /// The run is left in `Notified` (or `Encrypted` for relayed output) on success; the caller
    /// advances it to `Responded` once the response is written.
    pub async fn process(&self, run: &mut PipelineRun, upload: StoredUpload, supplied_id: Option<&str>) -> Result<UploadResponse> {
        let content_id = ContentId::allocate(supplied_id)?;
        if supplied_id.is_none_or(str::is_empty) {
            tracing::info!(content_id = %content_id, "No contentid was given, generated a new one");
        }
        run.advance(Stage::Identified);

        let artifact = match self.invoker.encrypt(&upload, &content_id).await? {
            EncryptionOutcome::Relayed(output) => {
                run.advance(Stage::Encrypted);
                return Ok(UploadResponse::Relayed(output.body));
            }
            EncryptionOutcome::Artifact(artifact) => artifact,
        };
        tracing::info!(
            content_id = %content_id,
            output = %artifact.path.display(),
            size = artifact.size,
            "Publication encrypted"
        );
        run.advance(Stage::Encrypted);

        let mut record = PublicationRecord::from_artifact(content_id.clone(), &artifact);
        match self.notifier.notify(&content_id, &record).await {
            Ok(outcome) => {
                metrics::counter!("lcpingest_notifications_total", "outcome" => "acknowledged").increment(1);
                tracing::debug!(content_id = %content_id, status = outcome.status, "Notification acknowledged");
            }
            Err(e) => {
                let outcome = match &e {
                    Error::Notification { .. } => "rejected",
                    _ => "unreachable",
                };
                metrics::counter!("lcpingest_notifications_total", "outcome" => outcome).increment(1);

                // The protected file stays on disk; only the record carries the failure
                record.error_message = Some(e.to_string());
                tracing::error!(
                    content_id = %content_id,
                    record = %serde_json::to_string(&record).unwrap_or_default(),
                    "Failed to notify LCP server"
                );
                return Err(e);
            }
        }
        run.advance(Stage::Notified);

        Ok(UploadResponse::Record(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::InProcessInvoker;
    use crate::test_utils::{MockNotifier, RecordingEngine, RecordingPackager};
    use std::path::Path;

    fn stored(root: &Path, name: &str) -> StoredUpload {
        let dir = root.join("uploads").join("req");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, b"content").unwrap();
        StoredUpload {
            declared_name: name.to_string(),
            path,
            size: 7,
        }
    }

    fn pipeline(root: &Path, notifier: Arc<MockNotifier>) -> Pipeline {
        let store = UploadStore::new(root, 1024);
        let invoker = InProcessInvoker::new(
            Arc::new(RecordingEngine::default()),
            Arc::new(RecordingPackager::default()),
            store.clone(),
        );
        Pipeline::new(store, EncryptionInvoker::InProcess(invoker), notifier)
    }

    #[test]
    fn terminal_stage_is_sticky() {
        let request_id = Uuid::new_v4();
        let mut run = PipelineRun::new(request_id);
        run.advance(Stage::Stored);
        run.abort(&Error::upload("boom"));
        assert_eq!(run.stage(), Stage::Aborted);
        assert_eq!(run.request_id(), request_id);

        run.advance(Stage::Identified);
        assert_eq!(run.stage(), Stage::Aborted);
    }

    #[test_log::test(tokio::test)]
    async fn notified_record_matches_notification() {
        let root = tempfile::tempdir().unwrap();
        let notifier = Arc::new(MockNotifier::default());
        let pipeline = pipeline(root.path(), notifier.clone());

        let mut run = PipelineRun::new(Uuid::new_v4());
        run.advance(Stage::Stored);
        let response = pipeline
            .process(&mut run, stored(root.path(), "book.epub"), Some("book1"))
            .await
            .unwrap();

        assert_eq!(run.stage(), Stage::Notified);
        let UploadResponse::Record(record) = response else {
            panic!("expected a record");
        };
        assert_eq!(record.content_id.as_str(), "book1");
        assert_eq!(record.error_message, None);

        let calls = notifier.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0.as_str(), "book1");
        assert_eq!(calls[0].1, record);
    }

    #[tokio::test]
    async fn rejected_notification_fails_but_keeps_output() {
        let root = tempfile::tempdir().unwrap();
        let notifier = Arc::new(MockNotifier::failing_with_status(503));
        let pipeline = pipeline(root.path(), notifier.clone());

        let mut run = PipelineRun::new(Uuid::new_v4());
        run.advance(Stage::Stored);
        let err = pipeline
            .process(&mut run, stored(root.path(), "report.pdf"), Some("doc42"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Notification { status: 503 }));
        assert_eq!(run.stage(), Stage::Encrypted);
        assert!(root.path().join("doc42.lcpdf").exists());
        assert_eq!(notifier.calls().len(), 1);
    }

    #[tokio::test]
    async fn rejected_supplied_id_stops_before_encryption() {
        let root = tempfile::tempdir().unwrap();
        let notifier = Arc::new(MockNotifier::default());
        let pipeline = pipeline(root.path(), notifier.clone());

        let mut run = PipelineRun::new(Uuid::new_v4());
        let err = pipeline
            .process(&mut run, stored(root.path(), "book.epub"), Some("../escape"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Upload { .. }));
        assert!(notifier.calls().is_empty());
        assert!(!root.path().join("..").join("escape.epub").exists());
    }
}
