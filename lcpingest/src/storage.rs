//! Upload storage under the configured storage root.
//!
//! Every upload gets its own directory, `<root>/uploads/<upload id>/`, so concurrent uploads that
//! declare the same filename never share a path. Protected outputs live directly under the root,
//! named after their content id.

use crate::content_id::{ContentId, MAX_FILENAME_LEN};
use crate::errors::{Error, Result};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Leaves room for the `.webpub` package written next to an uploaded PDF
const MAX_STORED_NAME_LEN: usize = MAX_FILENAME_LEN - ".webpub".len();

/// A publication written to disk, ready to be encrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUpload {
    /// Filename as declared by the caller
    pub declared_name: String,
    /// Where the bytes were written
    pub path: PathBuf,
    /// Number of bytes written
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct UploadStore {
    root: PathBuf,
    max_upload_size: u64,
}

impl UploadStore {
    pub fn new(root: impl Into<PathBuf>, max_upload_size: u64) -> Self {
        Self {
            root: root.into(),
            max_upload_size,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the protected output for a content id.
    pub fn output_path(&self, content_id: &ContentId, extension: &str) -> PathBuf {
        self.root.join(format!("{content_id}.{extension}"))
    }

    /// Open the destination file for an upload.
    pub async fn begin(&self, upload_id: Uuid, declared_name: &str) -> Result<PendingUpload> {
        if declared_name.is_empty() {
            return Err(Error::upload("The uploaded file has no filename"));
        }

        let dir = self.root.join("uploads").join(upload_id.to_string());
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::upload(format!("Failed to create upload directory {}: {e}", dir.display())))?;

        let path = dir.join(sanitize_filename(declared_name));
        let file = File::create(&path)
            .await
            .map_err(|e| Error::upload(format!("Failed to create {}: {e}", path.display())))?;

        tracing::debug!(upload_id = %upload_id, path = %path.display(), "Opened upload destination");

        Ok(PendingUpload {
            declared_name: declared_name.to_string(),
            path,
            file: Some(file),
            size: 0,
            max_upload_size: self.max_upload_size,
        })
    }
}

/// An upload being streamed to disk.
///
/// Call [`PendingUpload::finish`] once all chunks are written or [`PendingUpload::abort`] to remove
/// the partial file.
#[derive(Debug)]
pub struct PendingUpload {
    declared_name: String,
    path: PathBuf,
    file: Option<File>,
    size: u64,
    max_upload_size: u64,
}

impl PendingUpload {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.size += chunk.len() as u64;
        if self.size > self.max_upload_size {
            return Err(Error::upload(format!(
                "File size exceeds maximum allowed size of {} bytes",
                self.max_upload_size
            )));
        }

        let Some(file) = self.file.as_mut() else {
            return Err(Error::upload("Upload already finished"));
        };
        file.write_all(chunk)
            .await
            .map_err(|e| Error::upload(format!("Failed to write {}: {e}", self.path.display())))
    }

    pub async fn finish(mut self) -> Result<StoredUpload> {
        if let Some(mut file) = self.file.take() {
            file.flush()
                .await
                .map_err(|e| Error::upload(format!("Failed to write {}: {e}", self.path.display())))?;
            file.sync_all()
                .await
                .map_err(|e| Error::upload(format!("Failed to write {}: {e}", self.path.display())))?;
        }

        Ok(StoredUpload {
            declared_name: self.declared_name,
            path: self.path,
            size: self.size,
        })
    }

    /// Remove the partial file and its upload directory.
    pub async fn abort(mut self) {
        drop(self.file.take());
        if let Err(e) = fs::remove_file(&self.path).await {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove partial upload");
        }
        if let Some(dir) = self.path.parent()
            && let Err(e) = fs::remove_dir(dir).await
        {
            tracing::warn!(path = %dir.display(), error = %e, "Failed to remove upload directory");
        }
    }
}

/// Reduce a caller-declared filename to a single safe path component.
///
/// Only the last component of the declared name is kept (either separator style), so the result
/// never leaves the upload directory. ASCII letters, digits, `-`, `_` and `.` survive; everything
/// else becomes `_`. Long names are shortened so the `.webpub` sibling still fits in one path
/// component; the extension is kept either way.
pub fn sanitize_filename(declared: &str) -> String {
    let base = declared.rsplit(['/', '\\']).next().unwrap_or_default();
    let transliterated = deunicode::deunicode(base);

    let mut out = String::with_capacity(transliterated.len());
    let mut last: Option<char> = None;
    for ch in transliterated.chars() {
        let mapped = if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
            ch
        } else {
            '_'
        };

        // collapse runs of '_' and '.'
        if (mapped == '_' || mapped == '.') && last == Some(mapped) {
            continue;
        }
        out.push(mapped);
        last = Some(mapped);
    }

    let trimmed = out.trim_start_matches('.');
    if trimmed.is_empty() {
        return "upload".to_string();
    }
    truncate_keeping_extension(trimmed)
}

/// `name` is ASCII here, so byte offsets are char boundaries.
fn truncate_keeping_extension(name: &str) -> String {
    if name.len() <= MAX_STORED_NAME_LEN {
        return name.to_string();
    }

    match name.rfind('.') {
        Some(dot) if name.len() - dot < MAX_STORED_NAME_LEN => {
            let extension = &name[dot..];
            format!("{}{extension}", &name[..MAX_STORED_NAME_LEN - extension.len()])
        }
        _ => name[..MAX_STORED_NAME_LEN].to_string(),
    }
}
