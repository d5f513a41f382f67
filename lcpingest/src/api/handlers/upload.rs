use crate::{
    AppState,
    errors::{Error, Result},
    pipeline::{PipelineRun, Stage, UploadResponse},
    storage::{StoredUpload, UploadStore},
};
use axum::extract::{
    Multipart, State,
    multipart::Field,
};
use tracing::Instrument;
use uuid::Uuid;

#[utoipa::path(
    post,
    path = "/upload",
    tag = "publications",
    summary = "Upload publication",
    description = "Upload an EPUB or PDF publication. The file is encrypted and registered with the LCP server under \
the supplied `contentid`, or under a generated identifier when none is given.

Files named `*.epub` are encrypted as EPUB; anything else is treated as a PDF and packaged as a web publication first. \
When encryption runs through the external `lcpencrypt` executable the response body is that executable's output.",
    request_body(
        content_type = "multipart/form-data",
        description = "Field `file` with the publication (required) and field `contentid` (optional)"
    ),
    responses(
        (status = 200, description = "Publication encrypted and registered", body = crate::api::models::publications::UploadRecord),
        (status = 500, description = "Upload, encryption or registration failed; the body is a plain-text message", body = String, content_type = "text/plain")
    )
)]
pub async fn upload_publication(State(state): State<AppState>, multipart: Multipart) -> Result<UploadResponse> {
    let request_id = Uuid::new_v4();
    let mut run = PipelineRun::new(request_id);

    let span = tracing::info_span!("upload", request_id = %run.request_id());
    let result = async {
        let (upload, content_id) = receive(state.pipeline.store(), request_id, multipart).await?;
        run.advance(Stage::Stored);
        state.pipeline.process(&mut run, upload, content_id.as_deref()).await
    }
    .instrument(span)
    .await;

    match result {
        Ok(response) => {
            run.advance(Stage::Responded);
            Ok(response)
        }
        Err(e) => {
            run.abort(&e);
            Err(e)
        }
    }
}

/// Read the multipart body, streaming the `file` part to disk.
async fn receive(store: &UploadStore, request_id: Uuid, mut multipart: Multipart) -> Result<(StoredUpload, Option<String>)> {
    let mut upload: Option<StoredUpload> = None;
    let mut content_id: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::upload(format!("Failed to parse multipart data: {e}")))?
    {
        let field_name = field.name().unwrap_or("").to_string();

        match field_name.as_str() {
            "file" if upload.is_some() => {
                tracing::debug!("Ignoring additional file part");
            }
            "file" => {
                let declared_name = field.file_name().unwrap_or("").to_string();
                tracing::info!(filename = %declared_name, "Request received for file");
                upload = Some(store_file(store, request_id, &declared_name, field).await?);
            }
            "contentid" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| Error::upload(format!("Failed to read contentid: {e}")))?;
                content_id = Some(value);
            }
            other => {
                tracing::debug!(field = other, "Ignoring unknown multipart field");
            }
        }
    }

    let upload = upload.ok_or_else(|| Error::upload("Missing required multipart field 'file'"))?;
    Ok((upload, content_id))
}

async fn store_file(store: &UploadStore, request_id: Uuid, declared_name: &str, mut field: Field<'_>) -> Result<StoredUpload> {
    let mut pending = store.begin(request_id, declared_name).await?;

    loop {
        let chunk = match field.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => {
                pending.abort().await;
                return Err(Error::upload(format!("Failed to read file chunk: {e}")));
            }
        };

        if let Err(e) = pending.write_chunk(&chunk).await {
            tracing::warn!(path = %pending.path().display(), "Aborting upload: {e}");
            pending.abort().await;
            return Err(e);
        }
    }

    let stored = pending.finish().await?;
    tracing::debug!(path = %stored.path.display(), size = stored.size, "Upload stored");
    Ok(stored)
}
