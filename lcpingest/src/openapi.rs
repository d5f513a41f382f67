//! OpenAPI document served at `/openapi.json`.

use utoipa::OpenApi;

use crate::api;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "lcpingest",
        description = "Encrypts uploaded EPUB and PDF publications and registers them with an LCP server."
    ),
    paths(api::handlers::upload::upload_publication),
    components(schemas(
        api::models::publications::PublicationRecord,
        api::models::publications::UploadRecord
    )),
    tags((name = "publications", description = "Publication ingestion"))
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documents_upload_endpoint() {
        let doc = serde_json::to_value(ApiDoc::openapi()).unwrap();
        assert!(doc["paths"]["/upload"]["post"].is_object());
        let schema = &doc["components"]["schemas"]["PublicationRecord"]["properties"];
        assert!(schema["content-id"].is_object());
        assert!(schema["content-encryption-key"].is_object());
        assert!(doc["components"]["schemas"]["UploadRecord"].is_object());
    }
}
