use crate::content_id::ContentId;
use crate::encryption::EncryptionArtifact;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Metadata of a protected publication.
///
/// Sent as-is to the LCP server, so the field names follow the LCP server's content registration
/// contract. Uploaders receive it wrapped in an [`UploadRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PublicationRecord {
    #[serde(rename = "content-id")]
    #[schema(value_type = String, example = "doc42")]
    pub content_id: ContentId,

    /// Content encryption key, base64 encoded
    #[serde(rename = "content-encryption-key", with = "base64_bytes")]
    #[schema(value_type = String, format = Byte)]
    pub content_key: Vec<u8>,

    /// Where the protected file was written
    #[serde(rename = "protected-content-location")]
    pub location: String,

    #[serde(rename = "protected-content-length")]
    pub size: u64,

    /// Lowercase hex SHA-256 of the protected file
    #[serde(rename = "protected-content-sha256")]
    pub checksum: String,

    #[serde(rename = "protected-content-disposition")]
    pub content_disposition: String,

    #[serde(rename = "protected-content-type", default, skip_serializing_if = "String::is_empty")]
    pub content_type: String,

    /// Set when the LCP server could not be notified
    #[serde(rename = "error", default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl PublicationRecord {
    pub fn from_artifact(content_id: ContentId, artifact: &EncryptionArtifact) -> Self {
        Self {
            content_id,
            content_key: artifact.encryption_key.clone(),
            location: artifact.path.display().to_string(),
            size: artifact.size,
            checksum: artifact.checksum.clone(),
            content_disposition: artifact.content_disposition.clone(),
            content_type: artifact.content_type.clone(),
            error_message: None,
        }
    }
}

/// Body of a successful `/upload`: the publication record plus the `ContentId` and
/// `EncryptionKey` keys existing uploaders read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct UploadRecord {
    #[serde(rename = "ContentId")]
    #[schema(value_type = String, example = "doc42")]
    pub content_id: ContentId,

    /// Content encryption key, base64 encoded
    #[serde(rename = "EncryptionKey", with = "base64_bytes")]
    #[schema(value_type = String, format = Byte)]
    pub encryption_key: Vec<u8>,

    #[serde(flatten)]
    pub publication: PublicationRecord,
}

impl From<PublicationRecord> for UploadRecord {
    fn from(publication: PublicationRecord) -> Self {
        Self {
            content_id: publication.content_id.clone(),
            encryption_key: publication.content_key.clone(),
            publication,
        }
    }
}

mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(D::Error::custom)
    }
}
