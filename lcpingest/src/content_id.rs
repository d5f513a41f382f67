//! Content identifiers: the stem of protected output filenames and the LCP server's resource key.

use crate::errors::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Filesystem limit on a single path component (NAME_MAX)
pub const MAX_FILENAME_LEN: usize = 255;

/// Leaves room for the longest protected output extension, `.lcpdf`
const MAX_LEN: usize = MAX_FILENAME_LEN - ".lcpdf".len();

/// URL-safe identifier of a protected publication.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    /// Use the caller's identifier if one was supplied, otherwise generate a fresh one.
    ///
    /// A supplied identifier is kept verbatim; it is rejected rather than rewritten when it is not
    /// made of unreserved URL characters, because it names files under the storage root.
    pub fn allocate(supplied: Option<&str>) -> Result<Self> {
        match supplied {
            Some(id) if !id.is_empty() => Self::parse(id),
            _ => Self::generate(),
        }
    }

    pub fn parse(id: &str) -> Result<Self> {
        if id.len() > MAX_LEN {
            return Err(Error::upload(format!("contentid must be at most {MAX_LEN} bytes")));
        }

        if id == "." || id == ".." {
            return Err(Error::upload(format!("contentid '{id}' is not allowed")));
        }

        if let Some(c) = id.chars().find(|c| !is_unreserved(*c)) {
            return Err(Error::upload(format!(
                "contentid contains invalid character {c:?}; only letters, digits, '-', '.', '_' and '~' are allowed"
            )));
        }

        Ok(Self(id.to_string()))
    }

    /// Generate a random (v4) UUID from the OS randomness source.
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; 16];
        getrandom::fill(&mut bytes).map_err(|e| Error::IdentifierGeneration { message: e.to_string() })?;
        let id = uuid::Builder::from_random_bytes(bytes).into_uuid();
        Ok(Self(id.hyphenated().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_unreserved(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~')
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ContentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn supplied_id_is_used_verbatim() {
        let id = ContentId::allocate(Some("doc42")).unwrap();
        assert_eq!(id.as_str(), "doc42");

        let id = ContentId::allocate(Some("Book_1.v2~final")).unwrap();
        assert_eq!(id.as_str(), "Book_1.v2~final");
    }

    #[test]
    fn empty_id_is_generated() {
        let id = ContentId::allocate(Some("")).unwrap();
        assert!(uuid::Uuid::parse_str(id.as_str()).is_ok());

        let id = ContentId::allocate(None).unwrap();
        let parsed = uuid::Uuid::parse_str(id.as_str()).unwrap();
        assert_eq!(parsed.get_version_num(), 4);
        assert_eq!(id.as_str(), parsed.hyphenated().to_string());
    }

    #[test]
    fn generated_ids_are_distinct() {
        let ids: HashSet<String> = (0..10_000)
            .map(|_| ContentId::generate().unwrap().as_str().to_string())
            .collect();
        assert_eq!(ids.len(), 10_000);
    }

    #[test]
    fn unsafe_ids_are_rejected() {
        for id in ["../etc/passwd", "a/b", "with space", "..", ".", "naïve", "q?x=1"] {
            let err = ContentId::allocate(Some(id)).unwrap_err();
            assert!(matches!(err, Error::Upload { .. }), "{id} should be rejected");
        }

        let long = "a".repeat(MAX_LEN + 1);
        assert!(ContentId::parse(&long).is_err());
        assert!(ContentId::parse(&"a".repeat(MAX_LEN)).is_ok());
    }

    #[test]
    fn longest_id_still_names_a_valid_output_file() {
        assert_eq!(MAX_LEN, 249);
        let id = ContentId::parse(&"a".repeat(MAX_LEN)).unwrap();
        assert_eq!(format!("{id}.lcpdf").len(), MAX_FILENAME_LEN);
        assert!(ContentId::parse(&"a".repeat(MAX_FILENAME_LEN)).is_err());

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(format!("{id}.lcpdf")), b"x").unwrap();
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = ContentId::parse("doc42").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""doc42""#);
    }
}
