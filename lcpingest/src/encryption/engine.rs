//! The encryption engine seam and the built-in container engine.
//!
//! [`ContainerEngine`] rewrites a ZIP-based publication (EPUB or web publication package) with
//! every publication resource sealed under a fresh 256-bit content key. Each sealed entry holds a
//! random 96-bit nonce followed by the AES-256-GCM ciphertext, and is stored uncompressed.
//! Sealed entries are listed in `META-INF/encryption.xml`. Container metadata stays readable:
//! `mimetype`, everything under `META-INF/`, the EPUB package document (`*.opf`) and the web
//! publication `manifest.json`.

use super::{EPUB_CONTENT_TYPE, EncryptionArtifact, LCPDF_CONTENT_TYPE, ProtectionProfile};
use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use anyhow::{Context, bail};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use zip::{CompressionMethod, ZipArchive, ZipWriter, write::FileOptions};

const ENCRYPTION_XML: &str = "META-INF/encryption.xml";
const AES256_GCM_URI: &str = "http://www.w3.org/2009/xmlenc11#aes256-gcm";

/// Encrypts publications and reports the key material the licensing server needs.
///
/// Implementations perform blocking IO; callers run them off the async runtime.
pub trait EncryptionEngine: Send + Sync {
    /// Encrypt an EPUB at `input`, writing the protected EPUB to `output`.
    fn encrypt_epub(&self, input: &Path, output: &Path) -> anyhow::Result<EncryptionArtifact>;

    /// Encrypt a web publication package at `input`, writing the protected package to `output`.
    fn encrypt_webpub(&self, profile: ProtectionProfile, input: &Path, output: &Path) -> anyhow::Result<EncryptionArtifact>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerEngine;

impl ContainerEngine {
    pub fn new() -> Self {
        Self
    }

    fn encrypt_container(
        &self,
        input: &Path,
        output: &Path,
        keep_plain: fn(&str) -> bool,
        profile: Option<ProtectionProfile>,
        content_type: &str,
    ) -> anyhow::Result<EncryptionArtifact> {
        let key = generate_content_key()?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|e| anyhow::anyhow!("Failed to create cipher: {}", e))?;

        let source = File::open(input).with_context(|| format!("Failed to open {}", input.display()))?;
        let mut archive = ZipArchive::new(source).with_context(|| format!("{} is not a ZIP container", input.display()))?;

        if archive.by_name(ENCRYPTION_XML).is_ok() {
            bail!("{} already contains {ENCRYPTION_XML}", input.display());
        }

        let target = File::create(output).with_context(|| format!("Failed to create {}", output.display()))?;
        let mut zip = ZipWriter::new(target);
        let stored: FileOptions<'_, ()> = FileOptions::default().compression_method(CompressionMethod::Stored);
        let deflated: FileOptions<'_, ()> = FileOptions::default().compression_method(CompressionMethod::Deflated);

        let mut sealed = Vec::new();
        for index in 0..archive.len() {
            let mut entry = archive.by_index(index)?;
            if entry.is_dir() {
                continue;
            }

            let name = entry.name().to_string();
            let mut plaintext = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut plaintext)
                .with_context(|| format!("Failed to read {name} from {}", input.display()))?;

            if keep_plain(&name) {
                // mimetype must stay uncompressed for readers that sniff the container
                let options = if name == "mimetype" { stored } else { deflated };
                zip.start_file(name.as_str(), options)?;
                zip.write_all(&plaintext)?;
                continue;
            }

            let mut nonce_bytes = [0u8; 12];
            getrandom::fill(&mut nonce_bytes).map_err(|e| anyhow::anyhow!("Failed to generate nonce: {}", e))?;
            let ciphertext = cipher
                .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_slice())
                .map_err(|e| anyhow::anyhow!("Failed to encrypt {name}: {}", e))?;

            zip.start_file(name.as_str(), stored)?;
            zip.write_all(&nonce_bytes)?;
            zip.write_all(&ciphertext)?;
            sealed.push(name);
        }

        zip.start_file(ENCRYPTION_XML, deflated)?;
        zip.write_all(encryption_xml(&sealed, profile).as_bytes())?;
        zip.finish()?;

        let size = std::fs::metadata(output)
            .with_context(|| format!("Failed to stat {}", output.display()))?
            .len();
        let checksum = hash_file(output)?;
        let content_disposition = output
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        tracing::debug!(
            output = %output.display(),
            sealed = sealed.len(),
            size = size,
            "Container encrypted"
        );

        Ok(EncryptionArtifact {
            path: output.to_path_buf(),
            encryption_key: key.to_vec(),
            size,
            checksum,
            content_disposition,
            content_type: content_type.to_string(),
        })
    }
}

impl EncryptionEngine for ContainerEngine {
    fn encrypt_epub(&self, input: &Path, output: &Path) -> anyhow::Result<EncryptionArtifact> {
        self.encrypt_container(input, output, epub_keeps_plain, None, EPUB_CONTENT_TYPE)
    }

    fn encrypt_webpub(&self, profile: ProtectionProfile, input: &Path, output: &Path) -> anyhow::Result<EncryptionArtifact> {
        self.encrypt_container(input, output, webpub_keeps_plain, Some(profile), LCPDF_CONTENT_TYPE)
    }
}

fn epub_keeps_plain(name: &str) -> bool {
    name == "mimetype" || name.starts_with("META-INF/") || name.ends_with(".opf")
}

fn webpub_keeps_plain(name: &str) -> bool {
    name == "manifest.json" || name == "mimetype" || name.starts_with("META-INF/")
}

/// Generate a 256-bit content key from the OS randomness source.
fn generate_content_key() -> anyhow::Result<[u8; 32]> {
    let mut key = [0u8; 32];
    getrandom::fill(&mut key).map_err(|e| anyhow::anyhow!("Failed to generate content key: {}", e))?;
    Ok(key)
}

fn encryption_xml(sealed: &[String], profile: Option<ProtectionProfile>) -> String {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str("<encryption xmlns=\"urn:oasis:names:tc:opendocument:xmlns:container\" ");
    xml.push_str("xmlns:enc=\"http://www.w3.org/2001/04/xmlenc#\"");
    if let Some(profile) = profile {
        xml.push_str(&format!(" profile=\"{}\"", profile.uri()));
    }
    xml.push_str(">\n");
    for name in sealed {
        xml.push_str(&format!(
            "  <enc:EncryptedData>\n    <enc:EncryptionMethod Algorithm=\"{AES256_GCM_URI}\"/>\n    \
             <enc:CipherData><enc:CipherReference URI=\"{}\"/></enc:CipherData>\n  </enc:EncryptedData>\n",
            escape_xml_attr(name)
        ));
    }
    xml.push_str("</encryption>\n");
    xml
}

fn escape_xml_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Lowercase hex SHA-256 of a file.
pub fn hash_file(path: &Path) -> anyhow::Result<String> {
    let mut file = File::open(path).with_context(|| format!("Failed to open file for hashing: {}", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).with_context(|| format!("Failed to read file for hashing: {}", path.display()))?;
    Ok(format!("{:x}", hasher.finalize()))
}
