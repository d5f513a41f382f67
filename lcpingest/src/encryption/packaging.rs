//! Packaging of PDFs as Readium web publications.

use anyhow::{Context, bail};
use serde_json::json;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use zip::{CompressionMethod, ZipWriter, write::FileOptions};

/// Resource name of the PDF inside the package
pub const PUBLICATION_HREF: &str = "publication.pdf";

/// Turns a PDF into a web publication package the encryption engine can protect.
pub trait Packager: Send + Sync {
    fn build_webpub_from_pdf(&self, title: &str, input: &Path, output: &Path) -> anyhow::Result<()>;
}

/// Writes a ZIP package holding a Readium Web Publication Manifest and the PDF itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebPubPackager;

impl WebPubPackager {
    pub fn new() -> Self {
        Self
    }
}

impl Packager for WebPubPackager {
    fn build_webpub_from_pdf(&self, title: &str, input: &Path, output: &Path) -> anyhow::Result<()> {
        let mut pdf = File::open(input).with_context(|| format!("Failed to open {}", input.display()))?;

        let mut magic = [0u8; 5];
        if pdf.read_exact(&mut magic).is_err() || &magic != b"%PDF-" {
            bail!("{} is not a PDF document", input.display());
        }

        let manifest = json!({
            "@context": "https://readium.org/webpub-manifest/context.jsonld",
            "metadata": {
                "@type": "http://schema.org/Book",
                "conformsTo": "https://readium.org/webpub-manifest/profiles/pdf",
                "title": title,
            },
            "readingOrder": [
                { "href": PUBLICATION_HREF, "type": "application/pdf" }
            ],
        });

        let target = File::create(output).with_context(|| format!("Failed to create {}", output.display()))?;
        let mut zip = ZipWriter::new(target);
        let deflated: FileOptions<'_, ()> = FileOptions::default().compression_method(CompressionMethod::Deflated);
        let stored: FileOptions<'_, ()> = FileOptions::default().compression_method(CompressionMethod::Stored);

        zip.start_file("manifest.json", deflated)?;
        zip.write_all(serde_json::to_vec_pretty(&manifest)?.as_slice())?;

        // PDFs are already compressed internally
        zip.start_file(PUBLICATION_HREF, stored)?;
        zip.write_all(&magic)?;
        io::copy(&mut pdf, &mut zip).with_context(|| format!("Failed to copy {} into package", input.display()))?;
        zip.finish()?;

        tracing::debug!(input = %input.display(), output = %output.display(), "Built web publication package");
        Ok(())
    }
}
