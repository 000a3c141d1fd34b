use epub_builder::{EpubBuilder, EpubContent, EpubVersion, ReferenceType, ZipLibrary};
use thiserror::Error;

use crate::assemble::{DocumentSet, STYLESHEET_CSS, TOC_FILENAME};

pub const GENERATOR: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("EPUB packaging failed: {0}")]
    Builder(String),
}

// The builder's own error type stays behind this seam so the container
// library can be swapped without touching callers.
fn builder_err<E: std::fmt::Display>(e: E) -> PackageError {
    PackageError::Builder(e.to_string())
}

/// Serialize a verified document set into EPUB 3 container bytes. Container
/// and manifest layout belong entirely to the builder library; this only
/// feeds it documents, ordering, and resources.
pub fn write_epub(set: &DocumentSet, author: Option<&str>) -> Result<Vec<u8>, PackageError> {
    let zip = ZipLibrary::new().map_err(builder_err)?;
    let mut builder = EpubBuilder::new(zip).map_err(builder_err)?;
    builder.epub_version(EpubVersion::V30);

    builder
        .metadata("title", set.toc.title.as_str())
        .map_err(builder_err)?;
    if let Some(author) = author {
        builder.metadata("author", author).map_err(builder_err)?;
    }
    builder.metadata("lang", "en").map_err(builder_err)?;
    builder
        .metadata("generator", GENERATOR)
        .map_err(builder_err)?;
    builder
        .stylesheet(STYLESHEET_CSS.as_bytes())
        .map_err(builder_err)?;

    builder
        .add_content(
            EpubContent::new(TOC_FILENAME, set.toc.body.as_bytes())
                .title("Contents")
                .reftype(ReferenceType::Toc),
        )
        .map_err(builder_err)?;
    for chapter in &set.chapters {
        builder
            .add_content(
                EpubContent::new(chapter.filename.as_str(), chapter.body.as_bytes())
                    .title(chapter.title.as_str())
                    .reftype(ReferenceType::Text),
            )
            .map_err(builder_err)?;
    }

    for resource in &set.resources {
        builder
            .add_resource(
                resource.filename.as_str(),
                resource.bytes.as_slice(),
                resource.mime.as_str(),
            )
            .map_err(builder_err)?;
    }

    let mut bytes = Vec::new();
    builder.generate(&mut bytes).map_err(builder_err)?;
    Ok(bytes)
}

// ── Tests ──
