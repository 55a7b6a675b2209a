//! Text extraction for uploaded documents.
//!
//! Extraction returns one text block per page. Plain text formats are a single
//! page. Blank pages are dropped.

use std::path::Path;

use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("PDF error: {0}")]
    Pdf(#[from] lopdf::Error),

    #[error("Unsupported file type: {0}")]
    Unsupported(String),

    #[error("Text extraction is not loaded")]
    Unavailable,
}

/// Turns a stored file into page-level text blocks.
pub trait TextExtractor: Send + Sync {
    fn extract(&self, path: &Path) -> Result<Vec<String>, ExtractError>;
}

/// Dispatches on the file extension: PDF through `lopdf`, text and markdown as
/// one lossy UTF-8 block.
#[derive(Debug, Default, Clone, Copy)]
pub struct DocumentExtractor;

impl DocumentExtractor {
    fn pdf_pages(path: &Path) -> Result<Vec<String>, ExtractError> {
        let doc = lopdf::Document::load(path)?;
        let mut pages = Vec::new();
        for page_number in doc.get_pages().keys() {
            let text = doc.extract_text(&[*page_number])?;
            pages.push(text);
        }
        Ok(pages)
    }
}

impl TextExtractor for DocumentExtractor {
    fn extract(&self, path: &Path) -> Result<Vec<String>, ExtractError> {
        let ext = extension_of(path);
        let pages = match ext.as_str() {
            ".pdf" => Self::pdf_pages(path)?,
            ".txt" | ".md" => {
                let bytes = std::fs::read(path)?;
                vec![String::from_utf8_lossy(&bytes).into_owned()]
            }
            _ => return Err(ExtractError::Unsupported(ext)),
        };

        let pages: Vec<String> = pages
            .into_iter()
            .filter(|p| !p.trim().is_empty())
            .collect();
        debug!(path = %path.display(), pages = pages.len(), "extracted text");
        Ok(pages)
    }
}

/// Lowercased extension with its leading dot, or an empty string.
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use lopdf::content::{Content, Operation};
    use lopdf::{Document, Object, Stream, dictionary};

    use super::*;

    /// A minimal single-font PDF with one page per entry of `pages`.
    fn write_pdf(path: &Path, pages: &[&str]) {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });

        let mut kids = Vec::new();
        for text in pages {
            let content = Content {
                operations: vec![
                    Operation::new("BT", vec![]),
                    Operation::new("Tf", vec!["F1".into(), 12.into()]),
                    Operation::new("Td", vec![72.into(), 720.into()]),
                    Operation::new("Tj", vec![Object::string_literal(*text)]),
                    Operation::new("ET", vec![]),
                ],
            };
            let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
            });
            kids.push(page_id.into());
        }

        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
                "Resources" => resources_id,
                "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        doc.save(path).unwrap();
    }

    #[test]
    fn pdf_yields_one_block_per_page() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.pdf");
        write_pdf(&path, &["Quarterly revenue", "Outlook"]);

        let pages = DocumentExtractor.extract(&path).unwrap();
        assert_eq!(pages.len(), 2);
        assert!(pages[0].contains("Quarterly revenue"));
        assert!(pages[1].contains("Outlook"));
    }

    #[test]
    fn corrupt_pdf_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.pdf");
        std::fs::write(&path, b"%PDF-1.5 not really").unwrap();

        assert!(matches!(DocumentExtractor.extract(&path), Err(ExtractError::Pdf(_))));
    }

    #[test]
    fn text_files_are_a_single_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Notes.MD");
        std::fs::write(&path, "# Title\n\nbody").unwrap();

        let pages = DocumentExtractor.extract(&path).unwrap();
        assert_eq!(pages, vec!["# Title\n\nbody".to_string()]);
    }

    #[test]
    fn unknown_extension_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.png");
        std::fs::write(&path, b"\x89PNG").unwrap();

        assert!(matches!(
            DocumentExtractor.extract(&path),
            Err(ExtractError::Unsupported(ext)) if ext == ".png"
        ));
    }

    #[test]
    fn extension_is_normalised() {
        assert_eq!(extension_of(Path::new("a/B.PDF")), ".pdf");
        assert_eq!(extension_of(Path::new("README")), "");
    }
}
