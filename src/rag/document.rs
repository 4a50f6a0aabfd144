//! Source documents and upload decoding.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::errors::RagError;

/// Extensions accepted by [`Document::from_upload`].
pub const SUPPORTED_EXTENSIONS: [&str; 8] =
    ["txt", "md", "markdown", "csv", "json", "html", "htm", "pdf"];

/// Separator placed between the pages of a paginated document.
const PAGE_BREAK: &str = "\n\n";

/// Stable identifier derived from the document origin.
///
/// Two uploads with the same origin share an id, so the newer upload
/// supersedes the older one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn from_origin(origin: &str) -> Self {
        let digest = Sha256::digest(origin.trim().as_bytes());
        DocumentId(hex::encode(&digest[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for DocumentId {
    fn from(value: String) -> Self {
        DocumentId(value)
    }
}

impl From<&str> for DocumentId {
    fn from(value: &str) -> Self {
        DocumentId(value.to_string())
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// First character of one page inside [`Document::text`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSpan {
    /// 1-based page number in the source file
    pub number: u32,
    pub start: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    /// Filename or URL the text came from
    pub origin: String,
    pub text: String,
    pub ingested_at: DateTime<Utc>,
    pub content_sha256: String,
    /// Pages that contributed text, ascending by `start`. Empty for
    /// unpaginated sources.
    #[serde(default)]
    pub pages: Vec<PageSpan>,
    #[serde(default)]
    pub total_pages: Option<u32>,
}

impl Document {
    pub fn new(origin: impl Into<String>, text: impl Into<String>) -> Self {
        let origin = origin.into();
        let text = text.into();
        Self {
            id: DocumentId::from_origin(&origin),
            content_sha256: sha256_hex(&text),
            origin,
            text,
            ingested_at: Utc::now(),
            pages: Vec::new(),
            total_pages: None,
        }
    }

    /// Joins page texts with a blank line, remembering where each page
    /// starts. Pages without text are skipped but still counted.
    pub fn from_pages(
        origin: impl Into<String>,
        pages: impl IntoIterator<Item = (u32, String)>,
        total_pages: u32,
    ) -> Self {
        let mut text = String::new();
        let mut spans = Vec::new();
        let mut chars = 0;
        for (number, page) in pages {
            let page = page.trim();
            if page.is_empty() {
                continue;
            }
            if !text.is_empty() {
                text.push_str(PAGE_BREAK);
                chars += PAGE_BREAK.chars().count();
            }
            spans.push(PageSpan {
                number,
                start: chars,
            });
            text.push_str(page);
            chars += page.chars().count();
        }

        let mut document = Self::new(origin, text);
        document.pages = spans;
        document.total_pages = Some(total_pages);
        document
    }

    /// Page holding the character at `offset`, if the document is paginated.
    pub fn page_at(&self, offset: usize) -> Option<u32> {
        let after = self.pages.partition_point(|page| page.start <= offset);
        after.checked_sub(1).map(|idx| self.pages[idx].number)
    }

    /// Decodes uploaded bytes according to the filename extension.
    ///
    /// HTML is reduced to its visible text and PDFs are read page by page.
    /// Other binary input is rejected.
    pub fn from_upload(filename: &str, bytes: &[u8]) -> Result<Self, RagError> {
        let filename = filename.trim();
        if filename.is_empty() {
            return Err(RagError::InvalidArgument(
                "filename cannot be empty".to_string(),
            ));
        }

        let extension = Path::new(filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_default();
        if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
            return Err(RagError::InvalidArgument(format!(
                "unsupported document type '{}' for {}",
                extension, filename
            )));
        }

        if extension == "pdf" {
            return Self::from_pdf(filename, bytes);
        }

        let raw = std::str::from_utf8(bytes).map_err(|err| {
            RagError::InvalidArgument(format!("{} is not valid UTF-8: {}", filename, err))
        })?;
        let raw = raw.strip_prefix('\u{feff}').unwrap_or(raw);

        let text = match extension.as_str() {
            "html" | "htm" => strip_html_tags(raw),
            _ => raw.replace("\r\n", "\n"),
        };

        if text.trim().is_empty() {
            return Err(RagError::InvalidArgument(format!(
                "{} contains no text",
                filename
            )));
        }

        Ok(Self::new(filename, text))
    }

    fn from_pdf(filename: &str, bytes: &[u8]) -> Result<Self, RagError> {
        let pdf = lopdf::Document::load_mem(bytes).map_err(|err| {
            RagError::InvalidArgument(format!("{} is not a readable PDF: {}", filename, err))
        })?;

        let page_numbers: Vec<u32> = pdf.get_pages().keys().copied().collect();
        let total_pages = page_numbers.len() as u32;
        tracing::info!("Processing PDF {} with {} pages", filename, total_pages);

        let pages = page_numbers
            .into_iter()
            .filter_map(|number| match pdf.extract_text(&[number]) {
                Ok(text) => {
                    if text.trim().is_empty() {
                        tracing::warn!("Empty text on page {} of {}", number, filename);
                    }
                    Some((number, text))
                }
                Err(err) => {
                    tracing::warn!("Skipping page {} of {}: {}", number, filename, err);
                    None
                }
            })
            .collect::<Vec<_>>();

        let document = Self::from_pages(filename, pages, total_pages);
        if document.text.trim().is_empty() {
            return Err(RagError::InvalidArgument(format!(
                "{} contains no extractable text",
                filename
            )));
        }
        Ok(document)
    }
}

pub(crate) fn sha256_hex(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Drops tags, scripts and styles, keeping non-empty text lines.
pub fn strip_html_tags(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    let mut skip_until: Option<&str> = None;

    let lower = html.to_ascii_lowercase();
    let mut i = 0;
    while i < html.len() {
        let rest = &lower[i..];

        if let Some(close) = skip_until {
            if rest.starts_with(close) {
                skip_until = None;
                i += close.len();
            } else {
                i += next_char_len(html, i);
            }
            continue;
        }

        if rest.starts_with("<script") {
            skip_until = Some("</script>");
            continue;
        }
        if rest.starts_with("<style") {
            skip_until = Some("</style>");
            continue;
        }

        let len = next_char_len(html, i);
        let c = &html[i..i + len];
        match c {
            "<" => in_tag = true,
            ">" => {
                if in_tag {
                    result.push('\n');
                }
                in_tag = false;
            }
            _ if !in_tag => result.push_str(c),
            _ => {}
        }
        i += len;
    }

    result
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn next_char_len(text: &str, at: usize) -> usize {
    text[at..].chars().next().map(char::len_utf8).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_origin_yields_same_id() {
        let first = Document::new("handbook.txt", "v1");
        let second = Document::new("handbook.txt", "v2");
        let other = Document::new("policies.txt", "v1");

        assert_eq!(first.id, second.id);
        assert_ne!(first.id, other.id);
        assert_ne!(first.content_sha256, second.content_sha256);
    }

    #[test]
    fn from_upload_decodes_text_and_normalizes_newlines() {
        let doc = Document::from_upload("notes.md", b"line one\r\nline two").unwrap();
        assert_eq!(doc.text, "line one\nline two");
        assert_eq!(doc.origin, "notes.md");
    }

    #[test]
    fn from_upload_rejects_unsupported_and_binary_input() {
        assert!(matches!(
            Document::from_upload("report.pdf", b"%PDF-1.7 truncated"),
            Err(RagError::InvalidArgument(_))
        ));
        assert!(matches!(
            Document::from_upload("image.png", b"\x89PNG"),
            Err(RagError::InvalidArgument(_))
        ));
        assert!(matches!(
            Document::from_upload("data.txt", &[0xff, 0xfe, 0x00]),
            Err(RagError::InvalidArgument(_))
        ));
        assert!(matches!(
            Document::from_upload("empty.txt", b"  \n "),
            Err(RagError::InvalidArgument(_))
        ));
    }

    #[test]
    fn html_stripping() {
        let html = r#"
            <html>
            <head><script>var x = 1;</script><style>p { color: red; }</style></head>
            <body>
                <h1>Hello</h1>
                <p>Wörld</p>
            </body>
            </html>
        "#;

        let text = strip_html_tags(html);
        assert_eq!(text, "Hello\nWörld");
    }

    #[test]
    fn html_upload_is_stripped() {
        let doc = Document::from_upload("page.HTML", b"<p>Vacation policy</p>").unwrap();
        assert_eq!(doc.text, "Vacation policy");
    }

    /// One Courier text line per page; an empty string gives a blank page.
    fn pdf_with_pages(pages: &[&str]) -> Vec<u8> {
        use lopdf::content::{Content, Operation};
        use lopdf::{dictionary, Object, Stream};

        let mut pdf = lopdf::Document::with_version("1.5");
        let pages_id = pdf.new_object_id();
        let font_id = pdf.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
        });
        let resources_id = pdf.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });

        let mut kids = Vec::new();
        for text in pages {
            let mut operations = Vec::new();
            if !text.is_empty() {
                operations = vec![
                    Operation::new("BT", vec![]),
                    Operation::new("Tf", vec!["F1".into(), 12.into()]),
                    Operation::new("Td", vec![72.into(), 720.into()]),
                    Operation::new("Tj", vec![Object::string_literal(*text)]),
                    Operation::new("ET", vec![]),
                ];
            }
            let content = Content { operations };
            let content_id = pdf.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
            let page_id = pdf.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
            });
            kids.push(Object::from(page_id));
        }

        let count = kids.len() as i64;
        pdf.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
                "Resources" => resources_id,
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            }),
        );
        let catalog_id = pdf.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        pdf.trailer.set("Root", catalog_id);

        let mut bytes = Vec::new();
        pdf.save_to(&mut bytes).unwrap();
        bytes
    }

    #[test]
    fn pdf_upload_is_read_page_by_page() {
        let bytes = pdf_with_pages(&[
            "Vacation policy: 15 days per year.",
            "",
            "Parking permits are issued by facilities.",
        ]);
        let doc = Document::from_upload("handbook.PDF", &bytes).unwrap();

        assert_eq!(doc.total_pages, Some(3));
        let numbers: Vec<u32> = doc.pages.iter().map(|p| p.number).collect();
        assert_eq!(numbers, vec![1, 3]);
        assert!(doc.text.contains("15 days"));
        assert!(doc.text.contains("Parking permits"));

        let parking = doc.text.find("Parking").unwrap();
        let parking_chars = doc.text[..parking].chars().count();
        assert_eq!(doc.page_at(0), Some(1));
        assert_eq!(doc.page_at(parking_chars), Some(3));
    }

    #[test]
    fn pdf_without_text_is_rejected() {
        let bytes = pdf_with_pages(&["", ""]);
        assert!(matches!(
            Document::from_upload("scan.pdf", &bytes),
            Err(RagError::InvalidArgument(_))
        ));
    }

    #[test]
    fn from_pages_tracks_page_offsets() {
        let doc = Document::from_pages(
            "a.pdf",
            vec![(1, " One ".to_string()), (2, String::new()), (3, "Three".to_string())],
            3,
        );
        assert_eq!(doc.text, "One\n\nThree");
        assert_eq!(
            doc.pages,
            vec![
                PageSpan { number: 1, start: 0 },
                PageSpan { number: 3, start: 5 },
            ]
        );
        assert_eq!(doc.page_at(4), Some(1));
        assert_eq!(doc.page_at(5), Some(3));
        assert_eq!(Document::new("a.txt", "x").page_at(0), None);
    }
}
