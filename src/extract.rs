//! Multi-format text extraction with OCR fallback.
//!
//! Strategies are tried in a fixed priority order for each file type. A
//! structured extractor (PDF, DOCX, plain text) runs first; when it fails
//! or yields near-empty output for a likely-scanned document, the bytes
//! fall through to the configured [`OcrProvider`]. The first strategy
//! producing usable text wins and is recorded in
//! [`ExtractedText::method`] for diagnostics.

use anyhow::Result;
use async_trait::async_trait;
use std::io::Read;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ExtractionConfig;
use crate::error::ExtractionError;

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb
/// protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Output of one successful extraction: page texts in reading order plus
/// the name of the strategy that produced them.
#[derive(Debug, Clone)]
pub struct ExtractedText {
    /// One entry per source page. Formats without page structure yield a
    /// single entry.
    pub pages: Vec<String>,
    /// Strategy that produced the text: `"pdf"`, `"docx"`, `"plain"`, or
    /// `"ocr"`.
    pub method: String,
}

impl ExtractedText {
    pub fn total_chars(&self) -> usize {
        self.pages.iter().map(|p| p.chars().count()).sum()
    }

    fn is_near_empty(&self, min_chars_per_page: usize) -> bool {
        self.total_chars() < min_chars_per_page * self.pages.len().max(1)
    }
}

/// OCR backend used when structured extraction fails or produces
/// near-empty output (scanned documents).
#[async_trait]
pub trait OcrProvider: Send + Sync {
    /// Recognize text from raw document bytes, one string per page.
    async fn recognize(&self, bytes: &[u8]) -> Result<Vec<String>>;
}

/// OCR provider that is never available; used when no OCR endpoint is
/// configured.
pub struct DisabledOcr;

#[async_trait]
impl OcrProvider for DisabledOcr {
    async fn recognize(&self, _bytes: &[u8]) -> Result<Vec<String>> {
        anyhow::bail!("OCR provider is disabled")
    }
}

/// OCR via an HTTP sidecar: `POST <url>` with the raw bytes, expecting a
/// JSON body of `{"pages": ["...", ...]}`.
///
/// When `ocr_cleanup` is set the request asks the sidecar to run its
/// image-cleanup pass (deskew, denoise) before recognition. Recognized
/// text is always whitespace-normalized on the way out.
pub struct HttpOcrProvider {
    url: String,
    cleanup: bool,
    timeout_secs: u64,
}

impl HttpOcrProvider {
    pub fn new(config: &ExtractionConfig) -> Self {
        Self {
            url: config.ocr_url.clone(),
            cleanup: config.ocr_cleanup,
            timeout_secs: config.timeout_secs,
        }
    }

    fn endpoint(&self) -> String {
        if self.cleanup {
            format!("{}?cleanup=true", self.url)
        } else {
            self.url.clone()
        }
    }
}

#[async_trait]
impl OcrProvider for HttpOcrProvider {
    async fn recognize(&self, bytes: &[u8]) -> Result<Vec<String>> {
        if self.url.is_empty() {
            anyhow::bail!("No OCR endpoint configured");
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()?;

        let response = client
            .post(self.endpoint())
            .header("Content-Type", "application/octet-stream")
            .body(bytes.to_vec())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            anyhow::bail!("OCR endpoint error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        let pages = json
            .get("pages")
            .and_then(|p| p.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid OCR response: missing pages array"))?;

        let mut out = Vec::with_capacity(pages.len());
        for page in pages {
            out.push(collapse_whitespace(page.as_str().unwrap_or_default()));
        }
        Ok(out)
    }
}

/// OCR output tends to carry stray runs of spaces and blank lines.
fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_space = false;
    for ch in text.chars() {
        if ch == '\n' {
            out.push('\n');
            last_was_space = false;
        } else if ch.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(ch);
            last_was_space = false;
        }
    }
    out.trim().to_string()
}

/// Extract text from raw bytes, trying strategies in priority order.
///
/// `type_hint` is the caller-supplied file type: `"pdf"`, `"docx"`,
/// `"txt"`, or `"md"`. Unknown hints fail with
/// [`ExtractionError::UnsupportedType`] before any bytes are touched.
pub async fn extract_document(
    bytes: &[u8],
    type_hint: &str,
    ocr: &dyn OcrProvider,
    config: &ExtractionConfig,
) -> Result<ExtractedText, ExtractionError> {
    let structured: Result<ExtractedText, ExtractionError> = match type_hint {
        "pdf" => extract_pdf(bytes),
        "docx" => extract_docx(bytes),
        "txt" | "md" => extract_plain(bytes),
        other => return Err(ExtractionError::UnsupportedType(other.to_string())),
    };

    match structured {
        Ok(text) if !text.is_near_empty(config.min_chars_per_page) => {
            debug!(method = %text.method, chars = text.total_chars(), "extraction succeeded");
            Ok(text)
        }
        Ok(text) => {
            // Likely a scanned document; structured output is unusable
            debug!(
                method = %text.method,
                chars = text.total_chars(),
                "near-empty extraction, trying OCR"
            );
            ocr_fallback(bytes, ocr).await
        }
        Err(e) => {
            warn!(error = %e, "structured extraction failed, trying OCR");
            ocr_fallback(bytes, ocr).await
        }
    }
}

async fn ocr_fallback(
    bytes: &[u8],
    ocr: &dyn OcrProvider,
) -> Result<ExtractedText, ExtractionError> {
    match ocr.recognize(bytes).await {
        Ok(pages) if pages.iter().any(|p| !p.trim().is_empty()) => Ok(ExtractedText {
            pages,
            method: "ocr".to_string(),
        }),
        Ok(_) => Err(ExtractionError::EmptyOutput),
        Err(e) => {
            warn!(error = %e, "OCR fallback failed");
            Err(ExtractionError::EmptyOutput)
        }
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<ExtractedText, ExtractionError> {
    let text = pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| ExtractionError::Corrupt(format!("PDF: {}", e)))?;

    // Page breaks surface as form feeds when the extractor emits them;
    // otherwise the whole document counts as one page.
    let pages: Vec<String> = if text.contains('\u{c}') {
        text.split('\u{c}').map(|p| p.to_string()).collect()
    } else {
        vec![text]
    };

    Ok(ExtractedText {
        pages,
        method: "pdf".to_string(),
    })
}

fn extract_docx(bytes: &[u8]) -> Result<ExtractedText, ExtractionError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractionError::Corrupt(format!("DOCX: {}", e)))?;

    let mut doc_xml = Vec::new();
    let mut found = false;
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|e| ExtractionError::Corrupt(format!("DOCX: {}", e)))?;
        if entry.name() == "word/document.xml" {
            entry
                .take(MAX_XML_ENTRY_BYTES)
                .read_to_end(&mut doc_xml)
                .map_err(|e| ExtractionError::Corrupt(format!("DOCX: {}", e)))?;
            if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
                return Err(ExtractionError::Corrupt(
                    "word/document.xml exceeds size limit".to_string(),
                ));
            }
            found = true;
            break;
        }
    }
    if !found {
        return Err(ExtractionError::Corrupt(
            "word/document.xml not found".to_string(),
        ));
    }

    let text = extract_w_t_elements(&doc_xml)?;
    Ok(ExtractedText {
        pages: vec![text],
        method: "docx".to_string(),
    })
}

/// Collect the text content of `w:t` elements, inserting paragraph breaks
/// at `w:p` boundaries so the chunker can split on them.
fn extract_w_t_elements(xml: &[u8]) -> Result<String, ExtractionError> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    if let Ok(quick_xml::events::Event::Text(te)) = reader.read_event_into(&mut buf)
                    {
                        out.push_str(te.unescape().unwrap_or_default().as_ref());
                    }
                }
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"p" && !out.ends_with("\n\n") && !out.is_empty() {
                    out.push_str("\n\n");
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ExtractionError::Corrupt(format!("DOCX XML: {}", e))),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}

fn extract_plain(bytes: &[u8]) -> Result<ExtractedText, ExtractionError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| ExtractionError::Corrupt(format!("invalid UTF-8: {}", e)))?;
    Ok(ExtractedText {
        pages: vec![text.to_string()],
        method: "plain".to_string(),
    })
}
