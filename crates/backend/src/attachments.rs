//! Attachment-to-text boundary.
//!
//! The classifier only wants plain text; extraction is best-effort, bounded,
//! and never blocks or fails the sync pipeline. Malformed files yield `None`.

/// Upper bound on extracted text fed to the classifier.
pub const EXTRACT_MAX_CHARS: usize = 8_000;

pub trait AttachmentExtractor: Send + Sync {
    /// Convert attachment bytes to plain text, or `None` when the format is
    /// unsupported or the file is malformed. Must not panic or error.
    fn extract(&self, bytes: &[u8], mime_type: &str) -> Option<String>;
}

/// Default extractor: passes text types through and scrapes printable text
/// runs out of binary deck formats (PDF/DOCX). Good enough for keyword
/// matching, which is all the classifier does with it.
pub struct PlainTextExtractor;

impl AttachmentExtractor for PlainTextExtractor {
    fn extract(&self, bytes: &[u8], mime_type: &str) -> Option<String> {
        if bytes.is_empty() {
            return None;
        }

        let text = if mime_type.starts_with("text/") {
            String::from_utf8_lossy(bytes).into_owned()
        } else if matches!(
            mime_type,
            "application/pdf"
                | "application/msword"
                | "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        ) {
            scrape_text_runs(bytes)
        } else {
            return None;
        };

        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }

        Some(truncate_chars(trimmed, EXTRACT_MAX_CHARS))
    }
}

/// Pull runs of printable ASCII out of a binary blob, dropping anything too
/// short to be a word.
fn scrape_text_runs(bytes: &[u8]) -> String {
    let mut out = String::new();
    let mut run = String::new();

    for &b in bytes {
        if (b' '..=b'~').contains(&b) {
            run.push(b as char);
        } else {
            if run.trim().len() >= 4 {
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push_str(run.trim());
            }
            run.clear();
        }
        if out.len() >= EXTRACT_MAX_CHARS {
            break;
        }
    }
    if run.trim().len() >= 4 && out.len() < EXTRACT_MAX_CHARS {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(run.trim());
    }

    out
}

pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_mime_passes_through() {
        let extractor = PlainTextExtractor;
        let text = extractor.extract(b"traction: 40% MoM", "text/plain").unwrap();
        assert_eq!(text, "traction: 40% MoM");
    }

    #[test]
    fn pdf_text_runs_are_scraped() {
        let extractor = PlainTextExtractor;
        let mut bytes = b"%PDF-1.4\x00\x01\x02".to_vec();
        bytes.extend_from_slice(b"raising a seed round");
        bytes.extend_from_slice(&[0xff, 0xfe]);
        let text = extractor.extract(&bytes, "application/pdf").unwrap();
        assert!(text.contains("raising a seed round"));
    }

    #[test]
    fn malformed_and_unknown_return_none() {
        let extractor = PlainTextExtractor;
        assert!(extractor.extract(&[], "application/pdf").is_none());
        assert!(extractor
            .extract(&[0x00, 0x01, 0x02], "application/pdf")
            .is_none());
        assert!(extractor.extract(b"abc", "image/png").is_none());
    }

    #[test]
    fn output_is_bounded() {
        let extractor = PlainTextExtractor;
        let big = "word ".repeat(10_000);
        let text = extractor.extract(big.as_bytes(), "text/plain").unwrap();
        assert!(text.chars().count() <= EXTRACT_MAX_CHARS);
    }
}
