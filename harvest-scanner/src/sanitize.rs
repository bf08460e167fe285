//! Removal of archive-injected markup from captured pages.

use crate::error::{Result, ScanError};
use scraper::Html;
use std::borrow::Cow;

pub const BANNER_START: &str = "<!-- BEGIN WAYBACK TOOLBAR INSERT -->";
pub const BANNER_END: &str = "<!-- END WAYBACK TOOLBAR INSERT -->";
/// Start of the capture trailer comment the archive appends after `</html>`.
pub const ARCHIVE_TRAILER: &str = "<!--\n     FILE ARCHIVED ON";

/// Strip the archive banner and trailer. Captures without the markers (older
/// or malformed ones) pass through unchanged.
pub fn strip_archive_banner(html: &str) -> Cow<'_, str> {
    let mut out: Cow<'_, str> = Cow::Borrowed(html);

    match (out.find(BANNER_START), out.find(BANNER_END)) {
        (Some(start), Some(end)) if start < end => {
            let mut owned = String::with_capacity(out.len());
            owned.push_str(&out[..start]);
            owned.push_str(&out[end + BANNER_END.len()..]);
            out = Cow::Owned(owned);
        }
        (None, Some(end)) => {
            out = Cow::Owned(out[end + BANNER_END.len()..].to_string());
        }
        _ => {}
    }

    if let Some(idx) = out.find(ARCHIVE_TRAILER) {
        out = Cow::Owned(out[..idx].to_string());
    }

    out
}

/// Parse sanitized markup. Bodies that are not markup at all (empty, binary,
/// plain text) are reported as parse failures instead of producing an empty tree.
pub fn parse_markup(html: &str) -> Result<Html> {
    let trimmed = html.trim();
    if trimmed.is_empty() {
        return Err(ScanError::ParseError("empty document".to_string()));
    }
    if trimmed.contains('\0') {
        return Err(ScanError::ParseError("binary content".to_string()));
    }
    if !trimmed.contains('<') {
        return Err(ScanError::ParseError("no markup found".to_string()));
    }

    let document = Html::parse_document(trimmed);
    let has_elements = document
        .root_element()
        .descendants()
        .filter_map(|n| n.value().as_element())
        .any(|e| !matches!(e.name(), "html" | "head" | "body"));
    let has_text = document.root_element().text().any(|t| !t.trim().is_empty());
    if !has_elements && !has_text {
        return Err(ScanError::ParseError("document has no content".to_string()));
    }
    Ok(document)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_banner_between_markers() {
        let html = format!(
            "<html><head><title>Jane</title></head><body>{}<div id=\"wm-ipp\">Archive banner</div>{}<p>Vote Jane</p></body></html>",
            BANNER_START, BANNER_END
        );
        let clean = strip_archive_banner(&html);
        assert!(!clean.contains("Archive banner"));
        assert!(clean.contains("<title>Jane</title>"));
        assert!(clean.contains("Vote Jane"));
    }

    #[test]
    fn test_strips_trailer() {
        let html = format!(
            "<html><body><p>Vote Jane</p></body></html>{}\n     20:00:00 Jun 15, 2022.\n-->",
            ARCHIVE_TRAILER
        );
        let clean = strip_archive_banner(&html);
        assert!(clean.ends_with("</html>"));
    }

    #[test]
    fn test_end_marker_only_keeps_tail() {
        let html = format!("<script>archive()</script>{}<p>Vote Jane</p>", BANNER_END);
        assert_eq!(strip_archive_banner(&html), "<p>Vote Jane</p>");
    }

    #[test]
    fn test_passes_through_without_markers() {
        let html = "<html><body><p>Old capture</p></body></html>";
        let clean = strip_archive_banner(html);
        assert!(matches!(clean, Cow::Borrowed(_)));
        assert_eq!(clean, html);
    }

    #[test]
    fn test_parse_failures() {
        assert!(parse_markup("   ").is_err());
        assert!(parse_markup("just some words").is_err());
        assert!(parse_markup("<html>\0\0</html>").is_err());
        assert!(parse_markup("<html><body></body></html>").is_err());
        assert!(parse_markup("<html><body><p>Hi there</p></body></html>").is_ok());
        assert!(parse_markup("<frameset><frame src=\"a.html\"></frameset>").is_ok());
    }
}
