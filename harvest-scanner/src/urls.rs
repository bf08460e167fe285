//! URL handling for archived captures.
//!
//! Archive URLs have the shape `{base}/{timestamp}/{original}`, where
//! `original` is the live-web URL that was captured. Links inside an archived
//! page show up in three forms: already rewritten into archive URLs, absolute
//! live-web URLs, and relative references. Everything here maps those back to
//! an [`ArchiveLocation`] so the crawler can reason about the original domain.

use crate::error::{Result, ScanError};
use url::Url;

const ASSET_EXTENSIONS: &[&str] = &[
    ".pdf", ".jpg", ".jpeg", ".png", ".gif", ".mp3", ".mp4", ".zip",
];

/// Normalize a source URL for grouping and dedup keys.
///
/// Drops the scheme, a leading `www.`, default ports, fragments and trailing
/// slashes, and lowercases the host. Paths and queries are kept.
pub fn normalize_source_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let lower = trimmed.to_ascii_lowercase();
    let without_scheme = if lower.starts_with("https://") {
        &trimmed[8..]
    } else if lower.starts_with("http://") {
        &trimmed[7..]
    } else {
        trimmed
    };

    let without_fragment = without_scheme
        .split_once('#')
        .map(|(before, _)| before)
        .unwrap_or(without_scheme);

    let (host, rest) = match without_fragment.find(['/', '?']) {
        Some(idx) => without_fragment.split_at(idx),
        None => (without_fragment, ""),
    };

    let mut host = host.to_ascii_lowercase();
    for port in [":80", ":443"] {
        if let Some(stripped) = host.strip_suffix(port) {
            host = stripped.to_string();
        }
    }
    let host = host.strip_prefix("www.").unwrap_or(&host);

    let rest = rest.trim_end_matches('/');
    format!("{}{}", host, rest)
}

/// Host without a leading `www.`, lowercased.
pub fn bare_host(url: &Url) -> Option<String> {
    url.host_str().map(|h| {
        let h = h.to_ascii_lowercase();
        h.strip_prefix("www.").map(str::to_string).unwrap_or(h)
    })
}

pub fn is_same_domain(host: &str, base_domain: &str) -> bool {
    host == base_domain || host.ends_with(&format!(".{}", base_domain))
}

pub fn is_excluded(host: &str, excluded: &[String]) -> bool {
    excluded.iter().any(|d| is_same_domain(host, d))
}

/// Binary assets we never treat as pages.
pub fn is_asset(url: &str) -> bool {
    let path = Url::parse(url)
        .map(|u| u.path().to_ascii_lowercase())
        .unwrap_or_else(|_| url.to_ascii_lowercase());
    ASSET_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

/// Where a page sits inside the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveLocation {
    pub timestamp: String,
    pub original: String,
}

impl ArchiveLocation {
    pub fn original_url(&self) -> Option<Url> {
        Url::parse(&self.original).ok()
    }

    pub fn original_host(&self) -> Option<String> {
        self.original_url().as_ref().and_then(bare_host)
    }

    /// Key used to avoid fetching the same page twice within a snapshot.
    pub fn visit_key(&self) -> String {
        normalize_source_url(&self.original)
    }
}

/// The archive's page-serving prefix, e.g. `https://web.archive.org/web`.
#[derive(Debug, Clone)]
pub struct ArchiveBase {
    url: Url,
}

impl ArchiveBase {
    pub fn parse(base: &str) -> Result<Self> {
        let url = Url::parse(base.trim_end_matches('/'))
            .map_err(|e| ScanError::InvalidUrl(format!("{}: {}", base, e)))?;
        if url.host_str().is_none() {
            return Err(ScanError::InvalidUrl(format!("{}: missing host", base)));
        }
        Ok(Self { url })
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str().trim_end_matches('/')
    }

    pub fn snapshot_url(&self, timestamp: &str, original: &str) -> String {
        format!("{}/{}/{}", self.as_str(), timestamp, original)
    }

    pub fn location_url(&self, location: &ArchiveLocation) -> String {
        self.snapshot_url(&location.timestamp, &location.original)
    }

    /// Split an archive URL into timestamp and original URL.
    /// Returns `None` for anything not served under this prefix.
    pub fn locate(&self, candidate: &Url) -> Option<ArchiveLocation> {
        if candidate.host_str() != self.url.host_str() || candidate.port() != self.url.port() {
            return None;
        }

        let prefix = format!("{}/", self.url.path().trim_end_matches('/'));
        let full = candidate.as_str();
        let host_end = full.find("://").map(|i| i + 3)?;
        let path_start = host_end + full[host_end..].find('/')?;
        let path_and_rest = &full[path_start..];
        let rest = path_and_rest.strip_prefix(&prefix)?;

        let (timestamp, original) = rest.split_once('/')?;
        if !timestamp.chars().next().is_some_and(|c| c.is_ascii_digit()) || original.is_empty() {
            return None;
        }

        Some(ArchiveLocation {
            timestamp: timestamp.to_string(),
            original: repair_scheme(original),
        })
    }

    /// Resolve a link or frame reference found on `page_url` into an archive
    /// location. Relative references resolve against the archived page;
    /// absolute live-web references are pinned to the page's capture time.
    pub fn resolve_reference(
        &self,
        page_url: &Url,
        page: &ArchiveLocation,
        href: &str,
    ) -> Option<ArchiveLocation> {
        let href = href.trim();
        let lower = href.to_ascii_lowercase();
        if href.is_empty()
            || href.starts_with('#')
            || lower.starts_with("javascript:")
            || lower.starts_with("mailto:")
            || lower.starts_with("tel:")
            || lower.starts_with("data:")
            || lower.starts_with("about:")
        {
            return None;
        }

        let mut absolute = page_url.join(href).ok()?;
        absolute.set_fragment(None);

        if let Some(location) = self.locate(&absolute) {
            return Some(location);
        }

        // Archive-hosted but outside the snapshot prefix (static assets, banners).
        if absolute.host_str() == self.url.host_str() {
            return None;
        }

        match absolute.scheme() {
            "http" | "https" => Some(ArchiveLocation {
                timestamp: page.timestamp.clone(),
                original: absolute.to_string(),
            }),
            _ => None,
        }
    }
}

/// Archive paths sometimes collapse `http://` to `http:/`, or drop the scheme.
fn repair_scheme(original: &str) -> String {
    for scheme in ["https:", "http:"] {
        if let Some(rest) = original.strip_prefix(scheme) {
            let rest = rest.trim_start_matches('/');
            return format!("{}//{}", scheme, rest);
        }
    }
    format!("http://{}", original)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ArchiveBase {
        ArchiveBase::parse("https://web.archive.org/web").unwrap()
    }

    #[test]
    fn test_normalize_source_url() {
        assert_eq!(normalize_source_url("https://www.JaneDoe2022.com/"), "janedoe2022.com");
        assert_eq!(normalize_source_url("janedoe2022.com"), "janedoe2022.com");
        assert_eq!(
            normalize_source_url("http://janedoe2022.com:80/about/#team"),
            "janedoe2022.com/about"
        );
        assert_eq!(
            normalize_source_url("http://janedoe2022.com/?page=2"),
            "janedoe2022.com/?page=2"
        );
    }

    #[test]
    fn test_locate_archive_url() {
        let url = Url::parse("https://web.archive.org/web/20220615120000/https://janedoe2022.com/about").unwrap();
        let loc = base().locate(&url).unwrap();
        assert_eq!(loc.timestamp, "20220615120000");
        assert_eq!(loc.original, "https://janedoe2022.com/about");
        assert_eq!(loc.original_host().as_deref(), Some("janedoe2022.com"));
    }

    #[test]
    fn test_locate_repairs_collapsed_scheme() {
        let url = Url::parse("https://web.archive.org/web/2022id_/http:/janedoe2022.com/").unwrap();
        let loc = base().locate(&url).unwrap();
        assert_eq!(loc.timestamp, "2022id_");
        assert_eq!(loc.original, "http://janedoe2022.com/");
    }

    #[test]
    fn test_locate_rejects_foreign_hosts() {
        let url = Url::parse("https://example.com/web/20220615/https://janedoe2022.com/").unwrap();
        assert!(base().locate(&url).is_none());
        let banner = Url::parse("https://web.archive.org/static/js/banner.js").unwrap();
        assert!(base().locate(&banner).is_none());
    }

    #[test]
    fn test_resolve_reference_forms() {
        let b = base();
        let page_url = Url::parse("https://web.archive.org/web/20220615120000/https://janedoe2022.com/issues/").unwrap();
        let page = b.locate(&page_url).unwrap();

        let rewritten = b
            .resolve_reference(&page_url, &page, "/web/20220610000000/https://janedoe2022.com/donate")
            .unwrap();
        assert_eq!(rewritten.timestamp, "20220610000000");
        assert_eq!(rewritten.original, "https://janedoe2022.com/donate");

        let relative = b.resolve_reference(&page_url, &page, "health.html#top").unwrap();
        assert_eq!(relative.original, "https://janedoe2022.com/issues/health.html");
        assert_eq!(relative.timestamp, "20220615120000");

        let absolute = b
            .resolve_reference(&page_url, &page, "https://www.janedoe2022.com/about")
            .unwrap();
        assert_eq!(absolute.original, "https://www.janedoe2022.com/about");
        assert_eq!(absolute.timestamp, "20220615120000");

        assert!(b.resolve_reference(&page_url, &page, "mailto:jane@example.com").is_none());
        assert!(b.resolve_reference(&page_url, &page, "#section").is_none());
        assert!(b.resolve_reference(&page_url, &page, "/static/css/banner.css").is_none());
    }

    #[test]
    fn test_domain_helpers() {
        assert!(is_same_domain("janedoe2022.com", "janedoe2022.com"));
        assert!(is_same_domain("vote.janedoe2022.com", "janedoe2022.com"));
        assert!(!is_same_domain("notjanedoe2022.com", "janedoe2022.com"));
        let excluded = vec!["facebook.com".to_string()];
        assert!(is_excluded("m.facebook.com", &excluded));
        assert!(!is_excluded("janedoe2022.com", &excluded));
        assert!(is_asset("https://janedoe2022.com/flyer.PDF"));
        assert!(!is_asset("https://janedoe2022.com/about"));
    }
}
