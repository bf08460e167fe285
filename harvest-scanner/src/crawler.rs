use crate::error::{Result, ScanError};
use crate::extractor::TextExtractor;
use crate::result::{PageKind, PageRecord, PageSkip, SkipReason, SnapshotCrawl, SnapshotDescriptor};
use crate::sanitize::{parse_markup, strip_archive_banner};
use crate::transport::{FetchedPage, Transport};
use crate::urls::{ArchiveBase, ArchiveLocation, is_asset, is_excluded, is_same_domain};
use scraper::Selector;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};
use url::Url;

pub type ProgressCallback = Arc<dyn Fn(PageKind, &str) + Send + Sync>;

static FRAME_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("frame[src], iframe[src]").expect("static selector"));
static LINK_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href], area[href]").expect("static selector"));

pub const DEFAULT_EXCLUDED_DOMAINS: &[&str] = &[
    "twitter.com",
    "x.com",
    "facebook.com",
    "instagram.com",
    "youtube.com",
    "linkedin.com",
    "tiktok.com",
    "flickr.com",
    "actblue.com",
    "winred.com",
];

/// What one fetched page contributes before it is folded into the snapshot.
struct PageAnalysis {
    body: String,
    chunks: Vec<String>,
    frames: Vec<ArchiveLocation>,
    links: Vec<ArchiveLocation>,
    assets: Vec<ArchiveLocation>,
}

/// Per-snapshot crawl state. Lives for one `crawl_snapshot` call.
struct CrawlState {
    root_domain: String,
    visited: HashSet<String>,
    seen_text: HashSet<String>,
    crawl: SnapshotCrawl,
}

impl CrawlState {
    /// Claim a page for fetching. False if it was already claimed.
    fn claim(&mut self, location: &ArchiveLocation) -> bool {
        self.visited.insert(location.visit_key())
    }

    fn skip(&mut self, url: String, kind: PageKind, depth: usize, reason: SkipReason) {
        debug!("Skipping {} {} ({})", kind.as_str(), url, reason);
        self.crawl.skipped.push(PageSkip {
            url,
            kind,
            depth,
            reason,
        });
    }
}

/// Crawls one archived snapshot: the root page, its frames, and same-site
/// subpages, all through the caller's rate-limited transport.
pub struct SnapshotCrawler {
    archive_base: ArchiveBase,
    extractor: TextExtractor,
    max_frame_depth: usize,
    max_link_depth: usize,
    max_subpages: usize,
    min_page_chars: usize,
    exclude_domains: Vec<String>,
    progress_callback: Option<ProgressCallback>,
}

impl SnapshotCrawler {
    pub fn new(archive_base: ArchiveBase) -> Self {
        Self {
            archive_base,
            extractor: TextExtractor::default(),
            max_frame_depth: 3,
            max_link_depth: 1,
            max_subpages: 50,
            min_page_chars: 25,
            exclude_domains: DEFAULT_EXCLUDED_DOMAINS
                .iter()
                .map(|d| d.to_string())
                .collect(),
            progress_callback: None,
        }
    }

    pub fn with_extractor(mut self, extractor: TextExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_max_frame_depth(mut self, depth: usize) -> Self {
        self.max_frame_depth = depth;
        self
    }

    pub fn with_max_link_depth(mut self, depth: usize) -> Self {
        self.max_link_depth = depth;
        self
    }

    pub fn with_max_subpages(mut self, max: usize) -> Self {
        self.max_subpages = max;
        self
    }

    pub fn with_min_page_chars(mut self, chars: usize) -> Self {
        self.min_page_chars = chars;
        self
    }

    pub fn with_exclude_domains(mut self, domains: Vec<String>) -> Self {
        self.exclude_domains = domains
            .into_iter()
            .map(|d| d.trim().trim_start_matches("www.").to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        self
    }

    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    pub fn extractor(&self) -> &TextExtractor {
        &self.extractor
    }

    /// Crawl one snapshot. Only a failure to fetch the root page is an error;
    /// problems with frames and subpages are recorded as skips.
    pub async fn crawl_snapshot(
        &self,
        transport: &mut Transport,
        descriptor: &SnapshotDescriptor,
    ) -> Result<SnapshotCrawl> {
        let root_url = Url::parse(&descriptor.archive_url)
            .map_err(|e| ScanError::InvalidUrl(format!("{}: {}", descriptor.archive_url, e)))?;
        let root_location = self
            .archive_base
            .locate(&root_url)
            .unwrap_or_else(|| ArchiveLocation {
                timestamp: descriptor.timestamp.clone(),
                original: descriptor.original_url.clone(),
            });
        let root_domain = root_location.original_host().ok_or_else(|| {
            ScanError::InvalidUrl(format!("no host in {}", descriptor.original_url))
        })?;

        let mut state = CrawlState {
            root_domain,
            visited: HashSet::new(),
            seen_text: HashSet::new(),
            crawl: SnapshotCrawl::default(),
        };
        state.claim(&root_location);

        self.report(PageKind::Root, &descriptor.archive_url);
        let fetched = transport.get(&descriptor.archive_url).await?;
        state.crawl.requests += 1;

        let root_links = match self.analyze(fetched, &root_location, &state.root_domain, true) {
            Ok(analysis) => {
                let PageAnalysis {
                    body,
                    chunks,
                    frames,
                    links,
                    assets,
                } = analysis;
                self.record(&mut state, descriptor.archive_url.clone(), PageKind::Root, 0, body, chunks);
                self.skip_assets(&mut state, assets, 1);
                self.resolve_frames(transport, &mut state, frames, 0).await?;
                links
            }
            Err(e) => {
                state.skip(
                    descriptor.archive_url.clone(),
                    PageKind::Root,
                    0,
                    SkipReason::ParseFailed(e.to_string()),
                );
                Vec::new()
            }
        };

        self.follow_links(transport, &mut state, root_links).await?;

        let crawl = state.crawl;
        info!(
            "Snapshot {} done: {} page(s) kept, {} skipped, {} request(s)",
            descriptor.archive_url,
            crawl.pages.len(),
            crawl.skipped.len(),
            crawl.requests
        );
        Ok(crawl)
    }

    /// Breadth-first walk over same-site links, bounded by link depth and
    /// total subpage count.
    async fn follow_links(
        &self,
        transport: &mut Transport,
        state: &mut CrawlState,
        root_links: Vec<ArchiveLocation>,
    ) -> Result<()> {
        let mut queue: VecDeque<(ArchiveLocation, usize)> = VecDeque::new();
        if self.max_link_depth > 0 {
            for link in root_links {
                if state.claim(&link) {
                    queue.push_back((link, 1));
                }
            }
        }

        let mut subpages = 0;
        while let Some((location, depth)) = queue.pop_front() {
            if subpages >= self.max_subpages {
                debug!(
                    "Subpage limit {} reached; {} link(s) left unvisited",
                    self.max_subpages,
                    queue.len() + 1
                );
                break;
            }
            subpages += 1;

            let url = self.archive_base.location_url(&location);
            let Some(fetched) = self.fetch_soft(transport, state, &url, PageKind::Subpage, depth).await? else {
                continue;
            };

            let collect_links = depth < self.max_link_depth;
            match self.analyze(fetched, &location, &state.root_domain, collect_links) {
                Ok(analysis) => {
                    let PageAnalysis {
                        body,
                        chunks,
                        frames,
                        links,
                        assets,
                    } = analysis;
                    self.record(state, url, PageKind::Subpage, depth, body, chunks);
                    self.skip_assets(state, assets, depth + 1);
                    self.resolve_frames(transport, state, frames, depth).await?;
                    for link in links {
                        if state.claim(&link) {
                            queue.push_back((link, depth + 1));
                        }
                    }
                }
                Err(e) => state.skip(url, PageKind::Subpage, depth, SkipReason::ParseFailed(e.to_string())),
            }
        }
        Ok(())
    }

    /// Depth-first frame resolution below a page at `page_depth`. Nesting is
    /// bounded by `max_frame_depth` counted from that page.
    async fn resolve_frames(
        &self,
        transport: &mut Transport,
        state: &mut CrawlState,
        frames: Vec<ArchiveLocation>,
        page_depth: usize,
    ) -> Result<()> {
        let mut stack: Vec<(ArchiveLocation, usize)> =
            frames.into_iter().rev().map(|f| (f, 1)).collect();

        while let Some((location, nesting)) = stack.pop() {
            let depth = page_depth + nesting;
            let url = self.archive_base.location_url(&location);
            if nesting > self.max_frame_depth {
                debug!("Frame nesting limit reached at {}", url);
                continue;
            }
            if !state.claim(&location) {
                continue;
            }

            let Some(fetched) = self.fetch_soft(transport, state, &url, PageKind::Frame, depth).await? else {
                continue;
            };

            match self.analyze(fetched, &location, &state.root_domain, false) {
                Ok(analysis) => {
                    let PageAnalysis {
                        body,
                        chunks,
                        frames,
                        ..
                    } = analysis;
                    self.record(state, url, PageKind::Frame, depth, body, chunks);
                    for child in frames.into_iter().rev() {
                        stack.push((child, nesting + 1));
                    }
                }
                Err(e) => state.skip(url, PageKind::Frame, depth, SkipReason::ParseFailed(e.to_string())),
            }
        }
        Ok(())
    }

    /// Fetch a non-root page. Failures become skips; only cancellation propagates.
    async fn fetch_soft(
        &self,
        transport: &mut Transport,
        state: &mut CrawlState,
        url: &str,
        kind: PageKind,
        depth: usize,
    ) -> Result<Option<FetchedPage>> {
        self.report(kind, url);
        match transport.get(url).await {
            Ok(fetched) => {
                state.crawl.requests += 1;
                if !fetched.is_html() {
                    state.skip(url.to_string(), kind, depth, SkipReason::Asset);
                    return Ok(None);
                }
                Ok(Some(fetched))
            }
            Err(ScanError::Cancelled) => Err(ScanError::Cancelled),
            Err(e) => {
                warn!("Could not fetch {} {}: {}", kind.as_str(), url, e);
                state.crawl.requests += 1;
                state.skip(url.to_string(), kind, depth, SkipReason::FetchFailed(e.to_string()));
                Ok(None)
            }
        }
    }

    fn report(&self, kind: PageKind, url: &str) {
        if let Some(ref callback) = self.progress_callback {
            callback(kind, url);
        }
    }

    fn skip_assets(&self, state: &mut CrawlState, assets: Vec<ArchiveLocation>, depth: usize) {
        for asset in assets {
            if state.claim(&asset) {
                let url = self.archive_base.location_url(&asset);
                state.skip(url, PageKind::Subpage, depth, SkipReason::Asset);
            }
        }
    }

    /// Fold a page into the snapshot unless it is content-free or repeats an
    /// earlier page word for word.
    fn record(
        &self,
        state: &mut CrawlState,
        url: String,
        kind: PageKind,
        depth: usize,
        body: String,
        chunks: Vec<String>,
    ) {
        let summary = self.extractor.summarize(chunks.iter().map(String::as_str));
        if summary.n_chars < self.min_page_chars {
            state.skip(url, kind, depth, SkipReason::TooShort { chars: summary.n_chars });
            return;
        }
        if !state.seen_text.insert(summary.text) {
            state.skip(url, kind, depth, SkipReason::DuplicateContent);
            return;
        }
        state.crawl.pages.push(PageRecord {
            url,
            kind,
            depth,
            body,
            chunks,
            n_chars: summary.n_chars,
        });
    }

    /// Sanitize, parse and pull text, frames and links out of a page. Runs
    /// synchronously so the parsed tree never lives across an await.
    fn analyze(
        &self,
        fetched: FetchedPage,
        location: &ArchiveLocation,
        root_domain: &str,
        collect_links: bool,
    ) -> Result<PageAnalysis> {
        let body = strip_archive_banner(&fetched.body).into_owned();
        let document = parse_markup(&body)?;

        let page_url = Url::parse(&fetched.url)
            .map_err(|e| ScanError::InvalidUrl(format!("{}: {}", fetched.url, e)))?;
        let page_location = self
            .archive_base
            .locate(&page_url)
            .unwrap_or_else(|| location.clone());

        let chunks = self.extractor.chunks(&document);

        let mut frames = Vec::new();
        for element in document.select(&FRAME_SELECTOR) {
            let Some(src) = element.value().attr("src") else {
                continue;
            };
            let Some(frame) = self.archive_base.resolve_reference(&page_url, &page_location, src) else {
                continue;
            };
            match frame.original_host() {
                Some(host) if !is_excluded(&host, &self.exclude_domains) && !is_asset(&frame.original) => {
                    frames.push(frame)
                }
                _ => debug!("Ignoring frame {}", src),
            }
        }

        let mut links = Vec::new();
        let mut assets = Vec::new();
        if collect_links {
            let mut seen = HashSet::new();
            for element in document.select(&LINK_SELECTOR) {
                let Some(href) = element.value().attr("href") else {
                    continue;
                };
                let Some(link) = self.archive_base.resolve_reference(&page_url, &page_location, href)
                else {
                    continue;
                };
                let Some(host) = link.original_host() else {
                    continue;
                };
                if !is_same_domain(&host, root_domain) || is_excluded(&host, &self.exclude_domains) {
                    continue;
                }
                if !seen.insert(link.visit_key()) {
                    continue;
                }
                if is_asset(&link.original) {
                    assets.push(link);
                } else {
                    links.push(link);
                }
            }
        }

        Ok(PageAnalysis {
            body,
            chunks,
            frames,
            links,
            assets,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{RateLimiter, TransportConfig};
    use std::time::Duration;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    fn transport() -> Transport {
        let config = TransportConfig {
            min_delay: Duration::from_millis(1),
            max_retries: 0,
            ..TransportConfig::default()
        };
        let limiter = Arc::new(RateLimiter::new(&config));
        Transport::new(limiter, config).unwrap()
    }

    fn crawler(server: &MockServer) -> SnapshotCrawler {
        let base = ArchiveBase::parse(&format!("{}/web", server.uri())).unwrap();
        SnapshotCrawler::new(base).with_min_page_chars(10)
    }

    fn descriptor(server: &MockServer) -> SnapshotDescriptor {
        SnapshotDescriptor {
            source_url: "janedoe2022.com".to_string(),
            original_url: "http://janedoe2022.com/".to_string(),
            timestamp: "20220615120000".to_string(),
            archive_url: format!("{}/web/20220615120000/http://janedoe2022.com/", server.uri()),
        }
    }

    async fn serve(server: &MockServer, original_path: &str, html: String) {
        Mock::given(method("GET"))
            .and(path(format!("/web/20220615120000/http://janedoe2022.com{}", original_path)))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(html, "text/html"),
            )
            .mount(server)
            .await;
    }

    /// Test link discovery across the three reference forms
    #[tokio::test]
    async fn test_link_discovery() {
        let server = MockServer::start().await;
        let root_html = format!(
            r#"<html><body><p>Jane Doe for Congress 2022</p>
                <a href="about">About Jane</a>
                <a href="http://janedoe2022.com/issues">Issues</a>
                <a href="{}/web/20220615120000/http://janedoe2022.com/donate">Donate</a>
                <a href="https://facebook.com/janedoe">Facebook</a>
                <a href="https://otherguy.com/">Opponent</a>
                <a href="mailto:jane@janedoe2022.com">Mail</a>
            </body></html>"#,
            server.uri()
        );
        serve(&server, "/", root_html).await;
        serve(&server, "/about", "<p>Jane grew up in Springfield.</p>".into()).await;
        serve(&server, "/issues", "<p>Healthcare, jobs and schools.</p>".into()).await;
        serve(&server, "/donate", "<p>Chip in five dollars today.</p>".into()).await;

        let mut transport = transport();
        let crawl = crawler(&server)
            .crawl_snapshot(&mut transport, &descriptor(&server))
            .await
            .unwrap();

        assert_eq!(crawl.page_count(PageKind::Root), 1);
        assert_eq!(crawl.page_count(PageKind::Subpage), 3);
        assert_eq!(crawl.requests, 4);
        let text: Vec<&str> = crawl.chunks().collect();
        assert!(text.contains(&"Jane grew up in Springfield."));
        assert!(!crawl.pages.iter().any(|p| p.url.contains("facebook")));
    }

    /// Cyclic link graphs terminate within the configured limits
    #[tokio::test]
    async fn test_crawl_bounding_with_cycles() {
        let server = MockServer::start().await;
        let page = |n: usize| {
            let mut html = format!("<html><body><p>Page number {} of the campaign site</p>", n);
            html.push_str(r#"<a href="/web/20220615120000/http://janedoe2022.com/">Home</a>"#);
            for m in 0..12 {
                html.push_str(&format!(r#"<a href="p{}">Page {}</a>"#, (n + m) % 12, m));
            }
            html.push_str("</body></html>");
            html
        };
        serve(&server, "/", page(100)).await;
        for n in 0..12 {
            serve(&server, &format!("/p{}", n), page(n)).await;
        }

        let mut transport = transport();
        let crawl = crawler(&server)
            .with_max_link_depth(2)
            .with_max_subpages(5)
            .crawl_snapshot(&mut transport, &descriptor(&server))
            .await
            .unwrap();

        let subpages = crawl.page_count(PageKind::Subpage);
        assert!(subpages <= 5, "visited {} subpages", subpages);
        assert!(crawl.pages.iter().all(|p| p.depth <= 2));
        let received = server.received_requests().await.unwrap();
        assert!(received.len() <= 6, "made {} requests", received.len());
    }

    #[tokio::test]
    async fn test_link_depth_zero_stays_on_root() {
        let server = MockServer::start().await;
        serve(
            &server,
            "/",
            r#"<p>Jane Doe for Congress 2022</p><a href="about">About</a>"#.into(),
        )
        .await;

        let mut transport = transport();
        let crawl = crawler(&server)
            .with_max_link_depth(0)
            .crawl_snapshot(&mut transport, &descriptor(&server))
            .await
            .unwrap();
        assert_eq!(crawl.pages.len(), 1);
        assert_eq!(crawl.requests, 1);
    }

    async fn frame_chain(server: &MockServer, frames: usize) {
        let root = r#"<html><frameset><frame src="f1.html"></frameset></html>"#.to_string();
        serve(server, "/", root).await;
        for n in 1..=frames {
            let inner = if n < frames {
                format!(r#"<iframe src="f{}.html"></iframe>"#, n + 1)
            } else {
                String::new()
            };
            serve(
                server,
                &format!("/f{}.html", n),
                format!("<html><body><p>Content of frame number {}</p>{}</body></html>", n, inner),
            )
            .await;
        }
    }

    /// N nested frames within the limit yield N+1 records
    #[tokio::test]
    async fn test_nested_frames_within_limit() {
        let server = MockServer::start().await;
        frame_chain(&server, 3).await;

        let mut transport = transport();
        let crawl = crawler(&server)
            .with_min_page_chars(0)
            .with_max_frame_depth(3)
            .crawl_snapshot(&mut transport, &descriptor(&server))
            .await
            .unwrap();

        assert_eq!(crawl.pages.len(), 4);
        assert_eq!(crawl.page_count(PageKind::Frame), 3);
        let depths: Vec<usize> = crawl.pages.iter().map(|p| p.depth).collect();
        assert_eq!(depths, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_nested_frames_beyond_limit() {
        let server = MockServer::start().await;
        frame_chain(&server, 5).await;

        let mut transport = transport();
        let crawl = crawler(&server)
            .with_min_page_chars(0)
            .with_max_frame_depth(2)
            .crawl_snapshot(&mut transport, &descriptor(&server))
            .await
            .unwrap();

        assert_eq!(crawl.pages.len(), 3);
        assert_eq!(crawl.requests, 3);
    }

    /// Frames that point back at an ancestor are not refetched
    #[tokio::test]
    async fn test_frame_cycle_terminates() {
        let server = MockServer::start().await;
        serve(&server, "/", r#"<frameset><frame src="a.html"></frameset>"#.into()).await;
        serve(
            &server,
            "/a.html",
            r#"<p>Frame A has campaign text</p><iframe src="/web/20220615120000/http://janedoe2022.com/"></iframe>"#.into(),
        )
        .await;

        let mut transport = transport();
        let crawl = crawler(&server)
            .crawl_snapshot(&mut transport, &descriptor(&server))
            .await
            .unwrap();
        assert_eq!(crawl.requests, 2);
        assert_eq!(crawl.page_count(PageKind::Frame), 1);
    }

    /// Blank or repeated pages are skipped without failing the snapshot
    #[tokio::test]
    async fn test_short_and_duplicate_pages_are_soft_skips() {
        let server = MockServer::start().await;
        let root = r#"<p>Jane Doe for Congress 2022</p><a href="flash">Intro</a><a href="home">Home</a><a href="gone">Gone</a><a href="plan.pdf">Plan</a>"#;
        serve(&server, "/", root.into()).await;
        serve(&server, "/flash", "<embed src=\"intro.swf\"><p>Skip</p>".into()).await;
        serve(&server, "/home", root.into()).await;

        let mut transport = transport();
        let crawl = crawler(&server)
            .crawl_snapshot(&mut transport, &descriptor(&server))
            .await
            .unwrap();

        assert_eq!(crawl.pages.len(), 1);
        let reasons: Vec<&SkipReason> = crawl.skipped.iter().map(|s| &s.reason).collect();
        assert!(reasons.iter().any(|r| matches!(r, SkipReason::TooShort { .. })));
        assert!(reasons.contains(&&SkipReason::DuplicateContent));
        assert!(reasons.iter().any(|r| matches!(r, SkipReason::FetchFailed(_))));
        assert!(reasons.contains(&&SkipReason::Asset));
    }

    #[tokio::test]
    async fn test_root_fetch_failure_is_an_error() {
        let server = MockServer::start().await;
        let mut transport = transport();
        let err = crawler(&server)
            .crawl_snapshot(&mut transport, &descriptor(&server))
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_archive_banner_is_not_extracted() {
        let server = MockServer::start().await;
        serve(
            &server,
            "/",
            format!(
                "<html><body>{}<div>Wayback Machine toolbar text</div>{}<p>Jane Doe for Congress 2022</p></body></html>",
                crate::sanitize::BANNER_START,
                crate::sanitize::BANNER_END
            ),
        )
        .await;

        let mut transport = transport();
        let crawl = crawler(&server)
            .crawl_snapshot(&mut transport, &descriptor(&server))
            .await
            .unwrap();
        let text: Vec<&str> = crawl.chunks().collect();
        assert_eq!(text, vec!["Jane Doe for Congress 2022"]);
    }
}
