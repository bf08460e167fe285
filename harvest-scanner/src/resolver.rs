//! Snapshot discovery through the archive's CDX index.

use crate::error::{Result, ScanError};
use crate::result::SnapshotDescriptor;
use crate::transport::Transport;
use crate::urls::{ArchiveBase, normalize_source_url};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

pub const DEFAULT_CDX_ENDPOINT: &str = "https://web.archive.org/cdx/search/cdx";
pub const DEFAULT_ARCHIVE_BASE: &str = "https://web.archive.org/web";
const FIELDS: &str = "timestamp,original,statuscode,mimetype";

/// How same-period captures are reduced to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupPolicy {
    /// One capture per (URL, day).
    #[default]
    Day,
    /// One capture per (URL, month), grouped client-side from the full result set.
    Month,
}

impl DedupPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DedupPolicy::Day => "day",
            DedupPolicy::Month => "month",
        }
    }

    fn group_key(&self, descriptor: &SnapshotDescriptor) -> (String, String) {
        let period = match self {
            DedupPolicy::Day => descriptor.day(),
            DedupPolicy::Month => descriptor.month(),
        };
        (descriptor.source_url.clone(), period.to_string())
    }
}

impl fmt::Display for DedupPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DedupPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "day" => Ok(DedupPolicy::Day),
            "month" => Ok(DedupPolicy::Month),
            other => Err(format!(
                "unknown dedup policy '{}' (expected 'day' or 'month')",
                other
            )),
        }
    }
}

/// One row of the index response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdxRow {
    pub timestamp: String,
    pub original: String,
    pub statuscode: String,
    pub mimetype: String,
}

pub struct SnapshotResolver {
    cdx_endpoint: String,
    archive_base: ArchiveBase,
    policy: DedupPolicy,
    limit: usize,
}

impl SnapshotResolver {
    pub fn new(cdx_endpoint: &str, archive_base: &str, policy: DedupPolicy) -> Result<Self> {
        Ok(Self {
            cdx_endpoint: cdx_endpoint.to_string(),
            archive_base: ArchiveBase::parse(archive_base)?,
            policy,
            limit: 10_000,
        })
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn policy(&self) -> DedupPolicy {
        self.policy
    }

    pub fn archive_base(&self) -> &ArchiveBase {
        &self.archive_base
    }

    /// All usable captures of `url` between Jan 1 and Dec 31 of `year`,
    /// oldest first. An empty list means the archive has nothing for that window.
    pub async fn resolve(
        &self,
        transport: &mut Transport,
        url: &str,
        year: i32,
    ) -> Result<Vec<SnapshotDescriptor>> {
        let target = index_target(url);
        if target.is_empty() {
            return Err(ScanError::InvalidUrl(format!("empty target for '{}'", url)));
        }
        let from = format!("{}0101", year);
        let to = format!("{}1231", year);
        let limit = self.limit.to_string();

        // No collapse parameter: the index keeps the first capture of a
        // collapsed group, so grouping happens client-side.
        let query: Vec<(&str, &str)> = vec![
            ("url", target.as_str()),
            ("matchType", "prefix"),
            ("from", from.as_str()),
            ("to", to.as_str()),
            ("output", "json"),
            ("fl", FIELDS),
            ("filter", "statuscode:200"),
            ("filter", "mimetype:text/html"),
            ("limit", limit.as_str()),
        ];

        info!(
            "Querying index for {} ({}, policy: {})",
            target, year, self.policy
        );
        let response = transport.get_with_query(&self.cdx_endpoint, &query).await?;
        let rows = parse_cdx_response(&response.body)?;
        debug!("Index returned {} rows for {}", rows.len(), target);

        let descriptors = self.to_descriptors(rows, year);
        let kept = dedup_snapshots(descriptors, self.policy);
        info!("{} snapshot(s) retained for {} in {}", kept.len(), target, year);
        Ok(kept)
    }

    /// Filter rows to successful HTML captures inside `year` and build descriptors.
    pub fn to_descriptors(&self, rows: Vec<CdxRow>, year: i32) -> Vec<SnapshotDescriptor> {
        let year_prefix = year.to_string();
        rows.into_iter()
            .filter(|row| row.statuscode == "200" && row.mimetype.starts_with("text/html"))
            .filter_map(|row| {
                let Some(timestamp) = canonical_timestamp(&row.timestamp) else {
                    debug!("Skipping capture with bad timestamp '{}'", row.timestamp);
                    return None;
                };
                if !timestamp.starts_with(&year_prefix) {
                    return None;
                }
                Some(SnapshotDescriptor {
                    source_url: normalize_source_url(&row.original),
                    archive_url: self.archive_base.snapshot_url(&timestamp, &row.original),
                    original_url: row.original,
                    timestamp,
                })
            })
            .collect()
    }
}

/// Strip the scheme so both http and https captures match the prefix query.
fn index_target(url: &str) -> String {
    let trimmed = url.trim();
    let lower = trimmed.to_ascii_lowercase();
    let target = if lower.starts_with("https://") {
        &trimmed[8..]
    } else if lower.starts_with("http://") {
        &trimmed[7..]
    } else {
        trimmed
    };
    target.trim_end_matches('/').to_string()
}

/// Pad or truncate an index timestamp to `YYYYMMDDHHMMSS` and check it is a
/// real point in time.
pub fn canonical_timestamp(raw: &str) -> Option<String> {
    let digits: String = raw.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.len() < 4 {
        return None;
    }
    let mut ts: String = digits.chars().take(14).collect();
    // Missing month/day fields default to 01, missing time fields to 00.
    while ts.len() < 14 {
        let next = if ts.len() == 4 || ts.len() == 6 { "01" } else { "00" };
        ts.push_str(&next[..(14 - ts.len()).min(2)]);
    }
    NaiveDateTime::parse_from_str(&ts, "%Y%m%d%H%M%S").ok()?;
    Some(ts)
}

/// Parse the index body: a JSON array of rows whose first row is the header,
/// or plain newline-delimited rows in `timestamp original statuscode mimetype`
/// order.
pub fn parse_cdx_response(body: &str) -> Result<Vec<CdxRow>> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        parse_cdx_json(trimmed)
    } else {
        Ok(parse_cdx_lines(trimmed))
    }
}

fn parse_cdx_json(body: &str) -> Result<Vec<CdxRow>> {
    let table: Vec<Vec<String>> = serde_json::from_str(body)
        .map_err(|e| ScanError::ParseError(format!("index response: {}", e)))?;
    let mut rows = table.into_iter();
    let Some(header) = rows.next() else {
        return Ok(Vec::new());
    };

    let column = |name: &str| header.iter().position(|h| h == name);
    let (Some(ts), Some(orig)) = (column("timestamp"), column("original")) else {
        return Err(ScanError::ParseError(
            "index response lacks timestamp/original columns".to_string(),
        ));
    };
    let status = column("statuscode");
    let mime = column("mimetype");

    Ok(rows
        .filter_map(|row| {
            Some(CdxRow {
                timestamp: row.get(ts)?.clone(),
                original: row.get(orig)?.clone(),
                statuscode: status
                    .and_then(|i| row.get(i).cloned())
                    .unwrap_or_else(|| "200".to_string()),
                mimetype: mime
                    .and_then(|i| row.get(i).cloned())
                    .unwrap_or_else(|| "text/html".to_string()),
            })
        })
        .collect())
}

fn parse_cdx_lines(body: &str) -> Vec<CdxRow> {
    body.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            Some(CdxRow {
                timestamp: fields.next()?.to_string(),
                original: fields.next()?.to_string(),
                statuscode: fields.next().unwrap_or("200").to_string(),
                mimetype: fields.next().unwrap_or("text/html").to_string(),
            })
        })
        .collect()
}

/// Keep only the latest capture per policy group, returned oldest first.
pub fn dedup_snapshots(
    descriptors: Vec<SnapshotDescriptor>,
    policy: DedupPolicy,
) -> Vec<SnapshotDescriptor> {
    let mut latest: HashMap<(String, String), SnapshotDescriptor> = HashMap::new();
    for descriptor in descriptors {
        let key = policy.group_key(&descriptor);
        match latest.get(&key) {
            Some(existing) if existing.timestamp >= descriptor.timestamp => {}
            _ => {
                latest.insert(key, descriptor);
            }
        }
    }

    let mut kept: Vec<SnapshotDescriptor> = latest.into_values().collect();
    kept.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.source_url.cmp(&b.source_url))
    });
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{RateLimiter, TransportConfig};
    use std::sync::Arc;
    use std::time::Duration;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path, query_param},
    };

    fn row(ts: &str, original: &str) -> CdxRow {
        CdxRow {
            timestamp: ts.to_string(),
            original: original.to_string(),
            statuscode: "200".to_string(),
            mimetype: "text/html".to_string(),
        }
    }

    fn resolver(policy: DedupPolicy) -> SnapshotResolver {
        SnapshotResolver::new(DEFAULT_CDX_ENDPOINT, DEFAULT_ARCHIVE_BASE, policy).unwrap()
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("day".parse::<DedupPolicy>().unwrap(), DedupPolicy::Day);
        assert_eq!("Month".parse::<DedupPolicy>().unwrap(), DedupPolicy::Month);
        assert!("week".parse::<DedupPolicy>().is_err());
    }

    #[test]
    fn test_canonical_timestamp() {
        assert_eq!(canonical_timestamp("20220615120000").as_deref(), Some("20220615120000"));
        assert_eq!(canonical_timestamp("202206").as_deref(), Some("20220601000000"));
        assert_eq!(canonical_timestamp("2022061512000099").as_deref(), Some("20220615120000"));
        assert_eq!(canonical_timestamp("20221345000000"), None);
        assert_eq!(canonical_timestamp("abc"), None);
    }

    #[test]
    fn test_parse_json_response() {
        let body = r#"[["timestamp","original","statuscode","mimetype"],
            ["20220615000000","http://janedoe2022.com/","200","text/html"],
            ["20220615120000","https://www.janedoe2022.com/","200","text/html"]]"#;
        let rows = parse_cdx_response(body).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].original, "https://www.janedoe2022.com/");
    }

    #[test]
    fn test_parse_plain_response() {
        let body = "20220615000000 http://janedoe2022.com/ 200 text/html\n\n20220701000000 http://janedoe2022.com/about 200 text/html\n";
        let rows = parse_cdx_response(body).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].original, "http://janedoe2022.com/about");
    }

    #[test]
    fn test_parse_empty_and_malformed() {
        assert!(parse_cdx_response("").unwrap().is_empty());
        assert!(parse_cdx_response("[]").unwrap().is_empty());
        assert!(parse_cdx_response("[[\"urlkey\"]]").is_err());
        assert!(parse_cdx_response("[not json").is_err());
    }

    /// Same-day captures of one URL collapse to the latest
    #[test]
    fn test_day_dedup_keeps_latest() {
        let r = resolver(DedupPolicy::Day);
        let descriptors = r.to_descriptors(
            vec![
                row("20220615000000", "http://janedoe2022.com/"),
                row("20220615120000", "https://www.janedoe2022.com/"),
                row("20220615080000", "http://janedoe2022.com"),
                row("20220616000000", "http://janedoe2022.com/"),
            ],
            2022,
        );
        let kept = dedup_snapshots(descriptors, DedupPolicy::Day);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].timestamp, "20220615120000");
        assert_eq!(
            kept[0].archive_url,
            "https://web.archive.org/web/20220615120000/https://www.janedoe2022.com/"
        );
        assert_eq!(kept[1].timestamp, "20220616000000");
    }

    /// Month grouping keeps subpage variants apart
    #[test]
    fn test_month_dedup_groups_by_url_and_month() {
        let r = resolver(DedupPolicy::Month);
        let descriptors = r.to_descriptors(
            vec![
                row("20220601000000", "http://janedoe2022.com/"),
                row("20220620000000", "http://janedoe2022.com/"),
                row("20220605000000", "http://janedoe2022.com/about"),
                row("20220701000000", "http://janedoe2022.com/"),
            ],
            2022,
        );
        let kept = dedup_snapshots(descriptors, DedupPolicy::Month);
        let stamps: Vec<&str> = kept.iter().map(|d| d.timestamp.as_str()).collect();
        assert_eq!(stamps, vec!["20220605000000", "20220620000000", "20220701000000"]);
    }

    #[test]
    fn test_descriptors_filter_status_mime_and_year() {
        let r = resolver(DedupPolicy::Day);
        let mut redirect = row("20220601000000", "http://janedoe2022.com/");
        redirect.statuscode = "301".to_string();
        let mut pdf = row("20220602000000", "http://janedoe2022.com/plan.pdf");
        pdf.mimetype = "application/pdf".to_string();
        let descriptors = r.to_descriptors(
            vec![
                redirect,
                pdf,
                row("20210601000000", "http://janedoe2022.com/"),
                row("20220603000000", "http://janedoe2022.com/"),
            ],
            2022,
        );
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].timestamp, "20220603000000");
    }

    #[tokio::test]
    async fn test_resolve_queries_index() {
        let server = MockServer::start().await;
        let body = r#"[["timestamp","original","statuscode","mimetype"],
            ["20220615000000","http://janedoe2022.com/","200","text/html"],
            ["20220615120000","http://janedoe2022.com/","200","text/html"]]"#;
        Mock::given(method("GET"))
            .and(path("/cdx"))
            .and(query_param("url", "janedoe2022.com"))
            .and(query_param("matchType", "prefix"))
            .and(query_param("from", "20220101"))
            .and(query_param("to", "20221231"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .expect(1)
            .mount(&server)
            .await;

        let config = TransportConfig {
            min_delay: Duration::from_millis(1),
            ..TransportConfig::default()
        };
        let limiter = Arc::new(RateLimiter::new(&config));
        let mut transport = Transport::new(limiter, config).unwrap();
        let resolver = SnapshotResolver::new(
            &format!("{}/cdx", server.uri()),
            &format!("{}/web", server.uri()),
            DedupPolicy::Day,
        )
        .unwrap();

        let snapshots = resolver
            .resolve(&mut transport, "https://janedoe2022.com/", 2022)
            .await
            .unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].timestamp, "20220615120000");
        assert_eq!(
            snapshots[0].archive_url,
            format!("{}/web/20220615120000/http://janedoe2022.com/", server.uri())
        );
    }

    /// An index that collapses by day would hand back only the earliest
    /// capture; the day policy must still end up with the latest.
    #[tokio::test]
    async fn test_day_policy_keeps_latest_against_collapsing_index() {
        let server = MockServer::start().await;
        let earliest_only = r#"[["timestamp","original","statuscode","mimetype"],
            ["20220615000000","http://janedoe2022.com/","200","text/html"]]"#;
        let full = r#"[["timestamp","original","statuscode","mimetype"],
            ["20220615000000","http://janedoe2022.com/","200","text/html"],
            ["20220615120000","http://janedoe2022.com/","200","text/html"]]"#;
        Mock::given(method("GET"))
            .and(path("/cdx"))
            .and(query_param("collapse", "timestamp:8"))
            .respond_with(ResponseTemplate::new(200).set_body_string(earliest_only))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/cdx"))
            .respond_with(ResponseTemplate::new(200).set_body_string(full))
            .mount(&server)
            .await;

        let config = TransportConfig {
            min_delay: Duration::from_millis(1),
            ..TransportConfig::default()
        };
        let limiter = Arc::new(RateLimiter::new(&config));
        let mut transport = Transport::new(limiter, config).unwrap();
        let resolver = SnapshotResolver::new(
            &format!("{}/cdx", server.uri()),
            &format!("{}/web", server.uri()),
            DedupPolicy::Day,
        )
        .unwrap();

        let snapshots = resolver
            .resolve(&mut transport, "janedoe2022.com", 2022)
            .await
            .unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].timestamp, "20220615120000");

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].url.query_pairs().all(|(k, _)| k != "collapse"));
    }

    #[tokio::test]
    async fn test_resolve_empty_index_is_not_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .mount(&server)
            .await;

        let config = TransportConfig {
            min_delay: Duration::from_millis(1),
            ..TransportConfig::default()
        };
        let limiter = Arc::new(RateLimiter::new(&config));
        let mut transport = Transport::new(limiter, config).unwrap();
        let resolver =
            SnapshotResolver::new(&server.uri(), &format!("{}/web", server.uri()), DedupPolicy::Month)
                .unwrap();

        let snapshots = resolver
            .resolve(&mut transport, "janedoe2022.com", 2022)
            .await
            .unwrap();
        assert!(snapshots.is_empty());
    }
}
