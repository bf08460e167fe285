//! Rate-limited HTTP access to the archive.
//!
//! One [`RateLimiter`] is shared by every worker in the pool so the aggregate
//! request rate against the archive stays bounded no matter how many workers
//! run. Each worker owns a [`Transport`], which wraps its own HTTP session and
//! rebuilds it after repeated connection failures.

use crate::error::{Result, ScanError};
use crate::shutdown::Shutdown;
use reqwest::{Client, RequestBuilder, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, info, warn};

pub const DEFAULT_USER_AGENT: &str = "CandidateWebsiteHarvest/1.0 (Academic Research)";

/// Largest body we still inspect for an in-page throttling notice.
const THROTTLE_PAGE_MAX_BYTES: usize = 4096;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Consecutive clean responses needed before the delay drops back to `min_delay`.
    pub recovery_successes: u32,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// Connection failures in a row before the session is rebuilt.
    pub connection_failure_threshold: u32,
    /// Transient failures tolerated per request. Throttling never counts.
    pub max_retries: u32,
    pub user_agent: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(360),
            backoff_factor: 2.0,
            recovery_successes: 5,
            request_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(30),
            connection_failure_threshold: 3,
            max_retries: 5,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

#[derive(Debug)]
struct LimiterState {
    last_request: Option<Instant>,
    current_delay: Duration,
    backoff_level: u32,
    clean_streak: u32,
    /// Latest issuance already covered by a backoff step.
    backoff_horizon: Option<Instant>,
}

/// Pool-wide request pacing with exponential backoff on throttling.
#[derive(Debug)]
pub struct RateLimiter {
    state: Mutex<LimiterState>,
    min_delay: Duration,
    max_delay: Duration,
    backoff_factor: f64,
    recovery_successes: u32,
}

impl RateLimiter {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            state: Mutex::new(LimiterState {
                last_request: None,
                current_delay: config.min_delay,
                backoff_level: 0,
                clean_streak: 0,
                backoff_horizon: None,
            }),
            min_delay: config.min_delay,
            max_delay: config.max_delay.max(config.min_delay),
            backoff_factor: config.backoff_factor.max(1.0),
            recovery_successes: config.recovery_successes.max(1),
        }
    }

    /// Wait until the current delay has passed since the last request issued
    /// by anyone, then claim the slot. The lock is held across the wait, which
    /// serializes issuance across the whole pool.
    pub async fn acquire(&self) -> Instant {
        let mut state = self.state.lock().await;
        if let Some(last) = state.last_request {
            let ready = last + state.current_delay;
            if ready > Instant::now() {
                sleep_until(ready).await;
            }
        }
        let now = Instant::now();
        state.last_request = Some(now);
        now
    }

    /// Record a throttling response to a request issued at `issued` and grow
    /// the delay. Requests issued before the last backoff step belong to the
    /// same burst and only apply their `Retry-After` floor.
    pub async fn throttled(&self, issued: Instant, retry_after: Option<Duration>) -> Duration {
        let mut state = self.state.lock().await;
        let floor = retry_after.unwrap_or(Duration::ZERO);
        state.clean_streak = 0;

        if state.backoff_horizon.is_some_and(|horizon| issued <= horizon) {
            state.current_delay = state.current_delay.max(floor).min(self.max_delay);
            debug!("Throttle from an earlier burst; delay stays {:?}", state.current_delay);
            return state.current_delay;
        }

        let grown = state.current_delay.mul_f64(self.backoff_factor);
        state.current_delay = grown.max(floor).min(self.max_delay);
        state.backoff_level += 1;
        state.backoff_horizon = state.last_request;
        warn!(
            "Throttled by archive (level {}). Backing off to {:.1}s",
            state.backoff_level,
            state.current_delay.as_secs_f64()
        );
        state.current_delay
    }

    /// Record a non-throttled response. After a sustained run of these the
    /// delay returns to baseline.
    pub async fn succeeded(&self) {
        let mut state = self.state.lock().await;
        if state.current_delay <= self.min_delay {
            return;
        }
        state.clean_streak += 1;
        if state.clean_streak >= self.recovery_successes {
            info!(
                "Throttling cleared after {} clean responses; delay back to {:?}",
                state.clean_streak, self.min_delay
            );
            state.current_delay = self.min_delay;
            state.backoff_level = 0;
            state.clean_streak = 0;
        }
    }

    pub async fn current_delay(&self) -> Duration {
        self.state.lock().await.current_delay
    }

    pub async fn backoff_level(&self) -> u32 {
        self.state.lock().await.backoff_level
    }

    pub fn min_delay(&self) -> Duration {
        self.min_delay
    }
}

/// A successful fetch.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// Final URL after redirects.
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

impl FetchedPage {
    pub fn is_html(&self) -> bool {
        self.content_type
            .as_ref()
            .map(|ct| ct.contains("text/html"))
            .unwrap_or(true)
    }
}

struct RawResponse {
    url: String,
    status: StatusCode,
    content_type: Option<String>,
    retry_after: Option<Duration>,
    body: String,
}

/// One worker's HTTP session.
pub struct Transport {
    client: Client,
    limiter: Arc<RateLimiter>,
    config: TransportConfig,
    shutdown: Shutdown,
    connection_failures: u32,
    session_resets: u32,
    requests_sent: usize,
}

impl Transport {
    pub fn new(limiter: Arc<RateLimiter>, config: TransportConfig) -> Result<Self> {
        let client = Self::build_client(&config)?;
        Ok(Self {
            client,
            limiter,
            config,
            shutdown: Shutdown::new(),
            connection_failures: 0,
            session_resets: 0,
            requests_sent: 0,
        })
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    fn build_client(config: &TransportConfig) -> Result<Client> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        Ok(client)
    }

    /// Drop the current session and its pooled connections.
    fn reset_session(&mut self) -> Result<()> {
        warn!(
            "{} connection failures in a row; rebuilding HTTP session",
            self.connection_failures
        );
        self.client = Self::build_client(&self.config)?;
        self.connection_failures = 0;
        self.session_resets += 1;
        Ok(())
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn session_resets(&self) -> u32 {
        self.session_resets
    }

    pub fn requests_sent(&self) -> usize {
        self.requests_sent
    }

    pub async fn get(&mut self, url: &str) -> Result<FetchedPage> {
        self.get_with_query(url, &[]).await
    }

    /// GET with pacing, throttling backoff and transient-failure retries.
    pub async fn get_with_query(
        &mut self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<FetchedPage> {
        let mut failures: u32 = 0;

        loop {
            if self.shutdown.is_triggered() {
                return Err(ScanError::Cancelled);
            }

            let issued = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Err(ScanError::Cancelled),
                issued = self.limiter.acquire() => issued,
            };

            self.requests_sent += 1;
            debug!("GET {} (attempt {})", url, failures + 1);
            let request = self.client.get(url).query(query);
            let outcome = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Err(ScanError::Cancelled),
                r = Self::send_and_read(request) => r,
            };

            let error_text = match outcome {
                Ok(response) => {
                    self.connection_failures = 0;

                    if response.status == StatusCode::TOO_MANY_REQUESTS
                        || looks_throttled(&response)
                    {
                        self.limiter.throttled(issued, response.retry_after).await;
                        continue;
                    }

                    if response.status.is_server_error() {
                        format!("HTTP {}", response.status.as_u16())
                    } else {
                        self.limiter.succeeded().await;
                        if !response.status.is_success() {
                            return Err(ScanError::Status {
                                url: url.to_string(),
                                status: response.status.as_u16(),
                            });
                        }
                        return Ok(FetchedPage {
                            url: response.url,
                            status: response.status.as_u16(),
                            content_type: response.content_type,
                            body: response.body,
                        });
                    }
                }
                Err(e) if is_connection_failure(&e) => {
                    self.connection_failures += 1;
                    let text = e.to_string();
                    if self.connection_failures >= self.config.connection_failure_threshold {
                        self.reset_session()?;
                    }
                    text
                }
                Err(e) => return Err(e.into()),
            };

            failures += 1;
            warn!(
                "Transient failure fetching {} ({}/{}): {}",
                url,
                failures,
                self.config.max_retries + 1,
                error_text
            );
            if failures > self.config.max_retries {
                return Err(ScanError::RetriesExhausted {
                    url: url.to_string(),
                    attempts: failures,
                    last_error: error_text,
                });
            }

            let pause = self.config.min_delay * 2u32.pow(failures.min(6));
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Err(ScanError::Cancelled),
                _ = sleep(pause) => {}
            }
        }
    }

    async fn send_and_read(request: RequestBuilder) -> reqwest::Result<RawResponse> {
        let response = request.send().await?;
        let status = response.status();
        let url = response.url().to_string();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await?;

        Ok(RawResponse {
            url,
            status,
            content_type,
            retry_after,
            body,
        })
    }
}

fn is_connection_failure(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
}

/// The archive sometimes answers 200 with a short "Too Many Requests" page.
fn looks_throttled(response: &RawResponse) -> bool {
    response.status.is_success()
        && response.body.len() < THROTTLE_PAGE_MAX_BYTES
        && response.body.to_ascii_lowercase().contains("too many requests")
}
