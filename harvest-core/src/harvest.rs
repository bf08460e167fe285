//! Harvest orchestration: a fixed pool of workers pulling roster lookups and
//! crawl units from one shared queue.

use crate::checkpoint::CheckpointStore;
use crate::config::HarvestConfig;
use crate::error::{HarvestError, Result};
use crate::model::{CrawlUnit, SnapshotResult, UnitKey, UnitState};
use crate::output::OutputStore;
use crate::roster::RosterEntry;
use chrono::{DateTime, Utc};
use harvest_scanner::{
    DedupPolicy, PageKind, RateLimiter, ScanError, Shutdown, SnapshotCrawler, SnapshotResolver,
    Transport,
};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Callback for operator-facing progress lines.
pub type HarvestProgressCallback = Arc<dyn Fn(String) + Send + Sync>;

enum Job {
    Resolve(RosterEntry),
    Crawl(CrawlUnit),
}

/// Pending jobs plus the number being worked on. Both live under one lock so
/// an empty queue with nothing in flight really means the run is drained.
#[derive(Default)]
struct JobQueue {
    jobs: VecDeque<Job>,
    in_flight: usize,
}

enum NextJob {
    Run(Job),
    Wait,
    Drained,
}

impl JobQueue {
    fn next(&mut self) -> NextJob {
        match self.jobs.pop_front() {
            Some(job) => {
                self.in_flight += 1;
                NextJob::Run(job)
            }
            None if self.in_flight > 0 => NextJob::Wait,
            None => NextJob::Drained,
        }
    }

    fn finish(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoData {
    pub candidate: String,
    pub website_url: String,
    pub year: i32,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedUnit {
    pub candidate: String,
    pub key: String,
    pub error: String,
    pub attempts: u32,
}

/// What happened during one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestSummary {
    pub run_id: String,
    pub roster: String,
    pub dedup_policy: DedupPolicy,
    pub workers: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub roster_entries: usize,
    pub snapshots_found: usize,
    pub completed: usize,
    pub checkpoint_hits: usize,
    /// Completed units whose record was already in the output file.
    pub already_recorded: usize,
    pub no_data: Vec<NoData>,
    pub failed: Vec<FailedUnit>,
    pub cancelled: usize,
    pub pages_fetched: usize,
    pub pages_skipped: usize,
    pub requests: usize,
    pub session_resets: u32,
    pub interrupted: bool,
    /// Set when a checkpoint or output write failed and the run was stopped.
    pub fatal_error: Option<String>,
}

impl HarvestSummary {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.fatal_error.is_none() && !self.interrupted
    }
}

#[derive(Default)]
struct RunStats {
    snapshots_found: usize,
    completed: usize,
    checkpoint_hits: usize,
    already_recorded: usize,
    no_data: Vec<NoData>,
    failed: Vec<FailedUnit>,
    cancelled: usize,
    pages_fetched: usize,
    pages_skipped: usize,
    requests: usize,
    session_resets: u32,
    fatal_error: Option<String>,
}

/// Shared by every worker for the duration of one run.
struct RunContext {
    resolver: SnapshotResolver,
    crawler: SnapshotCrawler,
    checkpoint: Arc<dyn CheckpointStore>,
    output: Arc<dyn OutputStore>,
    shutdown: Shutdown,
    unit_retries: u32,
    retry_delay: Duration,
    queue: Mutex<JobQueue>,
    scheduled: StdMutex<HashSet<UnitKey>>,
    stats: StdMutex<RunStats>,
    progress_bar: Option<ProgressBar>,
    progress_callback: Option<HarvestProgressCallback>,
}

impl RunContext {
    fn stats(&self) -> std::sync::MutexGuard<'_, RunStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn say(&self, message: String) {
        if let Some(ref pb) = self.progress_bar {
            pb.println(&message);
        }
        if let Some(ref callback) = self.progress_callback {
            callback(message);
        }
    }

    fn tick(&self) {
        if let Some(ref pb) = self.progress_bar {
            let (done, hits, failed) = {
                let stats = self.stats();
                (stats.completed, stats.checkpoint_hits, stats.failed.len())
            };
            pb.set_message(format!(
                "Harvesting... {} recorded, {} already done, {} failed",
                done, hits, failed
            ));
            pb.tick();
        }
    }

    /// Storage failures stop the whole run.
    fn abort(&self, key: &UnitKey, err: &HarvestError) {
        error!("Storage failure while recording {}: {}", key, err);
        {
            let mut stats = self.stats();
            if stats.fatal_error.is_none() {
                stats.fatal_error = Some(format!("{}: {}", key, err));
            }
        }
        self.shutdown.trigger();
    }

    fn transition(&self, key: &UnitKey, from: UnitState, to: UnitState) {
        debug_assert!(from.can_transition_to(to), "{} -> {}", from, to);
        debug!("Unit {}: {} -> {}", key, from, to);
    }
}

pub struct Harvester {
    config: HarvestConfig,
    checkpoint: Arc<dyn CheckpointStore>,
    output: Arc<dyn OutputStore>,
    shutdown: Shutdown,
    roster_name: String,
    show_progress_bars: bool,
    progress_callback: Option<HarvestProgressCallback>,
}

impl Harvester {
    pub fn new(
        config: HarvestConfig,
        checkpoint: Arc<dyn CheckpointStore>,
        output: Arc<dyn OutputStore>,
    ) -> Self {
        Self {
            config,
            checkpoint,
            output,
            shutdown: Shutdown::new(),
            roster_name: "roster".to_string(),
            show_progress_bars: false,
            progress_callback: None,
        }
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_roster_name(mut self, name: impl Into<String>) -> Self {
        self.roster_name = name.into();
        self
    }

    pub fn with_progress_bars(mut self, show: bool) -> Self {
        self.show_progress_bars = show;
        self
    }

    pub fn with_progress_callback(mut self, callback: HarvestProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    /// Harvest every entry. Per-unit failures are collected in the summary;
    /// only setup problems are returned as errors.
    pub async fn run(&self, entries: Vec<RosterEntry>) -> Result<HarvestSummary> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let run_id = Uuid::new_v4().to_string();
        let workers = self.config.harvest.workers.max(1);
        let policy = self.config.archive.dedup_policy;

        info!(
            "Run {}: {} roster entries, {} workers, dedup policy {}",
            run_id,
            entries.len(),
            workers,
            policy
        );

        let transport_config = self.config.transport_config();
        let limiter = Arc::new(RateLimiter::new(&transport_config));
        let mut transports = Vec::with_capacity(workers);
        for _ in 0..workers {
            transports.push(
                Transport::new(limiter.clone(), transport_config.clone())?
                    .with_shutdown(self.shutdown.clone()),
            );
        }

        let progress_bar = if self.show_progress_bars {
            let pb = ProgressBar::new_spinner();
            if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
                pb.set_style(style);
            }
            pb.enable_steady_tick(Duration::from_millis(120));
            pb.set_message("Starting harvest...");
            Some(pb)
        } else {
            None
        };

        let mut crawler = self.config.snapshot_crawler()?;
        if let Some(ref pb) = progress_bar {
            let pb = pb.clone();
            crawler = crawler.with_progress_callback(Arc::new(move |kind: PageKind, url: &str| {
                pb.set_message(format!("Fetching {} {}", kind.as_str(), url));
            }));
        }

        let resolver = SnapshotResolver::new(
            &self.config.archive.cdx_endpoint,
            &self.config.archive.archive_base,
            policy,
        )?
        .with_limit(self.config.archive.index_limit);

        let roster_entries = entries.len();
        let ctx = Arc::new(RunContext {
            resolver,
            crawler,
            checkpoint: self.checkpoint.clone(),
            output: self.output.clone(),
            shutdown: self.shutdown.clone(),
            unit_retries: self.config.harvest.unit_retries,
            retry_delay: Duration::from_secs(self.config.harvest.retry_delay_secs),
            queue: Mutex::new(JobQueue {
                jobs: entries.into_iter().map(Job::Resolve).collect(),
                in_flight: 0,
            }),
            scheduled: StdMutex::new(HashSet::new()),
            stats: StdMutex::new(RunStats::default()),
            progress_bar: progress_bar.clone(),
            progress_callback: self.progress_callback.clone(),
        });

        let mut worker_handles = Vec::with_capacity(workers);
        for (worker_id, transport) in transports.into_iter().enumerate() {
            let ctx = ctx.clone();
            worker_handles.push(tokio::spawn(async move {
                run_worker(worker_id, ctx, transport).await
            }));
        }

        for (worker_id, joined) in futures::future::join_all(worker_handles)
            .await
            .into_iter()
            .enumerate()
        {
            match joined {
                Ok((requests, resets)) => {
                    let mut stats = ctx.stats();
                    stats.requests += requests;
                    stats.session_resets += resets;
                }
                Err(e) => error!("Worker {} panicked: {}", worker_id, e),
            }
        }

        let interrupted = self.shutdown.is_triggered();
        let stats = std::mem::take(&mut *ctx.stats());
        let summary = HarvestSummary {
            run_id,
            roster: self.roster_name.clone(),
            dedup_policy: policy,
            workers,
            started_at,
            finished_at: Utc::now(),
            elapsed_secs: clock.elapsed().as_secs_f64(),
            roster_entries,
            snapshots_found: stats.snapshots_found,
            completed: stats.completed,
            checkpoint_hits: stats.checkpoint_hits,
            already_recorded: stats.already_recorded,
            no_data: stats.no_data,
            failed: stats.failed,
            cancelled: stats.cancelled,
            pages_fetched: stats.pages_fetched,
            pages_skipped: stats.pages_skipped,
            requests: stats.requests,
            session_resets: stats.session_resets,
            interrupted: interrupted && stats.fatal_error.is_none(),
            fatal_error: stats.fatal_error,
        };

        if let Some(ref pb) = progress_bar {
            pb.finish_with_message(format!(
                "Harvest complete! {} recorded, {} already done, {} failed",
                summary.completed,
                summary.checkpoint_hits,
                summary.failed.len()
            ));
        }
        info!(
            "Run {} finished in {:.1}s: {} completed, {} checkpoint hits, {} failed",
            summary.run_id,
            summary.elapsed_secs,
            summary.completed,
            summary.checkpoint_hits,
            summary.failed.len()
        );
        Ok(summary)
    }
}

/// Pull jobs until the queue is drained and nothing is in flight, or the
/// run is stopped. Returns the worker's request and session-reset counts.
async fn run_worker(worker_id: usize, ctx: Arc<RunContext>, mut transport: Transport) -> (usize, u32) {
    debug!("Worker {} started", worker_id);

    loop {
        if ctx.shutdown.is_triggered() {
            debug!("Worker {} stopping", worker_id);
            break;
        }

        let next = ctx.queue.lock().await.next();
        let job = match next {
            NextJob::Run(job) => job,
            NextJob::Wait => {
                // Another worker may still enqueue units.
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }
            NextJob::Drained => break,
        };

        match job {
            Job::Resolve(entry) => resolve_entry(&ctx, &mut transport, entry).await,
            Job::Crawl(unit) => process_unit(&ctx, &mut transport, unit).await,
        }
        ctx.queue.lock().await.finish();
        ctx.tick();
    }

    debug!("Worker {} finished", worker_id);
    (transport.requests_sent(), transport.session_resets())
}

/// Wait out a retry pause. False if the run was stopped meanwhile.
async fn retry_pause(ctx: &RunContext) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(ctx.retry_delay) => true,
        _ = ctx.shutdown.cancelled() => false,
    }
}

async fn resolve_entry(ctx: &RunContext, transport: &mut Transport, entry: RosterEntry) {
    let mut attempts = 0;
    let snapshots = loop {
        attempts += 1;
        match ctx
            .resolver
            .resolve(transport, &entry.website_url, entry.year)
            .await
        {
            Ok(snapshots) => break snapshots,
            Err(ScanError::Cancelled) => return,
            Err(e) if e.is_retryable() && attempts <= ctx.unit_retries => {
                warn!(
                    "Index lookup for {} failed (attempt {}): {}",
                    entry.website_url, attempts, e
                );
                if !retry_pause(ctx).await {
                    return;
                }
            }
            Err(e) => {
                error!("Index lookup for {} ({}) failed: {}", entry.candidate, entry.website_url, e);
                ctx.say(format!("[!] Index lookup failed for {}: {}", entry.candidate, e));
                ctx.stats().failed.push(FailedUnit {
                    candidate: entry.candidate.clone(),
                    key: format!("{}@{}", entry.website_url, entry.year),
                    error: e.to_string(),
                    attempts,
                });
                return;
            }
        }
    };

    if snapshots.is_empty() {
        info!("No captures of {} in {}", entry.website_url, entry.year);
        ctx.stats().no_data.push(NoData {
            candidate: entry.candidate.clone(),
            website_url: entry.website_url.clone(),
            year: entry.year,
            reason: "no captures in the archive for this year".to_string(),
        });
        return;
    }

    let units: Vec<CrawlUnit> = {
        let mut scheduled = ctx.scheduled.lock().unwrap_or_else(PoisonError::into_inner);
        snapshots
            .into_iter()
            .map(|snapshot| CrawlUnit::new(entry.clone(), snapshot))
            .filter(|unit| scheduled.insert(unit.key()))
            .collect()
    };
    debug!("{}: {} unit(s) queued", entry.candidate, units.len());
    ctx.stats().snapshots_found += units.len();

    let mut queue = ctx.queue.lock().await;
    queue.jobs.extend(units.into_iter().map(Job::Crawl));
}

async fn process_unit(ctx: &RunContext, transport: &mut Transport, unit: CrawlUnit) {
    let key = unit.key();

    if ctx.checkpoint.is_done(&key) {
        ctx.transition(&key, UnitState::Pending, UnitState::Done);
        ctx.stats().checkpoint_hits += 1;
        return;
    }

    let mut state = UnitState::Pending;
    let mut attempts = 0;
    loop {
        attempts += 1;
        ctx.transition(&key, state, UnitState::InFlight);
        state = UnitState::InFlight;

        match ctx.crawler.crawl_snapshot(transport, &unit.snapshot).await {
            Ok(crawl) => {
                ctx.transition(&key, state, UnitState::Completed);
                let result = SnapshotResult::from_crawl(&unit, &crawl, ctx.crawler.extractor());

                let recorded = ctx
                    .output
                    .append(&result)
                    .and_then(|appended| ctx.checkpoint.mark_done(&key).map(|_| appended));
                let appended = match recorded {
                    Ok(appended) => appended,
                    Err(e) if e.is_storage() => return ctx.abort(&key, &e),
                    Err(e) => {
                        ctx.transition(&key, UnitState::Completed, UnitState::FailedFatal);
                        error!("Unit {} could not be recorded: {}", key, e);
                        ctx.say(format!("[!] Failed {}: {}", key, e));
                        ctx.stats().failed.push(FailedUnit {
                            candidate: unit.entry.candidate.clone(),
                            key: key.to_string(),
                            error: e.to_string(),
                            attempts,
                        });
                        return;
                    }
                };
                ctx.transition(&key, UnitState::Completed, UnitState::Done);

                let mut stats = ctx.stats();
                stats.completed += 1;
                if !appended {
                    stats.already_recorded += 1;
                }
                stats.pages_fetched += crawl.pages.len();
                stats.pages_skipped += crawl.skipped.len();
                return;
            }
            Err(ScanError::Cancelled) => {
                debug!("Unit {} abandoned on shutdown", key);
                ctx.stats().cancelled += 1;
                return;
            }
            Err(e) if e.is_retryable() && attempts <= ctx.unit_retries => {
                ctx.transition(&key, state, UnitState::FailedRetryable);
                state = UnitState::FailedRetryable;
                warn!("Unit {} failed (attempt {}), will retry: {}", key, attempts, e);
                if !retry_pause(ctx).await {
                    ctx.stats().cancelled += 1;
                    return;
                }
            }
            Err(e) => {
                ctx.transition(&key, state, UnitState::FailedFatal);
                error!("Unit {} ({}) failed after {} attempt(s): {}", key, unit.entry.candidate, attempts, e);
                ctx.say(format!("[!] Failed {}: {}", key, e));
                ctx.stats().failed.push(FailedUnit {
                    candidate: unit.entry.candidate.clone(),
                    key: key.to_string(),
                    error: e.to_string(),
                    attempts,
                });
                return;
            }
        }
    }
}
