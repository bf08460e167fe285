use anyhow::{Context, Result, bail};
use clap::ArgMatches;
use colored::Colorize;
use harvest_core::config::{HarvestConfig, LogFormat, LoggingConfig, expand_path};
use harvest_core::report::{ReportFormat, generate_report, save_report};
use harvest_core::roster::{roster_path, roster_scope};
use harvest_core::{CsvOutputStore, Harvester, load_roster, open_checkpoint_store};
use harvest_core::{CheckpointBackend, HarvestSummary};
use harvest_scanner::{
    DedupPolicy, RateLimiter, Shutdown, SnapshotDescriptor, SnapshotResolver, Transport,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Values given on the command line that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub workers: Option<usize>,
    pub dedup: Option<DedupPolicy>,
    pub checkpoint: Option<CheckpointBackend>,
    pub output_dir: Option<PathBuf>,
    pub progress_dir: Option<PathBuf>,
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
}

// Subcommands define different arguments, so lookups must tolerate absent ids.
fn opt<T: Clone + Send + Sync + 'static>(args: &ArgMatches, id: &str) -> Option<T> {
    args.try_get_one::<T>(id).ok().flatten().cloned()
}

impl Overrides {
    pub fn from_matches(args: &ArgMatches) -> Result<Self> {
        let dedup = opt::<String>(args, "dedup")
            .map(|s| s.parse::<DedupPolicy>())
            .transpose()
            .map_err(anyhow::Error::msg)?;
        let checkpoint = opt::<String>(args, "checkpoint")
            .map(|s| s.parse::<CheckpointBackend>())
            .transpose()
            .map_err(anyhow::Error::msg)?;
        let log_format = opt::<String>(args, "log-format").map(|s| match s.as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Text,
        });

        Ok(Self {
            workers: opt::<usize>(args, "threads"),
            dedup,
            checkpoint,
            output_dir: opt::<PathBuf>(args, "output-dir"),
            progress_dir: opt::<PathBuf>(args, "progress-dir"),
            log_level: opt::<String>(args, "log-level"),
            log_format,
        })
    }
}

/// Layer CLI overrides onto a loaded config, then re-validate.
pub fn apply_overrides(config: &mut HarvestConfig, overrides: &Overrides) -> Result<()> {
    if let Some(workers) = overrides.workers {
        config.harvest.workers = workers;
    }
    if let Some(policy) = overrides.dedup {
        config.archive.dedup_policy = policy;
    }
    if let Some(backend) = overrides.checkpoint {
        config.harvest.checkpoint_backend = backend;
    }
    if let Some(dir) = &overrides.output_dir {
        config.harvest.output_dir = dir.clone();
    }
    if let Some(dir) = &overrides.progress_dir {
        config.harvest.progress_dir = dir.clone();
    }
    if let Some(level) = &overrides.log_level {
        config.logging.level = level.clone();
    }
    if let Some(format) = overrides.log_format {
        config.logging.format = format;
    }
    config.validate()?;
    Ok(())
}

/// Load the config named by `--config` and apply the overrides found in `args`.
pub fn load_effective_config(args: &ArgMatches) -> Result<HarvestConfig> {
    let path = opt::<String>(args, "config")
        .map(|p| expand_path(&p))
        .unwrap_or_else(|| expand_path(harvest_core::config::DEFAULT_CONFIG_PATH));
    let mut config = HarvestConfig::load(&path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    apply_overrides(&mut config, &Overrides::from_matches(args)?)?;
    Ok(config)
}

/// Install the global fmt subscriber. `RUST_LOG` wins over the configured level.
pub fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    // A subscriber may already be installed (tests, repeated calls).
    let _ = match logging.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
}

/// Pick the roster file: an explicit `--roster`, or the conventional file for
/// `--office`/`--year` under the roster directory.
pub fn resolve_roster_path(
    roster: Option<&PathBuf>,
    office: Option<&str>,
    year: Option<i32>,
    roster_dir: &Path,
) -> Result<PathBuf> {
    if let Some(path) = roster {
        return Ok(path.clone());
    }
    match (office, year) {
        (Some(office), Some(year)) => Ok(roster_path(roster_dir, office, year)),
        (Some(_), None) => bail!("--office requires --year"),
        _ => bail!("Either --roster or --office with --year must be provided"),
    }
}

/// Write the commented default config. Returns false when a file already
/// exists and `force` is not set.
pub fn write_default_config(path: &Path, force: bool) -> Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    let content = HarvestConfig::default_toml()?;
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(true)
}

pub fn format_snapshot_list(snapshots: &[SnapshotDescriptor], format: &str) -> Result<String> {
    if format == "json" {
        return Ok(serde_json::to_string_pretty(snapshots)?);
    }
    let mut out = String::new();
    for snap in snapshots {
        out.push_str(&format!("{}  {}\n", snap.timestamp, snap.archive_url));
    }
    Ok(out)
}

pub fn print_divider() {
    println!("{}", "═".repeat(60).bright_blue().bold());
}

pub fn print_summary_line(summary: &HarvestSummary) {
    let status = if summary.fatal_error.is_some() {
        "stopped".red().bold()
    } else if summary.interrupted {
        "interrupted".yellow().bold()
    } else if summary.failed.is_empty() {
        "complete".green().bold()
    } else {
        "complete with failures".yellow().bold()
    };
    println!(
        "{} {} | {} new, {} already done, {} failed, {} without captures",
        "Harvest".bold(),
        status,
        summary.completed.to_string().green(),
        summary.checkpoint_hits,
        summary.failed.len().to_string().red(),
        summary.no_data.len()
    );
}

fn spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
        spinner.set_style(style);
    }
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message(message.to_string());
    spinner
}

// Handler functions

pub fn handle_init(args: &ArgMatches) -> Result<()> {
    let raw = opt::<String>(args, "PATH")
        .unwrap_or_else(|| harvest_core::config::DEFAULT_CONFIG_PATH.to_string());
    let path = expand_path(&raw);
    let force = args.get_flag("force");

    let spinner = spinner("Writing default configuration...");
    if write_default_config(&path, force)? {
        spinner.finish_with_message(format!(
            "✓ Configuration written to {}",
            path.display()
        ));
    } else {
        spinner.finish_and_clear();
        println!(
            "{} {} already exists (use --force to overwrite)",
            "[WARNING]".yellow(),
            path.display()
        );
    }
    Ok(())
}

pub async fn handle_resolve(args: &ArgMatches, quiet: bool) -> Result<()> {
    let config = load_effective_config(args)?;
    init_tracing(&config.logging);

    let url = opt::<String>(args, "url").context("--url is required")?;
    let year = opt::<i32>(args, "year").context("--year is required")?;
    let format = opt::<String>(args, "format").unwrap_or_else(|| "text".to_string());

    let transport_config = config.transport_config();
    let limiter = Arc::new(RateLimiter::new(&transport_config));
    let mut transport = Transport::new(limiter, transport_config)?;
    let resolver = SnapshotResolver::new(
        &config.archive.cdx_endpoint,
        &config.archive.archive_base,
        config.archive.dedup_policy,
    )?
    .with_limit(config.archive.index_limit);

    let progress = (!quiet).then(|| spinner(&format!("Querying archive index for {}...", url)));
    let snapshots = resolver.resolve(&mut transport, &url, year).await;
    if let Some(pb) = progress {
        pb.finish_and_clear();
    }
    let snapshots = snapshots.with_context(|| format!("Failed to resolve {} for {}", url, year))?;

    if !quiet && format != "json" {
        print_divider();
        println!(
            "{} snapshot(s) of {} in {} (policy: {})",
            snapshots.len().to_string().green().bold(),
            url.cyan(),
            year,
            config.archive.dedup_policy
        );
        print_divider();
    }
    print!("{}", format_snapshot_list(&snapshots, &format)?);
    if format == "json" {
        println!();
    }
    Ok(())
}

pub async fn handle_harvest(args: &ArgMatches, quiet: bool) -> Result<()> {
    let config = load_effective_config(args)?;
    init_tracing(&config.logging);

    let roster_file = resolve_roster_path(
        args.get_one::<PathBuf>("roster"),
        args.get_one::<String>("office").map(String::as_str),
        args.get_one::<i32>("year").copied(),
        &config.harvest.roster_dir,
    )?;
    let roster = load_roster(&roster_file)?;
    if roster.missing_website > 0 {
        warn!(
            "{} roster row(s) without a website were skipped",
            roster.missing_website
        );
    }
    if roster.invalid_rows > 0 {
        warn!("{} malformed roster row(s) were skipped", roster.invalid_rows);
    }
    if roster.is_empty() {
        println!(
            "{} No candidates with websites in {}",
            "[WARNING]".yellow(),
            roster_file.display()
        );
        return Ok(());
    }

    let scope = roster_scope(&roster_file);
    let checkpoint = open_checkpoint_store(
        config.harvest.checkpoint_backend,
        &config.harvest.progress_dir,
        &scope,
    )?;
    let output = Arc::new(CsvOutputStore::new(&config.harvest.output_dir));

    if !quiet {
        print_divider();
        println!("Roster:     {}", roster_file.display().to_string().cyan());
        println!("Candidates: {}", roster.len());
        println!("Workers:    {}", config.harvest.workers);
        println!("Dedup:      {}", config.archive.dedup_policy);
        println!(
            "Checkpoint: {} ({} unit(s) already done)",
            checkpoint.location(),
            checkpoint.len()
        );
        print_divider();
    }

    let shutdown = Shutdown::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!(
                "\n{} Stopping: in-flight units will be retried on the next run",
                "[INTERRUPT]".yellow()
            );
            signal.trigger();
        }
    });

    info!("Harvesting roster {} ({} entries)", scope, roster.len());
    let summary = Harvester::new(config, checkpoint, output)
        .with_shutdown(shutdown)
        .with_roster_name(scope)
        .with_progress_bars(!quiet)
        .run(roster.entries)
        .await?;

    let format = args
        .get_one::<String>("format")
        .and_then(|s| ReportFormat::from_str(s))
        .unwrap_or_default();
    let report = generate_report(&summary, format)?;
    match args.get_one::<PathBuf>("report") {
        Some(path) => {
            save_report(&report, path)
                .with_context(|| format!("Failed to save report to {}", path.display()))?;
            if !quiet {
                println!("Report saved to {}", path.display().to_string().cyan());
            }
        }
        None => println!("{}", report),
    }
    if !quiet {
        print_summary_line(&summary);
    }

    if let Some(error) = &summary.fatal_error {
        bail!("Run stopped on a storage failure: {}", error);
    }
    Ok(())
}
