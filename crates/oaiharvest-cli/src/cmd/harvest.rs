//! Harvest subcommand - run one job over the given repositories

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDate, Utc};
use clap::Args;
use comfy_table::{Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};
use oaiharvest_agent::{ParquetRecordSink, RecordSink, RunSummary, SinkError, WritePolicy};
use oaiharvest_core::{
    HttpConfig, HttpTransport, ProgressContext, Retryable, SharedProgress, backoff_duration,
    fmt_num, is_shutdown_requested, job_message,
};
use oaiharvest_harvester::{Granularity, HarvestNotification, HarvestParameters, Verb};
use oaiharvest_job::{InMemoryRepository, JobManager, JobOutcome};

use crate::config::Config;

const STATUS_POLL: Duration = Duration::from_millis(200);

#[derive(Args, Debug)]
pub struct HarvestArgs {
    /// Repository base URIs (default: every configured repository)
    pub base_uris: Vec<String>,

    /// OAI-PMH verb
    #[arg(long, default_value = "ListRecords", value_parser = parse_verb)]
    pub verb: Verb,

    /// Metadata prefix (default: oai_dc for verbs that need one)
    #[arg(short = 'p', long)]
    pub metadata_prefix: Option<String>,

    /// Restrict to one set
    #[arg(short, long)]
    pub set: Option<String>,

    /// Lower datestamp bound (YYYY-MM-DD or RFC 3339)
    #[arg(long, value_parser = parse_datestamp)]
    pub from: Option<(DateTime<Utc>, Granularity)>,

    /// Upper datestamp bound (YYYY-MM-DD or RFC 3339)
    #[arg(long, value_parser = parse_datestamp)]
    pub until: Option<(DateTime<Utc>, Granularity)>,

    /// Record identifier, for GetRecord and ListMetadataFormats
    #[arg(long)]
    pub identifier: Option<String>,

    /// Extra request parameter NAME=VALUE, sent on the first request only
    #[arg(long = "param", value_parser = parse_key_val)]
    pub extra: Vec<(String, String)>,

    /// Output directory
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Number of concurrent harvests
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Records per Parquet write
    #[arg(short, long)]
    pub batch_size: Option<usize>,

    /// Zstd compression level (1-22)
    #[arg(short, long)]
    pub zstd_level: Option<i32>,

    /// Reject records whose identifier was already written for the repository
    #[arg(long)]
    pub reject_duplicates: bool,
}

fn parse_verb(s: &str) -> Result<Verb, String> {
    s.parse()
}

/// A day (`Day` granularity) or an RFC 3339 instant (`Seconds`).
fn parse_datestamp(s: &str) -> Result<(DateTime<Utc>, Granularity), String> {
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        let midnight = date.and_hms_opt(0, 0, 0).ok_or("invalid date")?;
        return Ok((midnight.and_utc(), Granularity::Day));
    }
    DateTime::parse_from_rfc3339(s)
        .map(|t| (t.with_timezone(&Utc), Granularity::Seconds))
        .map_err(|e| format!("expected YYYY-MM-DD or RFC 3339 ({e})"))
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected NAME=VALUE, got {s:?}")),
    }
}

fn build_params(args: &HarvestArgs, base_uris: &[String]) -> Result<Vec<HarvestParameters>> {
    base_uris
        .iter()
        .map(|base| {
            let mut params = HarvestParameters::parse(base, args.verb)
                .with_context(|| format!("Invalid base URI: {base}"))?;
            if let Some(prefix) = &args.metadata_prefix {
                params = params.with_metadata_prefix(prefix.clone());
            }
            if let Some(set) = &args.set {
                params = params.with_set(set.clone());
            }
            if let Some((from, granularity)) = &args.from {
                params = params.with_from(from, *granularity);
            }
            if let Some((until, granularity)) = &args.until {
                params = params.with_until(until, *granularity);
            }
            if let Some(identifier) = &args.identifier {
                params = params.with_identifier(identifier.clone());
            }
            for (name, value) in &args.extra {
                params = params.with_nonstandard(name.clone(), value.clone());
            }
            params.validate()?;
            Ok(params)
        })
        .collect()
}

/// Totals over a job and its resubmissions.
#[derive(Debug, Default)]
struct HarvestTotals {
    jobs: Vec<String>,
    summary: RunSummary,
    /// Harvests that still failed after the last resubmission
    failed: Vec<HarvestNotification>,
}

impl HarvestTotals {
    fn add(&mut self, s: &RunSummary) {
        let t = &mut self.summary;
        t.harvests += s.harvests;
        t.records_enqueued += s.records_enqueued;
        t.records_dropped += s.records_dropped;
        t.records_written += s.records_written;
        t.records_rejected += s.records_rejected;
        t.batches += s.batches;
        t.failed_batches += s.failed_batches;
        t.max_queue_len = t.max_queue_len.max(s.max_queue_len);
    }
}

/// Split failed harvests into ones worth resubmitting and the rest.
fn split_failures(
    failed: Vec<HarvestNotification>,
) -> (Vec<HarvestNotification>, Vec<HarvestNotification>) {
    failed.into_iter().partition(|n| {
        !n.explicitly_stopped && n.cause.as_ref().is_some_and(|c| c.is_retryable())
    })
}

/// Sleep unless a shutdown arrives first. Returns `false` on shutdown.
fn sleep_unless_shutdown(delay: Duration) -> bool {
    let deadline = Instant::now() + delay;
    while Instant::now() < deadline {
        if is_shutdown_requested() {
            return false;
        }
        thread::sleep(STATUS_POLL.min(deadline.saturating_duration_since(Instant::now())));
    }
    !is_shutdown_requested()
}

fn watch_job(manager: &JobManager, job_name: &str, progress: &ProgressContext) -> JobOutcome {
    let pb = progress.job_line(job_name);
    let mut stop_sent = false;
    loop {
        if !stop_sent && is_shutdown_requested() {
            log::warn!("Shutdown requested, stopping job {job_name}");
            manager.stop_all();
            stop_sent = true;
        }
        if let Some(outcome) = manager.wait(job_name, STATUS_POLL) {
            pb.finish_and_clear();
            return outcome;
        }
        if let Some(status) = manager.status(job_name) {
            pb.set_message(job_message(
                status.running_harvests(),
                status.harvests.len(),
                status.records_written as u64,
                status.max_queue_size,
            ));
        }
    }
}

/// Run `params` as a job, then resubmit transiently failed harvests from
/// their last resumption token with exponential backoff.
fn run_jobs(
    manager: &JobManager,
    mut params: Vec<HarvestParameters>,
    max_retries: u32,
    progress: &ProgressContext,
) -> Result<HarvestTotals> {
    let mut totals = HarvestTotals::default();
    let mut attempt = 0;
    loop {
        let job_name = manager.new_job(params).context("Failed to create job")?;
        totals.jobs.push(job_name.clone());

        let outcome = watch_job(manager, &job_name, progress);
        if let Some(e) = &outcome.error {
            log::error!("[job {job_name}] {e}");
        }
        if let Some(summary) = &outcome.summary {
            totals.add(summary);
        }

        let (retry, permanent) = split_failures(outcome.failed_harvests);
        totals.failed.extend(permanent);
        if retry.is_empty() {
            break;
        }
        if attempt >= max_retries || is_shutdown_requested() {
            totals.failed.extend(retry);
            break;
        }

        attempt += 1;
        let delay = backoff_duration(attempt);
        log::warn!(
            "Resubmitting {} failed harvests in {}s (attempt {attempt}/{max_retries})",
            retry.len(),
            delay.as_secs()
        );
        if !sleep_unless_shutdown(delay) {
            totals.failed.extend(retry);
            break;
        }
        params = retry
            .iter()
            .map(|n| n.params.retry_parameters(n.resumption_token.as_deref()))
            .collect();
    }
    Ok(totals)
}

pub fn run(
    args: HarvestArgs,
    config: &Config,
    http: HttpConfig,
    max_retries: u32,
    progress: &SharedProgress,
) -> Result<()> {
    let base_uris: Vec<String> = if args.base_uris.is_empty() {
        config
            .repositories
            .iter()
            .map(|r| r.base_uri.clone())
            .collect()
    } else {
        args.base_uris.clone()
    };
    if base_uris.is_empty() {
        bail!("No base URIs given and no repositories configured");
    }
    let params = build_params(&args, &base_uris)?;

    let output_dir = args
        .output
        .clone()
        .unwrap_or_else(|| config.output.default_dir.clone());
    let zstd_level = args.zstd_level.unwrap_or(config.output.compression_level);

    let mut agent_config = config.agent.to_agent_config();
    if let Some(workers) = args.workers {
        agent_config.workers = workers;
    }
    if let Some(batch_size) = args.batch_size {
        agent_config.batch_size = batch_size;
    }
    if args.reject_duplicates {
        agent_config.write_policy = WritePolicy::RejectDuplicates;
    }

    let transport = HttpTransport::new(&http).context("Failed to build HTTP client")?;
    let sink_dir = output_dir.clone();
    let manager = JobManager::new(
        Arc::new(transport),
        Arc::new(InMemoryRepository::new(config.repositories.clone())),
        Box::new(move |job_name: &str| -> Result<Box<dyn RecordSink>, SinkError> {
            let sink = ParquetRecordSink::new(&sink_dir, &format!("job_{job_name}"), zstd_level)?;
            Ok(Box::new(sink) as Box<dyn RecordSink>)
        }),
    )
    .with_agent_config(agent_config);

    log::info!(
        "Harvesting {} repositories into {}",
        params.len(),
        output_dir.display()
    );
    let start = Instant::now();
    let totals = run_jobs(&manager, params, max_retries, progress)?;
    let s = &totals.summary;

    print_summary(
        "Harvest",
        &[
            ("Jobs", totals.jobs.join(", ")),
            ("Harvests", s.harvests.to_string()),
            ("Records written", fmt_num(s.records_written as u64)),
            ("Records rejected", fmt_num(s.records_rejected as u64)),
            ("Dropped after stop", fmt_num(s.records_dropped as u64)),
            (
                "Batches",
                format!("{} ({} failed)", s.batches, s.failed_batches),
            ),
            ("Queue peak", fmt_num(s.max_queue_len as u64)),
            ("Failed harvests", totals.failed.len().to_string()),
            ("Output", output_dir.display().to_string()),
            ("Elapsed", format!("{:.1}s", start.elapsed().as_secs_f64())),
        ],
    );

    if is_shutdown_requested() {
        log::warn!("Harvest interrupted by signal");
    }
    if !totals.failed.is_empty() {
        for n in &totals.failed {
            let cause = n.cause.as_ref().map(|c| c.to_string()).unwrap_or_default();
            match &n.resumption_token {
                Some(token) => log::error!(
                    "[{}] failed at token {token}: {cause}",
                    n.params.base_uri()
                ),
                None => log::error!("[{}] failed: {cause}", n.params.base_uri()),
            }
        }
        bail!("{} harvests failed", totals.failed.len());
    }
    Ok(())
}

fn print_summary(title: &str, rows: &[(&str, String)]) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new(title).fg(Color::Cyan),
            Cell::new("Value").fg(Color::Cyan),
        ]);
    for (label, value) in rows {
        table.add_row(vec![Cell::new(label), Cell::new(value)]);
    }
    eprintln!("\n{table}");
}
