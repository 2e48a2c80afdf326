//! oaiharvest - OAI-PMH metadata harvester
//!
//! Harvests records from one or more OAI-PMH repositories concurrently and
//! writes them to a Parquet file per job.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use oaiharvest_core::shutdown_flag;

mod cmd;
mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "oaiharvest")]
#[command(about = "Concurrent OAI-PMH metadata harvester")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Config file path (default: ./oaiharvest.toml or ~/.config/oaiharvest/config.toml)
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,

    /// Read timeout in seconds for stall detection
    #[arg(long, global = true)]
    read_timeout: Option<u64>,

    /// Resubmissions of harvests that failed on a transient error
    #[arg(long, global = true)]
    max_retries: Option<u32>,
}

#[derive(Subcommand)]
enum Command {
    /// Harvest one or more repositories as a single job
    Harvest(cmd::harvest::HarvestArgs),
    /// Show current configuration
    Config,
}

/// First signal requests a graceful stop, the second exits at once
/// without running exit handlers.
fn setup_signal_handler() -> Result<()> {
    // SAFETY: AtomicBool::swap and low_level::exit (_exit) are async-signal-safe
    unsafe {
        signal_hook::low_level::register(signal_hook::consts::SIGTERM, || {
            if shutdown_flag().swap(true, Ordering::Relaxed) {
                signal_hook::low_level::exit(130);
            }
        })
        .context("Failed to register SIGTERM handler")?;
        signal_hook::low_level::register(signal_hook::consts::SIGINT, || {
            if shutdown_flag().swap(true, Ordering::Relaxed) {
                signal_hook::low_level::exit(130);
            }
        })
        .context("Failed to register SIGINT handler")?;
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let progress = Arc::new(oaiharvest_core::ProgressContext::new());

    // TTY: warn only unless --debug, spinners show activity.
    // non-TTY: info, log lines are the only progress indicator.
    let is_tty = progress.is_tty();
    let multi = if is_tty { Some(progress.multi()) } else { None };
    let quiet = is_tty && !cli.debug;
    oaiharvest_core::init_logging(quiet, cli.debug, multi);

    let config = if let Some(path) = cli.config {
        Config::from_file(&path)?
    } else {
        Config::load()?
    };

    match cli.command {
        Command::Harvest(args) => {
            setup_signal_handler()?;
            let http = config.http.to_http_config(cli.read_timeout);
            let max_retries = cli.max_retries.unwrap_or(config.http.max_retries);
            cmd::harvest::run(args, &config, http, max_retries, &progress)
        }
        Command::Config => {
            use comfy_table::{
                Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL,
            };

            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .apply_modifier(UTF8_ROUND_CORNERS)
                .set_header(vec![
                    Cell::new("Setting").fg(Color::Cyan),
                    Cell::new("Value").fg(Color::Cyan),
                ]);

            let agent = &config.agent;
            table.add_row(vec![
                "Output directory",
                &config.output.default_dir.display().to_string(),
            ]);
            table.add_row(vec![
                "Compression level",
                &config.output.compression_level.to_string(),
            ]);
            table.add_row(vec!["Workers", &agent.workers.to_string()]);
            table.add_row(vec!["Queue capacity", &agent.queue_capacity.to_string()]);
            table.add_row(vec!["Batch size", &agent.batch_size.to_string()]);
            table.add_row(vec![
                "Offer / poll timeout",
                &format!("{}ms / {}ms", agent.offer_timeout_ms, agent.poll_timeout_ms),
            ]);
            table.add_row(vec!["Write policy", &format!("{:?}", agent.write_policy)]);
            table.add_row(vec![
                "Timeouts",
                &format!(
                    "connect {}s, read {}s",
                    config.http.connect_timeout,
                    cli.read_timeout.unwrap_or(config.http.read_timeout)
                ),
            ]);
            table.add_row(vec![
                "Max retries",
                &cli.max_retries
                    .unwrap_or(config.http.max_retries)
                    .to_string(),
            ]);
            for (name, value) in &config.http.headers {
                table.add_row(vec![format!("Header {name}"), value.clone()]);
            }
            if config.repositories.is_empty() {
                table.add_row(vec!["Repositories", "any http(s) base URI"]);
            }
            for repo in &config.repositories {
                table.add_row(vec![
                    format!("Repository {}", repo.name),
                    repo.base_uri.clone(),
                ]);
            }

            eprintln!("\n{table}");
            Ok(())
        }
    }
}
