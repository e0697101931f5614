//! vsm: uplink processor for LoRa Edge GNSS/WiFi trackers.
//!
//! CLI + HTTP ingest. Uplinks are merged into per-device records, the rule
//! pipeline decides which downlinks to send, and almanac updates are
//! delivered in the background.

use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use comfy_table::{Cell, Table};
use tracing::{error, info, warn};

use vsm_core::chunk::{chunk_budget, plan_almanac};
use vsm_core::config::{self, Config};
use vsm_core::{Result, VsmError};

mod cache;
mod downlink;
mod downloads;
mod logging;
mod pipeline;
mod publisher;
mod solver;
mod store;
mod translator;
mod uplink;
mod web;

#[cfg(test)]
mod testing;

use downlink::{Downlinker, HttpDownlinker, LogDownlinker};
use publisher::{LogPublisher, Publisher, WebhookPublisher};
use solver::{LoraCloudSolver, Solver};
use store::{SqliteStore, StateStore};
use translator::PassthroughTranslator;
use uplink::{Collaborators, Outcome, Uplink, UplinkProcessor};

#[derive(Parser)]
#[command(name = "vsm", version, about = "LoRa Edge tracker uplink processor")]
struct Cli {
    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Position solver API key
    #[arg(long, env = "VSM_API_KEY", global = true, hide_env_values = true)]
    api_key: Option<String>,

    /// SQLite database path
    #[arg(long, env = "VSM_STORE", global = true)]
    db_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP ingest API
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        port: Option<u16>,

        /// Require this bearer token on every request
        #[arg(long, env = "VSM_AUTH_TOKEN", hide_env_values = true)]
        auth_token: Option<String>,
    },

    /// Process a JSON-lines file of uplink events ("-" for stdin)
    Replay {
        file: PathBuf,
    },

    /// Show stored device records
    Devices,

    /// Fetch the almanac and show how it would be delivered
    Almanac {
        /// Max downlink payload size in bytes
        #[arg(long)]
        max_size: Option<usize>,
    },

    /// Write the default config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let mut config = config::load_config();
    if let Some(key) = cli.api_key {
        config.solver.api_key = Some(key);
    }
    if let Some(path) = cli.db_path {
        config.store.path = path;
    }

    let result = match cli.command {
        Commands::Serve {
            host,
            port,
            auth_token,
        } => cmd_serve(config, host, port, auth_token).await,
        Commands::Replay { file } => cmd_replay(config, &file).await,
        Commands::Devices => cmd_devices(&config).await,
        Commands::Almanac { max_size } => cmd_almanac(&config, max_size).await,
        Commands::InitConfig { force } => cmd_init_config(force),
    };

    if let Err(e) = result {
        error!(error = %e, "command failed");
        std::process::exit(1);
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

fn open_store(config: &Config) -> Result<Arc<SqliteStore>> {
    let store = SqliteStore::open(&config.store.path)?;
    info!(path = %config.store.path, "state store opened");
    Ok(Arc::new(store))
}

fn collaborators(config: &Config, store: Arc<SqliteStore>) -> Collaborators {
    if config.solver.api_key.is_none() && !config.solver.disabled {
        warn!("no solver API key configured, position solving and almanac downloads will fail");
    }
    let downlinker: Arc<dyn Downlinker> = match &config.downlink.url {
        Some(url) => Arc::new(HttpDownlinker::new(url)),
        None => Arc::new(LogDownlinker),
    };
    let publisher: Arc<dyn Publisher> = match &config.publisher.webhook {
        Some(url) => Arc::new(WebhookPublisher::new(url)),
        None => Arc::new(LogPublisher),
    };

    Collaborators {
        store,
        solver: Arc::new(LoraCloudSolver::new(
            &config.solver.url,
            config.solver.api_key.clone(),
        )),
        downlinker,
        translator: Arc::new(PassthroughTranslator::default()),
        publisher,
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn cmd_serve(
    config: Config,
    host: Option<String>,
    port: Option<u16>,
    auth_token: Option<String>,
) -> Result<()> {
    let store = open_store(&config)?;
    let (processor, mut outcomes) = UplinkProcessor::new(collaborators(&config, store.clone()), &config);

    tokio::spawn(async move {
        while let Some(outcome) = outcomes.recv().await {
            match outcome.result {
                Ok(frames) => info!(device = %outcome.device_id, task = %outcome.task_id, frames, "almanac delivered"),
                Err(e) => warn!(device = %outcome.device_id, task = %outcome.task_id, error = %e, "almanac not delivered"),
            }
        }
    });

    let state = Arc::new(web::AppState {
        processor: Arc::new(processor),
        store,
        auth_token: auth_token.or(config.server.auth_token.clone()),
    });
    let host = host.unwrap_or(config.server.host);
    let port = port.unwrap_or(config.server.port);

    web::serve(state, &host, port).await
}

#[derive(Default)]
struct ReplaySummary {
    lines: u64,
    invalid: u64,
    stored: u64,
    ignored: u64,
    no_result: u64,
    failed: u64,
    almanac_delivered: u64,
    almanac_failed: u64,
    almanac_frames: usize,
}

async fn cmd_replay(config: Config, file: &Path) -> Result<()> {
    let reader: Box<dyn BufRead> = if file == Path::new("-") {
        Box::new(io::stdin().lock())
    } else {
        Box::new(BufReader::new(std::fs::File::open(file)?))
    };

    let store = open_store(&config)?;
    let (processor, mut outcomes) = UplinkProcessor::new(collaborators(&config, store), &config);
    let mut summary = ReplaySummary::default();

    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        summary.lines += 1;

        let uplink: Uplink = match serde_json::from_str(line) {
            Ok(u) => u,
            Err(e) => {
                warn!(line = summary.lines, error = %e, "skipping malformed uplink event");
                summary.invalid += 1;
                continue;
            }
        };

        match processor.handle(uplink).await {
            Ok(Outcome::Stored(_)) => summary.stored += 1,
            Ok(Outcome::Ignored) => summary.ignored += 1,
            Ok(Outcome::NoResult) => summary.no_result += 1,
            Err(e) => {
                warn!(line = summary.lines, error = %e, "uplink rejected");
                summary.failed += 1;
            }
        }
    }

    let pending = processor.downloads().in_flight();
    if pending > 0 {
        info!(pending, "waiting for almanac downloads");
    }
    processor.downloads().join_all().await;
    while let Ok(outcome) = outcomes.try_recv() {
        match outcome.result {
            Ok(frames) => {
                summary.almanac_delivered += 1;
                summary.almanac_frames += frames;
            }
            Err(_) => summary.almanac_failed += 1,
        }
    }

    println!();
    println!(
        "Replay complete: {}",
        if file == Path::new("-") {
            "stdin".to_string()
        } else {
            file.display().to_string()
        }
    );
    println!(
        "  Uplinks: {} read, {} malformed, {} rejected",
        summary.lines, summary.invalid, summary.failed
    );
    println!(
        "  Results: {} stored, {} ignored, {} without new data",
        summary.stored, summary.ignored, summary.no_result
    );
    println!(
        "  Almanac: {} delivered ({} frames), {} failed",
        summary.almanac_delivered, summary.almanac_frames, summary.almanac_failed
    );
    println!();
    println!("Database: {}", config.store.path);
    Ok(())
}

fn format_epoch(ts: f64) -> String {
    DateTime::<Utc>::from_timestamp(ts as i64, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or("-".into())
}

async fn cmd_devices(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let rows = store.list().await?;

    println!();
    println!("Database: {}  ({} devices)", config.store.path, rows.len());
    println!();
    if rows.is_empty() {
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec![
        "Device", "Updated", "Uplinks", "Errors", "Lat", "Lng", "Acc (m)", "Algorithm", "Rules CRC",
        "Almanac", "Translator",
    ]);

    for row in &rows {
        let state = &row.state;
        let gnss = state.gnss.as_ref();
        let uplinks = store.count_diffs(&row.device_id)?;
        let errors = store.errors(&row.device_id)?.len();
        table.add_row(vec![
            Cell::new(&row.device_id),
            Cell::new(format_epoch(row.updated_at)),
            Cell::new(uplinks),
            Cell::new(errors),
            Cell::new(state.latitude.map(|l| format!("{l:.5}")).unwrap_or("-".into())),
            Cell::new(state.longitude.map(|l| format!("{l:.5}")).unwrap_or("-".into())),
            Cell::new(state.accuracy.map(|a| format!("{a:.0}")).unwrap_or("-".into())),
            Cell::new(state.algorithm_type.as_deref().unwrap_or("-")),
            Cell::new(
                state
                    .rules_crc32()
                    .map(|c| format!("{c:08X}"))
                    .unwrap_or("-".into()),
            ),
            Cell::new(
                gnss.and_then(|g| g.almanac_timestamp)
                    .map(|t| t.format("%Y-%m-%d").to_string())
                    .unwrap_or("-".into()),
            ),
            Cell::new(
                state
                    .vsm
                    .as_ref()
                    .and_then(|v| v.translator_version.as_deref())
                    .unwrap_or("-"),
            ),
        ]);
    }

    println!("{table}");
    Ok(())
}

async fn cmd_almanac(config: &Config, max_size: Option<usize>) -> Result<()> {
    let max_size = max_size.unwrap_or(config.rules.default_max_size);
    let budget = chunk_budget(max_size)?;

    let solver = LoraCloudSolver::new(&config.solver.url, config.solver.api_key.clone());
    let almanac = solver
        .load_almanac()
        .await
        .ok_or_else(|| VsmError::Upstream("almanac unavailable (is an API key configured?)".into()))?;
    let frames = plan_almanac(&almanac, max_size)?;

    println!();
    println!("Almanac: {} bytes", almanac.image.len());
    match &almanac.compressed {
        Some(c) => println!(
            "  Compressed: {} bytes ({:.1}% of image)",
            c.len(),
            c.len() as f64 * 100.0 / almanac.image.len() as f64
        ),
        None => println!("  Compressed: not used"),
    }
    println!(
        "  Plan: {} frames at max size {max_size} ({budget} bytes per chunk)",
        frames.len()
    );
    println!();

    let mut table = Table::new();
    table.set_header(vec!["#", "Tag", "Bytes", "Payload"]);
    for (i, frame) in frames.iter().enumerate() {
        let hex = frame.payload_hex();
        let preview = if hex.len() > 24 {
            format!("{}…", &hex[..24])
        } else {
            hex
        };
        table.add_row(vec![
            Cell::new(i),
            Cell::new(frame.tag().map(|t| t.name()).unwrap_or("-")),
            Cell::new(frame.payload.len()),
            Cell::new(preview),
        ]);
    }
    println!("{table}");
    Ok(())
}

fn cmd_init_config(force: bool) -> Result<()> {
    let path = config::config_file();
    if path.exists() && !force {
        return Err(VsmError::Config(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }
    let written = config::save_config(&Config::default())?;
    println!("Wrote {}", written.display());
    Ok(())
}
