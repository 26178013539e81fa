// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! stagedl - download URLs with progress bars, resuming any staged data.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::{mpsc, oneshot};
use tracing::Level;

use stagedl::locks::resilient_lock;
use stagedl::{DownloadHints, DownloadObserver, Downloader, DownloaderConfig};

/// Exit code when every download finished
const SUCCESS: i32 = 0;
/// Exit code when at least one download was cancelled or failed
const INCOMPLETE: i32 = 1;
/// Exit code after Ctrl-C
const INTERRUPTED: i32 = 130;

/// Bar resolution; progress fractions are scaled onto this many steps.
const BAR_STEPS: u64 = 1000;

/// stagedl - concurrent, resumable downloads
#[derive(Parser)]
#[command(name = "stagedl")]
#[command(version)]
#[command(about = "Download files concurrently, resuming from staged partial data.")]
#[command(long_about = "stagedl - concurrent, resumable downloads\n\n\
    Download two files:     stagedl https://host/a.iso https://host/b.iso\n\
    Three at a time:        stagedl -j 3 <url>...\n\
    Into a directory:       stagedl --dest ~/Downloads <url>\n\n\
    Interrupted downloads resume from their staging file on the next run.\n\
    Ctrl-C deletes every unfinished download.")]
struct Cli {
    /// URLs to download
    #[arg(required = true)]
    urls: Vec<String>,

    /// Maximum number of simultaneous transfers
    #[arg(short = 'j', long)]
    concurrency: Option<usize>,

    /// Seconds without data before a transfer is abandoned (0 disables)
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Directory for finished files
    #[arg(short, long)]
    dest: Option<PathBuf>,

    /// Settings file (defaults to the user config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log verbosity (error, warn, info, debug, trace)
    #[arg(long, default_value_t = Level::WARN)]
    log_level: Level,
}

/// How one locator ended.
enum Outcome {
    Finished(String),
    Cancelled(String),
}

/// Draws one bar per download and reports terminal events to `main`.
struct ProgressObserver {
    bars: MultiProgress,
    active: Mutex<HashMap<String, ProgressBar>>,
    outcomes: mpsc::UnboundedSender<Outcome>,
}

impl ProgressObserver {
    fn new(outcomes: mpsc::UnboundedSender<Outcome>) -> Self {
        Self {
            bars: MultiProgress::new(),
            active: Mutex::new(HashMap::new()),
            outcomes,
        }
    }

    fn with_bar(&self, locator: &str, f: impl FnOnce(&ProgressBar)) {
        if let Some(bar) = resilient_lock(&self.active).get(locator) {
            f(bar);
        }
    }

    fn close_bar(&self, locator: &str, message: &str) {
        if let Some(bar) = resilient_lock(&self.active).remove(locator) {
            bar.abandon_with_message(message.to_string());
        }
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{bar:40.cyan/blue}] {percent:>3}% {prefix} | {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓░")
}

impl DownloadObserver for ProgressObserver {
    fn will_start(&self, locator: &str) {
        let mut active = resilient_lock(&self.active);
        if active.contains_key(locator) {
            return;
        }
        let bar = self.bars.add(ProgressBar::new(BAR_STEPS));
        bar.set_style(bar_style());
        bar.set_prefix(display_name(locator));
        bar.set_message("queued");
        active.insert(locator.to_string(), bar);
    }

    fn did_start(&self, locator: &str) {
        self.with_bar(locator, |bar| bar.set_message("downloading"));
    }

    fn on_size_known(&self, locator: &str, total_bytes: u64) {
        if total_bytes > 0 {
            self.with_bar(locator, |bar| bar.set_message(format!("{}", HumanBytes(total_bytes))));
        }
    }

    fn on_progress(&self, locator: &str, fraction: f64) {
        self.with_bar(locator, |bar| {
            bar.set_position((fraction * BAR_STEPS as f64).round() as u64)
        });
    }

    fn on_paused(&self, locator: &str) {
        self.with_bar(locator, |bar| bar.set_message("paused"));
    }

    fn on_finished(&self, locator: &str, path: &Path) {
        self.with_bar(locator, |bar| bar.set_position(BAR_STEPS));
        self.close_bar(locator, &format!("saved to {}", path.display()));
        let _ = self.outcomes.send(Outcome::Finished(locator.to_string()));
    }

    fn on_cancelled(&self, locator: &str) {
        self.close_bar(locator, "cancelled");
        let _ = self.outcomes.send(Outcome::Cancelled(locator.to_string()));
    }

    fn resolve_file_name(&self, locator: &str) -> Option<String> {
        file_name_from_url(locator)
    }
}

/// Last non-empty path segment of a URL.
fn file_name_from_url(locator: &str) -> Option<String> {
    let url = reqwest::Url::parse(locator).ok()?;
    url.path_segments()?
        .filter(|segment| !segment.is_empty())
        .last()
        .map(str::to_string)
}

fn display_name(locator: &str) -> String {
    file_name_from_url(locator).unwrap_or_else(|| locator.to_string())
}

fn load_config(cli: &Cli) -> Result<DownloaderConfig> {
    let path = cli.config.clone().unwrap_or_else(DownloaderConfig::default_path);
    let mut config = DownloaderConfig::load_from(&path)?.with_env_overrides();

    if let Some(cap) = cli.concurrency {
        config.concurrency_cap = cap;
    }
    if let Some(secs) = cli.timeout {
        config.timeout_secs = secs;
    }
    if let Some(dest) = &cli.dest {
        config.cache_dir = Some(dest.clone());
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&cli)?;
    let downloader = Downloader::with_http(&config).context("Failed to start HTTP engine")?;

    let (outcome_tx, mut outcomes) = mpsc::unbounded_channel();
    let observer = Arc::new(ProgressObserver::new(outcome_tx));
    downloader.add_observer(&observer);

    let (interrupt_tx, mut interrupts) = mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        let _ = interrupt_tx.send(());
    })
    .context("Failed to install Ctrl-C handler")?;

    let mut seen = HashSet::new();
    let urls: Vec<String> = cli
        .urls
        .iter()
        .filter(|url| seen.insert(url.as_str()))
        .cloned()
        .collect();

    for url in &urls {
        downloader.download_with(url.clone(), DownloadHints::default());
    }

    let mut pending: HashSet<&str> = urls.iter().map(String::as_str).collect();
    let mut failed = 0usize;

    while !pending.is_empty() {
        tokio::select! {
            outcome = outcomes.recv() => {
                let Some(outcome) = outcome else { break };
                match outcome {
                    Outcome::Finished(locator) => {
                        pending.remove(locator.as_str());
                    }
                    Outcome::Cancelled(locator) => {
                        if pending.remove(locator.as_str()) {
                            failed += 1;
                        }
                    }
                }
            }
            _ = interrupts.recv() => {
                let unfinished: Vec<String> = pending.iter().map(|l| l.to_string()).collect();
                eprintln!("Interrupted; deleting {} unfinished download(s)", unfinished.len());

                let (done_tx, done) = oneshot::channel();
                downloader.delete_unfinished_tasks(
                    unfinished,
                    Some(Box::new(move || {
                        let _ = done_tx.send(());
                    })),
                );
                let _ = done.await;
                std::process::exit(INTERRUPTED);
            }
        }
    }

    let code = if failed == 0 { SUCCESS } else { INCOMPLETE };
    if failed > 0 {
        eprintln!("{} of {} download(s) did not finish", failed, urls.len());
    }
    drop(downloader);
    std::process::exit(code);
}
