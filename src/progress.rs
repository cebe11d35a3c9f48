use std::collections::HashMap;
use std::time::Duration;

use crossterm::style::Stylize;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How often the pull aggregator reports cumulative bytes.
pub const PULL_REPORT_INTERVAL: Duration = Duration::from_secs(10);

/// A simple spinner for long-running stages.
pub struct Spinner {
    bar: ProgressBar,
}

impl Spinner {
    pub fn new(message: impl Into<String>) -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(spinner_style());
        bar.set_message(message.into());
        bar.enable_steady_tick(Duration::from_millis(80));
        Self { bar }
    }

    /// A spinner that draws nothing, used when log lines own the terminal.
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    /// Handle to the underlying bar, for components that report their own progress.
    pub fn clone_bar(&self) -> ProgressBar {
        self.bar.clone()
    }

    /// Clear the spinner and print a `✔ message` line to stderr.
    pub fn finish(self, message: impl Into<String>) {
        self.bar.finish_and_clear();
        if !self.bar.is_hidden() {
            eprintln!("{} {}", "✔".green(), message.into());
        }
    }

    /// Clear the spinner and print a `✘ message` line to stderr.
    pub fn fail(self, message: impl Into<String>) {
        self.bar.finish_and_clear();
        if !self.bar.is_hidden() {
            eprintln!("{} {}", "✘".red(), message.into());
        }
    }
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.dim} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// Turns the runtime's cumulative per-layer byte counts into deltas.
#[derive(Debug, Default)]
pub struct LayerProgress {
    seen: HashMap<String, u64>,
}

impl LayerProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the cumulative `current` for `layer` and return the bytes not
    /// reported before. A counter that goes backwards (a restarted layer)
    /// contributes nothing until it passes its previous high-water mark.
    pub fn observe(&mut self, layer: &str, current: u64) -> u64 {
        let last = self.seen.entry(layer.to_string()).or_insert(0);
        let delta = current.saturating_sub(*last);
        *last = (*last).max(current);
        delta
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AggregatorState {
    /// No bytes seen yet, the report timer is not running.
    Idle,
    Reporting,
    Stopped,
}

/// Sending half handed to the pull decoder. Sends never block.
pub type DeltaSender = mpsc::UnboundedSender<u64>;

/// Spawn the byte aggregator. It sums deltas, logs the running total every
/// `interval` once the first delta arrives, logs a final summary when every
/// sender is dropped, and returns the total through its handle.
pub fn spawn_aggregator(
    interval: Duration,
    bar: Option<ProgressBar>,
) -> (DeltaSender, JoinHandle<u64>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(aggregate(rx, interval, bar));
    (tx, handle)
}

async fn aggregate(
    mut deltas: mpsc::UnboundedReceiver<u64>,
    interval: Duration,
    bar: Option<ProgressBar>,
) -> u64 {
    let mut state = AggregatorState::Idle;
    let mut total: u64 = 0;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    while state != AggregatorState::Stopped {
        tokio::select! {
            delta = deltas.recv() => match delta {
                Some(bytes) => {
                    total += bytes;
                    if state == AggregatorState::Idle {
                        // First tick of a fresh interval fires immediately; skip it.
                        ticker.reset();
                        state = AggregatorState::Reporting;
                    }
                    if let Some(bar) = &bar {
                        bar.set_message(format!("Pulling image ({} downloaded)", format_bytes(total)));
                    }
                }
                None => state = AggregatorState::Stopped,
            },
            _ = ticker.tick(), if state == AggregatorState::Reporting => {
                tracing::info!(bytes = total, "Downloading image ({} downloaded)", format_bytes(total));
            }
        }
    }

    if total > 0 {
        tracing::info!(bytes = total, "Finished downloading image ({} downloaded)", format_bytes(total));
    }
    total
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    for unit in UNITS {
        if size < 1024.0 {
            return if size.fract() < 0.05 {
                format!("{:.0} {unit}", size)
            } else {
                format!("{:.1} {unit}", size)
            };
        }
        size /= 1024.0;
    }
    format!("{:.1} TB", size)
}
