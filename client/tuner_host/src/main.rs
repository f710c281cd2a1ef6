mod console;

use std::process;
use std::time::Duration;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;
use tuner_runtime::RuntimeConfig;

use crate::console::ConsolePresenter;

/// Headless console for tuning the parameters of a remote node.
#[derive(Parser)]
#[command(name = "tuner_host")]
#[command(about = "Connect to a tuning server and edit node parameters from the terminal", long_about = None)]
struct Cli {
    /// Server websocket URL (overrides TUNER_URL)
    #[arg(short, long)]
    url: Option<String>,

    /// Maximum queued outbound messages (overrides TUNER_OUTBOUND_QUEUE_CAP)
    #[arg(long)]
    queue_cap: Option<usize>,

    /// Socket poll interval in milliseconds (overrides TUNER_POLL_INTERVAL_MS)
    #[arg(long)]
    poll_ms: Option<u64>,

    /// Telemetry window for scopes that do not declare one (overrides TUNER_KEEP_LAST_SECS)
    #[arg(long, allow_negative_numbers = true)]
    keep_last_secs: Option<f64>,
}

impl Cli {
    fn overlay(self, mut config: RuntimeConfig) -> RuntimeConfig {
        if let Some(url) = self.url {
            config.url = url;
        }
        if let Some(cap) = self.queue_cap.filter(|cap| *cap > 0) {
            config.outbound_queue_cap = cap;
        }
        if let Some(ms) = self.poll_ms.filter(|ms| *ms > 0) {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = self
            .keep_last_secs
            .filter(|secs| secs.is_finite() && *secs > 0.0)
        {
            config.default_keep_last_secs = secs;
        }
        config
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run() {
        error!(%err, "tuner_host fatal error");
        process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Cli::parse().overlay(RuntimeConfig::from_env());
    let mut presenter = ConsolePresenter::from_stdin();
    tuner_runtime::run(&config, &mut presenter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_environment() {
        let cli = Cli::parse_from([
            "tuner_host",
            "--url",
            "ws://10.0.0.1:9000/ws",
            "--poll-ms",
            "20",
            "--keep-last-secs",
            "3.5",
        ]);
        let config = cli.overlay(RuntimeConfig::default());

        assert_eq!(config.url, "ws://10.0.0.1:9000/ws");
        assert_eq!(config.poll_interval, Duration::from_millis(20));
        assert_eq!(config.default_keep_last_secs, 3.5);
        assert_eq!(
            config.outbound_queue_cap,
            RuntimeConfig::default().outbound_queue_cap
        );
    }

    #[test]
    fn non_positive_flags_are_ignored() {
        let cli = Cli::parse_from(["tuner_host", "--queue-cap", "0", "--keep-last-secs", "-2"]);
        assert_eq!(cli.keep_last_secs, Some(-2.0));
        assert_eq!(cli.overlay(RuntimeConfig::default()), RuntimeConfig::default());
    }
}
