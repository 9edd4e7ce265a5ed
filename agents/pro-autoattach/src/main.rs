//! Pro Auto-Attach Agent
//!
//! Fetches this machine's cloud identity document and watches the cloud
//! metadata service for a Pro license.
//!
//! # Usage
//! ```bash
//! # Detect the cloud, fetch identity, long-poll for a license
//! pro-autoattach --json
//!
//! # Single license check on a GCP focal image mounted at /mnt
//! pro-autoattach --cloud gcp --root /mnt --release focal --once
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use pro_autoattach::{
    all_instances, instance_for, AttachError, AutoAttach, AutoAttachConfig, CloudType,
    FixedRelease, HostRoot, HttpFetcher, InstanceContext, OsRelease, PollOutcome, ReleaseInfo,
};

const EXIT_ERROR: u8 = 1;
const EXIT_STOP_POLLING: u8 = 2;
const EXIT_RETRY_LATER: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "pro-autoattach")]
#[command(about = "Cloud Pro auto-attach agent", long_about = None)]
#[command(version)]
struct Cli {
    /// JSON configuration file
    #[arg(long, env = "PRO_AUTOATTACH_CONFIG")]
    config: Option<PathBuf>,

    /// Skip detection and use this cloud (aws, azure, gcp)
    #[arg(long, env = "PRO_AUTOATTACH_CLOUD")]
    cloud: Option<CloudType>,

    /// Release codename instead of reading os-release
    #[arg(long, env = "PRO_AUTOATTACH_RELEASE")]
    release: Option<String>,

    /// Filesystem root for viability markers and os-release
    #[arg(long, default_value = "/")]
    root: PathBuf,

    /// One plain license check instead of long-polling
    #[arg(long, default_value = "false")]
    once: bool,

    /// Seconds to wait after a failed or quick license check
    #[arg(long, env = "PRO_AUTOATTACH_POLLING_INTERVAL")]
    polling_interval: Option<u64>,

    /// Maximum license requests per session
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Stop polling after this many seconds
    #[arg(long)]
    deadline: Option<u64>,

    /// Proxy for http:// metadata requests
    #[arg(long, env = "http_proxy")]
    http_proxy: Option<String>,

    /// Proxy for https:// metadata requests
    #[arg(long, env = "https_proxy")]
    https_proxy: Option<String>,

    /// Machine is already attached
    #[arg(long, default_value = "false")]
    attached: bool,

    /// Stop polling once this file exists
    #[arg(long)]
    attached_marker: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log as JSON
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn load_config(&self) -> Result<AutoAttachConfig> {
        let mut config = match &self.config {
            Some(path) => AutoAttachConfig::from_file(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => AutoAttachConfig::default(),
        };

        if let Some(secs) = self.polling_interval {
            config.polling_interval_secs = secs;
        }
        if self.max_attempts.is_some() {
            config.max_poll_attempts = self.max_attempts;
        }
        if self.deadline.is_some() {
            config.poll_deadline_secs = self.deadline;
        }
        if self.http_proxy.is_some() {
            config.proxies.http = self.http_proxy.clone();
        }
        if self.https_proxy.is_some() {
            config.proxies.https = self.https_proxy.clone();
        }
        config.attached |= self.attached;

        config.validate()?;
        Ok(config)
    }
}

fn init_logging(verbose: bool, json: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Auto-attach failed");
            ExitCode::from(EXIT_ERROR)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = cli.load_config()?;

    let release: Arc<dyn ReleaseInfo> = match &cli.release {
        Some(series) => Arc::new(FixedRelease::new(series.clone())),
        None => Arc::new(OsRelease::under_root(&cli.root)),
    };

    let fetcher = HttpFetcher::new(&config.proxies).context("Failed to build HTTP client")?;
    let ctx = InstanceContext::new(fetcher, release, HostRoot::new(&cli.root)).with_timeouts(&config);

    info!(
        root = %cli.root.display(),
        cloud = ?cli.cloud,
        polling_interval = config.polling_interval_secs,
        "Starting Pro auto-attach"
    );

    let mut attach = match cli.cloud {
        Some(cloud) => {
            AutoAttach::new(vec![instance_for(cloud, &ctx)], config.clone()).skip_viability_check()
        }
        None => AutoAttach::new(all_instances(&ctx), config.clone()),
    };
    if cli.once {
        attach = attach.single_check();
    }
    if let Some(marker) = cli.attached_marker.clone() {
        attach = attach.with_attached_check(
            Arc::new(move || marker.exists()),
            config.polling_interval(),
        );
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current request");
            on_signal.cancel();
        }
    });

    let report = match attach.run(&cancel).await {
        Ok(report) => report,
        Err(e @ (AttachError::AlreadyAttached | AttachError::AutoAttachDisabled)) => {
            info!(reason = e.code(), "Nothing to do");
            return Ok(ExitCode::SUCCESS);
        }
        Err(e) => return Err(e).context("Auto-attach session failed"),
    };

    println!("{}", serde_json::to_string_pretty(&report.summary())?);

    let code = match report.license {
        None | Some(PollOutcome::Entitled(true)) => ExitCode::SUCCESS,
        Some(PollOutcome::StopPolling) => ExitCode::from(EXIT_STOP_POLLING),
        Some(PollOutcome::Entitled(false) | PollOutcome::RetryAfterDelay) => {
            ExitCode::from(EXIT_RETRY_LATER)
        }
    };
    Ok(code)
}
