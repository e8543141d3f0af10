use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use clap::Parser;
use tracing::{error, info, warn};

mod browser;
mod config;
mod error;
mod monitoring;
mod shutdown;
mod sink;

use browser::driver::LaunchOptions;
use browser::{BrowserLifecycleManager, BrowserProbe, BrowserProbeSettings, ChromiumDriver, LifecycleConfig};
use config::Config;
use monitoring::{
    AdmissionController, AdmissionState, HttpProbe, HttpProbeSettings, HyperTimer, ProbeExecutor,
    SchedulerTimings, SiteScheduler,
};
use shutdown::FatalShutdown;
use sink::{InfluxSink, MetricsSink};

/// Periodically benchmark websites and store the timings in InfluxDB
#[derive(Debug, Parser)]
#[command(name = "websitebench", version, about)]
struct Cli {
    /// Path to the config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the secrets file (merged over [influx_db])
    #[arg(short, long)]
    secrets: Option<PathBuf>,

    /// Path to the Chromium executable
    #[arg(long = "browserpath")]
    browser_path: Option<PathBuf>,

    /// Ignore TLS certificate errors of checked sites
    #[arg(long)]
    ignore_ssl_errors: bool,

    /// Show the browser window
    #[arg(long)]
    no_headless: bool,

    /// Start the browser without its sandbox
    #[arg(long)]
    no_sandbox: bool,

    /// Log failed sub-resource requests as errors
    #[arg(long)]
    log_resource_errors: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

impl Cli {
    /// Command-line flags take precedence over the config file
    fn apply(&self, config: &mut Config) {
        if let Some(path) = &self.browser_path {
            config.browser.executable_path = Some(path.clone());
        }
        if self.ignore_ssl_errors {
            config.ignore_ssl_errors = true;
        }
        if self.no_headless {
            config.browser.headless = false;
        }
        if self.no_sandbox {
            config.browser.no_sandbox = true;
        }
        if self.log_resource_errors {
            config.log_resource_errors = true;
        }
        if self.debug {
            config.log_level = "debug".into();
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match Config::load(cli.config.as_deref(), cli.secrets.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Unable to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    cli.apply(&mut config);
    logger::init_with_level(logger::Level::parse(&config.log_level).unwrap_or_default());

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "websitebench starting");
    tracing::debug!("{config}");

    let fatal = FatalShutdown::new();
    let sites = config.site_entries()?;

    let sink: Arc<dyn MetricsSink> = Arc::new(InfluxSink::new(&config.influx_db)?);
    sink.check_connection()
        .await
        .context("Unable to connect to InfluxDB, check the [influx_db] settings")?;

    let jobs = Arc::new(AdmissionState::new(config.max_concurrent_jobs));
    let lifecycle = BrowserLifecycleManager::new(
        Arc::new(ChromiumDriver),
        LifecycleConfig {
            launch: LaunchOptions {
                headless: config.browser.headless,
                no_sandbox: config.browser.no_sandbox,
                executable_path: config.browser.executable_path.clone(),
                ignore_https_errors: config.ignore_ssl_errors,
                request_timeout: config.longest_interval(),
            },
            max_restarts: config.browser.max_restarts,
            restart_interval: config.browser.restart_interval(),
            ..Default::default()
        },
        Arc::clone(&jobs),
        fatal.clone(),
    );

    let maintenance = if config.needs_browser() {
        lifecycle.launch().await.context("Unable to start the browser")?;
        Some(lifecycle.start_maintenance())
    } else {
        info!("no enabled browser checks, not starting a browser");
        None
    };

    let http = HttpProbe::new(
        Arc::new(HyperTimer::new()?),
        HttpProbeSettings {
            repeat_count: config.repeat_count,
            parallel: config.http_parallel,
            user_agent: config.user_agent.clone(),
            ignore_ssl_errors: config.ignore_ssl_errors,
        },
    );
    let browser = BrowserProbe::new(
        Arc::clone(&lifecycle),
        BrowserProbeSettings {
            mode: config.browser_mode,
            repeat_count: config.repeat_count,
            allow_caching: config.allow_caching,
            user_agent: config.user_agent.clone(),
            log_resource_errors: config.log_resource_errors,
        },
    );

    let scheduler = SiteScheduler::start(
        Arc::new(AdmissionController::new(jobs, lifecycle.clone())),
        Arc::new(ProbeExecutor::new(Arc::new(http), Arc::new(browser))),
        sink,
        config.instance.clone(),
        SchedulerTimings::default(),
    );
    for site in sites {
        scheduler.register(site);
    }
    info!(sites = ?scheduler.scheduled_sites(), "checks scheduled");

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Unable to listen for Ctrl-C")?;
            warn!("Gracefully shutting down from SIGINT (Ctrl-C)");
            Ok(())
        }
        reason = fatal.wait() => Err(anyhow!(reason)),
    };

    scheduler.stop_all();
    if let Some(maintenance) = maintenance {
        maintenance.abort();
    }
    lifecycle.close().await;
    outcome
}
