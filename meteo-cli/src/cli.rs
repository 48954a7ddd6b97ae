use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use inquire::{Password, Text};
use meteo_core::{Config, OpenMeteoClient, PipelineRunner, RunReport, config::DEFAULT_REGION};
use std::{
    path::{Path, PathBuf},
    pin::Pin,
    time::Duration,
};
use tokio::time::MissedTickBehavior;

/// Top-level CLI struct.
#[derive(Debug, Parser)]
#[command(name = "meteo", version, about = "Hourly weather to CSV pipeline")]
pub struct Cli {
    /// Config file to use instead of the platform default.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fetch every city once and upload the dataset.
    Run {
        /// Write the object under this directory instead of uploading to S3.
        #[arg(long)]
        local: Option<PathBuf>,
    },

    /// Run on a fixed cadence, waiting for the weather API to answer before each run.
    Schedule {
        /// Seconds between runs.
        #[arg(long, default_value_t = 3600)]
        every: u64,

        /// Seconds between reachability checks while the API is down.
        #[arg(long, default_value_t = 5)]
        poke_interval: u64,

        #[arg(long)]
        local: Option<PathBuf>,
    },

    /// Check once that the weather API is reachable.
    Check,

    /// Interactively set the storage destination and credentials.
    Configure,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let path = match &self.config {
            Some(path) => path.clone(),
            None => Config::config_file_path()?,
        };

        match self.command {
            Command::Run { local } => {
                let config = Config::load_from(&path)?;
                let report = run_once(&config, local.as_ref()).await?;
                print_report(&report);
            }
            Command::Schedule { every, poke_interval, local } => {
                let config = Config::load_from(&path)?;
                schedule(&config, every, poke_interval, local.as_ref()).await?;
            }
            Command::Check => {
                let config = Config::load_from(&path)?;
                let client = OpenMeteoClient::from_config(&config)?;
                client
                    .probe()
                    .await
                    .with_context(|| format!("{} is not reachable", config.api.endpoint))?;
                println!("{} is reachable", config.api.endpoint);
            }
            Command::Configure => configure(&path)?,
        }

        Ok(())
    }
}

async fn run_once(config: &Config, local: Option<&PathBuf>) -> Result<RunReport> {
    config.validate()?;

    // A fresh runner per run: no client state outlives it.
    let runner = match local {
        Some(root) => PipelineRunner::local(config, root)?,
        None => PipelineRunner::from_config(config)?,
    };

    let report = runner.run(&config.cities, &config.pipeline.variables).await?;
    tracing::info!(
        uploads = report.uploads,
        rows = report.rows,
        failed = report.failures.len(),
        gaps = report.gaps.len(),
        "run finished"
    );
    Ok(report)
}

async fn schedule(
    config: &Config,
    every: u64,
    poke_interval: u64,
    local: Option<&PathBuf>,
) -> Result<()> {
    if every == 0 {
        return Err(anyhow!("--every must be at least one second"));
    }
    config.validate()?;

    let client = OpenMeteoClient::from_config(config)?;
    let poke_interval = Duration::from_secs(poke_interval.max(1));
    let mut ticker = tokio::time::interval(Duration::from_secs(every));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // One Ctrl-C listener for the whole schedule; every stage of a cycle races it.
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("cannot listen for Ctrl-C: {e}");
        }
    };
    tokio::pin!(shutdown);

    loop {
        let cycle = async {
            ticker.tick().await;
            wait_until_reachable(&client, poke_interval).await;
            run_once(config, local).await
        };

        match or_shutdown(shutdown.as_mut(), cycle).await {
            Some(Ok(_)) => {}
            Some(Err(e)) => tracing::error!("run failed: {e:#}"),
            None => {
                tracing::info!("interrupted, stopping scheduler");
                return Ok(());
            }
        }
    }
}

/// Drive `work` to completion unless `shutdown` resolves first.
async fn or_shutdown<T>(
    shutdown: Pin<&mut impl Future<Output = ()>>,
    work: impl Future<Output = T>,
) -> Option<T> {
    tokio::select! {
        out = work => Some(out),
        () = shutdown => None,
    }
}

async fn wait_until_reachable(client: &OpenMeteoClient, poke_interval: Duration) {
    loop {
        match client.probe().await {
            Ok(()) => return,
            Err(e) => {
                tracing::warn!("weather API not reachable ({e}); next check in {poke_interval:?}");
                tokio::time::sleep(poke_interval).await;
            }
        }
    }
}

fn configure(path: &Path) -> Result<()> {
    let mut config = Config::load_from(path)?;

    config.storage.bucket = Text::new("Bucket:")
        .with_default(&config.storage.bucket)
        .prompt()?;
    config.storage.key = Text::new("Object key:")
        .with_default(&config.storage.key)
        .prompt()?;

    let default_region = config.storage.region.as_deref().unwrap_or(DEFAULT_REGION);
    let region = Text::new("Region:").with_default(default_region).prompt()?;
    config.storage.region = Some(region);

    let access_key_id = Text::new("Access key id (leave empty to use AWS_* environment variables):")
        .prompt()?;
    if access_key_id.trim().is_empty() {
        config.storage.access_key_id = None;
        config.storage.secret_access_key = None;
    } else {
        let secret = Password::new("Secret access key:")
            .without_confirmation()
            .prompt()?;
        config.upsert_storage_credentials(access_key_id.trim().to_string(), secret);
    }

    config.validate()?;
    config.save_to(path)?;
    println!("Saved configuration to {}", path.display());
    Ok(())
}

fn print_report(report: &RunReport) {
    println!(
        "Uploaded {} rows for {} cities ({} upload(s)).",
        report.rows,
        report.cities_ok.len(),
        report.uploads
    );
    for failure in &report.failures {
        println!("  skipped {}: {}", failure.city, failure.error);
    }
    for gap in &report.gaps {
        println!("  {} {}: {} sample(s) missing", gap.city, gap.variable, gap.missing);
    }
}
