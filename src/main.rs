use std::io;

use color_eyre::{Result, eyre::Context};
use log::info;
use tracing_log::LogTracer;
use tracing_subscriber::{EnvFilter, filter::LevelFilter};

mod config;
mod diff;
mod notify;
mod retry;
mod roblox;
mod storage;
mod tracker;

fn init_logging() -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .compact()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("TRACKER_LOG")
                .from_env()?,
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    LogTracer::init()?;
    Ok(())
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let env = config::Environment::load()?;
    init_logging()?;

    let settings = config::Settings::load(&env.config)
        .wrap_err_with(|| format!("failed to load config from {}", env.config.display()))?;
    let api = roblox::RobloxApi::new(&settings)?;
    let sink = notify::WebhookSink::new(&settings)?;

    let report = tracker::run(&settings, &api, &sink)?;
    info!(
        "Done: {} {} tracked, {} new, {} removed, {} webhooks sent, {} failed.",
        report.total_members,
        settings.relationship,
        report.new_members,
        report.removed_members,
        report.webhooks_sent,
        report.webhooks_failed
    );
    Ok(())
}
