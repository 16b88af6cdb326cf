use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use schedule_watchbot::notify::TelegramNotifier;
use schedule_watchbot::parser::XlsxScheduleParser;
use schedule_watchbot::site::HttpSource;
use schedule_watchbot::update::{Updater, UpdaterSettings};
use schedule_watchbot::{config, db};
use teloxide::Bot;

/// Run a single ingestion cycle and print its progress.
#[derive(Parser, Debug)]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Re-parse even if the file is unchanged
    #[arg(long)]
    force: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let bot = Bot::new(cfg.telegram.bot_token.clone());
    let updater = Updater::new(
        pool,
        Arc::new(HttpSource::new(cfg.request_timeout())?),
        Arc::new(XlsxScheduleParser::new(cfg.parser_options())),
        Arc::new(TelegramNotifier::new(bot)),
        UpdaterSettings::from_config(&cfg)?,
    );

    let print = |line: &str| println!("{line}");
    let outcome = updater.force_update(&print, args.force).await?;
    println!("{outcome:?}");
    Ok(())
}
