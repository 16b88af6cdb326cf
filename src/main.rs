use anyhow::Result;
use clap::Parser;
use schedule_watchbot::handlers::{self, BotState};
use schedule_watchbot::notify::TelegramNotifier;
use schedule_watchbot::parser::XlsxScheduleParser;
use schedule_watchbot::site::HttpSource;
use schedule_watchbot::update::{Updater, UpdaterSettings};
use schedule_watchbot::{config, db};
use std::path::PathBuf;
use std::sync::Arc;
use teloxide::prelude::*;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
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

    let updater = Arc::new(Updater::new(
        pool.clone(),
        Arc::new(HttpSource::new(cfg.request_timeout())?),
        Arc::new(XlsxScheduleParser::new(cfg.parser_options())),
        Arc::new(TelegramNotifier::new(bot.clone())),
        UpdaterSettings::from_config(&cfg)?,
    ));

    // Periodic ingestion; manual /update runs share the same lock.
    let periodic = updater.clone();
    let interval = cfg.check_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let status = |line: &str| debug!(status = line, "auto-update");
            if let Err(err) = periodic.force_update(&status, false).await {
                error!(%err, "scheduled update failed");
            }
        }
    });

    let state = BotState {
        pool,
        updater,
        admin_id: cfg.telegram.admin_id,
    };

    info!("starting telegram bot");
    teloxide::repl(bot, move |bot: Bot, msg: Message| {
        let state = state.clone();
        async move {
            if let Err(err) = handlers::handle_update(&bot, &state, &msg).await {
                error!(?err, "failed to handle update");
            }
            respond(())
        }
    })
    .await;

    Ok(())
}
