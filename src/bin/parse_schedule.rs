use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use schedule_watchbot::parser::{ParserOptions, SheetParser, XlsxScheduleParser};
use schedule_watchbot::site::{HttpSource, RetryPolicy};
use schedule_watchbot::update::parse_only;
use std::time::Duration;

/// Parse one schedule spreadsheet and print the result as JSON.
/// Nothing is stored and nobody is notified.
#[derive(Parser, Debug)]
struct Args {
    /// Download the spreadsheet from this URL
    #[arg(long, conflicts_with = "file")]
    url: Option<String>,

    /// Read the spreadsheet from a local file
    #[arg(long)]
    file: Option<PathBuf>,

    /// Read "subject | | | room" rows as one lesson in that room
    #[arg(long)]
    wide_split_rooms: bool,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let parser = XlsxScheduleParser::new(ParserOptions {
        wide_split_rooms: args.wide_split_rooms,
    });

    let bundle = match (args.url, args.file) {
        (Some(url), _) => {
            let source = HttpSource::new(Duration::from_secs(args.timeout_secs))?;
            parse_only(&source, &parser, &url, RetryPolicy::default()).await?
        }
        (None, Some(path)) => {
            let bytes = tokio::fs::read(&path).await?;
            parser.parse(&bytes)?
        }
        (None, None) => bail!("pass --url or --file"),
    };

    println!("{}", serde_json::to_string_pretty(&bundle)?);
    Ok(())
}
