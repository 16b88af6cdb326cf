//! Outgoing Telegram messages.

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use tracing::{debug, warn};

/// Longest operator digest sent in one message.
pub const DIGEST_LIMIT: usize = 4000;

const SEND_CONCURRENCY: usize = 8;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send one HTML-formatted message.
    async fn send(&self, chat_id: i64, text: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct TelegramNotifier {
    bot: Bot,
}

impl TelegramNotifier {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, chat_id: i64, text: &str) -> Result<()> {
        self.bot
            .send_message(ChatId(chat_id), text)
            .parse_mode(ParseMode::Html)
            .await?;
        Ok(())
    }
}

/// Send every `(chat_id, text)` pair. Failures are logged and skipped; the
/// number of delivered messages is returned.
pub async fn dispatch(notifier: &dyn Notifier, messages: Vec<(i64, String)>) -> usize {
    let delivered = AtomicUsize::new(0);
    stream::iter(messages)
        .for_each_concurrent(SEND_CONCURRENCY, |(chat_id, text)| {
            let delivered = &delivered;
            async move {
                match notifier.send(chat_id, &text).await {
                    Ok(()) => {
                        delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => warn!(chat_id, error = %err, "notification not delivered"),
                }
            }
        })
        .await;
    let delivered = delivered.into_inner();
    debug!(delivered, "dispatch finished");
    delivered
}

/// Cut `text` to at most `limit` characters, marking the cut with `...`.
pub fn truncate(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
