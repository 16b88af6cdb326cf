//! Schedule page scraping and file download.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, Url};
use scraper::{Html, Selector};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

const USER_AGENT: &str = concat!("schedule-watchbot/", env!("CARGO_PKG_VERSION"));

/// Word an anchor's text or href must contain to count as a schedule link.
const SCHEDULE_WORD: &str = "расписание";

static LINK_DATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{2})[._](\d{2})[._](\d{4})").unwrap());

/// Where schedule pages and files come from.
#[async_trait]
pub trait ScheduleSource: Send + Sync {
    async fn fetch_page(&self, url: &Url) -> Result<String>;

    async fn fetch_bytes(&self, url: &Url) -> Result<Vec<u8>>;
}

#[derive(Clone)]
pub struct HttpSource {
    http: Client,
}

impl fmt::Debug for HttpSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSource").finish_non_exhaustive()
    }
}

impl HttpSource {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self { http })
    }

    async fn get(&self, url: &Url) -> Result<reqwest::Response> {
        let res = self
            .http
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("failed to reach {url}"))?;
        if !res.status().is_success() {
            return Err(anyhow!("GET {} returned {}", url, res.status()));
        }
        Ok(res)
    }
}

#[async_trait]
impl ScheduleSource for HttpSource {
    async fn fetch_page(&self, url: &Url) -> Result<String> {
        let res = self.get(url).await?;
        res.text().await.context("failed to read page body")
    }

    async fn fetch_bytes(&self, url: &Url) -> Result<Vec<u8>> {
        let res = self.get(url).await?;
        let bytes = res.bytes().await.context("failed to read file body")?;
        debug!(%url, size = bytes.len(), "downloaded");
        Ok(bytes.to_vec())
    }
}

/// Bounded fixed-delay retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

fn link_date(text: &str) -> Option<NaiveDate> {
    let caps = LINK_DATE_RE.captures(text)?;
    NaiveDate::from_ymd_opt(caps[3].parse().ok()?, caps[2].parse().ok()?, caps[1].parse().ok()?)
}

fn is_spreadsheet_href(href: &str) -> bool {
    let path = href.split(['?', '#']).next().unwrap_or(href);
    path.to_lowercase().ends_with(".xlsx")
}

/// Choose the schedule file among the page's `.xlsx` anchors.
///
/// Only anchors whose text or href mention the schedule word are considered.
/// The one with the latest `dd.mm.yyyy` (or `dd_mm_yyyy`) date wins; without
/// any dated anchor the last considered one is taken. Relative hrefs are
/// resolved against `origin`.
pub fn pick_schedule_link(html: &str, origin: &Url) -> Option<Url> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("a[href]").ok()?;

    let mut best: Option<(NaiveDate, &str)> = None;
    let mut last: Option<&str> = None;
    for anchor in document.select(&selector) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        if !is_spreadsheet_href(href) {
            continue;
        }
        let text: String = anchor.text().collect();
        let haystack = format!("{} {}", text.trim(), href);
        if !haystack.to_lowercase().contains(SCHEDULE_WORD) {
            continue;
        }
        last = Some(href);
        if let Some(date) = link_date(&haystack) {
            if best.map_or(true, |(current, _)| date > current) {
                best = Some((date, href));
            }
        }
    }

    let href = best.map(|(_, href)| href).or(last)?;
    match origin.join(href.trim()) {
        Ok(url) => {
            debug!(%url, "schedule link selected");
            Some(url)
        }
        Err(err) => {
            warn!(href, ?err, "unusable schedule href");
            None
        }
    }
}

/// Fetch `page_url` and pick the schedule link, retrying per `policy` when the
/// page can't be fetched or holds no candidate.
///
/// `Ok(None)` means the page was reachable but offered no link; `Err` carries
/// the last network error when every attempt failed to fetch the page.
pub async fn find_schedule_link(
    source: &dyn ScheduleSource,
    page_url: &Url,
    origin: &Url,
    policy: RetryPolicy,
) -> Result<Option<Url>> {
    let attempts = policy.attempts.max(1);
    let mut last_error = None;
    let mut fetched = false;
    for attempt in 1..=attempts {
        match source.fetch_page(page_url).await {
            Ok(html) => {
                fetched = true;
                if let Some(url) = pick_schedule_link(&html, origin) {
                    info!(%url, attempt, "schedule link found");
                    return Ok(Some(url));
                }
                debug!(attempt, "no schedule link on page");
            }
            Err(err) => {
                warn!(attempt, error = %err, "schedule page fetch failed");
                last_error = Some(err);
            }
        }
        if attempt < attempts && !policy.delay.is_zero() {
            tokio::time::sleep(policy.delay).await;
        }
    }
    match (fetched, last_error) {
        (false, Some(err)) => Err(err),
        _ => Ok(None),
    }
}

/// ASCII-only form of a download URL: non-ASCII path characters are
/// percent-encoded and existing escapes kept.
pub fn encode_download_url(raw: &str) -> Result<Url> {
    Url::parse(raw.trim()).with_context(|| format!("invalid download url {raw:?}"))
}

/// SHA-256 of the file contents, lower-case hex.
pub fn content_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
