//! One ingestion cycle: find the file, download, compare, parse, diff,
//! persist and notify.

use anyhow::Context;
use chrono::Utc;
use reqwest::Url;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use crate::config::{Config, ConfigError};
use crate::db::{self, Pool};
use crate::diff::{render_diff, schedules_equal};
use crate::format::escape_html;
use crate::model::{IngestionState, Lesson, ScheduleBundle};
use crate::notify::{dispatch, truncate, Notifier, DIGEST_LIMIT};
use crate::parser::SheetParser;
use crate::sheet::SheetError;
use crate::site::{
    content_digest, encode_download_url, find_schedule_link, RetryPolicy, ScheduleSource,
};

/// Progress callback; receives one human-readable line per stage.
pub type StatusFn<'a> = &'a (dyn Fn(&str) + Send + Sync);

pub const STATUS_BUSY: &str = "⏳ Обновление уже выполняется.";
pub const STATUS_NO_LINK: &str = "❌ Подходящая ссылка не найдена.";
pub const STATUS_UNCHANGED: &str = "✅ Файл не изменился.";
pub const STATUS_EMPTY: &str = "⚠️ Файл пуст.";
pub const STATUS_BELLS: &str = "🔔 Звонки обновлены.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    DiscoverLink,
    Download,
    HashCheck,
    Parse,
    Diff,
    Persist,
    Notify,
    Done,
    Failed,
}

impl Stage {
    /// Status line announced when the stage starts, if any.
    pub fn status(&self) -> Option<&'static str> {
        match self {
            Stage::DiscoverLink => Some("🔍 Поиск ссылки на сайте..."),
            Stage::Download => Some("📥 Скачивание..."),
            Stage::Parse => Some("⚙️ Парсинг..."),
            Stage::Persist => Some("💾 Сохранение..."),
            Stage::Done => Some("✅ Готово!"),
            Stage::Failed => Some("❌ Обновление прервано."),
            Stage::HashCheck | Stage::Diff | Stage::Notify => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("network: {0:#}")]
    Network(anyhow::Error),
    #[error("parse: {0}")]
    Parse(#[from] SheetError),
    #[error("storage: {0:#}")]
    Storage(anyhow::Error),
    #[error("parser task: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// What a cycle did, for callers and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another cycle held the lock.
    AlreadyRunning,
    /// The page offered no schedule file.
    NoLink,
    /// Same bytes as last time; nothing parsed or stored.
    Unchanged,
    /// The file parsed to zero lessons; nothing stored.
    Empty,
    Updated(CycleReport),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub affected_groups: Vec<String>,
    pub new_week: bool,
    pub bells_changed: bool,
    pub messages_sent: usize,
}

#[derive(Debug, Clone)]
pub struct UpdaterSettings {
    pub page_url: Url,
    pub origin: Url,
    pub admin_id: Option<i64>,
    pub retry: RetryPolicy,
}

impl UpdaterSettings {
    pub fn from_config(cfg: &Config) -> Result<Self, ConfigError> {
        let page_url = Url::parse(&cfg.site.schedule_url)
            .map_err(|_| ConfigError::Invalid("site.schedule_url must be an absolute URL"))?;
        let origin = Url::parse(&cfg.site.origin)
            .map_err(|_| ConfigError::Invalid("site.origin must be an absolute URL"))?;
        Ok(Self {
            page_url,
            origin,
            admin_id: cfg.telegram.admin_id,
            retry: cfg.retry_policy(),
        })
    }
}

pub struct Updater {
    pool: Pool,
    source: Arc<dyn ScheduleSource>,
    parser: Arc<dyn SheetParser>,
    notifier: Arc<dyn Notifier>,
    settings: UpdaterSettings,
    lock: Mutex<()>,
}

fn new_week_message(date_range: &str) -> String {
    format!(
        "📅 <b>Новое расписание!</b> ({})\nПроверь /rasp",
        escape_html(date_range)
    )
}

fn bells_message(bells: &str) -> String {
    format!("🔔 <b>Изменилось расписание звонков!</b>\n\n{}", bells)
}

fn digest_message(kind: &str, groups: &[String]) -> String {
    let text = format!(
        "📢 <b>Рассылка ({}):</b>\nЗатронуто групп: {}\n{}",
        kind,
        groups.len(),
        groups.join(", ")
    );
    truncate(&text, DIGEST_LIMIT)
}

fn group_by_name(lessons: &[Lesson]) -> BTreeMap<&str, Vec<Lesson>> {
    let mut map: BTreeMap<&str, Vec<Lesson>> = BTreeMap::new();
    for lesson in lessons {
        map.entry(lesson.group.as_str())
            .or_default()
            .push(lesson.clone());
    }
    map
}

impl Updater {
    pub fn new(
        pool: Pool,
        source: Arc<dyn ScheduleSource>,
        parser: Arc<dyn SheetParser>,
        notifier: Arc<dyn Notifier>,
        settings: UpdaterSettings,
    ) -> Self {
        Self {
            pool,
            source,
            parser,
            notifier,
            settings,
            lock: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &UpdaterSettings {
        &self.settings
    }

    /// Run one ingestion cycle. With `force` the digest short-circuit is
    /// skipped. A cycle already in progress makes this return
    /// [`CycleOutcome::AlreadyRunning`] immediately.
    pub async fn force_update(
        &self,
        status: StatusFn<'_>,
        force: bool,
    ) -> Result<CycleOutcome, UpdateError> {
        let Ok(_guard) = self.lock.try_lock() else {
            info!("ingestion already running");
            status(STATUS_BUSY);
            return Ok(CycleOutcome::AlreadyRunning);
        };

        let span = info_span!("ingest", cycle = %Uuid::new_v4(), force);
        let result = self.run_cycle(status, force).instrument(span.clone()).await;
        let _entered = span.enter();
        match &result {
            Ok(outcome) => debug!(?outcome, "cycle finished"),
            Err(err) => {
                error!(error = %err, "cycle failed");
                announce(status, Stage::Failed);
                status(&format!("❌ Ошибка: {}", err));
            }
        }
        result
    }

    /// Download and parse the file at `url` without touching stored state or
    /// sending anything.
    pub async fn parse_only(&self, url: &str) -> Result<ScheduleBundle, UpdateError> {
        parse_only(
            self.source.as_ref(),
            self.parser.as_ref(),
            url,
            self.settings.retry,
        )
        .await
    }

    async fn run_cycle(&self, status: StatusFn<'_>, force: bool) -> Result<CycleOutcome, UpdateError> {
        announce(status, Stage::DiscoverLink);
        let link = match find_schedule_link(
            self.source.as_ref(),
            &self.settings.page_url,
            &self.settings.origin,
            self.settings.retry,
        )
        .await
        {
            Ok(Some(link)) => link,
            Ok(None) => {
                status(STATUS_NO_LINK);
                return Ok(CycleOutcome::NoLink);
            }
            Err(err) => {
                warn!(error = %err, "schedule page unreachable");
                status(&format!("❌ Ошибка сайта: {}", err));
                status(STATUS_NO_LINK);
                return Ok(CycleOutcome::NoLink);
            }
        };

        announce(status, Stage::Download);
        let url = encode_download_url(link.as_str()).map_err(UpdateError::Network)?;
        let bytes = download(self.source.as_ref(), &url, self.settings.retry).await?;

        announce(status, Stage::HashCheck);
        let previous = db::fetch_ingestion_state(&self.pool)
            .await
            .map_err(UpdateError::Storage)?;
        let digest = content_digest(&bytes);
        if !force && digest == previous.last_file_hash && !previous.last_bell_schedule.is_empty() {
            info!(%url, "file unchanged");
            db::touch_check_time(&self.pool, Utc::now())
                .await
                .map_err(UpdateError::Storage)?;
            status(STATUS_UNCHANGED);
            return Ok(CycleOutcome::Unchanged);
        }

        announce(status, Stage::Parse);
        let parser = Arc::clone(&self.parser);
        let bundle = tokio::task::spawn_blocking(move || parser.parse(&bytes)).await??;
        if bundle.is_empty() {
            warn!(%url, "parsed schedule is empty; keeping stored data");
            status(STATUS_EMPTY);
            return Ok(CycleOutcome::Empty);
        }

        announce(status, Stage::Diff);
        let plan = self.plan_notifications(&previous, &bundle).await?;

        announce(status, Stage::Persist);
        let now = Utc::now();
        let state = IngestionState {
            last_file_url: url.to_string(),
            last_file_hash: digest,
            last_date_range: bundle.date_range.clone(),
            week_start: Some(bundle.week_start),
            last_bell_schedule: bundle.bell_schedule.clone(),
            last_check_time: Some(now),
            last_successful_update: Some(now),
        };
        db::replace_schedule(&self.pool, &bundle.lessons, &state)
            .await
            .map_err(UpdateError::Storage)?;
        info!(
            lessons = bundle.lessons.len(),
            date_range = %bundle.date_range,
            "schedule stored"
        );

        announce(status, Stage::Notify);
        let messages_sent = self.notify(status, &plan, &bundle).await?;

        announce(status, Stage::Done);
        Ok(CycleOutcome::Updated(CycleReport {
            affected_groups: plan.per_group.keys().cloned().collect(),
            new_week: plan.new_week,
            bells_changed: plan.bells_changed,
            messages_sent,
        }))
    }

    #[instrument(skip_all)]
    async fn plan_notifications(
        &self,
        previous: &IngestionState,
        bundle: &ScheduleBundle,
    ) -> Result<NotificationPlan, UpdateError> {
        let new_week = previous
            .week_start
            .is_some_and(|week| week != bundle.week_start);
        let bells_changed = !bundle.bell_schedule.trim().is_empty()
            && bundle.bell_schedule != previous.last_bell_schedule;

        let stored = db::fetch_all_lessons(&self.pool)
            .await
            .map_err(UpdateError::Storage)?;
        let old_by_group = group_by_name(&stored);
        let new_by_group = group_by_name(&bundle.lessons);

        let mut per_group = BTreeMap::new();
        for (group, new_lessons) in &new_by_group {
            let old_lessons = old_by_group.get(group).map(Vec::as_slice).unwrap_or(&[]);
            if schedules_equal(old_lessons, new_lessons) {
                continue;
            }
            let text = if new_week {
                Some(new_week_message(&bundle.date_range))
            } else {
                render_diff(group, old_lessons, new_lessons, bundle.week_start)
            };
            if let Some(text) = text {
                per_group.insert(group.to_string(), text);
            }
        }
        debug!(affected = per_group.len(), new_week, bells_changed, "diff computed");
        Ok(NotificationPlan {
            per_group,
            new_week,
            bells_changed,
        })
    }

    #[instrument(skip_all)]
    async fn notify(
        &self,
        status: StatusFn<'_>,
        plan: &NotificationPlan,
        bundle: &ScheduleBundle,
    ) -> Result<usize, UpdateError> {
        let mut sent = 0;

        if plan.bells_changed {
            let text = bells_message(&bundle.bell_schedule);
            let recipients = db::list_students(&self.pool)
                .await
                .map_err(UpdateError::Storage)?
                .into_iter()
                .filter(|s| s.notifications_enabled)
                .map(|s| (s.chat_id, text.clone()))
                .collect();
            sent += dispatch(self.notifier.as_ref(), recipients).await;
            status(STATUS_BELLS);
        }

        if plan.per_group.is_empty() {
            return Ok(sent);
        }

        let kind = if plan.new_week {
            "НОВАЯ НЕДЕЛЯ"
        } else {
            "ИЗМЕНЕНИЯ"
        };
        status(&format!(
            "🔔 Рассылка ({}) для {} групп...",
            kind,
            plan.per_group.len()
        ));

        if let Some(admin) = self.settings.admin_id {
            let groups: Vec<String> = plan.per_group.keys().cloned().collect();
            if let Err(err) = self
                .notifier
                .send(admin, &digest_message(kind, &groups))
                .await
            {
                warn!(error = %err, "operator digest not delivered");
            }
        }

        let mut messages = Vec::new();
        for (group, text) in &plan.per_group {
            let subscribers = db::list_subscribers(&self.pool, group)
                .await
                .context("loading subscribers")
                .map_err(UpdateError::Storage)?;
            messages.extend(subscribers.into_iter().map(|s| (s.chat_id, text.clone())));
        }
        sent += dispatch(self.notifier.as_ref(), messages).await;
        Ok(sent)
    }
}

/// Fetch and parse one file; nothing is stored and nobody is notified.
pub async fn parse_only(
    source: &dyn ScheduleSource,
    parser: &dyn SheetParser,
    url: &str,
    retry: RetryPolicy,
) -> Result<ScheduleBundle, UpdateError> {
    let url = encode_download_url(url).map_err(UpdateError::Network)?;
    let bytes = download(source, &url, retry).await?;
    Ok(parser.parse(&bytes)?)
}

async fn download(
    source: &dyn ScheduleSource,
    url: &Url,
    retry: RetryPolicy,
) -> Result<Vec<u8>, UpdateError> {
    let attempts = retry.attempts.max(1);
    let mut attempt = 1;
    loop {
        match source.fetch_bytes(url).await {
            Ok(bytes) => return Ok(bytes),
            Err(err) if attempt < attempts => {
                warn!(attempt, error = %err, "download failed; retrying");
                attempt += 1;
                if !retry.delay.is_zero() {
                    tokio::time::sleep(retry.delay).await;
                }
            }
            Err(err) => return Err(UpdateError::Network(err)),
        }
    }
}

struct NotificationPlan {
    per_group: BTreeMap<String, String>,
    new_week: bool,
    bells_changed: bool,
}

fn announce(status: StatusFn<'_>, stage: Stage) {
    debug!(?stage, "stage");
    if let Some(line) = stage.status() {
        status(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_lists_groups_and_is_capped() {
        let text = digest_message("ИЗМЕНЕНИЯ", &["И-255".into(), "ПКС-21".into()]);
        assert_eq!(
            text,
            "📢 <b>Рассылка (ИЗМЕНЕНИЯ):</b>\nЗатронуто групп: 2\nИ-255, ПКС-21"
        );

        let many: Vec<String> = (0..2000).map(|i| format!("Г-{i:04}")).collect();
        let text = digest_message("НОВАЯ НЕДЕЛЯ", &many);
        assert_eq!(text.chars().count(), DIGEST_LIMIT + 3);
        assert!(text.ends_with("..."));
    }

    #[test]
    fn week_message_escapes_label() {
        assert_eq!(
            new_week_message("13.10 <-> 18.10"),
            "📅 <b>Новое расписание!</b> (13.10 &lt;-&gt; 18.10)\nПроверь /rasp"
        );
    }

    #[test]
    fn only_some_stages_announce() {
        assert_eq!(Stage::Download.status(), Some("📥 Скачивание..."));
        assert_eq!(Stage::Diff.status(), None);
        assert_eq!(Stage::Failed.status(), Some("❌ Обновление прервано."));
    }
}
