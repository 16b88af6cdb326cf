use super::model::{alias_from_row, ingestion_state_from_row, lesson_from_row, student_from_row};
use super::SCHEDULE_STATE_KEY;
use crate::model::{IngestionState, Lesson, Student, SubjectAlias};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, instrument};

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("connecting to {normalized}"))?;
    // WAL journal, full fsync on commit.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// For file-backed SQLite URLs, expand a leading `~/` and create the parent
/// directory. In-memory and non-sqlite URLs pass through untouched.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }

    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let path = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query {
        Some(q) => format!("sqlite://{path}?{q}"),
        None => format!("sqlite://{path}"),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Lessons

const LESSON_COLUMNS: &str = "group_name, day_of_week, lesson_number, raw_text, teacher";

#[instrument(skip_all)]
pub async fn fetch_all_lessons(pool: &Pool) -> Result<Vec<Lesson>> {
    let rows = sqlx::query(&format!(
        "SELECT {LESSON_COLUMNS} FROM lessons ORDER BY group_name, id"
    ))
    .fetch_all(pool)
    .await?;
    rows.iter().map(lesson_from_row).collect()
}

#[instrument(skip_all, fields(group = %group))]
pub async fn fetch_lessons_by_group(pool: &Pool, group: &str) -> Result<Vec<Lesson>> {
    let rows = sqlx::query(&format!(
        "SELECT {LESSON_COLUMNS} FROM lessons WHERE group_name = ? ORDER BY id"
    ))
    .bind(group)
    .fetch_all(pool)
    .await?;
    let mut lessons = rows
        .iter()
        .map(lesson_from_row)
        .collect::<Result<Vec<_>>>()?;
    lessons.sort_by_key(|l| l.sort_key());
    Ok(lessons)
}

#[instrument(skip_all)]
pub async fn distinct_group_names(pool: &Pool) -> Result<Vec<String>> {
    let names: Vec<String> =
        sqlx::query_scalar("SELECT DISTINCT group_name FROM lessons ORDER BY group_name")
            .fetch_all(pool)
            .await?;
    Ok(names)
}

#[instrument(skip_all)]
pub async fn count_lessons(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM lessons")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

// ---------------------------------------------------------------------------
// Ingestion state

/// The stored state, or an all-empty one before the first successful run.
#[instrument(skip_all)]
pub async fn fetch_ingestion_state(pool: &Pool) -> Result<IngestionState> {
    let row = sqlx::query("SELECT * FROM ingestion_state WHERE key_name = ?")
        .bind(SCHEDULE_STATE_KEY)
        .fetch_optional(pool)
        .await?;
    match row {
        Some(row) => ingestion_state_from_row(&row),
        None => Ok(IngestionState::default()),
    }
}

#[instrument(skip_all)]
pub async fn touch_check_time(pool: &Pool, at: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        "INSERT INTO ingestion_state (key_name, last_check_time) VALUES (?, ?)
         ON CONFLICT(key_name) DO UPDATE SET last_check_time = excluded.last_check_time",
    )
    .bind(SCHEDULE_STATE_KEY)
    .bind(at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Swap the whole lesson table and the ingestion state in one transaction.
/// Readers see either the previous week or the new one, never a mix.
#[instrument(skip_all, fields(lessons = lessons.len()))]
pub async fn replace_schedule(pool: &Pool, lessons: &[Lesson], state: &IngestionState) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM lessons").execute(&mut *tx).await?;
    for lesson in lessons {
        sqlx::query(&format!(
            "INSERT INTO lessons ({LESSON_COLUMNS}) VALUES (?, ?, ?, ?, ?)"
        ))
        .bind(&lesson.group)
        .bind(lesson.weekday.as_str())
        .bind(i64::from(lesson.slot))
        .bind(&lesson.raw_text)
        .bind(lesson.teacher.as_deref())
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query(
        "INSERT INTO ingestion_state (
            key_name, last_file_url, last_file_hash, last_date_range, week_start,
            last_bell_schedule, last_check_time, last_successful_update
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(key_name) DO UPDATE SET
            last_file_url = excluded.last_file_url,
            last_file_hash = excluded.last_file_hash,
            last_date_range = excluded.last_date_range,
            week_start = excluded.week_start,
            last_bell_schedule = excluded.last_bell_schedule,
            last_check_time = excluded.last_check_time,
            last_successful_update = excluded.last_successful_update",
    )
    .bind(SCHEDULE_STATE_KEY)
    .bind(&state.last_file_url)
    .bind(&state.last_file_hash)
    .bind(&state.last_date_range)
    .bind(state.week_start)
    .bind(&state.last_bell_schedule)
    .bind(state.last_check_time)
    .bind(state.last_successful_update)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    debug!("schedule replaced");
    Ok(())
}

// ---------------------------------------------------------------------------
// Students

/// Register a user or refresh their chat id and name; preferences are kept.
#[instrument(skip_all)]
pub async fn upsert_student(
    pool: &Pool,
    user_id: i64,
    chat_id: i64,
    first_name: Option<&str>,
) -> Result<Student> {
    let row = sqlx::query(
        "INSERT INTO students (user_id, chat_id, first_name) VALUES (?, ?, ?)
         ON CONFLICT(user_id) DO UPDATE SET chat_id = excluded.chat_id, first_name = excluded.first_name
         RETURNING *",
    )
    .bind(user_id)
    .bind(chat_id)
    .bind(first_name)
    .fetch_one(pool)
    .await?;
    student_from_row(&row)
}

#[instrument(skip_all)]
pub async fn list_students(pool: &Pool) -> Result<Vec<Student>> {
    let rows = sqlx::query("SELECT * FROM students ORDER BY user_id")
        .fetch_all(pool)
        .await?;
    rows.iter().map(student_from_row).collect()
}

/// Students of `group` with notifications switched on.
#[instrument(skip_all, fields(group = %group))]
pub async fn list_subscribers(pool: &Pool, group: &str) -> Result<Vec<Student>> {
    let rows = sqlx::query(
        "SELECT * FROM students WHERE notifications_enabled = 1 AND selected_group = ?
         ORDER BY user_id",
    )
    .bind(group)
    .fetch_all(pool)
    .await?;
    rows.iter().map(student_from_row).collect()
}

#[instrument(skip_all)]
pub async fn set_selected_group(pool: &Pool, user_id: i64, group: Option<&str>) -> Result<()> {
    sqlx::query("UPDATE students SET selected_group = ? WHERE user_id = ?")
        .bind(group)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn set_notifications(pool: &Pool, user_id: i64, enabled: bool) -> Result<()> {
    sqlx::query("UPDATE students SET notifications_enabled = ? WHERE user_id = ?")
        .bind(enabled)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn set_show_codes(pool: &Pool, user_id: i64, enabled: bool) -> Result<()> {
    sqlx::query("UPDATE students SET show_codes = ? WHERE user_id = ?")
        .bind(enabled)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Subject aliases

#[instrument(skip_all)]
pub async fn list_aliases_by_user(pool: &Pool, user_id: i64) -> Result<Vec<SubjectAlias>> {
    let rows = sqlx::query(
        "SELECT user_id, original_name, alias_name FROM subject_aliases
         WHERE user_id = ? ORDER BY original_name",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(alias_from_row).collect()
}

#[instrument(skip_all)]
pub async fn upsert_alias(pool: &Pool, user_id: i64, original: &str, alias: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO subject_aliases (user_id, original_name, alias_name) VALUES (?, ?, ?)
         ON CONFLICT(user_id, original_name) DO UPDATE SET alias_name = excluded.alias_name",
    )
    .bind(user_id)
    .bind(original)
    .bind(alias)
    .execute(pool)
    .await?;
    Ok(())
}

/// Returns whether an alias existed.
#[instrument(skip_all)]
pub async fn delete_alias(pool: &Pool, user_id: i64, original: &str) -> Result<bool> {
    let res = sqlx::query("DELETE FROM subject_aliases WHERE user_id = ? AND original_name = ?")
        .bind(user_id)
        .bind(original)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Weekday;
    use chrono::NaiveDate;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn lesson(group: &str, weekday: Weekday, slot: u32, text: &str) -> Lesson {
        Lesson {
            group: group.into(),
            weekday,
            slot,
            raw_text: text.into(),
            teacher: None,
        }
    }

    #[test]
    fn sqlite_url_normalization() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x"), "postgres://x");
        let td = tempfile::tempdir().unwrap();
        let db = td.path().join("nested/schedule.db");
        let url = prepare_sqlite_url(&format!("sqlite:{}?mode=rwc", db.display()));
        assert_eq!(url, format!("sqlite://{}?mode=rwc", db.display()));
        assert!(td.path().join("nested").exists());
    }

    #[tokio::test]
    async fn state_defaults_to_empty() {
        let pool = setup_pool().await;
        let state = fetch_ingestion_state(&pool).await.unwrap();
        assert_eq!(state, IngestionState::default());
    }

    #[tokio::test]
    async fn replace_schedule_swaps_everything() {
        let pool = setup_pool().await;
        let first = vec![
            lesson("И-255", Weekday::Monday, 2, "Физика"),
            lesson("И-255", Weekday::Monday, 1, "Математика [204]"),
            lesson("ПКС-21", Weekday::Tuesday, 1, "История"),
        ];
        let now = Utc::now();
        let state = IngestionState {
            last_file_url: "https://edu.tatar.ru/a.xlsx".into(),
            last_file_hash: "abc".into(),
            last_date_range: "13.10.2025".into(),
            week_start: NaiveDate::from_ymd_opt(2025, 10, 13),
            last_bell_schedule: "<b>ПОНЕДЕЛЬНИК</b>\n1. 08:30".into(),
            last_check_time: Some(now),
            last_successful_update: Some(now),
        };
        replace_schedule(&pool, &first, &state).await.unwrap();

        assert_eq!(count_lessons(&pool).await.unwrap(), 3);
        assert_eq!(
            distinct_group_names(&pool).await.unwrap(),
            vec!["И-255".to_string(), "ПКС-21".to_string()]
        );
        let group = fetch_lessons_by_group(&pool, "И-255").await.unwrap();
        assert_eq!(group[0].raw_text, "Математика [204]");
        assert_eq!(group[1].slot, 2);

        let stored = fetch_ingestion_state(&pool).await.unwrap();
        assert_eq!(stored.last_file_hash, "abc");
        assert_eq!(stored.week_start, state.week_start);
        assert_eq!(
            stored.last_successful_update.map(|t| t.timestamp()),
            Some(now.timestamp())
        );

        let second = vec![lesson("Т-101Б", Weekday::Friday, 3, "Химия")];
        replace_schedule(&pool, &second, &state).await.unwrap();
        assert_eq!(fetch_all_lessons(&pool).await.unwrap(), second);
    }

    #[tokio::test]
    async fn failed_replace_rolls_back() {
        let pool = setup_pool().await;
        let kept = vec![lesson("И-255", Weekday::Monday, 1, "Математика [204]")];
        let state = IngestionState {
            last_file_hash: "old".into(),
            week_start: NaiveDate::from_ymd_opt(2025, 10, 13),
            ..Default::default()
        };
        replace_schedule(&pool, &kept, &state).await.unwrap();

        let broken = vec![
            lesson("И-255", Weekday::Monday, 1, "Физика"),
            lesson("И-255", Weekday::Monday, 0, "Вне сетки"),
        ];
        let next = IngestionState {
            last_file_hash: "new".into(),
            week_start: NaiveDate::from_ymd_opt(2025, 10, 20),
            ..Default::default()
        };
        assert!(replace_schedule(&pool, &broken, &next).await.is_err());

        assert_eq!(fetch_all_lessons(&pool).await.unwrap(), kept);
        assert_eq!(fetch_ingestion_state(&pool).await.unwrap(), state);
    }

    #[tokio::test]
    async fn touch_check_time_keeps_other_columns() {
        let pool = setup_pool().await;
        let state = IngestionState {
            last_file_hash: "h1".into(),
            ..Default::default()
        };
        replace_schedule(&pool, &[], &state).await.unwrap();
        let at = Utc::now();
        touch_check_time(&pool, at).await.unwrap();
        let stored = fetch_ingestion_state(&pool).await.unwrap();
        assert_eq!(stored.last_file_hash, "h1");
        assert_eq!(stored.last_check_time.map(|t| t.timestamp()), Some(at.timestamp()));
    }

    #[tokio::test]
    async fn student_preferences_survive_reregistration() {
        let pool = setup_pool().await;
        let s = upsert_student(&pool, 7, 70, Some("Аня")).await.unwrap();
        assert!(s.notifications_enabled);
        assert!(!s.show_codes);

        set_selected_group(&pool, 7, Some("И-255")).await.unwrap();
        set_notifications(&pool, 7, false).await.unwrap();
        set_show_codes(&pool, 7, true).await.unwrap();

        let s = upsert_student(&pool, 7, 71, None).await.unwrap();
        assert_eq!(s.chat_id, 71);
        assert_eq!(s.selected_group.as_deref(), Some("И-255"));
        assert!(!s.notifications_enabled);
        assert!(s.show_codes);

        assert_eq!(list_students(&pool).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn aliases_upsert_and_delete() {
        let pool = setup_pool().await;
        upsert_student(&pool, 1, 1, None).await.unwrap();
        upsert_alias(&pool, 1, "Физика", "Физ").await.unwrap();
        upsert_alias(&pool, 1, "Физика", "Физон").await.unwrap();
        let aliases = list_aliases_by_user(&pool, 1).await.unwrap();
        assert_eq!(aliases.len(), 1);
        assert_eq!(aliases[0].alias_name, "Физон");

        assert!(delete_alias(&pool, 1, "Физика").await.unwrap());
        assert!(!delete_alias(&pool, 1, "Физика").await.unwrap());
        assert!(list_aliases_by_user(&pool, 1).await.unwrap().is_empty());
    }
}
