//! Row mapping for the repository layer.
//!
//! Columns are read by name; enum-like columns are stored as their upper-case
//! names and parsed back here.

use anyhow::{anyhow, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::model::{IngestionState, Lesson, Student, SubjectAlias, Weekday};

pub fn lesson_from_row(row: &SqliteRow) -> Result<Lesson> {
    let day: String = row.try_get("day_of_week")?;
    let weekday =
        Weekday::parse_str(&day).ok_or_else(|| anyhow!("unknown day_of_week {day:?}"))?;
    let slot: i64 = row.try_get("lesson_number")?;
    Ok(Lesson {
        group: row.try_get("group_name")?,
        weekday,
        slot: u32::try_from(slot)?,
        raw_text: row.try_get("raw_text")?,
        teacher: row.try_get("teacher")?,
    })
}

pub fn ingestion_state_from_row(row: &SqliteRow) -> Result<IngestionState> {
    Ok(IngestionState {
        last_file_url: row.try_get("last_file_url")?,
        last_file_hash: row.try_get("last_file_hash")?,
        last_date_range: row.try_get("last_date_range")?,
        week_start: row.try_get("week_start")?,
        last_bell_schedule: row.try_get("last_bell_schedule")?,
        last_check_time: row.try_get("last_check_time")?,
        last_successful_update: row.try_get("last_successful_update")?,
    })
}

pub fn student_from_row(row: &SqliteRow) -> Result<Student> {
    Ok(Student {
        user_id: row.try_get("user_id")?,
        chat_id: row.try_get("chat_id")?,
        first_name: row.try_get("first_name")?,
        selected_group: row.try_get("selected_group")?,
        notifications_enabled: row.try_get::<i64, _>("notifications_enabled")? != 0,
        show_codes: row.try_get::<i64, _>("show_codes")? != 0,
    })
}

pub fn alias_from_row(row: &SqliteRow) -> Result<SubjectAlias> {
    Ok(SubjectAlias {
        user_id: row.try_get("user_id")?,
        original_name: row.try_get("original_name")?,
        alias_name: row.try_get("alias_name")?,
    })
}
