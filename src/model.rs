use chrono::{DateTime, Datelike, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Placeholder shown for an empty slot or an empty side of a split slot.
pub const EMPTY_MARK: &str = "—";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Weekday {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl Weekday {
    /// Days that appear in published schedules (Sunday is modelled but never shown).
    pub const SCHOOL_DAYS: [Weekday; 6] = [
        Weekday::Monday,
        Weekday::Tuesday,
        Weekday::Wednesday,
        Weekday::Thursday,
        Weekday::Friday,
        Weekday::Saturday,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Weekday::Monday => "MONDAY",
            Weekday::Tuesday => "TUESDAY",
            Weekday::Wednesday => "WEDNESDAY",
            Weekday::Thursday => "THURSDAY",
            Weekday::Friday => "FRIDAY",
            Weekday::Saturday => "SATURDAY",
            Weekday::Sunday => "SUNDAY",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "MONDAY" => Some(Weekday::Monday),
            "TUESDAY" => Some(Weekday::Tuesday),
            "WEDNESDAY" => Some(Weekday::Wednesday),
            "THURSDAY" => Some(Weekday::Thursday),
            "FRIDAY" => Some(Weekday::Friday),
            "SATURDAY" => Some(Weekday::Saturday),
            "SUNDAY" => Some(Weekday::Sunday),
            _ => None,
        }
    }

    /// Name as printed in the spreadsheet and in rendered messages.
    pub fn ru_name(&self) -> &'static str {
        match self {
            Weekday::Monday => "ПОНЕДЕЛЬНИК",
            Weekday::Tuesday => "ВТОРНИК",
            Weekday::Wednesday => "СРЕДА",
            Weekday::Thursday => "ЧЕТВЕРГ",
            Weekday::Friday => "ПЯТНИЦА",
            Weekday::Saturday => "СУББОТА",
            Weekday::Sunday => "ВОСКРЕСЕНЬЕ",
        }
    }

    /// Exact (case-insensitive, trimmed) match against one of the six school day names.
    pub fn from_ru(text: &str) -> Option<Self> {
        let upper = text.trim().to_uppercase();
        Self::SCHOOL_DAYS
            .into_iter()
            .find(|d| d.ru_name() == upper)
    }

    /// Zero-based offset from Monday.
    pub fn ordinal(&self) -> u32 {
        *self as u32
    }

    /// Calendar date of this weekday within the week starting at `week_start`.
    pub fn date_in_week(&self, week_start: NaiveDate) -> NaiveDate {
        week_start
            .checked_add_days(Days::new(self.ordinal() as u64))
            .unwrap_or(week_start)
    }
}

/// Monday of the week containing `date`.
pub fn monday_of(date: NaiveDate) -> NaiveDate {
    let back = date.weekday().num_days_from_monday() as u64;
    date.checked_sub_days(Days::new(back)).unwrap_or(date)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lesson {
    pub group: String,
    pub weekday: Weekday,
    pub slot: u32,
    pub raw_text: String,
    pub teacher: Option<String>,
}

impl Lesson {
    pub fn sort_key(&self) -> (Weekday, u32) {
        (self.weekday, self.slot)
    }
}

/// Result of parsing one spreadsheet. Never stored as-is; projected into
/// [`IngestionState`] and the lesson table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleBundle {
    pub lessons: Vec<Lesson>,
    pub date_range: String,
    pub week_start: NaiveDate,
    pub bell_schedule: String,
}

impl ScheduleBundle {
    pub fn is_empty(&self) -> bool {
        self.lessons.is_empty()
    }
}

/// Singleton row describing the last successfully stored file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestionState {
    pub last_file_url: String,
    pub last_file_hash: String,
    pub last_date_range: String,
    pub week_start: Option<NaiveDate>,
    pub last_bell_schedule: String,
    pub last_check_time: Option<DateTime<Utc>>,
    pub last_successful_update: Option<DateTime<Utc>>,
}

/// A bot user who may receive notifications.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Student {
    pub user_id: i64,
    pub chat_id: i64,
    pub first_name: Option<String>,
    pub selected_group: Option<String>,
    pub notifications_enabled: bool,
    pub show_codes: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubjectAlias {
    pub user_id: i64,
    pub original_name: String,
    pub alias_name: String,
}
