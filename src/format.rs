//! Pure text rendering for lessons and schedules (Telegram HTML).

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};

use crate::model::{Lesson, SubjectAlias, Weekday, EMPTY_MARK};

/// Subject codes such as `МДК.01.02` or `ОП.05` in front of the subject name.
static CODE_PREFIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([А-ЯЁA-Z]{2,5}(\.[А-ЯЁA-Z]{2,5})?(\.\d{1,2}){0,3}\.?)\s+(.*)$").unwrap()
});

/// Lower-cased original subject name -> user alias.
pub type AliasMap = HashMap<String, String>;

pub fn alias_map(aliases: &[SubjectAlias]) -> AliasMap {
    aliases
        .iter()
        .map(|a| (a.original_name.to_lowercase(), a.alias_name.clone()))
        .collect()
}

/// `"subject [room]"`, just the subject without a room, `—` without a subject.
pub fn format_item(subject: &str, room: &str) -> String {
    if subject.is_empty() || subject == EMPTY_MARK {
        return EMPTY_MARK.to_string();
    }
    if room.is_empty() {
        return subject.to_string();
    }
    format!("{} [{}]", subject, room)
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

struct LessonInfo {
    name: String,
    room: String,
}

impl LessonInfo {
    fn empty() -> Self {
        Self {
            name: EMPTY_MARK.to_string(),
            room: String::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.name == EMPTY_MARK
    }

    fn render(&self) -> String {
        format_item(&self.name, &self.room)
    }
}

fn split_room(part: &str) -> (&str, &str) {
    for (open, close) in [('[', ']'), ('(', ')')] {
        if let Some(inner) = part.strip_suffix(close) {
            if let Some(idx) = inner.rfind(open).filter(|&i| i > 0) {
                return (inner[..idx].trim(), inner[idx + open.len_utf8()..].trim());
            }
        }
    }
    (part, "")
}

fn parse_lesson_info(part: &str, aliases: &AliasMap, show_codes: bool) -> LessonInfo {
    let part = part.trim();
    if part.is_empty() || part == EMPTY_MARK {
        return LessonInfo::empty();
    }
    let (subject, room) = split_room(part);

    let (code, bare) = match CODE_PREFIX_RE.captures(subject) {
        Some(caps) => {
            let bare = caps[4].trim().to_string();
            (Some(caps[1].trim().to_string()), bare)
        }
        None => (None, subject.to_string()),
    };
    let bare = if bare.chars().count() > 1 {
        bare
    } else {
        subject.to_string()
    };

    let mut display = if show_codes {
        subject.to_string()
    } else {
        bare.clone()
    };
    if let Some(alias) = aliases.get(&bare.to_lowercase()) {
        display = match (&code, show_codes) {
            (Some(code), true) => format!("{} {}", code, alias),
            _ => alias.clone(),
        };
    }

    LessonInfo {
        name: escape_html(&display),
        room: escape_html(room),
    }
}

/// Render one stored lesson text for display, applying aliases and hiding
/// subject codes unless `show_codes` is set. Same-subject splits collapse to
/// `"Subject [r1] / [r2]"`.
pub fn format_lesson_line(raw: &str, aliases: &AliasMap, show_codes: bool) -> String {
    if raw.trim() == EMPTY_MARK {
        return EMPTY_MARK.to_string();
    }
    let Some((left, right)) = raw.split_once(" / ") else {
        return parse_lesson_info(raw, aliases, show_codes).render();
    };

    let first = parse_lesson_info(left, aliases, show_codes);
    let second = parse_lesson_info(right, aliases, show_codes);
    if first.is_empty() && second.is_empty() {
        return EMPTY_MARK.to_string();
    }
    if !first.is_empty() && first.name == second.name {
        if first.room == second.room {
            return first.render();
        }
        let bracket = |room: &str| {
            if room.is_empty() {
                String::new()
            } else {
                format!("[{}]", room)
            }
        };
        return match (bracket(&first.room), bracket(&second.room)) {
            (r1, r2) if r1.is_empty() => format!("{} / {}", first.name, r2),
            (r1, r2) => format!("{} {} / {}", first.name, r1, r2),
        };
    }
    format!("{} / {}", first.render(), second.render())
}

/// Slots 1..=max(min_slots, highest) with `—` in every gap.
pub fn fill_gaps(lessons: &[&Lesson], min_slots: u32) -> Vec<(u32, String)> {
    let by_slot: BTreeMap<u32, &str> = lessons
        .iter()
        .map(|l| (l.slot, l.raw_text.as_str()))
        .collect();
    let limit = by_slot.keys().max().copied().unwrap_or(0).max(min_slots);
    (1..=limit)
        .map(|slot| {
            let text = by_slot.get(&slot).copied().unwrap_or(EMPTY_MARK);
            (slot, text.to_string())
        })
        .collect()
}

pub fn day_header(day: Weekday, week_start: NaiveDate) -> String {
    format!(
        "<b>{}  {}</b>",
        day.date_in_week(week_start).format("%d.%m.%Y"),
        day.ru_name()
    )
}

/// Weekly table for one group: a dated header per day, then `n | lesson` lines.
pub fn format_schedule(
    group: &str,
    lessons: &[Lesson],
    aliases: &AliasMap,
    show_codes: bool,
    week_start: NaiveDate,
) -> String {
    let mut by_day: BTreeMap<Weekday, Vec<&Lesson>> = BTreeMap::new();
    for lesson in lessons.iter().filter(|l| l.weekday != Weekday::Sunday) {
        by_day.entry(lesson.weekday).or_default().push(lesson);
    }

    let mut out = format!("Расписание для <b>{}</b>\n\n", escape_html(group));
    for (day, day_lessons) in &by_day {
        out.push_str(&day_header(*day, week_start));
        out.push('\n');
        for (slot, raw) in fill_gaps(day_lessons, 5) {
            out.push_str(&format!(
                "{} | {}\n",
                slot,
                format_lesson_line(&raw, aliases, show_codes)
            ));
        }
        out.push('\n');
    }
    out
}
