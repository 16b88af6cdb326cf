//! Change reports between two lesson sets of one group.

use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet};

use crate::format::{day_header, escape_html, format_lesson_line, AliasMap};
use crate::model::{Lesson, Weekday, EMPTY_MARK};

/// Line shown for a slot that disappeared.
pub const REMOVED_MARK: &str = "❌ отменено";

const MIN_SLOTS: u32 = 5;

type LessonKey<'a> = (Weekday, u32, &'a str, Option<&'a str>);

fn sorted_keys(lessons: &[Lesson]) -> Vec<LessonKey<'_>> {
    let mut keys: Vec<_> = lessons
        .iter()
        .map(|l| (l.weekday, l.slot, l.raw_text.as_str(), l.teacher.as_deref()))
        .collect();
    keys.sort();
    keys
}

/// Same size and, once sorted, the same (weekday, slot, text, teacher) entries.
pub fn schedules_equal(old: &[Lesson], new: &[Lesson]) -> bool {
    old.len() == new.len() && sorted_keys(old) == sorted_keys(new)
}

fn by_day(lessons: &[Lesson]) -> BTreeMap<Weekday, Vec<&Lesson>> {
    let mut map: BTreeMap<Weekday, Vec<&Lesson>> = BTreeMap::new();
    for lesson in lessons {
        map.entry(lesson.weekday).or_default().push(lesson);
    }
    for day in map.values_mut() {
        day.sort_by_key(|l| l.sort_key());
    }
    map
}

fn same_lesson(a: &Lesson, b: &Lesson) -> bool {
    a.raw_text == b.raw_text && a.teacher == b.teacher
}

fn day_changed(old: &[&Lesson], new: &[&Lesson]) -> bool {
    old.len() != new.len() || old.iter().zip(new).any(|(a, b)| a.slot != b.slot || !same_lesson(a, b))
}

/// Message for a group that had no stored lessons before.
pub fn new_schedule_message(group: &str) -> String {
    format!(
        "📅 <b>Новое расписание для {}</b>\n\nПроверь /rasp",
        escape_html(group)
    )
}

/// Report for one group, or `None` when nothing changed. Only changed days are
/// listed; new or changed slots are italic, vanished slots show [`REMOVED_MARK`].
pub fn render_diff(
    group: &str,
    old: &[Lesson],
    new: &[Lesson],
    week_start: NaiveDate,
) -> Option<String> {
    if schedules_equal(old, new) {
        return None;
    }
    if old.is_empty() {
        return Some(new_schedule_message(group));
    }

    let old_days = by_day(old);
    let new_days = by_day(new);
    let days: BTreeSet<Weekday> = old_days.keys().chain(new_days.keys()).copied().collect();
    let empty = Vec::new();

    let mut out = format!(
        "<b>🔔 Изменения в расписании {}</b>\n\n",
        escape_html(group)
    );
    let mut any = false;
    for day in days {
        let day_old = old_days.get(&day).unwrap_or(&empty);
        let day_new = new_days.get(&day).unwrap_or(&empty);
        if !day_changed(day_old, day_new) {
            continue;
        }
        any = true;
        out.push_str(&day_header(day, week_start));
        out.push('\n');
        out.push_str(&render_day(day_old, day_new));
        out.push('\n');
    }
    any.then_some(out)
}

fn render_day(old: &[&Lesson], new: &[&Lesson]) -> String {
    let aliases = AliasMap::new();
    let old_map: BTreeMap<u32, &Lesson> = old.iter().map(|l| (l.slot, *l)).collect();
    let new_map: BTreeMap<u32, &Lesson> = new.iter().map(|l| (l.slot, *l)).collect();
    let highest = old_map
        .keys()
        .chain(new_map.keys())
        .max()
        .copied()
        .unwrap_or(0);

    let mut out = String::new();
    for slot in 1..=highest.max(MIN_SLOTS) {
        let line = match (old_map.get(&slot), new_map.get(&slot)) {
            (None, None) if slot <= MIN_SLOTS => EMPTY_MARK.to_string(),
            (None, None) => continue,
            (Some(o), Some(n)) if same_lesson(o, n) => format_lesson_line(&n.raw_text, &aliases, true),
            (Some(_), None) => REMOVED_MARK.to_string(),
            (_, Some(n)) => format!("<i>{}</i>", format_lesson_line(&n.raw_text, &aliases, true)),
        };
        out.push_str(&format!("{} | {}\n", slot, line));
    }
    out
}
