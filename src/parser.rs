//! Turns a schedule worksheet into lessons, a date range and bell times.

use chrono::Local;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, instrument, warn};

use crate::format::format_item;
use crate::model::{monday_of, Lesson, ScheduleBundle, Weekday, EMPTY_MARK};
use crate::sheet::analyzer::{analyze, find_date_range, GroupColumnAnchor};
use crate::sheet::{clean_text, Grid, SheetError};

/// Date label used when the sheet carries no recognisable date.
pub const UNKNOWN_DATE_LABEL: &str = "Unknown";
/// Date label reported when no group header row exists.
pub const NO_HEADER_LABEL: &str = "Error";

/// Weekday, slot number and bell time sit in the first three columns.
const DAY_COL: usize = 0;
const SLOT_COL: usize = 1;
const TIME_COL: usize = 2;

/// Seam between the orchestrator and the workbook format.
pub trait SheetParser: Send + Sync {
    fn parse(&self, bytes: &[u8]) -> Result<ScheduleBundle, SheetError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParserOptions {
    /// Subject only on the left sub-column and room only on the right one is
    /// read as a single lesson in that room.
    pub wide_split_rooms: bool,
}

#[derive(Debug, Clone, Default)]
pub struct XlsxScheduleParser {
    options: ParserOptions,
}

impl XlsxScheduleParser {
    pub fn new(options: ParserOptions) -> Self {
        Self { options }
    }
}

impl SheetParser for XlsxScheduleParser {
    #[instrument(skip_all, fields(bytes = bytes.len()))]
    fn parse(&self, bytes: &[u8]) -> Result<ScheduleBundle, SheetError> {
        let grid = Grid::from_xlsx(bytes)?;
        Ok(parse_grid(&grid, self.options))
    }
}

/// Walk the grid below the header row and collect one lesson per
/// (group, weekday, slot). Rows without a weekday or slot number are skipped.
pub fn parse_grid(grid: &Grid, options: ParserOptions) -> ScheduleBundle {
    let date = find_date_range(grid);
    let week_start = date
        .as_ref()
        .and_then(|d| d.week_start)
        .unwrap_or_else(|| monday_of(Local::now().date_naive()));
    let date_range = date
        .map(|d| d.label)
        .unwrap_or_else(|| UNKNOWN_DATE_LABEL.to_string());

    let structure = analyze(grid);
    let (Some(header_row), Some(last_row)) = (structure.header_row, grid.last_row()) else {
        info!("no group header row found");
        return ScheduleBundle {
            lessons: Vec::new(),
            date_range: NO_HEADER_LABEL.to_string(),
            week_start,
            bell_schedule: String::new(),
        };
    };

    if structure.day_col.is_some_and(|c| c != DAY_COL)
        || structure.time_col.is_some_and(|c| c != TIME_COL)
    {
        warn!(
            day_col = ?structure.day_col,
            time_col = ?structure.time_col,
            "detected columns differ from the fixed layout; reading columns 0-2"
        );
    }

    let mut lessons = Vec::new();
    let mut bells = BellSchedule::default();
    let mut seen: HashSet<(String, Weekday, u32)> = HashSet::new();

    for row in header_row + 2..=last_row {
        let Some(day) = Weekday::from_ru(grid.value(row, DAY_COL)) else {
            continue;
        };
        if is_continuation(grid, row, SLOT_COL) {
            continue;
        }
        let Some(slot) = parse_slot(grid.value(row, SLOT_COL)) else {
            debug!(row, "row without slot number skipped");
            continue;
        };

        let time = clean_text(grid.value(row, TIME_COL));
        if !time.is_empty() {
            bells.record(day, slot, time);
        }

        let teacher_row = teacher_row_below(grid, row, SLOT_COL);
        for anchor in &structure.groups {
            let Some(cell) = read_slot(grid, row, teacher_row, anchor, options) else {
                continue;
            };
            if !seen.insert((anchor.group.clone(), day, slot)) {
                debug!(row, group = %anchor.group, slot, "duplicate slot skipped");
                continue;
            }
            lessons.push(Lesson {
                group: anchor.group.clone(),
                weekday: day,
                slot,
                raw_text: cell.text,
                teacher: cell.teacher,
            });
        }
    }

    info!(
        lessons = lessons.len(),
        groups = structure.groups.len(),
        %date_range,
        %week_start,
        "schedule parsed"
    );
    ScheduleBundle {
        lessons,
        date_range,
        week_start,
        bell_schedule: bells.render(),
    }
}

fn parse_slot(text: &str) -> Option<u32> {
    let value: f64 = clean_text(text).parse().ok()?;
    (value >= 1.0 && value.fract() == 0.0 && value <= u32::MAX as f64).then_some(value as u32)
}

/// A row whose slot cell is a lower member of a vertical merge belongs to the slot above.
fn is_continuation(grid: &Grid, row: usize, slot_col: usize) -> bool {
    grid.merge_at(row, slot_col)
        .is_some_and(|m| m.first_row != row)
}

/// The row beneath carries teacher names when it has no slot number of its own.
fn teacher_row_below(grid: &Grid, row: usize, slot_col: usize) -> Option<usize> {
    let below = row + 1;
    if is_continuation(grid, below, slot_col) || parse_slot(grid.value(below, slot_col)).is_none()
    {
        Some(below)
    } else {
        None
    }
}

struct SlotCell {
    text: String,
    teacher: Option<String>,
}

/// Cell text within a group block. A cell sharing a merge with a cell further
/// left in the block reads as empty so the subject is not mistaken for a room;
/// this holds whether the merge starts inside the block or spills in from a
/// neighbouring group.
fn block_cell(grid: &Grid, row: usize, col: usize, block_start: usize) -> String {
    match grid.merge_at(row, col) {
        Some(m) if col > block_start && m.first_col < col => String::new(),
        _ => clean_text(grid.value(row, col)),
    }
}

/// Like [`block_cell`], but text merged down from the lesson row is not a teacher.
fn teacher_cell(grid: &Grid, row: usize, col: usize, block_start: usize) -> String {
    match grid.merge_at(row, col) {
        Some(m) if m.first_row < row => String::new(),
        _ => block_cell(grid, row, col, block_start),
    }
}

fn read_slot(
    grid: &Grid,
    row: usize,
    teacher_row: Option<usize>,
    anchor: &GroupColumnAnchor,
    options: ParserOptions,
) -> Option<SlotCell> {
    let c = anchor.start_col;
    let s1 = block_cell(grid, row, c, c);
    let r1 = block_cell(grid, row, c + 1, c);
    let s2 = block_cell(grid, row, c + 2, c);
    let r2 = block_cell(grid, row, c + 3, c);

    if s1.is_empty() && s2.is_empty() {
        return None;
    }

    let merged_across = grid
        .merge_at(row, c)
        .is_some_and(|m| m.cols_overlapping(c, c + 3) >= 3);
    let identical = !s1.is_empty() && s1 == s2 && (r1 == r2 || r2.is_empty());
    let wide_split = options.wide_split_rooms
        && !s1.is_empty()
        && r1.is_empty()
        && s2.is_empty()
        && !r2.is_empty();
    let collapse = merged_across || identical || wide_split;

    let (t1, t2) = match teacher_row {
        Some(tr) => (teacher_cell(grid, tr, c, c), teacher_cell(grid, tr, c + 2, c)),
        None => (String::new(), String::new()),
    };

    let (text, teacher) = if collapse {
        let subject = if s1.is_empty() { &s2 } else { &s1 };
        let room = if r1.is_empty() { &r2 } else { &r1 };
        let teacher = if t1.is_empty() {
            non_empty(t2)
        } else if t2.is_empty() || t1 == t2 {
            Some(t1)
        } else {
            Some(format!("{} / {}", t1, t2))
        };
        (format_item(subject, room), teacher)
    } else if !s1.is_empty() && !s2.is_empty() {
        let text = format!("{} / {}", format_item(&s1, &r1), format_item(&s2, &r2));
        let teacher = if t1 == t2 {
            non_empty(t1)
        } else {
            Some(format!("{} / {}", or_dash(&t1), or_dash(&t2)))
        };
        (text, teacher)
    } else if !s1.is_empty() {
        (format_item(&s1, &r1), non_empty(t1))
    } else {
        (format_item(&s2, &r2), non_empty(t2))
    };

    Some(SlotCell { text, teacher })
}

fn non_empty(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}

fn or_dash(s: &str) -> &str {
    if s.is_empty() {
        EMPTY_MARK
    } else {
        s
    }
}

/// Per-weekday slot times; the first time seen for a (day, slot) wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BellSchedule {
    days: BTreeMap<Weekday, BTreeMap<u32, String>>,
}

impl BellSchedule {
    pub fn record(&mut self, day: Weekday, slot: u32, time: String) {
        self.days
            .entry(day)
            .or_default()
            .entry(slot)
            .or_insert(time);
    }

    /// Days sharing an identical timetable are printed once under a combined label.
    pub fn render(&self) -> String {
        let mut blocks: Vec<(Vec<Weekday>, &BTreeMap<u32, String>)> = Vec::new();
        for (day, times) in &self.days {
            match blocks.iter_mut().find(|(_, t)| *t == times) {
                Some((days, _)) => days.push(*day),
                None => blocks.push((vec![*day], times)),
            }
        }

        blocks
            .iter()
            .map(|(days, times)| {
                let mut out = format!("<b>{}</b>", day_label(days));
                for (slot, time) in times.iter() {
                    out.push_str(&format!("\n{}. {}", slot, time));
                }
                out
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

fn day_label(days: &[Weekday]) -> String {
    let contiguous = days
        .windows(2)
        .all(|w| w[1].ordinal() == w[0].ordinal() + 1);
    match days {
        [] => String::new(),
        [single] => single.ru_name().to_string(),
        _ if days == Weekday::SCHOOL_DAYS.as_slice() => {
            format!("{} - {}", Weekday::Monday.ru_name(), Weekday::Saturday.ru_name())
        }
        [first, .., last] if contiguous => format!("{} - {}", first.ru_name(), last.ru_name()),
        _ => days
            .iter()
            .map(|d| d.ru_name())
            .collect::<Vec<_>>()
            .join(", "),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    /// Title, header row 3 (groups at columns 4 and 8), sub-header row 4, data from row 5.
    fn base_grid() -> Grid {
        let mut grid = Grid::default();
        grid.set(0, 0, "Расписание с 13.10.2025 по 18.10.2025")
            .set(3, 0, "День")
            .set(3, 1, "№")
            .set(3, 2, "Время")
            .set(3, 4, "И-255")
            .merge(3, 4, 3, 7)
            .set(3, 8, "ПКС-21")
            .merge(3, 8, 3, 11)
            .set(4, 4, "Предмет")
            .set(4, 5, "Ауд.");
        grid
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
    fn single_subject_with_room() {
        let mut grid = base_grid();
        grid.set(5, 0, "ПОНЕДЕЛЬНИК")
            .set(5, 1, "1")
            .set(5, 4, "Математика")
            .set(5, 5, "204");
        let bundle = parse_grid(&grid, ParserOptions::default());
        assert_eq!(
            bundle.lessons,
            vec![lesson("И-255", Weekday::Monday, 1, "Математика [204]")]
        );
        assert_eq!(bundle.week_start, NaiveDate::from_ymd_opt(2025, 10, 13).unwrap());
        assert_eq!(bundle.date_range, "Расписание с 13.10.2025 по 18.10.2025");
    }

    #[test]
    fn same_subject_different_rooms_is_split() {
        let mut grid = base_grid();
        grid.set(5, 0, "ПОНЕДЕЛЬНИК")
            .set(5, 1, "1")
            .set(5, 4, "Математика")
            .set(5, 5, "204")
            .set(5, 6, "Математика")
            .set(5, 7, "305");
        let bundle = parse_grid(&grid, ParserOptions::default());
        assert_eq!(bundle.lessons[0].raw_text, "Математика [204] / Математика [305]");
    }

    #[test]
    fn identical_halves_collapse() {
        let mut grid = base_grid();
        grid.set(5, 0, "ВТОРНИК")
            .set(5, 1, "2")
            .set(5, 4, "Физика")
            .set(5, 5, "101")
            .set(5, 6, "Физика");
        let bundle = parse_grid(&grid, ParserOptions::default());
        assert_eq!(bundle.lessons[0].raw_text, "Физика [101]");
        assert_eq!(bundle.lessons[0].weekday, Weekday::Tuesday);
    }

    #[test]
    fn wide_merge_collapses_and_keeps_outer_room() {
        let mut grid = base_grid();
        grid.set(5, 0, "ПОНЕДЕЛЬНИК")
            .set(5, 1, "1")
            .set(5, 4, "История")
            .merge(5, 4, 5, 6)
            .set(5, 7, "12");
        let bundle = parse_grid(&grid, ParserOptions::default());
        assert_eq!(bundle.lessons[0].raw_text, "История [12]");
    }

    #[test]
    fn full_block_merge_has_no_room() {
        let mut grid = base_grid();
        grid.set(5, 0, "ПОНЕДЕЛЬНИК")
            .set(5, 1, "1")
            .set(5, 4, "Классный час")
            .merge(5, 4, 5, 7);
        let bundle = parse_grid(&grid, ParserOptions::default());
        assert_eq!(bundle.lessons[0].raw_text, "Классный час");
    }

    #[test]
    fn lecture_merged_across_groups_has_no_room() {
        let mut grid = base_grid();
        grid.set(5, 0, "ПОНЕДЕЛЬНИК")
            .set(5, 1, "1")
            .set(5, 4, "Лекция")
            .merge(5, 4, 5, 11);
        let bundle = parse_grid(&grid, ParserOptions::default());
        assert_eq!(
            bundle.lessons,
            vec![
                lesson("И-255", Weekday::Monday, 1, "Лекция"),
                lesson("ПКС-21", Weekday::Monday, 1, "Лекция"),
            ]
        );
    }

    #[test]
    fn bell_times_come_from_the_third_column() {
        let mut grid = Grid::default();
        grid.set(3, 3, "И-255")
            .set(5, 0, "ПОНЕДЕЛЬНИК")
            .set(5, 1, "1")
            .set(5, 3, "Физика")
            .set(5, 4, "2.14")
            .set(6, 0, "ПОНЕДЕЛЬНИК")
            .set(6, 1, "2")
            .set(6, 2, "10:10-11:40")
            .set(6, 3, "Химия")
            .set(6, 4, "3.05");
        let bundle = parse_grid(&grid, ParserOptions::default());
        assert_eq!(bundle.bell_schedule, "<b>ПОНЕДЕЛЬНИК</b>\n2. 10:10-11:40");
        let texts: Vec<&str> = bundle.lessons.iter().map(|l| l.raw_text.as_str()).collect();
        assert_eq!(texts, vec!["Физика [2.14]", "Химия [3.05]"]);
    }

    #[test]
    fn different_subjects_render_both_sides() {
        let mut grid = base_grid();
        grid.set(5, 0, "ПОНЕДЕЛЬНИК")
            .set(5, 1, "3")
            .set(5, 4, "Английский")
            .set(5, 5, "310")
            .set(5, 6, "Немецкий");
        let bundle = parse_grid(&grid, ParserOptions::default());
        assert_eq!(bundle.lessons[0].raw_text, "Английский [310] / Немецкий");
    }

    #[test]
    fn one_sided_content_has_no_split_marker() {
        let mut grid = base_grid();
        grid.set(5, 0, "ПОНЕДЕЛЬНИК")
            .set(5, 1, "1")
            .set(5, 6, "Информатика")
            .set(5, 7, "7");
        let bundle = parse_grid(&grid, ParserOptions::default());
        assert_eq!(bundle.lessons[0].raw_text, "Информатика [7]");
    }

    #[test]
    fn wide_split_room_swap_is_opt_in() {
        let mut grid = base_grid();
        grid.set(5, 0, "ПОНЕДЕЛЬНИК")
            .set(5, 1, "1")
            .set(5, 4, "Химия")
            .set(5, 7, "40");
        let plain = parse_grid(&grid, ParserOptions::default());
        assert_eq!(plain.lessons[0].raw_text, "Химия");
        let swapped = parse_grid(
            &grid,
            ParserOptions {
                wide_split_rooms: true,
            },
        );
        assert_eq!(swapped.lessons[0].raw_text, "Химия [40]");
    }

    #[test]
    fn malformed_rows_are_skipped() {
        let mut grid = base_grid();
        grid.set(5, 0, "ПОНЕДЕЛЬНИК")
            .set(5, 1, "первая")
            .set(5, 4, "Пропуск")
            .set(6, 0, "Праздник")
            .set(6, 1, "2")
            .set(6, 4, "Пропуск")
            .set(7, 0, "ПОНЕДЕЛЬНИК")
            .set(7, 1, "0")
            .set(7, 4, "Пропуск")
            .set(8, 0, "ПОНЕДЕЛЬНИК")
            .set(8, 1, "3.0")
            .set(8, 4, "Биология")
            .set(8, 5, "-");
        let bundle = parse_grid(&grid, ParserOptions::default());
        assert_eq!(
            bundle.lessons,
            vec![lesson("И-255", Weekday::Monday, 3, "Биология")]
        );
    }

    #[test]
    fn merged_day_column_covers_following_rows() {
        let mut grid = base_grid();
        grid.set(5, 0, "СРЕДА")
            .merge(5, 0, 6, 0)
            .set(5, 1, "1")
            .set(5, 8, "Право")
            .set(6, 1, "2")
            .set(6, 4, "Экономика");
        let bundle = parse_grid(&grid, ParserOptions::default());
        assert_eq!(
            bundle.lessons,
            vec![
                lesson("ПКС-21", Weekday::Wednesday, 1, "Право"),
                lesson("И-255", Weekday::Wednesday, 2, "Экономика"),
            ]
        );
    }

    #[test]
    fn teacher_row_is_attached_not_emitted() {
        let mut grid = base_grid();
        grid.set(5, 0, "ЧЕТВЕРГ")
            .merge(5, 0, 8, 0)
            .set(5, 1, "1")
            .merge(5, 1, 6, 1)
            .set(5, 4, "Литература")
            .set(5, 5, "8")
            .set(6, 4, "Иванова А.А.")
            .set(7, 1, "2")
            .set(7, 4, "Физкультура")
            .set(7, 6, "Физкультура")
            .set(8, 4, "Петров")
            .set(8, 6, "Сидоров");
        let bundle = parse_grid(&grid, ParserOptions::default());
        assert_eq!(bundle.lessons.len(), 2);
        assert_eq!(bundle.lessons[0].teacher.as_deref(), Some("Иванова А.А."));
        assert_eq!(bundle.lessons[1].raw_text, "Физкультура");
        assert_eq!(bundle.lessons[1].teacher.as_deref(), Some("Петров / Сидоров"));
    }

    #[test]
    fn missing_header_is_empty_not_error() {
        let mut grid = Grid::default();
        grid.set(0, 0, "13.10.2025").set(5, 0, "ПОНЕДЕЛЬНИК");
        let bundle = parse_grid(&grid, ParserOptions::default());
        assert!(bundle.is_empty());
        assert_eq!(bundle.date_range, NO_HEADER_LABEL);
        assert_eq!(bundle.bell_schedule, "");
    }

    #[test]
    fn bells_group_identical_days() {
        let mut grid = base_grid();
        let mut row = 5;
        for day in Weekday::SCHOOL_DAYS {
            for (slot, time) in [(1, "08:30-10:00"), (2, "10:10-11:40")] {
                let time = if day == Weekday::Saturday && slot == 2 {
                    "10:00-11:30"
                } else {
                    time
                };
                grid.set(row, 0, day.ru_name())
                    .set(row, 1, slot.to_string())
                    .set(row, 2, time);
                row += 1;
            }
        }
        let bundle = parse_grid(&grid, ParserOptions::default());
        assert_eq!(
            bundle.bell_schedule,
            "<b>ПОНЕДЕЛЬНИК - ПЯТНИЦА</b>\n1. 08:30-10:00\n2. 10:10-11:40\n\n\
             <b>СУББОТА</b>\n1. 08:30-10:00\n2. 10:00-11:30"
        );
    }

    #[test]
    fn parses_lessons_from_workbook_bytes() {
        let bytes = crate::sheet::fixture::workbook(
            &[
                ("A2", "Расписание с 13.10.2025 по 18.10.2025"),
                ("A4", "День"),
                ("B4", "№"),
                ("C4", "Время"),
                ("E4", "И-255"),
                ("I4", "ПКС-21"),
                ("A6", "ПОНЕДЕЛЬНИК"),
                ("B6", "1"),
                ("C6", "08:30-10:00"),
                ("E6", "Математика"),
                ("F6", "204"),
                ("I6", "Право"),
                ("B7", "2"),
                ("C7", "10:10-11:40"),
                ("E7", "Физика"),
                ("G7", "Химия"),
                ("H7", "12"),
            ],
            &["A2:L2", "E4:H4", "I4:L4", "A6:A7"],
        );
        let bundle = XlsxScheduleParser::default().parse(&bytes).unwrap();
        assert_eq!(bundle.date_range, "Расписание с 13.10.2025 по 18.10.2025");
        assert_eq!(bundle.week_start, NaiveDate::from_ymd_opt(2025, 10, 13).unwrap());
        assert_eq!(
            bundle.lessons,
            vec![
                lesson("И-255", Weekday::Monday, 1, "Математика [204]"),
                lesson("ПКС-21", Weekday::Monday, 1, "Право"),
                lesson("И-255", Weekday::Monday, 2, "Физика / Химия [12]"),
            ]
        );
        assert_eq!(
            bundle.bell_schedule,
            "<b>ПОНЕДЕЛЬНИК</b>\n1. 08:30-10:00\n2. 10:10-11:40"
        );
    }

    #[test]
    fn bell_labels() {
        use Weekday::*;
        assert_eq!(day_label(&Weekday::SCHOOL_DAYS), "ПОНЕДЕЛЬНИК - СУББОТА");
        assert_eq!(day_label(&[Tuesday, Wednesday, Thursday]), "ВТОРНИК - ЧЕТВЕРГ");
        assert_eq!(day_label(&[Monday, Wednesday]), "ПОНЕДЕЛЬНИК, СРЕДА");
        assert_eq!(day_label(&[Friday]), "ПЯТНИЦА");
    }

    #[test]
    fn first_bell_time_wins() {
        let mut bells = BellSchedule::default();
        bells.record(Weekday::Monday, 1, "08:30".into());
        bells.record(Weekday::Monday, 1, "09:00".into());
        assert_eq!(bells.render(), "<b>ПОНЕДЕЛЬНИК</b>\n1. 08:30");
    }
}
