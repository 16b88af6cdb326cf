//! Locates the date line, the group header row and the day/time columns.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use super::{clean_text, Grid};
use crate::model::monday_of;
use crate::normalize::normalize_group;

static DATE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{2})\.(\d{2})\.(\d{4})").unwrap());
static GROUP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[А-ЯЁA-Zа-яёa-z]{1,3}[- ]?\d{2,4}[а-яё]?$").unwrap());
static DAY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(ПОНЕДЕЛЬНИК|ВТОРНИК|СРЕДА|ЧЕТВЕРГ|ПЯТНИЦА|СУББОТА)").unwrap()
});
static TIME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{1,2}[:.]\d{2}").unwrap());

const DATE_SCAN_ROWS: usize = 5;
const HEADER_SCAN_LAST_ROW: usize = 20;
const COLUMN_SCAN_WIDTH: usize = 5;
const COLUMN_SCAN_ROWS: usize = 100;

/// Where a group's block of sub-columns begins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupColumnAnchor {
    pub group: String,
    pub start_col: usize,
    pub col_span: usize,
}

/// Date-range line found near the top of the sheet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateRange {
    pub label: String,
    pub week_start: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SheetStructure {
    pub header_row: Option<usize>,
    pub groups: Vec<GroupColumnAnchor>,
    pub day_col: Option<usize>,
    pub time_col: Option<usize>,
}

pub fn is_group_name(text: &str) -> bool {
    GROUP_RE.is_match(text.trim())
}

/// First cell within the top rows containing a `dd.mm.yyyy` date.
///
/// `week_start` is that date moved back to its Monday, so a file published
/// mid-week ("на 15.10.2025") and the full-week file of the same week share a
/// week start and do not count as a new week.
pub fn find_date_range(grid: &Grid) -> Option<DateRange> {
    for row in 0..DATE_SCAN_ROWS {
        for col in 0..grid.row_width(row).max(1) {
            let text = grid.value(row, col);
            let Some(caps) = DATE_RE.captures(text) else {
                continue;
            };
            let week_start = parse_dmy(&caps[1], &caps[2], &caps[3]).map(monday_of);
            if week_start.is_none() {
                warn!(text, "date range holds an impossible date");
            }
            return Some(DateRange {
                label: clean_text(text),
                week_start,
            });
        }
    }
    None
}

pub(crate) fn parse_dmy(day: &str, month: &str, year: &str) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, day.parse().ok()?)
}

/// First row (0..=20) holding at least one group-name cell.
pub fn find_header_row(grid: &Grid) -> Option<usize> {
    (0..=HEADER_SCAN_LAST_ROW).find(|&row| {
        (0..grid.row_width(row)).any(|col| is_group_name(grid.value(row, col)))
    })
}

/// Group anchors of `header_row` in column order. A name seen twice keeps its
/// first position in the list but takes the later column.
pub fn group_anchors(grid: &Grid, header_row: usize) -> Vec<GroupColumnAnchor> {
    let mut anchors: Vec<GroupColumnAnchor> = Vec::new();
    for col in 0..grid.row_width(header_row) {
        if grid
            .merge_at(header_row, col)
            .is_some_and(|m| m.first_col != col)
        {
            continue;
        }
        let text = grid.value(header_row, col).trim();
        if !is_group_name(text) {
            continue;
        }
        let anchor = GroupColumnAnchor {
            group: normalize_group(text),
            start_col: col,
            col_span: grid.merge_at(header_row, col).map_or(1, |m| m.col_span()),
        };
        match anchors.iter_mut().find(|a| a.group == anchor.group) {
            Some(existing) => {
                debug!(group = %anchor.group, col, "duplicate group header; later column wins");
                *existing = anchor;
            }
            None => anchors.push(anchor),
        }
    }
    anchors
}

/// Full structural pass: header row, group anchors, day and time columns.
/// The day and time columns are informational; the parser reads the fixed
/// columns 0-2 and only warns when detection disagrees.
pub fn analyze(grid: &Grid) -> SheetStructure {
    let Some(header_row) = find_header_row(grid) else {
        return SheetStructure::default();
    };
    let groups = group_anchors(grid, header_row);

    // Day and time columns lie left of the group blocks, whose room cells
    // can look like times ("2.14").
    let scan_width = groups
        .iter()
        .map(|a| a.start_col)
        .min()
        .map_or(COLUMN_SCAN_WIDTH, |c| c.min(COLUMN_SCAN_WIDTH));

    let mut day_col = None;
    let mut time_col = None;
    let last_row = grid.last_row().unwrap_or(header_row);
    let scan_end = (header_row + 1 + COLUMN_SCAN_ROWS).min(last_row + 1);
    'rows: for row in header_row + 1..scan_end {
        for col in 0..scan_width {
            let text = grid.value(row, col).trim().to_uppercase();
            if day_col.is_none() && DAY_RE.is_match(&text) {
                debug!(col, value = %text, "found day column");
                day_col = Some(col);
            }
            if time_col.is_none() && TIME_RE.is_match(&text) {
                debug!(col, value = %text, "found time column");
                time_col = Some(col);
            }
            if day_col.is_some() && time_col.is_some() {
                break 'rows;
            }
        }
    }

    if day_col.is_none() && (time_col.is_some() || !groups.is_empty()) {
        warn!("day column not recognised; assuming column 0");
        day_col = Some(0);
    }

    let structure = SheetStructure {
        header_row: Some(header_row),
        groups,
        day_col,
        time_col,
    };
    info!(
        header_row,
        groups = structure.groups.len(),
        day_col = ?structure.day_col,
        time_col = ?structure.time_col,
        "sheet structure analysed"
    );
    structure
}
