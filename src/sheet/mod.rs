//! In-memory view of the first worksheet of a schedule workbook.
//!
//! Every cell read in the crate goes through [`Grid::value`], which resolves
//! merged regions to their top-left cell.

use calamine::{open_workbook_from_rs, Data, Reader, Xlsx, XlsxError};
use std::io::Cursor;
use thiserror::Error;
use tracing::debug;

pub mod analyzer;

#[derive(Debug, Error)]
pub enum SheetError {
    #[error("failed to read workbook: {0}")]
    Workbook(#[from] XlsxError),
    #[error("workbook has no worksheets")]
    NoSheet,
}

/// Inclusive rectangle of visually joined cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergedRegion {
    pub first_row: usize,
    pub first_col: usize,
    pub last_row: usize,
    pub last_col: usize,
}

impl MergedRegion {
    pub fn contains(&self, row: usize, col: usize) -> bool {
        (self.first_row..=self.last_row).contains(&row)
            && (self.first_col..=self.last_col).contains(&col)
    }

    pub fn col_span(&self) -> usize {
        self.last_col - self.first_col + 1
    }

    /// Number of columns of `[start, end]` covered by this region.
    pub fn cols_overlapping(&self, start: usize, end: usize) -> usize {
        let lo = self.first_col.max(start);
        let hi = self.last_col.min(end);
        if hi < lo {
            0
        } else {
            hi - lo + 1
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Grid {
    rows: Vec<Vec<String>>,
    merges: Vec<MergedRegion>,
}

impl Grid {
    /// Load the first worksheet of an `.xlsx` file.
    pub fn from_xlsx(bytes: &[u8]) -> Result<Self, SheetError> {
        let mut workbook: Xlsx<_> = open_workbook_from_rs(Cursor::new(bytes))?;
        let sheet_name = workbook
            .sheet_names()
            .first()
            .cloned()
            .ok_or(SheetError::NoSheet)?;
        let range = workbook.worksheet_range(&sheet_name)?;
        workbook.load_merged_regions()?;

        let mut grid = Grid::default();
        let (row0, col0) = range.start().unwrap_or((0, 0));
        for (r, c, cell) in range.cells() {
            let text = cell_text(cell);
            if !text.is_empty() {
                grid.set(row0 as usize + r, col0 as usize + c, text);
            }
        }
        for (_, _, dims) in workbook.merged_regions_by_sheet(&sheet_name) {
            grid.merge(
                dims.start.0 as usize,
                dims.start.1 as usize,
                dims.end.0 as usize,
                dims.end.1 as usize,
            );
        }
        debug!(
            sheet = %sheet_name,
            rows = grid.rows.len(),
            merges = grid.merges.len(),
            "loaded worksheet"
        );
        Ok(grid)
    }

    pub fn set(&mut self, row: usize, col: usize, text: impl Into<String>) -> &mut Self {
        if self.rows.len() <= row {
            self.rows.resize_with(row + 1, Vec::new);
        }
        let cells = &mut self.rows[row];
        if cells.len() <= col {
            cells.resize_with(col + 1, String::new);
        }
        cells[col] = text.into();
        self
    }

    pub fn merge(
        &mut self,
        first_row: usize,
        first_col: usize,
        last_row: usize,
        last_col: usize,
    ) -> &mut Self {
        self.merges.push(MergedRegion {
            first_row,
            first_col,
            last_row: last_row.max(first_row),
            last_col: last_col.max(first_col),
        });
        self
    }

    /// Index of the last row holding any cell, if the sheet is not empty.
    pub fn last_row(&self) -> Option<usize> {
        self.rows.iter().rposition(|cells| !cells.is_empty())
    }

    /// One past the right-most populated column of `row`.
    pub fn row_width(&self, row: usize) -> usize {
        self.rows.get(row).map_or(0, Vec::len)
    }

    pub fn merge_at(&self, row: usize, col: usize) -> Option<&MergedRegion> {
        self.merges.iter().find(|m| m.contains(row, col))
    }

    /// Text of the logical cell at (`row`, `col`): the top-left member's value
    /// when the position lies inside a merged region.
    pub fn value(&self, row: usize, col: usize) -> &str {
        match self.merge_at(row, col) {
            Some(m) => self.physical(m.first_row, m.first_col),
            None => self.physical(row, col),
        }
    }

    fn physical(&self, row: usize, col: usize) -> &str {
        self.rows
            .get(row)
            .and_then(|cells| cells.get(col))
            .map_or("", String::as_str)
    }
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty | Data::Error(_) => String::new(),
        Data::String(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
        other => other.to_string(),
    }
}

/// Collapse whitespace, strip the `.0` numeric artifact and blank out filler marks.
pub fn clean_text(text: &str) -> String {
    let collapsed = text
        .replace('\u{00A0}', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let trimmed = collapsed.strip_suffix(".0").unwrap_or(&collapsed);
    match trimmed {
        "-" | "'" | "`" | "." => String::new(),
        other => other.to_string(),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merged_members_read_top_left_value() {
        let mut grid = Grid::default();
        grid.set(2, 1, "Математика").merge(2, 1, 3, 4);
        assert_eq!(grid.value(2, 1), "Математика");
        assert_eq!(grid.value(3, 4), "Математика");
        assert_eq!(grid.value(3, 5), "");
        assert_eq!(grid.value(1, 1), "");
    }

    #[test]
    fn out_of_range_reads_are_empty() {
        let grid = Grid::default();
        assert_eq!(grid.value(100, 100), "");
        assert_eq!(grid.last_row(), None);
    }

    #[test]
    fn last_row_ignores_trailing_gaps() {
        let mut grid = Grid::default();
        grid.set(0, 0, "a").set(4, 2, "b");
        assert_eq!(grid.last_row(), Some(4));
        assert_eq!(grid.row_width(4), 3);
    }

    #[test]
    fn region_overlap_counts_columns() {
        let region = MergedRegion {
            first_row: 0,
            first_col: 3,
            last_row: 0,
            last_col: 6,
        };
        assert_eq!(region.cols_overlapping(4, 7), 3);
        assert_eq!(region.cols_overlapping(7, 10), 0);
        assert_eq!(region.col_span(), 4);
    }

    #[test]
    fn clean_text_normalizes_cells() {
        assert_eq!(clean_text("  Физика \u{00A0}  практ. "), "Физика практ.");
        assert_eq!(clean_text("204.0"), "204");
        assert_eq!(clean_text(" - "), "");
        assert_eq!(clean_text("`"), "");
        assert_eq!(clean_text("."), "");
        assert_eq!(clean_text("ПКС-21"), "ПКС-21");
    }

    #[test]
    fn loads_cells_and_merges_from_xlsx() {
        let bytes = fixture::workbook(
            &[("B2", "Расписание"), ("D3", "204"), ("E4", "И-255")],
            &["B2:C3", "E4:H4"],
        );
        let grid = Grid::from_xlsx(&bytes).unwrap();
        assert_eq!(grid.value(1, 1), "Расписание");
        assert_eq!(grid.value(2, 2), "Расписание");
        assert_eq!(grid.value(2, 3), "204");
        assert_eq!(grid.value(3, 7), "И-255");
        assert_eq!(grid.value(0, 0), "");
        assert_eq!(
            grid.merge_at(3, 6).copied(),
            Some(MergedRegion {
                first_row: 3,
                first_col: 4,
                last_row: 3,
                last_col: 7,
            })
        );
        assert_eq!(grid.last_row(), Some(3));
    }

    #[test]
    fn rejects_non_xlsx_bytes() {
        assert!(Grid::from_xlsx(b"definitely not a zip").is_err());
    }
}
