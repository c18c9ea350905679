//! Layout analysis: finds aligned, grid-like text runs that indicate tables.

use std::collections::BTreeMap;

use lopdf::content::Operation;
use lopdf::Object;

/// Rows closer than this (points) are treated as the same baseline.
const ROW_TOLERANCE: f32 = 2.0;

/// Column starts closer than this (points) are treated as the same column.
const COLUMN_TOLERANCE: f32 = 3.0;

/// Consecutive aligned rows needed before a grid counts as a table.
const MIN_TABLE_ROWS: usize = 3;

/// Columns a row must share with its neighbour to continue a grid.
const MIN_SHARED_COLUMNS: usize = 2;

/// One text-showing operation at its starting position.
#[derive(Debug, Clone, PartialEq)]
pub struct TextRun {
    pub x: f32,
    pub y: f32,
    pub text: String,
}

/// Walk a content stream and record where each string is drawn.
///
/// Tracks only the translation part of the text matrix; glyph advances are
/// not measured, so consecutive shows on one line share a start position.
pub fn runs_from_operations(operations: &[Operation]) -> Vec<TextRun> {
    let mut runs = Vec::new();
    let (mut line_x, mut line_y) = (0.0f32, 0.0f32);
    let mut leading = 0.0f32;

    for op in operations {
        let num = |i: usize| op.operands.get(i).and_then(|o| o.as_float().ok()).unwrap_or(0.0);

        match op.operator.as_str() {
            "BT" => {
                line_x = 0.0;
                line_y = 0.0;
            }
            "Tm" => {
                line_x = num(4);
                line_y = num(5);
            }
            "Td" => {
                line_x += num(0);
                line_y += num(1);
            }
            "TD" => {
                leading = -num(1);
                line_x += num(0);
                line_y += num(1);
            }
            "TL" => leading = num(0),
            "T*" => line_y -= leading,
            "Tj" | "TJ" => push_run(&mut runs, line_x, line_y, &op.operands),
            "'" => {
                line_y -= leading;
                push_run(&mut runs, line_x, line_y, &op.operands);
            }
            "\"" => {
                line_y -= leading;
                push_run(&mut runs, line_x, line_y, op.operands.get(2..).unwrap_or(&[]));
            }
            _ => {}
        }
    }

    runs
}

fn push_run(runs: &mut Vec<TextRun>, x: f32, y: f32, operands: &[Object]) {
    let mut text = String::new();
    for operand in operands {
        collect_string(operand, &mut text);
    }
    if !text.trim().is_empty() {
        runs.push(TextRun { x, y, text });
    }
}

fn collect_string(object: &Object, out: &mut String) {
    match object {
        Object::String(bytes, _) => out.extend(bytes.iter().map(|&b| b as char)),
        Object::Array(items) => items.iter().for_each(|item| collect_string(item, out)),
        _ => {}
    }
}

/// Count tables formed by runs aligned on a row/column grid.
///
/// Rows are grouped by baseline; a table is a block of at least
/// `MIN_TABLE_ROWS` consecutive rows, each sharing `MIN_SHARED_COLUMNS`
/// column starts with the row above it.
pub fn count_grid_tables(runs: &[TextRun]) -> usize {
    let mut rows: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
    for run in runs {
        let row = (run.y / ROW_TOLERANCE).round() as i64;
        let col = (run.x / COLUMN_TOLERANCE).round() as i64;
        rows.entry(row).or_default().push(col);
    }

    // Top of the page first.
    let mut ordered: Vec<Vec<i64>> = rows
        .into_values()
        .rev()
        .map(|mut cols| {
            cols.sort_unstable();
            cols.dedup();
            cols
        })
        .collect();
    ordered.retain(|cols| !cols.is_empty());

    let mut tables = 0;
    let mut block_rows = 0;
    let mut previous: Option<&Vec<i64>> = None;

    for cols in &ordered {
        let continues = cols.len() >= MIN_SHARED_COLUMNS
            && previous.is_some_and(|prev| shared_columns(prev, cols) >= MIN_SHARED_COLUMNS);

        if continues {
            block_rows += 1;
        } else {
            if block_rows >= MIN_TABLE_ROWS {
                tables += 1;
            }
            block_rows = usize::from(cols.len() >= MIN_SHARED_COLUMNS);
        }
        previous = Some(cols);
    }
    if block_rows >= MIN_TABLE_ROWS {
        tables += 1;
    }

    tables
}

fn shared_columns(a: &[i64], b: &[i64]) -> usize {
    a.iter().filter(|col| b.contains(col)).count()
}

/// Count tables visible in extracted text: blocks of consecutive lines split
/// into columns by tabs, pipes or wide space gaps.
pub fn count_text_tables(text: &str) -> usize {
    let mut tables = 0;
    let mut run = 0;
    for line in text.lines() {
        if is_tabular_line(line) {
            run += 1;
        } else {
            if run >= MIN_TABLE_ROWS {
                tables += 1;
            }
            run = 0;
        }
    }
    if run >= MIN_TABLE_ROWS {
        tables += 1;
    }
    tables
}

/// A line looks tabular if it has multiple columns separated by tabs,
/// pipes, or runs of 3+ spaces.
fn is_tabular_line(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.len() < 5 {
        return false;
    }
    trimmed.matches('\t').count() >= 2
        || trimmed.matches('|').count() >= 2
        || count_multi_space_gaps(trimmed) >= 2
}

fn count_multi_space_gaps(text: &str) -> usize {
    let mut count = 0;
    let mut gap_len = 0;

    for ch in text.chars() {
        if ch == ' ' {
            gap_len += 1;
            if gap_len == 3 {
                count += 1;
            }
        } else {
            gap_len = 0;
        }
    }

    count
}
