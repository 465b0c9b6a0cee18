//! Zone inference: where the caption row, data zone and footer of a template sheet are.

use std::collections::BTreeMap;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::a1::Range;
use crate::error::TemplateError;
use crate::value::parse_integer;
use crate::worksheet::{Row, Worksheet};

/// Tunables for [`detect`]. Every field has a default, so partial JSON configs are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DetectorConfig {
    /// Last sheet row number searched for a marked caption row.
    pub caption_scan_rows: usize,
    /// Caption cells must be strictly shorter than this many characters.
    pub max_caption_chars: usize,
    /// Minimum number of cells (and of non-empty cells) in a caption row.
    pub min_caption_cells: usize,
    /// Last sheet row number the widest-row fallback considers.
    pub fallback_scan_rows: usize,
    /// Upper bound on example rows kept for style sampling.
    pub max_example_rows: usize,
    /// Sequence-number captions that identify the caption row (compared trimmed, lower-cased).
    pub caption_markers: Vec<String>,
    /// Aggregate functions whose presence in a formula marks a footer row.
    pub sum_functions: Vec<String>,
    /// Words that mark a footer row when they appear in a cell's text.
    pub total_markers: Vec<String>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        fn owned(items: &[&str]) -> Vec<String> {
            items.iter().map(|s| s.to_string()).collect()
        }
        Self {
            caption_scan_rows: 30,
            max_caption_chars: 30,
            min_caption_cells: 3,
            fallback_scan_rows: 20,
            max_example_rows: 4,
            caption_markers: owned(&[
                "no.", "no", "#", "stt", "tt", "số tt", "s/n", "sr.", "sr. no.", "nr.", "n°",
                "№", "序号",
            ]),
            sum_functions: owned(&["SUM", "SUBTOTAL", "SUMIF", "SUMIFS", "SUMPRODUCT"]),
            total_markers: owned(&[
                "total",
                "subtotal",
                "sub-total",
                "grand total",
                "tax",
                "tổng",
                "tổng cộng",
                "cộng",
                "thuế",
                "合计",
                "小计",
                "总计",
            ]),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptionRow {
    pub row: u32,
    /// Trimmed caption text for columns `1..=max_column` (empty where the caption is blank).
    pub captions: Vec<String>,
    /// `false` when the row was picked by the widest-row fallback.
    pub marked: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataZone {
    pub start_row: u32,
    /// `start_row - 1` when the zone is empty.
    pub end_row: u32,
    /// Leading record rows used as style samples.
    pub example_rows: Vec<Row>,
    /// Rows inside the zone whose key cell is not an integer but that carry content.
    pub category_rows: Vec<Row>,
    /// Rows inside the zone whose key cell is an integer.
    pub record_count: usize,
}

impl DataZone {
    pub fn is_empty(&self) -> bool {
        self.end_row < self.start_row
    }
}

/// Per-column styles sampled from one example row.
#[derive(Debug, Clone, PartialEq)]
pub struct StylePattern {
    /// Style id for columns `1..=max_column` (index 0 is column 1).
    pub styles: Vec<u32>,
    pub row_style: Option<u32>,
    pub height: Option<f64>,
    pub custom_height: bool,
}

impl StylePattern {
    fn sample(row: &Row, max_column: u32) -> Self {
        Self {
            styles: (1..=max_column)
                .map(|col| row.cell(col).map(|c| c.style_id).unwrap_or(0))
                .collect(),
            row_style: row.style_id,
            height: row.height,
            custom_height: row.custom_height,
        }
    }

    pub fn style_for(&self, col: u32) -> u32 {
        col.checked_sub(1)
            .and_then(|idx| self.styles.get(idx as usize))
            .copied()
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ZoneMap {
    pub header_rows: Vec<Row>,
    pub caption: CaptionRow,
    pub data: DataZone,
    pub footer_rows: Vec<Row>,
    pub merged_ranges: Vec<Range>,
    pub column_widths: BTreeMap<u32, f64>,
    /// Rightmost populated column of the caption row.
    pub max_column: u32,
    /// Leftmost populated column of the caption row; its cells decide record vs category rows.
    pub key_column: u32,
    /// Cycled across synthesized rows. Empty when the template has no example rows.
    pub style_pattern: Vec<StylePattern>,
}

impl ZoneMap {
    pub fn footer_start(&self) -> Option<u32> {
        self.footer_rows.first().map(|r| r.number)
    }
}

/// Infer the zones of `sheet`.
///
/// Fails with [`TemplateError::MalformedTemplate`] when neither a marked caption row nor a
/// non-empty fallback row exists.
pub fn detect(sheet: &Worksheet, config: &DetectorConfig) -> Result<ZoneMap, TemplateError> {
    let (caption_idx, marked) = match find_marked_caption(sheet, config) {
        Some(idx) => {
            debug!("caption row {} matched a sequence marker", sheet.rows[idx].number);
            (idx, true)
        }
        None => {
            let idx = widest_row(sheet, config).ok_or_else(|| {
                TemplateError::MalformedTemplate("no caption row found".to_string())
            })?;
            debug!(
                "no marked caption row; falling back to widest row {}",
                sheet.rows[idx].number
            );
            (idx, false)
        }
    };
    let caption_row = &sheet.rows[caption_idx];

    let mut populated = caption_row.non_empty_cells().map(|c| c.reference.col);
    let key_column = populated
        .next()
        .ok_or_else(|| TemplateError::MalformedTemplate("caption row is empty".to_string()))?;
    let max_column = populated.last().unwrap_or(key_column);
    let captions = (1..=max_column)
        .map(|col| caption_row.display(col).trim().to_string())
        .collect();

    let footer = FooterMatcher::new(config);
    let last_row = sheet.last_row_number().unwrap_or(caption_row.number);
    let after = &sheet.rows[caption_idx + 1..];

    // Rows before the first record are skipped even when they read like a footer
    // (a translated caption such as "Total amount").
    let (start_row, end_row) = if after.is_empty() {
        (caption_row.number + 2, caption_row.number + 1)
    } else if let Some(i) = after.iter().position(|r| is_record(r, key_column)) {
        let end = after[i..]
            .iter()
            .find(|r| footer.matches(r))
            .map(|r| r.number - 1)
            .unwrap_or(last_row);
        (after[i].number, end)
    } else if let Some(row) = after.iter().find(|r| footer.matches(r)) {
        // No record at all: the zone is empty and sits right above the first footer.
        (row.number, row.number - 1)
    } else {
        (last_row + 1, last_row)
    };

    let mut example_rows = Vec::new();
    let mut category_rows = Vec::new();
    let mut record_count = 0usize;
    for row in sheet.rows_between(start_row, end_row) {
        if is_record(row, key_column) {
            record_count += 1;
            if example_rows.len() < config.max_example_rows {
                example_rows.push(row.clone());
            }
        } else if row.has_content() {
            category_rows.push(row.clone());
        }
    }

    let pattern_len = if example_rows.len() >= 2 {
        2
    } else {
        example_rows.len()
    };
    let style_pattern = example_rows
        .iter()
        .take(pattern_len)
        .map(|row| StylePattern::sample(row, max_column))
        .collect();

    let column_widths = (1..=max_column)
        .filter_map(|col| sheet.column_width(col).map(|w| (col, w)))
        .collect();

    let header_rows = sheet
        .rows
        .iter()
        .filter(|r| r.number < caption_row.number)
        .cloned()
        .collect();
    let footer_rows: Vec<Row> = sheet
        .rows
        .iter()
        .filter(|r| r.number > end_row && r.number > caption_row.number)
        .cloned()
        .collect();

    debug!(
        "zones: caption {} (key column {key_column}, {max_column} columns), data {start_row}..={end_row} \
         ({record_count} records, {} categories), {} footer rows",
        caption_row.number,
        category_rows.len(),
        footer_rows.len()
    );

    Ok(ZoneMap {
        header_rows,
        caption: CaptionRow {
            row: caption_row.number,
            captions,
            marked,
        },
        data: DataZone {
            start_row,
            end_row,
            example_rows,
            category_rows,
            record_count,
        },
        footer_rows,
        merged_ranges: sheet.merges.clone(),
        column_widths,
        max_column,
        key_column,
        style_pattern,
    })
}

/// Whether the key cell of `row` holds an integer (a sequence number).
pub(crate) fn is_record(row: &Row, key_column: u32) -> bool {
    parse_integer(row.display(key_column)).is_some()
}

fn find_marked_caption(sheet: &Worksheet, config: &DetectorConfig) -> Option<usize> {
    let markers: Vec<String> = config
        .caption_markers
        .iter()
        .map(|m| m.trim().to_lowercase())
        .collect();

    sheet
        .rows
        .iter()
        .take_while(|row| row.number as usize <= config.caption_scan_rows)
        .position(|row| {
            if row.cells.len() < config.min_caption_cells {
                return false;
            }
            if row
                .cells
                .values()
                .any(|c| c.display_value.chars().count() >= config.max_caption_chars)
            {
                return false;
            }
            if row.non_empty_cells().count() < config.min_caption_cells {
                return false;
            }
            row.cells.values().any(|c| {
                let text = c.display_value.trim().to_lowercase();
                markers.iter().any(|m| *m == text)
            })
        })
}

fn widest_row(sheet: &Worksheet, config: &DetectorConfig) -> Option<usize> {
    let mut best: Option<(usize, usize)> = None;
    let within = sheet
        .rows
        .iter()
        .take_while(|row| row.number as usize <= config.fallback_scan_rows);
    for (idx, row) in within.enumerate() {
        let count = row.non_empty_cells().count();
        if count > best.map(|(_, c)| c).unwrap_or(0) {
            best = Some((idx, count));
        }
    }
    best.map(|(idx, _)| idx)
}

/// Recognizes footer rows: an aggregate formula or a total-like caption.
struct FooterMatcher {
    functions: Vec<String>,
    markers: Vec<String>,
}

impl FooterMatcher {
    fn new(config: &DetectorConfig) -> Self {
        Self {
            functions: config
                .sum_functions
                .iter()
                .map(|f| f.trim().to_ascii_uppercase())
                .filter(|f| !f.is_empty())
                .collect(),
            markers: config
                .total_markers
                .iter()
                .map(|m| m.trim().to_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
        }
    }

    fn matches(&self, row: &Row) -> bool {
        row.cells.values().any(|cell| {
            cell.formula
                .as_deref()
                .is_some_and(|f| self.calls_aggregate(f))
                || self.has_total_marker(&cell.display_value)
        })
    }

    fn calls_aggregate(&self, formula: &str) -> bool {
        let upper = formula.to_ascii_uppercase();
        self.functions.iter().any(|name| {
            upper.match_indices(name.as_str()).any(|(pos, _)| {
                let before = upper[..pos].chars().next_back();
                let rest = upper[pos + name.len()..].trim_start();
                rest.starts_with('(')
                    && !before.is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
            })
        })
    }

    fn has_total_marker(&self, text: &str) -> bool {
        if text.is_empty() {
            return false;
        }
        let lower = text.to_lowercase();
        self.markers.iter().any(|marker| {
            lower.match_indices(marker.as_str()).any(|(pos, _)| {
                let first = marker.chars().next();
                let last = marker.chars().next_back();
                let before = lower[..pos].chars().next_back();
                let after = lower[pos + marker.len()..].chars().next();
                let open_start = !first.is_some_and(is_word_char)
                    || !before.is_some_and(is_word_char);
                let open_end =
                    !last.is_some_and(is_word_char) || !after.is_some_and(is_word_char);
                open_start && open_end
            })
        })
    }
}

/// Letters and digits of scripts that separate words with spaces. CJK text has no word
/// boundaries, so its markers match anywhere.
fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() && !is_cjk(c)
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x3040..=0x30FF | 0x3400..=0x4DBF | 0x4E00..=0x9FFF | 0xF900..=0xFAFF | 0xAC00..=0xD7AF)
}
