//! Structural rewrite of a template sheet: replace the data zone, move the footer.
//!
//! Work happens in two steps. [`RewritePlan::build`] decides everything up front (row
//! mapping, synthesized rows, field updates, merges, dimension, shared-string bookkeeping),
//! then [`write::rewrite_worksheet`] streams the original worksheet XML through once,
//! applying the plan.

mod write;

use std::collections::BTreeMap;

use log::{debug, warn};

use crate::a1::{CellRef, Range, EXCEL_MAX_ROWS};
use crate::error::TemplateError;
use crate::formula_refs::RowShift;
use crate::package::{XlsxPackage, WORKBOOK_PART};
use crate::shared_strings::SharedStringTable;
use crate::template::{GenerateOptions, TemplateModel};
use crate::value::{format_number, parse_numeric, CellValue};
use crate::workbook::{rewrite_workbook_xml, validate_sheet_name};
use crate::worksheet::{CellKind, Worksheet};
use crate::zones::ZoneMap;

pub(crate) use write::rewrite_worksheet;

/// What goes inside a planned `<c>` element.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CellContent {
    /// Style only, no value node.
    Blank,
    Number(String),
    SharedString(u32),
    InlineString(String),
    Formula { text: String, cached: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PlannedCell {
    pub col: u32,
    pub style_id: u32,
    pub content: CellContent,
}

/// A row written from scratch (synthesized data, or a field update on a missing row).
#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct PlannedRow {
    pub number: u32,
    pub height: Option<f64>,
    pub custom_height: bool,
    pub style_id: Option<u32>,
    /// Ascending by column.
    pub cells: Vec<PlannedCell>,
}

#[derive(Debug, Clone)]
pub(crate) struct RewritePlan {
    pub shift: RowShift,
    pub sheet_name: String,
    pub rename_to: Option<String>,
    /// New rows keyed by their final row number.
    pub inserted_rows: BTreeMap<u32, PlannedRow>,
    /// Cell overrides for rows that exist in the template, keyed by original row then column.
    pub row_updates: BTreeMap<u32, BTreeMap<u32, PlannedCell>>,
    pub merges: Vec<Range>,
    pub dimension: Range,
    /// Net change in the number of cells that reference the shared-string table.
    pub shared_string_delta: i64,
}

/// Where text values go: the workbook's shared-string table, or inline `<is>` nodes when the
/// template has none.
enum StringSink<'a> {
    Shared(&'a mut SharedStringTable),
    Inline,
}

impl StringSink<'_> {
    fn content_for(&mut self, value: &CellValue) -> CellContent {
        match value.normalized() {
            CellValue::Empty => CellContent::Blank,
            CellValue::Number(n) => CellContent::Number(format_number(n)),
            CellValue::Text(text) => match self {
                StringSink::Shared(table) => CellContent::SharedString(table.get_or_insert(&text)),
                StringSink::Inline => CellContent::InlineString(text),
            },
            CellValue::Formula { text, cached } => CellContent::Formula {
                text: text.strip_prefix('=').unwrap_or(&text).to_string(),
                cached,
            },
        }
    }
}

impl RewritePlan {
    /// Plan the replacement of the data zone of `sheet` with `rows`.
    ///
    /// Fails with [`TemplateError::NoStylePattern`] when the zone map has no example rows, and
    /// with [`TemplateError::MalformedTemplate`] when `rename_to` is not a usable sheet name.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn build(
        sheet: &Worksheet,
        zones: &ZoneMap,
        rows: &[Vec<CellValue>],
        field_updates: &BTreeMap<CellRef, CellValue>,
        strings: Option<&mut SharedStringTable>,
        sheet_name: &str,
        rename_to: Option<&str>,
    ) -> Result<Self, TemplateError> {
        if let Some(name) = rename_to {
            validate_sheet_name(name)?;
        }
        if zones.style_pattern.is_empty() {
            return Err(TemplateError::NoStylePattern);
        }

        let new_len = u32::try_from(rows.len())
            .ok()
            .filter(|n| {
                let needed = u64::from(zones.data.start_row) + u64::from(*n)
                    + zones.footer_rows.len() as u64;
                needed <= u64::from(EXCEL_MAX_ROWS) + 1
            })
            .ok_or_else(|| {
                TemplateError::MalformedTemplate(format!(
                    "{} data rows do not fit below row {}",
                    rows.len(),
                    zones.data.start_row
                ))
            })?;
        let shift = RowShift::new(zones.data.start_row, zones.data.end_row, new_len);
        debug!(
            "replacing rows {}..={} with {new_len} rows (shift {})",
            shift.data_start,
            shift.data_end,
            shift.delta()
        );

        let mut sink = match strings {
            Some(table) => StringSink::Shared(table),
            None => StringSink::Inline,
        };

        let mut shared_string_delta: i64 = -(sheet
            .rows_between(shift.data_start, shift.data_end)
            .flat_map(|r| r.cells.values())
            .filter(|c| c.kind == CellKind::SharedString)
            .count() as i64);

        let mut inserted_rows = BTreeMap::new();
        for (i, values) in rows.iter().enumerate() {
            let pattern = &zones.style_pattern[i % zones.style_pattern.len()];
            let number = shift.data_start + i as u32;
            if values.len() > zones.max_column as usize
                && values[zones.max_column as usize..].iter().any(|v| !v.is_empty())
            {
                warn!(
                    "row {number}: ignoring {} values beyond column {}",
                    values.len() - zones.max_column as usize,
                    zones.max_column
                );
            }
            let cells = (1..=zones.max_column)
                .map(|col| {
                    let content = values
                        .get(col as usize - 1)
                        .map(|v| sink.content_for(v))
                        .unwrap_or(CellContent::Blank);
                    if matches!(content, CellContent::SharedString(_)) {
                        shared_string_delta += 1;
                    }
                    PlannedCell {
                        col,
                        style_id: pattern.style_for(col),
                        content,
                    }
                })
                .collect();
            inserted_rows.insert(
                number,
                PlannedRow {
                    number,
                    height: pattern.height,
                    custom_height: pattern.custom_height,
                    style_id: pattern.row_style,
                    cells,
                },
            );
        }

        let mut row_updates: BTreeMap<u32, BTreeMap<u32, PlannedCell>> = BTreeMap::new();
        for (cell_ref, value) in field_updates {
            if shift.is_data_row(cell_ref.row) {
                warn!("ignoring field update for {cell_ref}: it lies inside the data zone");
                continue;
            }
            let existing_row = sheet.row(cell_ref.row);
            let existing = existing_row.and_then(|r| r.cell(cell_ref.col));
            if existing.is_some_and(|c| c.kind == CellKind::SharedString) {
                shared_string_delta -= 1;
            }
            let content = sink.content_for(value);
            if matches!(content, CellContent::SharedString(_)) {
                shared_string_delta += 1;
            }
            let cell = PlannedCell {
                col: cell_ref.col,
                style_id: existing.map(|c| c.style_id).unwrap_or(0),
                content,
            };
            if existing_row.is_some() {
                row_updates
                    .entry(cell_ref.row)
                    .or_default()
                    .insert(cell_ref.col, cell);
            } else {
                let number = shift.shift_row(cell_ref.row);
                let row = inserted_rows.entry(number).or_insert_with(|| PlannedRow {
                    number,
                    ..PlannedRow::default()
                });
                // Field updates iterate in row-major order, so columns arrive sorted.
                row.cells.push(cell);
            }
        }

        let merges = reconcile_merges(&zones.merged_ranges, &shift);
        let dimension = plan_dimension(sheet, zones, &shift, &inserted_rows, &row_updates);

        Ok(Self {
            shift,
            sheet_name: sheet_name.to_string(),
            rename_to: rename_to.map(str::to_string),
            inserted_rows,
            row_updates,
            merges,
            dimension,
            shared_string_delta,
        })
    }
}

/// Move merged ranges out of the way of the new data zone.
pub(crate) fn reconcile_merges(merges: &[Range], shift: &RowShift) -> Vec<Range> {
    let footer_start = shift.footer_start();
    merges
        .iter()
        .filter_map(|merge| {
            let (first, last) = (merge.start.row, merge.end.row);
            let (new_first, new_last) = if first >= shift.data_start && last <= shift.data_end {
                return None;
            } else if first >= footer_start {
                (shift.shift_row(first), shift.shift_row(last))
            } else if last >= footer_start {
                let new_first = if first >= shift.data_start {
                    shift.shift_row(footer_start)
                } else {
                    first
                };
                (new_first, shift.shift_row(last))
            } else if last >= shift.data_start {
                // Header-anchored merge reaching into the data zone.
                (first, shift.data_start - 1)
            } else {
                (first, last)
            };
            let range = Range::new(
                CellRef::new(new_first, merge.start.col),
                CellRef::new(new_last, merge.end.col),
            );
            (!range.is_single_cell()).then_some(range)
        })
        .collect()
}

fn plan_dimension(
    sheet: &Worksheet,
    zones: &ZoneMap,
    shift: &RowShift,
    inserted_rows: &BTreeMap<u32, PlannedRow>,
    row_updates: &BTreeMap<u32, BTreeMap<u32, PlannedCell>>,
) -> Range {
    let kept = sheet.rows.iter().filter(|r| !shift.is_data_row(r.number));
    let last_kept = kept.clone().map(|r| shift.shift_row(r.number)).max();
    let last_row = [last_kept, inserted_rows.keys().next_back().copied()]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(1);

    let max_col = kept
        .filter_map(|r| r.last_column())
        .chain(inserted_rows.values().flat_map(|r| r.cells.last().map(|c| c.col)))
        .chain(row_updates.values().flat_map(|cols| cols.keys().next_back().copied()))
        .fold(zones.max_column, u32::max);

    Range::new(CellRef::new(1, 1), CellRef::new(last_row.max(1), max_col.max(1)))
}

/// Produce the output package for `rows` without serializing it.
pub fn rewrite(
    template: &TemplateModel,
    rows: &[Vec<CellValue>],
    options: &GenerateOptions,
) -> Result<XlsxPackage, TemplateError> {
    let mut strings = template.shared_strings().cloned();
    let plan = RewritePlan::build(
        template.worksheet(),
        template.zones(),
        rows,
        &options.field_updates,
        strings.as_mut(),
        template.sheet_name(),
        options.sheet_name.as_deref(),
    )?;

    let package = template.package();
    let worksheet_part = template.worksheet_part();
    let original = package
        .part(worksheet_part)
        .ok_or_else(|| TemplateError::MalformedTemplate(format!("missing {worksheet_part}")))?;
    let worksheet_xml = rewrite_worksheet(original, &plan)?;

    let mut out = package.clone();
    out.set_part(worksheet_part, worksheet_xml);

    if let (Some(table), Some(part)) = (strings.as_ref(), template.shared_strings_part()) {
        let original = package
            .part(part)
            .ok_or_else(|| TemplateError::MalformedTemplate(format!("missing {part}")))?;
        out.set_part(part, table.write_part(original, plan.shared_string_delta)?);
    }

    if let Some(workbook_xml) = package.part_text(WORKBOOK_PART)? {
        if let Some(updated) = rewrite_workbook_xml(
            &workbook_xml,
            template.sheet_name(),
            &plan.shift,
            options.sheet_name.as_deref(),
        )? {
            out.set_part(WORKBOOK_PART, updated);
        }
    }

    Ok(out)
}

/// Whether a cached formula result should be written as a number.
pub(crate) fn cached_is_numeric(cached: &str) -> bool {
    parse_numeric(cached).is_some()
}
