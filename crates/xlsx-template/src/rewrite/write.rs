use std::collections::BTreeMap;

use quick_xml::escape::partial_escape;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use super::{cached_is_numeric, CellContent, PlannedCell, PlannedRow, RewritePlan};
use crate::a1::{CellRef, Range, EXCEL_MAX_ROWS};
use crate::formula_refs::{rewrite_formula, FormulaScope, RowShift};
use crate::package::XlsxError;
use crate::shared_strings::{needs_space_preserve, prefix_of, read_text};
use crate::value::format_number;
use crate::workbook::with_attribute;
use crate::worksheet::next_row_number;

/// Cursor over the field updates of one kept row.
struct RowState<'p> {
    original: u32,
    new: u32,
    updates: Vec<&'p PlannedCell>,
    next: usize,
    last_col: u32,
}

impl<'p> RowState<'p> {
    fn new(original: u32, new: u32, updates: Option<&'p BTreeMap<u32, PlannedCell>>) -> Self {
        Self {
            original,
            new,
            updates: updates.map(|u| u.values().collect()).unwrap_or_default(),
            next: 0,
            last_col: 0,
        }
    }

    fn write_before(
        &mut self,
        writer: &mut Writer<Vec<u8>>,
        col: u32,
        prefix: &str,
    ) -> Result<(), XlsxError> {
        while let Some(cell) = self.updates.get(self.next).filter(|c| c.col < col) {
            write_planned_cell(writer, self.new, cell, prefix)?;
            self.next += 1;
        }
        Ok(())
    }

    fn take(&mut self, col: u32) -> Option<&'p PlannedCell> {
        let cell = self.updates.get(self.next).copied().filter(|c| c.col == col)?;
        self.next += 1;
        Some(cell)
    }

    fn write_remaining(
        &mut self,
        writer: &mut Writer<Vec<u8>>,
        prefix: &str,
    ) -> Result<(), XlsxError> {
        self.write_before(writer, u32::MAX, prefix)
    }
}

/// Formula text in the current `<c>` changed, so its cached `<v>` is stale.
#[derive(Default)]
struct CellState {
    drop_value: bool,
}

/// Stream `xml` (the template worksheet part) through `plan`.
pub(crate) fn rewrite_worksheet(xml: &[u8], plan: &RewritePlan) -> Result<Vec<u8>, XlsxError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut writer = Writer::new(Vec::with_capacity(xml.len() + plan.inserted_rows.len() * 160));
    let mut buf = Vec::new();

    let shift = &plan.shift;
    let scope = FormulaScope {
        sheet_name: &plan.sheet_name,
        unqualified_local: true,
        rename_to: plan.rename_to.as_deref(),
    };
    let mut pending: BTreeMap<u32, &PlannedRow> =
        plan.inserted_rows.iter().map(|(n, r)| (*n, r)).collect();

    let mut prefix = String::new();
    let mut in_sheet_data = false;
    let mut saw_sheet_data = false;
    let mut previous_row = 0u32;
    let mut row: Option<RowState<'_>> = None;
    let mut cell: Option<CellState> = None;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Eof => break,

            Event::Start(e) if is(&e, b"worksheet") => {
                prefix = prefix_of(&qname(&e)).to_string();
                writer.write_event(Event::Start(e.into_owned()))?;
            }
            Event::Start(e) if is(&e, b"dimension") => {
                let dim = plan.dimension.to_string();
                writer.write_event(Event::Start(with_attribute(&e, b"ref", &dim)?))?;
            }
            Event::Empty(e) if is(&e, b"dimension") => {
                let dim = plan.dimension.to_string();
                writer.write_event(Event::Empty(with_attribute(&e, b"ref", &dim)?))?;
            }

            Event::Start(e) if is(&e, b"sheetData") => {
                saw_sheet_data = true;
                in_sheet_data = true;
                prefix = prefix_of(&qname(&e)).to_string();
                writer.write_event(Event::Start(e.into_owned()))?;
            }
            Event::Empty(e) if is(&e, b"sheetData") => {
                saw_sheet_data = true;
                if pending.is_empty() {
                    writer.write_event(Event::Empty(e.into_owned()))?;
                } else {
                    // `<sheetData/>` has to be expanded to hold the new rows.
                    let name = qname(&e);
                    prefix = prefix_of(&name).to_string();
                    writer.write_event(Event::Start(e.into_owned()))?;
                    write_rows_before(&mut writer, &mut pending, u32::MAX, &prefix)?;
                    writer.write_event(Event::End(BytesEnd::new(name)))?;
                }
            }
            Event::End(e) if is_end(&e, b"sheetData") => {
                write_rows_before(&mut writer, &mut pending, u32::MAX, &prefix)?;
                in_sheet_data = false;
                writer.write_event(Event::End(e.into_owned()))?;
            }

            Event::Start(e) if in_sheet_data && is(&e, b"row") => {
                let original = row_number(&e, previous_row)?;
                previous_row = original;
                if shift.is_data_row(original) {
                    reader.read_to_end_into(e.name(), &mut Vec::new())?;
                } else {
                    let new = shift.shift_row(original);
                    write_rows_before(&mut writer, &mut pending, new, &prefix)?;
                    writer.write_event(Event::Start(renumbered_row(&e, new)?))?;
                    row = Some(RowState::new(original, new, plan.row_updates.get(&original)));
                }
            }
            Event::Empty(e) if in_sheet_data && is(&e, b"row") => {
                let original = row_number(&e, previous_row)?;
                previous_row = original;
                if !shift.is_data_row(original) {
                    let new = shift.shift_row(original);
                    write_rows_before(&mut writer, &mut pending, new, &prefix)?;
                    let start = renumbered_row(&e, new)?;
                    match plan.row_updates.get(&original) {
                        Some(updates) => {
                            let name = qname(&e);
                            writer.write_event(Event::Start(start))?;
                            for update in updates.values() {
                                write_planned_cell(&mut writer, new, update, &prefix)?;
                            }
                            writer.write_event(Event::End(BytesEnd::new(name)))?;
                        }
                        None => writer.write_event(Event::Empty(start))?,
                    }
                }
            }
            Event::End(e) if in_sheet_data && is_end(&e, b"row") => {
                if let Some(mut state) = row.take() {
                    state.write_remaining(&mut writer, &prefix)?;
                }
                cell = None;
                writer.write_event(Event::End(e.into_owned()))?;
            }

            Event::Start(e) if row.is_some() && cell.is_none() && is(&e, b"c") => {
                if let Some(state) = row.as_mut() {
                    let col = cell_column(&e, state.last_col)?;
                    state.last_col = col;
                    state.write_before(&mut writer, col, &prefix)?;
                    match state.take(col) {
                        Some(update) => {
                            reader.read_to_end_into(e.name(), &mut Vec::new())?;
                            write_planned_cell(&mut writer, state.new, update, &prefix)?;
                        }
                        None => {
                            writer.write_event(Event::Start(relocated_cell(&e, state, col)?))?;
                            cell = Some(CellState::default());
                        }
                    }
                }
            }
            Event::Empty(e) if row.is_some() && cell.is_none() && is(&e, b"c") => {
                if let Some(state) = row.as_mut() {
                    let col = cell_column(&e, state.last_col)?;
                    state.last_col = col;
                    state.write_before(&mut writer, col, &prefix)?;
                    match state.take(col) {
                        Some(update) => write_planned_cell(&mut writer, state.new, update, &prefix)?,
                        None => {
                            writer.write_event(Event::Empty(relocated_cell(&e, state, col)?))?
                        }
                    }
                }
            }
            Event::End(e) if cell.is_some() && is_end(&e, b"c") => {
                cell = None;
                writer.write_event(Event::End(e.into_owned()))?;
            }
            Event::Start(e) if cell.is_some() && is(&e, b"f") => {
                let name = qname(&e);
                let start = with_shifted_ranges(&e, b"ref", shift)?;
                let text = read_text(&mut reader)?;
                let rewritten = rewrite_formula(&text, shift, &scope);
                if rewritten != text {
                    if let Some(state) = cell.as_mut() {
                        state.drop_value = true;
                    }
                }
                writer.write_event(Event::Start(start))?;
                if !rewritten.is_empty() {
                    writer.write_event(Event::Text(BytesText::from_escaped(partial_escape(
                        rewritten.as_ref(),
                    ))))?;
                }
                writer.write_event(Event::End(BytesEnd::new(name)))?;
            }
            Event::Empty(e) if cell.is_some() && is(&e, b"f") => {
                writer.write_event(Event::Empty(with_shifted_ranges(&e, b"ref", shift)?))?;
            }
            Event::Start(e) if cell.as_ref().is_some_and(|c| c.drop_value) && is(&e, b"v") => {
                reader.read_to_end_into(e.name(), &mut Vec::new())?;
            }
            // Row extensions must follow every cell, including inserted ones.
            Event::Start(e) if row.is_some() && cell.is_none() => {
                if let Some(state) = row.as_mut() {
                    state.write_remaining(&mut writer, &prefix)?;
                }
                writer.write_event(Event::Start(e.into_owned()))?;
            }

            Event::Start(e) if is(&e, b"mergeCells") => {
                let element_prefix = prefix_of(&qname(&e)).to_string();
                reader.read_to_end_into(e.name(), &mut Vec::new())?;
                write_merge_cells(&mut writer, &plan.merges, &element_prefix)?;
            }
            Event::Empty(e) if is(&e, b"mergeCells") => {
                let element_prefix = prefix_of(&qname(&e)).to_string();
                write_merge_cells(&mut writer, &plan.merges, &element_prefix)?;
            }
            Event::Start(e) if is(&e, b"hyperlinks") => {
                let name = qname(&e);
                let kept = collect_hyperlinks(&mut reader, shift)?;
                if !kept.is_empty() {
                    writer.write_event(Event::Start(e.into_owned()))?;
                    for link in kept {
                        writer.write_event(link)?;
                    }
                    writer.write_event(Event::End(BytesEnd::new(name)))?;
                }
            }
            Event::Start(e) if is(&e, b"autoFilter") => {
                writer.write_event(Event::Start(with_shifted_ranges(&e, b"ref", shift)?))?;
            }
            Event::Empty(e) if is(&e, b"autoFilter") => {
                writer.write_event(Event::Empty(with_shifted_ranges(&e, b"ref", shift)?))?;
            }
            Event::Start(e) if is(&e, b"conditionalFormatting") || is(&e, b"dataValidation") => {
                writer.write_event(Event::Start(with_shifted_ranges(&e, b"sqref", shift)?))?;
            }
            Event::Empty(e) if is(&e, b"conditionalFormatting") || is(&e, b"dataValidation") => {
                writer.write_event(Event::Empty(with_shifted_ranges(&e, b"sqref", shift)?))?;
            }
            Event::Start(e)
                if !in_sheet_data
                    && matches!(e.local_name().as_ref(), b"formula" | b"formula1" | b"formula2") =>
            {
                let name = qname(&e);
                let text = read_text(&mut reader)?;
                let rewritten = rewrite_formula(&text, shift, &scope);
                writer.write_event(Event::Start(e.into_owned()))?;
                writer.write_event(Event::Text(BytesText::from_escaped(partial_escape(
                    rewritten.as_ref(),
                ))))?;
                writer.write_event(Event::End(BytesEnd::new(name)))?;
            }

            ev => writer.write_event(ev.into_owned())?,
        }
        buf.clear();
    }

    if !saw_sheet_data {
        return Err(XlsxError::Invalid("worksheet has no <sheetData>".to_string()));
    }
    Ok(writer.into_inner())
}

fn is(e: &BytesStart<'_>, local: &[u8]) -> bool {
    e.local_name().as_ref() == local
}

fn is_end(e: &BytesEnd<'_>, local: &[u8]) -> bool {
    e.local_name().as_ref() == local
}

fn qname(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().as_ref()).into_owned()
}

fn attr(e: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>, XlsxError> {
    for a in e.attributes() {
        let a = a?;
        if a.key.as_ref() == key {
            return Ok(Some(a.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

fn row_number(e: &BytesStart<'_>, previous: u32) -> Result<u32, XlsxError> {
    match attr(e, b"r")? {
        Some(r) => r
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|n| (1..=EXCEL_MAX_ROWS).contains(n))
            .ok_or_else(|| XlsxError::Invalid(format!("invalid row number {r:?}"))),
        None => next_row_number(previous),
    }
}

fn cell_column(e: &BytesStart<'_>, previous: u32) -> Result<u32, XlsxError> {
    match attr(e, b"r")? {
        Some(r) => CellRef::from_a1(&r)
            .map(|c| c.col)
            .map_err(|err| XlsxError::Invalid(format!("invalid cell reference {r:?}: {err}"))),
        None => Ok(previous + 1),
    }
}

fn renumbered_row(e: &BytesStart<'_>, new: u32) -> Result<BytesStart<'static>, XlsxError> {
    with_attribute(e, b"r", &new.to_string())
}

fn relocated_cell(
    e: &BytesStart<'_>,
    state: &RowState<'_>,
    col: u32,
) -> Result<BytesStart<'static>, XlsxError> {
    if state.new == state.original || attr(e, b"r")?.is_none() {
        return Ok(e.to_owned().into_owned());
    }
    with_attribute(e, b"r", &CellRef::new(state.new, col).to_a1())
}

/// Apply the two-corner rule to every range in a space-separated attribute (`ref`, `sqref`).
/// Tokens that do not parse are kept verbatim.
fn with_shifted_ranges(
    e: &BytesStart<'_>,
    key: &[u8],
    shift: &RowShift,
) -> Result<BytesStart<'static>, XlsxError> {
    let Some(value) = attr(e, key)? else {
        return Ok(e.to_owned().into_owned());
    };
    let shifted = shift_ranges(&value, shift);
    if shifted == value {
        return Ok(e.to_owned().into_owned());
    }
    with_attribute(e, key, &shifted)
}

fn shift_ranges(value: &str, shift: &RowShift) -> String {
    value
        .split_whitespace()
        .map(|token| match Range::from_a1(token) {
            Ok(range) => shift_range(range, shift).to_string(),
            Err(_) => token.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn shift_range(range: Range, shift: &RowShift) -> Range {
    let (first, last) = shift.rewrite_span(range.start.row, range.end.row);
    Range::new(
        CellRef::new(first, range.start.col),
        CellRef::new(last, range.end.col),
    )
}

/// Read the children of `<hyperlinks>`, dropping links that sat wholly on replaced data rows
/// and moving the rest.
fn collect_hyperlinks(
    reader: &mut Reader<&[u8]>,
    shift: &RowShift,
) -> Result<Vec<Event<'static>>, XlsxError> {
    let mut buf = Vec::new();
    let mut kept = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Empty(e) if is(&e, b"hyperlink") => {
                if !on_data_rows(&e, shift)? {
                    kept.push(Event::Empty(with_shifted_ranges(&e, b"ref", shift)?));
                }
            }
            Event::Start(e) if is(&e, b"hyperlink") => {
                let drop = on_data_rows(&e, shift)?;
                let name = qname(&e);
                let start = with_shifted_ranges(&e, b"ref", shift)?;
                reader.read_to_end_into(e.name(), &mut Vec::new())?;
                if !drop {
                    kept.push(Event::Start(start));
                    kept.push(Event::End(BytesEnd::new(name)));
                }
            }
            Event::End(e) if is_end(&e, b"hyperlinks") => break,
            Event::Eof => {
                return Err(XlsxError::Invalid("unexpected eof in <hyperlinks>".to_string()))
            }
            // Whitespace between links is dropped along with any removed link.
            Event::Text(_) => {}
            ev => kept.push(ev.into_owned()),
        }
        buf.clear();
    }
    Ok(kept)
}

fn on_data_rows(e: &BytesStart<'_>, shift: &RowShift) -> Result<bool, XlsxError> {
    Ok(attr(e, b"ref")?
        .and_then(|r| Range::from_a1(&r).ok())
        .is_some_and(|r| shift.is_data_row(r.start.row) && shift.is_data_row(r.end.row)))
}

fn write_rows_before(
    writer: &mut Writer<Vec<u8>>,
    pending: &mut BTreeMap<u32, &PlannedRow>,
    before: u32,
    prefix: &str,
) -> Result<(), XlsxError> {
    while let Some(entry) = pending.first_entry() {
        if *entry.key() >= before {
            break;
        }
        let row = entry.remove();
        write_planned_row(writer, row, prefix)?;
    }
    Ok(())
}

fn write_planned_row(
    writer: &mut Writer<Vec<u8>>,
    row: &PlannedRow,
    prefix: &str,
) -> Result<(), XlsxError> {
    let tag = format!("{prefix}row");
    let mut start = BytesStart::new(tag.as_str());
    start.push_attribute(("r", row.number.to_string().as_str()));
    if let Some(style) = row.style_id {
        start.push_attribute(("s", style.to_string().as_str()));
        start.push_attribute(("customFormat", "1"));
    }
    if let Some(height) = row.height {
        start.push_attribute(("ht", format_number(height).as_str()));
        if row.custom_height {
            start.push_attribute(("customHeight", "1"));
        }
    }

    if row.cells.is_empty() {
        writer.write_event(Event::Empty(start))?;
        return Ok(());
    }
    writer.write_event(Event::Start(start))?;
    for cell in &row.cells {
        write_planned_cell(writer, row.number, cell, prefix)?;
    }
    writer.write_event(Event::End(BytesEnd::new(tag.as_str())))?;
    Ok(())
}

fn write_planned_cell(
    writer: &mut Writer<Vec<u8>>,
    row: u32,
    cell: &PlannedCell,
    prefix: &str,
) -> Result<(), XlsxError> {
    let tag = format!("{prefix}c");
    let mut c = BytesStart::new(tag.as_str());
    c.push_attribute(("r", CellRef::new(row, cell.col).to_a1().as_str()));
    if cell.style_id != 0 {
        c.push_attribute(("s", cell.style_id.to_string().as_str()));
    }

    match &cell.content {
        CellContent::Blank => {
            writer.write_event(Event::Empty(c))?;
            return Ok(());
        }
        CellContent::Number(n) => {
            writer.write_event(Event::Start(c))?;
            write_text_element(writer, &format!("{prefix}v"), n, false)?;
        }
        CellContent::SharedString(idx) => {
            c.push_attribute(("t", "s"));
            writer.write_event(Event::Start(c))?;
            write_text_element(writer, &format!("{prefix}v"), &idx.to_string(), false)?;
        }
        CellContent::InlineString(text) => {
            c.push_attribute(("t", "inlineStr"));
            writer.write_event(Event::Start(c))?;
            let is_tag = format!("{prefix}is");
            writer.write_event(Event::Start(BytesStart::new(is_tag.as_str())))?;
            write_text_element(writer, &format!("{prefix}t"), text, needs_space_preserve(text))?;
            writer.write_event(Event::End(BytesEnd::new(is_tag.as_str())))?;
        }
        CellContent::Formula { text, cached } => {
            let text_result = cached.as_deref().filter(|v| !cached_is_numeric(v));
            if text_result.is_some() {
                c.push_attribute(("t", "str"));
            }
            writer.write_event(Event::Start(c))?;
            write_text_element(writer, &format!("{prefix}f"), text, false)?;
            if let Some(value) = cached {
                write_text_element(writer, &format!("{prefix}v"), value, false)?;
            }
        }
    }
    writer.write_event(Event::End(BytesEnd::new(tag.as_str())))?;
    Ok(())
}

fn write_text_element(
    writer: &mut Writer<Vec<u8>>,
    tag: &str,
    text: &str,
    preserve_space: bool,
) -> Result<(), XlsxError> {
    let mut start = BytesStart::new(tag);
    if preserve_space {
        start.push_attribute(("xml:space", "preserve"));
    }
    writer.write_event(Event::Start(start))?;
    writer.write_event(Event::Text(BytesText::from_escaped(partial_escape(text))))?;
    writer.write_event(Event::End(BytesEnd::new(tag)))?;
    Ok(())
}

fn write_merge_cells(
    writer: &mut Writer<Vec<u8>>,
    merges: &[Range],
    prefix: &str,
) -> Result<(), XlsxError> {
    if merges.is_empty() {
        return Ok(());
    }
    let tag = format!("{prefix}mergeCells");
    let mut start = BytesStart::new(tag.as_str());
    start.push_attribute(("count", merges.len().to_string().as_str()));
    writer.write_event(Event::Start(start))?;
    let cell_tag = format!("{prefix}mergeCell");
    for merge in merges {
        let mut e = BytesStart::new(cell_tag.as_str());
        e.push_attribute(("ref", merge.to_string().as_str()));
        writer.write_event(Event::Empty(e))?;
    }
    writer.write_event(Event::End(BytesEnd::new(tag.as_str())))?;
    Ok(())
}
