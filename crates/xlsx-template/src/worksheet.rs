//! Read-only row/cell model of a worksheet part.

use std::collections::{BTreeMap, HashMap};

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::a1::{CellRef, Range, EXCEL_MAX_ROWS};
use crate::formula_refs::translate_relative;
use crate::package::XlsxError;
use crate::shared_strings::{read_rich_text, SharedStringTable};
use crate::value::{parse_numeric, CellValue};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CellKind {
    SharedString,
    InlineString,
    Number,
    Boolean,
    /// `t="str"`; ISO dates (`t="d"`) are kept here as text too.
    FormulaString,
    Error,
}

impl CellKind {
    fn from_type_attr(t: Option<&str>) -> Self {
        match t {
            Some("s") => CellKind::SharedString,
            Some("inlineStr") => CellKind::InlineString,
            Some("b") => CellKind::Boolean,
            Some("e") => CellKind::Error,
            Some("str") | Some("d") => CellKind::FormulaString,
            _ => CellKind::Number,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Cell {
    pub reference: CellRef,
    pub style_id: u32,
    pub kind: CellKind,
    /// Contents of `<v>` (or the inline text for inline strings).
    pub raw_value: String,
    /// What a user sees: shared strings resolved, booleans spelled out.
    pub display_value: String,
    /// Formula text without the leading `=`. Shared-formula followers carry the master's
    /// formula translated to their own position.
    pub formula: Option<String>,
}

impl Cell {
    pub fn is_empty(&self) -> bool {
        self.formula.is_none() && self.display_value.trim().is_empty()
    }

    /// The cell's content as an input value, suitable for feeding back into generation.
    pub fn value(&self) -> CellValue {
        if let Some(formula) = self.formula.as_ref().filter(|f| !f.is_empty()) {
            return CellValue::Formula {
                text: formula.clone(),
                cached: (!self.raw_value.is_empty()).then(|| self.display_value.clone()),
            };
        }
        if self.display_value.is_empty() {
            return CellValue::Empty;
        }
        match self.kind {
            CellKind::Number => match parse_numeric(&self.raw_value) {
                Some(n) => CellValue::Number(n),
                None => CellValue::Text(self.display_value.clone()),
            },
            _ => CellValue::Text(self.display_value.clone()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct Row {
    pub number: u32,
    pub height: Option<f64>,
    pub custom_height: bool,
    pub hidden: bool,
    /// Row-level default style (`s` with `customFormat="1"`).
    pub style_id: Option<u32>,
    pub cells: BTreeMap<u32, Cell>,
}

impl Row {
    pub fn cell(&self, col: u32) -> Option<&Cell> {
        self.cells.get(&col)
    }

    /// Display text of the cell at `col`, or `""` when absent.
    pub fn display(&self, col: u32) -> &str {
        self.cells
            .get(&col)
            .map(|c| c.display_value.as_str())
            .unwrap_or("")
    }

    pub fn non_empty_cells(&self) -> impl Iterator<Item = &Cell> {
        self.cells.values().filter(|c| !c.is_empty())
    }

    pub fn has_content(&self) -> bool {
        self.non_empty_cells().next().is_some()
    }

    pub fn last_column(&self) -> Option<u32> {
        self.cells.keys().next_back().copied()
    }
}

/// One `<col>` element: a span of columns sharing width/style.
#[derive(Clone, Debug, PartialEq)]
pub struct ColumnSpan {
    pub min: u32,
    pub max: u32,
    pub width: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct Worksheet {
    /// Rows in ascending order of `number`.
    pub rows: Vec<Row>,
    pub merges: Vec<Range>,
    pub columns: Vec<ColumnSpan>,
    pub dimension: Option<Range>,
}

impl Worksheet {
    /// Parse a worksheet part, resolving shared-string cells through `strings`.
    pub fn parse(xml: &[u8], strings: Option<&SharedStringTable>) -> Result<Self, XlsxError> {
        let mut reader = Reader::from_reader(xml);
        reader.config_mut().trim_text(false);

        let mut buf = Vec::new();
        let mut sheet = Worksheet::default();
        let mut row: Option<Row> = None;
        let mut cell: Option<PendingCell> = None;
        let mut target = TextTarget::None;
        let mut shared_masters: HashMap<u32, (CellRef, String)> = HashMap::new();

        loop {
            match reader.read_event_into(&mut buf)? {
                Event::Start(e) if e.local_name().as_ref() == b"row" => {
                    row = Some(parse_row_start(&e, sheet.rows.last().map(|r| r.number))?);
                }
                Event::Empty(e) if e.local_name().as_ref() == b"row" => {
                    let parsed = parse_row_start(&e, sheet.rows.last().map(|r| r.number))?;
                    push_row(&mut sheet.rows, parsed)?;
                }
                Event::End(e) if e.local_name().as_ref() == b"row" => {
                    if let Some(done) = row.take() {
                        push_row(&mut sheet.rows, done)?;
                    }
                }
                Event::Start(e) if e.local_name().as_ref() == b"c" => {
                    cell = Some(PendingCell::from_start(&e, row.as_ref())?);
                }
                Event::Empty(e) if e.local_name().as_ref() == b"c" => {
                    let pending = PendingCell::from_start(&e, row.as_ref())?;
                    finish_cell(pending, row.as_mut(), strings, &mut shared_masters)?;
                }
                Event::End(e) if e.local_name().as_ref() == b"c" => {
                    if let Some(pending) = cell.take() {
                        finish_cell(pending, row.as_mut(), strings, &mut shared_masters)?;
                    }
                }
                Event::Start(e) if cell.is_some() && e.local_name().as_ref() == b"v" => {
                    target = TextTarget::Value;
                }
                Event::Start(e) if cell.is_some() && e.local_name().as_ref() == b"f" => {
                    if let Some(pending) = cell.as_mut() {
                        pending.read_formula_attrs(&e)?;
                        pending.formula = Some(String::new());
                    }
                    target = TextTarget::Formula;
                }
                Event::Empty(e) if cell.is_some() && e.local_name().as_ref() == b"f" => {
                    if let Some(pending) = cell.as_mut() {
                        pending.read_formula_attrs(&e)?;
                        pending.formula = Some(String::new());
                    }
                }
                Event::Start(e) if cell.is_some() && e.local_name().as_ref() == b"is" => {
                    let (text, _) = read_rich_text(&mut reader, b"is")?;
                    if let Some(pending) = cell.as_mut() {
                        pending.inline = Some(text);
                    }
                }
                Event::End(e) if matches!(e.local_name().as_ref(), b"v" | b"f") => {
                    target = TextTarget::None;
                }
                Event::Text(t) => {
                    if let Some(pending) = cell.as_mut() {
                        match target {
                            TextTarget::Value => pending.value.push_str(&t.unescape()?),
                            TextTarget::Formula => {
                                if let Some(f) = pending.formula.as_mut() {
                                    f.push_str(&t.unescape()?);
                                }
                            }
                            TextTarget::None => {}
                        }
                    }
                }
                Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"mergeCell" => {
                    if let Some(range) = attr(&e, b"ref")?.and_then(|r| Range::from_a1(&r).ok()) {
                        if !range.is_single_cell() {
                            sheet.merges.push(range);
                        }
                    }
                }
                Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"col" => {
                    let min = attr(&e, b"min")?.and_then(|v| v.parse().ok());
                    let max = attr(&e, b"max")?.and_then(|v| v.parse().ok());
                    if let (Some(min), Some(max)) = (min, max) {
                        let width = attr(&e, b"width")?.and_then(|v| v.parse().ok());
                        sheet.columns.push(ColumnSpan { min, max, width });
                    }
                }
                Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"dimension" => {
                    sheet.dimension = attr(&e, b"ref")?.and_then(|r| Range::from_a1(&r).ok());
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        Ok(sheet)
    }

    pub fn row(&self, number: u32) -> Option<&Row> {
        self.rows
            .binary_search_by_key(&number, |r| r.number)
            .ok()
            .map(|idx| &self.rows[idx])
    }

    pub fn last_row_number(&self) -> Option<u32> {
        self.rows.last().map(|r| r.number)
    }

    /// Rows with `first <= number <= last`.
    pub fn rows_between(&self, first: u32, last: u32) -> impl Iterator<Item = &Row> {
        self.rows
            .iter()
            .filter(move |r| r.number >= first && r.number <= last)
    }

    pub fn column_width(&self, col: u32) -> Option<f64> {
        self.columns
            .iter()
            .find(|span| span.min <= col && col <= span.max)
            .and_then(|span| span.width)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TextTarget {
    None,
    Value,
    Formula,
}

#[derive(Debug)]
struct PendingCell {
    reference: CellRef,
    style_id: u32,
    kind: CellKind,
    value: String,
    inline: Option<String>,
    formula: Option<String>,
    shared_index: Option<u32>,
}

impl PendingCell {
    fn from_start(e: &BytesStart<'_>, row: Option<&Row>) -> Result<Self, XlsxError> {
        let row_number = row.map(|r| r.number).unwrap_or(1);
        let mut reference = None;
        let mut style_id = 0;
        let mut t = None;
        for a in e.attributes() {
            let a = a?;
            match a.key.as_ref() {
                b"r" => reference = Some(a.unescape_value()?.into_owned()),
                b"s" => style_id = a.unescape_value()?.trim().parse().unwrap_or(0),
                b"t" => t = Some(a.unescape_value()?.into_owned()),
                _ => {}
            }
        }

        let reference = match reference {
            Some(r) => CellRef::from_a1(&r)
                .map_err(|err| XlsxError::Invalid(format!("invalid cell reference {r:?}: {err}")))?,
            None => {
                // Cells without `r` follow the previous cell of the row.
                let col = row.and_then(Row::last_column).unwrap_or(0) + 1;
                CellRef::new(row_number, col)
            }
        };
        if reference.row != row_number {
            return Err(XlsxError::Invalid(format!(
                "cell {reference} is stored in row {row_number}"
            )));
        }

        Ok(Self {
            reference,
            style_id,
            kind: CellKind::from_type_attr(t.as_deref()),
            value: String::new(),
            inline: None,
            formula: None,
            shared_index: None,
        })
    }

    fn read_formula_attrs(&mut self, e: &BytesStart<'_>) -> Result<(), XlsxError> {
        let mut shared = false;
        let mut si = None;
        for a in e.attributes() {
            let a = a?;
            match a.key.as_ref() {
                b"t" => shared = a.unescape_value()?.as_ref() == "shared",
                b"si" => si = a.unescape_value()?.trim().parse().ok(),
                _ => {}
            }
        }
        if shared {
            self.shared_index = si;
        }
        Ok(())
    }
}

fn finish_cell(
    pending: PendingCell,
    row: Option<&mut Row>,
    strings: Option<&SharedStringTable>,
    shared_masters: &mut HashMap<u32, (CellRef, String)>,
) -> Result<(), XlsxError> {
    let Some(row) = row else {
        return Err(XlsxError::Invalid(format!(
            "cell {} outside of a row",
            pending.reference
        )));
    };

    let mut formula = pending.formula;
    if let Some(si) = pending.shared_index {
        match formula.as_deref() {
            Some(text) if !text.is_empty() => {
                shared_masters.insert(si, (pending.reference, text.to_string()));
            }
            _ => {
                if let Some((master, text)) = shared_masters.get(&si) {
                    let d_row = i64::from(pending.reference.row) - i64::from(master.row);
                    let d_col = i64::from(pending.reference.col) - i64::from(master.col);
                    formula = Some(translate_relative(text, d_row, d_col).into_owned());
                }
            }
        }
    }

    let (raw_value, display_value) = match pending.kind {
        CellKind::InlineString => {
            let text = pending.inline.unwrap_or_default();
            (text.clone(), text)
        }
        CellKind::SharedString => {
            let display = pending
                .value
                .trim()
                .parse::<u32>()
                .ok()
                .and_then(|idx| strings.and_then(|s| s.get(idx)))
                .unwrap_or_default()
                .to_string();
            (pending.value, display)
        }
        CellKind::Boolean => {
            let display = match pending.value.trim() {
                "1" => "TRUE".to_string(),
                "0" => "FALSE".to_string(),
                other => other.to_string(),
            };
            (pending.value, display)
        }
        _ => (pending.value.clone(), pending.value),
    };

    row.cells.insert(
        pending.reference.col,
        Cell {
            reference: pending.reference,
            style_id: pending.style_id,
            kind: pending.kind,
            raw_value,
            display_value,
            formula,
        },
    );
    Ok(())
}

fn parse_row_start(e: &BytesStart<'_>, previous: Option<u32>) -> Result<Row, XlsxError> {
    let mut row = Row::default();
    let mut number = None;
    let mut style = None;
    let mut custom_format = false;
    for a in e.attributes() {
        let a = a?;
        let value = a.unescape_value()?;
        match a.key.as_ref() {
            b"r" => {
                number = Some(
                    value
                        .trim()
                        .parse::<u32>()
                        .ok()
                        .filter(|n| (1..=EXCEL_MAX_ROWS).contains(n))
                        .ok_or_else(|| {
                            XlsxError::Invalid(format!("invalid row number {value:?}"))
                        })?,
                );
            }
            b"ht" => row.height = value.trim().parse().ok(),
            b"customHeight" => row.custom_height = is_truthy(&value),
            b"hidden" => row.hidden = is_truthy(&value),
            b"s" => style = value.trim().parse().ok(),
            b"customFormat" => custom_format = is_truthy(&value),
            _ => {}
        }
    }
    row.number = match number {
        Some(n) => n,
        None => next_row_number(previous.unwrap_or(0))?,
    };
    if custom_format {
        row.style_id = style;
    }
    Ok(row)
}

/// Number of a `<row>` without an `r` attribute that follows row `previous`.
pub(crate) fn next_row_number(previous: u32) -> Result<u32, XlsxError> {
    previous
        .checked_add(1)
        .filter(|n| *n <= EXCEL_MAX_ROWS)
        .ok_or_else(|| XlsxError::Invalid(format!("row after {previous} is past the sheet end")))
}

fn push_row(rows: &mut Vec<Row>, row: Row) -> Result<(), XlsxError> {
    if let Some(last) = rows.last() {
        if row.number <= last.number {
            return Err(XlsxError::Invalid(format!(
                "row {} follows row {}",
                row.number, last.number
            )));
        }
    }
    rows.push(row);
    Ok(())
}

fn is_truthy(v: &str) -> bool {
    v == "1" || v.eq_ignore_ascii_case("true")
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
