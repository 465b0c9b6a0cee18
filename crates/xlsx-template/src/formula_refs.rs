//! Best-effort textual rewriting of A1 references when a sheet's data zone changes length.
//!
//! This is pattern matching over cell/range tokens, not formula parsing. Known limits:
//! - whole-row (`6:8`) and whole-column (`C:C`) references are left as-is;
//! - defined names and structured references are never resolved;
//! - 3-D references (`Sheet1:Sheet3!A1`) and external workbook references are skipped.

use std::borrow::Cow;
use std::sync::OnceLock;

use regex::{Captures, Regex};

use crate::a1::{col_to_name, name_to_col, EXCEL_MAX_COLS, EXCEL_MAX_ROWS};

/// Row arithmetic for replacing the rows `data_start..=data_end` with `new_len` rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowShift {
    pub data_start: u32,
    pub data_end: u32,
    pub new_len: u32,
}

impl RowShift {
    pub fn new(data_start: u32, data_end: u32, new_len: u32) -> Self {
        Self {
            data_start,
            data_end,
            new_len,
        }
    }

    pub fn original_len(&self) -> u32 {
        (self.data_end + 1).saturating_sub(self.data_start)
    }

    /// First row after the original data zone.
    pub fn footer_start(&self) -> u32 {
        self.data_end + 1
    }

    /// `new_len - original_len`; negative when the data zone shrinks.
    pub fn delta(&self) -> i64 {
        i64::from(self.new_len) - i64::from(self.original_len())
    }

    /// Last row of the replacement data zone (`data_start - 1` when it is empty).
    pub fn new_data_end(&self) -> u32 {
        (self.data_start + self.new_len).saturating_sub(1)
    }

    pub fn is_data_row(&self, row: u32) -> bool {
        row >= self.data_start && row <= self.data_end
    }

    /// New number of an original row outside the data zone.
    pub fn shift_row(&self, row: u32) -> u32 {
        if row >= self.footer_start() {
            offset_row(row, self.delta())
        } else {
            row
        }
    }

    /// The two-corner rule shared by formula ranges, auto-filters and `sqref` scopes.
    ///
    /// A span lying inside the original data zone maps onto the new data zone. Otherwise the
    /// first row moves only when it sits in the footer and the last row moves when it is at or
    /// beyond the original data end.
    pub fn rewrite_span(&self, first: u32, last: u32) -> (u32, u32) {
        let (first, last) = (first.min(last), first.max(last));
        if self.original_len() > 0 && first >= self.data_start && last <= self.data_end {
            if self.new_len == 0 {
                // Nothing left to cover; collapse onto the row above the data zone.
                let anchor = self.data_start.saturating_sub(1).max(1);
                return (anchor, anchor);
            }
            return (self.data_start, self.new_data_end());
        }

        let new_first = self.shift_row(first);
        let new_last = if last >= self.data_end {
            offset_row(last, self.delta())
        } else {
            last
        };
        (new_first.min(new_last), new_last)
    }
}

fn offset_row(row: u32, delta: i64) -> u32 {
    (i64::from(row) + delta).clamp(1, i64::from(EXCEL_MAX_ROWS)) as u32
}

/// Which sheet a formula's references are resolved against.
#[derive(Debug, Clone, Copy)]
pub struct FormulaScope<'a> {
    /// Name of the sheet whose rows move.
    pub sheet_name: &'a str,
    /// Whether unqualified references point at that sheet.
    pub unqualified_local: bool,
    /// New name written into qualifiers that name the moved sheet.
    pub rename_to: Option<&'a str>,
}

impl<'a> FormulaScope<'a> {
    /// Scope for formulas stored on the moved sheet itself.
    pub fn on_sheet(sheet_name: &'a str) -> Self {
        Self {
            sheet_name,
            unqualified_local: true,
            rename_to: None,
        }
    }
}

fn reference_regex() -> &'static Regex {
    static REF_RE: OnceLock<Regex> = OnceLock::new();
    REF_RE.get_or_init(|| {
        Regex::new(
            r"(?:(?P<sheet>'(?:[^']|'')+'|[\p{L}_][\w.]*)!)?(?P<c1>\$?[A-Za-z]{1,3})(?P<r1>\$?[0-9]+)(?::(?P<c2>\$?[A-Za-z]{1,3})(?P<r2>\$?[0-9]+))?",
        )
        .expect("valid regex")
    })
}

/// Rewrite every local cell/range reference in `formula` according to `shift`.
///
/// Text inside string literals is never touched. Returns the input unchanged (borrowed) when
/// no reference moved.
pub fn rewrite_formula<'f>(
    formula: &'f str,
    shift: &RowShift,
    scope: &FormulaScope<'_>,
) -> Cow<'f, str> {
    map_references(formula, |qualifier, token| {
        let local = match qualifier {
            Some(q) => sheet_name_matches(q, scope.sheet_name),
            None => scope.unqualified_local,
        };
        if !local {
            return None;
        }
        let mut text = String::new();
        if let Some(q) = qualifier {
            match scope.rename_to {
                Some(new_name) => text.push_str(&quote_sheet_name(new_name)),
                None => text.push_str(q),
            }
            text.push('!');
        }
        token.shifted(shift).write(&mut text);
        Some(text)
    })
}

/// Re-anchor a shared formula from its master cell onto another cell of the group.
///
/// Relative rows and columns move by the offset; `$`-anchored parts stay put.
pub fn translate_relative(formula: &str, d_row: i64, d_col: i64) -> Cow<'_, str> {
    if d_row == 0 && d_col == 0 {
        return Cow::Borrowed(formula);
    }
    map_references(formula, |qualifier, mut token| {
        token.start.translate(d_row, d_col)?;
        if let Some(end) = token.end.as_mut() {
            end.translate(d_row, d_col)?;
        }
        let mut text = String::new();
        if let Some(q) = qualifier {
            text.push_str(q);
            text.push('!');
        }
        token.write(&mut text);
        Some(text)
    })
}

/// Apply `map` to every reference token outside string literals. `map` receives the raw sheet
/// qualifier (if any) and returns the full replacement text, or `None` to keep the token.
fn map_references<'f>(
    formula: &'f str,
    mut map: impl FnMut(Option<&str>, RefToken<'_>) -> Option<String>,
) -> Cow<'f, str> {
    let mut out = String::with_capacity(formula.len() + 8);
    let mut changed = false;
    for (idx, segment) in formula.split('"').enumerate() {
        if idx > 0 {
            out.push('"');
        }
        if idx % 2 == 1 {
            out.push_str(segment);
            continue;
        }

        let mut last = 0usize;
        for caps in reference_regex().captures_iter(segment) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            let before = segment[..whole.start()].chars().next_back();
            let after = segment[whole.end()..].chars().next();
            if before.is_some_and(blocks_prefix) || after.is_some_and(blocks_suffix) {
                continue;
            }
            let Some(token) = RefToken::from_captures(&caps) else {
                continue;
            };
            let qualifier = caps.name("sheet").map(|m| m.as_str());
            let Some(text) = map(qualifier, token) else {
                continue;
            };
            if text != whole.as_str() {
                out.push_str(&segment[last..whole.start()]);
                out.push_str(&text);
                last = whole.end();
                changed = true;
            }
        }
        out.push_str(&segment[last..]);
    }

    if changed {
        Cow::Owned(out)
    } else {
        Cow::Borrowed(formula)
    }
}

fn blocks_prefix(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '.' | '$' | '!' | ']' | '[' | ':' | '\'')
}

fn blocks_suffix(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '.' | '$' | '!' | '(' | '[')
}

#[derive(Debug, Clone)]
struct Corner<'a> {
    col_text: &'a str,
    col_abs: bool,
    col: u32,
    original_col: u32,
    row_abs: bool,
    row: u32,
}

impl<'a> Corner<'a> {
    fn parse(col_text: &'a str, row: &str) -> Option<Self> {
        let (col_abs, letters) = match col_text.strip_prefix('$') {
            Some(rest) => (true, rest),
            None => (false, col_text),
        };
        let col = name_to_col(letters)?;
        if col > EXCEL_MAX_COLS {
            return None;
        }
        let (row_abs, digits) = match row.strip_prefix('$') {
            Some(rest) => (true, rest),
            None => (false, row),
        };
        let row: u32 = digits.parse().ok()?;
        if row == 0 || row > EXCEL_MAX_ROWS {
            return None;
        }
        Some(Self {
            col_text,
            col_abs,
            col,
            original_col: col,
            row_abs,
            row,
        })
    }

    /// Move the relative parts; `None` when the result falls off the sheet.
    fn translate(&mut self, d_row: i64, d_col: i64) -> Option<()> {
        if !self.row_abs {
            let row = i64::from(self.row) + d_row;
            if row < 1 || row > i64::from(EXCEL_MAX_ROWS) {
                return None;
            }
            self.row = row as u32;
        }
        if !self.col_abs {
            let col = i64::from(self.col) + d_col;
            if col < 1 || col > i64::from(EXCEL_MAX_COLS) {
                return None;
            }
            self.col = col as u32;
        }
        Some(())
    }

    fn write(&self, out: &mut String) {
        if self.col == self.original_col {
            out.push_str(self.col_text);
        } else {
            if self.col_abs {
                out.push('$');
            }
            out.push_str(&col_to_name(self.col));
        }
        if self.row_abs {
            out.push('$');
        }
        out.push_str(&self.row.to_string());
    }
}

#[derive(Debug, Clone)]
struct RefToken<'a> {
    start: Corner<'a>,
    end: Option<Corner<'a>>,
}

impl<'a> RefToken<'a> {
    fn from_captures(caps: &Captures<'a>) -> Option<Self> {
        let start = Corner::parse(caps.name("c1")?.as_str(), caps.name("r1")?.as_str())?;
        let end = match (caps.name("c2"), caps.name("r2")) {
            (Some(c), Some(r)) => Some(Corner::parse(c.as_str(), r.as_str())?),
            _ => None,
        };
        Some(Self { start, end })
    }

    fn shifted(mut self, shift: &RowShift) -> Self {
        match self.end.as_mut() {
            None => self.start.row = shift.shift_row(self.start.row),
            Some(end) => {
                let (first, last) = shift.rewrite_span(self.start.row, end.row);
                if self.start.row <= end.row {
                    self.start.row = first;
                    end.row = last;
                } else {
                    self.start.row = last;
                    end.row = first;
                }
            }
        }
        self
    }

    fn write(&self, out: &mut String) {
        self.start.write(out);
        if let Some(end) = &self.end {
            out.push(':');
            end.write(out);
        }
    }
}

fn sheet_name_matches(qualifier: &str, sheet_name: &str) -> bool {
    let unquoted = match qualifier
        .strip_prefix('\'')
        .and_then(|q| q.strip_suffix('\''))
    {
        Some(inner) => Cow::Owned(inner.replace("''", "'")),
        None => Cow::Borrowed(qualifier),
    };
    unquoted.to_lowercase() == sheet_name.to_lowercase()
}

/// Render a sheet name as a formula qualifier, quoting it when Excel would.
pub fn quote_sheet_name(name: &str) -> String {
    let starts_plain = name
        .chars()
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_');
    let all_plain = name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.');
    let looks_like_ref = {
        let letters = name.trim_end_matches(|c: char| c.is_ascii_digit());
        letters.len() < name.len()
            && letters.len() <= 3
            && letters.chars().all(|c| c.is_ascii_alphabetic())
    };
    if starts_plain && all_plain && !looks_like_ref {
        name.to_string()
    } else {
        format!("'{}'", name.replace('\'', "''"))
    }
}
