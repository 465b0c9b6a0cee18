use core::fmt;

/// A value supplied for (or read back from) a template cell.
#[derive(Clone, Debug, PartialEq)]
pub enum CellValue {
    Empty,
    Number(f64),
    Text(String),
    /// Formula text without the leading `=`, plus an optional cached result.
    Formula {
        text: String,
        cached: Option<String>,
    },
}

impl CellValue {
    /// Classify a raw input field (e.g. a CSV cell).
    ///
    /// - blank → [`CellValue::Empty`]
    /// - `=...` → [`CellValue::Formula`]
    /// - numeric-looking → [`CellValue::Number`]
    /// - anything else → [`CellValue::Text`]
    pub fn from_input(raw: &str) -> Self {
        if raw.trim().is_empty() {
            return CellValue::Empty;
        }
        if let Some(formula) = raw.strip_prefix('=') {
            if !formula.trim().is_empty() {
                return CellValue::Formula {
                    text: formula.to_string(),
                    cached: None,
                };
            }
        }
        match parse_numeric(raw) {
            Some(n) => CellValue::Number(n),
            None => CellValue::Text(raw.to_string()),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(s) => s.is_empty(),
            CellValue::Number(_) | CellValue::Formula { .. } => false,
        }
    }

    /// Resolve text that still looks numeric into a typed number.
    ///
    /// Numbers and formulas are returned unchanged.
    pub fn normalized(&self) -> CellValue {
        match self {
            CellValue::Text(s) if s.is_empty() => CellValue::Empty,
            CellValue::Text(s) => match parse_numeric(s) {
                Some(n) => CellValue::Number(n),
                None => self.clone(),
            },
            other => other.clone(),
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Empty => Ok(()),
            CellValue::Number(n) => write!(f, "{n}"),
            CellValue::Text(s) => f.write_str(s),
            CellValue::Formula { text, .. } => write!(f, "={text}"),
        }
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        CellValue::Number(value)
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::Text(value.to_string())
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        CellValue::Text(value)
    }
}

/// The single "looks numeric" predicate shared by detection, style sampling and
/// serialization.
///
/// Accepts anything Rust's float parser accepts after trimming, as long as the
/// result is finite (`inf`/`NaN` spellings stay text).
pub fn parse_numeric(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    let n: f64 = trimmed.parse().ok()?;
    n.is_finite().then_some(n)
}

/// Integer variant of [`parse_numeric`]; `"3"` and `"3.0"` both parse, `"3.5"` does not.
pub fn parse_integer(text: &str) -> Option<i64> {
    let n = parse_numeric(text)?;
    if n.fract() != 0.0 || n < i64::MIN as f64 || n > i64::MAX as f64 {
        return None;
    }
    Some(n as i64)
}

/// Render a number the way SpreadsheetML `<v>` nodes store it.
pub(crate) fn format_number(n: f64) -> String {
    if n == 0.0 {
        // Avoid emitting `-0`.
        return "0".to_string();
    }
    n.to_string()
}
