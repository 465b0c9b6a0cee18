use quick_xml::escape::partial_escape;
use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::error::TemplateError;
use crate::formula_refs::{rewrite_formula, FormulaScope, RowShift};
use crate::openxml::local_name;
use crate::package::XlsxError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkbookSheetInfo {
    pub name: String,
    pub sheet_id: u32,
    pub rel_id: String,
}

pub fn parse_workbook_sheets(workbook_xml: &str) -> Result<Vec<WorkbookSheetInfo>, XlsxError> {
    let mut reader = Reader::from_str(workbook_xml);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut sheets = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Eof => break,
            Event::Empty(e) | Event::Start(e) => {
                if e.local_name().as_ref() == b"sheet" {
                    sheets.push(parse_sheet_element(&e)?);
                }
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(sheets)
}

fn parse_sheet_element(e: &BytesStart<'_>) -> Result<WorkbookSheetInfo, XlsxError> {
    let mut name: Option<String> = None;
    let mut sheet_id: Option<u32> = None;
    let mut rel_id: Option<String> = None;

    for attr in e.attributes() {
        let attr = attr?;
        let key = attr.key.as_ref();
        match key {
            b"name" => name = Some(attr.unescape_value()?.to_string()),
            b"sheetId" => {
                let v = attr.unescape_value()?;
                sheet_id = Some(v.parse::<u32>().map_err(|_| XlsxError::InvalidSheetId)?);
            }
            _ if local_name(key) == b"id" => rel_id = Some(attr.unescape_value()?.to_string()),
            _ => {}
        }
    }

    Ok(WorkbookSheetInfo {
        name: name.ok_or(XlsxError::MissingAttr("name"))?,
        sheet_id: sheet_id.ok_or(XlsxError::MissingAttr("sheetId"))?,
        rel_id: rel_id.ok_or(XlsxError::MissingAttr("r:id"))?,
    })
}

/// Propagate a data-zone move (and an optional rename) of the first sheet into `workbook.xml`.
///
/// The first `<sheet>` gets the new display name, and every `<definedName>` referring to the
/// sheet (print areas, filter databases, user names) is rewritten with the formula rule.
/// Returns `None` when the part would come out unchanged.
pub(crate) fn rewrite_workbook_xml(
    workbook_xml: &str,
    sheet_name: &str,
    shift: &RowShift,
    rename_to: Option<&str>,
) -> Result<Option<Vec<u8>>, XlsxError> {
    let mut reader = Reader::from_str(workbook_xml);
    reader.config_mut().trim_text(false);
    let mut writer = Writer::new(Vec::with_capacity(workbook_xml.len() + 64));
    let mut buf = Vec::new();

    let mut seen_sheet = false;
    let mut changed = false;
    // (localSheetId == first sheet, buffered text events) while inside a `<definedName>`.
    let mut defined: Option<(bool, Vec<Event<'static>>)> = None;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Eof => break,
            Event::Start(e) if !seen_sheet && e.local_name().as_ref() == b"sheet" => {
                seen_sheet = true;
                let e = renamed_sheet(e, sheet_name, rename_to, &mut changed)?;
                writer.write_event(Event::Start(e))?;
            }
            Event::Empty(e) if !seen_sheet && e.local_name().as_ref() == b"sheet" => {
                seen_sheet = true;
                let e = renamed_sheet(e, sheet_name, rename_to, &mut changed)?;
                writer.write_event(Event::Empty(e))?;
            }
            Event::Start(e) if e.local_name().as_ref() == b"definedName" => {
                let mut local_to_first = false;
                for attr in e.attributes() {
                    let attr = attr?;
                    if attr.key.as_ref() == b"localSheetId" {
                        local_to_first = attr.unescape_value()?.trim() == "0";
                    }
                }
                writer.write_event(Event::Start(e.into_owned()))?;
                defined = Some((local_to_first, Vec::new()));
            }
            Event::End(e) if e.local_name().as_ref() == b"definedName" => {
                if let Some((local_to_first, events)) = defined.take() {
                    let mut text = String::new();
                    for ev in &events {
                        match ev {
                            Event::Text(t) => text.push_str(&t.unescape()?),
                            Event::CData(c) => text.push_str(&String::from_utf8_lossy(c.as_ref())),
                            _ => {}
                        }
                    }
                    let scope = FormulaScope {
                        sheet_name,
                        unqualified_local: local_to_first,
                        rename_to,
                    };
                    let rewritten = rewrite_formula(&text, shift, &scope);
                    if rewritten != text {
                        changed = true;
                        writer.write_event(Event::Text(BytesText::from_escaped(partial_escape(
                            rewritten.as_ref(),
                        ))))?;
                    } else {
                        for ev in events {
                            writer.write_event(ev)?;
                        }
                    }
                }
                writer.write_event(Event::End(e.into_owned()))?;
            }
            ev => match defined.as_mut() {
                Some((_, events)) => events.push(ev.into_owned()),
                None => writer.write_event(ev.into_owned())?,
            },
        }
        buf.clear();
    }

    Ok(changed.then(|| writer.into_inner()))
}

/// Longest sheet name spreadsheet applications accept.
const MAX_SHEET_NAME_CHARS: usize = 31;

/// Reject sheet names that spreadsheet applications refuse to open.
pub(crate) fn validate_sheet_name(name: &str) -> Result<(), TemplateError> {
    let problem = if name.is_empty() {
        Some("is empty".to_string())
    } else if name.chars().count() > MAX_SHEET_NAME_CHARS {
        Some(format!("is longer than {MAX_SHEET_NAME_CHARS} characters"))
    } else {
        name.chars()
            .find(|c| matches!(c, '[' | ']' | ':' | '*' | '?' | '/' | '\\'))
            .map(|c| format!("contains {c:?}"))
    };
    match problem {
        Some(problem) => Err(TemplateError::MalformedTemplate(format!(
            "sheet name {name:?} {problem}"
        ))),
        None => Ok(()),
    }
}

fn renamed_sheet(
    e: BytesStart<'_>,
    current: &str,
    rename_to: Option<&str>,
    changed: &mut bool,
) -> Result<BytesStart<'static>, XlsxError> {
    match rename_to {
        Some(new_name) if new_name != current => {
            *changed = true;
            with_attribute(&e, b"name", new_name)
        }
        _ => Ok(e.into_owned()),
    }
}

/// Copy `e`, replacing (or appending) the attribute `key`.
pub(crate) fn with_attribute(
    e: &BytesStart<'_>,
    key: &[u8],
    value: &str,
) -> Result<BytesStart<'static>, XlsxError> {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut out = BytesStart::new(name);
    let mut replaced = false;
    for attr in e.attributes() {
        let attr = attr?;
        if attr.key.as_ref() == key {
            let key = String::from_utf8_lossy(key).into_owned();
            out.push_attribute((key.as_str(), value));
            replaced = true;
        } else {
            out.push_attribute(attr);
        }
    }
    if !replaced {
        let key = String::from_utf8_lossy(key).into_owned();
        out.push_attribute((key.as_str(), value));
    }
    Ok(out)
}
