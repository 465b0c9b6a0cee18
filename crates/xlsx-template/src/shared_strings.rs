//! Shared string table (`xl/sharedStrings.xml`) with append-only, index-stable edits.

use std::collections::HashMap;

use quick_xml::escape::partial_escape;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Reader;
use quick_xml::Writer;

use crate::package::XlsxError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StringOrigin {
    /// Read from the template; `rich` is set when the entry carries formatted runs.
    Template { rich: bool },
    /// Added while generating output; always plain text.
    Synthesized,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SharedStringEntry {
    pub text: String,
    pub origin: StringOrigin,
}

/// Deduplicated string pool.
///
/// Template entries keep their index forever; new strings are only ever appended. Lookups
/// reuse plain template entries, but never rich ones, so run formatting does not leak into
/// synthesized cells.
#[derive(Clone, Debug, Default)]
pub struct SharedStringTable {
    entries: Vec<SharedStringEntry>,
    plain_index: HashMap<String, u32>,
    template_len: usize,
    declared_count: Option<i64>,
}

impl SharedStringTable {
    pub fn parse(xml: &[u8]) -> Result<Self, XlsxError> {
        let mut reader = Reader::from_reader(xml);
        reader.config_mut().trim_text(false);

        let mut buf = Vec::new();
        let mut table = SharedStringTable::default();

        loop {
            match reader.read_event_into(&mut buf)? {
                Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"sst" => {
                    for attr in e.attributes() {
                        let attr = attr?;
                        if attr.key.as_ref() == b"count" {
                            table.declared_count = attr.unescape_value()?.trim().parse().ok();
                        }
                    }
                }
                Event::Start(e) if e.local_name().as_ref() == b"si" => {
                    let (text, rich) = read_rich_text(&mut reader, b"si")?;
                    table.push_template(text, rich);
                }
                Event::Empty(e) if e.local_name().as_ref() == b"si" => {
                    table.push_template(String::new(), false);
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        Ok(table)
    }

    fn push_template(&mut self, text: String, rich: bool) {
        let idx = self.entries.len() as u32;
        if !rich {
            self.plain_index.entry(text.clone()).or_insert(idx);
        }
        self.entries.push(SharedStringEntry {
            text,
            origin: StringOrigin::Template { rich },
        });
        self.template_len = self.entries.len();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries that came from the template.
    pub fn template_len(&self) -> usize {
        self.template_len
    }

    pub fn get(&self, idx: u32) -> Option<&str> {
        self.entries.get(idx as usize).map(|e| e.text.as_str())
    }

    pub fn entry(&self, idx: u32) -> Option<&SharedStringEntry> {
        self.entries.get(idx as usize)
    }

    /// Entries appended since the table was parsed.
    pub fn added(&self) -> &[SharedStringEntry] {
        &self.entries[self.template_len..]
    }

    /// Index of a plain entry with exactly this text.
    pub fn lookup(&self, text: &str) -> Option<u32> {
        self.plain_index.get(text).copied()
    }

    pub fn get_or_insert(&mut self, text: &str) -> u32 {
        if let Some(idx) = self.lookup(text) {
            return idx;
        }
        let idx = self.entries.len() as u32;
        self.entries.push(SharedStringEntry {
            text: text.to_string(),
            origin: StringOrigin::Synthesized,
        });
        self.plain_index.insert(text.to_string(), idx);
        idx
    }

    /// Re-serialize the part: every original `<si>` is copied through untouched, new entries are
    /// appended, and `count`/`uniqueCount` are updated. `reference_delta` is the net change in
    /// the number of cells referencing the table.
    pub(crate) fn write_part(
        &self,
        original: &[u8],
        reference_delta: i64,
    ) -> Result<Vec<u8>, XlsxError> {
        let mut reader = Reader::from_reader(original);
        reader.config_mut().trim_text(false);
        let mut writer = Writer::new(Vec::with_capacity(original.len() + self.added().len() * 32));
        let mut buf = Vec::new();

        let base_count = self.declared_count.unwrap_or(self.template_len as i64);
        let count = (base_count + reference_delta).max(0).to_string();
        let unique = self.entries.len().to_string();

        loop {
            match reader.read_event_into(&mut buf)? {
                Event::Start(e) if e.local_name().as_ref() == b"sst" => {
                    let root = with_counts(&e, &count, &unique)?;
                    writer.write_event(Event::Start(root))?;
                }
                Event::Empty(e) if e.local_name().as_ref() == b"sst" => {
                    // `<sst/>` has to be expanded to hold appended entries.
                    let root = with_counts(&e, &count, &unique)?;
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    writer.write_event(Event::Start(root))?;
                    self.write_added(&mut writer, prefix_of(&name))?;
                    writer.write_event(Event::End(BytesEnd::new(name)))?;
                }
                Event::End(e) if e.local_name().as_ref() == b"sst" => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    self.write_added(&mut writer, prefix_of(&name))?;
                    writer.write_event(Event::End(e.into_owned()))?;
                }
                Event::Eof => break,
                ev => writer.write_event(ev.into_owned())?,
            }
            buf.clear();
        }

        Ok(writer.into_inner())
    }

    fn write_added(&self, writer: &mut Writer<Vec<u8>>, prefix: &str) -> Result<(), XlsxError> {
        let si = format!("{prefix}si");
        let t = format!("{prefix}t");
        for entry in self.added() {
            writer.write_event(Event::Start(BytesStart::new(si.as_str())))?;
            let mut t_start = BytesStart::new(t.as_str());
            if needs_space_preserve(&entry.text) {
                t_start.push_attribute(("xml:space", "preserve"));
            }
            writer.write_event(Event::Start(t_start))?;
            writer.write_event(Event::Text(BytesText::from_escaped(partial_escape(
                entry.text.as_str(),
            ))))?;
            writer.write_event(Event::End(BytesEnd::new(t.as_str())))?;
            writer.write_event(Event::End(BytesEnd::new(si.as_str())))?;
        }
        Ok(())
    }
}

fn with_counts(
    e: &BytesStart<'_>,
    count: &str,
    unique: &str,
) -> Result<BytesStart<'static>, XlsxError> {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut out = BytesStart::new(name);
    for attr in e.attributes() {
        let attr = attr?;
        match attr.key.as_ref() {
            b"count" | b"uniqueCount" => {}
            _ => out.push_attribute(attr),
        }
    }
    out.push_attribute(("count", count));
    out.push_attribute(("uniqueCount", unique));
    Ok(out)
}

/// `x:sst` -> `x:`; unprefixed names give an empty prefix.
pub(crate) fn prefix_of(qname: &str) -> &str {
    match qname.rfind(':') {
        Some(idx) => &qname[..=idx],
        None => "",
    }
}

pub(crate) fn needs_space_preserve(text: &str) -> bool {
    text.starts_with(char::is_whitespace) || text.ends_with(char::is_whitespace)
}

/// Read the visible text of a string item (`<si>` or an inline `<is>`) whose start tag was
/// just consumed. The flag reports whether the item uses formatted runs.
pub(crate) fn read_rich_text(
    reader: &mut Reader<&[u8]>,
    container: &[u8],
) -> Result<(String, bool), XlsxError> {
    let mut buf = Vec::new();
    let mut text = String::new();
    let mut rich = false;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if e.local_name().as_ref() == b"t" => {
                text.push_str(&read_text(reader)?);
            }
            Event::Start(e) if e.local_name().as_ref() == b"r" => {
                rich = true;
                text.push_str(&parse_run(reader)?);
            }
            Event::Start(e) => {
                // Phonetic runs and extensions carry `<t>` nodes that are not displayed.
                reader.read_to_end_into(e.name(), &mut Vec::new())?;
            }
            Event::End(e) if e.local_name().as_ref() == container => break,
            Event::Eof => return Err(XlsxError::Invalid("unexpected eof in string item".to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok((text, rich))
}

fn parse_run(reader: &mut Reader<&[u8]>) -> Result<String, XlsxError> {
    let mut buf = Vec::new();
    let mut text = String::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if e.local_name().as_ref() == b"t" => {
                text.push_str(&read_text(reader)?);
            }
            Event::Start(e) => {
                reader.read_to_end_into(e.name(), &mut Vec::new())?;
            }
            Event::End(e) if e.local_name().as_ref() == b"r" => break,
            Event::Eof => return Err(XlsxError::Invalid("unexpected eof in <r>".to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(text)
}

/// Collect the text content of the element whose start tag was just read.
pub(crate) fn read_text(reader: &mut Reader<&[u8]>) -> Result<String, XlsxError> {
    let mut buf = Vec::new();
    let mut text = String::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Text(t) => text.push_str(&t.unescape()?),
            Event::CData(c) => text.push_str(&String::from_utf8_lossy(c.as_ref())),
            Event::End(_) => break,
            Event::Start(e) => {
                reader.read_to_end_into(e.name(), &mut Vec::new())?;
            }
            Event::Eof => return Err(XlsxError::Invalid("unexpected eof in text".to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(text)
}
