//! Open Packaging Convention helpers: relationship parts and part-name resolution.

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::package::XlsxError;

pub(crate) const REL_TYPE_WORKSHEET: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet";
pub(crate) const REL_TYPE_SHARED_STRINGS: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/sharedStrings";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Relationship {
    pub id: String,
    pub type_uri: String,
    pub target: String,
    pub target_mode: Option<String>,
}

impl Relationship {
    pub fn is_external(&self) -> bool {
        self.target_mode
            .as_deref()
            .is_some_and(|mode| mode.trim().eq_ignore_ascii_case("External"))
    }
}

/// Name of the `.rels` part describing the relationships of `part`.
pub fn rels_for_part(part: &str) -> String {
    match part.rsplit_once('/') {
        Some((dir, file_name)) => format!("{dir}/_rels/{file_name}.rels"),
        None => format!("_rels/{part}.rels"),
    }
}

/// Resolve a relationship `Target` relative to the part that owns the relationship.
pub fn resolve_target(source_part: &str, target: &str) -> String {
    // Relationship targets are URIs; some producers include a fragment (e.g. `sheet1.xml#rId1`).
    // OPC part names do not include fragments, so strip them before resolving.
    let target = target.split('#').next().unwrap_or(target);
    if target.is_empty() {
        return normalize(source_part);
    }
    if let Some(target) = target.strip_prefix('/') {
        return normalize(target);
    }

    let base_dir = source_part
        .rsplit_once('/')
        .map(|(dir, _)| dir)
        .unwrap_or("");
    normalize(&format!("{base_dir}/{target}"))
}

fn normalize(path: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out.join("/")
}

pub fn parse_relationships(xml: &[u8]) -> Result<Vec<Relationship>, XlsxError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut relationships = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(start) | Event::Empty(start)
                if local_name(start.name().as_ref()).eq_ignore_ascii_case(b"Relationship") =>
            {
                let mut id = None;
                let mut target = None;
                let mut type_uri = None;
                let mut target_mode = None;
                for attr in start.attributes() {
                    let attr = attr?;
                    let key = local_name(attr.key.as_ref());
                    let value = attr.unescape_value()?.into_owned();
                    if key.eq_ignore_ascii_case(b"Id") {
                        id = Some(value);
                    } else if key.eq_ignore_ascii_case(b"Target") {
                        target = Some(value);
                    } else if key.eq_ignore_ascii_case(b"Type") {
                        type_uri = Some(value);
                    } else if key.eq_ignore_ascii_case(b"TargetMode") {
                        target_mode = Some(value);
                    }
                }
                if let (Some(id), Some(target), Some(type_uri)) = (id, target, type_uri) {
                    relationships.push(Relationship {
                        id,
                        type_uri,
                        target,
                        target_mode,
                    });
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(relationships)
}

/// Strip any namespace prefix from a qualified XML name (`x:row` -> `row`).
pub(crate) fn local_name(name: &[u8]) -> &[u8] {
    match name.iter().rposition(|b| *b == b':') {
        Some(idx) => &name[idx + 1..],
        None => name,
    }
}
