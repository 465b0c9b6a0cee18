use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Write};

use thiserror::Error;

use crate::openxml::{
    parse_relationships, rels_for_part, resolve_target, Relationship, REL_TYPE_WORKSHEET,
};
use crate::workbook::parse_workbook_sheets;
use crate::zip_util::{
    read_entry_with_budget, zip_part_names_equivalent, ZipInflateBudget,
    DEFAULT_MAX_ZIP_PART_BYTES, DEFAULT_MAX_ZIP_TOTAL_BYTES,
};

pub(crate) const WORKBOOK_PART: &str = "xl/workbook.xml";
const DEFAULT_SHARED_STRINGS_PART: &str = "xl/sharedStrings.xml";

#[derive(Debug, Error)]
pub enum XlsxError {
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("xml attribute error: {0}")]
    Attr(#[from] quick_xml::events::attributes::AttrError),
    #[error("utf-8 error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("missing required attribute: {0}")]
    MissingAttr(&'static str),
    #[error("invalid sheetId value")]
    InvalidSheetId,
    #[error("missing xlsx part: {0}")]
    MissingPart(String),
    #[error("invalid xlsx: {0}")]
    Invalid(String),
    #[error("xlsx package part is too large to load safely: {part} is {size} bytes (max {max} bytes)")]
    PartTooLarge { part: String, size: u64, max: u64 },
    #[error("xlsx package is too large to load safely: {total} bytes uncompressed (max {max})")]
    PackageTooLarge { total: u64, max: u64 },
}

/// Size limits enforced by [`XlsxPackage::from_bytes_limited`].
#[derive(Debug, Clone, Copy)]
pub struct PackageLimits {
    /// Maximum allowed uncompressed bytes for any single part.
    pub max_part_bytes: u64,
    /// Maximum allowed uncompressed bytes across the whole package.
    pub max_total_bytes: u64,
}

impl Default for PackageLimits {
    fn default() -> Self {
        Self {
            max_part_bytes: DEFAULT_MAX_ZIP_PART_BYTES,
            max_total_bytes: DEFAULT_MAX_ZIP_TOTAL_BYTES,
        }
    }
}

/// Resolved metadata for a workbook sheet and its part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetPartInfo {
    pub name: String,
    pub sheet_id: u32,
    pub rel_id: String,
    /// Relationship type of the sheet part (worksheet, chartsheet, dialogsheet, ...).
    pub rel_type: String,
    /// ZIP entry name for the sheet XML (e.g. `xl/worksheets/sheet1.xml`).
    pub part: String,
}

impl SheetPartInfo {
    /// Chartsheets and dialog sheets have no cell grid.
    pub fn is_worksheet(&self) -> bool {
        self.rel_type == REL_TYPE_WORKSHEET
    }
}

/// In-memory representation of an XLSX package as a map of part name -> bytes.
///
/// Parts that are never touched are written back byte-for-byte.
#[derive(Debug, Clone)]
pub struct XlsxPackage {
    parts: BTreeMap<String, Vec<u8>>,
}

impl XlsxPackage {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, XlsxError> {
        Self::from_bytes_limited(bytes, PackageLimits::default())
    }

    pub fn from_bytes_limited(bytes: &[u8], limits: PackageLimits) -> Result<Self, XlsxError> {
        let mut zip = zip::ZipArchive::new(Cursor::new(bytes))?;

        let mut parts = BTreeMap::new();
        let mut budget = ZipInflateBudget::new(limits.max_total_bytes);
        for i in 0..zip.len() {
            let mut file = zip.by_index(i)?;
            if !file.is_file() {
                continue;
            }

            // Valid packages never use a leading `/` or `\`, but tolerate producers that do.
            let name = file
                .name()
                .trim_start_matches(['/', '\\'])
                .replace('\\', "/");
            let declared = file.size();
            let buf =
                read_entry_with_budget(&mut file, declared, &name, limits.max_part_bytes, &mut budget)?;
            parts.insert(name, buf);
        }

        Ok(Self { parts })
    }

    /// Look up a part, tolerating case and separator differences in producer output.
    pub fn part(&self, name: &str) -> Option<&[u8]> {
        let name = name.strip_prefix('/').unwrap_or(name);
        if let Some(bytes) = self.parts.get(name) {
            return Some(bytes.as_slice());
        }
        self.parts
            .iter()
            .find(|(key, _)| zip_part_names_equivalent(key.as_str(), name))
            .map(|(_, bytes)| bytes.as_slice())
    }

    /// Read a part as UTF-8 text.
    pub fn part_text(&self, name: &str) -> Result<Option<String>, XlsxError> {
        self.part(name)
            .map(|bytes| String::from_utf8(bytes.to_vec()))
            .transpose()
            .map_err(XlsxError::from)
    }

    pub fn part_names(&self) -> impl Iterator<Item = &str> {
        self.parts.keys().map(String::as_str)
    }

    /// Insert or replace a part. Replacing keeps the stored spelling of an existing name.
    pub fn set_part(&mut self, name: impl Into<String>, bytes: Vec<u8>) {
        let name = name.into();
        let key = self
            .parts
            .keys()
            .find(|key| zip_part_names_equivalent(key.as_str(), &name))
            .cloned()
            .unwrap_or(name);
        self.parts.insert(key, bytes);
    }

    pub fn write_to_bytes(&self) -> Result<Vec<u8>, XlsxError> {
        let mut buf = Vec::new();
        self.write_to(&mut buf)?;
        Ok(buf)
    }

    pub fn write_to<W: Write>(&self, mut w: W) -> Result<(), XlsxError> {
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::FileOptions::<()>::default()
            .compression_method(zip::CompressionMethod::Deflated);

        for (name, bytes) in &self.parts {
            zip.start_file(name.as_str(), options)?;
            zip.write_all(bytes)?;
        }

        let cursor = zip.finish()?;
        w.write_all(&cursor.into_inner())?;
        Ok(())
    }

    fn relationships_of(&self, part: &str) -> Result<Vec<Relationship>, XlsxError> {
        let rels_name = rels_for_part(part);
        let bytes = self
            .part(&rels_name)
            .ok_or(XlsxError::MissingPart(rels_name))?;
        parse_relationships(bytes)
    }

    /// Return the ordered workbook sheets of every kind with their resolved part paths.
    ///
    /// This reads `xl/workbook.xml` for the `<sheet>` list and `xl/_rels/workbook.xml.rels`
    /// to resolve each sheet's `r:id` relationship to a concrete part name.
    pub fn sheet_parts(&self) -> Result<Vec<SheetPartInfo>, XlsxError> {
        let workbook_xml = self
            .part_text(WORKBOOK_PART)?
            .ok_or_else(|| XlsxError::MissingPart(WORKBOOK_PART.to_string()))?;
        let sheets = parse_workbook_sheets(&workbook_xml)?;

        let rel_by_id: HashMap<String, Relationship> = self
            .relationships_of(WORKBOOK_PART)?
            .into_iter()
            .map(|rel| (rel.id.clone(), rel))
            .collect();

        let mut out = Vec::with_capacity(sheets.len());
        for sheet in sheets {
            let rel = rel_by_id.get(&sheet.rel_id).ok_or_else(|| {
                XlsxError::Invalid(format!("missing relationship for {}", sheet.rel_id))
            })?;
            out.push(SheetPartInfo {
                name: sheet.name,
                sheet_id: sheet.sheet_id,
                rel_id: sheet.rel_id,
                rel_type: rel.type_uri.clone(),
                part: resolve_target(WORKBOOK_PART, &rel.target),
            });
        }
        Ok(out)
    }

    /// Resolve the shared strings part name, if the workbook has one.
    ///
    /// Prefers the workbook relationship of type `.../sharedStrings`, falling back to the
    /// conventional `xl/sharedStrings.xml`.
    pub fn shared_strings_part(&self) -> Result<Option<String>, XlsxError> {
        let relationships = self.relationships_of(WORKBOOK_PART)?;
        let target = relationships
            .iter()
            .find(|rel| {
                rel.type_uri == crate::openxml::REL_TYPE_SHARED_STRINGS && !rel.is_external()
            })
            .map(|rel| resolve_target(WORKBOOK_PART, &rel.target));

        let candidate = target.unwrap_or_else(|| DEFAULT_SHARED_STRINGS_PART.to_string());
        Ok(self.part(&candidate).is_some().then_some(candidate))
    }
}
