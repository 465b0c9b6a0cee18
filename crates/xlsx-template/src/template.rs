//! The public entry points: analyze a template once, generate from it many times.

use std::collections::BTreeMap;

use log::debug;
use serde::Serialize;

use crate::a1::CellRef;
use crate::error::TemplateError;
use crate::package::{PackageLimits, SheetPartInfo, XlsxPackage};
use crate::rewrite::rewrite;
use crate::shared_strings::SharedStringTable;
use crate::value::CellValue;
use crate::worksheet::Worksheet;
use crate::zones::{detect, is_record, DetectorConfig, ZoneMap};

/// An analyzed template: the package plus everything derived from its first sheet.
///
/// Immutable once built. Generation only reads from it, so one model can be shared across
/// threads.
#[derive(Debug, Clone)]
pub struct TemplateModel {
    package: XlsxPackage,
    sheet: SheetPartInfo,
    sheet_count: usize,
    worksheet: Worksheet,
    shared_strings: Option<SharedStringTable>,
    shared_strings_part: Option<String>,
    zones: ZoneMap,
}

impl TemplateModel {
    pub fn package(&self) -> &XlsxPackage {
        &self.package
    }

    /// Display name of the template sheet (the first sheet of the workbook).
    pub fn sheet_name(&self) -> &str {
        &self.sheet.name
    }

    pub fn sheet_count(&self) -> usize {
        self.sheet_count
    }

    pub fn worksheet_part(&self) -> &str {
        &self.sheet.part
    }

    pub fn worksheet(&self) -> &Worksheet {
        &self.worksheet
    }

    pub fn shared_strings(&self) -> Option<&SharedStringTable> {
        self.shared_strings.as_ref()
    }

    pub fn shared_strings_part(&self) -> Option<&str> {
        self.shared_strings_part.as_deref()
    }

    pub fn zones(&self) -> &ZoneMap {
        &self.zones
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateOptions {
    /// Rename the template sheet in the output.
    pub sheet_name: Option<String>,
    /// Values for single cells outside the data zone, addressed in template coordinates.
    pub field_updates: BTreeMap<CellRef, CellValue>,
}

/// What [`analyze_template`] found, in a serializable shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemplateSummary {
    pub sheet_name: String,
    pub sheet_count: usize,
    pub column_captions: Vec<String>,
    pub caption_row: u32,
    pub data_start_row: u32,
    pub data_end_row: u32,
    pub header_row_count: usize,
    pub data_row_count: usize,
    pub footer_row_count: usize,
    pub has_categories: bool,
    pub max_columns: u32,
    pub merge_count: usize,
}

pub fn analyze_template(bytes: &[u8]) -> Result<TemplateModel, TemplateError> {
    analyze_template_with_config(bytes, &DetectorConfig::default())
}

pub fn analyze_template_with_config(
    bytes: &[u8],
    config: &DetectorConfig,
) -> Result<TemplateModel, TemplateError> {
    analyze_template_with_limits(bytes, config, PackageLimits::default())
}

/// Like [`analyze_template_with_config`], with explicit inflate limits for untrusted input.
pub fn analyze_template_with_limits(
    bytes: &[u8],
    config: &DetectorConfig,
    limits: PackageLimits,
) -> Result<TemplateModel, TemplateError> {
    let package = XlsxPackage::from_bytes_limited(bytes, limits)?;

    let sheets = package.sheet_parts()?;
    let sheet_count = sheets.len();
    let sheet = sheets
        .into_iter()
        .next()
        .ok_or_else(|| TemplateError::MalformedTemplate("workbook has no sheets".to_string()))?;
    if !sheet.is_worksheet() {
        return Err(TemplateError::MalformedTemplate(format!(
            "first sheet {:?} is not a worksheet ({})",
            sheet.name, sheet.rel_type
        )));
    }
    debug!(
        "template sheet {:?} at {} ({sheet_count} sheets)",
        sheet.name, sheet.part
    );

    let shared_strings_part = package.shared_strings_part()?;
    let shared_strings = match shared_strings_part.as_deref().and_then(|p| package.part(p)) {
        Some(bytes) => Some(SharedStringTable::parse(bytes)?),
        None => None,
    };

    let worksheet_xml = package.part(&sheet.part).ok_or_else(|| {
        TemplateError::MalformedTemplate(format!("missing worksheet part {}", sheet.part))
    })?;
    let worksheet = Worksheet::parse(worksheet_xml, shared_strings.as_ref())?;
    let zones = detect(&worksheet, config)?;

    Ok(TemplateModel {
        package,
        sheet,
        sheet_count,
        worksheet,
        shared_strings,
        shared_strings_part,
        zones,
    })
}

/// Build a new workbook from `model` with `rows` as the data zone.
///
/// Each inner vector holds the values for columns `A..` of one row. Values past the caption
/// row's last column are ignored.
pub fn generate_from_template(
    model: &TemplateModel,
    rows: &[Vec<CellValue>],
    options: &GenerateOptions,
) -> Result<Vec<u8>, TemplateError> {
    Ok(rewrite(model, rows, options)?.write_to_bytes()?)
}

pub fn template_summary(model: &TemplateModel) -> TemplateSummary {
    let zones = &model.zones;
    TemplateSummary {
        sheet_name: model.sheet.name.clone(),
        sheet_count: model.sheet_count,
        column_captions: zones.caption.captions.clone(),
        caption_row: zones.caption.row,
        data_start_row: zones.data.start_row,
        data_end_row: zones.data.end_row,
        header_row_count: zones.header_rows.len(),
        data_row_count: zones.data.record_count,
        footer_row_count: zones.footer_rows.len(),
        has_categories: !zones.data.category_rows.is_empty(),
        max_columns: zones.max_column,
        merge_count: zones.merged_ranges.len(),
    }
}

/// The template's own record rows (category rows excluded), one value per caption column.
pub fn extract_data_rows(model: &TemplateModel) -> Vec<Vec<CellValue>> {
    let zones = &model.zones;
    model
        .worksheet
        .rows_between(zones.data.start_row, zones.data.end_row)
        .filter(|row| is_record(row, zones.key_column))
        .map(|row| {
            (1..=zones.max_column)
                .map(|col| row.cell(col).map(|c| c.value()).unwrap_or(CellValue::Empty))
                .collect()
        })
        .collect()
}
