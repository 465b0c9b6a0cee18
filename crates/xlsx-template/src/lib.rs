//! Template-driven XLSX generation.
//!
//! Given a human-authored workbook (a title block, a caption row, some example data rows and
//! a totals footer), this crate infers where each zone starts and ends and writes a new
//! workbook whose data zone holds caller-supplied rows. Everything around the data zone keeps
//! its styles, merges and column widths, and footer formulas are re-pointed at the new rows.
//!
//! - [`analyze_template`] reads a package once into an immutable [`TemplateModel`].
//! - [`generate_from_template`] produces output bytes from a model; it may be called
//!   concurrently on one model.
//! - [`template_summary`] and [`extract_data_rows`] describe what was detected.
//!
//! Only the first sheet is treated as the template. Formula references are rewritten
//! textually (see [`formula_refs`]); formulas are never evaluated.

pub mod a1;
mod error;
pub mod formula_refs;
pub mod openxml;
mod package;
pub mod rewrite;
pub mod shared_strings;
mod template;
pub mod value;
pub mod workbook;
pub mod worksheet;
mod zip_util;
pub mod zones;

pub use a1::{CellRef, Range};
pub use error::TemplateError;
pub use package::{PackageLimits, SheetPartInfo, XlsxError, XlsxPackage};
pub use template::{
    analyze_template, analyze_template_with_config, analyze_template_with_limits,
    extract_data_rows, generate_from_template, template_summary, GenerateOptions, TemplateModel,
    TemplateSummary,
};
pub use value::CellValue;
pub use zones::{DetectorConfig, ZoneMap};
