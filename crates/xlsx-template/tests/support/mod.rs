//! In-memory workbook fixtures for integration tests.
#![allow(dead_code)]

use std::io::{Cursor, Write};

use xlsx_template::XlsxPackage;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const STYLES_XML: &[u8] = br#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<styleSheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><cellXfs count="7"><xf/><xf/><xf/><xf/><xf/><xf/><xf/></cellXfs></styleSheet>"#;

pub const CALC_CHAIN_XML: &[u8] = br#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<calcChain xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><c r="C9" i="1"/></calcChain>"#;

pub enum FixtureCell {
    Text { at: String, text: String, style: u32 },
    /// Two formatted runs in a shared-string entry (plain inline text without a string table).
    Rich { at: String, runs: [String; 2], style: u32 },
    Number { at: String, value: f64, style: u32 },
    Formula { at: String, formula: String, cached: Option<f64>, style: u32 },
    Blank { at: String, style: u32 },
}

pub fn text(at: &str, text: &str, style: u32) -> FixtureCell {
    FixtureCell::Text {
        at: at.to_string(),
        text: text.to_string(),
        style,
    }
}

pub fn rich(at: &str, first: &str, second: &str, style: u32) -> FixtureCell {
    FixtureCell::Rich {
        at: at.to_string(),
        runs: [first.to_string(), second.to_string()],
        style,
    }
}

pub fn num(at: &str, value: f64, style: u32) -> FixtureCell {
    FixtureCell::Number {
        at: at.to_string(),
        value,
        style,
    }
}

pub fn formula(at: &str, formula: &str, cached: Option<f64>, style: u32) -> FixtureCell {
    FixtureCell::Formula {
        at: at.to_string(),
        formula: formula.to_string(),
        cached,
        style,
    }
}

pub fn blank(at: &str, style: u32) -> FixtureCell {
    FixtureCell::Blank {
        at: at.to_string(),
        style,
    }
}

/// Builds a minimal but complete `.xlsx`: workbook, rels, content types, styles, calc chain,
/// an optional shared-string table, an optional second sheet and an optional chartsheet.
pub struct Fixture {
    sheet_name: String,
    shared_strings: bool,
    strings: Vec<String>,
    rows: Vec<String>,
    cols: Option<String>,
    tail: String,
    defined_names: String,
    second_sheet: Option<String>,
    chart_sheet: Option<ChartSheetAt>,
}

#[derive(Clone, Copy, PartialEq)]
enum ChartSheetAt {
    Front,
    Back,
}

impl Default for Fixture {
    fn default() -> Self {
        Self {
            sheet_name: "Sheet1".to_string(),
            shared_strings: true,
            strings: Vec::new(),
            rows: Vec::new(),
            cols: None,
            tail: String::new(),
            defined_names: String::new(),
            second_sheet: None,
            chart_sheet: None,
        }
    }
}

impl Fixture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sheet_name(mut self, name: &str) -> Self {
        self.sheet_name = name.to_string();
        self
    }

    /// Write text cells as `inlineStr` and leave out `xl/sharedStrings.xml`.
    pub fn inline_strings(mut self) -> Self {
        self.shared_strings = false;
        self
    }

    pub fn cols(mut self, xml: &str) -> Self {
        self.cols = Some(xml.to_string());
        self
    }

    /// Raw worksheet XML placed right after `</sheetData>`.
    pub fn tail(mut self, xml: &str) -> Self {
        self.tail.push_str(xml);
        self
    }

    pub fn defined_names(mut self, xml: &str) -> Self {
        self.defined_names = xml.to_string();
        self
    }

    /// Add a second sheet named `Notes` whose `C1` holds `formula`.
    pub fn notes_sheet(mut self, formula: &str) -> Self {
        self.second_sheet = Some(formula.to_string());
        self
    }

    /// Add a chartsheet named `Chart1` after the other sheets.
    pub fn trailing_chart_sheet(mut self) -> Self {
        self.chart_sheet = Some(ChartSheetAt::Back);
        self
    }

    /// Add a chartsheet named `Chart1` in front of the other sheets.
    pub fn leading_chart_sheet(mut self) -> Self {
        self.chart_sheet = Some(ChartSheetAt::Front);
        self
    }

    pub fn row(self, number: u32, cells: Vec<FixtureCell>) -> Self {
        self.row_with_attrs(number, "", cells)
    }

    pub fn row_with_attrs(mut self, number: u32, attrs: &str, cells: Vec<FixtureCell>) -> Self {
        let mut xml = format!(r#"<row r="{number}"{attrs}>"#);
        for cell in cells {
            let cell_xml = self.cell_xml(cell);
            xml.push_str(&cell_xml);
        }
        xml.push_str("</row>");
        self.rows.push(xml);
        self
    }

    fn string_index(&mut self, si: String) -> usize {
        match self.strings.iter().position(|s| *s == si) {
            Some(idx) => idx,
            None => {
                self.strings.push(si);
                self.strings.len() - 1
            }
        }
    }

    fn cell_xml(&mut self, cell: FixtureCell) -> String {
        match cell {
            FixtureCell::Text { at, text, style } if self.shared_strings => {
                let idx = self.string_index(format!("<si><t>{}</t></si>", escape(&text)));
                format!(r#"<c r="{at}" s="{style}" t="s"><v>{idx}</v></c>"#)
            }
            FixtureCell::Text { at, text, style } => format!(
                r#"<c r="{at}" s="{style}" t="inlineStr"><is><t>{}</t></is></c>"#,
                escape(&text)
            ),
            FixtureCell::Rich { at, runs, style } if !self.shared_strings => format!(
                r#"<c r="{at}" s="{style}" t="inlineStr"><is><t>{} {}</t></is></c>"#,
                escape(&runs[0]),
                escape(&runs[1])
            ),
            FixtureCell::Rich { at, runs, style } => {
                let idx = self.string_index(format!(
                    r#"<si><r><rPr><b/></rPr><t>{}</t></r><r><t xml:space="preserve"> {}</t></r></si>"#,
                    escape(&runs[0]),
                    escape(&runs[1])
                ));
                format!(r#"<c r="{at}" s="{style}" t="s"><v>{idx}</v></c>"#)
            }
            FixtureCell::Number { at, value, style } => {
                format!(r#"<c r="{at}" s="{style}"><v>{value}</v></c>"#)
            }
            FixtureCell::Formula {
                at,
                formula,
                cached,
                style,
            } => {
                let v = cached.map(|n| format!("<v>{n}</v>")).unwrap_or_default();
                format!(r#"<c r="{at}" s="{style}"><f>{}</f>{v}</c>"#, escape(&formula))
            }
            FixtureCell::Blank { at, style } => format!(r#"<c r="{at}" s="{style}"/>"#),
        }
    }

    pub fn sheet_xml(&self) -> String {
        let cols = self
            .cols
            .as_ref()
            .map(|c| format!("<cols>{c}</cols>"))
            .unwrap_or_default();
        format!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><dimension ref="A1:C11"/><sheetViews><sheetView workbookViewId="0"/></sheetViews><sheetFormatPr defaultRowHeight="15"/>{cols}<sheetData>{}</sheetData>{}<pageMargins left="0.7" right="0.7" top="0.75" bottom="0.75" header="0.3" footer="0.3"/></worksheet>"#,
            self.rows.join(""),
            self.tail
        )
    }

    pub fn build(&self) -> Vec<u8> {
        let mut entries: Vec<(String, Vec<u8>)> = Vec::new();
        let notes = self.second_sheet.is_some();

        let mut overrides = String::from(
            r#"<Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/><Override PartName="/xl/worksheets/sheet1.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/><Override PartName="/xl/styles.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.styles+xml"/><Override PartName="/xl/calcChain.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.calcChain+xml"/>"#,
        );
        if notes {
            overrides.push_str(r#"<Override PartName="/xl/worksheets/sheet2.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/>"#);
        }
        if self.chart_sheet.is_some() {
            overrides.push_str(r#"<Override PartName="/xl/chartsheets/sheet1.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.chartsheet+xml"/>"#);
        }
        if self.shared_strings {
            overrides.push_str(r#"<Override PartName="/xl/sharedStrings.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sharedStrings+xml"/>"#);
        }
        entries.push((
            "[Content_Types].xml".to_string(),
            format!(
                r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/>{overrides}</Types>"#
            )
            .into_bytes(),
        ));
        entries.push((
            "_rels/.rels".to_string(),
            br#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/></Relationships>"#
                .to_vec(),
        ));

        let mut sheets = format!(
            r#"<sheet name="{}" sheetId="1" r:id="rId1"/>"#,
            escape(&self.sheet_name)
        );
        if notes {
            sheets.push_str(r#"<sheet name="Notes" sheetId="2" r:id="rId4"/>"#);
        }
        let chart = r#"<sheet name="Chart1" sheetId="3" r:id="rId9"/>"#;
        match self.chart_sheet {
            Some(ChartSheetAt::Front) => sheets.insert_str(0, chart),
            Some(ChartSheetAt::Back) => sheets.push_str(chart),
            None => {}
        }
        let defined_names = if self.defined_names.is_empty() {
            String::new()
        } else {
            format!("<definedNames>{}</definedNames>", self.defined_names)
        };
        entries.push((
            "xl/workbook.xml".to_string(),
            format!(
                r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets>{sheets}</sheets>{defined_names}<calcPr calcId="191029"/></workbook>"#
            )
            .into_bytes(),
        ));

        let mut rels = String::from(
            r#"<Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/><Relationship Id="rId2" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles" Target="styles.xml"/><Relationship Id="rId5" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/calcChain" Target="calcChain.xml"/>"#,
        );
        if self.shared_strings {
            rels.push_str(r#"<Relationship Id="rId3" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/sharedStrings" Target="sharedStrings.xml"/>"#);
        }
        if notes {
            rels.push_str(r#"<Relationship Id="rId4" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet2.xml"/>"#);
        }
        if self.chart_sheet.is_some() {
            rels.push_str(r#"<Relationship Id="rId9" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/chartsheet" Target="chartsheets/sheet1.xml"/>"#);
        }
        entries.push((
            "xl/_rels/workbook.xml.rels".to_string(),
            format!(
                r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">{rels}</Relationships>"#
            )
            .into_bytes(),
        ));

        entries.push(("xl/worksheets/sheet1.xml".to_string(), self.sheet_xml().into_bytes()));
        if let Some(formula) = &self.second_sheet {
            entries.push((
                "xl/worksheets/sheet2.xml".to_string(),
                format!(
                    r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData><row r="1"><c r="C1"><f>{}</f></c></row></sheetData></worksheet>"#,
                    escape(formula)
                )
                .into_bytes(),
            ));
        }
        if self.chart_sheet.is_some() {
            entries.push((
                "xl/chartsheets/sheet1.xml".to_string(),
                br#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<chartsheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetViews><sheetView workbookViewId="0"/></sheetViews></chartsheet>"#
                    .to_vec(),
            ));
        }
        if self.shared_strings {
            entries.push((
                "xl/sharedStrings.xml".to_string(),
                format!(
                    r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<sst xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" count="{n}" uniqueCount="{n}">{}</sst>"#,
                    self.strings.join(""),
                    n = self.strings.len()
                )
                .into_bytes(),
            ));
        }
        entries.push(("xl/styles.xml".to_string(), STYLES_XML.to_vec()));
        entries.push(("xl/calcChain.xml".to_string(), CALC_CHAIN_XML.to_vec()));

        let refs: Vec<(&str, &[u8])> = entries
            .iter()
            .map(|(name, bytes)| (name.as_str(), bytes.as_slice()))
            .collect();
        build_zip_bytes(&refs)
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub fn build_zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let cursor = Cursor::new(Vec::new());
    let mut zip = ZipWriter::new(cursor);
    let options = FileOptions::<()>::default().compression_method(CompressionMethod::Deflated);

    for (name, bytes) in entries {
        zip.start_file(*name, options).expect("start_file");
        zip.write_all(bytes).expect("write entry bytes");
    }

    zip.finish().expect("finish").into_inner()
}

/// The scenario every test starts from: caption row 5 (`No.`/`Item`/`Qty`), three data rows
/// with alternating styles, a `Total` footer at row 9 with `SUM(C6:C8)` and a signature line at
/// row 11.
pub fn invoice() -> Fixture {
    Fixture::new()
        .cols(r#"<col min="1" max="1" width="6" customWidth="1"/><col min="2" max="2" width="30" customWidth="1"/><col min="3" max="3" width="12" customWidth="1"/>"#)
        .row(1, vec![rich("A1", "ACME", "Corp", 1)])
        .row(2, vec![text("A2", "Invoice date", 1), text("B2", "2024-05-01", 1)])
        .row(5, vec![text("A5", "No.", 2), text("B5", "Item", 2), text("C5", "Qty", 2)])
        .row_with_attrs(
            6,
            r#" ht="18" customHeight="1""#,
            vec![num("A6", 1.0, 3), text("B6", "Bolts", 3), num("C6", 10.0, 3)],
        )
        .row_with_attrs(
            7,
            r#" ht="18" customHeight="1""#,
            vec![num("A7", 2.0, 4), text("B7", "Nuts", 4), num("C7", 20.0, 4)],
        )
        .row_with_attrs(
            8,
            r#" ht="18" customHeight="1""#,
            vec![num("A8", 3.0, 3), text("B8", "Washers", 3), num("C8", 5.0, 3)],
        )
        .row(
            9,
            vec![
                blank("A9", 5),
                text("B9", "Total", 5),
                formula("C9", "SUM(C6:C8)", Some(35.0), 6),
            ],
        )
        .row(11, vec![text("B11", "Signed", 1)])
}

/// Rows of `count` records shaped like the invoice data (`n`, `Item n`, `n * 10`).
pub fn records(count: usize) -> Vec<Vec<xlsx_template::CellValue>> {
    use xlsx_template::CellValue;
    (1..=count)
        .map(|n| {
            vec![
                CellValue::Number(n as f64),
                CellValue::Text(format!("Item {n}")),
                CellValue::Number((n * 10) as f64),
            ]
        })
        .collect()
}

pub fn part_text(xlsx: &[u8], name: &str) -> String {
    let package = XlsxPackage::from_bytes(xlsx).expect("read package");
    package
        .part_text(name)
        .expect("utf-8 part")
        .unwrap_or_else(|| panic!("missing part {name}"))
}

pub fn part_bytes(xlsx: &[u8], name: &str) -> Vec<u8> {
    let package = XlsxPackage::from_bytes(xlsx).expect("read package");
    package
        .part(name)
        .unwrap_or_else(|| panic!("missing part {name}"))
        .to_vec()
}
