mod support;

use std::collections::BTreeMap;

use pretty_assertions::assert_eq;
use xlsx_template::{
    analyze_template, extract_data_rows, generate_from_template, template_summary, CellRef,
    CellValue, GenerateOptions, Range, TemplateError,
};

use support::{blank, formula, invoice, num, part_bytes, part_text, records, text, Fixture};

fn generate(template: &[u8], rows: &[Vec<CellValue>], options: &GenerateOptions) -> Vec<u8> {
    let model = analyze_template(template).expect("analyze template");
    generate_from_template(&model, rows, options).expect("generate")
}

#[test]
fn analyzes_the_invoice_template() {
    let model = analyze_template(&invoice().build()).expect("analyze");
    let summary = template_summary(&model);
    assert_eq!(summary.sheet_name, "Sheet1");
    assert_eq!(summary.sheet_count, 1);
    assert_eq!(summary.column_captions, vec!["No.", "Item", "Qty"]);
    assert_eq!(summary.caption_row, 5);
    assert_eq!((summary.data_start_row, summary.data_end_row), (6, 8));
    assert_eq!(summary.header_row_count, 2);
    assert_eq!(summary.data_row_count, 3);
    assert_eq!(summary.footer_row_count, 2);
    assert!(!summary.has_categories);
    assert_eq!(summary.max_columns, 3);
    assert_eq!(summary.merge_count, 0);

    let zones = model.zones();
    assert_eq!(
        zones.column_widths,
        BTreeMap::from([(1, 6.0), (2, 30.0), (3, 12.0)])
    );
}

#[test]
fn five_rows_push_the_footer_down_two_rows() {
    let out = generate(&invoice().build(), &records(5), &GenerateOptions::default());
    let model = analyze_template(&out).expect("analyze output");
    let ws = model.worksheet();

    for n in 1..=5u32 {
        let row = ws.row(5 + n).unwrap_or_else(|| panic!("row {}", 5 + n));
        assert_eq!(row.display(1), n.to_string());
        assert_eq!(row.display(2), format!("Item {n}"));
        assert_eq!(row.display(3), (n * 10).to_string());
        // Styles alternate like the example rows did; heights are inherited.
        let expected_style = if n % 2 == 1 { 3 } else { 4 };
        assert_eq!(row.cell(2).unwrap().style_id, expected_style);
        assert_eq!(row.height, Some(18.0));
        assert!(row.custom_height);
    }

    let footer = ws.row(11).expect("footer row");
    assert_eq!(footer.display(2), "Total");
    assert_eq!(footer.cell(2).unwrap().style_id, 5);
    assert_eq!(footer.cell(3).unwrap().formula.as_deref(), Some("SUM(C6:C10)"));
    assert_eq!(ws.row(13).expect("signature row").display(2), "Signed");
    assert_eq!(ws.row(9).unwrap().display(2), "Item 4");

    let summary = template_summary(&model);
    assert_eq!((summary.data_start_row, summary.data_end_row), (6, 10));
    assert_eq!(summary.data_row_count, 5);
    assert_eq!(ws.dimension, Some(Range::from_a1("A1:C13").unwrap()));
    assert_eq!(model.zones().column_widths.get(&2), Some(&30.0));
}

#[test]
fn stale_cached_totals_are_dropped() {
    let out = generate(&invoice().build(), &records(5), &GenerateOptions::default());
    let sheet = part_text(&out, "xl/worksheets/sheet1.xml");
    assert!(sheet.contains(r#"<c r="C11" s="6"><f>SUM(C6:C10)</f></c>"#), "{sheet}");
}

#[test]
fn one_row_pulls_the_footer_up() {
    let out = generate(&invoice().build(), &records(1), &GenerateOptions::default());
    let model = analyze_template(&out).expect("analyze output");
    let ws = model.worksheet();
    assert_eq!(ws.row(6).unwrap().display(2), "Item 1");
    let footer = ws.row(7).expect("footer row");
    assert_eq!(footer.display(2), "Total");
    assert_eq!(footer.cell(3).unwrap().formula.as_deref(), Some("SUM(C6:C6)"));
    assert_eq!(ws.row(9).unwrap().display(2), "Signed");
    assert_eq!(ws.last_row_number(), Some(9));
}

#[test]
fn zero_rows_leave_the_footer_under_the_caption() {
    let out = generate(&invoice().build(), &[], &GenerateOptions::default());
    let model = analyze_template(&out).expect("analyze output");
    let ws = model.worksheet();
    assert_eq!(ws.row(6).unwrap().display(2), "Total");
    assert_eq!(ws.row(8).unwrap().display(2), "Signed");
    let summary = template_summary(&model);
    assert_eq!(summary.data_row_count, 0);
    assert_eq!((summary.data_start_row, summary.data_end_row), (6, 5));
}

#[test]
fn template_without_example_rows_has_no_style_pattern() {
    let template = Fixture::new()
        .row(1, vec![text("A1", "No.", 2), text("B1", "Item", 2), text("C1", "Qty", 2)])
        .row(2, vec![blank("A2", 5), text("B2", "Total", 5), formula("C2", "SUM(C1:C1)", None, 6)])
        .build();
    let model = analyze_template(&template).expect("analyze");
    assert_eq!(template_summary(&model).data_row_count, 0);

    let err = generate_from_template(&model, &records(2), &GenerateOptions::default())
        .expect_err("no examples to style new rows with");
    assert!(matches!(err, TemplateError::NoStylePattern), "{err:?}");
}

#[test]
fn empty_sheet_is_malformed() {
    let err = analyze_template(&Fixture::new().build()).expect_err("nothing to analyze");
    assert!(matches!(err, TemplateError::MalformedTemplate(_)), "{err:?}");
}

#[test]
fn unmarked_template_falls_back_and_appends() {
    let template = Fixture::new()
        .row(1, vec![text("A1", "Stock report", 1)])
        .row(2, vec![text("A2", "Code", 2), text("B2", "Name", 2), text("C2", "Amount", 2)])
        .row(3, vec![num("A3", 1.0, 3), text("B3", "Alpha", 3), num("C3", 4.0, 3)])
        .row(4, vec![num("A4", 2.0, 3), text("B4", "Beta", 3), num("C4", 5.0, 3)])
        .build();
    let model = analyze_template(&template).expect("analyze");
    assert_eq!(model.zones().caption.row, 2);
    assert!(!model.zones().caption.marked);
    assert_eq!(template_summary(&model).footer_row_count, 0);

    let out = generate_from_template(&model, &records(3), &GenerateOptions::default())
        .expect("generate");
    let again = analyze_template(&out).expect("analyze output");
    let ws = again.worksheet();
    assert_eq!(ws.last_row_number(), Some(5));
    assert_eq!(ws.row(5).unwrap().display(2), "Item 3");
    assert_eq!(ws.dimension, Some(Range::from_a1("A1:C5").unwrap()));
}

#[test]
fn header_strings_keep_their_indices() {
    let template = invoice().build();
    let original_sst = part_text(&template, "xl/sharedStrings.xml");
    let original_items = &original_sst[original_sst.find("<si>").unwrap()..original_sst.find("</sst>").unwrap()];

    let rows = vec![
        vec![CellValue::Number(1.0), CellValue::from("Bolts"), CellValue::Number(1.0)],
        vec![CellValue::Number(2.0), CellValue::from("ACME Corp"), CellValue::Number(2.0)],
        vec![CellValue::Number(3.0), CellValue::from("Bolts"), CellValue::Number(3.0)],
    ];
    let out = generate(&template, &rows, &GenerateOptions::default());

    let sheet = part_text(&out, "xl/worksheets/sheet1.xml");
    assert!(sheet.contains(r#"<c r="A1" s="1" t="s"><v>0</v></c>"#), "{sheet}");
    assert!(sheet.contains(r#"<c r="A5" s="2" t="s"><v>3</v></c>"#), "{sheet}");
    // Plain entries are reused; the rich "ACME Corp" entry is not.
    assert!(sheet.contains(r#"<c r="B6" s="3" t="s"><v>6</v></c>"#), "{sheet}");
    assert!(sheet.contains(r#"<c r="B7" s="4" t="s"><v>11</v></c>"#), "{sheet}");
    assert!(sheet.contains(r#"<c r="B8" s="3" t="s"><v>6</v></c>"#), "{sheet}");

    let sst = part_text(&out, "xl/sharedStrings.xml");
    assert!(sst.contains(original_items), "{sst}");
    assert!(sst.contains(r#"uniqueCount="12""#), "{sst}");
    // 11 references, minus three dropped data cells, plus three new ones.
    assert!(sst.contains(r#"count="11""#), "{sst}");
    assert!(sst.ends_with("<si><t>ACME Corp</t></si></sst>"), "{sst}");
}

#[test]
fn new_text_is_appended_once() {
    let rows = vec![
        vec![CellValue::Number(1.0), CellValue::from("Gaskets"), CellValue::Empty],
        vec![CellValue::Number(2.0), CellValue::from("Gaskets"), CellValue::Empty],
    ];
    let out = generate(&invoice().build(), &rows, &GenerateOptions::default());
    let sst = part_text(&out, "xl/sharedStrings.xml");
    assert_eq!(sst.matches("Gaskets").count(), 1);
    assert!(sst.contains(r#"uniqueCount="12""#), "{sst}");

    let sheet = part_text(&out, "xl/worksheets/sheet1.xml");
    assert!(sheet.contains(r#"<c r="C6" s="3"/>"#), "{sheet}");
}

#[test]
fn merges_filters_and_scopes_follow_the_rows() {
    let template = invoice()
        .tail(concat!(
            r#"<autoFilter ref="A5:C8"/>"#,
            r#"<mergeCells count="3"><mergeCell ref="A1:C1"/><mergeCell ref="B7:C7"/><mergeCell ref="A9:B9"/></mergeCells>"#,
            r#"<conditionalFormatting sqref="C6:C8"><cfRule type="cellIs" dxfId="0" priority="1" operator="greaterThan"><formula>$C$9/2</formula></cfRule></conditionalFormatting>"#,
            r#"<dataValidations count="1"><dataValidation type="whole" allowBlank="1" sqref="C6:C8 E9"><formula1>0</formula1><formula2>$C$9</formula2></dataValidation></dataValidations>"#,
        ))
        .build();
    let model = analyze_template(&template).expect("analyze");
    assert_eq!(template_summary(&model).merge_count, 3);

    let out = generate_from_template(&model, &records(5), &GenerateOptions::default())
        .expect("generate");
    let sheet = part_text(&out, "xl/worksheets/sheet1.xml");
    assert!(sheet.contains(r#"<autoFilter ref="A5:C10"/>"#), "{sheet}");
    assert!(
        sheet.contains(r#"<mergeCells count="2"><mergeCell ref="A1:C1"/><mergeCell ref="A11:B11"/></mergeCells>"#),
        "{sheet}"
    );
    assert!(sheet.contains(r#"<conditionalFormatting sqref="C6:C10">"#), "{sheet}");
    assert!(sheet.contains("<formula>$C$11/2</formula>"), "{sheet}");
    assert!(sheet.contains(r#"sqref="C6:C10 E11""#), "{sheet}");
    assert!(sheet.contains("<formula2>$C$11</formula2>"), "{sheet}");

    let again = analyze_template(&out).expect("analyze output");
    let data = Range::from_a1("A6:C10").unwrap();
    for merge in &again.zones().merged_ranges {
        assert!(
            !merge.overlaps_rows(data.start.row, data.end.row),
            "{merge} overlaps the data zone"
        );
    }
}

#[test]
fn untouched_parts_are_byte_identical() {
    let template = invoice().notes_sheet("Sheet1!C9*2").build();
    let out = generate(&template, &records(4), &GenerateOptions::default());
    for part in [
        "[Content_Types].xml",
        "_rels/.rels",
        "xl/_rels/workbook.xml.rels",
        "xl/workbook.xml",
        "xl/styles.xml",
        "xl/calcChain.xml",
        "xl/worksheets/sheet2.xml",
    ] {
        assert_eq!(part_bytes(&out, part), part_bytes(&template, part), "{part} changed");
    }
    assert_ne!(
        part_bytes(&out, "xl/worksheets/sheet1.xml"),
        part_bytes(&template, "xl/worksheets/sheet1.xml")
    );
}

#[test]
fn rename_rewrites_sheet_and_defined_names() {
    let template = invoice()
        .defined_names(concat!(
            r#"<definedName name="_xlnm.Print_Area" localSheetId="0">Sheet1!$A$1:$C$11</definedName>"#,
            r#"<definedName name="InvoiceTotal">Sheet1!$C$9</definedName>"#,
        ))
        .build();
    let options = GenerateOptions {
        sheet_name: Some("Q3 Report".to_string()),
        ..GenerateOptions::default()
    };
    let out = generate(&template, &records(5), &options);

    let workbook = part_text(&out, "xl/workbook.xml");
    assert!(workbook.contains(r#"<sheet name="Q3 Report" sheetId="1" r:id="rId1"/>"#), "{workbook}");
    assert!(workbook.contains(">'Q3 Report'!$A$1:$C$13</definedName>"), "{workbook}");
    assert!(workbook.contains(">'Q3 Report'!$C$11</definedName>"), "{workbook}");

    let model = analyze_template(&out).expect("analyze output");
    assert_eq!(model.sheet_name(), "Q3 Report");
}

#[test]
fn defined_names_move_without_a_rename() {
    let template = invoice()
        .defined_names(r#"<definedName name="InvoiceTotal">Sheet1!$C$9</definedName>"#)
        .build();
    let out = generate(&template, &records(2), &GenerateOptions::default());
    let workbook = part_text(&out, "xl/workbook.xml");
    assert!(workbook.contains(">Sheet1!$C$8</definedName>"), "{workbook}");
}

#[test]
fn inline_string_templates_stay_inline() {
    let template = invoice().inline_strings().build();
    let model = analyze_template(&template).expect("analyze");
    assert!(model.shared_strings().is_none());

    let out = generate_from_template(&model, &records(2), &GenerateOptions::default())
        .expect("generate");
    let package = xlsx_template::XlsxPackage::from_bytes(&out).expect("read output");
    assert!(package.part("xl/sharedStrings.xml").is_none());
    let sheet = part_text(&out, "xl/worksheets/sheet1.xml");
    assert!(
        sheet.contains(r#"<c r="B7" s="4" t="inlineStr"><is><t>Item 2</t></is></c>"#),
        "{sheet}"
    );
}

#[test]
fn field_updates_land_outside_the_data_zone() {
    let options = GenerateOptions {
        sheet_name: None,
        field_updates: BTreeMap::from([
            (CellRef::new(2, 2), CellValue::from("2025-01-31")),
            (CellRef::new(2, 3), CellValue::Number(42.0)),
            (CellRef::new(7, 2), CellValue::from("ignored")),
            (CellRef::new(12, 2), CellValue::from("Approved")),
        ]),
    };
    let out = generate(&invoice().build(), &records(5), &options);
    let model = analyze_template(&out).expect("analyze output");
    let ws = model.worksheet();

    let dates = ws.row(2).expect("row 2");
    assert_eq!(dates.display(2), "2025-01-31");
    assert_eq!(dates.cell(2).unwrap().style_id, 1);
    assert_eq!(dates.cell(3).unwrap().value(), CellValue::Number(42.0));
    assert_eq!(ws.row(7).unwrap().display(2), "Item 2");
    // Row 12 sits below the footer, so it moves with it.
    assert_eq!(ws.row(14).expect("moved update").display(2), "Approved");
}

#[test]
fn category_rows_are_reported_but_not_counted() {
    let template = Fixture::new()
        .row(1, vec![text("A1", "#", 2), text("B1", "Item", 2), text("C1", "Qty", 2)])
        .row(2, vec![num("A2", 1.0, 3), text("B2", "Bolts", 3), num("C2", 10.0, 3)])
        .row(3, vec![blank("A3", 7), text("B3", "Hardware", 7)])
        .row(4, vec![num("A4", 2.0, 4), text("B4", "Nuts", 4), num("C4", 20.0, 4)])
        .row(5, vec![text("B5", "Subtotal", 5), formula("C5", "SUBTOTAL(9,C2:C4)", Some(30.0), 6)])
        .build();
    let model = analyze_template(&template).expect("analyze");
    let summary = template_summary(&model);
    assert!(summary.has_categories);
    assert_eq!(summary.data_row_count, 2);
    assert_eq!(
        extract_data_rows(&model),
        vec![
            vec![CellValue::Number(1.0), CellValue::from("Bolts"), CellValue::Number(10.0)],
            vec![CellValue::Number(2.0), CellValue::from("Nuts"), CellValue::Number(20.0)],
        ]
    );

    let out = generate_from_template(&model, &records(3), &GenerateOptions::default())
        .expect("generate");
    let again = analyze_template(&out).expect("analyze output");
    let footer = again.worksheet().row(5).expect("footer");
    assert_eq!(footer.cell(3).unwrap().formula.as_deref(), Some("SUBTOTAL(9,C2:C4)"));
    assert!(!template_summary(&again).has_categories);
}

#[test]
fn translated_caption_row_does_not_end_the_data_zone() {
    let template = Fixture::new()
        .row(5, vec![text("A5", "STT", 2), text("B5", "Tên hàng", 2), text("C5", "Thành tiền", 2)])
        .row(6, vec![text("A6", "No.", 2), text("B6", "Description", 2), text("C6", "Total amount", 2)])
        .row(7, vec![num("A7", 1.0, 3), text("B7", "Bulông", 3), num("C7", 10.0, 3)])
        .row(8, vec![num("A8", 2.0, 4), text("B8", "Đai ốc", 4), num("C8", 20.0, 4)])
        .row(9, vec![text("B9", "Tổng cộng", 5), formula("C9", "SUM(C7:C8)", Some(30.0), 6)])
        .build();
    let model = analyze_template(&template).expect("analyze");
    let summary = template_summary(&model);
    assert_eq!(summary.caption_row, 5);
    assert_eq!((summary.data_start_row, summary.data_end_row), (7, 8));
    assert_eq!(summary.data_row_count, 2);
    assert_eq!(summary.footer_row_count, 1);

    let out = generate_from_template(&model, &records(3), &GenerateOptions::default())
        .expect("generate");
    let again = analyze_template(&out).expect("analyze output");
    let ws = again.worksheet();
    assert_eq!(ws.row(6).unwrap().display(3), "Total amount");
    assert_eq!(ws.row(9).unwrap().display(2), "Item 3");
    let footer = ws.row(10).expect("footer row");
    assert_eq!(footer.display(2), "Tổng cộng");
    assert_eq!(footer.cell(3).unwrap().formula.as_deref(), Some("SUM(C7:C9)"));
}

#[test]
fn trailing_chartsheet_is_counted_and_left_alone() {
    let template = invoice().trailing_chart_sheet().build();
    let model = analyze_template(&template).expect("analyze");
    let summary = template_summary(&model);
    assert_eq!(summary.sheet_name, "Sheet1");
    assert_eq!(summary.sheet_count, 2);

    let out = generate_from_template(&model, &records(5), &GenerateOptions::default())
        .expect("generate");
    assert_eq!(
        part_bytes(&out, "xl/chartsheets/sheet1.xml"),
        part_bytes(&template, "xl/chartsheets/sheet1.xml")
    );
    let workbook = part_text(&out, "xl/workbook.xml");
    assert!(workbook.contains(r#"<sheet name="Chart1" sheetId="3" r:id="rId9"/>"#), "{workbook}");
}

#[test]
fn leading_chartsheet_is_malformed() {
    let template = invoice().leading_chart_sheet().build();
    let err = analyze_template(&template).expect_err("first sheet has no cells");
    assert!(matches!(err, TemplateError::MalformedTemplate(_)), "{err:?}");
}

#[test]
fn unusable_sheet_names_are_rejected() {
    let model = analyze_template(&invoice().build()).expect("analyze");
    for name in ["", "Q1/Q2", "[Draft]", "Totals: June", "An overly long name for one sheet"] {
        let options = GenerateOptions {
            sheet_name: Some(name.to_string()),
            ..GenerateOptions::default()
        };
        let err = generate_from_template(&model, &records(2), &options)
            .expect_err("invalid sheet name");
        assert!(matches!(err, TemplateError::MalformedTemplate(_)), "{name:?}: {err:?}");
    }
}
