mod common;

use std::path::Path;

use common::{TestWorkspace, fund_mapping, mapping_text};
use csv_xml_mapper::{
    config::ConverterConfig,
    context::Direction,
    document::Document,
    job::Converter,
};

fn converter(direction: Direction, mapping: &Path, template: Option<&Path>) -> Converter {
    Converter::new(
        direction,
        ConverterConfig::default(),
        mapping,
        None,
        template.map(Path::to_path_buf),
    )
    .expect("converter")
}

#[test]
fn funds_round_trip_through_xml() {
    let ws = TestWorkspace::new();
    let mapping = ws.write("funds.map.csv", &fund_mapping());
    let input = ws.write(
        "funds.csv",
        "FUND;CCY;DAY;NAV\nAlpha;EUR;31.12.2021;1234,56\nAlpha;EUR;03.01.2022;1240,15\nBeta;USD;31.12.2021;99,5\n",
    );
    let template = ws.write("template.csv", "FUND;CCY;DAY;NAV\nX;EUR;01.01.2020;1,5\n");
    let xml = ws.path().join("funds.xml");

    let summary = converter(Direction::CsvToXml, &mapping, None)
        .convert(&input, &xml, None)
        .expect("csv2xml");
    assert_eq!(summary.records, 3);
    assert_eq!(summary.errors, 0);
    assert!(summary.error_file.is_none());

    let document = Document::parse(&ws.read("funds.xml")).expect("parse output");
    assert_eq!(document.root_name(), "FundsXML");
    assert_eq!(document.count(document.root(), "Funds/Fund"), 2);
    assert_eq!(
        document.read_value(document.root(), "Funds/Fund[1]/Navs/Nav[2]", Some("date"), None),
        Some("2022-01-03".to_string())
    );
    assert_eq!(
        document.read_value(document.root(), "Funds/Fund[1]/Navs/Nav[1]", None, None),
        Some("1234.56".to_string())
    );
    assert_eq!(
        document.read_value(document.root(), "Funds/Fund[2]", Some("ccy"), None),
        Some("USD".to_string())
    );

    let back = ws.path().join("back.csv");
    let summary = converter(Direction::XmlToCsv, &mapping, Some(&template))
        .convert(&xml, &back, None)
        .expect("xml2csv");
    assert_eq!(summary.records, 3);
    assert_eq!(summary.errors, 0);
    assert_eq!(
        ws.read("back.csv"),
        "FUND;CCY;DAY;NAV\nAlpha;EUR;31.12.2021;1234,56\nAlpha;EUR;03.01.2022;1240,15\nBeta;USD;31.12.2021;99,5\n"
    );
}

#[test]
fn data_errors_are_written_next_to_the_output() {
    let ws = TestWorkspace::new();
    let mapping = ws.write("funds.map.csv", &fund_mapping());
    let input = ws.write(
        "funds.csv",
        "FUND;CCY;DAY;NAV\nAlpha;EUR;32.13.2021;1,5\nBeta;GBP;33.13.2021;1,6\n;EUR;01.01.2022;2\n",
    );
    let xml = ws.path().join("out").join("funds.xml");
    let summary = converter(Direction::CsvToXml, &mapping, None)
        .convert(&input, &xml, None)
        .expect("csv2xml");

    assert_eq!(summary.errors, 3);
    let error_file = summary.error_file.expect("error file");
    assert_eq!(error_file, ws.path().join("out").join("funds-errors.csv"));
    let errors = std::fs::read_to_string(&error_file).expect("read errors");
    let lines = errors.lines().collect::<Vec<_>>();
    assert_eq!(lines[0], "FILE;LINE;COLUMN_NR;COLUMN_NAME;XPATH;VALUE;ERROR");
    assert_eq!(lines.len(), 4);
    assert!(lines.iter().any(|l| l.starts_with("funds.csv;2;3;DAY;") && l.contains("out of range")));
    assert!(lines.iter().any(|l| l.starts_with("funds.csv;3;2;CCY;") && l.contains("not found in list")));
    assert!(lines.iter().any(|l| l.starts_with("funds.csv;4;1;FUND;") && l.ends_with("Mandatory field empty")));

    let document = Document::parse(&std::fs::read_to_string(&xml).expect("xml")).expect("parse");
    assert_eq!(
        document.read_value(document.root(), "Funds/Fund[1]/Navs/Nav[1]", Some("date"), None),
        Some("2021-12-31".to_string())
    );
}

#[test]
fn linked_rows_nest_under_their_primary_row() {
    let ws = TestWorkspace::new();
    let mapping = ws.write(
        "funds.map.csv",
        &mapping_text(&[
            "ADDFILE;*-positions.csv;FUND;;;;;MAP;Funds/Fund;;;;;",
            "CHANGE;FUND;;;Text;;;LOOP;Funds/Fund;;;;;",
            "MAP;FUND;;;Text;;;MAP;Funds/Fund/Name;;;;;",
            "CHANGE;:1:POS;;;Text;;;LOOP;Funds/Fund/Positions/Position;;;;;",
            "MAP;:1:POS;;;Text;;;MAP;Funds/Fund/Positions/Position/Id;;;;;",
            "MAP;:1:QTY;;;Integer;;;MAP;Funds/Fund/Positions/Position/Quantity;;;;;",
        ]),
    );
    let input = ws.write("day1.csv", "FUND\nA\nB\n");
    ws.write("day1-positions.csv", "FUND;POS;QTY\nA;p1;10\nA;p2;20\nB;p3;5\n");
    let xml = ws.path().join("day1.xml");
    let summary = converter(Direction::CsvToXml, &mapping, None)
        .convert(&input, &xml, None)
        .expect("csv2xml");
    assert_eq!(summary.records, 2);

    let document = Document::parse(&ws.read("day1.xml")).expect("parse");
    let root = document.root();
    assert_eq!(document.count(root, "Funds/Fund[1]/Positions/Position"), 2);
    assert_eq!(document.count(root, "Funds/Fund[2]/Positions/Position"), 1);
    assert_eq!(
        document.read_value(root, "Funds/Fund[1]/Positions/Position[2]/Quantity", None, None),
        Some("20".to_string())
    );
    assert_eq!(
        document.read_value(root, "Funds/Fund[2]/Positions/Position[1]/Id", None, None),
        Some("p3".to_string())
    );
}

#[test]
fn counters_feed_the_unique_document_id() {
    let ws = TestWorkspace::new();
    let mapping = ws.write(
        "docs.map.csv",
        &mapping_text(&[
            "VAR;'DOC-' COUNTER(docid);;;Text;;;MAP;ControlData/UniqueDocumentID;;;;;",
            "CHANGE;ID;;;Text;;;LOOP;Items/Item;;;;;",
            "MAP;ID;;;Text;;;MAP;Items/Item/Id;;;;;",
        ]),
    );
    ws.write("docid.cnt", "EVER,0,NUM,4,1\n");
    let first = ws.write("a.csv", "ID\n1\n2\n");
    let second = ws.write("b.csv", "ID\n3\n");
    let mut converter = converter(Direction::CsvToXml, &mapping, None);

    let summary = converter.convert(&first, &ws.path().join("a.xml"), None).expect("first");
    assert_eq!(summary.unique_document_id.as_deref(), Some("DOC-0001"));
    let summary = converter.convert(&second, &ws.path().join("b.xml"), None).expect("second");
    assert_eq!(summary.unique_document_id.as_deref(), Some("DOC-0002"));
    assert_eq!(ws.read("docid.cnt"), "EVER,0,NUM,4,0001,0003\n");
    assert!(ws.read("a.xml").contains("<UniqueDocumentID>DOC-0001</UniqueDocumentID>"));
}

#[test]
fn extraction_without_template_uses_mapped_columns() {
    let ws = TestWorkspace::new();
    let mapping = ws.write("funds.map.csv", &fund_mapping());
    let xml = ws.write(
        "funds.xml",
        "<?xml version=\"1.0\"?>\n<FundsXML><Funds>\
         <Fund ccy=\"CHF\"><Name>Gamma</Name><Navs><Nav date=\"2023-06-30\">12.5</Nav></Navs></Fund>\
         </Funds></FundsXML>",
    );
    let out = ws.path().join("funds.csv");
    let summary = converter(Direction::XmlToCsv, &mapping, None)
        .convert(&xml, &out, None)
        .expect("xml2csv");
    assert_eq!(summary.records, 1);
    assert_eq!(ws.read("funds.csv"), "FUND;CCY;DAY;NAV\nGamma;CHF;30.06.2023;12.5\n");
}

#[test]
fn revisited_unique_group_appends_nested_rows() {
    let ws = TestWorkspace::new();
    let mapping = ws.write(
        "assets.map.csv",
        &mapping_text(&[
            "NOP;;;;;;;ROOT;R;;;;;",
            "UNIQUE;ASSET;;;Text;;;LOOP;Assets/Asset;;;;;",
            "MAP;ASSET;;;Text;;;MAP;Assets/Asset/Id;;;;;",
            "CHANGE;PRICE;;;Text;;;LOOP;Assets/Asset/Prices/Price;;;;;",
            "MAP;PRICE;;;Text;;;MAP;Assets/Asset/Prices/Price/V;;;;;",
        ]),
    );
    let input = ws.write("assets.csv", "ASSET;PRICE\nx;p1\ny;p2\nx;p3\n");
    let xml = ws.path().join("assets.xml");
    let summary = converter(Direction::CsvToXml, &mapping, None)
        .convert(&input, &xml, None)
        .expect("csv2xml");
    assert_eq!(summary.records, 3);

    let document = Document::parse(&ws.read("assets.xml")).expect("parse output");
    let value = |path: &str| document.read_value(document.root(), path, None, None);
    assert_eq!(document.count(document.root(), "Assets/Asset"), 2);
    assert_eq!(document.count(document.root(), "Assets/Asset[1]/Prices/Price"), 2);
    assert_eq!(value("Assets/Asset[1]/Id"), Some("x".to_string()));
    assert_eq!(value("Assets/Asset[1]/Prices/Price[1]/V"), Some("p1".to_string()));
    assert_eq!(value("Assets/Asset[1]/Prices/Price[2]/V"), Some("p3".to_string()));
    assert_eq!(value("Assets/Asset[2]/Prices/Price[1]/V"), Some("p2".to_string()));

    let back = ws.path().join("back.csv");
    let summary = converter(Direction::XmlToCsv, &mapping, None)
        .convert(&xml, &back, None)
        .expect("xml2csv");
    assert_eq!(summary.records, 3);
    assert_eq!(ws.read("back.csv"), "ASSET;PRICE\nx;p1\nx;p3\ny;p2\n");
}
