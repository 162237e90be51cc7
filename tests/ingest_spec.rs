use chrono::NaiveDate;
use rust_xlsxwriter::Workbook;
use speculate2::speculate;
use tco_calculator::db::Database;
use tco_calculator::error::TcoError;
use tco_calculator::ingest::{import_ado_export, parse_ado_export, IngestOptions};

fn options() -> IngestOptions {
    IngestOptions::default()
}

fn utf16le(text: &str) -> Vec<u8> {
    text.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

fn utf16le_with_bom(text: &str) -> Vec<u8> {
    let mut bytes = vec![0xFF, 0xFE];
    bytes.extend(utf16le(text));
    bytes
}

fn workbook(sheets: Vec<(&str, Vec<Vec<&str>>)>) -> Vec<u8> {
    let mut workbook = Workbook::new();
    for (name, rows) in sheets {
        let worksheet = workbook.add_worksheet();
        worksheet.set_name(name).expect("sheet name");
        for (r, row) in rows.iter().enumerate() {
            for (c, cell) in row.iter().enumerate() {
                match cell.parse::<f64>() {
                    Ok(number) => worksheet.write_number(r as u32, c as u16, number),
                    Err(_) => worksheet.write_string(r as u32, c as u16, *cell),
                }
                .expect("write cell");
            }
        }
    }
    workbook.save_to_buffer().expect("save workbook")
}

speculate! {
    describe "parse_ado_export" {
        it "reads a comma separated export with ADO field names" {
            let csv = "System.Id,System.Title,System.State,System.Team,Custom_ApplicationName,Effort,System.IterationPath,Changed Date\n\
                       42,Checkout,Active,Team X,Billing,5,PI 2025.I2,2025-05-02 10:00:00\n";

            let parsed = parse_ado_export(csv.as_bytes(), &options()).expect("parse");

            assert_eq!(parsed.diagnostics.encoding, "utf-8");
            assert_eq!(parsed.diagnostics.separator, ",");
            assert_eq!(parsed.features.len(), 1);
            let f = &parsed.features[0];
            assert_eq!(f.feature_id, "42");
            assert_eq!(f.title.as_deref(), Some("Checkout"));
            assert_eq!(f.state.as_deref(), Some("Active"));
            assert_eq!(f.team_raw.as_deref(), Some("Team X"));
            assert_eq!(f.app_name_raw.as_deref(), Some("Billing"));
            assert_eq!(f.effort_points, Some(5.0));
            assert_eq!(f.iteration_path.as_deref(), Some("PI 2025.I2"));
            assert_eq!(
                f.changed_at.map(|ts| ts.date()),
                NaiveDate::from_ymd_opt(2025, 5, 2)
            );
        }

        it "falls back to semicolons and comma decimals" {
            let csv = "ID;Team;Story Points\n1;X;2,5\n2;X;n/a\n";
            let parsed = parse_ado_export(
                csv.as_bytes(),
                &IngestOptions { comma_decimal: true, ..options() },
            ).expect("parse");

            assert_eq!(parsed.diagnostics.separator, ";");
            assert_eq!(parsed.diagnostics.attempts.len(), 1);
            assert_eq!(parsed.features[0].effort_points, Some(2.5));
            assert_eq!(parsed.features[1].effort_points, None);
        }

        it "reads tab separated UTF-16 exports" {
            let bytes = utf16le_with_bom("ID\tTitle\tTeam\n7\tCafé\tX\n");
            let parsed = parse_ado_export(&bytes, &options()).expect("parse");

            assert_eq!(parsed.diagnostics.encoding, "utf-16le");
            assert_eq!(parsed.diagnostics.separator, "tab");
            assert_eq!(parsed.features[0].title.as_deref(), Some("Café"));
        }

        it "strips a UTF-8 byte order mark from the first header" {
            let mut bytes = vec![0xEF, 0xBB, 0xBF];
            bytes.extend_from_slice(b"ID,Title\n1,Login\n");
            let parsed = parse_ado_export(&bytes, &options()).expect("parse");

            assert_eq!(parsed.diagnostics.encoding, "utf-8-sig");
            assert_eq!(parsed.features[0].feature_id, "1");
        }

        it "decodes Windows-1252 when the bytes are not UTF-8" {
            let parsed = parse_ado_export(b"ID,Team\n1,\xc9quipe\n", &options()).expect("parse");

            assert_eq!(parsed.diagnostics.encoding, "cp1252");
            assert_eq!(parsed.features[0].team_raw.as_deref(), Some("\u{c9}quipe"));
        }

        it "keeps smart quotes and the euro sign from Windows exports" {
            let csv = b"ID,Title\n1,Customer\x92s portal \x80 budget\n";
            let parsed = parse_ado_export(csv, &options()).expect("parse");

            assert_eq!(
                parsed.features[0].title.as_deref(),
                Some("Customer\u{2019}s portal \u{20ac} budget")
            );
        }

        it "reads UTF-16 exports without a byte order mark" {
            let bytes = utf16le("ID\tTitle\n7\tSearch\n");
            let parsed = parse_ado_export(&bytes, &options()).expect("parse");

            assert_eq!(parsed.diagnostics.encoding, "utf-16le");
            assert_eq!(parsed.features[0].title.as_deref(), Some("Search"));
        }

        it "finds the header below preamble rows" {
            let csv = "Feature export,\ngenerated today,\nID,Title,Team\n9,Search,X\n";
            let parsed = parse_ado_export(csv.as_bytes(), &options()).expect("parse");

            assert_eq!(parsed.diagnostics.header_row, 2);
            assert_eq!(parsed.features.len(), 1);
            assert_eq!(parsed.features[0].title.as_deref(), Some("Search"));
        }

        it "drops rows without an id and reports them" {
            let csv = "ID,Title\n1,Kept\n ,Dropped\n";
            let parsed = parse_ado_export(csv.as_bytes(), &options()).expect("parse");

            assert_eq!(parsed.features.len(), 1);
            assert_eq!(parsed.diagnostics.rows_read, 2);
            assert_eq!(parsed.diagnostics.rows_dropped, 1);
        }

        it "takes an explicit year column" {
            let csv = "ID,ADO Year,Iteration\n1,2024.0,Sprint 3\n";
            let parsed = parse_ado_export(csv.as_bytes(), &options()).expect("parse");

            assert_eq!(parsed.features[0].ado_year, Some(2024));
            assert_eq!(
                parsed.diagnostics.columns.get("Year").map(String::as_str),
                Some("ADO Year")
            );
        }

        it "discards negative effort and reports the feature" {
            let csv = "ID,Effort\n1,5\n2,-5\n3,1\n";
            let parsed = parse_ado_export(csv.as_bytes(), &options()).expect("parse");

            assert_eq!(parsed.features[1].effort_points, None);
            assert_eq!(parsed.features[2].effort_points, Some(1.0));
            assert_eq!(parsed.diagnostics.negative_effort, vec!["2".to_string()]);
        }

        it "lists every attempt when no parse is wide enough" {
            let err = parse_ado_export(b"just one column\nvalue\n", &options()).unwrap_err();

            match err.downcast_ref::<TcoError>() {
                Some(TcoError::Parse { attempts, .. }) => {
                    assert_eq!(attempts.len(), 6);
                    assert!(attempts[0].starts_with("utf-8/,"));
                    assert!(attempts[5].starts_with("cp1252/tab"));
                }
                other => panic!("expected parse error, got {:?}", other),
            }
        }

        it "requires an id column" {
            let err = parse_ado_export(b"Title,Team\nLogin,X\n", &options()).unwrap_err();

            assert!(matches!(err.downcast_ref::<TcoError>(), Some(TcoError::Validation(_))));
        }
    }

    describe "workbooks" {
        it "reads the first sheet of an xlsx export" {
            let bytes = workbook(vec![(
                "Features",
                vec![
                    vec!["Feature export"],
                    vec!["ID", "Title", "Team", "Effort", "Iteration Path"],
                    vec!["42", "Checkout", "Team X", "2.5", "PI 2025.I2"],
                ],
            )]);

            let parsed = parse_ado_export(&bytes, &IngestOptions {
                file_name: Some("features.xlsx".to_string()),
                ..options()
            }).expect("parse");

            assert_eq!(parsed.diagnostics.encoding, "workbook");
            assert_eq!(parsed.diagnostics.sheet.as_deref(), Some("Features"));
            assert_eq!(parsed.diagnostics.header_row, 1);
            let f = &parsed.features[0];
            assert_eq!(f.feature_id, "42");
            assert_eq!(f.team_raw.as_deref(), Some("Team X"));
            assert_eq!(f.effort_points, Some(2.5));
        }

        it "recognises a workbook without a file name" {
            let bytes = workbook(vec![("Sheet1", vec![vec!["ID", "Title"], vec!["7", "Login"]])]);
            let parsed = parse_ado_export(&bytes, &options()).expect("parse");

            assert_eq!(parsed.diagnostics.encoding, "workbook");
            assert_eq!(parsed.features[0].feature_id, "7");
        }

        it "reads a named sheet" {
            let bytes = workbook(vec![
                ("Notes", vec![vec!["exported by the PI board"]]),
                ("Data", vec![vec!["ID", "Title"], vec!["9", "Search"]]),
            ]);

            let parsed = parse_ado_export(&bytes, &IngestOptions {
                sheet: Some("Data".to_string()),
                ..options()
            }).expect("parse");

            assert_eq!(parsed.features[0].title.as_deref(), Some("Search"));
        }

        it "fails on an unknown sheet" {
            let bytes = workbook(vec![("Sheet1", vec![vec!["ID", "Title"], vec!["7", "Login"]])]);
            let err = parse_ado_export(&bytes, &IngestOptions {
                sheet: Some("Missing".to_string()),
                ..options()
            }).unwrap_err();

            assert!(matches!(err.downcast_ref::<TcoError>(), Some(TcoError::Parse { .. })));
        }

        it "fails on a corrupt container" {
            let err = parse_ado_export(b"PK\x03\x04not really a zip", &options()).unwrap_err();

            match err.downcast_ref::<TcoError>() {
                Some(TcoError::Parse { attempts, .. }) => {
                    assert_eq!(attempts.len(), 1);
                    assert!(attempts[0].starts_with("workbook"));
                }
                other => panic!("expected parse error, got {:?}", other),
            }
        }

        it "falls back to text for a CSV saved with a workbook extension" {
            let parsed = parse_ado_export(b"ID,Title\n1,x\n", &IngestOptions {
                file_name: Some("features.xls".to_string()),
                ..options()
            }).expect("parse");

            assert_eq!(parsed.diagnostics.encoding, "utf-8");
            assert!(parsed.diagnostics.attempts[0].starts_with("workbook"));
        }
    }

    describe "import_ado_export" {
        before {
            let db = Database::open_memory().expect("Failed to create in-memory database");
            db.migrate().expect("Failed to run migrations");
        }

        it "upserts parsed features, last import wins" {
            let first = import_ado_export(&db, b"ID,Effort\n1,3\n2,5\n", &options()).expect("import");
            assert_eq!(first.summary.inserted, 2);

            let second = import_ado_export(&db, b"ID,Effort\n2,8\n", &options()).expect("import");
            assert_eq!(second.summary.updated, 1);

            let stored = db.get_ado_feature("2").expect("query").expect("exists");
            assert_eq!(stored.effort_points, Some(8.0));
        }

        it "stores features with negative effort as unestimated" {
            let report = import_ado_export(&db, b"ID,Effort\n1,-3\n", &options()).expect("import");
            assert_eq!(report.diagnostics.negative_effort, vec!["1".to_string()]);

            let stored = db.get_ado_feature("1").expect("query").expect("exists");
            assert_eq!(stored.effort_points, None);
        }
    }
}
