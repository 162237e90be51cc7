//! ADO feature export ingestion.
//!
//! Exports arrive as raw bytes from an upload or a file on disk, either as a
//! spreadsheet workbook or as delimited text. Workbooks are read with
//! `calamine`; text is tried in each plausible encoding and field separator
//! until a parse at least two columns wide turns up. The header row is then
//! located, the export's column names are mapped onto canonical fields and
//! the rows become [`FeatureRecord`]s ready for
//! [`Database::upsert_ado_features`].

mod columns;

pub use columns::{detect_header_row, normalize_header, Column, ColumnMap, HEADER_SCAN_ROWS};

use std::collections::BTreeMap;
use std::io::Cursor;

use anyhow::Result;
use calamine::{open_workbook_auto_from_rs, Data, Reader};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use encoding_rs::{Encoding, UTF_16BE, UTF_16LE, UTF_8, WINDOWS_1252};
use serde::{Deserialize, Serialize};
use tco_core::FeatureRecord;

use crate::db::Database;
use crate::error::TcoError;
use crate::models::UpsertSummary;

const SEPARATORS: [(u8, &str); 3] = [(b',', ","), (b';', ";"), (b'\t', "tab")];

const WORKBOOK_EXTENSIONS: [&str; 4] = [".xlsx", ".xlsm", ".xlsb", ".xls"];

const WORKBOOK_ENCODING: &str = "workbook";

const DATETIME_FORMATS: [&str; 7] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %I:%M %p",
    "%m/%d/%Y %H:%M",
    "%d.%m.%Y %H:%M",
];

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%m/%d/%Y", "%d.%m.%Y"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestOptions {
    /// Original file name, used to recognise workbook uploads.
    pub file_name: Option<String>,
    /// Worksheet to read from a workbook. Defaults to the first sheet.
    pub sheet: Option<String>,
    /// Effort values use `,` as the decimal separator.
    #[serde(default)]
    pub comma_decimal: bool,
}

/// How an export was read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestDiagnostics {
    /// Text encoding, or `workbook` for spreadsheet files.
    pub encoding: String,
    /// Field separator; empty for workbooks.
    pub separator: String,
    /// Worksheet the rows came from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sheet: Option<String>,
    /// Zero-based row holding the column names.
    pub header_row: usize,
    /// Canonical column → header found in the export.
    pub columns: BTreeMap<String, String>,
    pub missing_columns: Vec<String>,
    pub rows_read: usize,
    /// Rows without a work item id.
    pub rows_dropped: usize,
    /// Features whose negative effort was discarded.
    pub negative_effort: Vec<String>,
    /// Attempts rejected before the accepted one.
    pub attempts: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ParsedUpload {
    pub features: Vec<FeatureRecord>,
    pub diagnostics: IngestDiagnostics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportReport {
    pub summary: UpsertSummary,
    pub diagnostics: IngestDiagnostics,
}

/// Parse an export and upsert its features in one step.
pub fn import_ado_export(
    db: &Database,
    bytes: &[u8],
    options: &IngestOptions,
) -> Result<ImportReport> {
    let parsed = parse_ado_export(bytes, options)?;
    let summary = db.upsert_ado_features(&parsed.features)?;

    tracing::info!(
        file = options.file_name.as_deref().unwrap_or("-"),
        encoding = %parsed.diagnostics.encoding,
        separator = %parsed.diagnostics.separator,
        rows = parsed.diagnostics.rows_read,
        dropped = parsed.diagnostics.rows_dropped,
        inserted = summary.inserted,
        updated = summary.updated,
        "Imported ADO export"
    );

    Ok(ImportReport {
        summary,
        diagnostics: parsed.diagnostics,
    })
}

/// Read ADO features from workbook or delimited text bytes.
pub fn parse_ado_export(bytes: &[u8], options: &IngestOptions) -> Result<ParsedUpload> {
    if bytes.is_empty() {
        return Err(TcoError::validation("Uploaded file is empty").into());
    }

    let mut attempts = Vec::new();
    let container = has_workbook_magic(bytes);
    if container || has_workbook_extension(options.file_name.as_deref()) {
        match read_workbook(bytes, options.sheet.as_deref()) {
            Ok((sheet, rows)) => match header_of(&rows) {
                Ok(header_row) => {
                    let diagnostics = IngestDiagnostics {
                        encoding: WORKBOOK_ENCODING.to_string(),
                        sheet: Some(sheet),
                        header_row,
                        attempts,
                        ..Default::default()
                    };
                    return build_features(rows, diagnostics, options);
                }
                Err(width) => {
                    attempts.push(format!("{}/{}: {} column(s)", WORKBOOK_ENCODING, sheet, width))
                }
            },
            Err(reason) => attempts.push(format!("{}: {}", WORKBOOK_ENCODING, reason)),
        }
        // A zip or OLE2 container is never delimited text.
        if container {
            return Err(TcoError::Parse {
                message: "Could not read the workbook".to_string(),
                attempts,
            }
            .into());
        }
    }

    for (label, encoding, skip) in text_encodings(bytes) {
        let text = match decode(encoding, &bytes[skip..]) {
            Some(text) => text,
            None => {
                attempts.push(format!("{}: not valid {}", label, encoding.name()));
                continue;
            }
        };

        for (separator, sep_label) in SEPARATORS {
            match read_rows(&text, separator) {
                Ok(rows) => match header_of(&rows) {
                    Ok(header_row) => {
                        let diagnostics = IngestDiagnostics {
                            encoding: label.to_string(),
                            separator: sep_label.to_string(),
                            header_row,
                            attempts,
                            ..Default::default()
                        };
                        return build_features(rows, diagnostics, options);
                    }
                    Err(width) => {
                        attempts.push(format!("{}/{}: {} column(s)", label, sep_label, width))
                    }
                },
                Err(err) => attempts.push(format!("{}/{}: {}", label, sep_label, err)),
            }
        }
    }

    Err(TcoError::Parse {
        message: "Could not parse the ADO export".to_string(),
        attempts,
    }
    .into())
}

/// Header row of a parse, or the header width when it is too narrow to be an export.
///
/// Width is judged on the header row: a wrong separator can still split data
/// rows that contain it, e.g. comma decimals.
fn header_of(rows: &[Vec<String>]) -> std::result::Result<usize, usize> {
    let header_row = detect_header_row(rows).unwrap_or(0);
    let width = rows.get(header_row).map(Vec::len).unwrap_or(0);
    if width >= 2 {
        Ok(header_row)
    } else {
        Err(width)
    }
}

fn has_workbook_extension(file_name: Option<&str>) -> bool {
    file_name
        .map(str::to_lowercase)
        .is_some_and(|name| WORKBOOK_EXTENSIONS.iter().any(|ext| name.ends_with(ext)))
}

/// zip (xlsx/xlsm/xlsb/ods) and OLE2 (xls) containers
fn has_workbook_magic(bytes: &[u8]) -> bool {
    bytes.starts_with(b"PK\x03\x04") || bytes.starts_with(&[0xD0, 0xCF, 0x11, 0xE0])
}

/// Encodings worth trying for these bytes, in order, with the length of any BOM to skip.
fn text_encodings(bytes: &[u8]) -> Vec<(&'static str, &'static Encoding, usize)> {
    match bytes {
        [0xEF, 0xBB, 0xBF, ..] => vec![("utf-8-sig", UTF_8, 3)],
        [0xFF, 0xFE, ..] => vec![("utf-16le", UTF_16LE, 2)],
        [0xFE, 0xFF, ..] => vec![("utf-16be", UTF_16BE, 2)],
        // UTF-16 without a BOM: ASCII text leaves every other byte NUL
        [_, 0, ..] => vec![("utf-16le", UTF_16LE, 0), ("utf-16be", UTF_16BE, 0)],
        [0, ..] => vec![("utf-16be", UTF_16BE, 0), ("utf-16le", UTF_16LE, 0)],
        _ => vec![("utf-8", UTF_8, 0), ("cp1252", WINDOWS_1252, 0)],
    }
}

/// Decode strictly, except for single-byte code pages which map every byte.
fn decode(encoding: &'static Encoding, bytes: &[u8]) -> Option<String> {
    if encoding.is_single_byte() {
        let (text, _) = encoding.decode_without_bom_handling(bytes);
        return Some(text.into_owned());
    }
    encoding
        .decode_without_bom_handling_and_without_replacement(bytes)
        .map(|text| text.into_owned())
}

fn read_rows(text: &str, separator: u8) -> std::result::Result<Vec<Vec<String>>, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(separator)
        .from_reader(text.as_bytes());

    reader
        .records()
        .map(|record| record.map(|r| r.iter().map(str::to_string).collect()))
        .collect()
}

/// Rows of `sheet` (or the first worksheet) as text cells.
fn read_workbook(
    bytes: &[u8],
    sheet: Option<&str>,
) -> std::result::Result<(String, Vec<Vec<String>>), String> {
    let mut workbook =
        open_workbook_auto_from_rs(Cursor::new(bytes.to_vec())).map_err(|e| e.to_string())?;

    let name = match sheet {
        Some(name) => name.to_string(),
        None => workbook
            .sheet_names()
            .first()
            .cloned()
            .ok_or_else(|| "workbook has no sheets".to_string())?,
    };
    let range = workbook
        .worksheet_range(&name)
        .map_err(|e| format!("sheet '{}': {}", name, e))?;

    let rows = range
        .rows()
        .map(|row| row.iter().map(cell_text).collect())
        .collect();
    Ok((name, rows))
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty | Data::Error(_) => String::new(),
        Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        // Work item ids and years are stored as floats
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => (*f as i64).to_string(),
        Data::Float(f) => f.to_string(),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => dt
            .as_datetime()
            .map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| dt.as_f64().to_string()),
    }
}

fn build_features(
    rows: Vec<Vec<String>>,
    mut diagnostics: IngestDiagnostics,
    options: &IngestOptions,
) -> Result<ParsedUpload> {
    let header_row = diagnostics.header_row;
    let columns = ColumnMap::from_headers(&rows[header_row]);
    let id_index = columns.index(Column::Id).ok_or_else(|| {
        TcoError::validation(format!(
            "No work item id column found (expected one of: {})",
            Column::Id.aliases().join(", ")
        ))
    })?;

    diagnostics.columns = columns.describe();
    diagnostics.missing_columns = columns.missing();

    let mut features = Vec::new();
    for row in rows.iter().skip(header_row + 1) {
        diagnostics.rows_read += 1;

        let text = |column: Column| -> Option<String> {
            columns
                .index(column)
                .and_then(|i| row.get(i))
                .map(|cell| cell.trim())
                .filter(|cell| !cell.is_empty())
                .map(str::to_string)
        };

        let Some(feature_id) = row.get(id_index).map(|c| c.trim()).filter(|c| !c.is_empty()) else {
            diagnostics.rows_dropped += 1;
            continue;
        };

        let mut effort_points =
            text(Column::Effort).and_then(|v| parse_number(&v, options.comma_decimal));
        if effort_points.is_some_and(|e| e < 0.0) {
            diagnostics.negative_effort.push(feature_id.to_string());
            effort_points = None;
        }

        features.push(FeatureRecord {
            feature_id: feature_id.to_string(),
            title: text(Column::Title),
            state: text(Column::State),
            team_raw: text(Column::Team),
            app_name_raw: text(Column::Application),
            effort_points,
            iteration_path: text(Column::Iteration),
            created_at: text(Column::CreatedDate).and_then(|v| parse_timestamp(&v)),
            changed_at: text(Column::ChangedDate).and_then(|v| parse_timestamp(&v)),
            ado_year: text(Column::Year).and_then(|v| parse_year_cell(&v)),
        });
    }

    if diagnostics.rows_dropped > 0 {
        tracing::warn!(
            dropped = diagnostics.rows_dropped,
            "Dropped export rows without a work item id"
        );
    }
    if !diagnostics.negative_effort.is_empty() {
        tracing::warn!(
            features = ?diagnostics.negative_effort,
            "Discarded negative effort values"
        );
    }

    Ok(ParsedUpload {
        features,
        diagnostics,
    })
}

/// Numeric cell, optionally with `,` as decimal separator. Anything unparseable is `None`.
pub fn parse_number(raw: &str, comma_decimal: bool) -> Option<f64> {
    let raw = raw.trim();
    let value: f64 = if comma_decimal {
        raw.replace(',', ".").parse().ok()?
    } else {
        raw.parse().ok()?
    };
    value.is_finite().then_some(value)
}

fn parse_year_cell(raw: &str) -> Option<i32> {
    let value = parse_number(raw, true)?;
    (value.fract() == 0.0 && (1900.0..=9999.0).contains(&value)).then_some(value as i32)
}

/// Timestamp in any of the formats ADO and spreadsheet tools export.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.naive_utc());
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comma_decimal_only_when_asked() {
        assert_eq!(parse_number("1,5", true), Some(1.5));
        assert_eq!(parse_number("1,5", false), None);
        assert_eq!(parse_number(" 8 ", false), Some(8.0));
        assert_eq!(parse_number("n/a", true), None);
    }

    #[test]
    fn year_cell_accepts_float_spelling() {
        assert_eq!(parse_year_cell("2025"), Some(2025));
        assert_eq!(parse_year_cell("2025.0"), Some(2025));
        assert_eq!(parse_year_cell("2025.5"), None);
        assert_eq!(parse_year_cell("25"), None);
    }

    #[test]
    fn timestamps_in_common_export_formats() {
        let expected = NaiveDate::from_ymd_opt(2025, 3, 4)
            .unwrap()
            .and_hms_opt(13, 5, 0)
            .unwrap();
        assert_eq!(parse_timestamp("2025-03-04T13:05:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2025-03-04 13:05:00"), Some(expected));
        assert_eq!(parse_timestamp("3/4/2025 1:05:00 PM"), Some(expected));
        assert_eq!(
            parse_timestamp("2025-03-04").map(|ts| ts.date()),
            NaiveDate::from_ymd_opt(2025, 3, 4)
        );
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn workbook_detection() {
        assert!(has_workbook_extension(Some("Features.XLSX")));
        assert!(!has_workbook_extension(Some("features.csv")));
        assert!(!has_workbook_extension(None));
        assert!(has_workbook_magic(b"PK\x03\x04rest"));
        assert!(has_workbook_magic(&[0xD0, 0xCF, 0x11, 0xE0, 0xA1]));
        assert!(!has_workbook_magic(b"ID\x00Title"));
    }

    #[test]
    fn utf16_without_bom_is_text() {
        let names: Vec<&str> = text_encodings(b"I\x00D\x00").iter().map(|c| c.0).collect();
        assert_eq!(names, vec!["utf-16le", "utf-16be"]);
        let names: Vec<&str> = text_encodings(b"\x00I\x00D").iter().map(|c| c.0).collect();
        assert_eq!(names, vec!["utf-16be", "utf-16le"]);
    }

    #[test]
    fn cp1252_fallback_maps_windows_punctuation() {
        assert_eq!(decode(UTF_8, b"Caf\xe9"), None);
        assert_eq!(
            decode(WINDOWS_1252, b"Caf\xe9 \x92 \x80").as_deref(),
            Some("Caf\u{e9} \u{2019} \u{20ac}")
        );
    }

    #[test]
    fn whole_float_cells_read_as_integers() {
        assert_eq!(cell_text(&Data::Float(42.0)), "42");
        assert_eq!(cell_text(&Data::Float(2.5)), "2.5");
        assert_eq!(cell_text(&Data::Empty), "");
    }
}
