//! Tabular input
//!
//! Reads an import file into [`ImportRow`]s. Spreadsheets (xlsx, xlsm, xlsb,
//! xls, ods) go through calamine and use the first sheet, with the first row
//! as headers. Delimited text (csv, tsv) goes through the csv crate, also
//! with a header row. JSON files must hold an array of objects.

use crate::error::{AppError, Result};
use crate::services::import::{CellValue, ImportRow};
use calamine::{open_workbook_auto, Data, Reader};
use serde_json::Value;
use std::path::Path;

const SPREADSHEET_EXTENSIONS: &[&str] = &["xlsx", "xlsm", "xlsb", "xls", "ods"];

/// Read every data row of `path`.
pub fn read_rows(path: &Path) -> Result<Vec<ImportRow>> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();

    let rows = if SPREADSHEET_EXTENSIONS.contains(&extension.as_str()) {
        read_spreadsheet(path)?
    } else if extension == "csv" {
        read_delimited(path, b',')?
    } else if extension == "tsv" {
        read_delimited(path, b'\t')?
    } else if extension == "json" {
        read_json(path)?
    } else {
        return Err(AppError::Import(format!(
            "Unsupported file type: {:?}",
            path.file_name().unwrap_or_default()
        )));
    };

    tracing::info!("Read {} rows from {:?}", rows.len(), path);
    Ok(rows)
}

fn read_spreadsheet(path: &Path) -> Result<Vec<ImportRow>> {
    let mut workbook =
        open_workbook_auto(path).map_err(|e| AppError::Import(format!("Spreadsheet: {}", e)))?;

    let Some(sheet_name) = workbook.sheet_names().first().cloned() else {
        return Ok(Vec::new());
    };
    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|e| AppError::Import(format!("Sheet {}: {}", sheet_name, e)))?;

    let mut rows = range.rows();
    let Some(header) = rows.next() else {
        return Ok(Vec::new());
    };
    let headers: Vec<String> = header.iter().map(header_text).collect();

    Ok(rows
        .map(|row| ImportRow {
            cells: headers
                .iter()
                .zip(row.iter())
                .filter(|(header, _)| !header.is_empty())
                .map(|(header, cell)| (header.clone(), cell_value(cell)))
                .collect(),
        })
        .collect())
}

fn header_text(cell: &Data) -> String {
    match cell_value(cell) {
        CellValue::Empty => String::new(),
        other => other.as_text().unwrap_or_default(),
    }
}

fn cell_value(cell: &Data) -> CellValue {
    match cell {
        Data::Empty | Data::Error(_) => CellValue::Empty,
        Data::String(s) => CellValue::Text(s.clone()),
        Data::Int(n) => CellValue::Number(*n as f64),
        Data::Float(f) => CellValue::Number(*f),
        Data::Bool(b) => CellValue::Bool(*b),
        Data::DateTime(dt) => CellValue::Number(dt.as_f64()),
        Data::DateTimeIso(s) | Data::DurationIso(s) => CellValue::Text(s.clone()),
    }
}

fn read_delimited(path: &Path, delimiter: u8) -> Result<Vec<ImportRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| AppError::Import(format!("Delimited text: {}", e)))?;

    let headers = reader
        .headers()
        .map_err(|e| AppError::Import(format!("Delimited header: {}", e)))?
        .clone();

    reader
        .records()
        .map(|record| {
            let record = record.map_err(|e| AppError::Import(format!("Delimited row: {}", e)))?;
            Ok(ImportRow {
                cells: headers
                    .iter()
                    .zip(record.iter())
                    .filter(|(header, _)| !header.is_empty())
                    .map(|(header, text)| (header.to_string(), text_value(text)))
                    .collect(),
            })
        })
        .collect()
}

fn text_value(text: &str) -> CellValue {
    if text.is_empty() {
        CellValue::Empty
    } else {
        CellValue::Text(text.to_string())
    }
}

fn read_json(path: &Path) -> Result<Vec<ImportRow>> {
    let content = std::fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&content)
        .map_err(|e| AppError::Import(format!("JSON: {}", e)))?;

    let Value::Array(items) = value else {
        return Err(AppError::Import("JSON import must be an array of rows".to_string()));
    };

    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::Object(map) => Ok(ImportRow {
                cells: map
                    .into_iter()
                    .map(|(header, value)| (header, json_value(value)))
                    .collect(),
            }),
            _ => Err(AppError::Import(format!("JSON row {} is not an object", i + 1))),
        })
        .collect()
}

fn json_value(value: Value) -> CellValue {
    match value {
        Value::Null => CellValue::Empty,
        Value::String(s) => CellValue::Text(s),
        Value::Number(n) => n.as_f64().map(CellValue::Number).unwrap_or(CellValue::Empty),
        Value::Bool(b) => CellValue::Bool(b),
        other => CellValue::Text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CallStatus;
    use crate::services::import::{ImportOptions, ImportReconciler};
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    #[test]
    fn test_json_rows() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("calls.json");
        std::fs::write(
            &path,
            r#"[{"Client Name": "Ravi", "Timestamp": 45000, "Visit Won": true, "Notes": null}]"#,
        )
        .unwrap();

        let rows = read_rows(&path).unwrap();
        assert_eq!(rows.len(), 1);
        let cells = &rows[0].cells;
        assert!(cells.contains(&("Client Name".to_string(), CellValue::Text("Ravi".into()))));
        assert!(cells.contains(&("Timestamp".to_string(), CellValue::Number(45000.0))));
        assert!(cells.contains(&("Visit Won".to_string(), CellValue::Bool(true))));
        assert!(cells.contains(&("Notes".to_string(), CellValue::Empty)));
    }

    #[test]
    fn test_json_must_be_array_of_objects() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("calls.json");

        std::fs::write(&path, r#"{"Client Name": "Ravi"}"#).unwrap();
        assert!(matches!(read_rows(&path), Err(AppError::Import(_))));

        std::fs::write(&path, r#"[1, 2]"#).unwrap();
        assert!(matches!(read_rows(&path), Err(AppError::Import(_))));
    }

    #[test]
    fn test_unreadable_spreadsheet_is_import_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("calls.xlsx");
        std::fs::write(&path, b"not a workbook").unwrap();

        assert!(matches!(read_rows(&path), Err(AppError::Import(_))));
    }

    const CALL_LOG_TEMPLATE: &str = "\
Name,Number,FEEDBACK,Date,Callback Time,Remark
John Doe,9876543210,Interested,2024-07-30 15:45,,Interested in 2BHK flat.
Jane Smith,5551234567,Call Back Later,2024-07-30 16:00,2024-08-01 11:00,Asked to call back next week.
";

    #[test]
    fn test_downloadable_template_imports() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("call_log_template.csv");
        std::fs::write(&path, CALL_LOG_TEMPLATE).unwrap();

        let rows = read_rows(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0]
            .cells
            .contains(&("Callback Time".to_string(), CellValue::Empty)));

        let options = ImportOptions {
            require_caller_name: false,
            default_caller_name: Some("Asha".into()),
            ..ImportOptions::new("p1")
        };
        let now = Utc.with_ymd_and_hms(2024, 7, 31, 9, 0, 0).unwrap();
        let outcome = ImportReconciler::new(options).parse(&rows, now).unwrap();
        assert_eq!(outcome.ready.len(), 2);
        assert!(outcome.staged.is_empty());

        let jane = &outcome.ready[1];
        assert_eq!(jane.client_name, "Jane Smith");
        assert_eq!(jane.status, CallStatus::CallBackLater);
        assert_eq!(jane.client_phone.as_deref(), Some("5551234567"));
        assert_eq!(jane.notes.as_deref(), Some("Asked to call back next week."));
        assert_eq!(
            jane.callback_time,
            Some(Utc.with_ymd_and_hms(2024, 8, 1, 11, 0, 0).unwrap())
        );
        assert_eq!(outcome.ready[0].status, CallStatus::Interested);
    }

    #[test]
    fn test_tab_separated_rows() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("calls.tsv");
        std::fs::write(&path, "Client Name\tStatus\nRavi, Jr.\tBooked\n").unwrap();

        let rows = read_rows(&path).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0]
            .cells
            .contains(&("Client Name".to_string(), CellValue::Text("Ravi, Jr.".into()))));
    }

    #[test]
    fn test_unsupported_extension() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("calls.txt");
        std::fs::write(&path, "Client Name\nRavi").unwrap();

        assert!(matches!(read_rows(&path), Err(AppError::Import(_))));
    }
}
