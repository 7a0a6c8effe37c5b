//! Import reconciliation
//!
//! Turns tabular rows into call logs. Complete rows are ready to write;
//! rows missing a required field are staged for review, where they can be
//! edited or skipped. Fully empty rows are dropped silently. The final write
//! is one batch covering ready and reviewed rows together.
//!
//! Header matching goes through an [`AliasTable`]; status text goes through
//! a [`StatusMapper`]. Both can be swapped per reconciler.

use crate::config::{DEFAULT_FOLLOW_UP_COUNT, MAX_IMPORT_ROWS, MS_PER_DAY, SPREADSHEET_EPOCH};
use crate::error::{AppError, Result};
use crate::models::{CallStatus, NewCallLog};
use crate::services::mutator::BatchResult;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

// ===== Rows =====

/// A single cell as delivered by the tabular reader.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
}

impl CellValue {
    pub fn is_blank(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(s) => s.trim().is_empty(),
            CellValue::Number(n) => !n.is_finite(),
            CellValue::Bool(_) => false,
        }
    }

    /// Trimmed text form. Whole numbers print without a fraction so phone
    /// numbers read from spreadsheets stay intact.
    pub fn as_text(&self) -> Option<String> {
        let text = match self {
            CellValue::Empty => return None,
            CellValue::Text(s) => s.trim().to_string(),
            CellValue::Number(n) if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 => {
                format!("{}", *n as i64)
            }
            CellValue::Number(n) => n.to_string(),
            CellValue::Bool(b) => b.to_string(),
        };
        (!text.is_empty()).then_some(text)
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::Text(value.to_string())
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        CellValue::Number(value)
    }
}

/// One input row: header → cell, in column order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ImportRow {
    pub cells: Vec<(String, CellValue)>,
}

impl ImportRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cell(mut self, header: &str, value: impl Into<CellValue>) -> Self {
        self.cells.push((header.to_string(), value.into()));
        self
    }

    pub fn is_blank(&self) -> bool {
        self.cells.iter().all(|(_, value)| value.is_blank())
    }
}

// ===== Field resolution =====

/// Call log fields an import can populate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ImportField {
    ClientName,
    Status,
    Timestamp,
    CallerName,
    ClientPhone,
    Notes,
    CallbackTime,
    FollowUpCount,
    VisitWon,
}

impl ImportField {
    pub fn as_str(self) -> &'static str {
        match self {
            ImportField::ClientName => "clientName",
            ImportField::Status => "status",
            ImportField::Timestamp => "timestamp",
            ImportField::CallerName => "callerName",
            ImportField::ClientPhone => "clientPhone",
            ImportField::Notes => "notes",
            ImportField::CallbackTime => "callbackTime",
            ImportField::FollowUpCount => "followUpCount",
            ImportField::VisitWon => "visitWon",
        }
    }
}

impl fmt::Display for ImportField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Headers compare lowercased with all whitespace removed.
pub fn normalize_header(header: &str) -> String {
    header
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Ordered header aliases per field. The first alias with a non-blank cell wins.
#[derive(Debug, Clone)]
pub struct AliasTable {
    entries: Vec<(ImportField, Vec<String>)>,
}

impl Default for AliasTable {
    fn default() -> Self {
        Self::empty()
            .with_aliases(
                ImportField::ClientName,
                &["client name", "name", "client", "customer name", "customer"],
            )
            .with_aliases(
                ImportField::Status,
                &["feedback", "status", "call result", "result", "call status"],
            )
            .with_aliases(
                ImportField::Timestamp,
                &["timestamp", "date", "call date", "date time", "time"],
            )
            .with_aliases(
                ImportField::CallerName,
                &["caller name", "caller", "agent", "called by"],
            )
            .with_aliases(
                ImportField::ClientPhone,
                &["client phone", "phone", "phone number", "number", "mobile", "contact"],
            )
            .with_aliases(ImportField::Notes, &["notes", "remarks", "remark", "comments", "note"])
            .with_aliases(
                ImportField::CallbackTime,
                &["callback time", "call back time", "callback", "follow up date"],
            )
            .with_aliases(
                ImportField::FollowUpCount,
                &["number of follow-ups", "follow-ups", "follow ups", "followup count"],
            )
            .with_aliases(ImportField::VisitWon, &["visit won"])
    }
}

impl AliasTable {
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Replace the aliases of `field`.
    pub fn with_aliases(mut self, field: ImportField, aliases: &[&str]) -> Self {
        let aliases = aliases.iter().map(|a| normalize_header(a)).collect();
        match self.entries.iter_mut().find(|(f, _)| *f == field) {
            Some(entry) => entry.1 = aliases,
            None => self.entries.push((field, aliases)),
        }
        self
    }

    pub fn aliases(&self, field: ImportField) -> &[String] {
        self.entries
            .iter()
            .find(|(f, _)| *f == field)
            .map(|(_, aliases)| aliases.as_slice())
            .unwrap_or(&[])
    }

    /// Cell for `field` in `row`, if any alias names a non-blank column.
    pub fn resolve<'r>(&self, row: &'r ImportRow, field: ImportField) -> Option<&'r CellValue> {
        self.aliases(field).iter().find_map(|alias| {
            row.cells
                .iter()
                .find(|(header, value)| normalize_header(header) == *alias && !value.is_blank())
                .map(|(_, value)| value)
        })
    }
}

/// Maps free-text status values onto [`CallStatus`].
pub trait StatusMapper: Send + Sync {
    fn map(&self, raw: &str) -> Option<CallStatus>;
}

/// Exact label match first, then ordered substring rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicStatusMapper;

const STATUS_RULES: &[(&[&str], CallStatus)] = &[
    (&["not interested", "not intrested"], CallStatus::NotInterested),
    (
        &["second site visit", "2nd visit", "second visit"],
        CallStatus::SecondSiteVisit,
    ),
    (
        &[
            "not answered",
            "no answer",
            "not reachable",
            "switched off",
            "ringing",
            "busy",
        ],
        CallStatus::NotAnswered,
    ),
    (&["call back", "callback"], CallStatus::CallBackLater),
    (&["details", "share"], CallStatus::DetailsShare),
    (&["book"], CallStatus::Booked),
    (&["site visit", "visit"], CallStatus::SiteVisitGenerated),
    (&["interested"], CallStatus::Interested),
];

impl StatusMapper for HeuristicStatusMapper {
    fn map(&self, raw: &str) -> Option<CallStatus> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        if let Ok(status) = raw.parse::<CallStatus>() {
            // Imports never write the legacy value.
            return Some(match status {
                CallStatus::Ringing => CallStatus::NotAnswered,
                other => other,
            });
        }

        let lower = raw.to_lowercase();
        STATUS_RULES
            .iter()
            .find(|(needles, _)| needles.iter().any(|needle| lower.contains(needle)))
            .map(|(_, status)| *status)
    }
}

// ===== Value parsing =====

/// Convert a spreadsheet serial date to a UTC instant.
pub fn serial_to_datetime(serial: f64) -> Option<DateTime<Utc>> {
    if !serial.is_finite() {
        return None;
    }
    let (year, month, day) = SPREADSHEET_EPOCH;
    let epoch = Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).single()?;
    let millis = (serial * MS_PER_DAY).round();
    if millis.abs() > i64::MAX as f64 {
        return None;
    }
    epoch.checked_add_signed(chrono::Duration::try_milliseconds(millis as i64)?)
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%d/%m/%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y"];

/// Parse a date string. Naive values are taken as UTC; numeric strings are serial dates.
pub fn parse_date_str(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    for format in DATETIME_FORMATS {
        if let Ok(at) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(at.and_utc());
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return date.and_hms_opt(0, 0, 0).map(|at| at.and_utc());
        }
    }
    raw.parse::<f64>().ok().and_then(serial_to_datetime)
}

fn parse_date(cell: &CellValue) -> Option<DateTime<Utc>> {
    match cell {
        CellValue::Number(n) => serial_to_datetime(*n),
        CellValue::Text(s) => parse_date_str(s),
        _ => None,
    }
}

fn parse_count(cell: &CellValue) -> Option<u32> {
    let value = match cell {
        CellValue::Number(n) => *n,
        CellValue::Text(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    value.is_finite().then(|| value.round().clamp(0.0, u32::MAX as f64) as u32)
}

fn parse_flag(cell: &CellValue) -> Option<bool> {
    match cell {
        CellValue::Bool(b) => Some(*b),
        CellValue::Number(n) => Some(*n != 0.0),
        CellValue::Text(s) => match s.trim().to_lowercase().as_str() {
            "yes" | "y" | "true" | "1" | "won" => Some(true),
            "no" | "n" | "false" | "0" | "lost" => Some(false),
            _ => None,
        },
        CellValue::Empty => None,
    }
}

// ===== Staging =====

/// Fields resolved from a row so far.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PartialCallLog {
    pub client_name: Option<String>,
    pub status: Option<CallStatus>,
    pub timestamp: Option<DateTime<Utc>>,
    pub caller_name: Option<String>,
    pub client_phone: Option<String>,
    pub notes: Option<String>,
    pub callback_time: Option<DateTime<Utc>>,
    pub follow_up_count: Option<u32>,
    pub visit_won: Option<bool>,
}

impl PartialCallLog {
    fn has(&self, field: ImportField) -> bool {
        match field {
            ImportField::ClientName => self.client_name.is_some(),
            ImportField::Status => self.status.is_some(),
            ImportField::Timestamp => self.timestamp.is_some(),
            ImportField::CallerName => self.caller_name.is_some(),
            ImportField::ClientPhone => self.client_phone.is_some(),
            ImportField::Notes => self.notes.is_some(),
            ImportField::CallbackTime => self.callback_time.is_some(),
            ImportField::FollowUpCount => self.follow_up_count.is_some(),
            ImportField::VisitWon => self.visit_won.is_some(),
        }
    }
}

/// A row held back for review.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedImportRow {
    /// Position of the row in the parsed input.
    pub index: usize,
    pub original: ImportRow,
    pub fields: PartialCallLog,
    /// Required fields the row lacked when parsed.
    pub missing: BTreeSet<ImportField>,
}

impl StagedImportRow {
    /// Spreadsheet row number, counting the header row.
    pub fn row_number(&self) -> usize {
        self.index + 2
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParseOutcome {
    pub ready: Vec<NewCallLog>,
    pub staged: Vec<StagedImportRow>,
    /// Rows with every value empty.
    pub dropped: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportOptions {
    pub project_id: String,
    /// Treat `callerName` as a required field.
    pub require_caller_name: bool,
    /// Caller recorded when the row has none and none is required.
    pub default_caller_name: Option<String>,
}

impl ImportOptions {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            require_caller_name: true,
            default_caller_name: None,
        }
    }
}

/// A change made during review. Values are entered as text, like a cell.
#[derive(Debug, Clone, PartialEq)]
pub enum RowEdit {
    Set {
        row: usize,
        field: ImportField,
        value: String,
    },
    Clear {
        row: usize,
        field: ImportField,
    },
    Skip {
        row: usize,
    },
}

/// Reviewed rows ready for the final batch.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommitResult {
    pub records: Vec<NewCallLog>,
    /// Staged rows the user chose not to import.
    pub skipped: Vec<StagedImportRow>,
}

/// Accounting of a finished import.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub success_count: usize,
    pub error_count: usize,
    pub errors: Vec<String>,
}

impl ImportSummary {
    /// Summarize the batch write of `records`; skipped rows count as errors.
    pub fn from_batch(batch: &BatchResult, skipped: &[StagedImportRow]) -> Self {
        let mut errors: Vec<String> = skipped
            .iter()
            .map(|row| format!("Row {}: skipped during review", row.row_number()))
            .collect();
        errors.extend(
            batch
                .rejected
                .iter()
                .map(|(index, reason)| format!("Record {}: {}", index + 1, reason)),
        );

        Self {
            success_count: batch.committed.len(),
            error_count: errors.len(),
            errors,
        }
    }

    /// A file that could not be read at all.
    pub fn failed(reason: impl fmt::Display) -> Self {
        Self {
            success_count: 0,
            error_count: 1,
            errors: vec![format!("Failed to read the import file: {}", reason)],
        }
    }
}

// ===== Reconciler =====

#[derive(Clone)]
pub struct ImportReconciler {
    aliases: AliasTable,
    mapper: Arc<dyn StatusMapper>,
    options: ImportOptions,
}

impl ImportReconciler {
    pub fn new(options: ImportOptions) -> Self {
        Self {
            aliases: AliasTable::default(),
            mapper: Arc::new(HeuristicStatusMapper),
            options,
        }
    }

    pub fn with_aliases(mut self, aliases: AliasTable) -> Self {
        self.aliases = aliases;
        self
    }

    pub fn with_status_mapper(mut self, mapper: Arc<dyn StatusMapper>) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn options(&self) -> &ImportOptions {
        &self.options
    }

    pub fn required_fields(&self) -> Vec<ImportField> {
        let mut fields = vec![
            ImportField::ClientName,
            ImportField::Status,
            ImportField::Timestamp,
        ];
        if self.options.require_caller_name {
            fields.push(ImportField::CallerName);
        }
        fields
    }

    /// Required fields `fields` still lacks. Call Back Later also needs a callback time.
    pub fn missing(&self, fields: &PartialCallLog) -> BTreeSet<ImportField> {
        let mut missing: BTreeSet<ImportField> = self
            .required_fields()
            .into_iter()
            .filter(|field| !fields.has(*field))
            .collect();
        if fields.status == Some(CallStatus::CallBackLater) && fields.callback_time.is_none() {
            missing.insert(ImportField::CallbackTime);
        }
        missing
    }

    /// Split rows into ready records and rows needing review.
    ///
    /// `now` supplies the default timestamp pre-filled on staged rows.
    pub fn parse(&self, rows: &[ImportRow], now: DateTime<Utc>) -> Result<ParseOutcome> {
        if rows.len() > MAX_IMPORT_ROWS {
            return Err(AppError::Import(format!(
                "File has {} rows, the limit is {}",
                rows.len(),
                MAX_IMPORT_ROWS
            )));
        }

        let mut outcome = ParseOutcome::default();
        for (index, row) in rows.iter().enumerate() {
            if row.is_blank() {
                outcome.dropped += 1;
                continue;
            }

            let mut fields = self.resolve_row(row);
            let missing = self.missing(&fields);

            if missing.is_empty() {
                if let Some(record) = self.build(&fields) {
                    outcome.ready.push(record);
                    continue;
                }
            }

            if fields.timestamp.is_none() {
                fields.timestamp = start_of_day(now);
            }
            tracing::debug!("Staging row {} missing {:?}", index + 2, missing);
            outcome.staged.push(StagedImportRow {
                index,
                original: row.clone(),
                fields,
                missing,
            });
        }

        tracing::info!(
            "Parsed import: {} ready, {} staged, {} dropped",
            outcome.ready.len(),
            outcome.staged.len(),
            outcome.dropped
        );
        Ok(outcome)
    }

    fn resolve_row(&self, row: &ImportRow) -> PartialCallLog {
        let cell = |field| self.aliases.resolve(row, field);

        PartialCallLog {
            client_name: cell(ImportField::ClientName).and_then(CellValue::as_text),
            status: cell(ImportField::Status)
                .and_then(CellValue::as_text)
                .and_then(|raw| self.mapper.map(&raw)),
            timestamp: cell(ImportField::Timestamp).and_then(parse_date),
            caller_name: cell(ImportField::CallerName).and_then(CellValue::as_text),
            client_phone: cell(ImportField::ClientPhone).and_then(CellValue::as_text),
            notes: cell(ImportField::Notes).and_then(CellValue::as_text),
            callback_time: cell(ImportField::CallbackTime).and_then(parse_date),
            follow_up_count: cell(ImportField::FollowUpCount).and_then(parse_count),
            visit_won: cell(ImportField::VisitWon).and_then(parse_flag),
        }
    }

    /// Build the record, or `None` while a required field is missing.
    fn build(&self, fields: &PartialCallLog) -> Option<NewCallLog> {
        if !self.missing(fields).is_empty() {
            return None;
        }

        let caller_name = fields
            .caller_name
            .clone()
            .or_else(|| self.options.default_caller_name.clone())
            .unwrap_or_default();

        let mut record = NewCallLog::new(
            self.options.project_id.clone(),
            caller_name,
            fields.client_name.clone()?,
            fields.status?,
        );
        record.timestamp = fields.timestamp;
        record.client_phone = fields.client_phone.clone();
        record.notes = fields.notes.clone();
        record.callback_time = fields.callback_time;
        record.follow_up_count = Some(fields.follow_up_count.unwrap_or(DEFAULT_FOLLOW_UP_COUNT));
        record.visit_won = fields.visit_won;
        Some(record)
    }

    /// Apply a text value to one field of a staged row.
    pub fn apply_value(
        &self,
        fields: &mut PartialCallLog,
        field: ImportField,
        value: &str,
    ) -> Result<()> {
        let cell = CellValue::Text(value.to_string());
        let invalid = || AppError::Validation(format!("Invalid {}: '{}'", field, value.trim()));

        match field {
            ImportField::ClientName => fields.client_name = Some(cell.as_text().ok_or_else(invalid)?),
            ImportField::CallerName => fields.caller_name = Some(cell.as_text().ok_or_else(invalid)?),
            ImportField::ClientPhone => fields.client_phone = cell.as_text(),
            ImportField::Notes => fields.notes = cell.as_text(),
            ImportField::Status => {
                fields.status = Some(self.mapper.map(value).ok_or_else(invalid)?);
            }
            ImportField::Timestamp => fields.timestamp = Some(parse_date(&cell).ok_or_else(invalid)?),
            ImportField::CallbackTime => {
                fields.callback_time = Some(parse_date(&cell).ok_or_else(invalid)?);
            }
            ImportField::FollowUpCount => {
                fields.follow_up_count = Some(parse_count(&cell).ok_or_else(invalid)?);
            }
            ImportField::VisitWon => fields.visit_won = Some(parse_flag(&cell).ok_or_else(invalid)?),
        }
        Ok(())
    }

    pub fn review(&self, staged: Vec<StagedImportRow>) -> ImportReview {
        ImportReview {
            reconciler: self.clone(),
            rows: staged,
            skipped: BTreeSet::new(),
        }
    }

    /// Apply review edits in order and collect the completed rows.
    pub fn review_commit(
        &self,
        staged: Vec<StagedImportRow>,
        edits: Vec<RowEdit>,
    ) -> Result<CommitResult> {
        let mut review = self.review(staged);
        for edit in edits {
            match edit {
                RowEdit::Set { row, field, value } => review.edit(row, field, &value)?,
                RowEdit::Clear { row, field } => review.clear(row, field)?,
                RowEdit::Skip { row } => review.skip(row)?,
            }
        }
        review.finish()
    }
}

fn start_of_day(now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    now.date_naive().and_hms_opt(0, 0, 0).map(|at| at.and_utc())
}

/// Review session over staged rows.
pub struct ImportReview {
    reconciler: ImportReconciler,
    rows: Vec<StagedImportRow>,
    skipped: BTreeSet<usize>,
}

impl ImportReview {
    pub fn rows(&self) -> &[StagedImportRow] {
        &self.rows
    }

    fn row_mut(&mut self, row: usize) -> Result<&mut StagedImportRow> {
        self.rows
            .get_mut(row)
            .ok_or_else(|| AppError::NotFound(format!("Staged row {}", row)))
    }

    fn check_row(&self, row: usize) -> Result<()> {
        if row < self.rows.len() {
            Ok(())
        } else {
            Err(AppError::NotFound(format!("Staged row {}", row)))
        }
    }

    pub fn edit(&mut self, row: usize, field: ImportField, value: &str) -> Result<()> {
        let reconciler = self.reconciler.clone();
        let staged = self.row_mut(row)?;
        reconciler.apply_value(&mut staged.fields, field, value)
    }

    pub fn clear(&mut self, row: usize, field: ImportField) -> Result<()> {
        let fields = &mut self.row_mut(row)?.fields;
        match field {
            ImportField::ClientName => fields.client_name = None,
            ImportField::Status => fields.status = None,
            ImportField::Timestamp => fields.timestamp = None,
            ImportField::CallerName => fields.caller_name = None,
            ImportField::ClientPhone => fields.client_phone = None,
            ImportField::Notes => fields.notes = None,
            ImportField::CallbackTime => fields.callback_time = None,
            ImportField::FollowUpCount => fields.follow_up_count = None,
            ImportField::VisitWon => fields.visit_won = None,
        }
        Ok(())
    }

    pub fn skip(&mut self, row: usize) -> Result<()> {
        self.check_row(row)?;
        self.skipped.insert(row);
        Ok(())
    }

    pub fn unskip(&mut self, row: usize) -> Result<()> {
        self.check_row(row)?;
        self.skipped.remove(&row);
        Ok(())
    }

    pub fn is_skipped(&self, row: usize) -> bool {
        self.skipped.contains(&row)
    }

    /// Required fields the row currently lacks.
    pub fn missing(&self, row: usize) -> Result<BTreeSet<ImportField>> {
        self.check_row(row)?;
        Ok(self.reconciler.missing(&self.rows[row].fields))
    }

    /// Positions of rows that are neither complete nor skipped.
    pub fn incomplete_rows(&self) -> Vec<usize> {
        self.rows
            .iter()
            .enumerate()
            .filter(|(i, row)| {
                !self.skipped.contains(i) && !self.reconciler.missing(&row.fields).is_empty()
            })
            .map(|(i, _)| i)
            .collect()
    }

    pub fn is_submittable(&self) -> bool {
        self.incomplete_rows().is_empty()
    }

    /// Complete the review. Fails while any kept row is incomplete.
    pub fn finish(self) -> Result<CommitResult> {
        let incomplete = self.incomplete_rows();
        if !incomplete.is_empty() {
            return Err(AppError::IncompleteImport(incomplete));
        }

        let mut result = CommitResult::default();
        for (i, row) in self.rows.into_iter().enumerate() {
            if self.skipped.contains(&i) {
                result.skipped.push(row);
            } else if let Some(record) = self.reconciler.build(&row.fields) {
                result.records.push(record);
            }
        }

        tracing::info!(
            "Review finished: {} completed, {} skipped",
            result.records.len(),
            result.skipped.len()
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 15, 30, 0).unwrap()
    }

    fn reconciler() -> ImportReconciler {
        ImportReconciler::new(ImportOptions::new("p1"))
    }

    fn complete_row(client: &str) -> ImportRow {
        ImportRow::new()
            .cell("Client Name", client)
            .cell("Status", "Interested")
            .cell("Timestamp", "2024-05-01 10:00")
            .cell("Caller Name", "Asha")
    }

    #[test]
    fn test_serial_date_conversion() {
        let at = serial_to_datetime(45000.0).unwrap();
        assert_eq!(at, Utc.with_ymd_and_hms(2023, 3, 15, 0, 0, 0).unwrap());

        let noon = serial_to_datetime(45000.5).unwrap();
        assert_eq!(noon, Utc.with_ymd_and_hms(2023, 3, 15, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_call_back_maps_from_any_alias() {
        let expected = Utc.with_ymd_and_hms(2023, 3, 15, 0, 0, 0).unwrap();

        for (status_header, date_header) in [
            ("Feedback", "Date"),
            ("status", "Timestamp"),
            ("  CALL RESULT ", "call date"),
        ] {
            let row = ImportRow::new()
                .cell("Client", "Ravi")
                .cell(status_header, "call back")
                .cell(date_header, 45000.0)
                .cell("Caller", "Asha")
                .cell("Callback Time", "2023-03-16 10:00");

            let outcome = reconciler().parse(&[row], now()).unwrap();
            assert_eq!(outcome.ready.len(), 1, "headers {} / {}", status_header, date_header);
            assert_eq!(outcome.ready[0].status, CallStatus::CallBackLater);
            assert_eq!(outcome.ready[0].timestamp, Some(expected));
        }
    }

    #[test]
    fn test_call_back_without_time_is_staged() {
        let row = ImportRow::new()
            .cell("Client Name", "Ravi")
            .cell("Status", "Call Back Later")
            .cell("Timestamp", "2024-05-01 10:00")
            .cell("Caller Name", "Asha");

        let r = reconciler();
        let outcome = r.parse(&[row], now()).unwrap();
        assert!(outcome.ready.is_empty());
        assert_eq!(
            outcome.staged[0].missing,
            BTreeSet::from([ImportField::CallbackTime])
        );

        let mut review = r.review(outcome.staged);
        review
            .edit(0, ImportField::CallbackTime, "2024-05-12 11:00")
            .unwrap();
        assert!(review.is_submittable());
        let result = review.finish().unwrap();
        assert_eq!(
            result.records[0].callback_time,
            Some(Utc.with_ymd_and_hms(2024, 5, 12, 11, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_status_heuristics() {
        let mapper = HeuristicStatusMapper;
        assert_eq!(mapper.map("Booked"), Some(CallStatus::Booked));
        assert_eq!(mapper.map("not interested at all"), Some(CallStatus::NotInterested));
        assert_eq!(mapper.map("phone switched off"), Some(CallStatus::NotAnswered));
        assert_eq!(mapper.map("Ringing"), Some(CallStatus::NotAnswered));
        assert_eq!(mapper.map("2nd visit done"), Some(CallStatus::SecondSiteVisit));
        assert_eq!(mapper.map("site visit planned"), Some(CallStatus::SiteVisitGenerated));
        assert_eq!(mapper.map("shared brochure"), Some(CallStatus::DetailsShare));
        assert_eq!(mapper.map("very interested"), Some(CallStatus::Interested));
        assert_eq!(mapper.map("wrong number"), None);
    }

    #[test]
    fn test_blank_rows_dropped_and_incomplete_staged() {
        let rows = vec![
            complete_row("Ravi"),
            ImportRow::new().cell("Client Name", "").cell("Status", "  "),
            ImportRow::new()
                .cell("Client Name", "Meera")
                .cell("Status", "gibberish")
                .cell("Caller Name", "Asha"),
        ];

        let outcome = reconciler().parse(&rows, now()).unwrap();
        assert_eq!(outcome.ready.len(), 1);
        assert_eq!(outcome.dropped, 1);
        assert_eq!(outcome.staged.len(), 1);

        let staged = &outcome.staged[0];
        assert_eq!(staged.index, 2);
        assert_eq!(staged.row_number(), 4);
        assert_eq!(
            staged.missing,
            BTreeSet::from([ImportField::Status, ImportField::Timestamp])
        );
        // Pre-filled with the start of today but still flagged.
        assert_eq!(
            staged.fields.timestamp,
            Some(Utc.with_ymd_and_hms(2024, 5, 10, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_caller_name_optional_uses_default() {
        let options = ImportOptions {
            require_caller_name: false,
            default_caller_name: Some("Asha".into()),
            ..ImportOptions::new("p1")
        };
        let row = ImportRow::new()
            .cell("Name", "Ravi")
            .cell("Result", "Booked")
            .cell("Date", "10/05/2024");

        let outcome = ImportReconciler::new(options).parse(&[row], now()).unwrap();
        assert_eq!(outcome.ready.len(), 1);
        assert_eq!(outcome.ready[0].caller_name, "Asha");
        assert_eq!(
            outcome.ready[0].timestamp,
            Some(Utc.with_ymd_and_hms(2024, 5, 10, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_optional_columns() {
        let row = complete_row("Ravi")
            .cell("Client Phone", 9876543210.0)
            .cell("Number of Follow-ups", "3")
            .cell("Callback Time", "2024-05-11T09:00:00Z")
            .cell("Visit Won", "yes");

        let outcome = reconciler().parse(&[row], now()).unwrap();
        let record = &outcome.ready[0];
        assert_eq!(record.client_phone.as_deref(), Some("9876543210"));
        assert_eq!(record.follow_up_count, Some(3));
        assert_eq!(record.visit_won, Some(true));
        assert!(record.callback_time.is_some());
    }

    #[test]
    fn test_follow_up_defaults_to_one() {
        let outcome = reconciler().parse(&[complete_row("Ravi")], now()).unwrap();
        assert_eq!(outcome.ready[0].follow_up_count, Some(DEFAULT_FOLLOW_UP_COUNT));
    }

    #[test]
    fn test_review_edit_skip_and_finish() {
        let rows = vec![
            ImportRow::new().cell("Client Name", "Ravi").cell("Caller", "Asha"),
            ImportRow::new().cell("Client Name", "Meera").cell("Caller", "Asha"),
        ];
        let r = reconciler();
        let outcome = r.parse(&rows, now()).unwrap();
        assert_eq!(outcome.staged.len(), 2);

        let mut review = r.review(outcome.staged);
        assert!(!review.is_submittable());
        assert_eq!(review.missing(0).unwrap(), BTreeSet::from([ImportField::Status]));

        review.edit(0, ImportField::Status, "Booked").unwrap();
        assert_eq!(review.incomplete_rows(), vec![1]);

        review.skip(1).unwrap();
        assert!(review.is_submittable());

        let result = review.finish().unwrap();
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0].client_name, "Ravi");
        assert_eq!(result.skipped.len(), 1);
    }

    #[test]
    fn test_commit_blocked_while_incomplete() {
        let rows = vec![ImportRow::new().cell("Client Name", "Ravi")];
        let r = reconciler();
        let outcome = r.parse(&rows, now()).unwrap();

        let err = r
            .review_commit(
                outcome.staged,
                vec![RowEdit::Set {
                    row: 0,
                    field: ImportField::Status,
                    value: "Interested".into(),
                }],
            )
            .unwrap_err();
        assert!(matches!(err, AppError::IncompleteImport(rows) if rows == vec![0]));
    }

    #[test]
    fn test_invalid_edit_value_rejected() {
        let r = reconciler();
        let outcome = r
            .parse(&[ImportRow::new().cell("Client Name", "Ravi")], now())
            .unwrap();
        let mut review = r.review(outcome.staged);

        assert!(matches!(
            review.edit(0, ImportField::Timestamp, "next tuesday"),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            review.edit(5, ImportField::Status, "Booked"),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn test_too_many_rows_is_a_single_failure() {
        let rows = vec![ImportRow::new(); MAX_IMPORT_ROWS + 1];
        assert!(matches!(reconciler().parse(&rows, now()), Err(AppError::Import(_))));
    }

    #[test]
    fn test_summary_counts_skips_as_errors() {
        let staged = StagedImportRow {
            index: 4,
            original: ImportRow::new(),
            fields: PartialCallLog::default(),
            missing: BTreeSet::new(),
        };
        let batch = BatchResult {
            committed: Vec::new(),
            rejected: vec![(0, "Client name is required".into())],
        };

        let summary = ImportSummary::from_batch(&batch, &[staged]);
        assert_eq!(summary.error_count, 2);
        assert_eq!(summary.errors[0], "Row 6: skipped during review");
    }
}
