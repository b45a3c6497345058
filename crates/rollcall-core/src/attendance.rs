//! Append-only attendance log with once-per-day deduplication.

use crate::types::UNKNOWN_LABEL;
use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// First line of every attendance log.
pub const LOG_HEADER: &str = "Name,Date,Time,Status";

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid attendance input: {0}")]
    InvalidInput(String),

    #[error("attendance log I/O failed at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Present,
    Late,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Present => "Present",
            Status::Late => "Late",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "Present" => Some(Status::Present),
            "Late" => Some(Status::Late),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub name: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub status: Status,
}

impl AttendanceRecord {
    fn to_csv_row(&self) -> String {
        format!(
            "{},{},{},{}\n",
            quote_field(&self.name),
            self.date.format(DATE_FORMAT),
            self.time.format(TIME_FORMAT),
            self.status
        )
    }
}

/// Totals for one day of the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceSummary {
    pub date: NaiveDate,
    pub total: usize,
    pub present: usize,
    pub late: usize,
}

/// `Late` iff a cutoff is set and `now`, truncated to the minute, is after it.
pub fn classify_status(now: NaiveTime, late_cutoff: Option<NaiveTime>) -> Status {
    let Some(cutoff) = late_cutoff else {
        return Status::Present;
    };
    if truncate_to_minute(now) > truncate_to_minute(cutoff) {
        Status::Late
    } else {
        Status::Present
    }
}

fn truncate_to_minute(t: NaiveTime) -> NaiveTime {
    NaiveTime::from_hms_opt(t.hour(), t.minute(), 0).unwrap_or(t)
}

/// Parse an `HH:MM` clock value (e.g. a late cutoff or session end time).
pub fn parse_clock(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").ok()
}

pub struct AttendanceLedger {
    path: PathBuf,
    today: NaiveDate,
    today_set: HashSet<String>,
}

impl AttendanceLedger {
    /// Open (or prepare to create) the log at `path` and load today's names.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        Self::open_for(path, Local::now().date_naive())
    }

    /// Open the log treating `today` as the current day.
    pub fn open_for(path: impl Into<PathBuf>, today: NaiveDate) -> Result<Self, LedgerError> {
        let path = path.into();
        let today_set = names_on(&read_records(&path)?, today);
        tracing::info!(
            path = %path.display(),
            date = %today,
            already_marked = today_set.len(),
            "attendance ledger opened"
        );
        Ok(Self {
            path,
            today,
            today_set,
        })
    }

    /// Record `name` at the current local time.
    pub fn mark(&mut self, name: &str, status: Status) -> Result<bool, LedgerError> {
        self.mark_at(name, status, Local::now().naive_local())
    }

    /// Record `name` at `at`.
    ///
    /// Returns `Ok(false)` without touching the log for `"Unknown"` or a name
    /// already recorded that day. On a storage failure the name stays unmarked.
    pub fn mark_at(
        &mut self,
        name: &str,
        status: Status,
        at: NaiveDateTime,
    ) -> Result<bool, LedgerError> {
        if name == UNKNOWN_LABEL {
            return Ok(false);
        }
        if name.trim().is_empty() {
            return Err(LedgerError::InvalidInput("name must not be empty".into()));
        }

        if at.date() != self.today {
            self.roll_over(at.date())?;
        }
        if self.today_set.contains(name) {
            return Ok(false);
        }

        let record = AttendanceRecord {
            name: name.to_string(),
            date: at.date(),
            time: truncate_to_second(at.time()),
            status,
        };
        self.append(&record)?;
        self.today_set.insert(record.name.clone());

        tracing::info!(
            name = %record.name,
            status = %record.status,
            time = %record.time.format(TIME_FORMAT),
            "attendance marked"
        );
        Ok(true)
    }

    fn roll_over(&mut self, date: NaiveDate) -> Result<(), LedgerError> {
        let today_set = names_on(&read_records(&self.path)?, date);
        tracing::info!(from = %self.today, to = %date, "attendance day rolled over");
        self.today = date;
        self.today_set = today_set;
        Ok(())
    }

    fn append(&self, record: &AttendanceRecord) -> Result<(), LedgerError> {
        let storage = |source| LedgerError::Storage {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(storage)?;
        }
        let needs_header = std::fs::metadata(&self.path)
            .map(|m| m.len() == 0)
            .unwrap_or(true);

        let mut chunk = String::new();
        if needs_header {
            chunk.push_str(LOG_HEADER);
            chunk.push('\n');
        }
        chunk.push_str(&record.to_csv_row());

        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(chunk.as_bytes()));
        if let Err(e) = result {
            tracing::error!(path = %self.path.display(), error = %e, "failed to append attendance");
            return Err(storage(e));
        }
        Ok(())
    }

    /// All records dated `date`, in log order.
    pub fn report(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, LedgerError> {
        Ok(read_records(&self.path)?
            .into_iter()
            .filter(|r| r.date == date)
            .collect())
    }

    pub fn summary(&self, date: NaiveDate) -> Result<AttendanceSummary, LedgerError> {
        let records = self.report(date)?;
        let late = records.iter().filter(|r| r.status == Status::Late).count();
        Ok(AttendanceSummary {
            date,
            total: records.len(),
            present: records.len() - late,
            late,
        })
    }

    /// Names recorded on the ledger's current day, sorted.
    pub fn today(&self) -> Vec<String> {
        let mut names: Vec<String> = self.today_set.iter().cloned().collect();
        names.sort();
        names
    }

    pub fn has_marked(&self, name: &str) -> bool {
        self.today_set.contains(name)
    }

    pub fn current_date(&self) -> NaiveDate {
        self.today
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn truncate_to_second(t: NaiveTime) -> NaiveTime {
    NaiveTime::from_hms_opt(t.hour(), t.minute(), t.second()).unwrap_or(t)
}

fn names_on(records: &[AttendanceRecord], date: NaiveDate) -> HashSet<String> {
    records
        .iter()
        .filter(|r| r.date == date)
        .map(|r| r.name.clone())
        .collect()
}

/// Read every well-formed record. A missing log is an empty log.
fn read_records(path: &Path) -> Result<Vec<AttendanceRecord>, LedgerError> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(LedgerError::Storage {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let mut records = Vec::new();
    for (i, row) in parse_csv(&content).into_iter().enumerate() {
        if i == 0 && row.join(",") == LOG_HEADER {
            continue;
        }
        match parse_row(&row) {
            Some(record) => records.push(record),
            None => tracing::warn!(path = %path.display(), row = i, "skipping malformed attendance row"),
        }
    }
    Ok(records)
}

fn parse_row(row: &[String]) -> Option<AttendanceRecord> {
    let name = row.first()?.clone();
    if name.is_empty() {
        return None;
    }
    let date = NaiveDate::parse_from_str(row.get(1)?, DATE_FORMAT).ok()?;
    let time = NaiveTime::parse_from_str(row.get(2)?, TIME_FORMAT).ok()?;
    // Rows written without a status column count as present.
    let status = row
        .get(3)
        .and_then(|s| Status::parse(s))
        .unwrap_or(Status::Present);
    Some(AttendanceRecord {
        name,
        date,
        time,
        status,
    })
}

/// Quote a CSV field when it contains a delimiter, quote or line break.
fn quote_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Split CSV text into rows of fields. Quoted fields may span lines.
fn parse_csv(content: &str) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = content.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            ',' => row.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
            }
            _ => field.push(c),
        }
    }
    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    rows.retain(|r| !(r.len() == 1 && r[0].is_empty()));
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn at(d: NaiveDate, h: u32, min: u32, s: u32) -> NaiveDateTime {
        d.and_hms_opt(h, min, s).unwrap()
    }

    fn clock(h: u32, m: u32, s: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, s).unwrap()
    }

    #[test]
    fn test_mark_once_per_day() {
        let dir = tempfile::tempdir().unwrap();
        let day = date(2024, 3, 4);
        let mut ledger = AttendanceLedger::open_for(dir.path().join("log.csv"), day).unwrap();

        assert!(ledger.mark_at("Alice", Status::Present, at(day, 8, 55, 0)).unwrap());
        assert!(!ledger.mark_at("Alice", Status::Late, at(day, 9, 30, 0)).unwrap());
        assert_eq!(ledger.report(day).unwrap().len(), 1);
        assert!(ledger.has_marked("Alice"));
    }

    #[test]
    fn test_dedup_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.csv");
        let day = date(2024, 3, 4);

        let mut ledger = AttendanceLedger::open_for(&path, day).unwrap();
        assert!(ledger.mark_at("Alice", Status::Present, at(day, 8, 0, 0)).unwrap());
        drop(ledger);

        let mut reopened = AttendanceLedger::open_for(&path, day).unwrap();
        assert_eq!(reopened.today(), vec!["Alice".to_string()]);
        assert!(!reopened.mark_at("Alice", Status::Present, at(day, 10, 0, 0)).unwrap());
        assert!(reopened.mark_at("Bob", Status::Present, at(day, 10, 0, 0)).unwrap());
    }

    #[test]
    fn test_unknown_never_marked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.csv");
        let day = date(2024, 3, 4);
        let mut ledger = AttendanceLedger::open_for(&path, day).unwrap();

        assert!(!ledger.mark_at("Unknown", Status::Present, at(day, 8, 0, 0)).unwrap());
        assert!(!ledger.mark_at("Unknown", Status::Present, at(day, 8, 1, 0)).unwrap());
        assert!(!path.exists());
        assert!(ledger.today().is_empty());
    }

    #[test]
    fn test_empty_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let day = date(2024, 3, 4);
        let mut ledger = AttendanceLedger::open_for(dir.path().join("log.csv"), day).unwrap();
        let err = ledger.mark_at("  ", Status::Present, at(day, 8, 0, 0));
        assert!(matches!(err, Err(LedgerError::InvalidInput(_))));
    }

    #[test]
    fn test_header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.csv");
        let day = date(2024, 3, 4);
        let mut ledger = AttendanceLedger::open_for(&path, day).unwrap();
        ledger.mark_at("Alice", Status::Present, at(day, 8, 0, 5)).unwrap();
        ledger.mark_at("Bob", Status::Late, at(day, 9, 15, 0)).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "Name,Date,Time,Status\n\
             Alice,2024-03-04,08:00:05,Present\n\
             Bob,2024-03-04,09:15:00,Late\n"
        );
    }

    #[test]
    fn test_names_with_commas_and_quotes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.csv");
        let day = date(2024, 3, 4);
        let mut ledger = AttendanceLedger::open_for(&path, day).unwrap();
        ledger.mark_at("Doe, Jane", Status::Present, at(day, 8, 0, 0)).unwrap();
        ledger.mark_at("Bobby \"Tables\"", Status::Present, at(day, 8, 1, 0)).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"Doe, Jane\",2024-03-04"));
        assert!(content.contains("\"Bobby \"\"Tables\"\"\",2024-03-04"));

        let reopened = AttendanceLedger::open_for(&path, day).unwrap();
        assert_eq!(
            reopened.today(),
            vec!["Bobby \"Tables\"".to_string(), "Doe, Jane".to_string()]
        );
    }

    #[test]
    fn test_date_rollover_resets_today() {
        let dir = tempfile::tempdir().unwrap();
        let monday = date(2024, 3, 4);
        let tuesday = date(2024, 3, 5);
        let mut ledger = AttendanceLedger::open_for(dir.path().join("log.csv"), monday).unwrap();

        assert!(ledger.mark_at("Alice", Status::Present, at(monday, 8, 0, 0)).unwrap());
        assert!(ledger.mark_at("Alice", Status::Present, at(tuesday, 8, 0, 0)).unwrap());
        assert_eq!(ledger.current_date(), tuesday);
        assert_eq!(ledger.report(monday).unwrap().len(), 1);
        assert_eq!(ledger.report(tuesday).unwrap().len(), 1);
    }

    #[test]
    fn test_report_and_summary() {
        let dir = tempfile::tempdir().unwrap();
        let day = date(2024, 3, 4);
        let other = date(2024, 3, 3);
        let mut ledger = AttendanceLedger::open_for(dir.path().join("log.csv"), other).unwrap();
        ledger.mark_at("Zed", Status::Present, at(other, 8, 0, 0)).unwrap();
        ledger.mark_at("Carol", Status::Late, at(day, 9, 40, 0)).unwrap();
        ledger.mark_at("Alice", Status::Present, at(day, 8, 10, 0)).unwrap();

        let report = ledger.report(day).unwrap();
        let names: Vec<_> = report.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Carol", "Alice"]);

        let summary = ledger.summary(day).unwrap();
        assert_eq!((summary.total, summary.present, summary.late), (2, 1, 1));
        assert!(ledger.report(date(2020, 1, 1)).unwrap().is_empty());
    }

    #[test]
    fn test_missing_status_defaults_to_present() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.csv");
        std::fs::write(
            &path,
            "Name,Date,Time,Status\nAlice,2024-03-04,08:00:00\ngarbage row\n",
        )
        .unwrap();
        let ledger = AttendanceLedger::open_for(&path, date(2024, 3, 4)).unwrap();
        let report = ledger.report(date(2024, 3, 4)).unwrap();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].status, Status::Present);
    }

    #[test]
    fn test_storage_failure_leaves_name_unmarked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.csv");
        let day = date(2024, 3, 4);
        let mut ledger = AttendanceLedger::open_for(&path, day).unwrap();

        // A directory where the log file should be makes every append fail.
        std::fs::create_dir(&path).unwrap();
        let result = ledger.mark_at("Alice", Status::Present, at(day, 8, 0, 0));
        assert!(matches!(result, Err(LedgerError::Storage { .. })));
        assert!(!ledger.has_marked("Alice"));
    }

    #[test]
    fn test_classify_status_minute_precision() {
        let cutoff = Some(clock(9, 0, 0));
        assert_eq!(classify_status(clock(8, 59, 59), cutoff), Status::Present);
        assert_eq!(classify_status(clock(9, 0, 59), cutoff), Status::Present);
        assert_eq!(classify_status(clock(9, 1, 0), cutoff), Status::Late);
        assert_eq!(classify_status(clock(23, 0, 0), None), Status::Present);
    }

    #[test]
    fn test_parse_clock() {
        assert_eq!(parse_clock("09:30"), Some(clock(9, 30, 0)));
        assert_eq!(parse_clock(" 17:05 "), Some(clock(17, 5, 0)));
        assert_eq!(parse_clock("9h30"), None);
    }

    #[test]
    fn test_parse_csv_quoted_newline() {
        let rows = parse_csv("a,\"b\nc\",d\r\ne,f\n");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], vec!["a", "b\nc", "d"]);
        assert_eq!(rows[1], vec!["e", "f"]);
    }
}
