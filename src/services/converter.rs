//! Spreadsheet to CSV conversion.
//!
//! Only the first sheet of a workbook is converted. Every row is written as
//! is, so the header row of the sheet becomes the header row of the CSV.

use calamine::{Data, DataType, Range, Reader, open_workbook_auto};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::NonSpreadsheetPolicy;

pub const ARCHIVE_EXTENSIONS: [&str; 7] = ["zip", "7z", "rar", "tar", "gz", "tgz", "bz2"];
pub const SPREADSHEET_EXTENSIONS: [&str; 5] = ["xlsx", "xlsm", "xlsb", "xls", "ods"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Archive,
    Spreadsheet,
    Other,
}

/// Classifies a file by its extension, ignoring case.
pub fn classify(path: &Path) -> FileKind {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    if ARCHIVE_EXTENSIONS.contains(&ext.as_str()) {
        FileKind::Archive
    } else if SPREADSHEET_EXTENSIONS.contains(&ext.as_str()) {
        FileKind::Spreadsheet
    } else {
        FileKind::Other
    }
}

/// What to do with one extracted file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAction {
    Skip,
    Convert,
    UploadAsIs,
}

pub fn plan(kind: FileKind, policy: NonSpreadsheetPolicy) -> FileAction {
    match (kind, policy) {
        (FileKind::Archive, _) => FileAction::Skip,
        (FileKind::Spreadsheet, _) => FileAction::Convert,
        (FileKind::Other, NonSpreadsheetPolicy::Convert) => FileAction::Convert,
        (FileKind::Other, NonSpreadsheetPolicy::Passthrough) => FileAction::UploadAsIs,
        (FileKind::Other, NonSpreadsheetPolicy::Skip) => FileAction::Skip,
    }
}

#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("file not found: {0}")]
    NotFound(PathBuf),

    #[error("cannot read workbook: {0}")]
    Open(#[from] calamine::Error),

    #[error("workbook has no sheets")]
    NoSheet,

    #[error("cannot write csv: {0}")]
    Csv(#[from] csv::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// `<dir>/<stem>.csv` next to the source file.
pub fn csv_path_for(source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "data".to_string());
    source.with_file_name(format!("{}.csv", stem))
}

/// Converts the first sheet of `source` into a sibling CSV, replacing any
/// previous file of that name. Blocking.
pub fn convert_to_csv(source: &Path) -> Result<PathBuf, ConversionError> {
    if !source.is_file() {
        return Err(ConversionError::NotFound(source.to_path_buf()));
    }

    let mut workbook = open_workbook_auto(source)?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or(ConversionError::NoSheet)??;

    let target = csv_path_for(source);
    write_csv(&range, &target)?;
    Ok(target)
}

fn write_csv(range: &Range<Data>, target: &Path) -> Result<(), ConversionError> {
    let mut writer = csv::WriterBuilder::new()
        .flexible(false)
        .from_path(target)?;

    for row in range.rows() {
        writer.write_record(row.iter().map(cell_text))?;
    }
    writer.flush()?;
    Ok(())
}

/// Text form of a cell as it should appear in the CSV. Booleans are
/// capitalised the way pandas writes them.
pub fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty | Data::Error(_) => String::new(),
        Data::Bool(true) => "True".to_string(),
        Data::Bool(false) => "False".to_string(),
        Data::DateTime(_) => cell
            .as_datetime()
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| cell.to_string()),
        Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        other => other.to_string(),
    }
}
