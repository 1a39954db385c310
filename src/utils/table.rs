/// Tab-separated tables exchanged with the external tools: per-sample and
/// global count tables, the samples reference and the depth report.

use std::fs::File;
use std::path::Path;
use std::str::FromStr;

use csv::{Reader, ReaderBuilder, StringRecord, Writer, WriterBuilder};

use crate::config::defs::PipelineError;

/// Reader skipping `#` lines, every row returned as data.
pub fn tsv_reader(path: &Path) -> Result<Reader<File>, PipelineError> {
    ReaderBuilder::new()
        .delimiter(b'\t')
        .comment(Some(b'#'))
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| table_error(path, e))
}

/// Reader whose first line, `#` included, is the header. Rows must all have
/// the header's width.
pub fn tsv_reader_with_header(path: &Path) -> Result<Reader<File>, PipelineError> {
    ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path)
        .map_err(|e| table_error(path, e))
}

pub fn tsv_writer(path: &Path) -> Result<Writer<File>, PipelineError> {
    WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)
        .map_err(|e| table_error(path, e))
}

/// I/O failures stay I/O errors; anything else means the table is malformed.
pub fn table_error(path: &Path, err: csv::Error) -> PipelineError {
    let reason = err.to_string();
    match err.into_kind() {
        csv::ErrorKind::Io(e) => PipelineError::Io(e),
        _ => PipelineError::DataIntegrity(format!("{} is malformed: {}", path.display(), reason)),
    }
}

/// Parses column `idx` of a row.
///
/// # Arguments
///
/// * `path` - Table the row comes from, used in the error.
/// * `record` - Row.
/// * `idx` - Column, 0-based.
pub fn cell<T: FromStr>(path: &Path, record: &StringRecord, idx: usize) -> Result<T, PipelineError> {
    let line = record.position().map(|p| p.line()).unwrap_or(0);
    let raw = record.get(idx).ok_or_else(|| {
        PipelineError::DataIntegrity(format!("{} line {}: missing column {}", path.display(), line, idx + 1))
    })?;
    raw.trim().parse().map_err(|_| {
        PipelineError::DataIntegrity(format!("{} line {}: unreadable value '{}'", path.display(), line, raw))
    })
}
