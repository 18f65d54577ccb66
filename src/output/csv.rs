//! CSV table writer and reader
//!
//! Files always start with a header row in the table's declared column order,
//! so a table with no rows still produces a readable header-only file. Null and
//! missing values are written as empty fields and read back as null.

use crate::{Record, Value};
use csv::{Reader, Writer};
use std::borrow::Cow;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use tracing::{debug, info};

use super::{OutputError, OutputResult, OutputWriter, RecordsWriter};

const DEFAULT_BUFFER_SIZE: usize = 64 * 1024; // 64KB buffer

/// Flush interval for the writer (flush every N rows)
const FLUSH_INTERVAL: u64 = 10_000;

/// CSV writer for one table
pub struct CsvTableWriter {
    writer: Writer<BufWriter<File>>,
    columns: Vec<String>,
    rows_written: u64,
}

impl CsvTableWriter {
    /// Create the file (and parent directories) and write the header row
    pub fn new<P: AsRef<Path>>(path: P, columns: &[String]) -> OutputResult<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), columns = columns.len(), "Creating CSV writer");

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| OutputError::IoError(format!("Failed to create directory: {e}")))?;
        }

        let file = File::create(path)
            .map_err(|e| OutputError::IoError(format!("Failed to create file: {e}")))?;

        let buf_writer = BufWriter::with_capacity(DEFAULT_BUFFER_SIZE, file);
        let mut writer = Writer::from_writer(buf_writer);
        writer
            .write_record(columns)
            .map_err(|e| OutputError::CsvError(format!("Failed to write header: {e}")))?;

        Ok(Self {
            writer,
            columns: columns.to_vec(),
            rows_written: 0,
        })
    }
}

impl RecordsWriter for CsvTableWriter {
    fn write_record(&mut self, record: &Record) -> OutputResult<()> {
        let fields = self.columns.iter().map(|c| render_value(record.get(c)));
        let fields: Vec<Cow<'_, str>> = fields.collect();

        self.writer
            .write_record(fields.iter().map(|f| f.as_bytes()))
            .map_err(|e| OutputError::CsvError(format!("Failed to write row: {e}")))?;

        self.rows_written += 1;
        if self.rows_written % FLUSH_INTERVAL == 0 {
            self.flush()?;
            debug!(rows = self.rows_written, "CSV progress");
        }
        Ok(())
    }
}

impl OutputWriter for CsvTableWriter {
    fn flush(&mut self) -> OutputResult<()> {
        self.writer
            .flush()
            .map_err(|e| OutputError::FlushError(format!("Failed to flush: {e}")))
    }

    fn close(mut self) -> OutputResult<u64> {
        self.flush()?;

        let buf_writer = self
            .writer
            .into_inner()
            .map_err(|e| OutputError::IoError(format!("Failed to get inner writer: {e}")))?;

        let file = buf_writer
            .into_inner()
            .map_err(|e| OutputError::IoError(format!("Failed to get file handle: {e}")))?;

        file.sync_all()
            .map_err(|e| OutputError::IoError(format!("Failed to sync file: {e}")))?;

        let bytes = file
            .metadata()
            .map_err(|e| OutputError::IoError(format!("Failed to stat file: {e}")))?
            .len();

        debug!(rows = self.rows_written, bytes, "CSV writer closed");
        Ok(bytes)
    }
}

/// Render a raw value as a CSV field
fn render_value(value: Option<&Value>) -> Cow<'_, str> {
    match value {
        None | Some(Value::Null) => Cow::Borrowed(""),
        Some(Value::String(s)) => Cow::Borrowed(s.as_str()),
        Some(Value::Bool(b)) => Cow::Borrowed(if *b { "true" } else { "false" }),
        Some(Value::Number(n)) => Cow::Owned(n.to_string()),
        Some(other) => Cow::Owned(other.to_string()),
    }
}

/// Write a whole table; returns the file size in bytes
pub fn write_table(path: &Path, columns: &[String], rows: &[Record]) -> OutputResult<u64> {
    let mut writer = CsvTableWriter::new(path, columns)?;
    writer.write_records(rows)?;
    let bytes = writer.close()?;
    info!(
        path = %path.display(),
        rows = rows.len(),
        bytes,
        "Wrote table"
    );
    Ok(bytes)
}

/// A table read back from CSV
#[derive(Debug, Clone, Default)]
pub struct CsvTable {
    /// Header row
    pub columns: Vec<String>,
    /// Rows; empty fields are null, everything else a string
    pub rows: Vec<Record>,
}

/// Read a CSV file written by [`CsvTableWriter`]
pub fn read_table(path: &Path) -> OutputResult<CsvTable> {
    let mut reader = Reader::from_path(path)
        .map_err(|e| OutputError::IoError(format!("Failed to open {}: {e}", path.display())))?;

    let columns: Vec<String> = reader
        .headers()
        .map_err(|e| OutputError::CsvError(format!("Failed to read header: {e}")))?
        .iter()
        .map(str::to_string)
        .collect();

    let mut rows = Vec::new();
    for result in reader.records() {
        let record =
            result.map_err(|e| OutputError::CsvError(format!("Failed to read row: {e}")))?;
        let row: Record = columns
            .iter()
            .zip(record.iter())
            .map(|(column, field)| {
                let value = if field.is_empty() {
                    Value::Null
                } else {
                    Value::String(field.to_string())
                };
                (column.clone(), value)
            })
            .collect();
        rows.push(row);
    }

    debug!(path = %path.display(), rows = rows.len(), "Read table");
    Ok(CsvTable { columns, rows })
}
