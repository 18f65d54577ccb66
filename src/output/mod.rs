//! Table output writers and file layout

use crate::Record;

pub mod csv;
pub mod path;

pub use self::csv::{read_table, write_table, CsvTable, CsvTableWriter};
pub use path::OutputLayout;

/// Output writer errors
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// CSV write or read error
    #[error("CSV error: {0}")]
    CsvError(String),

    /// Buffer flush error
    #[error("flush error: {0}")]
    FlushError(String),
}

/// Result type for output operations
pub type OutputResult<T> = Result<T, OutputError>;

/// Generic output writer trait
pub trait OutputWriter {
    /// Flush any buffered data to disk
    fn flush(&mut self) -> OutputResult<()>;

    /// Close the writer, sync to disk and return the file size in bytes
    fn close(self) -> OutputResult<u64>;
}

/// Writer for rows of a table with a fixed column order
pub trait RecordsWriter: OutputWriter {
    /// Write a single row; columns absent from the row are written empty
    fn write_record(&mut self, record: &Record) -> OutputResult<()>;

    /// Write multiple rows at once
    fn write_records(&mut self, records: &[Record]) -> OutputResult<()> {
        for record in records {
            self.write_record(record)?;
        }
        Ok(())
    }
}
