//! Row codec
//!
//! Decodes a byte stream as header-first, comma-delimited text and encodes
//! rows back to CRLF-terminated lines. Decoding is permissive: bytes are
//! read as UTF-8 (lossy), short records are padded with nulls, and fields
//! beyond the header are dropped. Encoding projects a caller-chosen column
//! list; requested columns missing from a row render blank and row fields
//! outside the list are ignored.

use std::io::Read;

use serde_json::Value;

use crate::error::ValidationError;
use crate::row::{canonical_field, Row};

/// Streaming reader over the data rows of a CSV document.
///
/// The header record is consumed eagerly at construction; iteration yields
/// one [`Row`] per data line with header names as keys and string values.
pub struct RowReader<R: Read> {
    headers: Vec<String>,
    reader: csv::Reader<R>,
    record: csv::ByteRecord,
}

impl<R: Read> RowReader<R> {
    /// Build a reader and decode the header record.
    pub fn new(input: R) -> Result<Self, ValidationError> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(input);
        let headers = reader
            .byte_headers()
            .map_err(|e| ValidationError::new(format!("Unreadable CSV header: {e}")))?
            .iter()
            .map(|f| String::from_utf8_lossy(f).into_owned())
            .collect();
        Ok(Self {
            headers,
            reader,
            record: csv::ByteRecord::new(),
        })
    }

    /// Column names from the header record, in file order.
    pub fn headers(&self) -> &[String] {
        &self.headers
    }
}

impl<R: Read> Iterator for RowReader<R> {
    type Item = Result<Row, csv::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.reader.read_byte_record(&mut self.record) {
            Err(e) => Some(Err(e)),
            Ok(false) => None,
            Ok(true) => {
                let mut row = Row::new();
                for (i, name) in self.headers.iter().enumerate() {
                    let value = match self.record.get(i) {
                        Some(field) => {
                            Value::String(String::from_utf8_lossy(field).into_owned())
                        }
                        None => Value::Null,
                    };
                    row.insert(name.clone(), value);
                }
                Some(Ok(row))
            }
        }
    }
}

/// Encode the header line for the given column list.
pub fn header_line(columns: &[String]) -> String {
    encode_fields(columns.iter().map(|c| c.as_str()))
}

/// Encode one row as a CSV line, projected onto `columns`.
pub fn encode_line(columns: &[String], row: &Row) -> String {
    encode_fields(columns.iter().map(|c| canonical_field(row, c)))
}

fn encode_fields<I, S>(fields: I) -> String
where
    I: Iterator<Item = S>,
    S: AsRef<str>,
{
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::CRLF)
        .from_writer(Vec::new());
    // Writes to an in-memory Vec cannot fail.
    writer
        .write_record(fields.map(|f| f.as_ref().as_bytes().to_vec()))
        .expect("csv record write to Vec");
    writer.flush().expect("csv flush to Vec");
    let buf = writer.into_inner().expect("csv writer owns the buffer");
    String::from_utf8_lossy(&buf).into_owned()
}
