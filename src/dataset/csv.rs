//! Single-column CSV source
//!
//! Reads one numeric column from a delimited text file. Fields are split on the
//! delimiter without quote handling, which is all the air-quality exports this
//! tool targets need.

use crate::dataset::{Dataset, DatasetSource};
use crate::Result;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::str::FromStr;

/// Zero-based column of the PM10 reading in the station exports
pub const DEFAULT_COLUMN: usize = 17;

/// Which column holds the values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnSelector {
    /// Zero-based field index
    Index(usize),
    /// Header name (requires a header row)
    Name(String),
}

impl Default for ColumnSelector {
    fn default() -> Self {
        ColumnSelector::Index(DEFAULT_COLUMN)
    }
}

impl FromStr for ColumnSelector {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.trim().parse::<usize>() {
            Ok(index) => ColumnSelector::Index(index),
            Err(_) => ColumnSelector::Name(s.trim().to_string()),
        })
    }
}

impl fmt::Display for ColumnSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnSelector::Index(index) => write!(f, "#{}", index),
            ColumnSelector::Name(name) => write!(f, "'{}'", name),
        }
    }
}

/// Loads one column of a CSV file
#[derive(Debug, Clone)]
pub struct CsvColumnSource {
    pub path: PathBuf,
    pub column: ColumnSelector,
    pub has_header: bool,
    pub delimiter: char,
}

impl CsvColumnSource {
    pub fn new(path: impl Into<PathBuf>, column: ColumnSelector) -> Self {
        Self {
            path: path.into(),
            column,
            has_header: true,
            delimiter: ',',
        }
    }

    pub fn with_header(mut self, has_header: bool) -> Self {
        self.has_header = has_header;
        self
    }

    pub fn with_delimiter(mut self, delimiter: char) -> Self {
        self.delimiter = delimiter;
        self
    }

    fn resolve_column(&self, header: Option<&str>) -> Result<usize> {
        match (&self.column, header) {
            (ColumnSelector::Index(index), _) => Ok(*index),
            (ColumnSelector::Name(name), Some(header)) => header
                .split(self.delimiter)
                .position(|field| field.trim() == name)
                .with_context(|| format!("Column '{}' not found in header of {}", name, self.path.display())),
            (ColumnSelector::Name(name), None) => anyhow::bail!(
                "Column '{}' selected by name but {} is read without a header",
                name,
                self.path.display()
            ),
        }
    }
}

impl DatasetSource for CsvColumnSource {
    fn load(&self) -> Result<Dataset> {
        let file = File::open(&self.path)
            .with_context(|| format!("Failed to open dataset {}", self.path.display()))?;
        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();

        let header = if self.has_header {
            read_record(&mut reader, &mut buf)
                .with_context(|| format!("Failed to read header of {}", self.path.display()))?
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
        } else {
            None
        };
        let mut line_no = if self.has_header { 1 } else { 0 };
        let column = self.resolve_column(header.as_deref())?;

        let mut values = Vec::new();
        let mut skipped = 0u64;

        loop {
            line_no += 1;
            let bytes = match read_record(&mut reader, &mut buf)
                .with_context(|| format!("Failed to read line {} of {}", line_no, self.path.display()))?
            {
                Some(bytes) => bytes,
                None => break,
            };

            let parsed = std::str::from_utf8(bytes)
                .map_err(|_| "record is not valid UTF-8".to_string())
                .and_then(|line| {
                    if line.trim().is_empty() {
                        Ok(None)
                    } else {
                        parse_field(line, self.delimiter, column).map(Some)
                    }
                });

            match parsed {
                Ok(Some(value)) => values.push(value),
                Ok(None) => {}
                Err(reason) => {
                    tracing::warn!("Skipping line {} of {}: {}", line_no, self.path.display(), reason);
                    skipped += 1;
                }
            }
        }

        tracing::debug!(
            path = %self.path.display(),
            column,
            loaded = values.len(),
            skipped,
            "Dataset loaded"
        );

        Ok(Dataset {
            description: format!("{} column {}", self.path.display(), self.column),
            values,
            skipped,
        })
    }
}

/// Read one record as raw bytes, without its line terminator
fn read_record<'a>(reader: &mut impl BufRead, buf: &'a mut Vec<u8>) -> std::io::Result<Option<&'a [u8]>> {
    buf.clear();
    if reader.read_until(b'\n', buf)? == 0 {
        return Ok(None);
    }
    let mut end = buf.len();
    if buf[..end].ends_with(b"\n") {
        end -= 1;
    }
    if buf[..end].ends_with(b"\r") {
        end -= 1;
    }
    Ok(Some(&buf[..end]))
}

/// Extract and parse one field of a record
fn parse_field(line: &str, delimiter: char, column: usize) -> std::result::Result<f64, String> {
    let field = line
        .split(delimiter)
        .nth(column)
        .ok_or_else(|| format!("record has no column {}", column))?
        .trim();

    let value = field
        .parse::<f64>()
        .map_err(|_| format!("could not convert value to double: '{}'", field))?;
    if !value.is_finite() {
        return Err(format!("value is not finite: '{}'", field));
    }
    Ok(value)
}
