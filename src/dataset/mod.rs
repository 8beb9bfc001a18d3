//! Dataset sources
//!
//! Only the coordinator loads the dataset. Sources skip malformed records with
//! a warning and report how many were skipped; an unreadable source is fatal.

pub mod csv;
pub mod synthetic;

pub use self::csv::{ColumnSelector, CsvColumnSource};

use crate::Result;

/// Values loaded by a source
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub values: Vec<f64>,
    /// Records dropped because they could not be parsed
    pub skipped: u64,
    /// Where the values came from, for reports
    pub description: String,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Something the coordinator can load a dataset from
pub trait DatasetSource: Send + Sync {
    fn load(&self) -> Result<Dataset>;
}

/// Fixed values held in memory
#[derive(Debug, Clone)]
pub struct InMemorySource {
    values: Vec<f64>,
}

impl InMemorySource {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }
}

impl DatasetSource for InMemorySource {
    fn load(&self) -> Result<Dataset> {
        Ok(Dataset {
            values: self.values.clone(),
            skipped: 0,
            description: format!("{} in-memory values", self.values.len()),
        })
    }
}
