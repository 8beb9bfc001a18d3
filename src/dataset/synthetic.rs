//! Synthetic datasets
//!
//! Writes CSV files shaped like the station exports: the reading sits in a
//! chosen column and the other columns are filler. Values are Gaussian, clamped
//! at zero, and fully determined by the seed.

use crate::Result;
use anyhow::Context;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Shape and distribution of a generated dataset
#[derive(Debug, Clone)]
pub struct SyntheticSpec {
    pub rows: usize,
    /// Zero-based column holding the value
    pub column: usize,
    pub mean: f64,
    pub std_dev: f64,
    pub seed: u64,
}

impl Default for SyntheticSpec {
    fn default() -> Self {
        Self {
            rows: 10_000,
            column: super::csv::DEFAULT_COLUMN,
            mean: 25.0,
            std_dev: 10.0,
            seed: 42,
        }
    }
}

/// Generate the values of `spec` without writing them
pub fn generate_values(spec: &SyntheticSpec) -> Result<Vec<f64>> {
    let normal = Normal::new(spec.mean, spec.std_dev)
        .with_context(|| format!("Invalid distribution: mean={}, std_dev={}", spec.mean, spec.std_dev))?;
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(spec.seed);
    Ok((0..spec.rows).map(|_| normal.sample(&mut rng).max(0.0)).collect())
}

/// Write a CSV dataset to `path`, returning the values written
pub fn write_csv(path: &Path, spec: &SyntheticSpec) -> Result<Vec<f64>> {
    let values = generate_values(spec)?;

    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut out = BufWriter::new(file);

    let header: Vec<String> = (0..=spec.column)
        .map(|i| match i {
            i if i == spec.column => "value".to_string(),
            0 => "row".to_string(),
            i => format!("field_{}", i),
        })
        .collect();
    writeln!(out, "{}", header.join(","))?;

    for (row, value) in values.iter().enumerate() {
        for i in 0..spec.column {
            if i == 0 {
                write!(out, "{},", row)?;
            } else {
                write!(out, ",")?;
            }
        }
        writeln!(out, "{}", value)?;
    }
    out.flush().with_context(|| format!("Failed to write {}", path.display()))?;

    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{ColumnSelector, CsvColumnSource, DatasetSource};
    use tempfile::TempDir;

    #[test]
    fn test_same_seed_same_values() {
        let spec = SyntheticSpec {
            rows: 100,
            ..SyntheticSpec::default()
        };
        assert_eq!(generate_values(&spec).unwrap(), generate_values(&spec).unwrap());

        let other = SyntheticSpec { seed: 7, ..spec.clone() };
        assert_ne!(generate_values(&spec).unwrap(), generate_values(&other).unwrap());
    }

    #[test]
    fn test_values_are_non_negative() {
        let spec = SyntheticSpec {
            rows: 1000,
            mean: 0.0,
            std_dev: 5.0,
            ..SyntheticSpec::default()
        };
        assert!(generate_values(&spec).unwrap().iter().all(|v| *v >= 0.0));
    }

    #[test]
    fn test_written_file_loads_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("synthetic.csv");
        let spec = SyntheticSpec {
            rows: 50,
            ..SyntheticSpec::default()
        };

        let written = write_csv(&path, &spec).unwrap();
        let loaded = CsvColumnSource::new(&path, ColumnSelector::default()).load().unwrap();
        assert_eq!(loaded.values, written);
        assert_eq!(loaded.skipped, 0);

        let by_name = CsvColumnSource::new(&path, ColumnSelector::Name("value".to_string()))
            .load()
            .unwrap();
        assert_eq!(by_name.values.len(), 50);
    }

    #[test]
    fn test_value_in_first_column() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("narrow.csv");
        let spec = SyntheticSpec {
            rows: 3,
            column: 0,
            ..SyntheticSpec::default()
        };

        write_csv(&path, &spec).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("value\n"));
        assert_eq!(contents.lines().count(), 4);
    }

    #[test]
    fn test_negative_std_dev_is_rejected() {
        let spec = SyntheticSpec {
            std_dev: -1.0,
            ..SyntheticSpec::default()
        };
        assert!(generate_values(&spec).is_err());
    }
}
