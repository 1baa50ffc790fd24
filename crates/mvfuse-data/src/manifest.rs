//! Comma-separated scan manifest.
//!
//! The first line is a header. Every following line is one scan: column 0 is
//! the quoted image identifier, column 2 the quoted diagnostic label and
//! column 4 the quoted numeric score.

use crate::labels::LabelCatalog;
use mvfuse_core::{FinetuneError, Label, Result, TaskMode};
use std::path::Path;

/// Column holding the image identifier.
const IMAGE_ID_COLUMN: usize = 0;

/// One manifest row, resolved for a specific task.
///
/// Only the label column of the active [`TaskMode`] is kept: the diagnosis
/// column for classification, the score column for regression. The other
/// column is neither stored nor validated, so a regression manifest may carry
/// diagnoses outside the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Image identifier; the image file is `{root}/{image_id}.{ext}`.
    pub image_id: String,
    /// Unquoted label column for the task (diagnosis or score).
    pub raw_label: String,
    /// Mapped label.
    pub label: Label,
}

/// Parsed manifest. Record identity is the position in [`Manifest::records`].
#[derive(Debug, Clone)]
pub struct Manifest {
    records: Vec<Record>,
    mode: TaskMode,
}

impl Manifest {
    /// Read and parse a manifest file.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or any row is malformed or carries an
    /// unmappable label.
    pub fn load(path: &Path, mode: TaskMode) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            FinetuneError::Config(format!(
                "Failed to read manifest {}: {e}",
                path.display()
            ))
        })?;
        let manifest = Self::parse_str(&contents, mode)?;
        tracing::info!(
            path = %path.display(),
            records = manifest.len(),
            mode = %mode,
            "Manifest loaded"
        );
        Ok(manifest)
    }

    /// Parse manifest contents. Labels are mapped eagerly.
    ///
    /// # Errors
    ///
    /// [`FinetuneError::Manifest`] for a row lacking a required column, and
    /// the [`LabelCatalog::map`] errors for bad labels.
    pub fn parse_str(contents: &str, mode: TaskMode) -> Result<Self> {
        let label_column = mode.label_column();
        let mut records = Vec::new();

        // Line numbers are 1-based and include the header.
        for (line_no, line) in contents.lines().enumerate().skip(1) {
            let line = line.trim_end();
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(',').collect();
            let image_id = unquote(field(&fields, IMAGE_ID_COLUMN, line_no + 1)?);
            let raw_label = unquote(field(&fields, label_column, line_no + 1)?);
            let label = LabelCatalog::map(raw_label, mode)?;
            records.push(Record {
                image_id: image_id.to_string(),
                raw_label: raw_label.to_string(),
                label,
            });
        }

        Ok(Self { records, mode })
    }

    /// All records in manifest order.
    #[must_use]
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Consume the manifest, returning its records.
    #[must_use]
    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    /// Task the labels were mapped for.
    #[must_use]
    pub fn mode(&self) -> TaskMode {
        self.mode
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the manifest has no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn field<'a>(fields: &[&'a str], column: usize, line_no: usize) -> Result<&'a str> {
    fields.get(column).copied().ok_or_else(|| {
        FinetuneError::Manifest(format!(
            "line {line_no}: expected at least {} columns, found {}",
            column + 1,
            fields.len()
        ))
    })
}

fn unquote(raw: &str) -> &str {
    raw.trim().trim_matches('"')
}
