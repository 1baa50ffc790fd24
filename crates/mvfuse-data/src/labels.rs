//! Mapping from raw manifest label strings to model targets.

use mvfuse_core::{FinetuneError, Label, Result, TaskMode};

/// Diagnostic class names indexed by class code.
const CLASS_NAMES: [&str; 3] = ["CN", "AD", "MCI"];

/// Pure mapping from raw manifest labels to [`Label`]s.
pub struct LabelCatalog;

impl LabelCatalog {
    /// Map a raw (already unquoted) manifest label for the given task.
    ///
    /// Classification uses the exact-match table `CN → 0`, `AD → 1`,
    /// `MCI → 2`. Regression parses the string as a float.
    ///
    /// # Errors
    ///
    /// [`FinetuneError::UnknownLabel`] for a classification label outside the
    /// table, [`FinetuneError::LabelParse`] for a non-numeric regression label.
    pub fn map(raw: &str, mode: TaskMode) -> Result<Label> {
        match mode {
            TaskMode::Classification => Self::class_code(raw)
                .map(Label::Class)
                .ok_or_else(|| FinetuneError::UnknownLabel {
                    label: raw.to_string(),
                }),
            TaskMode::Regression => raw
                .trim()
                .parse::<f32>()
                .map(Label::Score)
                .map_err(|_| FinetuneError::LabelParse {
                    raw: raw.to_string(),
                }),
        }
    }

    /// Class code of a diagnostic label, if it is known.
    #[must_use]
    pub fn class_code(raw: &str) -> Option<u32> {
        match raw {
            "CN" => Some(0),
            "AD" => Some(1),
            "MCI" => Some(2),
            _ => None,
        }
    }

    /// Diagnostic name of a class code.
    #[must_use]
    pub fn class_name(code: u32) -> Option<&'static str> {
        CLASS_NAMES.get(code as usize).copied()
    }
}
