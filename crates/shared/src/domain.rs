use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, Failure};

/// Identifier the analysis service assigns to an uploaded dataset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub String);

impl FileId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reconstruction-error percentile above which a record is flagged as an outlier.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct ThresholdPercentile(f64);

impl ThresholdPercentile {
    pub const DEFAULT: Self = Self(95.0);

    /// Accepts values strictly between 0 and 100.
    pub fn new(value: f64) -> Result<Self, Failure> {
        if value.is_finite() && value > 0.0 && value < 100.0 {
            Ok(Self(value))
        } else {
            Err(Failure::new(
                ErrorKind::Validation,
                format!("threshold percentile must be between 0 and 100 (exclusive), got {value}"),
            ))
        }
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

impl Default for ThresholdPercentile {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for ThresholdPercentile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
