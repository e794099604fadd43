// Error taxonomy shared by the engine and the format adapters

use std::fmt;

use thiserror::Error;

use crate::cell::{CellData, CellKind};
use crate::record::TargetType;

/// Boxed error used for converter and listener failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = ExcelError> = std::result::Result<T, E>;

/// How an adapter-level failure should be treated by the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Malformed-but-recoverable end of data: the current sheet ends gracefully.
    Benign,
    /// Unreadable container: propagated to the caller.
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Benign => f.write_str("benign"),
            Severity::Fatal => f.write_str("fatal"),
        }
    }
}

/// A converter failed while binding one cell.
#[derive(Debug, Error)]
#[error("error at row {row}, column {column}: convert {cell} to {target} failed: {source}")]
pub struct DataConvertError {
    pub row: usize,
    pub column: usize,
    pub cell: Box<CellData>,
    pub target: TargetType,
    #[source]
    pub source: BoxError,
}

#[derive(Debug, Error)]
pub enum ExcelError {
    /// Missing required argument, unsupported operation, bad option.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("cannot read sheet {sheet_no} repeatedly in one pass")]
    DuplicateSheetRead { sheet_no: usize },

    #[error("error at row {row}, column {column}: converter not found, convert {kind} to {target}")]
    ConverterNotFound {
        row: usize,
        column: usize,
        kind: CellKind,
        target: TargetType,
    },

    #[error(transparent)]
    DataConvert(#[from] DataConvertError),

    /// Every cell converted but the record rejected the values.
    #[error("error at row {row}: building record failed: {source}")]
    Bind {
        row: usize,
        #[source]
        source: BoxError,
    },

    #[error("{severity} adapter error: {message}")]
    Adapter { severity: Severity, message: String },

    #[error("listener failed: {0}")]
    Listener(#[source] BoxError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Raised after every release step ran; carries the first failure.
    #[error("release failed ({failures} step(s)); first failure: {first}")]
    Teardown {
        #[source]
        first: Box<ExcelError>,
        failures: usize,
    },
}

impl ExcelError {
    pub fn config(message: impl Into<String>) -> Self {
        ExcelError::Config(message.into())
    }

    pub fn benign(message: impl Into<String>) -> Self {
        ExcelError::Adapter {
            severity: Severity::Benign,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        ExcelError::Adapter {
            severity: Severity::Fatal,
            message: message.into(),
        }
    }

    /// Wrap an arbitrary error raised from user listener code.
    pub fn listener<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        ExcelError::Listener(err.into())
    }

    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            ExcelError::Adapter {
                severity: Severity::Benign,
                ..
            }
        )
    }

    /// Conversion errors are the only ones a listener may swallow.
    pub fn is_conversion(&self) -> bool {
        matches!(
            self,
            ExcelError::ConverterNotFound { .. }
                | ExcelError::DataConvert(_)
                | ExcelError::Bind { .. }
        )
    }

    /// Row and column of a conversion failure, if any.
    pub fn position(&self) -> Option<(usize, usize)> {
        match self {
            ExcelError::ConverterNotFound { row, column, .. } => Some((*row, *column)),
            ExcelError::DataConvert(e) => Some((e.row, e.column)),
            _ => None,
        }
    }
}

/// Runs every release step and remembers the first failure.
///
/// Each step is attempted regardless of earlier failures; `finish` surfaces
/// the first error only after all steps ran.
#[derive(Debug, Default)]
pub struct ReleaseGuard {
    first: Option<ExcelError>,
    failures: usize,
}

impl ReleaseGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempt<F>(&mut self, step: &str, f: F)
    where
        F: FnOnce() -> Result<()>,
    {
        match f() {
            Ok(()) => {}
            // A nested guard already logged its steps; fold its count in
            Err(ExcelError::Teardown { first, failures }) => self.record(*first, failures),
            Err(e) => {
                tracing::warn!(step, error = %e, "release step failed");
                self.record(e, 1);
            }
        }
    }

    fn record(&mut self, err: ExcelError, failures: usize) {
        self.failures += failures;
        if self.first.is_none() {
            self.first = Some(err);
        }
    }

    pub fn finish(self) -> Result<()> {
        match self.first {
            None => Ok(()),
            Some(first) => Err(ExcelError::Teardown {
                first: Box::new(first),
                failures: self.failures,
            }),
        }
    }
}
