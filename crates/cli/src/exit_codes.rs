//! CLI Exit Code Registry
//!
//! Exit codes are part of the shell contract; scripts rely on them.
//!
//! | Code | Meaning                                           |
//! |------|---------------------------------------------------|
//! | 0    | Success                                           |
//! | 1    | General error (listener, teardown)                |
//! | 2    | Usage error (bad args, unknown sheet, bad option) |
//! | 3    | I/O error (missing file, unwritable output)       |
//! | 4    | Unreadable or malformed input                     |
//! | 5    | A cell could not be converted or bound            |

use sheetstream_engine::ExcelError;

/// Success - command completed without errors.
pub const EXIT_SUCCESS: u8 = 0;

/// General error - unspecified failure.
pub const EXIT_ERROR: u8 = 1;

/// Usage error - bad arguments, missing required options.
pub const EXIT_USAGE: u8 = 2;

/// File could not be opened, read or written.
pub const EXIT_IO: u8 = 3;

/// Input is not a workbook this tool can read.
pub const EXIT_FORMAT: u8 = 4;

/// A cell value did not fit its target.
pub const EXIT_CONVERT: u8 = 5;

/// Map an engine error to its exit code.
pub fn excel_exit_code(err: &ExcelError) -> u8 {
    match err {
        ExcelError::Config(_) | ExcelError::DuplicateSheetRead { .. } => EXIT_USAGE,
        ExcelError::Io(_) => EXIT_IO,
        ExcelError::Adapter { .. } => EXIT_FORMAT,
        ExcelError::ConverterNotFound { .. } | ExcelError::DataConvert(_) | ExcelError::Bind { .. } => {
            EXIT_CONVERT
        }
        ExcelError::Teardown { first, .. } => excel_exit_code(first),
        ExcelError::Listener(_) => EXIT_ERROR,
    }
}
