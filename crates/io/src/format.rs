// Format selection: explicit choice, then extension, then magic bytes

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sheetstream_engine::{ExcelError, Result};

const OLE_MAGIC: [u8; 4] = [0xD0, 0xCF, 0x11, 0xE0];
const ZIP_MAGIC: [u8; 4] = [b'P', b'K', 0x03, 0x04];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExcelFormat {
    Xls,
    Xlsx,
    Csv,
}

impl ExcelFormat {
    pub fn from_extension(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "xls" => Some(ExcelFormat::Xls),
            "xlsx" | "xlsm" => Some(ExcelFormat::Xlsx),
            "csv" | "tsv" | "txt" => Some(ExcelFormat::Csv),
            _ => None,
        }
    }

    /// Anything that is neither an OLE container nor a zip is treated as text.
    pub fn from_magic(head: &[u8]) -> Self {
        if head.starts_with(&OLE_MAGIC) {
            ExcelFormat::Xls
        } else if head.starts_with(&ZIP_MAGIC) {
            ExcelFormat::Xlsx
        } else {
            ExcelFormat::Csv
        }
    }

    /// Resolve the format of an existing file.
    pub fn detect(path: &Path, explicit: Option<ExcelFormat>) -> Result<Self> {
        if let Some(format) = explicit.or_else(|| ExcelFormat::from_extension(path)) {
            return Ok(format);
        }
        let mut head = [0u8; 4];
        let mut file = File::open(path)?;
        let n = file.read(&mut head)?;
        Ok(ExcelFormat::from_magic(&head[..n]))
    }

    /// Resolve the format of an output path; unknown extensions default to xlsx.
    pub fn for_output(path: &Path, explicit: Option<ExcelFormat>) -> Result<Self> {
        let format = explicit
            .or_else(|| ExcelFormat::from_extension(path))
            .unwrap_or(ExcelFormat::Xlsx);
        if format == ExcelFormat::Xls {
            return Err(ExcelError::config("writing xls is not supported"));
        }
        Ok(format)
    }

    pub fn tag(&self) -> &'static str {
        match self {
            ExcelFormat::Xls => "xls",
            ExcelFormat::Xlsx => "xlsx",
            ExcelFormat::Csv => "csv",
        }
    }
}
