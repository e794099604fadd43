//! Sink contract between the write pipeline and format adapters.
//!
//! Sheets are created once and addressed by handle. Cells arrive fully
//! converted and decorated; the sink only has to lay them out.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::cell::{CellRange, WriteCellData};
use crate::error::{ExcelError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SheetHandle(pub usize);

/// What a finished sink produced.
#[derive(Debug)]
pub enum SinkOutput {
    File(PathBuf),
    Bytes(Vec<u8>),
    Memory(MemoryWorkbook),
}

impl SinkOutput {
    pub fn into_memory(self) -> Option<MemoryWorkbook> {
        match self {
            SinkOutput::Memory(m) => Some(m),
            _ => None,
        }
    }
}

pub trait SheetSink {
    /// Short format tag (`xlsx`, `csv`, `memory`) that handlers may test.
    fn format(&self) -> &'static str;

    fn create_sheet(&mut self, sheet_no: usize, name: &str) -> Result<SheetHandle>;

    fn create_row(&mut self, _sheet: SheetHandle, _row: usize) -> Result<()> {
        Ok(())
    }

    fn write_cell(&mut self, sheet: SheetHandle, row: usize, column: usize, cell: &WriteCellData) -> Result<()>;

    fn merge(&mut self, sheet: SheetHandle, range: CellRange) -> Result<()>;

    fn set_column_width(&mut self, sheet: SheetHandle, column: usize, width: f64) -> Result<()>;

    fn set_row_height(&mut self, sheet: SheetHandle, row: usize, height: f64) -> Result<()>;

    /// Whether serial dates may count from 1904. Formats that always
    /// declare the 1900 epoch return false and get 1900 serials.
    fn supports_1904(&self) -> bool {
        true
    }

    /// Used-range hint; formats without one ignore it.
    fn set_dimension(&mut self, _sheet: SheetHandle, _range: CellRange) -> Result<()> {
        Ok(())
    }

    /// Flush everything and hand over the result.
    fn finish(&mut self) -> Result<SinkOutput>;

    /// Drop everything written so far.
    fn discard(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemorySheet {
    pub sheet_no: usize,
    pub name: String,
    pub rows: BTreeMap<usize, BTreeMap<usize, WriteCellData>>,
    pub merges: Vec<CellRange>,
    pub column_widths: BTreeMap<usize, f64>,
    pub row_heights: BTreeMap<usize, f64>,
    pub dimension: Option<CellRange>,
}

impl MemorySheet {
    pub fn cell(&self, row: usize, column: usize) -> Option<&WriteCellData> {
        self.rows.get(&row).and_then(|r| r.get(&column))
    }

    /// Text of a cell, empty when absent.
    pub fn text(&self, row: usize, column: usize) -> String {
        self.cell(row, column)
            .map(|c| c.value.to_string())
            .unwrap_or_default()
    }

    pub fn last_row(&self) -> Option<usize> {
        self.rows.keys().next_back().copied()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryWorkbook {
    pub sheets: Vec<MemorySheet>,
}

impl MemoryWorkbook {
    pub fn sheet(&self, name: &str) -> Option<&MemorySheet> {
        self.sheets.iter().find(|s| s.name == name)
    }
}

/// Keeps everything in memory. Used for previews and tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    format: &'static str,
    workbook: MemoryWorkbook,
    finished: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_format("memory")
    }

    /// Report another format tag, so format-specific handlers engage.
    pub fn with_format(format: &'static str) -> Self {
        MemorySink {
            format,
            workbook: MemoryWorkbook::default(),
            finished: false,
        }
    }

    pub fn workbook(&self) -> &MemoryWorkbook {
        &self.workbook
    }

    fn sheet_mut(&mut self, sheet: SheetHandle) -> Result<&mut MemorySheet> {
        if self.finished {
            return Err(ExcelError::config("sink already finished"));
        }
        self.workbook
            .sheets
            .get_mut(sheet.0)
            .ok_or_else(|| ExcelError::config(format!("unknown sheet handle {}", sheet.0)))
    }
}

impl SheetSink for MemorySink {
    fn format(&self) -> &'static str {
        self.format
    }

    fn create_sheet(&mut self, sheet_no: usize, name: &str) -> Result<SheetHandle> {
        if self.workbook.sheets.iter().any(|s| s.name == name) {
            return Err(ExcelError::config(format!("sheet '{}' already exists", name)));
        }
        self.workbook.sheets.push(MemorySheet {
            sheet_no,
            name: name.to_string(),
            ..Default::default()
        });
        Ok(SheetHandle(self.workbook.sheets.len() - 1))
    }

    fn create_row(&mut self, sheet: SheetHandle, row: usize) -> Result<()> {
        self.sheet_mut(sheet)?.rows.entry(row).or_default();
        Ok(())
    }

    fn write_cell(&mut self, sheet: SheetHandle, row: usize, column: usize, cell: &WriteCellData) -> Result<()> {
        self.sheet_mut(sheet)?
            .rows
            .entry(row)
            .or_default()
            .insert(column, cell.clone());
        Ok(())
    }

    fn merge(&mut self, sheet: SheetHandle, range: CellRange) -> Result<()> {
        self.sheet_mut(sheet)?.merges.push(range);
        Ok(())
    }

    fn set_column_width(&mut self, sheet: SheetHandle, column: usize, width: f64) -> Result<()> {
        self.sheet_mut(sheet)?.column_widths.insert(column, width);
        Ok(())
    }

    fn set_row_height(&mut self, sheet: SheetHandle, row: usize, height: f64) -> Result<()> {
        self.sheet_mut(sheet)?.row_heights.insert(row, height);
        Ok(())
    }

    fn set_dimension(&mut self, sheet: SheetHandle, range: CellRange) -> Result<()> {
        self.sheet_mut(sheet)?.dimension = Some(range);
        Ok(())
    }

    fn finish(&mut self) -> Result<SinkOutput> {
        self.finished = true;
        Ok(SinkOutput::Memory(std::mem::take(&mut self.workbook)))
    }

    fn discard(&mut self) -> Result<()> {
        self.finished = true;
        self.workbook = MemoryWorkbook::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_layout() {
        let mut sink = MemorySink::new();
        let sheet = sink.create_sheet(0, "S").unwrap();
        sink.write_cell(sheet, 2, 1, &WriteCellData::string("x")).unwrap();
        sink.merge(sheet, CellRange::new(0, 1, 0, 0)).unwrap();
        let wb = sink.finish().unwrap().into_memory().unwrap();
        let s = wb.sheet("S").unwrap();
        assert_eq!(s.text(2, 1), "x");
        assert_eq!(s.text(0, 0), "");
        assert_eq!(s.merges.len(), 1);
        assert_eq!(s.last_row(), Some(2));
    }

    #[test]
    fn test_duplicate_sheet_name_rejected() {
        let mut sink = MemorySink::new();
        sink.create_sheet(0, "S").unwrap();
        assert!(sink.create_sheet(1, "S").is_err());
    }

    #[test]
    fn test_write_after_finish_rejected() {
        let mut sink = MemorySink::new();
        let sheet = sink.create_sheet(0, "S").unwrap();
        sink.finish().unwrap();
        assert!(sink.write_cell(sheet, 0, 0, &WriteCellData::empty()).is_err());
    }
}
