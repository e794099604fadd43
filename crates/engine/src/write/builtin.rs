//! Handlers shipped with the engine: default head style, merges, column
//! widths, row heights, hex escaping and the used-range hint.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::cell::{CellRange, CellValue};
use crate::error::{ExcelError, Result};
use crate::style::{Alignment, BorderStyle, CellStyle, Font, VerticalAlignment};
use crate::write::handler::{CellHookContext, RowHookContext, SheetHookContext, WriteHandler};
use crate::write::sink::SheetHandle;

/// Order of [`DefaultStyle`]; runs before every other style.
pub const DEFAULT_STYLE_ORDER: i32 = -70_000;
/// Order of user style strategies.
pub const DEFINE_STYLE_ORDER: i32 = -50_000;

/// Widest column a width strategy will set, in characters.
pub const MAX_COLUMN_WIDTH: usize = 255;

/// Base head style: bold, grey fill, thin border, centred and wrapped.
/// Applied when the cell is created so later styles layer over it.
#[derive(Debug, Clone)]
pub struct DefaultStyle {
    head: CellStyle,
}

impl DefaultStyle {
    pub fn new() -> Self {
        let mut head = CellStyle::new()
            .with_font(Font {
                size: Some(14.0),
                bold: true,
                ..Default::default()
            })
            .with_fill(0xC0C0C0)
            .with_border(BorderStyle::Thin)
            .with_alignment(Alignment::Center, VerticalAlignment::Middle);
        head.wrap = Some(true);
        DefaultStyle { head }
    }
}

impl Default for DefaultStyle {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteHandler for DefaultStyle {
    fn order(&self) -> i32 {
        DEFAULT_STYLE_ORDER
    }

    fn after_cell_create(&self, ctx: &mut CellHookContext<'_>) -> Result<()> {
        if ctx.position.is_head {
            ctx.cell.merge_style(&self.head);
        }
        Ok(())
    }
}

/// One style for head cells; content rows cycle through `contents`.
#[derive(Debug, Clone, Default)]
pub struct HorizontalCellStyleStrategy {
    pub head: Option<CellStyle>,
    pub contents: Vec<CellStyle>,
}

impl HorizontalCellStyleStrategy {
    pub fn new(head: Option<CellStyle>, contents: Vec<CellStyle>) -> Self {
        HorizontalCellStyleStrategy { head, contents }
    }
}

impl WriteHandler for HorizontalCellStyleStrategy {
    fn order(&self) -> i32 {
        DEFINE_STYLE_ORDER
    }

    fn after_cell_dispose(&self, ctx: &mut CellHookContext<'_>) -> Result<()> {
        let style = if ctx.position.is_head {
            self.head.as_ref()
        } else if self.contents.is_empty() {
            None
        } else {
            let row = ctx.position.relative_row_index.unwrap_or(0);
            self.contents.get(row % self.contents.len())
        };
        if let Some(style) = style {
            ctx.cell.merge_style(style);
        }
        Ok(())
    }
}

/// Escapes literal `_xHHHH_` sequences in xlsx strings so readers do not
/// decode them as character references.
#[derive(Debug, Clone, Copy, Default)]
pub struct EscapeHexCellWriteHandler;

impl WriteHandler for EscapeHexCellWriteHandler {
    fn after_cell_data_converted(&self, ctx: &mut CellHookContext<'_>) -> Result<()> {
        if ctx.sink.format() != "xlsx" {
            return Ok(());
        }
        if let CellValue::String(s) = &mut ctx.cell.value {
            if let Some(escaped) = escape_hex(s) {
                *s = escaped;
            }
        }
        Ok(())
    }
}

/// `None` when nothing needed escaping.
pub fn escape_hex(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    if bytes.len() < 7 {
        return None;
    }
    let mut out: Option<String> = None;
    let mut last = 0;
    let mut i = 0;
    while i + 6 < bytes.len() {
        let is_ref = bytes[i] == b'_'
            && bytes[i + 1] == b'x'
            && bytes[i + 6] == b'_'
            && bytes[i + 2..i + 6].iter().all(u8::is_ascii_hexdigit);
        if is_ref {
            let buf = out.get_or_insert_with(|| String::with_capacity(text.len() + 16));
            buf.push_str(&text[last..i]);
            buf.push_str("_x005F_x");
            buf.push_str(&text[i + 2..i + 6]);
            buf.push('_');
            i += 7;
            last = i;
        } else {
            i += 1;
        }
    }
    out.map(|mut buf| {
        buf.push_str(&text[last..]);
        buf
    })
}

/// Merges a block of `each_row` rows by `column_extend` columns starting at
/// every `each_row`-th data row.
#[derive(Debug, Clone, Copy)]
pub struct LoopMergeStrategy {
    each_row: usize,
    column_extend: usize,
    column_index: usize,
}

impl LoopMergeStrategy {
    pub fn new(each_row: usize, column_extend: usize, column_index: usize) -> Result<Self> {
        if each_row < 1 || column_extend < 1 {
            return Err(ExcelError::config("loop merge needs each_row and column_extend of at least 1"));
        }
        if each_row == 1 && column_extend == 1 {
            return Err(ExcelError::config("loop merge of a single cell"));
        }
        Ok(LoopMergeStrategy {
            each_row,
            column_extend,
            column_index,
        })
    }
}

impl WriteHandler for LoopMergeStrategy {
    fn after_row_dispose(&self, ctx: &mut RowHookContext<'_>) -> Result<()> {
        let Some(relative) = ctx.position.relative_row_index else {
            return Ok(());
        };
        if ctx.position.is_head || relative % self.each_row != 0 {
            return Ok(());
        }
        let row = ctx.position.row_index;
        ctx.sink.merge(
            ctx.position.sheet,
            CellRange::new(
                row,
                row + self.each_row - 1,
                self.column_index,
                self.column_index + self.column_extend - 1,
            ),
        )
    }
}

/// Merges one fixed region when the sheet is created.
#[derive(Debug, Clone, Copy)]
pub struct OnceAbsoluteMergeStrategy {
    range: CellRange,
}

impl OnceAbsoluteMergeStrategy {
    pub fn new(first_row: usize, last_row: usize, first_column: usize, last_column: usize) -> Self {
        OnceAbsoluteMergeStrategy {
            range: CellRange::new(first_row, last_row, first_column, last_column),
        }
    }
}

impl WriteHandler for OnceAbsoluteMergeStrategy {
    fn after_sheet_create(&self, ctx: &mut SheetHookContext<'_>) -> Result<()> {
        match ctx.sheet {
            Some(sheet) => ctx.sink.merge(sheet, self.range),
            None => Ok(()),
        }
    }
}

/// Same width for every head column.
#[derive(Debug, Clone, Copy)]
pub struct SimpleColumnWidthStrategy {
    width: f64,
}

impl SimpleColumnWidthStrategy {
    pub fn new(width: f64) -> Self {
        SimpleColumnWidthStrategy { width }
    }
}

impl WriteHandler for SimpleColumnWidthStrategy {
    fn after_cell_dispose(&self, ctx: &mut CellHookContext<'_>) -> Result<()> {
        if !ctx.position.is_head {
            return Ok(());
        }
        ctx.sink
            .set_column_width(ctx.position.sheet, ctx.column_index, self.width)
    }
}

/// Widens each column to its longest value seen so far, capped at
/// [`MAX_COLUMN_WIDTH`].
#[derive(Debug, Default)]
pub struct LongestMatchColumnWidthStrategy {
    widths: Mutex<HashMap<(SheetHandle, usize), usize>>,
}

impl LongestMatchColumnWidthStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    fn measure(value: &CellValue) -> Option<usize> {
        match value {
            CellValue::String(s) => Some(s.len()),
            CellValue::RichText(r) => Some(r.text.len()),
            CellValue::Boolean(_) | CellValue::Number(_) => Some(value.to_string().len()),
            _ => None,
        }
    }
}

impl WriteHandler for LongestMatchColumnWidthStrategy {
    fn after_cell_dispose(&self, ctx: &mut CellHookContext<'_>) -> Result<()> {
        let Some(width) = Self::measure(&ctx.cell.value) else {
            return Ok(());
        };
        let width = width.min(MAX_COLUMN_WIDTH);
        let key = (ctx.position.sheet, ctx.column_index);
        {
            let mut widths = self.widths.lock().unwrap_or_else(PoisonError::into_inner);
            let seen = widths.entry(key).or_insert(0);
            if width <= *seen {
                return Ok(());
            }
            *seen = width;
        }
        ctx.sink
            .set_column_width(ctx.position.sheet, ctx.column_index, width as f64)
    }
}

/// Fixed heights for head rows and content rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleRowHeightStrategy {
    pub head: Option<f64>,
    pub content: Option<f64>,
}

impl SimpleRowHeightStrategy {
    pub fn new(head: Option<f64>, content: Option<f64>) -> Self {
        SimpleRowHeightStrategy { head, content }
    }
}

impl WriteHandler for SimpleRowHeightStrategy {
    fn after_row_dispose(&self, ctx: &mut RowHookContext<'_>) -> Result<()> {
        let height = if ctx.position.is_head { self.head } else { self.content };
        match height {
            Some(h) => ctx.sink.set_row_height(ctx.position.sheet, ctx.position.row_index, h),
            None => Ok(()),
        }
    }
}

/// Tracks the written extent per sheet and reports it as the sheet's
/// used range (`A1` to the last written cell) after each write call.
#[derive(Debug, Default)]
pub struct DimensionHandler {
    extents: Mutex<HashMap<SheetHandle, CellRange>>,
}

impl DimensionHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WriteHandler for DimensionHandler {
    fn after_cell_dispose(&self, ctx: &mut CellHookContext<'_>) -> Result<()> {
        let mut extents = self.extents.lock().unwrap_or_else(PoisonError::into_inner);
        extents
            .entry(ctx.position.sheet)
            .or_insert_with(|| CellRange::single(0, 0))
            .extend_to(ctx.position.row_index, ctx.column_index);
        Ok(())
    }

    fn after_sheet_dispose(&self, ctx: &mut SheetHookContext<'_>) -> Result<()> {
        let Some(sheet) = ctx.sheet else {
            return Ok(());
        };
        let range = self
            .extents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&sheet)
            .copied();
        match range {
            Some(range) => ctx.sink.set_dimension(sheet, range),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::record::Value;
    use crate::write::sink::{MemorySink, SinkOutput};
    use crate::write::{WriteBasic, WriteContext, WriteSheet, WriteWorkbook};
    use pretty_assertions::assert_eq;

    fn literal(labels: &[&str]) -> WriteBasic {
        WriteBasic::default()
            .use_default_style(false)
            .head(labels.iter().map(|l| vec![l.to_string()]).collect())
    }

    fn run(sink: MemorySink, basic: WriteBasic, rows: &[Vec<Value>]) -> crate::write::MemoryWorkbook {
        let options = WriteWorkbook {
            basic,
            ..Default::default()
        };
        let mut ctx = WriteContext::new(Box::new(sink), options).unwrap();
        ctx.write(&WriteSheet::named("S"), None, rows).unwrap();
        ctx.finish(false)
            .unwrap()
            .and_then(SinkOutput::into_memory)
            .unwrap()
    }

    fn row(values: &[&str]) -> Vec<Value> {
        values.iter().map(|v| Value::from(*v)).collect()
    }

    #[test]
    fn test_escape_hex_patterns() {
        assert_eq!(escape_hex("_x1F2A_").as_deref(), Some("_x005F_x1F2A_"));
        assert_eq!(escape_hex("a_x00e9_b_x12_c").as_deref(), Some("a_x005F_x00e9_b_x12_c"));
        assert_eq!(escape_hex("_xZZZZ_"), None);
        assert_eq!(escape_hex("short"), None);
    }

    #[test]
    fn test_escape_hex_only_for_xlsx() {
        let basic = literal(&["A"]).handler(Arc::new(EscapeHexCellWriteHandler));
        let wb = run(MemorySink::with_format("xlsx"), basic.clone(), &[row(&["_x0041_"])]);
        assert_eq!(wb.sheets[0].text(1, 0), "_x005F_x0041_");

        let wb = run(MemorySink::with_format("csv"), basic, &[row(&["_x0041_"])]);
        assert_eq!(wb.sheets[0].text(1, 0), "_x0041_");
    }

    #[test]
    fn test_loop_merge_every_n_rows() {
        let basic = literal(&["A", "B"]).handler(Arc::new(LoopMergeStrategy::new(2, 1, 1).unwrap()));
        let rows: Vec<_> = (0..4).map(|_| row(&["x", "y"])).collect();
        let wb = run(MemorySink::new(), basic, &rows);
        assert_eq!(
            wb.sheets[0].merges,
            vec![CellRange::new(1, 2, 1, 1), CellRange::new(3, 4, 1, 1)]
        );
    }

    #[test]
    fn test_loop_merge_rejects_single_cell() {
        assert!(LoopMergeStrategy::new(1, 1, 0).is_err());
        assert!(LoopMergeStrategy::new(0, 2, 0).is_err());
    }

    #[test]
    fn test_once_absolute_merge() {
        let basic = literal(&["A"]).handler(Arc::new(OnceAbsoluteMergeStrategy::new(5, 6, 0, 2)));
        let wb = run(MemorySink::new(), basic, &[row(&["x"])]);
        assert_eq!(wb.sheets[0].merges, vec![CellRange::new(5, 6, 0, 2)]);
    }

    #[test]
    fn test_longest_match_width() {
        let basic = literal(&["Id", "Description"]).handler(Arc::new(LongestMatchColumnWidthStrategy::new()));
        let long = "x".repeat(300);
        let wb = run(
            MemorySink::new(),
            basic,
            &[row(&["12345", "ab"]), row(&["1", long.as_str()])],
        );
        let widths = &wb.sheets[0].column_widths;
        assert_eq!(widths[&0], 5.0);
        assert_eq!(widths[&1], MAX_COLUMN_WIDTH as f64);
    }

    #[test]
    fn test_simple_width_and_height() {
        let basic = literal(&["A", "B"])
            .handler(Arc::new(SimpleColumnWidthStrategy::new(20.0)))
            .handler(Arc::new(SimpleRowHeightStrategy::new(Some(30.0), Some(15.0))));
        let wb = run(MemorySink::new(), basic, &[row(&["x", "y"])]);
        let s = &wb.sheets[0];
        assert_eq!(s.column_widths[&1], 20.0);
        assert_eq!(s.row_heights[&0], 30.0);
        assert_eq!(s.row_heights[&1], 15.0);
    }

    #[test]
    fn test_horizontal_style_cycles_contents() {
        let even = CellStyle::new().with_fill(0xFFFFFF);
        let odd = CellStyle::new().with_fill(0xEEEEEE);
        let strategy = HorizontalCellStyleStrategy::new(
            Some(CellStyle::new().with_fill(0x0000FF)),
            vec![even.clone(), odd.clone()],
        );
        let basic = literal(&["A"]).handler(Arc::new(strategy));
        let rows: Vec<_> = (0..3).map(|_| row(&["x"])).collect();
        let wb = run(MemorySink::new(), basic, &rows);
        let fill = |r: usize| wb.sheets[0].cell(r, 0).and_then(|c| c.style.as_ref()).and_then(|s| s.fill);
        assert_eq!(fill(0), Some(0x0000FF));
        assert_eq!(fill(1), Some(0xFFFFFF));
        assert_eq!(fill(2), Some(0xEEEEEE));
        assert_eq!(fill(3), Some(0xFFFFFF));
    }

    #[test]
    fn test_default_style_only_touches_head() {
        let basic = literal(&["A"]).use_default_style(true);
        let wb = run(MemorySink::new(), basic, &[row(&["x"])]);
        let head = wb.sheets[0].cell(0, 0).and_then(|c| c.style.clone()).unwrap();
        assert_eq!(head.fill, Some(0xC0C0C0));
        assert_eq!(head.wrap, Some(true));
        assert!(wb.sheets[0].cell(1, 0).unwrap().style.is_none());
    }

    #[test]
    fn test_dimension_tracks_extent() {
        let basic = literal(&["A", "B", "C"]).handler(Arc::new(DimensionHandler::new()));
        let rows: Vec<_> = (0..4).map(|_| row(&["1", "2", "3"])).collect();
        let wb = run(MemorySink::new(), basic, &rows);
        assert_eq!(wb.sheets[0].dimension, Some(CellRange::new(0, 4, 0, 2)));
    }
}
