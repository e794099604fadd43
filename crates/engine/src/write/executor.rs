// Head emission and row writing through the handler chain

use std::collections::HashSet;

use crate::cell::{CellValue, WriteCellData};
use crate::convert::ConvertContext;
use crate::error::{ExcelError, Result};
use crate::head::{Head, HeadKind, HeadProperty};
use crate::record::{Record, RowValues, Value};
use crate::write::context::{declared_fields, Target, WriteContext};
use crate::write::handler::{CellHookContext, Position, RowHookContext};
use crate::write::{WriteSheet, WriteTable};

impl WriteContext {
    /// Write `rows` to a sheet, or to a table inside it. Repeated calls
    /// with the same sheet continue after its last row.
    pub fn write<T: Record>(&mut self, sheet: &WriteSheet, table: Option<&WriteTable>, rows: &[T]) -> Result<()> {
        if self.is_finished() {
            return Err(ExcelError::config("workbook already finished"));
        }
        let written = self.write_inner(sheet, table, rows);
        if written.is_err() {
            self.failed = true;
        }
        written
    }

    fn write_inner<T: Record>(&mut self, sheet: &WriteSheet, table: Option<&WriteTable>, rows: &[T]) -> Result<()> {
        self.select_sheet::<T>(sheet, table.is_none())?;
        if let Some(table) = table {
            self.select_table::<T>(table)?;
        }
        let target = self.target()?;
        self.add_rows(&target, rows)?;
        self.dispose_sheet()
    }

    /// Next free row. The first write to a headless sheet honours the
    /// relative head offset.
    fn next_row_index(&self, target: &Target) -> usize {
        let Some(sheet) = self.sheets.get(&target.sheet_no) else {
            return 0;
        };
        match sheet.last_row {
            Some(row) => row + 1,
            None if sheet.is_new && !sheet.head.has_head() => target.params.relative_head_row_index,
            None => 0,
        }
    }

    fn mark_row(&mut self, sheet_no: usize, row: usize) {
        if let Some(sheet) = self.sheets.get_mut(&sheet_no) {
            sheet.last_row = Some(sheet.last_row.map_or(row, |last| last.max(row)));
        }
    }

    /// Emit the head block: merges first, then each head row through the
    /// row and cell hooks. Labels are assigned literally.
    pub(crate) fn init_head(&mut self, target: &Target) -> Result<()> {
        let head = &target.head;
        if !target.params.need_head || !head.has_head() {
            return Ok(());
        }
        let start = self.next_row_index(target) + target.params.relative_head_row_index;

        if target.params.automatic_merge_head {
            for range in head.head_cell_ranges() {
                self.sink.merge(target.handle, range.offset_rows(start))?;
            }
        }
        for h in head.heads.values() {
            if let Some(width) = h.field.as_ref().and_then(|f| f.column_width) {
                self.sink.set_column_width(target.handle, h.column_index, width)?;
            }
        }

        for r in 0..head.head_row_number {
            let position = Position {
                sheet: target.handle,
                sheet_no: target.sheet_no,
                table_no: target.table_no,
                row_index: start + r,
                relative_row_index: None,
                is_head: true,
            };
            self.row_hook(position, head, RowStage::Before)?;
            self.sink.create_row(target.handle, position.row_index)?;
            self.row_hook(position, head, RowStage::After)?;
            for (column, h) in &head.heads {
                self.write_head_cell(target, position, *column, h, r)?;
            }
            self.row_hook(position, head, RowStage::Dispose)?;
            self.mark_row(target.sheet_no, position.row_index);
        }
        tracing::debug!(
            sheet_no = target.sheet_no,
            table_no = ?target.table_no,
            start,
            rows = head.head_row_number,
            "head written"
        );
        Ok(())
    }

    fn write_head_cell(&mut self, target: &Target, position: Position, column: usize, head: &Head, row: usize) -> Result<()> {
        let mut cell = WriteCellData::empty();
        self.cell_hook(target, position, column, Some(head), None, &mut cell, CellStage::BeforeCreate)?;
        self.cell_hook(target, position, column, Some(head), None, &mut cell, CellStage::AfterCreate)?;

        let label = head.labels.get(row).cloned().unwrap_or_default();
        cell.value = CellValue::String(label);
        if let Some(style) = head.field.as_ref().and_then(|f| f.head_style.as_ref()) {
            cell.merge_style(style);
        }

        self.cell_hook(target, position, column, Some(head), None, &mut cell, CellStage::Dispose)?;
        self.sink.write_cell(target.handle, position.row_index, column, &cell)
    }

    fn add_rows<T: Record>(&mut self, target: &Target, rows: &[T]) -> Result<()> {
        let start = self.next_row_index(target);
        let declared = declared_fields::<T>();

        for (i, record) in rows.iter().enumerate() {
            let position = Position {
                sheet: target.handle,
                sheet_no: target.sheet_no,
                table_no: target.table_no,
                row_index: start + i,
                relative_row_index: Some(i),
                is_head: false,
            };
            self.row_hook(position, &target.head, RowStage::Before)?;
            self.sink.create_row(target.handle, position.row_index)?;
            self.row_hook(position, &target.head, RowStage::After)?;

            let values = record.to_values();
            for (column, head, value) in place_cells(&target.head, &values, &declared) {
                self.write_data_cell(target, position, column, head, &value)?;
            }

            self.row_hook(position, &target.head, RowStage::Dispose)?;
            self.mark_row(target.sheet_no, position.row_index);
        }
        tracing::debug!(sheet_no = target.sheet_no, start, rows = rows.len(), "rows written");
        Ok(())
    }

    fn write_data_cell(
        &mut self,
        target: &Target,
        position: Position,
        column: usize,
        head: Option<&Head>,
        value: &Value,
    ) -> Result<()> {
        let mut cell = WriteCellData::empty();
        self.cell_hook(target, position, column, head, Some(value), &mut cell, CellStage::BeforeCreate)?;
        self.cell_hook(target, position, column, head, Some(value), &mut cell, CellStage::AfterCreate)?;

        let field = head.and_then(|h| h.field.as_ref());
        let use_1904 = target.config.use_1904_windowing.unwrap_or(false) && self.sink.supports_1904();
        let cctx = ConvertContext::new(&target.config, use_1904)
            .at(position.row_index, column)
            .with_format(field.and_then(|f| f.format.as_deref()));
        let mut converted = target.converters.convert_value(
            value,
            field.map(|f| f.target),
            field.and_then(|f| f.write_as),
            field.and_then(|f| f.converter.as_ref()),
            &cctx,
        )?;
        converted.inherit_decoration(cell);
        if let Some(style) = field.and_then(|f| f.content_style.as_ref()) {
            converted.merge_style(style);
        }
        let mut cell = converted;

        self.cell_hook(target, position, column, head, Some(value), &mut cell, CellStage::Converted)?;
        self.cell_hook(target, position, column, head, Some(value), &mut cell, CellStage::Dispose)?;
        self.sink.write_cell(target.handle, position.row_index, column, &cell)
    }

    fn row_hook(&mut self, position: Position, head: &HeadProperty, stage: RowStage) -> Result<()> {
        for handler in &self.chain {
            let mut ctx = RowHookContext {
                sink: self.sink.as_mut(),
                position,
                head,
            };
            match stage {
                RowStage::Before => handler.before_row_create(&mut ctx)?,
                RowStage::After => handler.after_row_create(&mut ctx)?,
                RowStage::Dispose => handler.after_row_dispose(&mut ctx)?,
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn cell_hook(
        &mut self,
        target: &Target,
        position: Position,
        column: usize,
        head: Option<&Head>,
        original: Option<&Value>,
        cell: &mut WriteCellData,
        stage: CellStage,
    ) -> Result<()> {
        for handler in &self.chain {
            let mut ctx = CellHookContext {
                sink: self.sink.as_mut(),
                position,
                column_index: column,
                head,
                original,
                cell: &mut *cell,
                config: &target.config,
            };
            match stage {
                CellStage::BeforeCreate => handler.before_cell_create(&mut ctx)?,
                CellStage::AfterCreate => handler.after_cell_create(&mut ctx)?,
                CellStage::Converted => handler.after_cell_data_converted(&mut ctx)?,
                CellStage::Dispose => handler.after_cell_dispose(&mut ctx)?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum RowStage {
    Before,
    After,
    Dispose,
}

#[derive(Debug, Clone, Copy)]
enum CellStage {
    BeforeCreate,
    AfterCreate,
    Converted,
    Dispose,
}

/// Map a record's values to columns.
///
/// Typed records: head-bound fields at their head column, then fields the
/// type does not declare after the last head column. Positional rows:
/// position `i` goes to the i-th head's column, positions past the heads
/// continue after the last head column, and without heads column = `i`.
fn place_cells<'h>(
    head: &'h HeadProperty,
    values: &RowValues,
    declared: &HashSet<&'static str>,
) -> Vec<(usize, Option<&'h Head>, Value)> {
    let mut out = Vec::new();
    if head.kind == HeadKind::Typed {
        for (column, h) in &head.heads {
            let value = h
                .field_name()
                .and_then(|name| values.field(name))
                .cloned()
                .unwrap_or_default();
            out.push((*column, Some(h), value));
        }
        let mut next = head.last_column().map_or(0, |c| c + 1);
        for (name, value) in values.fields() {
            if declared.contains(name) {
                continue;
            }
            out.push((next, None, value.clone()));
            next += 1;
        }
        return out;
    }

    let heads: Vec<&Head> = head.heads.values().collect();
    let last = head.last_column();
    for (&pos, value) in values.positional() {
        let column = match (heads.get(pos), last) {
            (Some(h), _) => h.column_index,
            (None, Some(last)) => last + 1 + (pos - heads.len()),
            (None, None) => pos,
        };
        out.push((column, heads.get(pos).copied(), value.clone()));
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::cell::CellRange;
    use crate::error::BoxError;
    use crate::record::{FieldSpec, TargetType};
    use crate::style::CellStyle;
    use crate::write::handler::{SheetHookContext, WorkbookHookContext, WriteHandler};
    use crate::write::sink::{MemorySink, MemoryWorkbook, SinkOutput};
    use crate::write::{EncryptionStep, WriteBasic, WriteWorkbook};
    use pretty_assertions::assert_eq;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        name: String,
        qty: i64,
    }

    impl Record for Item {
        fn fields() -> Vec<FieldSpec> {
            vec![
                FieldSpec::new("name", TargetType::String).labels(["Stock", "Name"]),
                FieldSpec::new("qty", TargetType::I64).labels(["Stock", "Qty"]),
            ]
        }

        fn from_values(mut values: RowValues) -> std::result::Result<Self, BoxError> {
            Ok(Item {
                name: values.take_or_default("name")?,
                qty: values.take_or_default("qty")?,
            })
        }

        fn to_values(&self) -> RowValues {
            RowValues::new()
                .with("name", self.name.clone())
                .with("qty", self.qty)
                .with("note", "extra")
        }
    }

    fn items(n: usize) -> Vec<Item> {
        (0..n)
            .map(|i| Item {
                name: format!("item{}", i),
                qty: i as i64,
            })
            .collect()
    }

    fn plain() -> WriteWorkbook {
        WriteWorkbook {
            basic: WriteBasic::default().use_default_style(false),
            ..Default::default()
        }
    }

    fn finish(mut ctx: WriteContext) -> MemoryWorkbook {
        ctx.finish(false)
            .unwrap()
            .and_then(SinkOutput::into_memory)
            .unwrap()
    }

    #[test]
    fn test_relative_head_row_index_leaves_blank_rows() {
        let mut ctx = WriteContext::new(Box::new(MemorySink::new()), plain()).unwrap();
        let sheet = WriteSheet::named("S").with(WriteBasic::default().relative_head_row_index(3));
        ctx.write(&sheet, None, &items(10)).unwrap();
        let wb = finish(ctx);
        let s = wb.sheet("S").unwrap();
        for row in 0..3 {
            assert!(s.rows.get(&row).is_none(), "row {} should be blank", row);
        }
        assert_eq!(s.text(3, 0), "Stock");
        assert_eq!(s.text(4, 1), "Qty");
        assert_eq!(s.text(5, 0), "item0");
        assert_eq!(s.last_row(), Some(14));
        // "Stock" spans both columns of the first head row
        assert_eq!(s.merges, vec![CellRange::new(3, 3, 0, 1)]);
    }

    #[test]
    fn test_unhandled_fields_follow_head() {
        let mut ctx = WriteContext::new(Box::new(MemorySink::new()), plain()).unwrap();
        ctx.write(&WriteSheet::index(0), None, &items(1)).unwrap();
        let wb = finish(ctx);
        let s = &wb.sheets[0];
        assert_eq!(s.name, "0");
        assert_eq!(s.text(2, 2), "extra");
    }

    #[test]
    fn test_repeated_writes_continue() {
        let mut ctx = WriteContext::new(Box::new(MemorySink::new()), plain()).unwrap();
        let sheet = WriteSheet::named("S");
        ctx.write(&sheet, None, &items(2)).unwrap();
        ctx.write(&sheet, None, &items(2)).unwrap();
        let wb = finish(ctx);
        let s = wb.sheet("S").unwrap();
        assert_eq!(s.last_row(), Some(5));
        assert_eq!(s.text(4, 0), "item0");
    }

    #[test]
    fn test_positional_rows_without_head() {
        let mut ctx = WriteContext::new(Box::new(MemorySink::new()), plain()).unwrap();
        let sheet = WriteSheet::named("S").with(WriteBasic::default().relative_head_row_index(1));
        let rows = vec![vec![Value::from("a"), Value::Null, Value::from(2.5)]];
        ctx.write(&sheet, None, &rows).unwrap();
        let wb = finish(ctx);
        let s = wb.sheet("S").unwrap();
        assert_eq!(s.text(1, 0), "a");
        assert_eq!(s.text(1, 2), "2.5");
        assert!(s.cell(1, 1).unwrap().value.is_empty());
    }

    #[test]
    fn test_tables_share_row_cursor() {
        let mut ctx = WriteContext::new(Box::new(MemorySink::new()), plain()).unwrap();
        let sheet = WriteSheet::named("S");
        let lit = |labels: &[&str]| {
            WriteBasic::default().head(labels.iter().map(|l| vec![l.to_string()]).collect())
        };
        let first = WriteTable::new(0).with(lit(&["A", "B"]));
        let second = WriteTable::new(1).with(lit(&["C"]).relative_head_row_index(1));
        ctx.write(&sheet, Some(&first), &[vec![Value::from(1i64), Value::from(2i64)]])
            .unwrap();
        ctx.write(&sheet, Some(&second), &[vec![Value::from("x")]]).unwrap();
        let wb = finish(ctx);
        let s = wb.sheet("S").unwrap();
        assert_eq!(s.text(0, 0), "A");
        assert_eq!(s.text(1, 1), "2");
        assert!(s.rows.get(&2).is_none());
        assert_eq!(s.text(3, 0), "C");
        assert_eq!(s.text(4, 0), "x");
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    struct Probe(Arc<Recorder>, &'static str);

    impl WriteHandler for Probe {
        fn after_workbook_create(&self, ctx: &mut WorkbookHookContext<'_>) -> Result<()> {
            self.0.push(format!("{}:workbook:{}", self.1, ctx.supplementary));
            Ok(())
        }

        fn after_sheet_create(&self, ctx: &mut SheetHookContext<'_>) -> Result<()> {
            self.0.push(format!("{}:sheet:{}:{}", self.1, ctx.sheet_no, ctx.supplementary));
            Ok(())
        }

        fn after_sheet_dispose(&self, ctx: &mut SheetHookContext<'_>) -> Result<()> {
            self.0.push(format!("{}:dispose:{}", self.1, ctx.sheet_no));
            Ok(())
        }

        fn after_cell_data_converted(&self, ctx: &mut CellHookContext<'_>) -> Result<()> {
            if let CellValue::String(s) = &ctx.cell.value {
                ctx.cell.value = CellValue::String(s.to_uppercase());
            }
            Ok(())
        }
    }

    #[test]
    fn test_supplementary_replay_and_converted_hook() {
        let rec = Arc::new(Recorder::default());
        let mut options = plain();
        options.basic.handlers.push(Arc::new(Probe(rec.clone(), "wb")));
        let mut ctx = WriteContext::new(Box::new(MemorySink::new()), options).unwrap();
        let sheet = WriteSheet::index(1)
            .with(WriteBasic::default().handler(Arc::new(Probe(rec.clone(), "sh"))));
        ctx.write(&sheet, None, &items(1)).unwrap();
        let wb = finish(ctx);

        let events = rec.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "wb:workbook:false",
                "sh:workbook:true",
                "wb:sheet:1:false",
                "sh:sheet:1:false",
                "wb:dispose:1",
                "sh:dispose:1",
            ]
        );
        let s = &wb.sheets[0];
        // head labels are not converted, data cells are
        assert_eq!(s.text(1, 0), "Name");
        assert_eq!(s.text(2, 0), "ITEM0");
    }

    #[test]
    fn test_default_style_then_field_style() {
        #[derive(Debug)]
        struct Styled;

        impl Record for Styled {
            fn fields() -> Vec<FieldSpec> {
                vec![FieldSpec::new("v", TargetType::String)
                    .label("V")
                    .head_style(CellStyle::new().with_fill(0x00FF00))]
            }

            fn from_values(_values: RowValues) -> std::result::Result<Self, BoxError> {
                Ok(Styled)
            }

            fn to_values(&self) -> RowValues {
                RowValues::new().with("v", "x")
            }
        }

        let mut ctx = WriteContext::new(Box::new(MemorySink::new()), WriteWorkbook::default()).unwrap();
        ctx.write(&WriteSheet::index(0), None, &[Styled]).unwrap();
        let wb = finish(ctx);
        let style = wb.sheets[0].cell(0, 0).unwrap().style.clone().unwrap();
        assert_eq!(style.fill, Some(0x00FF00));
        assert!(style.font.as_ref().is_some_and(|f| f.bold));
        assert!(wb.sheets[0].cell(1, 0).unwrap().style.is_none());
    }

    #[test]
    fn test_failed_write_discards_output() {
        struct Fail;

        impl WriteHandler for Fail {
            fn after_row_create(&self, ctx: &mut RowHookContext<'_>) -> Result<()> {
                if ctx.position.relative_row_index == Some(1) {
                    return Err(ExcelError::config("stop"));
                }
                Ok(())
            }
        }

        let mut options = plain();
        options.basic.handlers.push(Arc::new(Fail));
        let mut ctx = WriteContext::new(Box::new(MemorySink::new()), options).unwrap();
        assert!(ctx.write(&WriteSheet::index(0), None, &items(3)).is_err());
        assert!(ctx.finish(false).unwrap().is_none());
        assert!(ctx.finish(false).unwrap().is_none());
    }

    #[test]
    fn test_write_on_exception_keeps_output() {
        let mut options = plain();
        options.write_excel_on_exception = true;
        let mut ctx = WriteContext::new(Box::new(MemorySink::new()), options).unwrap();
        ctx.write(&WriteSheet::index(0), None, &items(1)).unwrap();
        let out = ctx.finish(true).unwrap();
        assert!(out.and_then(SinkOutput::into_memory).is_some());
    }

    struct Reverse;

    impl EncryptionStep for Reverse {
        fn encrypt(&self, mut plain: Vec<u8>, _password: &str) -> std::result::Result<Vec<u8>, BoxError> {
            plain.reverse();
            Ok(plain)
        }
    }

    #[test]
    fn test_password_requires_encryption_step() {
        let options = WriteWorkbook {
            password: Some("secret".into()),
            ..Default::default()
        };
        assert!(matches!(
            WriteContext::new(Box::new(MemorySink::new()), options),
            Err(ExcelError::Config(_))
        ));

        let options = WriteWorkbook {
            password: Some("secret".into()),
            encryption: Some(Box::new(Reverse)),
            ..Default::default()
        };
        let mut ctx = WriteContext::new(Box::new(MemorySink::new()), options).unwrap();
        match ctx.finish(false) {
            Err(ExcelError::Teardown { first, .. }) => assert!(matches!(*first, ExcelError::Config(_))),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
