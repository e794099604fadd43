// Row-level event processing for one sheet

use std::collections::BTreeMap;

use crate::cell::{CellData, CellValue};
use crate::config::ReadDefaultReturn;
use crate::convert::ConvertContext;
use crate::error::{BoxError, ExcelError, Result};
use crate::events::{EventSource, ExtraSet, SheetEvent};
use crate::head::HeadKind;
use crate::numeric::serial_to_datetime;
use crate::read::context::{ReadContext, ReadSheetHolder, RowKind};
use crate::read::listener::{ExceptionAction, ReadListener};
use crate::record::{Record, RowValues, TargetType, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Walk one already-selected sheet and feed its rows to `listeners`.
pub(crate) fn process_sheet<T: Record>(
    ctx: &mut ReadContext,
    source: &mut dyn EventSource,
    sheet_no: usize,
    listeners: &mut [&mut dyn ReadListener<T>],
) -> Result<()> {
    ctx.begin_sheet(sheet_no)?;
    let extras = ctx.workbook.extra_read;
    let walked = walk(ctx, source, sheet_no, extras, listeners);
    ctx.clear_row();
    walked?;
    end_sheet(ctx, listeners)
}

fn walk<T: Record>(
    ctx: &mut ReadContext,
    source: &mut dyn EventSource,
    sheet_no: usize,
    extras: ExtraSet,
    listeners: &mut [&mut dyn ReadListener<T>],
) -> Result<()> {
    let mut events = source.open_sheet(sheet_no, extras)?;
    loop {
        let event = match events.next_event() {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(e) if e.is_benign() => {
                tracing::warn!(sheet_no, error = %e, "sheet stream ended early");
                break;
            }
            Err(e) => return Err(e),
        };
        let flow = match event {
            SheetEvent::RowStart(row) => {
                ctx.start_row(row);
                Flow::Continue
            }
            SheetEvent::Cell {
                column,
                raw,
                format,
                formula,
            } => {
                ctx.push_cell(column, raw, format, formula)?;
                Flow::Continue
            }
            SheetEvent::RowEnd => end_row(ctx, listeners)?,
            SheetEvent::Extra(extra) if extras.contains(extra.kind) => {
                dispatch(ctx, listeners, |l, c| l.extra(&extra, c))?
            }
            SheetEvent::Extra(_) => Flow::Continue,
            SheetEvent::SheetEnd => Flow::Stop,
        };
        if flow == Flow::Stop {
            break;
        }
    }
    Ok(())
}

fn end_row<T: Record>(ctx: &mut ReadContext, listeners: &mut [&mut dyn ReadListener<T>]) -> Result<Flow> {
    let Some(row) = ctx.row.as_mut() else {
        return Ok(Flow::Continue);
    };
    let kind = row.classify();
    let row_index = row.row_index;
    let (head_rows, num_rows) = match ctx.sheet() {
        Some(sheet) => (sheet.head_row_number, sheet.num_rows),
        None => return Err(ExcelError::config("row ended with no sheet selected")),
    };

    if num_rows.is_some_and(|limit| row_index >= limit) {
        tracing::debug!(row_index, "row limit reached");
        return Ok(Flow::Stop);
    }
    if kind == RowKind::Empty && ctx.workbook.ignore_empty_row {
        tracing::trace!(row_index, "empty row skipped");
        ctx.clear_row();
        return Ok(Flow::Continue);
    }

    let flow = if row_index < head_rows {
        head_row(ctx, listeners, row_index + 1 == head_rows)?
    } else {
        data_row(ctx, listeners)?
    };
    ctx.clear_row();
    Ok(flow)
}

fn head_row<T: Record>(
    ctx: &mut ReadContext,
    listeners: &mut [&mut dyn ReadListener<T>],
    last_head_row: bool,
) -> Result<Flow> {
    let labels = match (ctx.sheet(), ctx.row()) {
        (Some(sheet), Some(row)) => head_labels(sheet, &row.cells),
        _ => return Ok(Flow::Continue),
    };

    if last_head_row {
        if let Some(sheet) = ctx.sheet_mut() {
            match sheet.head.kind {
                HeadKind::Typed => sheet.head.rematch_by_name(&labels),
                _ => sheet.head_width = labels.keys().next_back().map(|c| c + 1),
            }
        }
    }
    dispatch(ctx, listeners, |l, c| l.invoke_head(&labels, c))
}

fn head_labels(sheet: &ReadSheetHolder, cells: &BTreeMap<usize, CellData>) -> BTreeMap<usize, String> {
    cells
        .iter()
        .filter(|(_, cell)| !cell.is_empty())
        .map(|(column, cell)| {
            let cctx = ConvertContext::new(&sheet.config, sheet.use_1904).at(cell.row, *column);
            let label = match sheet
                .converters
                .convert_cell(cell, TargetType::String, None, &cctx)
            {
                Ok(Value::String(s)) => s,
                _ => cell.value.to_string(),
            };
            (*column, sheet.config.normalize_text(&label))
        })
        .collect()
}

fn data_row<T: Record>(ctx: &mut ReadContext, listeners: &mut [&mut dyn ReadListener<T>]) -> Result<Flow> {
    match build_row::<T>(ctx) {
        Ok(record) => {
            if let Some(row) = ctx.row.as_mut() {
                row.set_result(record);
            }
            if let Some(sheet) = ctx.sheet_mut() {
                sheet.data_rows += 1;
            }
        }
        Err(e) if e.is_conversion() => {
            handle_exception(ctx, listeners, e)?;
            return Ok(Flow::Continue);
        }
        Err(e) => return Err(e),
    }

    let ctx: &ReadContext = ctx;
    match ctx.row().and_then(|r| r.result::<T>()) {
        Some(data) => dispatch(ctx, listeners, |l, c| l.invoke(data, c)),
        None => Ok(Flow::Continue),
    }
}

/// Bind the current row to `T`: by head for typed records, by position
/// otherwise.
fn build_row<T: Record>(ctx: &ReadContext) -> Result<T> {
    let (Some(sheet), Some(row)) = (ctx.sheet(), ctx.row()) else {
        return Err(ExcelError::config("no row to bind"));
    };
    let mut values = RowValues::new();

    if sheet.is_typed() {
        for (column, head) in &sheet.head.heads {
            let (Some(field), Some(cell)) = (&head.field, row.cells.get(column)) else {
                continue;
            };
            let cctx = ConvertContext::new(&sheet.config, sheet.use_1904)
                .at(row.row_index, *column)
                .with_format(field.format.as_deref());
            let value = sheet
                .converters
                .convert_cell(cell, field.target, field.converter.as_ref(), &cctx)?;
            values.set(field.name, value);
        }
    } else {
        let head_size = match sheet.head.kind {
            HeadKind::Literal => sheet.head.heads.len(),
            _ => sheet.head_width.unwrap_or(0),
        };
        let width = row
            .cells
            .keys()
            .next_back()
            .map_or(0, |c| c + 1)
            .max(head_size);
        let mode = ctx.workbook.read_default_return;
        for column in 0..width {
            let value = match row.cells.get(&column) {
                None => Value::Null,
                Some(cell) => untyped_value(sheet, cell, mode)?,
            };
            values.set_position(column, value);
        }
    }

    T::from_values(values).map_err(|source| ExcelError::Bind {
        row: row.row_index,
        source,
    })
}

fn untyped_value(sheet: &ReadSheetHolder, cell: &CellData, mode: ReadDefaultReturn) -> Result<Value> {
    match mode {
        ReadDefaultReturn::String => {
            let cctx = ConvertContext::new(&sheet.config, sheet.use_1904).at(cell.row, cell.column);
            sheet
                .converters
                .convert_cell(cell, TargetType::String, None, &cctx)
        }
        ReadDefaultReturn::CellData => Ok(Value::Cell(Box::new(cell.clone()))),
        ReadDefaultReturn::ActualData => Ok(actual_value(cell, sheet.use_1904)),
    }
}

/// Natural value of a cell; date-formatted numbers become date-times.
fn actual_value(cell: &CellData, use_1904: bool) -> Value {
    match &cell.value {
        CellValue::Empty => Value::Null,
        CellValue::String(s) | CellValue::Error(s) => Value::String(s.clone()),
        CellValue::Number(n) if cell.is_date_formatted() => serial_to_datetime(n.value, use_1904)
            .map(Value::DateTime)
            .unwrap_or(Value::Float(n.value)),
        CellValue::Number(n) => Value::Float(n.value),
        CellValue::Boolean(b) => Value::Bool(*b),
        CellValue::Date(d) => Value::DateTime(*d),
        CellValue::RichText(r) => Value::String(r.text.clone()),
    }
}

/// Run `call` on each listener in order. A failure goes to every
/// listener's exception hook and ends the row; `has_next() == false`
/// stops the sheet.
fn dispatch<T, F>(ctx: &ReadContext, listeners: &mut [&mut dyn ReadListener<T>], mut call: F) -> Result<Flow>
where
    F: FnMut(&mut dyn ReadListener<T>, &ReadContext) -> std::result::Result<(), BoxError>,
{
    for i in 0..listeners.len() {
        if let Err(e) = call(&mut *listeners[i], ctx) {
            handle_exception(ctx, listeners, into_excel_error(e))?;
            return Ok(Flow::Continue);
        }
        if !listeners[i].has_next(ctx) {
            tracing::debug!("listener requested stop");
            return Ok(Flow::Stop);
        }
    }
    Ok(Flow::Continue)
}

fn handle_exception<T>(
    ctx: &ReadContext,
    listeners: &mut [&mut dyn ReadListener<T>],
    error: ExcelError,
) -> Result<()> {
    tracing::debug!(error = %error, "row failed");
    let mut abort = listeners.is_empty();
    for listener in listeners.iter_mut() {
        if listener.on_exception(&error, ctx) == ExceptionAction::Abort {
            abort = true;
        }
    }
    if abort {
        Err(error)
    } else {
        Ok(())
    }
}

fn into_excel_error(err: BoxError) -> ExcelError {
    match err.downcast::<ExcelError>() {
        Ok(e) => *e,
        Err(other) => ExcelError::Listener(other),
    }
}

fn end_sheet<T>(ctx: &mut ReadContext, listeners: &mut [&mut dyn ReadListener<T>]) -> Result<()> {
    let Some(sheet) = ctx.sheet_mut() else {
        return Ok(());
    };
    if sheet.ended {
        return Ok(());
    }
    sheet.ended = true;
    tracing::debug!(sheet_no = sheet.sheet_no, rows = sheet.data_rows, "sheet analysed");

    let ctx: &ReadContext = ctx;
    for listener in listeners.iter_mut() {
        listener.after_all_analysed(ctx).map_err(into_excel_error)?;
    }
    Ok(())
}
