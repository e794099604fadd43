// Drives an event source sheet by sheet and owns read teardown

use crate::error::{ExcelError, ReleaseGuard, Result};
use crate::events::{EventSource, SheetInfo};
use crate::read::context::ReadContext;
use crate::read::listener::ReadListener;
use crate::read::processor;
use crate::read::{ReadSheet, ReadWorkbook};
use crate::record::Record;

/// One open workbook on the read side.
///
/// Requested sheets are walked in file order, each physical sheet at most
/// once per analyser. Any error releases the analyser before it is returned.
pub struct ExcelAnalyser<S: EventSource> {
    source: S,
    ctx: ReadContext,
    closed: bool,
}

impl<S: EventSource> ExcelAnalyser<S> {
    pub fn new(mut source: S, options: ReadWorkbook) -> Result<Self> {
        let ctx = match ReadContext::new(options, &mut source) {
            Ok(ctx) => ctx,
            Err(e) => {
                if let Err(close) = source.close() {
                    tracing::warn!(error = %close, "closing source after failed open");
                }
                return Err(e);
            }
        };
        Ok(ExcelAnalyser {
            source,
            ctx,
            closed: false,
        })
    }

    pub fn sheet_list(&self) -> &[SheetInfo] {
        &self.ctx.workbook.sheets
    }

    pub fn context(&self) -> &ReadContext {
        &self.ctx
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Read the requested sheets. Requests that resolve to the same sheet
    /// collapse to one walk; the first matching request supplies overrides.
    pub fn read<T: Record>(
        &mut self,
        requests: &[ReadSheet],
        listeners: &mut [&mut dyn ReadListener<T>],
    ) -> Result<()> {
        if self.closed {
            return Err(ExcelError::config("analyser already finished"));
        }
        if requests.is_empty() {
            return Err(ExcelError::config("at least one sheet must be requested"));
        }
        match self.read_inner(requests, listeners) {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Err(teardown) = self.finish() {
                    tracing::warn!(error = %teardown, "teardown after failed read");
                }
                Err(e)
            }
        }
    }

    /// Read every sheet in file order.
    pub fn read_all<T: Record>(&mut self, listeners: &mut [&mut dyn ReadListener<T>]) -> Result<()> {
        let requests: Vec<ReadSheet> = (0..self.sheet_list().len()).map(ReadSheet::index).collect();
        if requests.is_empty() {
            return Ok(());
        }
        self.read(&requests, listeners)
    }

    fn read_inner<T: Record>(
        &mut self,
        requests: &[ReadSheet],
        listeners: &mut [&mut dyn ReadListener<T>],
    ) -> Result<()> {
        let mut resolved = Vec::with_capacity(requests.len());
        for request in requests {
            resolved.push(self.ctx.resolve_sheet(request)?);
        }

        for sheet_no in 0..self.ctx.workbook.sheets.len() {
            let Some(pos) = resolved.iter().position(|r| *r == sheet_no) else {
                continue;
            };
            if self.ctx.workbook.ignore_hidden_sheet && self.ctx.workbook.sheets[sheet_no].is_hidden() {
                tracing::debug!(sheet_no, "skipping hidden sheet");
                continue;
            }
            self.ctx.select_sheet::<T>(&requests[pos])?;
            processor::process_sheet(&mut self.ctx, &mut self.source, sheet_no, listeners)?;
        }
        Ok(())
    }

    /// Release the context and the source. Every step runs; the first
    /// failure is returned. Safe to call more than once.
    pub fn finish(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut guard = ReleaseGuard::new();
        guard.attempt("read context", || self.ctx.finish());
        guard.attempt("event source", || self.source.close());
        guard.finish()
    }
}

impl<S: EventSource> Drop for ExcelAnalyser<S> {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            tracing::warn!(error = %e, "read teardown failed");
        }
    }
}
