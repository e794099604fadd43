//! Read listeners receive bound rows, header rows and extras.
//!
//! Listeners run in registration order. An error from any callback is routed
//! to every listener's [`ReadListener::on_exception`]; the read aborts if any
//! of them answers [`ExceptionAction::Abort`], otherwise the current row is
//! skipped and reading continues. [`ReadListener::has_next`] is polled after
//! each successful invoke; `false` stops the current sheet.

use std::collections::BTreeMap;

use crate::error::{BoxError, ExcelError};
use crate::events::CellExtra;
use crate::read::context::ReadContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionAction {
    Abort,
    Continue,
}

pub trait ReadListener<T> {
    fn invoke(&mut self, data: &T, ctx: &ReadContext) -> Result<(), BoxError>;

    /// Called for each header row with its normalized labels.
    fn invoke_head(&mut self, _head: &BTreeMap<usize, String>, _ctx: &ReadContext) -> Result<(), BoxError> {
        Ok(())
    }

    /// Comments, hyperlinks and merges, when requested.
    fn extra(&mut self, _extra: &CellExtra, _ctx: &ReadContext) -> Result<(), BoxError> {
        Ok(())
    }

    fn on_exception(&mut self, _error: &ExcelError, _ctx: &ReadContext) -> ExceptionAction {
        ExceptionAction::Abort
    }

    fn has_next(&self, _ctx: &ReadContext) -> bool {
        true
    }

    /// Called once per sheet, after its last row.
    fn after_all_analysed(&mut self, _ctx: &ReadContext) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Buffers rows and hands them to a callback in pages.
pub struct PageReadListener<T, F> {
    batch_size: usize,
    buffer: Vec<T>,
    consumer: F,
}

pub const DEFAULT_PAGE_SIZE: usize = 100;

impl<T, F> PageReadListener<T, F>
where
    F: FnMut(Vec<T>) -> Result<(), BoxError>,
{
    pub fn new(consumer: F) -> Self {
        Self::with_batch_size(DEFAULT_PAGE_SIZE, consumer)
    }

    pub fn with_batch_size(batch_size: usize, consumer: F) -> Self {
        PageReadListener {
            batch_size: batch_size.max(1),
            buffer: Vec::with_capacity(batch_size.max(1)),
            consumer,
        }
    }

    fn flush(&mut self) -> Result<(), BoxError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let page = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.batch_size));
        (self.consumer)(page)
    }
}

impl<T: Clone, F> ReadListener<T> for PageReadListener<T, F>
where
    F: FnMut(Vec<T>) -> Result<(), BoxError>,
{
    fn invoke(&mut self, data: &T, _ctx: &ReadContext) -> Result<(), BoxError> {
        self.buffer.push(data.clone());
        if self.buffer.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    fn after_all_analysed(&mut self, _ctx: &ReadContext) -> Result<(), BoxError> {
        self.flush()
    }
}

/// Keeps every row, plus header rows, for synchronous reads.
#[derive(Debug, Clone)]
pub struct CollectingListener<T> {
    rows: Vec<T>,
    heads: Vec<BTreeMap<usize, String>>,
}

impl<T> Default for CollectingListener<T> {
    fn default() -> Self {
        CollectingListener {
            rows: Vec::new(),
            heads: Vec::new(),
        }
    }
}

impl<T> CollectingListener<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> &[T] {
        &self.rows
    }

    pub fn heads(&self) -> &[BTreeMap<usize, String>] {
        &self.heads
    }

    pub fn into_rows(self) -> Vec<T> {
        self.rows
    }
}

impl<T: Clone> ReadListener<T> for CollectingListener<T> {
    fn invoke(&mut self, data: &T, _ctx: &ReadContext) -> Result<(), BoxError> {
        self.rows.push(data.clone());
        Ok(())
    }

    fn invoke_head(&mut self, head: &BTreeMap<usize, String>, _ctx: &ReadContext) -> Result<(), BoxError> {
        self.heads.push(head.clone());
        Ok(())
    }
}

/// Wraps a listener and skips rows that fail to convert, recording each.
pub struct IgnoreExceptionListener<L> {
    inner: L,
    skipped: Vec<String>,
}

impl<L> IgnoreExceptionListener<L> {
    pub fn new(inner: L) -> Self {
        IgnoreExceptionListener {
            inner,
            skipped: Vec::new(),
        }
    }

    /// Messages for rows skipped after a conversion failure.
    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    pub fn into_inner(self) -> L {
        self.inner
    }
}

impl<T, L: ReadListener<T>> ReadListener<T> for IgnoreExceptionListener<L> {
    fn invoke(&mut self, data: &T, ctx: &ReadContext) -> Result<(), BoxError> {
        self.inner.invoke(data, ctx)
    }

    fn invoke_head(&mut self, head: &BTreeMap<usize, String>, ctx: &ReadContext) -> Result<(), BoxError> {
        self.inner.invoke_head(head, ctx)
    }

    fn extra(&mut self, extra: &CellExtra, ctx: &ReadContext) -> Result<(), BoxError> {
        self.inner.extra(extra, ctx)
    }

    fn on_exception(&mut self, error: &ExcelError, ctx: &ReadContext) -> ExceptionAction {
        if error.is_conversion() {
            tracing::warn!(error = %error, "row skipped");
            self.skipped.push(error.to_string());
            ExceptionAction::Continue
        } else {
            self.inner.on_exception(error, ctx)
        }
    }

    fn has_next(&self, ctx: &ReadContext) -> bool {
        self.inner.has_next(ctx)
    }

    fn after_all_analysed(&mut self, ctx: &ReadContext) -> Result<(), BoxError> {
        self.inner.after_all_analysed(ctx)
    }
}
