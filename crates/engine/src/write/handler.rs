//! Write handler chain.
//!
//! Handlers are ordered by [`WriteHandler::order`], then registration order.
//! Workbook and sheet hooks that already ran once are replayed with
//! `supplementary = true` for handlers registered on a sheet or table that
//! is selected later.

use std::sync::Arc;

use crate::cell::WriteCellData;
use crate::config::GlobalConfiguration;
use crate::error::Result;
use crate::head::{Head, HeadProperty};
use crate::record::Value;
use crate::write::sink::{SheetHandle, SheetSink};

pub struct WorkbookHookContext<'a> {
    pub sink: &'a mut dyn SheetSink,
    pub config: &'a GlobalConfiguration,
    pub supplementary: bool,
}

pub struct SheetHookContext<'a> {
    pub sink: &'a mut dyn SheetSink,
    /// `None` before the sheet exists
    pub sheet: Option<SheetHandle>,
    pub sheet_no: usize,
    pub sheet_name: &'a str,
    pub table_no: Option<usize>,
    pub head: &'a HeadProperty,
    pub supplementary: bool,
}

/// Where a row or cell sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub sheet: SheetHandle,
    pub sheet_no: usize,
    pub table_no: Option<usize>,
    pub row_index: usize,
    /// Index within the current `write` call; `None` for header rows
    pub relative_row_index: Option<usize>,
    pub is_head: bool,
}

pub struct RowHookContext<'a> {
    pub sink: &'a mut dyn SheetSink,
    pub position: Position,
    pub head: &'a HeadProperty,
}

pub struct CellHookContext<'a> {
    pub sink: &'a mut dyn SheetSink,
    pub position: Position,
    pub column_index: usize,
    pub head: Option<&'a Head>,
    /// The record value before conversion; `None` for header cells
    pub original: Option<&'a Value>,
    pub cell: &'a mut WriteCellData,
    pub config: &'a GlobalConfiguration,
}

pub trait WriteHandler: Send + Sync {
    /// Lower runs first.
    fn order(&self) -> i32 {
        0
    }

    fn before_workbook_create(&self, _ctx: &mut WorkbookHookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn after_workbook_create(&self, _ctx: &mut WorkbookHookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn after_workbook_dispose(&self, _ctx: &mut WorkbookHookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn before_sheet_create(&self, _ctx: &mut SheetHookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn after_sheet_create(&self, _ctx: &mut SheetHookContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Runs at the end of every `write` call that touched the sheet.
    fn after_sheet_dispose(&self, _ctx: &mut SheetHookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn before_row_create(&self, _ctx: &mut RowHookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn after_row_create(&self, _ctx: &mut RowHookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn after_row_dispose(&self, _ctx: &mut RowHookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn before_cell_create(&self, _ctx: &mut CellHookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn after_cell_create(&self, _ctx: &mut CellHookContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Data cells only: the value is converted but not yet written.
    fn after_cell_data_converted(&self, _ctx: &mut CellHookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn after_cell_dispose(&self, _ctx: &mut CellHookContext<'_>) -> Result<()> {
        Ok(())
    }
}

/// The holder level a handler was registered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerScope {
    Workbook,
    Sheet(usize),
    Table(usize, usize),
}

impl HandlerScope {
    /// Whether a handler registered here applies at the given position.
    fn covers(&self, sheet_no: Option<usize>, table_no: Option<usize>) -> bool {
        match *self {
            HandlerScope::Workbook => true,
            HandlerScope::Sheet(s) => sheet_no == Some(s),
            HandlerScope::Table(s, t) => sheet_no == Some(s) && table_no == Some(t),
        }
    }
}

struct HandlerEntry {
    scope: HandlerScope,
    seq: usize,
    handler: Arc<dyn WriteHandler>,
}

/// Every handler registered on the workbook and its sheets and tables.
#[derive(Default)]
pub struct HandlerRegistry {
    entries: Vec<HandlerEntry>,
}

pub type HandlerChain = Vec<Arc<dyn WriteHandler>>;

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, scope: HandlerScope, handler: Arc<dyn WriteHandler>) {
        let seq = self.entries.len();
        self.entries.push(HandlerEntry { scope, seq, handler });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Handlers active at a position, in execution order.
    pub fn chain(&self, sheet_no: Option<usize>, table_no: Option<usize>) -> HandlerChain {
        self.collect(|e| e.scope.covers(sheet_no, table_no))
    }

    /// Handlers registered exactly at `scope`, in execution order.
    pub fn own(&self, scope: HandlerScope) -> HandlerChain {
        self.collect(|e| e.scope == scope)
    }

    fn collect(&self, keep: impl Fn(&HandlerEntry) -> bool) -> HandlerChain {
        let mut picked: Vec<&HandlerEntry> = self.entries.iter().filter(|e| keep(e)).collect();
        picked.sort_by_key(|e| (e.handler.order(), e.seq));
        picked.into_iter().map(|e| e.handler.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ordered(i32);

    impl WriteHandler for Ordered {
        fn order(&self) -> i32 {
            self.0
        }
    }

    #[test]
    fn test_chain_order_and_scope() {
        let mut reg = HandlerRegistry::new();
        reg.register(HandlerScope::Workbook, Arc::new(Ordered(5)));
        reg.register(HandlerScope::Sheet(0), Arc::new(Ordered(-1)));
        reg.register(HandlerScope::Sheet(1), Arc::new(Ordered(0)));
        reg.register(HandlerScope::Table(0, 2), Arc::new(Ordered(5)));
        reg.register(HandlerScope::Workbook, Arc::new(Ordered(0)));

        let orders: Vec<i32> = reg.chain(Some(0), None).iter().map(|h| h.order()).collect();
        assert_eq!(orders, vec![-1, 0, 5]);

        let in_table = reg.chain(Some(0), Some(2));
        assert_eq!(in_table.len(), 4);
        // equal order keeps registration order
        assert!(Arc::ptr_eq(&in_table[2], &reg.own(HandlerScope::Workbook)[1]));

        assert_eq!(reg.own(HandlerScope::Sheet(1)).len(), 1);
        assert_eq!(reg.chain(None, None).len(), 2);
    }
}
