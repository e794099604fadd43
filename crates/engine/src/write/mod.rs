// Write pipeline: holders, handler chain, sink contract

pub mod builtin;
mod context;
mod executor;
pub mod handler;
pub mod sink;

use std::fmt;
use std::sync::Arc;

use crate::config::{GlobalConfiguration, HolderConfig};
use crate::convert::Converter;
use crate::error::BoxError;
use crate::record::{ColumnFilter, SharedFieldCache};

pub use context::{WriteContext, WriteSheetHolder, WriteTableHolder};
pub use handler::{
    CellHookContext, HandlerRegistry, HandlerScope, Position, RowHookContext, SheetHookContext,
    WorkbookHookContext, WriteHandler,
};
pub use sink::{MemorySheet, MemorySink, MemoryWorkbook, SheetHandle, SheetSink, SinkOutput};

/// Applied to the finished file bytes when a password is set.
pub trait EncryptionStep: Send + Sync {
    fn encrypt(&self, plain: Vec<u8>, password: &str) -> Result<Vec<u8>, BoxError>;
}

/// Options every write level can set. Unset values inherit.
#[derive(Clone, Default)]
pub struct WriteBasic {
    /// Literal head (outer list = columns), used for untyped rows
    pub head: Option<Vec<Vec<String>>>,
    pub need_head: Option<bool>,
    /// Blank rows left above the head
    pub relative_head_row_index: Option<usize>,
    pub automatic_merge_head: Option<bool>,
    pub use_default_style: Option<bool>,
    pub filter: Option<ColumnFilter>,
    pub config: HolderConfig,
    pub converters: Vec<Arc<dyn Converter>>,
    pub handlers: Vec<Arc<dyn WriteHandler>>,
}

impl WriteBasic {
    pub fn head(mut self, head: Vec<Vec<String>>) -> Self {
        self.head = Some(head);
        self
    }

    pub fn need_head(mut self, need: bool) -> Self {
        self.need_head = Some(need);
        self
    }

    pub fn relative_head_row_index(mut self, rows: usize) -> Self {
        self.relative_head_row_index = Some(rows);
        self
    }

    pub fn automatic_merge_head(mut self, merge: bool) -> Self {
        self.automatic_merge_head = Some(merge);
        self
    }

    pub fn use_default_style(mut self, on: bool) -> Self {
        self.use_default_style = Some(on);
        self
    }

    pub fn filter(mut self, filter: ColumnFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn converter(mut self, converter: Arc<dyn Converter>) -> Self {
        self.converters.push(converter);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn WriteHandler>) -> Self {
        self.handlers.push(handler);
        self
    }
}

impl fmt::Debug for WriteBasic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteBasic")
            .field("head", &self.head)
            .field("need_head", &self.need_head)
            .field("relative_head_row_index", &self.relative_head_row_index)
            .field("automatic_merge_head", &self.automatic_merge_head)
            .field("use_default_style", &self.use_default_style)
            .field("filter", &self.filter)
            .field("config", &self.config)
            .field("converters", &self.converters.len())
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Fully resolved write options at one level.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteParams {
    pub head: Option<Vec<Vec<String>>>,
    pub need_head: bool,
    pub relative_head_row_index: usize,
    pub automatic_merge_head: bool,
    pub use_default_style: bool,
    pub filter: ColumnFilter,
}

impl Default for WriteParams {
    fn default() -> Self {
        WriteParams {
            head: None,
            need_head: true,
            relative_head_row_index: 0,
            automatic_merge_head: true,
            use_default_style: true,
            filter: ColumnFilter::default(),
        }
    }
}

impl WriteParams {
    pub fn overlay(&self, basic: &WriteBasic) -> WriteParams {
        WriteParams {
            head: basic.head.clone().or_else(|| self.head.clone()),
            need_head: basic.need_head.unwrap_or(self.need_head),
            relative_head_row_index: basic
                .relative_head_row_index
                .unwrap_or(self.relative_head_row_index),
            automatic_merge_head: basic
                .automatic_merge_head
                .unwrap_or(self.automatic_merge_head),
            use_default_style: basic.use_default_style.unwrap_or(self.use_default_style),
            filter: basic.filter.clone().unwrap_or_else(|| self.filter.clone()),
        }
    }
}

#[derive(Default)]
pub struct WriteWorkbook {
    pub basic: WriteBasic,
    pub global: GlobalConfiguration,
    /// Keep the output even when writing failed
    pub write_excel_on_exception: bool,
    pub password: Option<String>,
    pub encryption: Option<Box<dyn EncryptionStep>>,
    pub shared_field_cache: Option<SharedFieldCache>,
}

impl fmt::Debug for WriteWorkbook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteWorkbook")
            .field("basic", &self.basic)
            .field("global", &self.global)
            .field("write_excel_on_exception", &self.write_excel_on_exception)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("encryption", &self.encryption.is_some())
            .finish()
    }
}

/// Selects one output sheet. Index wins over name.
#[derive(Debug, Clone, Default)]
pub struct WriteSheet {
    pub sheet_no: Option<usize>,
    pub sheet_name: Option<String>,
    pub basic: WriteBasic,
}

impl WriteSheet {
    pub fn index(sheet_no: usize) -> Self {
        WriteSheet {
            sheet_no: Some(sheet_no),
            ..Default::default()
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        WriteSheet {
            sheet_name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with(mut self, basic: WriteBasic) -> Self {
        self.basic = basic;
        self
    }
}

/// A block of rows with its own head inside a sheet.
#[derive(Debug, Clone, Default)]
pub struct WriteTable {
    pub table_no: usize,
    pub basic: WriteBasic,
}

impl WriteTable {
    pub fn new(table_no: usize) -> Self {
        WriteTable {
            table_no,
            basic: WriteBasic::default(),
        }
    }

    pub fn with(mut self, basic: WriteBasic) -> Self {
        self.basic = basic;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_overlay() {
        let base = WriteParams::default();
        let sheet = base.overlay(&WriteBasic::default().relative_head_row_index(2).need_head(false));
        assert_eq!(sheet.relative_head_row_index, 2);
        assert!(!sheet.need_head);
        assert!(sheet.automatic_merge_head);

        let table = sheet.overlay(&WriteBasic::default().need_head(true));
        assert!(table.need_head);
        assert_eq!(table.relative_head_row_index, 2);
    }
}
