// Streaming read pipeline: holders, listeners, the row processor

mod analyser;
pub mod context;
pub mod listener;
mod processor;

use std::fmt;
use std::sync::Arc;

use crate::cache::{CacheSelector, SimpleCacheSelector};
use crate::config::{GlobalConfiguration, HolderConfig, ReadDefaultReturn};
use crate::convert::Converter;
use crate::events::ExtraSet;
use crate::record::SharedFieldCache;

pub use analyser::ExcelAnalyser;
pub use context::{HolderRef, ReadContext, ReadSheetHolder, ReadWorkbookHolder, RowHolder, RowKind};
pub use listener::{
    CollectingListener, ExceptionAction, IgnoreExceptionListener, PageReadListener, ReadListener,
};

/// Workbook-level read options.
pub struct ReadWorkbook {
    pub global: GlobalConfiguration,
    pub config: HolderConfig,
    /// `None` derives the count from the head (1 without one)
    pub head_row_number: Option<usize>,
    pub ignore_empty_row: bool,
    /// Skip hidden and very hidden sheets, whether requested or not
    pub ignore_hidden_sheet: bool,
    pub read_default_return: ReadDefaultReturn,
    pub extra_read: ExtraSet,
    pub converters: Vec<Arc<dyn Converter>>,
    /// Literal head shared by every sheet (outer list = columns)
    pub head: Option<Vec<Vec<String>>>,
    pub cache_selector: Box<dyn CacheSelector>,
    pub shared_field_cache: Option<SharedFieldCache>,
}

impl Default for ReadWorkbook {
    fn default() -> Self {
        ReadWorkbook {
            global: GlobalConfiguration::default(),
            config: HolderConfig::default(),
            head_row_number: None,
            ignore_empty_row: true,
            ignore_hidden_sheet: false,
            read_default_return: ReadDefaultReturn::String,
            extra_read: ExtraSet::none(),
            converters: Vec::new(),
            head: None,
            cache_selector: Box::new(SimpleCacheSelector::default()),
            shared_field_cache: None,
        }
    }
}

impl fmt::Debug for ReadWorkbook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadWorkbook")
            .field("config", &self.global.overlay(&self.config))
            .field("head_row_number", &self.head_row_number)
            .field("ignore_empty_row", &self.ignore_empty_row)
            .field("ignore_hidden_sheet", &self.ignore_hidden_sheet)
            .field("read_default_return", &self.read_default_return)
            .field("extra_read", &self.extra_read)
            .field("converters", &self.converters.len())
            .finish()
    }
}

/// Selects one sheet and carries its overrides.
#[derive(Clone, Default)]
pub struct ReadSheet {
    pub sheet_no: Option<usize>,
    pub sheet_name: Option<String>,
    pub head_row_number: Option<usize>,
    pub config: HolderConfig,
    pub converters: Vec<Arc<dyn Converter>>,
    pub head: Option<Vec<Vec<String>>>,
    /// Stop after this many physical rows
    pub num_rows: Option<usize>,
}

impl ReadSheet {
    pub fn index(sheet_no: usize) -> Self {
        ReadSheet {
            sheet_no: Some(sheet_no),
            ..Default::default()
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        ReadSheet {
            sheet_name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn head_row_number(mut self, rows: usize) -> Self {
        self.head_row_number = Some(rows);
        self
    }

    pub fn head(mut self, head: Vec<Vec<String>>) -> Self {
        self.head = Some(head);
        self
    }

    pub fn num_rows(mut self, rows: usize) -> Self {
        self.num_rows = Some(rows);
        self
    }

    pub fn converter(mut self, converter: Arc<dyn Converter>) -> Self {
        self.converters.push(converter);
        self
    }
}

impl fmt::Debug for ReadSheet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadSheet")
            .field("sheet_no", &self.sheet_no)
            .field("sheet_name", &self.sheet_name)
            .field("head_row_number", &self.head_row_number)
            .field("num_rows", &self.num_rows)
            .finish()
    }
}
