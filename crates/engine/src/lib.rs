//! Streaming analysis-and-binding engine for spreadsheet data.
//!
//! Reading: an [`events::EventSource`] feeds cell events through
//! [`read::ExcelAnalyser`], which binds each row to a [`record::Record`] and
//! hands it to [`read::ReadListener`]s. Writing: [`write::WriteContext`]
//! converts records to cells and drives a [`write::SheetSink`] through the
//! [`write::WriteHandler`] chain. Format decoding and encoding live in the
//! adapters, not here.

pub mod cache;
pub mod cell;
pub mod config;
pub mod convert;
pub mod error;
pub mod events;
pub mod head;
pub mod numeric;
pub mod read;
pub mod record;
pub mod style;
pub mod write;

pub use cell::{CellData, CellKind, CellRange, CellValue, DataFormat, WriteCellData};
pub use config::{CacheLocation, GlobalConfiguration, HolderConfig, ReadDefaultReturn};
pub use convert::{ConvertContext, Converter, ConverterRegistry};
pub use error::{BoxError, ExcelError, Result};
pub use events::{EventSource, MemorySource, SheetEvent, SheetInfo};
pub use read::{ExcelAnalyser, ReadListener, ReadSheet, ReadWorkbook};
pub use record::{FieldSpec, Record, RowMap, RowValues, TargetType, Value};
pub use style::CellStyle;
pub use write::{SheetSink, WriteContext, WriteHandler, WriteSheet, WriteTable, WriteWorkbook};
