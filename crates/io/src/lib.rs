// Format adapters and the reader/writer entry points

pub mod csv;
pub mod format;
pub mod reader;
pub mod writer;
pub mod xls;
pub mod xlsx;
pub mod xlsx_sink;
mod xml;

pub use format::ExcelFormat;
pub use reader::{read_sync, ExcelReader, FormatSource, ReadOptions};
pub use writer::{write_sync, ExcelWriter, WriteOptions};
