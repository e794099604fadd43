// Write entry point: pick a sink for the target and own the write context

use std::path::Path;

use sheetstream_engine::record::Record;
use sheetstream_engine::write::{SheetSink, SinkOutput, WriteContext, WriteSheet, WriteTable, WriteWorkbook};
use sheetstream_engine::{ExcelError, Result};

use crate::csv::{CsvOptions, CsvSink};
use crate::format::ExcelFormat;
use crate::xlsx_sink::XlsxSink;

#[derive(Debug, Default)]
pub struct WriteOptions {
    /// Overrides the output extension; xlsx when neither says otherwise
    pub format: Option<ExcelFormat>,
    pub csv: CsvOptions,
    pub workbook: WriteWorkbook,
}

/// An open workbook on the write side. Dropping it without
/// [`ExcelWriter::finish`] still finishes the output.
pub struct ExcelWriter {
    ctx: WriteContext,
    format: ExcelFormat,
}

impl ExcelWriter {
    pub fn create(path: impl AsRef<Path>, options: WriteOptions) -> Result<Self> {
        let path = path.as_ref();
        let format = ExcelFormat::for_output(path, options.format)?;
        tracing::debug!(path = %path.display(), format = format.tag(), "creating workbook");
        let sink: Box<dyn SheetSink> = match format {
            ExcelFormat::Csv => Box::new(CsvSink::create(path, &options.csv)?),
            _ => Box::new(XlsxSink::create(path)),
        };
        Self::with_sink(sink, format, options)
    }

    /// Collect the output in memory; `finish` yields [`SinkOutput::Bytes`].
    pub fn in_memory(options: WriteOptions) -> Result<Self> {
        let format = options.format.unwrap_or(ExcelFormat::Xlsx);
        let sink: Box<dyn SheetSink> = match format {
            ExcelFormat::Csv => Box::new(CsvSink::in_memory(&options.csv)),
            ExcelFormat::Xlsx => Box::new(XlsxSink::in_memory()),
            ExcelFormat::Xls => return Err(ExcelError::config("writing xls is not supported")),
        };
        Self::with_sink(sink, format, options)
    }

    fn with_sink(sink: Box<dyn SheetSink>, format: ExcelFormat, options: WriteOptions) -> Result<Self> {
        let mut workbook = options.workbook;
        if format == ExcelFormat::Csv {
            // Text output carries no styling
            workbook.basic.use_default_style.get_or_insert(false);
        }
        if format == ExcelFormat::Xlsx && workbook.basic.config.use_1904_windowing == Some(true) {
            tracing::warn!("xlsx output always uses the 1900 date system; ignoring use_1904_windowing");
        }
        Ok(ExcelWriter {
            ctx: WriteContext::new(sink, workbook)?,
            format,
        })
    }

    pub fn format(&self) -> ExcelFormat {
        self.format
    }

    pub fn context(&self) -> &WriteContext {
        &self.ctx
    }

    /// Append `rows` to a sheet, or to a table inside it. Repeated calls
    /// on the same sheet continue below the last written row.
    pub fn write<T: Record>(&mut self, sheet: &WriteSheet, table: Option<&WriteTable>, rows: &[T]) -> Result<()> {
        self.ctx.write(sheet, table, rows)
    }

    /// Produce the output. After a failed write the output is discarded
    /// unless the workbook asked to keep it; `None` then, or when called again.
    pub fn finish(&mut self) -> Result<Option<SinkOutput>> {
        self.ctx.finish(false)
    }
}

/// Write `rows` to one sheet of `path` and finish.
pub fn write_sync<T: Record>(
    path: impl AsRef<Path>,
    sheet: &WriteSheet,
    rows: &[T],
    options: WriteOptions,
) -> Result<()> {
    let mut writer = ExcelWriter::create(path, options)?;
    writer.write(sheet, None, rows)?;
    writer.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sheetstream_engine::record::{RowMap, Value};
    use sheetstream_engine::write::WriteBasic;
    use std::collections::BTreeMap;

    fn row(values: &[(usize, Value)]) -> RowMap {
        RowMap(values.iter().cloned().collect::<BTreeMap<_, _>>())
    }

    #[test]
    fn test_csv_in_memory_output() {
        let mut writer = ExcelWriter::in_memory(WriteOptions {
            format: Some(ExcelFormat::Csv),
            ..Default::default()
        })
        .unwrap();
        let sheet = WriteSheet::index(0).with(WriteBasic::default().head(vec![vec!["name".into()], vec!["n".into()]]));
        writer
            .write(&sheet, None, &[row(&[(0, Value::String("ann".into())), (1, Value::Int(3))])])
            .unwrap();

        let Some(SinkOutput::Bytes(bytes)) = writer.finish().unwrap() else {
            panic!("expected bytes");
        };
        assert_eq!(String::from_utf8(bytes).unwrap(), "name,n\nann,3\n");
        assert!(writer.finish().unwrap().is_none());
    }

    #[test]
    fn test_xls_target_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ExcelWriter::create(dir.path().join("out.xls"), WriteOptions::default()),
            Err(ExcelError::Config(_))
        ));
        assert!(matches!(
            ExcelWriter::in_memory(WriteOptions {
                format: Some(ExcelFormat::Xls),
                ..Default::default()
            }),
            Err(ExcelError::Config(_))
        ));
    }

    #[test]
    fn test_unknown_extension_writes_xlsx() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.out");
        write_sync(&path, &WriteSheet::named("Data"), &[row(&[(0, Value::Float(1.5))])], WriteOptions::default())
            .unwrap();
        let head = std::fs::read(&path).unwrap();
        assert!(head.starts_with(b"PK"));
    }
}
