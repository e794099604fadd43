// Read entry point: pick an adapter for the file and drive the analyser

use std::path::Path;

use sheetstream_engine::cache::ValueCache;
use sheetstream_engine::events::{EventSource, ExtraSet, SheetEvents, SheetInfo};
use sheetstream_engine::read::{CollectingListener, ExcelAnalyser, ReadListener, ReadSheet, ReadWorkbook};
use sheetstream_engine::record::Record;
use sheetstream_engine::Result;

use crate::csv::{CsvOptions, CsvSource};
use crate::format::ExcelFormat;
use crate::xls::XlsSource;
use crate::xlsx::XlsxSource;

/// One of the built-in read adapters.
#[derive(Debug)]
pub enum FormatSource {
    Csv(CsvSource),
    Xlsx(XlsxSource),
    Xls(XlsSource),
}

impl FormatSource {
    pub fn open(path: &Path, format: ExcelFormat, csv: &CsvOptions) -> Result<Self> {
        Ok(match format {
            ExcelFormat::Csv => FormatSource::Csv(CsvSource::open(path, csv)?),
            ExcelFormat::Xlsx => FormatSource::Xlsx(XlsxSource::open(path)?),
            ExcelFormat::Xls => FormatSource::Xls(XlsSource::open(path)?),
        })
    }

    pub fn from_bytes(bytes: Vec<u8>, format: ExcelFormat, csv: &CsvOptions) -> Result<Self> {
        Ok(match format {
            ExcelFormat::Csv => FormatSource::Csv(CsvSource::from_bytes(bytes, csv)),
            ExcelFormat::Xlsx => FormatSource::Xlsx(XlsxSource::from_bytes(bytes)?),
            ExcelFormat::Xls => FormatSource::Xls(XlsSource::from_bytes(bytes)?),
        })
    }

    pub fn format(&self) -> ExcelFormat {
        match self {
            FormatSource::Csv(_) => ExcelFormat::Csv,
            FormatSource::Xlsx(_) => ExcelFormat::Xlsx,
            FormatSource::Xls(_) => ExcelFormat::Xls,
        }
    }

    fn inner(&self) -> &dyn EventSource {
        match self {
            FormatSource::Csv(s) => s,
            FormatSource::Xlsx(s) => s,
            FormatSource::Xls(s) => s,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn EventSource {
        match self {
            FormatSource::Csv(s) => s,
            FormatSource::Xlsx(s) => s,
            FormatSource::Xls(s) => s,
        }
    }
}

impl EventSource for FormatSource {
    fn sheet_list(&self) -> &[SheetInfo] {
        self.inner().sheet_list()
    }

    fn date_1904(&self) -> Option<bool> {
        self.inner().date_1904()
    }

    fn shared_values_size_hint(&self) -> Option<u64> {
        self.inner().shared_values_size_hint()
    }

    fn load_shared_values(&mut self, cache: &mut dyn ValueCache) -> Result<()> {
        self.inner_mut().load_shared_values(cache)
    }

    fn open_sheet<'a>(&'a mut self, index: usize, extras: ExtraSet) -> Result<Box<dyn SheetEvents + 'a>> {
        self.inner_mut().open_sheet(index, extras)
    }

    fn close(&mut self) -> Result<()> {
        self.inner_mut().close()
    }
}

#[derive(Debug, Default)]
pub struct ReadOptions {
    /// Overrides extension and content sniffing
    pub format: Option<ExcelFormat>,
    pub csv: CsvOptions,
    pub workbook: ReadWorkbook,
}

/// An open workbook on the read side.
///
/// Each physical sheet can be read once. Resources are released by
/// [`ExcelReader::finish`] or on drop.
pub struct ExcelReader {
    analyser: ExcelAnalyser<FormatSource>,
}

impl ExcelReader {
    pub fn open(path: impl AsRef<Path>, options: ReadOptions) -> Result<Self> {
        let path = path.as_ref();
        let format = ExcelFormat::detect(path, options.format)?;
        tracing::debug!(path = %path.display(), format = format.tag(), "opening workbook");
        let source = FormatSource::open(path, format, &options.csv)?;
        Self::with_source(source, options.workbook)
    }

    /// Bytes without a declared format are sniffed by their leading bytes.
    pub fn from_bytes(bytes: Vec<u8>, options: ReadOptions) -> Result<Self> {
        let format = options
            .format
            .unwrap_or_else(|| ExcelFormat::from_magic(&bytes));
        let source = FormatSource::from_bytes(bytes, format, &options.csv)?;
        Self::with_source(source, options.workbook)
    }

    fn with_source(source: FormatSource, workbook: ReadWorkbook) -> Result<Self> {
        Ok(ExcelReader {
            analyser: ExcelAnalyser::new(source, workbook)?,
        })
    }

    pub fn format(&self) -> ExcelFormat {
        self.analyser.source().format()
    }

    pub fn sheet_list(&self) -> &[SheetInfo] {
        self.analyser.sheet_list()
    }

    pub fn read_sheet<T: Record>(
        &mut self,
        sheet: ReadSheet,
        listeners: &mut [&mut dyn ReadListener<T>],
    ) -> Result<()> {
        self.analyser.read(&[sheet], listeners)
    }

    pub fn read_sheets<T: Record>(
        &mut self,
        sheets: &[ReadSheet],
        listeners: &mut [&mut dyn ReadListener<T>],
    ) -> Result<()> {
        self.analyser.read(sheets, listeners)
    }

    pub fn read_all<T: Record>(&mut self, listeners: &mut [&mut dyn ReadListener<T>]) -> Result<()> {
        self.analyser.read_all(listeners)
    }

    pub fn finish(&mut self) -> Result<()> {
        self.analyser.finish()
    }
}

/// Read the first sheet of `path` into memory.
pub fn read_sync<T: Record + Clone>(path: impl AsRef<Path>, options: ReadOptions) -> Result<Vec<T>> {
    let mut reader = ExcelReader::open(path, options)?;
    let mut collect = CollectingListener::new();
    reader.read_sheet(ReadSheet::default(), &mut [&mut collect])?;
    reader.finish()?;
    Ok(collect.into_rows())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sheetstream_engine::record::{RowMap, Value};
    use std::fs;

    #[test]
    fn test_reader_sniffs_csv_bytes() {
        let mut reader = ExcelReader::from_bytes(b"name,age\nann,31\n".to_vec(), ReadOptions::default()).unwrap();
        assert_eq!(reader.format(), ExcelFormat::Csv);
        assert_eq!(reader.sheet_list().len(), 1);

        let mut collect = CollectingListener::<RowMap>::new();
        reader.read_all(&mut [&mut collect]).unwrap();
        assert_eq!(collect.rows().len(), 1);
        assert_eq!(collect.rows()[0].get(0), Some(&Value::String("ann".into())));
        assert_eq!(collect.heads()[0].get(&1).map(String::as_str), Some("age"));
    }

    #[test]
    fn test_read_sync_first_sheet() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("people.csv");
        fs::write(&path, "name;age\nbo;7\ncy;9\n").unwrap();

        let rows: Vec<RowMap> = read_sync(&path, ReadOptions::default()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].get(0), Some(&Value::String("cy".into())));
    }

    #[test]
    fn test_sheet_read_twice_rejected() {
        let mut reader = ExcelReader::from_bytes(b"a\n1\n".to_vec(), ReadOptions::default()).unwrap();
        let mut collect = CollectingListener::<RowMap>::new();
        reader.read_sheet(ReadSheet::index(0), &mut [&mut collect]).unwrap();
        assert!(reader.read_sheet(ReadSheet::index(0), &mut [&mut collect]).is_err());
        reader.finish().unwrap();
        reader.finish().unwrap();
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ExcelReader::open(dir.path().join("nope.xlsx"), ReadOptions::default()).err().unwrap();
        assert!(matches!(err, sheetstream_engine::ExcelError::Io(_)));
    }
}
