// CSV/TSV event source and sink

use std::collections::{BTreeMap, VecDeque};
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, Write};
use std::path::{Path, PathBuf};

use encoding_rs::{Decoder, Encoding, UTF_8, WINDOWS_1252};

use sheetstream_engine::cell::{CellRange, CellValue, WriteCellData};
use sheetstream_engine::convert::format::{excel_pattern_to_strftime, format_date, format_number};
use sheetstream_engine::events::{EventSource, ExtraSet, RawValue, SheetEvent, SheetEvents, SheetInfo};
use sheetstream_engine::write::{SheetHandle, SheetSink, SinkOutput};
use sheetstream_engine::{ExcelError, Result};

const BOM: &str = "\u{FEFF}";
const DEFAULT_SHEET_NAME: &str = "Sheet1";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CsvOptions {
    /// `None` sniffs on read and uses a comma on write
    pub delimiter: Option<u8>,
    /// Prefix written files with a UTF-8 byte order mark
    pub bom: bool,
}

/// Detect the most likely field delimiter by checking consistency across the first few lines.
///
/// For each candidate (tab, semicolon, comma, pipe), count fields per line. The delimiter
/// that produces the most consistent field count (>1 field) wins.
pub fn sniff_delimiter(content: &str) -> u8 {
    let candidates: &[u8] = &[b'\t', b';', b',', b'|'];
    let sample_lines: Vec<&str> = content.lines().take(10).collect();

    if sample_lines.is_empty() {
        return b',';
    }

    let mut best = b',';
    let mut best_score = 0u64;

    for &delim in candidates {
        let counts: Vec<usize> = sample_lines
            .iter()
            .map(|line| {
                csv::ReaderBuilder::new()
                    .delimiter(delim)
                    .has_headers(false)
                    .flexible(true)
                    .from_reader(line.as_bytes())
                    .records()
                    .next()
                    .and_then(|r| r.ok())
                    .map(|r| r.len())
                    .unwrap_or(1)
            })
            .collect();

        if counts.first().copied().unwrap_or(0) <= 1 {
            continue;
        }

        // More columns break ties
        let target = counts[0];
        let consistent = counts.iter().filter(|&&c| c == target).count() as u64;
        let score = consistent * target as u64;

        if score > best_score {
            best_score = score;
            best = delim;
        }
    }

    best
}

/// Bytes read up front to pick the encoding and sniff the delimiter.
const SNIFF_BYTES: usize = 8 * 1024;
const DECODE_CHUNK: usize = 8 * 1024;

/// UTF-8 unless the sampled prefix holds invalid UTF-8, in which case the
/// file is taken as Windows-1252 (common for Excel-exported CSVs). A
/// multi-byte character cut off at the end of the sample does not count.
pub fn detect_encoding(prefix: &[u8]) -> &'static Encoding {
    match std::str::from_utf8(prefix) {
        Ok(_) => UTF_8,
        Err(e) if e.error_len().is_none() => UTF_8,
        Err(_) => WINDOWS_1252,
    }
}

/// Decodes its input to UTF-8 a chunk at a time. A leading byte order
/// mark is removed.
pub struct DecodeReader<R> {
    inner: R,
    decoder: Decoder,
    raw: Vec<u8>,
    out: Vec<u8>,
    out_pos: usize,
    finished: bool,
}

impl<R: Read> DecodeReader<R> {
    pub fn new(inner: R, encoding: &'static Encoding) -> Self {
        DecodeReader {
            inner,
            decoder: encoding.new_decoder(),
            raw: vec![0; DECODE_CHUNK],
            out: Vec::new(),
            out_pos: 0,
            finished: false,
        }
    }

    fn fill(&mut self) -> io::Result<()> {
        let read = loop {
            match self.inner.read(&mut self.raw) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        let last = read == 0;
        let max = self
            .decoder
            .max_utf8_buffer_length(read)
            .ok_or_else(|| io::Error::other("decode buffer overflow"))?;
        self.out.clear();
        self.out.resize(max, 0);
        self.out_pos = 0;
        // A buffer of max_utf8_buffer_length always takes the whole chunk
        let (_, _, written, _) = self.decoder.decode_to_utf8(&self.raw[..read], &mut self.out, last);
        self.out.truncate(written);
        self.finished = last;
        Ok(())
    }
}

impl<R: Read> Read for DecodeReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.out_pos >= self.out.len() {
            if self.finished {
                return Ok(0);
            }
            self.fill()?;
        }
        let n = buf.len().min(self.out.len() - self.out_pos);
        buf[..n].copy_from_slice(&self.out[self.out_pos..self.out_pos + n]);
        self.out_pos += n;
        Ok(n)
    }
}

/// Complete lines of the sample, decoded. The last line is dropped when the
/// sample stops short of the end of the input.
fn sample_text(prefix: &[u8], encoding: &'static Encoding, complete: bool) -> String {
    let (text, _) = encoding.decode_with_bom_removal(prefix);
    if complete {
        return text.into_owned();
    }
    match text.rfind('\n') {
        Some(end) => text[..end].to_string(),
        None => text.into_owned(),
    }
}

/// A delimited text file exposed as a single sheet of string cells.
///
/// Only a bounded prefix is held in memory; records are decoded from the
/// underlying reader as the sheet is walked.
pub struct CsvSource {
    input: Option<DecodeReader<Box<dyn Read>>>,
    encoding: &'static Encoding,
    delimiter: u8,
    sheets: Vec<SheetInfo>,
}

impl std::fmt::Debug for CsvSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsvSource")
            .field("encoding", &self.encoding.name())
            .field("delimiter", &(self.delimiter as char))
            .field("sheets", &self.sheets)
            .field("consumed", &self.input.is_none())
            .finish()
    }
}

impl CsvSource {
    pub fn open(path: &Path, options: &CsvOptions) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut prefix = Vec::with_capacity(SNIFF_BYTES);
        (&mut file).take(SNIFF_BYTES as u64).read_to_end(&mut prefix)?;
        file.rewind()?;
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_SHEET_NAME);
        Ok(Self::new(&prefix, Box::new(file), name, options))
    }

    pub fn from_bytes(bytes: Vec<u8>, options: &CsvOptions) -> Self {
        let prefix = bytes[..bytes.len().min(SNIFF_BYTES)].to_vec();
        Self::new(&prefix, Box::new(Cursor::new(bytes)), DEFAULT_SHEET_NAME, options)
    }

    /// `input` yields the whole stream from its first byte; `prefix` is its
    /// first `SNIFF_BYTES` or fewer.
    fn new(prefix: &[u8], input: Box<dyn Read>, name: &str, options: &CsvOptions) -> Self {
        let encoding = detect_encoding(prefix);
        let delimiter = match options.delimiter {
            Some(d) => d,
            None => {
                let complete = prefix.len() < SNIFF_BYTES;
                let d = sniff_delimiter(&sample_text(prefix, encoding, complete));
                tracing::debug!(delimiter = %(d as char).escape_default(), "csv delimiter sniffed");
                d
            }
        };
        tracing::debug!(encoding = encoding.name(), "csv source opened");
        CsvSource {
            input: Some(DecodeReader::new(input, encoding)),
            encoding,
            delimiter,
            sheets: vec![SheetInfo::new(0, name)],
        }
    }

    pub fn delimiter(&self) -> u8 {
        self.delimiter
    }

    pub fn encoding(&self) -> &'static Encoding {
        self.encoding
    }
}

impl EventSource for CsvSource {
    fn sheet_list(&self) -> &[SheetInfo] {
        &self.sheets
    }

    fn open_sheet<'a>(&'a mut self, index: usize, _extras: ExtraSet) -> Result<Box<dyn SheetEvents + 'a>> {
        if index != 0 {
            return Err(ExcelError::config(format!("csv has a single sheet, not {}", index)));
        }
        let input = self
            .input
            .take()
            .ok_or_else(|| ExcelError::config("csv input already consumed"))?;
        let reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(false)
            .flexible(true)
            .from_reader(input);
        Ok(Box::new(CsvEvents {
            reader,
            record: csv::StringRecord::new(),
            row: 0,
            pending: VecDeque::new(),
            done: false,
        }))
    }
}

struct CsvEvents {
    reader: csv::Reader<DecodeReader<Box<dyn Read>>>,
    record: csv::StringRecord,
    row: usize,
    pending: VecDeque<SheetEvent>,
    done: bool,
}

impl SheetEvents for CsvEvents {
    fn next_event(&mut self) -> Result<Option<SheetEvent>> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(Some(event));
        }
        if self.done {
            return Ok(None);
        }
        match self.reader.read_record(&mut self.record) {
            Ok(true) => {
                let row = self.row;
                self.row += 1;
                for (column, field) in self.record.iter().enumerate() {
                    let raw = if field.is_empty() {
                        RawValue::Empty
                    } else {
                        RawValue::Text(field.to_string())
                    };
                    self.pending.push_back(SheetEvent::cell(column, raw));
                }
                self.pending.push_back(SheetEvent::RowEnd);
                Ok(Some(SheetEvent::RowStart(row)))
            }
            Ok(false) => {
                self.done = true;
                Ok(Some(SheetEvent::SheetEnd))
            }
            Err(e) => {
                self.done = true;
                Err(ExcelError::benign(format!("csv record {}: {}", self.row, e)))
            }
        }
    }
}

enum CsvOut {
    File(csv::Writer<File>, PathBuf),
    Bytes(csv::Writer<Vec<u8>>),
}

impl CsvOut {
    fn write_record(&mut self, fields: &[String]) -> Result<()> {
        let written = match self {
            CsvOut::File(w, _) => w.write_record(fields),
            CsvOut::Bytes(w) => w.write_record(fields),
        };
        written.map_err(csv_error)
    }
}

fn csv_error(e: csv::Error) -> ExcelError {
    match e.into_kind() {
        csv::ErrorKind::Io(io) => ExcelError::Io(io),
        other => ExcelError::fatal(format!("csv write: {:?}", other)),
    }
}

/// Writes one sheet as delimited text. Merges and styles are dropped; a
/// style's number format still shapes how numbers and dates render.
pub struct CsvSink {
    out: Option<CsvOut>,
    sheet: Option<String>,
    /// Row being assembled and its cells by column
    current: Option<(usize, BTreeMap<usize, String>)>,
    /// Records emitted so far
    emitted: usize,
}

impl CsvSink {
    pub fn create(path: &Path, options: &CsvOptions) -> Result<Self> {
        let mut file = File::create(path)?;
        if options.bom {
            file.write_all(BOM.as_bytes())?;
        }
        let writer = builder(options).from_writer(file);
        Ok(Self::new(CsvOut::File(writer, path.to_path_buf())))
    }

    pub fn in_memory(options: &CsvOptions) -> Self {
        let mut buf = Vec::new();
        if options.bom {
            buf.extend_from_slice(BOM.as_bytes());
        }
        Self::new(CsvOut::Bytes(builder(options).from_writer(buf)))
    }

    fn new(out: CsvOut) -> Self {
        CsvSink {
            out: Some(out),
            sheet: None,
            current: None,
            emitted: 0,
        }
    }

    fn out(&mut self) -> Result<&mut CsvOut> {
        self.out
            .as_mut()
            .ok_or_else(|| ExcelError::config("csv sink already finished"))
    }

    fn check_sheet(&self, sheet: SheetHandle) -> Result<()> {
        if sheet.0 != 0 || self.sheet.is_none() {
            return Err(ExcelError::config(format!("unknown sheet handle {}", sheet.0)));
        }
        Ok(())
    }

    /// Move the cursor to `row`, flushing the row in progress.
    fn start_row(&mut self, row: usize) -> Result<()> {
        match &self.current {
            Some((current, _)) if *current == row => return Ok(()),
            Some(_) => self.flush_row()?,
            None => {}
        }
        if row < self.emitted {
            return Err(ExcelError::config(format!(
                "csv rows must be written in order: row {} after {}",
                row,
                self.emitted - 1
            )));
        }
        self.current = Some((row, BTreeMap::new()));
        Ok(())
    }

    fn flush_row(&mut self) -> Result<()> {
        let Some((row, cells)) = self.current.take() else {
            return Ok(());
        };
        let blank = vec![String::new()];
        let mut emitted = self.emitted;
        let out = self.out()?;
        // A lone empty field keeps blank rows visible to readers
        while emitted < row {
            out.write_record(&blank)?;
            emitted += 1;
        }
        let width = cells.keys().next_back().map_or(0, |c| c + 1);
        let mut record = vec![String::new(); width];
        for (column, text) in cells {
            record[column] = text;
        }
        if record.is_empty() {
            record = blank;
        }
        out.write_record(&record)?;
        self.emitted = row + 1;
        Ok(())
    }
}

fn builder(options: &CsvOptions) -> csv::WriterBuilder {
    let mut builder = csv::WriterBuilder::new();
    builder.delimiter(options.delimiter.unwrap_or(b',')).flexible(true);
    builder
}

/// Text a cell shows in a delimited file.
pub fn render_cell(cell: &WriteCellData) -> String {
    let pattern = cell.style.as_ref().and_then(|s| s.number_format.as_deref());
    match &cell.value {
        CellValue::Empty => cell
            .formula
            .as_ref()
            .map(|f| format!("={}", f.trim_start_matches('=')))
            .unwrap_or_default(),
        CellValue::String(s) | CellValue::Error(s) => s.clone(),
        CellValue::RichText(r) => r.text.clone(),
        CellValue::Number(n) => format_number(n.value, pattern, false),
        CellValue::Boolean(b) => b.to_string(),
        CellValue::Date(d) => match pattern {
            Some(p) if !p.is_empty() && !p.eq_ignore_ascii_case("general") => {
                d.format(&excel_pattern_to_strftime(p)).to_string()
            }
            _ => format_date(*d, None),
        },
    }
}

impl SheetSink for CsvSink {
    fn format(&self) -> &'static str {
        "csv"
    }

    fn create_sheet(&mut self, _sheet_no: usize, name: &str) -> Result<SheetHandle> {
        if let Some(existing) = &self.sheet {
            return Err(ExcelError::config(format!(
                "csv holds a single sheet; '{}' already written, cannot add '{}'",
                existing, name
            )));
        }
        self.sheet = Some(name.to_string());
        Ok(SheetHandle(0))
    }

    fn create_row(&mut self, sheet: SheetHandle, row: usize) -> Result<()> {
        self.check_sheet(sheet)?;
        self.start_row(row)
    }

    fn write_cell(&mut self, sheet: SheetHandle, row: usize, column: usize, cell: &WriteCellData) -> Result<()> {
        self.check_sheet(sheet)?;
        self.start_row(row)?;
        if let Some((_, cells)) = self.current.as_mut() {
            cells.insert(column, render_cell(cell));
        }
        Ok(())
    }

    fn merge(&mut self, sheet: SheetHandle, _range: CellRange) -> Result<()> {
        self.check_sheet(sheet)
    }

    fn set_column_width(&mut self, sheet: SheetHandle, _column: usize, _width: f64) -> Result<()> {
        self.check_sheet(sheet)
    }

    fn set_row_height(&mut self, sheet: SheetHandle, _row: usize, _height: f64) -> Result<()> {
        self.check_sheet(sheet)
    }

    fn finish(&mut self) -> Result<SinkOutput> {
        self.flush_row()?;
        let out = self
            .out
            .take()
            .ok_or_else(|| ExcelError::config("csv sink already finished"))?;
        match out {
            CsvOut::File(mut w, path) => {
                w.flush()?;
                Ok(SinkOutput::File(path))
            }
            CsvOut::Bytes(w) => {
                let bytes = w
                    .into_inner()
                    .map_err(|e| ExcelError::Io(std::io::Error::other(e.to_string())))?;
                Ok(SinkOutput::Bytes(bytes))
            }
        }
    }

    fn discard(&mut self) -> Result<()> {
        self.current = None;
        if let Some(CsvOut::File(w, path)) = self.out.take() {
            drop(w);
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}
