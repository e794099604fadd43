// Legacy BIFF (.xls) reading through calamine
//
// calamine decodes a whole sheet at once, so events for a sheet are built
// up front and drained one by one. The DATEMODE flag is not exposed by
// calamine and is read from the workbook stream directly.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::fs;
use std::io::{Cursor, Read, Seek};
use std::path::Path;

use calamine::{Data, Reader, SheetType, SheetVisible, Xls, XlsError};
use chrono::NaiveDateTime;
use sheetstream_engine::cell::{CellRange, DataFormat};
use sheetstream_engine::convert::format::builtin_format;
use sheetstream_engine::events::{
    CellExtra, EventSource, ExtraKind, ExtraSet, RawValue, SheetEvent, SheetEvents, SheetInfo,
};
use sheetstream_engine::{ExcelError, Result};

const RECORD_DATEMODE: u16 = 0x0022;
const RECORD_EOF: u16 = 0x000A;

fn xls_error(e: XlsError) -> ExcelError {
    match e {
        XlsError::Io(io) => ExcelError::Io(io),
        other => ExcelError::fatal(format!("xls: {}", other)),
    }
}

pub struct XlsSource {
    workbook: Xls<Cursor<Vec<u8>>>,
    sheets: Vec<SheetInfo>,
    date_1904: Option<bool>,
}

impl fmt::Debug for XlsSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XlsSource")
            .field("sheets", &self.sheets)
            .field("date_1904", &self.date_1904)
            .finish()
    }
}

impl XlsSource {
    pub fn open(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        Self::from_bytes(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let date_1904 = read_date_mode(Cursor::new(bytes.as_slice()));
        let workbook: Xls<_> = Xls::new(Cursor::new(bytes)).map_err(xls_error)?;

        let sheets = workbook
            .sheets_metadata()
            .iter()
            .filter(|s| s.typ == SheetType::WorkSheet)
            .enumerate()
            .map(|(index, s)| SheetInfo {
                index,
                name: s.name.clone(),
                hidden: s.visible == SheetVisible::Hidden,
                very_hidden: s.visible == SheetVisible::VeryHidden,
            })
            .collect::<Vec<_>>();

        tracing::debug!(sheets = sheets.len(), ?date_1904, "opened xls workbook");
        Ok(XlsSource {
            workbook,
            sheets,
            date_1904,
        })
    }
}

impl EventSource for XlsSource {
    fn sheet_list(&self) -> &[SheetInfo] {
        &self.sheets
    }

    fn date_1904(&self) -> Option<bool> {
        self.date_1904
    }

    fn open_sheet<'a>(
        &'a mut self,
        index: usize,
        extras: ExtraSet,
    ) -> Result<Box<dyn SheetEvents + 'a>> {
        let name = self
            .sheets
            .get(index)
            .map(|s| s.name.clone())
            .ok_or_else(|| ExcelError::config(format!("no sheet at index {}", index)))?;

        let range = self.workbook.worksheet_range(&name).map_err(xls_error)?;
        let start = range.start().unwrap_or((0, 0));

        let mut cells: BTreeMap<(usize, usize), (RawValue, Option<DataFormat>, Option<String>)> =
            BTreeMap::new();
        for (row, col, data) in range.used_cells() {
            let at = (start.0 as usize + row, start.1 as usize + col);
            let (raw, format) = raw_from_data(data);
            cells.insert(at, (raw, format, None));
        }

        match self.workbook.worksheet_formula(&name) {
            Ok(formulas) => {
                let start = formulas.start().unwrap_or((0, 0));
                for (row, col, text) in formulas.used_cells() {
                    if text.is_empty() {
                        continue;
                    }
                    let at = (start.0 as usize + row, start.1 as usize + col);
                    cells
                        .entry(at)
                        .or_insert((RawValue::Empty, None, None))
                        .2 = Some(text.clone());
                }
            }
            Err(e) => tracing::warn!(sheet = %name, error = %e, "xls formulas unreadable"),
        }

        let mut events = VecDeque::new();
        let mut current: Option<usize> = None;
        for ((row, column), (raw, format, formula)) in cells {
            if current != Some(row) {
                if current.is_some() {
                    events.push_back(SheetEvent::RowEnd);
                }
                events.push_back(SheetEvent::RowStart(row));
                current = Some(row);
            }
            events.push_back(SheetEvent::Cell {
                column,
                raw,
                format,
                formula,
            });
        }
        if current.is_some() {
            events.push_back(SheetEvent::RowEnd);
        }

        if extras.contains(ExtraKind::Merge) {
            for dim in self.workbook.worksheet_merge_cells(&name).unwrap_or_default() {
                events.push_back(SheetEvent::Extra(CellExtra {
                    kind: ExtraKind::Merge,
                    text: None,
                    range: CellRange::new(
                        dim.start.0 as usize,
                        dim.end.0 as usize,
                        dim.start.1 as usize,
                        dim.end.1 as usize,
                    ),
                }));
            }
        }
        events.push_back(SheetEvent::SheetEnd);

        Ok(Box::new(XlsEvents { events }))
    }
}

struct XlsEvents {
    events: VecDeque<SheetEvent>,
}

impl SheetEvents for XlsEvents {
    fn next_event(&mut self) -> Result<Option<SheetEvent>> {
        Ok(self.events.pop_front())
    }
}

fn builtin(index: u16) -> DataFormat {
    DataFormat::new(index, builtin_format(index).unwrap_or("General"))
}

/// calamine has already applied the cell's format to tell dates apart, so
/// date cells are handed on as serials with a matching builtin date format.
fn raw_from_data(data: &Data) -> (RawValue, Option<DataFormat>) {
    match data {
        Data::Empty => (RawValue::Empty, None),
        Data::String(s) => (RawValue::Text(s.clone()), None),
        Data::Float(n) => (RawValue::Number(*n), None),
        Data::Int(n) => (RawValue::Number(*n as f64), None),
        Data::Bool(b) => (RawValue::Boolean(*b), None),
        Data::Error(e) => (RawValue::Error(e.to_string()), None),
        Data::DateTime(dt) => {
            let serial = dt.as_f64();
            let index = if dt.is_duration() {
                46
            } else if serial.fract() == 0.0 {
                14
            } else {
                22
            };
            (RawValue::Number(serial), Some(builtin(index)))
        }
        Data::DateTimeIso(s) => match NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
            Ok(dt) => (RawValue::Date(dt), None),
            Err(_) => (RawValue::Text(s.clone()), None),
        },
        Data::DurationIso(s) => (RawValue::Text(s.clone()), None),
    }
}

/// The workbook's DATEMODE flag, `None` when the container or the record
/// cannot be found.
fn read_date_mode<R: Read + Seek>(inner: R) -> Option<bool> {
    let mut comp = cfb::CompoundFile::open(inner).ok()?;
    let mut stream = ["/Workbook", "/Book", "Workbook", "Book"]
        .into_iter()
        .find_map(|candidate| comp.open_stream(candidate).ok())?;
    let mut bytes = Vec::new();
    stream.read_to_end(&mut bytes).ok()?;
    scan_date_mode(&bytes)
}

/// Walk the globals substream records up to the first EOF.
fn scan_date_mode(stream: &[u8]) -> Option<bool> {
    let mut offset = 0usize;
    while offset + 4 <= stream.len() {
        let id = u16::from_le_bytes([stream[offset], stream[offset + 1]]);
        let len = u16::from_le_bytes([stream[offset + 2], stream[offset + 3]]) as usize;
        let data = stream.get(offset + 4..offset + 4 + len)?;
        match id {
            RECORD_DATEMODE => {
                let flag = data.get(0..2).map(|v| u16::from_le_bytes([v[0], v[1]]))?;
                return Some(flag == 1);
            }
            RECORD_EOF => return None,
            _ => {}
        }
        offset += 4 + len;
    }
    None
}
