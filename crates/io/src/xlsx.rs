// XLSX event source: workbook, styles and shared strings up front, sheets streamed

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{BufReader, Cursor};
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime};
use quick_xml::events::{BytesStart, Event};
use sheetstream_engine::cache::ValueCache;
use sheetstream_engine::convert::format::builtin_format;
use sheetstream_engine::events::{
    CellExtra, EventSource, ExtraKind, ExtraSet, RawValue, SheetEvent, SheetEvents, SheetInfo,
};
use sheetstream_engine::{CellRange, DataFormat, ExcelError, Result};
use zip::ZipArchive;

use crate::xml::{
    self, attr, column_letters, open_part, parse_cell_ref, parse_range_ref, parse_relationships,
    push_text, read_part, resolve_target, str_reader, Archive, PartReader, ReadSeek,
};

const DEFAULT_WORKBOOK: &str = "xl/workbook.xml";

#[derive(Debug, Clone)]
struct SheetPart {
    path: String,
}

/// Streams cells out of an xlsx package.
pub struct XlsxSource {
    archive: Archive,
    sheets: Vec<SheetInfo>,
    parts: Vec<SheetPart>,
    /// Number format of each `cellXfs` entry
    formats: Vec<DataFormat>,
    date_1904: bool,
    shared_strings: Option<String>,
    shared_strings_size: Option<u64>,
}

impl std::fmt::Debug for XlsxSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XlsxSource")
            .field("sheets", &self.sheets)
            .field("formats", &self.formats.len())
            .field("date_1904", &self.date_1904)
            .field("shared_strings", &self.shared_strings)
            .finish()
    }
}

impl XlsxSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(Box::new(BufReader::new(file)))
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        Self::from_reader(Box::new(Cursor::new(bytes)))
    }

    fn from_reader(reader: Box<dyn ReadSeek>) -> Result<Self> {
        let mut archive = ZipArchive::new(reader).map_err(xml::zip_error)?;

        let workbook_path = read_part(&mut archive, "_rels/.rels")?
            .and_then(|rels| {
                parse_relationships(&rels)
                    .into_iter()
                    .find(|r| r.kind == "officeDocument")
                    .map(|r| resolve_target("", &r.target))
            })
            .unwrap_or_else(|| DEFAULT_WORKBOOK.to_string());
        let workbook_xml = read_part(&mut archive, &workbook_path)?
            .ok_or_else(|| ExcelError::fatal(format!("package has no workbook part {}", workbook_path)))?;
        let base = xml::parent_dir(&workbook_path).to_string();
        let rels = read_part(&mut archive, &xml::rels_path(&workbook_path))?
            .map(|x| parse_relationships(&x))
            .unwrap_or_default();

        let by_id: HashMap<&str, &xml::Relationship> = rels.iter().map(|r| (r.id.as_str(), r)).collect();
        let book = parse_workbook(&workbook_xml);
        let mut sheets = Vec::new();
        let mut parts = Vec::new();
        for entry in book.sheets {
            let Some(rel) = entry.rel_id.as_deref().and_then(|id| by_id.get(id)) else {
                tracing::warn!(sheet = %entry.name, "sheet has no relationship, skipped");
                continue;
            };
            if rel.kind != "worksheet" {
                continue;
            }
            let mut info = SheetInfo::new(sheets.len(), entry.name);
            info.hidden = entry.state != "visible";
            info.very_hidden = entry.state == "veryHidden";
            sheets.push(info);
            parts.push(SheetPart {
                path: resolve_target(&base, &rel.target),
            });
        }

        let find_part = |kind: &str, fallback: &str| {
            rels.iter()
                .find(|r| r.kind == kind)
                .map(|r| resolve_target(&base, &r.target))
                .unwrap_or_else(|| format!("{}/{}", base, fallback))
        };
        let styles_path = find_part("styles", "styles.xml");
        let formats = match read_part(&mut archive, &styles_path)? {
            Some(styles) => parse_cell_formats(&styles),
            None => Vec::new(),
        };
        let shared_path = find_part("sharedStrings", "sharedStrings.xml");
        let (shared_strings, shared_strings_size) = if xml::has_part(&archive, &shared_path) {
            let size = xml::part_size(&mut archive, &shared_path);
            (Some(shared_path), size)
        } else {
            (None, None)
        };

        tracing::debug!(
            sheets = sheets.len(),
            formats = formats.len(),
            date_1904 = book.date_1904,
            "xlsx package opened"
        );
        Ok(XlsxSource {
            archive,
            sheets,
            parts,
            formats,
            date_1904: book.date_1904,
            shared_strings,
            shared_strings_size,
        })
    }

    /// Comments of one sheet, keyed by the owning part's relationships.
    fn read_comments(&mut self, part: &str, rels: &[xml::Relationship]) -> Result<Vec<CellExtra>> {
        let dir = xml::parent_dir(part).to_string();
        let mut out = Vec::new();
        for rel in rels.iter().filter(|r| r.kind == "comments") {
            let path = resolve_target(&dir, &rel.target);
            if let Some(content) = read_part(&mut self.archive, &path)? {
                out.extend(parse_comments(&content));
            }
        }
        Ok(out)
    }
}

struct WorkbookSheet {
    name: String,
    state: String,
    rel_id: Option<String>,
}

struct WorkbookInfo {
    sheets: Vec<WorkbookSheet>,
    date_1904: bool,
}

fn parse_workbook(content: &str) -> WorkbookInfo {
    let mut info = WorkbookInfo {
        sheets: Vec::new(),
        date_1904: false,
    };
    let mut reader = str_reader(content);
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => match e.local_name().as_ref() {
                b"workbookPr" => {
                    info.date_1904 = attr(e, b"date1904").is_some_and(|v| is_true(&v));
                }
                b"sheet" => info.sheets.push(WorkbookSheet {
                    name: attr(e, b"name").unwrap_or_default(),
                    state: attr(e, b"state").unwrap_or_else(|| "visible".to_string()),
                    rel_id: attr(e, b"id"),
                }),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                tracing::warn!(error = %e, "workbook part unreadable past this point");
                break;
            }
            _ => {}
        }
    }
    info
}

fn is_true(v: &str) -> bool {
    v == "1" || v.eq_ignore_ascii_case("true")
}

/// `numFmts` + `cellXfs` → one data format per style index.
fn parse_cell_formats(content: &str) -> Vec<DataFormat> {
    let mut custom: HashMap<u16, String> = HashMap::new();
    let mut formats = Vec::new();
    let mut in_cell_xfs = false;
    let mut reader = str_reader(content);
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => match e.local_name().as_ref() {
                b"numFmt" => {
                    let id = attr(e, b"numFmtId").and_then(|v| v.parse::<u16>().ok());
                    if let (Some(id), Some(code)) = (id, attr(e, b"formatCode")) {
                        custom.insert(id, code);
                    }
                }
                b"cellXfs" => in_cell_xfs = true,
                b"xf" if in_cell_xfs => {
                    let id = attr(e, b"numFmtId")
                        .and_then(|v| v.parse::<u16>().ok())
                        .unwrap_or(0);
                    formats.push(id);
                }
                _ => {}
            },
            Ok(Event::End(ref e)) if e.local_name().as_ref() == b"cellXfs" => in_cell_xfs = false,
            Ok(Event::Eof) => break,
            Err(e) => {
                tracing::warn!(error = %e, "styles part unreadable past this point");
                break;
            }
            _ => {}
        }
    }
    formats
        .into_iter()
        .map(|id| {
            let code = custom
                .get(&id)
                .cloned()
                .or_else(|| builtin_format(id).map(str::to_owned))
                .unwrap_or_default();
            DataFormat::new(id, code)
        })
        .collect()
}

fn parse_comments(content: &str) -> Vec<CellExtra> {
    let mut out = Vec::new();
    let mut reader = str_reader(content);
    let mut current: Option<(CellRange, String)> = None;
    let mut in_t = false;
    let mut phonetic = false;
    loop {
        let event = match reader.read_event() {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "comments part unreadable past this point");
                break;
            }
        };
        match &event {
            Event::Start(e) => match e.local_name().as_ref() {
                b"comment" => {
                    current = attr(e, b"ref")
                        .and_then(|r| parse_range_ref(&r))
                        .map(|range| (range, String::new()));
                }
                b"rPh" => phonetic = true,
                b"t" => in_t = !phonetic,
                _ => {}
            },
            Event::End(e) => match e.local_name().as_ref() {
                b"comment" => {
                    if let Some((range, text)) = current.take() {
                        out.push(CellExtra {
                            kind: ExtraKind::Comment,
                            text: Some(text),
                            range,
                        });
                    }
                }
                b"rPh" => phonetic = false,
                b"t" => in_t = false,
                _ => {}
            },
            Event::Eof => break,
            other if in_t => {
                if let Some((_, text)) = current.as_mut() {
                    push_text(text, other);
                }
            }
            _ => {}
        }
    }
    out
}

/// Read the `<si>` entries of a shared-string part into `cache`, in order.
fn load_shared_strings(mut reader: PartReader<'_>, cache: &mut dyn ValueCache) -> Result<usize> {
    let mut buf = Vec::new();
    let mut index = 0usize;
    let mut current: Option<String> = None;
    let mut in_t = false;
    let mut phonetic = false;
    loop {
        buf.clear();
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| ExcelError::fatal(format!("shared strings: {}", e)))?;
        match &event {
            Event::Start(e) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"rPh" => phonetic = true,
                b"t" => in_t = !phonetic,
                _ => {}
            },
            Event::End(e) => match e.local_name().as_ref() {
                b"si" => {
                    cache.put(index, current.take().unwrap_or_default())?;
                    index += 1;
                }
                b"rPh" => phonetic = false,
                b"t" => in_t = false,
                _ => {}
            },
            Event::Eof => break,
            other if in_t => {
                if let Some(text) = current.as_mut() {
                    push_text(text, other);
                }
            }
            _ => {}
        }
    }
    Ok(index)
}

impl EventSource for XlsxSource {
    fn sheet_list(&self) -> &[SheetInfo] {
        &self.sheets
    }

    fn date_1904(&self) -> Option<bool> {
        Some(self.date_1904)
    }

    fn shared_values_size_hint(&self) -> Option<u64> {
        self.shared_strings_size
    }

    fn load_shared_values(&mut self, cache: &mut dyn ValueCache) -> Result<()> {
        let Some(path) = self.shared_strings.clone() else {
            return Ok(());
        };
        if let Some(reader) = open_part(&mut self.archive, &path)? {
            let count = load_shared_strings(reader, cache)?;
            tracing::debug!(count, "shared strings loaded");
        }
        Ok(())
    }

    fn open_sheet<'a>(&'a mut self, index: usize, extras: ExtraSet) -> Result<Box<dyn SheetEvents + 'a>> {
        let part = self
            .parts
            .get(index)
            .cloned()
            .ok_or_else(|| ExcelError::config(format!("no sheet at index {}", index)))?;

        let rels = if extras.is_empty() {
            Vec::new()
        } else {
            read_part(&mut self.archive, &xml::rels_path(&part.path))?
                .map(|x| parse_relationships(&x))
                .unwrap_or_default()
        };
        let comments = if extras.comment {
            self.read_comments(&part.path, &rels)?
        } else {
            Vec::new()
        };
        let links: HashMap<String, String> = rels
            .into_iter()
            .filter(|r| r.kind == "hyperlink")
            .map(|r| (r.id, r.target))
            .collect();

        let XlsxSource { archive, formats, .. } = self;
        let reader = open_part(archive, &part.path)?
            .ok_or_else(|| ExcelError::fatal(format!("sheet part {} missing", part.path)))?;
        Ok(Box::new(XlsxEvents {
            reader,
            buf: Vec::new(),
            formats,
            extras,
            links,
            collected: comments,
            pending: VecDeque::new(),
            next_row: 0,
            next_column: 0,
            cell: None,
            capture: Capture::None,
            in_inline: false,
            phonetic: false,
            closed: false,
            truncated: None,
            done: false,
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Capture {
    None,
    Value,
    Formula,
    Inline,
}

#[derive(Debug, Default)]
struct PendingCell {
    column: usize,
    kind: Option<String>,
    style: usize,
    value: Option<String>,
    formula: Option<String>,
    inline: Option<String>,
}

struct XlsxEvents<'a> {
    reader: PartReader<'a>,
    buf: Vec<u8>,
    formats: &'a [DataFormat],
    extras: ExtraSet,
    links: HashMap<String, String>,
    /// Extras gathered while walking, released at sheet end
    collected: Vec<CellExtra>,
    pending: VecDeque<SheetEvent>,
    next_row: usize,
    next_column: usize,
    cell: Option<PendingCell>,
    capture: Capture,
    in_inline: bool,
    phonetic: bool,
    /// `</worksheet>` seen
    closed: bool,
    /// Where the part stopped without closing
    truncated: Option<String>,
    done: bool,
}

impl XlsxEvents<'_> {
    fn advance(&mut self) -> Result<()> {
        let mut buf = std::mem::take(&mut self.buf);
        buf.clear();
        let outcome = match self.reader.read_event_into(&mut buf) {
            Ok(event) => {
                self.on_event(event);
                Ok(())
            }
            Err(e) => {
                self.done = true;
                Err(ExcelError::benign(format!(
                    "sheet xml unreadable near row {}: {}",
                    self.next_row + 1,
                    e
                )))
            }
        };
        self.buf = buf;
        outcome
    }

    fn on_event(&mut self, event: Event<'_>) {
        match &event {
            Event::Start(e) => self.on_start(e),
            Event::End(e) => match e.local_name().as_ref() {
                b"v" | b"f" => self.capture = Capture::None,
                b"t" if self.capture == Capture::Inline => self.capture = Capture::None,
                b"is" => self.in_inline = false,
                b"rPh" => self.phonetic = false,
                b"c" => self.finish_cell(),
                b"row" => self.pending.push_back(SheetEvent::RowEnd),
                b"worksheet" => self.closed = true,
                _ => {}
            },
            Event::Eof => self.on_eof(),
            other => {
                let Some(cell) = self.cell.as_mut() else {
                    return;
                };
                let slot = match self.capture {
                    Capture::None => return,
                    Capture::Value => &mut cell.value,
                    Capture::Formula => &mut cell.formula,
                    Capture::Inline => &mut cell.inline,
                };
                push_text(slot.get_or_insert_with(String::new), other);
            }
        }
    }

    fn on_start(&mut self, e: &BytesStart<'_>) {
        match e.local_name().as_ref() {
            b"row" => {
                let row = attr(e, b"r")
                    .and_then(|r| r.parse::<usize>().ok())
                    .and_then(|r| r.checked_sub(1))
                    .unwrap_or(self.next_row);
                self.next_row = row + 1;
                self.next_column = 0;
                self.pending.push_back(SheetEvent::RowStart(row));
            }
            b"c" => {
                let column = attr(e, b"r")
                    .and_then(|r| parse_cell_ref(&r))
                    .map(|(_, c)| c)
                    .unwrap_or(self.next_column);
                self.next_column = column + 1;
                self.cell = Some(PendingCell {
                    column,
                    kind: attr(e, b"t"),
                    style: attr(e, b"s").and_then(|s| s.parse().ok()).unwrap_or(0),
                    ..Default::default()
                });
            }
            b"v" => self.capture = Capture::Value,
            b"f" => self.capture = Capture::Formula,
            b"is" => self.in_inline = true,
            b"rPh" => self.phonetic = true,
            b"t" if self.in_inline && !self.phonetic => self.capture = Capture::Inline,
            b"mergeCell" if self.extras.merge => {
                if let Some(range) = attr(e, b"ref").and_then(|r| parse_range_ref(&r)) {
                    self.collected.push(CellExtra {
                        kind: ExtraKind::Merge,
                        text: None,
                        range,
                    });
                }
            }
            b"hyperlink" if self.extras.hyperlink => {
                let Some(range) = attr(e, b"ref").and_then(|r| parse_range_ref(&r)) else {
                    return;
                };
                let target = attr(e, b"id")
                    .and_then(|id| self.links.get(&id).cloned())
                    .or_else(|| attr(e, b"location"));
                self.collected.push(CellExtra {
                    kind: ExtraKind::Hyperlink,
                    text: target,
                    range,
                });
            }
            _ => {}
        }
    }

    fn finish_cell(&mut self) {
        self.capture = Capture::None;
        let Some(cell) = self.cell.take() else {
            return;
        };
        let raw = cell_value(&cell);
        let format = self
            .formats
            .get(cell.style)
            .filter(|f| f.index != 0)
            .cloned();
        self.pending.push_back(SheetEvent::Cell {
            column: cell.column,
            raw,
            format,
            formula: cell.formula.filter(|f| !f.is_empty()),
        });
    }

    fn on_eof(&mut self) {
        self.done = true;
        if !self.closed {
            let at = format!("{}{}", column_letters(self.next_column), self.next_row.max(1));
            tracing::warn!(at = %at, "sheet xml truncated");
            self.truncated = Some(at);
            return;
        }
        for extra in self.collected.drain(..) {
            if self.extras.contains(extra.kind) {
                self.pending.push_back(SheetEvent::Extra(extra));
            }
        }
        self.pending.push_back(SheetEvent::SheetEnd);
    }
}

fn cell_value(cell: &PendingCell) -> RawValue {
    let value = cell.value.as_deref();
    match cell.kind.as_deref() {
        Some("s") => match value.map(str::trim).and_then(|v| v.parse::<usize>().ok()) {
            Some(index) => RawValue::SharedString(index),
            None => RawValue::Empty,
        },
        Some("inlineStr") => match &cell.inline {
            Some(text) => RawValue::Text(text.clone()),
            None => value.map_or(RawValue::Empty, |v| RawValue::Text(v.to_string())),
        },
        Some("str") => value.map_or(RawValue::Empty, |v| RawValue::Text(v.to_string())),
        Some("b") => value.map_or(RawValue::Empty, |v| RawValue::Boolean(is_true(v.trim()))),
        Some("e") => value.map_or(RawValue::Empty, |v| RawValue::Error(v.to_string())),
        Some("d") => value.map_or(RawValue::Empty, |v| match parse_iso_date(v.trim()) {
            Some(dt) => RawValue::Date(dt),
            None => RawValue::Text(v.to_string()),
        }),
        _ => match value.map(str::trim) {
            None | Some("") => RawValue::Empty,
            Some(v) => match v.parse::<f64>() {
                Ok(n) => RawValue::Number(n),
                Err(_) => RawValue::Text(v.to_string()),
            },
        },
    }
}

fn parse_iso_date(v: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(v, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(v, "%Y-%m-%dT%H:%M:%S"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(v, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

impl SheetEvents for XlsxEvents<'_> {
    fn next_event(&mut self) -> Result<Option<SheetEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            if let Some(at) = self.truncated.take() {
                return Err(ExcelError::benign(format!("sheet xml ended early near {}", at)));
            }
            if self.done {
                return Ok(None);
            }
            self.advance()?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use sheetstream_engine::cache::MapCache;
    use zip::write::SimpleFileOptions;

    const WORKBOOK: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships">
  <workbookPr date1904="1"/>
  <sheets>
    <sheet name="Data" sheetId="1" r:id="rId1"/>
    <sheet name="Secret" sheetId="2" state="veryHidden" r:id="rId2"/>
  </sheets>
</workbook>"#;

    const WORKBOOK_RELS: &str = r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">
  <Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/>
  <Relationship Id="rId2" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="/xl/worksheets/sheet2.xml"/>
  <Relationship Id="rId3" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles" Target="styles.xml"/>
  <Relationship Id="rId4" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/sharedStrings" Target="sharedStrings.xml"/>
</Relationships>"#;

    const STYLES: &str = r#"<styleSheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">
  <numFmts count="1"><numFmt numFmtId="164" formatCode="yyyy/mm/dd"/></numFmts>
  <cellStyleXfs count="1"><xf numFmtId="0"/></cellStyleXfs>
  <cellXfs count="3"><xf numFmtId="0"/><xf numFmtId="164"/><xf numFmtId="2"/></cellXfs>
</styleSheet>"#;

    const SHARED: &str = r#"<sst xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" count="2">
  <si><t>Name</t></si>
  <si><r><t>Ri</t></r><r><t xml:space="preserve">ch &amp; bold</t></r><rPh><t>ignored</t></rPh></si>
</sst>"#;

    const SHEET1: &str = r#"<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships">
  <sheetData>
    <row r="1"><c r="A1" t="s"><v>0</v></c><c r="C1" t="s"><v>1</v></c></row>
    <row r="3">
      <c r="A3" s="1"><v>45292</v></c>
      <c r="B3" t="b"><v>1</v></c>
      <c r="C3" t="inlineStr"><is><t>inline</t></is></c>
      <c r="D3" t="str"><f>"x"&amp;"y"</f><v>xy</v></c>
      <c r="E3" t="e"><v>#DIV/0!</v></c>
      <c r="F3" s="2"><v>1.5</v></c>
    </row>
  </sheetData>
  <mergeCells count="1"><mergeCell ref="A1:B1"/></mergeCells>
  <hyperlinks><hyperlink ref="A3" r:id="rId1"/><hyperlink ref="B3" location="Secret!A1"/></hyperlinks>
</worksheet>"#;

    const SHEET1_RELS: &str = r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">
  <Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/hyperlink" Target="https://example.com" TargetMode="External"/>
  <Relationship Id="rId2" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/comments" Target="../comments1.xml"/>
</Relationships>"#;

    const COMMENTS: &str = r#"<comments xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">
  <authors><author>me</author></authors>
  <commentList><comment ref="C3" authorId="0"><text><r><t>check this</t></r></text></comment></commentList>
</comments>"#;

    fn package(sheet2: &str) -> Vec<u8> {
        package_with(WORKBOOK, sheet2)
    }

    fn package_with(workbook: &str, sheet2: &str) -> Vec<u8> {
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        let parts = [
            ("xl/workbook.xml", workbook),
            ("xl/_rels/workbook.xml.rels", WORKBOOK_RELS),
            ("xl/styles.xml", STYLES),
            ("xl/sharedStrings.xml", SHARED),
            ("xl/worksheets/sheet1.xml", SHEET1),
            ("xl/worksheets/_rels/sheet1.xml.rels", SHEET1_RELS),
            ("xl/comments1.xml", COMMENTS),
            ("xl/worksheets/sheet2.xml", sheet2),
        ];
        for (name, body) in parts {
            zip.start_file(name, options).unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    fn drain(source: &mut XlsxSource, index: usize, extras: ExtraSet) -> (Vec<SheetEvent>, Option<ExcelError>) {
        let mut events = source.open_sheet(index, extras).unwrap();
        let mut out = Vec::new();
        loop {
            match events.next_event() {
                Ok(Some(e)) => out.push(e),
                Ok(None) => return (out, None),
                Err(e) => return (out, Some(e)),
            }
        }
    }

    fn cells(events: &[SheetEvent]) -> Vec<(usize, RawValue)> {
        events
            .iter()
            .filter_map(|e| match e {
                SheetEvent::Cell { column, raw, .. } => Some((*column, raw.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_workbook_metadata() {
        let source = XlsxSource::from_bytes(package("<worksheet><sheetData/></worksheet>")).unwrap();
        let sheets = source.sheet_list();
        assert_eq!(sheets.len(), 2);
        assert_eq!(sheets[0].name, "Data");
        assert_eq!(sheets[1].visibility(), "veryHidden");
        assert_eq!(source.date_1904(), Some(true));
        assert!(source.shared_values_size_hint().unwrap() > 0);
    }

    #[test]
    fn test_shared_strings_skip_phonetic_runs() {
        let mut source = XlsxSource::from_bytes(package("<worksheet/>")).unwrap();
        let mut cache = MapCache::new();
        source.load_shared_values(&mut cache).unwrap();
        cache.put_finished().unwrap();
        assert_eq!(cache.get(0).unwrap().as_deref(), Some("Name"));
        assert_eq!(cache.get(1).unwrap().as_deref(), Some("Rich & bold"));
        assert_eq!(cache.get(2).unwrap(), None);
    }

    #[test]
    fn test_sheet_cells_by_type() {
        let mut source = XlsxSource::from_bytes(package("<worksheet/>")).unwrap();
        let (events, err) = drain(&mut source, 0, ExtraSet::none());
        assert!(err.is_none());
        assert_eq!(events[0], SheetEvent::RowStart(0));
        assert!(events.contains(&SheetEvent::RowStart(2)));
        assert_eq!(events.last(), Some(&SheetEvent::SheetEnd));

        let cells = cells(&events);
        assert_eq!(cells[0], (0, RawValue::SharedString(0)));
        assert_eq!(cells[1], (2, RawValue::SharedString(1)));
        assert_eq!(cells[2], (0, RawValue::Number(45292.0)));
        assert_eq!(cells[3], (1, RawValue::Boolean(true)));
        assert_eq!(cells[4], (2, RawValue::Text("inline".into())));
        assert_eq!(cells[5], (3, RawValue::Text("xy".into())));
        assert_eq!(cells[6], (4, RawValue::Error("#DIV/0!".into())));

        let dated = events.iter().find_map(|e| match e {
            SheetEvent::Cell { column: 0, format: Some(f), .. } => Some(f.clone()),
            _ => None,
        });
        assert_eq!(dated, Some(DataFormat::new(164, "yyyy/mm/dd")));
        let formula = events.iter().find_map(|e| match e {
            SheetEvent::Cell { column: 3, formula, .. } => formula.clone(),
            _ => None,
        });
        assert_eq!(formula.as_deref(), Some("\"x\"&\"y\""));
        assert!(!events.iter().any(|e| matches!(e, SheetEvent::Extra(_))));
    }

    #[test]
    fn test_extras_emitted_at_sheet_end_when_requested() {
        let mut source = XlsxSource::from_bytes(package("<worksheet/>")).unwrap();
        let (events, _) = drain(&mut source, 0, ExtraSet::all());
        let extras: Vec<&CellExtra> = events
            .iter()
            .filter_map(|e| match e {
                SheetEvent::Extra(x) => Some(x),
                _ => None,
            })
            .collect();
        assert_eq!(extras.len(), 4);
        let merge = extras.iter().find(|x| x.kind == ExtraKind::Merge).unwrap();
        assert_eq!(merge.range, CellRange::new(0, 0, 0, 1));
        assert_eq!(merge.text, None);
        let links: Vec<_> = extras.iter().filter(|x| x.kind == ExtraKind::Hyperlink).collect();
        assert_eq!(links[0].text.as_deref(), Some("https://example.com"));
        assert_eq!(links[1].text.as_deref(), Some("Secret!A1"));
        let comment = extras.iter().find(|x| x.kind == ExtraKind::Comment).unwrap();
        assert_eq!(comment.text.as_deref(), Some("check this"));
        assert_eq!(comment.range, CellRange::single(2, 2));

        let position = events.iter().position(|e| matches!(e, SheetEvent::Extra(_))).unwrap();
        assert!(events[..position].contains(&SheetEvent::RowEnd));
        assert_eq!(events.last(), Some(&SheetEvent::SheetEnd));
    }

    #[test]
    fn test_hidden_sheet_skipped_when_ignored() {
        use sheetstream_engine::read::{CollectingListener, ExcelAnalyser, ReadWorkbook};
        use sheetstream_engine::RowMap;

        let workbook = WORKBOOK.replace("veryHidden", "hidden");
        let hidden_sheet = r#"<worksheet><sheetData><row r="1"><c r="A1"><v>1</v></c></row><row r="2"><c r="A2"><v>2</v></c></row></sheetData></worksheet>"#;
        let source = XlsxSource::from_bytes(package_with(&workbook, hidden_sheet)).unwrap();
        assert_eq!(source.sheet_list()[1].visibility(), "hidden");

        let options = ReadWorkbook {
            ignore_hidden_sheet: true,
            ..Default::default()
        };
        let mut analyser = ExcelAnalyser::new(source, options).unwrap();
        let mut rows = CollectingListener::<RowMap>::new();
        analyser.read_all(&mut [&mut rows]).unwrap();
        assert!(analyser.context().workbook().has_read(0));
        assert!(!analyser.context().workbook().has_read(1));
        assert_eq!(rows.rows().len(), 1);
        analyser.finish().unwrap();
    }

    #[test]
    fn test_truncated_sheet_is_benign() {
        let truncated = r#"<worksheet><sheetData><row r="1"><c r="A1"><v>1</v></c></row><row r="2"><c r="A2"><v>2"#;
        let mut source = XlsxSource::from_bytes(package(truncated)).unwrap();
        let (events, err) = drain(&mut source, 1, ExtraSet::none());
        assert!(err.unwrap().is_benign());
        assert_eq!(cells(&events), vec![(0, RawValue::Number(1.0))]);
        assert!(!events.contains(&SheetEvent::SheetEnd));
    }

    #[test]
    fn test_not_a_zip_is_fatal() {
        let err = XlsxSource::from_bytes(b"not a zip".to_vec()).unwrap_err();
        assert!(!err.is_benign());
    }
}
