// XLSX sink on rust_xlsxwriter

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use rust_xlsxwriter::{
    Color, Format, FormatAlign, FormatBorder, FormatUnderline, Formula, Image, Note, Url, Workbook,
    Worksheet, XlsxError,
};
use sheetstream_engine::cell::{CellRange, CellValue, WriteCellData};
use sheetstream_engine::numeric::datetime_to_serial;
use sheetstream_engine::style::{Alignment, BorderStyle, CellStyle, Font, VerticalAlignment};
use sheetstream_engine::write::{SheetHandle, SheetSink, SinkOutput};
use sheetstream_engine::{ExcelError, Result};

/// Date cells without a number format of their own render with this.
const DEFAULT_DATE_FORMAT: &str = "yyyy-mm-dd hh:mm:ss";
const MAX_ROWS: usize = 1_048_576;
const MAX_COLUMNS: usize = 16_384;

fn xlsx_error(e: XlsxError) -> ExcelError {
    match e {
        XlsxError::IoError(io) => ExcelError::Io(io),
        other => ExcelError::fatal(format!("xlsx write: {}", other)),
    }
}

enum Target {
    File(PathBuf),
    Bytes,
}

/// Builds an xlsx workbook in memory and saves it on `finish`.
pub struct XlsxSink {
    workbook: Workbook,
    target: Target,
    names: Vec<String>,
    /// Last row written per sheet, replayed onto merge origins
    last_row: HashMap<usize, (usize, BTreeMap<usize, WriteCellData>)>,
    finished: bool,
}

impl XlsxSink {
    pub fn create(path: &Path) -> Self {
        Self::new(Target::File(path.to_path_buf()))
    }

    pub fn in_memory() -> Self {
        Self::new(Target::Bytes)
    }

    fn new(target: Target) -> Self {
        XlsxSink {
            workbook: Workbook::new(),
            target,
            names: Vec::new(),
            last_row: HashMap::new(),
            finished: false,
        }
    }

    fn worksheet(&mut self, sheet: SheetHandle) -> Result<&mut Worksheet> {
        if self.finished {
            return Err(ExcelError::config("sink already finished"));
        }
        if sheet.0 >= self.names.len() {
            return Err(ExcelError::config(format!("unknown sheet handle {}", sheet.0)));
        }
        self.workbook.worksheet_from_index(sheet.0).map_err(xlsx_error)
    }
}

fn position(row: usize, column: usize) -> Result<(u32, u16)> {
    if row >= MAX_ROWS || column >= MAX_COLUMNS {
        return Err(ExcelError::config(format!(
            "cell ({}, {}) is outside the xlsx grid",
            row, column
        )));
    }
    Ok((row as u32, column as u16))
}

fn rgb(value: u32) -> Color {
    Color::RGB(value & 0xFF_FFFF)
}

fn apply_font(mut format: Format, font: &Font) -> Format {
    if font.bold {
        format = format.set_bold();
    }
    if font.italic {
        format = format.set_italic();
    }
    if font.underline {
        format = format.set_underline(FormatUnderline::Single);
    }
    if font.strikethrough {
        format = format.set_font_strikethrough();
    }
    if let Some(size) = font.size {
        format = format.set_font_size(size);
    }
    if let Some(color) = font.color {
        format = format.set_font_color(rgb(color));
    }
    if let Some(name) = &font.name {
        format = format.set_font_name(name);
    }
    format
}

/// Translate a layered cell style into an xlsx format.
pub fn build_excel_format(style: &CellStyle) -> Format {
    let mut format = Format::new();

    if let Some(font) = &style.font {
        format = apply_font(format, font);
    }

    format = match style.horizontal {
        None | Some(Alignment::General) => format,
        Some(Alignment::Left) => format.set_align(FormatAlign::Left),
        Some(Alignment::Center) => format.set_align(FormatAlign::Center),
        Some(Alignment::Right) => format.set_align(FormatAlign::Right),
    };

    format = match style.vertical {
        None => format,
        Some(VerticalAlignment::Top) => format.set_align(FormatAlign::Top),
        Some(VerticalAlignment::Middle) => format.set_align(FormatAlign::VerticalCenter),
        Some(VerticalAlignment::Bottom) => format.set_align(FormatAlign::Bottom),
    };

    if style.wrap == Some(true) {
        format = format.set_text_wrap();
    }

    if let Some(fill) = style.fill {
        format = format.set_background_color(rgb(fill));
    }

    if let Some(border) = style.border {
        if border != BorderStyle::None {
            format = format.set_border(border_style_to_xlsx(border));
        }
    }

    if let Some(pattern) = &style.number_format {
        format = format.set_num_format(pattern);
    }

    format
}

fn border_style_to_xlsx(style: BorderStyle) -> FormatBorder {
    match style {
        BorderStyle::None => FormatBorder::None,
        BorderStyle::Thin => FormatBorder::Thin,
        BorderStyle::Medium => FormatBorder::Medium,
        BorderStyle::Thick => FormatBorder::Thick,
    }
}

/// Rich-text runs as (format, segment) pairs covering the whole text.
fn rich_segments(text: &str, runs: &[sheetstream_engine::cell::TextRun], base: &Format) -> Vec<(Format, String)> {
    let chars: Vec<char> = text.chars().collect();
    let mut fonts: Vec<Option<&Font>> = vec![None; chars.len()];
    for run in runs {
        let end = run.end.min(chars.len());
        for slot in fonts.iter_mut().take(end).skip(run.start) {
            *slot = Some(&run.font);
        }
    }

    let mut segments: Vec<(Format, String)> = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let font = fonts[start];
        let mut end = start + 1;
        while end < chars.len() && fonts[end] == font {
            end += 1;
        }
        let format = match font {
            Some(f) => apply_font(base.clone(), f),
            None => base.clone(),
        };
        segments.push((format, chars[start..end].iter().collect()));
        start = end;
    }
    segments
}

fn write_value(worksheet: &mut Worksheet, row: u32, col: u16, cell: &WriteCellData) -> Result<()> {
    let format = cell
        .style
        .as_ref()
        .map(build_excel_format)
        .unwrap_or_else(Format::new);

    if let Some(formula) = &cell.formula {
        let mut formula = Formula::new(formula.trim_start_matches('='));
        if !cell.value.is_empty() {
            formula = formula.set_result(cell.value.to_string());
        }
        worksheet
            .write_formula_with_format(row, col, formula, &format)
            .map_err(xlsx_error)?;
        return Ok(());
    }

    if let Some(link) = &cell.hyperlink {
        let text = link
            .text
            .clone()
            .or_else(|| cell.value.as_str().map(str::to_owned))
            .unwrap_or_else(|| link.url.clone());
        worksheet
            .write_url_with_format(row, col, Url::new(&link.url).set_text(&text), &format)
            .map_err(xlsx_error)?;
        return Ok(());
    }

    match &cell.value {
        CellValue::Empty => {
            if cell.style.is_some() {
                worksheet.write_blank(row, col, &format).map_err(xlsx_error)?;
            }
        }
        CellValue::String(s) | CellValue::Error(s) => {
            worksheet
                .write_string_with_format(row, col, s, &format)
                .map_err(xlsx_error)?;
        }
        CellValue::Number(n) => {
            worksheet
                .write_number_with_format(row, col, n.value, &format)
                .map_err(xlsx_error)?;
        }
        CellValue::Boolean(b) => {
            worksheet
                .write_boolean_with_format(row, col, *b, &format)
                .map_err(xlsx_error)?;
        }
        CellValue::Date(d) => {
            let has_pattern = cell
                .style
                .as_ref()
                .is_some_and(|s| s.number_format.is_some());
            let format = if has_pattern {
                format
            } else {
                format.set_num_format(DEFAULT_DATE_FORMAT)
            };
            worksheet
                .write_number_with_format(row, col, datetime_to_serial(*d, false), &format)
                .map_err(xlsx_error)?;
        }
        CellValue::RichText(rich) => {
            let segments = rich_segments(&rich.text, &rich.runs, &format);
            if segments.is_empty() {
                worksheet.write_blank(row, col, &format).map_err(xlsx_error)?;
            } else {
                let parts: Vec<(&Format, &str)> = segments.iter().map(|(f, s)| (f, s.as_str())).collect();
                worksheet
                    .write_rich_string_with_format(row, col, &parts, &format)
                    .map_err(xlsx_error)?;
            }
        }
    }
    Ok(())
}

fn write_decoration(worksheet: &mut Worksheet, row: u32, col: u16, cell: &WriteCellData) -> Result<()> {
    if let Some(comment) = &cell.comment {
        let mut note = Note::new(&comment.text);
        if let Some(author) = &comment.author {
            note = note.set_author(author);
        }
        worksheet.insert_note(row, col, &note).map_err(xlsx_error)?;
    }
    for image in &cell.images {
        let picture = Image::new_from_buffer(&image.bytes).map_err(xlsx_error)?;
        let (img_row, img_col) = position(
            row as usize + image.row_offset,
            col as usize + image.column_offset,
        )?;
        worksheet
            .insert_image(img_row, img_col, &picture)
            .map_err(xlsx_error)?;
    }
    Ok(())
}

impl SheetSink for XlsxSink {
    fn format(&self) -> &'static str {
        "xlsx"
    }

    // The package never sets workbookPr date1904
    fn supports_1904(&self) -> bool {
        false
    }

    fn create_sheet(&mut self, sheet_no: usize, name: &str) -> Result<SheetHandle> {
        if self.finished {
            return Err(ExcelError::config("sink already finished"));
        }
        if self.names.iter().any(|n| n.eq_ignore_ascii_case(name)) {
            return Err(ExcelError::config(format!("sheet '{}' already exists", name)));
        }
        self.workbook
            .add_worksheet()
            .set_name(name)
            .map_err(|e| ExcelError::config(format!("bad sheet name '{}': {}", name, e)))?;
        self.names.push(name.to_string());
        tracing::debug!(sheet_no, name, "xlsx sheet created");
        Ok(SheetHandle(self.names.len() - 1))
    }

    fn write_cell(&mut self, sheet: SheetHandle, row: usize, column: usize, cell: &WriteCellData) -> Result<()> {
        let (r, c) = position(row, column)?;
        let worksheet = self.worksheet(sheet)?;
        write_value(worksheet, r, c, cell)?;
        write_decoration(worksheet, r, c, cell)?;

        let cached = self.last_row.entry(sheet.0).or_insert_with(|| (row, BTreeMap::new()));
        if cached.0 != row {
            *cached = (row, BTreeMap::new());
        }
        // Decoration was placed once already
        let mut value_only = cell.clone();
        value_only.comment = None;
        value_only.images.clear();
        cached.1.insert(column, value_only);
        Ok(())
    }

    fn merge(&mut self, sheet: SheetHandle, range: CellRange) -> Result<()> {
        if range.is_single_cell() {
            return Ok(());
        }
        let (r1, c1) = position(range.first_row, range.first_column)?;
        let (r2, c2) = position(range.last_row, range.last_column)?;
        let origin = self
            .last_row
            .get(&sheet.0)
            .filter(|(row, _)| *row == range.first_row)
            .and_then(|(_, cells)| cells.get(&range.first_column))
            .cloned();

        let worksheet = self.worksheet(sheet)?;
        let format = origin
            .as_ref()
            .and_then(|c| c.style.as_ref())
            .map(build_excel_format)
            .unwrap_or_else(Format::new);
        worksheet
            .merge_range(r1, c1, r2, c2, "", &format)
            .map_err(xlsx_error)?;
        // merge_range blanks the origin cell
        if let Some(cell) = origin {
            write_value(worksheet, r1, c1, &cell)?;
        }
        Ok(())
    }

    fn set_column_width(&mut self, sheet: SheetHandle, column: usize, width: f64) -> Result<()> {
        let (_, c) = position(0, column)?;
        self.worksheet(sheet)?
            .set_column_width(c, width)
            .map_err(xlsx_error)?;
        Ok(())
    }

    fn set_row_height(&mut self, sheet: SheetHandle, row: usize, height: f64) -> Result<()> {
        let (r, _) = position(row, 0)?;
        self.worksheet(sheet)?
            .set_row_height(r, height)
            .map_err(xlsx_error)?;
        Ok(())
    }

    fn finish(&mut self) -> Result<SinkOutput> {
        if self.finished {
            return Err(ExcelError::config("sink already finished"));
        }
        self.finished = true;
        self.last_row.clear();
        if self.names.is_empty() {
            // A package needs at least one sheet
            self.workbook.add_worksheet();
        }
        match &self.target {
            Target::File(path) => {
                self.workbook.save(path).map_err(xlsx_error)?;
                tracing::debug!(path = %path.display(), sheets = self.names.len(), "xlsx saved");
                Ok(SinkOutput::File(path.clone()))
            }
            Target::Bytes => {
                let bytes = self.workbook.save_to_buffer().map_err(xlsx_error)?;
                Ok(SinkOutput::Bytes(bytes))
            }
        }
    }

    fn discard(&mut self) -> Result<()> {
        self.finished = true;
        self.last_row.clear();
        self.workbook = Workbook::new();
        Ok(())
    }
}
