use std::fmt;

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::numeric;
use crate::style::{CellStyle, Font};

/// Discriminant of a cell value, used as half of a converter key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum CellKind {
    Empty,
    String,
    Number,
    Boolean,
    Error,
    Date,
    RichText,
}

impl fmt::Display for CellKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CellKind::Empty => "EMPTY",
            CellKind::String => "STRING",
            CellKind::Number => "NUMBER",
            CellKind::Boolean => "BOOLEAN",
            CellKind::Error => "ERROR",
            CellKind::Date => "DATE",
            CellKind::RichText => "RICH_TEXT",
        };
        f.write_str(name)
    }
}

/// A numeric cell value: `value` is corrected to 15 significant digits,
/// `original` is the raw value exactly as stored in the source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Number {
    pub value: f64,
    pub original: f64,
}

impl Number {
    /// Build from a raw stored value, applying the precision correction.
    pub fn from_raw(raw: f64) -> Self {
        Number {
            value: numeric::correct_precision(raw),
            original: raw,
        }
    }

    /// A value that needs no correction (e.g. produced by a converter).
    pub fn exact(value: f64) -> Self {
        Number {
            value,
            original: value,
        }
    }
}

/// A formatted run inside a rich-text string. `start..end` are char offsets.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextRun {
    pub start: usize,
    pub end: usize,
    pub font: Font,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RichText {
    pub text: String,
    pub runs: Vec<TextRun>,
}

impl RichText {
    pub fn new(text: impl Into<String>) -> Self {
        RichText {
            text: text.into(),
            runs: Vec::new(),
        }
    }

    pub fn apply_font(mut self, start: usize, end: usize, font: Font) -> Self {
        self.runs.push(TextRun { start, end, font });
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub enum CellValue {
    #[default]
    Empty,
    String(String),
    Number(Number),
    Boolean(bool),
    /// Error literal such as `#DIV/0!`
    Error(String),
    Date(NaiveDateTime),
    RichText(RichText),
}

impl CellValue {
    pub fn kind(&self) -> CellKind {
        match self {
            CellValue::Empty => CellKind::Empty,
            CellValue::String(_) => CellKind::String,
            CellValue::Number(_) => CellKind::Number,
            CellValue::Boolean(_) => CellKind::Boolean,
            CellValue::Error(_) => CellKind::Error,
            CellValue::Date(_) => CellKind::Date,
            CellValue::RichText(_) => CellKind::RichText,
        }
    }

    pub fn number(value: f64) -> Self {
        CellValue::Number(Number::exact(value))
    }

    /// Collapse values that carry no content into `Empty`.
    pub fn check_empty(self) -> Self {
        match self {
            CellValue::String(s) if s.is_empty() => CellValue::Empty,
            CellValue::Error(s) if s.is_empty() => CellValue::Empty,
            CellValue::RichText(r) if r.text.is_empty() => CellValue::Empty,
            CellValue::Number(n) if n.value.is_nan() => CellValue::Empty,
            other => other,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, CellValue::Empty)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CellValue::String(s) | CellValue::Error(s) => Some(s),
            CellValue::RichText(r) => Some(&r.text),
            _ => None,
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Empty => Ok(()),
            CellValue::String(s) | CellValue::Error(s) => f.write_str(s),
            CellValue::Number(n) => write!(f, "{}", n.value),
            CellValue::Boolean(b) => write!(f, "{}", b),
            CellValue::Date(d) => write!(f, "{}", d.format("%Y-%m-%d %H:%M:%S")),
            CellValue::RichText(r) => f.write_str(&r.text),
        }
    }
}

/// Number format attached to a read cell: built-in id plus pattern text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataFormat {
    pub index: u16,
    pub format: String,
}

impl DataFormat {
    pub fn new(index: u16, format: impl Into<String>) -> Self {
        DataFormat {
            index,
            format: format.into(),
        }
    }

    pub fn is_date(&self) -> bool {
        numeric::is_date_format(self.index, &self.format)
    }
}

/// One cell as seen by the read path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CellData {
    pub row: usize,
    pub column: usize,
    pub value: CellValue,
    pub data_format: Option<DataFormat>,
    pub formula: Option<String>,
}

impl CellData {
    pub fn new(row: usize, column: usize, value: CellValue) -> Self {
        CellData {
            row,
            column,
            value: value.check_empty(),
            data_format: None,
            formula: None,
        }
    }

    pub fn with_format(mut self, format: Option<DataFormat>) -> Self {
        self.data_format = format;
        self
    }

    pub fn with_formula(mut self, formula: Option<String>) -> Self {
        self.formula = formula;
        self
    }

    pub fn kind(&self) -> CellKind {
        self.value.kind()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// True for numeric cells whose format renders them as a date/time.
    pub fn is_date_formatted(&self) -> bool {
        matches!(self.value, CellValue::Number(_))
            && self.data_format.as_ref().is_some_and(DataFormat::is_date)
    }
}

impl fmt::Display for CellData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind(), self.value)
    }
}

/// Inclusive rectangular range, zero-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct CellRange {
    pub first_row: usize,
    pub last_row: usize,
    pub first_column: usize,
    pub last_column: usize,
}

impl CellRange {
    pub fn new(first_row: usize, last_row: usize, first_column: usize, last_column: usize) -> Self {
        CellRange {
            first_row,
            last_row,
            first_column,
            last_column,
        }
    }

    pub fn single(row: usize, column: usize) -> Self {
        CellRange::new(row, row, column, column)
    }

    pub fn is_single_cell(&self) -> bool {
        self.first_row == self.last_row && self.first_column == self.last_column
    }

    pub fn contains(&self, row: usize, column: usize) -> bool {
        (self.first_row..=self.last_row).contains(&row)
            && (self.first_column..=self.last_column).contains(&column)
    }

    pub fn offset_rows(self, rows: usize) -> Self {
        CellRange {
            first_row: self.first_row + rows,
            last_row: self.last_row + rows,
            ..self
        }
    }

    /// Grow to include `(row, column)`.
    pub fn extend_to(&mut self, row: usize, column: usize) {
        self.first_row = self.first_row.min(row);
        self.last_row = self.last_row.max(row);
        self.first_column = self.first_column.min(column);
        self.last_column = self.last_column.max(column);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hyperlink {
    pub url: String,
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Comment {
    pub author: Option<String>,
    pub text: String,
}

/// Image bytes placed in a cell. Anchor geometry is left to the sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageData {
    #[serde(skip)]
    pub bytes: Vec<u8>,
    pub column_offset: usize,
    pub row_offset: usize,
}

/// One cell as produced by the write path: a converted value plus decoration.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WriteCellData {
    pub value: CellValue,
    pub formula: Option<String>,
    pub style: Option<CellStyle>,
    pub hyperlink: Option<Hyperlink>,
    pub comment: Option<Comment>,
    pub images: Vec<ImageData>,
}

impl WriteCellData {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(value: CellValue) -> Self {
        WriteCellData {
            value,
            ..Self::default()
        }
    }

    pub fn string(s: impl Into<String>) -> Self {
        WriteCellData::new(CellValue::String(s.into()))
    }

    pub fn kind(&self) -> CellKind {
        self.value.kind()
    }

    pub fn with_style(mut self, style: CellStyle) -> Self {
        self.style = Some(style);
        self
    }

    /// Layer `style` over the current style.
    pub fn merge_style(&mut self, style: &CellStyle) {
        self.style.get_or_insert_with(CellStyle::default).merge(style);
    }

    /// Keep decoration added by earlier hooks when a freshly converted
    /// value replaces this one. The converted cell's own settings win.
    pub fn inherit_decoration(&mut self, earlier: WriteCellData) {
        if let Some(mut style) = earlier.style {
            if let Some(own) = self.style.take() {
                style.merge(&own);
            }
            self.style = Some(style);
        }
        if self.hyperlink.is_none() {
            self.hyperlink = earlier.hyperlink;
        }
        if self.comment.is_none() {
            self.comment = earlier.comment;
        }
        if self.formula.is_none() {
            self.formula = earlier.formula;
        }
        if self.images.is_empty() {
            self.images = earlier.images;
        }
    }

    /// Build a write cell from a cell that was read, keeping its format.
    pub fn from_read(cell: &CellData) -> Self {
        let mut out = WriteCellData::new(cell.value.clone());
        out.formula = cell.formula.clone();
        if let Some(fmt) = &cell.data_format {
            out.style = Some(CellStyle::new().with_number_format(fmt.format.clone()));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_empty_collapses_blank_values() {
        assert!(CellData::new(0, 0, CellValue::String(String::new())).is_empty());
        assert!(CellData::new(0, 0, CellValue::Error(String::new())).is_empty());
        assert!(!CellData::new(0, 0, CellValue::String(" ".into())).is_empty());
        assert!(!CellData::new(0, 0, CellValue::Boolean(false)).is_empty());
    }

    #[test]
    fn test_number_keeps_original() {
        let n = Number::from_raw(0.1 + 0.2);
        assert_eq!(n.value, 0.3);
        assert_eq!(n.original, 0.1 + 0.2);
    }

    #[test]
    fn test_date_formatted_number() {
        let cell = CellData::new(1, 0, CellValue::number(45000.0))
            .with_format(Some(DataFormat::new(14, "m/d/yy")));
        assert!(cell.is_date_formatted());

        let plain = CellData::new(1, 0, CellValue::number(45000.0))
            .with_format(Some(DataFormat::new(2, "0.00")));
        assert!(!plain.is_date_formatted());
    }

    #[test]
    fn test_range_helpers() {
        let mut r = CellRange::single(2, 3);
        assert!(r.is_single_cell());
        r.extend_to(4, 1);
        assert_eq!(r, CellRange::new(2, 4, 1, 3));
        assert!(r.contains(3, 2));
        assert_eq!(r.offset_rows(10).first_row, 12);
    }

    #[test]
    fn test_inherit_decoration_merges_styles() {
        let earlier = WriteCellData::empty().with_style(CellStyle::new().with_fill(0xFF0000));
        let mut converted = WriteCellData::new(CellValue::number(1.0))
            .with_style(CellStyle::new().with_number_format("0.00"));
        converted.inherit_decoration(earlier);
        let style = converted.style.unwrap();
        assert_eq!(style.fill, Some(0xFF0000));
        assert_eq!(style.number_format.as_deref(), Some("0.00"));
    }

    #[test]
    fn test_display_includes_kind() {
        let cell = CellData::new(0, 0, CellValue::Boolean(true));
        assert_eq!(cell.to_string(), "BOOLEAN(true)");
    }
}
