//! Event-source contract between format adapters and the engine.
//!
//! An adapter lists its sheets, optionally bulk-loads a shared-value table,
//! then yields one forward-only event stream per sheet:
//! `RowStart (Cell)* RowEnd ... SheetEnd`. Streams cannot be restarted.

use chrono::NaiveDateTime;

use crate::cache::ValueCache;
use crate::cell::{CellRange, DataFormat};
use crate::error::{ExcelError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetInfo {
    pub index: usize,
    pub name: String,
    pub hidden: bool,
    pub very_hidden: bool,
}

impl SheetInfo {
    pub fn new(index: usize, name: impl Into<String>) -> Self {
        SheetInfo {
            index,
            name: name.into(),
            hidden: false,
            very_hidden: false,
        }
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden || self.very_hidden
    }

    pub fn visibility(&self) -> &'static str {
        if self.very_hidden {
            "veryHidden"
        } else if self.hidden {
            "hidden"
        } else {
            "visible"
        }
    }
}

/// A cell value as the adapter found it, before shared-value resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Empty,
    Text(String),
    Number(f64),
    Boolean(bool),
    Error(String),
    /// Index into the shared-value table
    SharedString(usize),
    Date(NaiveDateTime),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtraKind {
    Comment,
    Hyperlink,
    Merge,
}

/// Side information attached to a cell or range.
#[derive(Debug, Clone, PartialEq)]
pub struct CellExtra {
    pub kind: ExtraKind,
    /// Comment text or hyperlink target; `None` for merges
    pub text: Option<String>,
    pub range: CellRange,
}

/// Which extras the caller wants; adapters skip collecting the rest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtraSet {
    pub comment: bool,
    pub hyperlink: bool,
    pub merge: bool,
}

impl ExtraSet {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        ExtraSet {
            comment: true,
            hyperlink: true,
            merge: true,
        }
    }

    pub fn with(mut self, kind: ExtraKind) -> Self {
        match kind {
            ExtraKind::Comment => self.comment = true,
            ExtraKind::Hyperlink => self.hyperlink = true,
            ExtraKind::Merge => self.merge = true,
        }
        self
    }

    pub fn contains(&self, kind: ExtraKind) -> bool {
        match kind {
            ExtraKind::Comment => self.comment,
            ExtraKind::Hyperlink => self.hyperlink,
            ExtraKind::Merge => self.merge,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.comment || self.hyperlink || self.merge)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SheetEvent {
    RowStart(usize),
    Cell {
        column: usize,
        raw: RawValue,
        format: Option<DataFormat>,
        formula: Option<String>,
    },
    RowEnd,
    Extra(CellExtra),
    SheetEnd,
}

impl SheetEvent {
    pub fn cell(column: usize, raw: RawValue) -> Self {
        SheetEvent::Cell {
            column,
            raw,
            format: None,
            formula: None,
        }
    }
}

/// Forward-only event stream for one sheet.
///
/// `Ok(None)` ends the stream. A benign error (see [`ExcelError::benign`])
/// ends the sheet gracefully; anything else aborts the read.
pub trait SheetEvents {
    fn next_event(&mut self) -> Result<Option<SheetEvent>>;
}

/// A format adapter on the read side.
pub trait EventSource {
    fn sheet_list(&self) -> &[SheetInfo];

    /// The 1904 flag recorded in the file, if the format records one.
    fn date_1904(&self) -> Option<bool> {
        None
    }

    /// Approximate byte size of the shared-value table, if any.
    fn shared_values_size_hint(&self) -> Option<u64> {
        None
    }

    /// Stream the shared-value table into `cache`. Called once, before any
    /// sheet is opened.
    fn load_shared_values(&mut self, _cache: &mut dyn ValueCache) -> Result<()> {
        Ok(())
    }

    fn open_sheet<'a>(
        &'a mut self,
        index: usize,
        extras: ExtraSet,
    ) -> Result<Box<dyn SheetEvents + 'a>>;

    /// Release the underlying stream.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// An in-memory source: pre-built event lists per sheet.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    sheets: Vec<SheetInfo>,
    events: Vec<Vec<Result<SheetEvent, MemoryFault>>>,
    shared: Vec<String>,
    date_1904: Option<bool>,
}

/// A scripted failure inside a [`MemorySource`] stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryFault {
    Benign,
    Fatal,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_date_1904(mut self, flag: bool) -> Self {
        self.date_1904 = Some(flag);
        self
    }

    pub fn with_shared(mut self, shared: Vec<String>) -> Self {
        self.shared = shared;
        self
    }

    /// Add a sheet built from rows of raw values. Row `i` is physical row `i`.
    pub fn sheet(mut self, name: &str, rows: Vec<Vec<RawValue>>) -> Self {
        let mut events: Vec<Result<SheetEvent, MemoryFault>> = Vec::new();
        for (r, row) in rows.into_iter().enumerate() {
            events.push(Ok(SheetEvent::RowStart(r)));
            for (c, raw) in row.into_iter().enumerate() {
                events.push(Ok(SheetEvent::cell(c, raw)));
            }
            events.push(Ok(SheetEvent::RowEnd));
        }
        events.push(Ok(SheetEvent::SheetEnd));
        self.sheet_events(name, events)
    }

    /// Add a sheet from an explicit event script.
    pub fn sheet_events(mut self, name: &str, events: Vec<Result<SheetEvent, MemoryFault>>) -> Self {
        let index = self.sheets.len();
        self.sheets.push(SheetInfo::new(index, name));
        self.events.push(events);
        self
    }

    pub fn hide_last(mut self, very: bool) -> Self {
        if let Some(info) = self.sheets.last_mut() {
            info.hidden = true;
            info.very_hidden = very;
        }
        self
    }
}

struct MemoryEvents<'a> {
    events: std::slice::Iter<'a, Result<SheetEvent, MemoryFault>>,
}

impl SheetEvents for MemoryEvents<'_> {
    fn next_event(&mut self) -> Result<Option<SheetEvent>> {
        match self.events.next() {
            None => Ok(None),
            Some(Ok(e)) => Ok(Some(e.clone())),
            Some(Err(MemoryFault::Benign)) => Err(ExcelError::benign("scripted truncation")),
            Some(Err(MemoryFault::Fatal)) => Err(ExcelError::fatal("scripted corruption")),
        }
    }
}

impl EventSource for MemorySource {
    fn sheet_list(&self) -> &[SheetInfo] {
        &self.sheets
    }

    fn date_1904(&self) -> Option<bool> {
        self.date_1904
    }

    fn shared_values_size_hint(&self) -> Option<u64> {
        if self.shared.is_empty() {
            None
        } else {
            Some(self.shared.iter().map(|s| s.len() as u64).sum())
        }
    }

    fn load_shared_values(&mut self, cache: &mut dyn ValueCache) -> Result<()> {
        for (i, s) in self.shared.iter().enumerate() {
            cache.put(i, s.clone())?;
        }
        Ok(())
    }

    fn open_sheet<'a>(
        &'a mut self,
        index: usize,
        _extras: ExtraSet,
    ) -> Result<Box<dyn SheetEvents + 'a>> {
        let events = self
            .events
            .get(index)
            .ok_or_else(|| ExcelError::config(format!("no sheet at index {}", index)))?;
        Ok(Box::new(MemoryEvents {
            events: events.iter(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_source_event_order() {
        let mut source = MemorySource::new().sheet(
            "S",
            vec![vec![RawValue::Text("a".into()), RawValue::Number(1.0)]],
        );
        let mut events = source.open_sheet(0, ExtraSet::none()).unwrap();
        let mut seen = Vec::new();
        while let Some(e) = events.next_event().unwrap() {
            seen.push(e);
        }
        assert_eq!(seen.len(), 5);
        assert_eq!(seen[0], SheetEvent::RowStart(0));
        assert_eq!(seen[3], SheetEvent::RowEnd);
        assert_eq!(seen[4], SheetEvent::SheetEnd);
    }

    #[test]
    fn test_scripted_faults() {
        let mut source = MemorySource::new().sheet_events(
            "S",
            vec![Ok(SheetEvent::RowStart(0)), Err(MemoryFault::Benign)],
        );
        let mut events = source.open_sheet(0, ExtraSet::none()).unwrap();
        events.next_event().unwrap();
        assert!(events.next_event().unwrap_err().is_benign());
    }

    #[test]
    fn test_extra_set() {
        let set = ExtraSet::none().with(ExtraKind::Merge);
        assert!(set.contains(ExtraKind::Merge));
        assert!(!set.contains(ExtraKind::Comment));
        assert!(!set.is_empty());
        assert!(ExtraSet::none().is_empty());
    }

    #[test]
    fn test_visibility_label() {
        let src = MemorySource::new().sheet("a", vec![]).hide_last(true);
        assert_eq!(src.sheet_list()[0].visibility(), "veryHidden");
    }
}
