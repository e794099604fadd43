//! Read-side holders: Workbook → Sheet → Row.
//!
//! The workbook holder lives for the whole analyser. Sheet holders are built
//! on first selection and cached by physical index, so selecting the same
//! sheet by name after selecting it by index yields the same holder. Actually
//! walking a sheet twice in one analyser is [`ExcelError::DuplicateSheetRead`].

use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::PoisonError;

use crate::cache::ValueCache;
use crate::cell::{CellData, CellValue, DataFormat, Number};
use crate::config::{CacheLocation, GlobalConfiguration, ReadDefaultReturn};
use crate::convert::ConverterRegistry;
use crate::error::{ExcelError, ReleaseGuard, Result};
use crate::events::{EventSource, ExtraSet, RawValue, SheetInfo};
use crate::head::{HeadKind, HeadProperty};
use crate::read::{ReadSheet, ReadWorkbook};
use crate::record::{FieldCache, FieldLayout, FieldSpec, Record, SharedFieldCache};

pub struct ReadWorkbookHolder {
    pub config: GlobalConfiguration,
    pub head_row_number: Option<usize>,
    pub ignore_empty_row: bool,
    pub ignore_hidden_sheet: bool,
    pub read_default_return: ReadDefaultReturn,
    pub extra_read: ExtraSet,
    pub converters: ConverterRegistry,
    pub sheets: Vec<SheetInfo>,
    /// 1904 flag as recorded by the source
    pub source_date_1904: Option<bool>,
    head: Option<Vec<Vec<String>>>,
    cache: Option<Box<dyn ValueCache>>,
    field_cache: FieldCache,
    shared_field_cache: Option<SharedFieldCache>,
    has_read_sheet: HashSet<usize>,
}

impl ReadWorkbookHolder {
    pub fn use_1904(&self) -> bool {
        self.config.resolve_1904(self.source_date_1904)
    }

    pub fn has_read(&self, sheet_no: usize) -> bool {
        self.has_read_sheet.contains(&sheet_no)
    }

    fn fields_of<T: Record>(&mut self) -> Vec<FieldSpec> {
        match self.config.field_cache_location {
            CacheLocation::None => T::fields(),
            CacheLocation::Memory if self.shared_field_cache.is_some() => {
                let shared = self.shared_field_cache.as_ref().map(|shared| {
                    let mut cache = shared.lock().unwrap_or_else(PoisonError::into_inner);
                    cache.fields_of::<T>()
                });
                shared.map(|f| f.as_ref().clone()).unwrap_or_else(T::fields)
            }
            _ => self.field_cache.fields_of::<T>().as_ref().clone(),
        }
    }

    pub fn field_cache_len(&self) -> usize {
        self.field_cache.len()
    }
}

pub struct ReadSheetHolder {
    pub sheet_no: usize,
    pub sheet_name: String,
    pub config: GlobalConfiguration,
    pub head_row_number: usize,
    pub converters: ConverterRegistry,
    pub head: HeadProperty,
    pub num_rows: Option<usize>,
    /// Width of the last header row (non-typed heads), used to pad map rows
    pub head_width: Option<usize>,
    pub use_1904: bool,
    pub(crate) ended: bool,
    pub(crate) data_rows: usize,
}

impl ReadSheetHolder {
    pub fn is_typed(&self) -> bool {
        self.head.kind == HeadKind::Typed
    }

    /// Data rows handed to listeners so far.
    pub fn data_rows(&self) -> usize {
        self.data_rows
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowKind {
    Data,
    Empty,
}

/// The row being processed. Replaced at every row boundary.
pub struct RowHolder {
    pub row_index: usize,
    pub kind: RowKind,
    pub cells: BTreeMap<usize, CellData>,
    result: Option<Box<dyn Any>>,
}

impl RowHolder {
    fn new(row_index: usize) -> Self {
        RowHolder {
            row_index,
            kind: RowKind::Empty,
            cells: BTreeMap::new(),
            result: None,
        }
    }

    pub(crate) fn classify(&mut self) -> RowKind {
        self.kind = if self.cells.values().all(CellData::is_empty) {
            RowKind::Empty
        } else {
            RowKind::Data
        };
        self.kind
    }

    /// The bound record for this row, once built.
    pub fn result<T: 'static>(&self) -> Option<&T> {
        self.result.as_ref().and_then(|r| r.downcast_ref::<T>())
    }

    pub(crate) fn set_result<T: 'static>(&mut self, value: T) {
        self.result = Some(Box::new(value));
    }
}

/// The most specific active holder.
pub enum HolderRef<'a> {
    Workbook(&'a ReadWorkbookHolder),
    Sheet(&'a ReadSheetHolder),
}

impl HolderRef<'_> {
    pub fn config(&self) -> &GlobalConfiguration {
        match self {
            HolderRef::Workbook(w) => &w.config,
            HolderRef::Sheet(s) => &s.config,
        }
    }

    pub fn converters(&self) -> &ConverterRegistry {
        match self {
            HolderRef::Workbook(w) => &w.converters,
            HolderRef::Sheet(s) => &s.converters,
        }
    }
}

/// State of one read pass, handed to listeners.
pub struct ReadContext {
    pub(crate) workbook: ReadWorkbookHolder,
    pub(crate) sheets: HashMap<usize, ReadSheetHolder>,
    pub(crate) current_sheet: Option<usize>,
    pub(crate) row: Option<RowHolder>,
    next_row: usize,
    finished: bool,
}

impl ReadContext {
    /// Build the workbook holder and bulk-load the source's shared values.
    pub fn new(options: ReadWorkbook, source: &mut dyn EventSource) -> Result<Self> {
        let config = options.global.overlay(&options.config);
        let mut converters = ConverterRegistry::with_defaults();
        for c in &options.converters {
            converters.register(c.clone());
        }

        let size_hint = source.shared_values_size_hint();
        let mut cache = options.cache_selector.select(size_hint)?;
        source.load_shared_values(cache.as_mut())?;
        cache.put_finished()?;

        let sheets = source.sheet_list().to_vec();
        tracing::debug!(
            sheets = sheets.len(),
            date_1904 = ?source.date_1904(),
            cache = ?cache.backing(),
            "read context initialised"
        );

        Ok(ReadContext {
            workbook: ReadWorkbookHolder {
                config,
                head_row_number: options.head_row_number,
                ignore_empty_row: options.ignore_empty_row,
                ignore_hidden_sheet: options.ignore_hidden_sheet,
                read_default_return: options.read_default_return,
                extra_read: options.extra_read,
                converters,
                sheets,
                source_date_1904: source.date_1904(),
                head: options.head,
                cache: Some(cache),
                field_cache: FieldCache::new(),
                shared_field_cache: options.shared_field_cache,
                has_read_sheet: HashSet::new(),
            },
            sheets: HashMap::new(),
            current_sheet: None,
            row: None,
            next_row: 0,
            finished: false,
        })
    }

    pub fn workbook(&self) -> &ReadWorkbookHolder {
        &self.workbook
    }

    /// The sheet currently being read.
    pub fn sheet(&self) -> Option<&ReadSheetHolder> {
        self.current_sheet.and_then(|i| self.sheets.get(&i))
    }

    pub(crate) fn sheet_mut(&mut self) -> Option<&mut ReadSheetHolder> {
        self.current_sheet.and_then(|i| self.sheets.get_mut(&i))
    }

    /// A cached sheet holder by physical index.
    pub fn sheet_holder(&self, sheet_no: usize) -> Option<&ReadSheetHolder> {
        self.sheets.get(&sheet_no)
    }

    pub fn row(&self) -> Option<&RowHolder> {
        self.row.as_ref()
    }

    pub fn current_holder(&self) -> HolderRef<'_> {
        match self.sheet() {
            Some(s) => HolderRef::Sheet(s),
            None => HolderRef::Workbook(&self.workbook),
        }
    }

    pub fn config(&self) -> &GlobalConfiguration {
        match self.sheet() {
            Some(s) => &s.config,
            None => &self.workbook.config,
        }
    }

    pub fn use_1904(&self) -> bool {
        self.sheet()
            .map_or_else(|| self.workbook.use_1904(), |s| s.use_1904)
    }

    /// Resolve a request to a physical sheet index: index first, then name.
    pub fn resolve_sheet(&self, req: &ReadSheet) -> Result<usize> {
        let sheets = &self.workbook.sheets;
        if let Some(no) = req.sheet_no {
            return if no < sheets.len() {
                Ok(no)
            } else {
                Err(ExcelError::config(format!(
                    "sheet index {} out of range ({} sheets)",
                    no,
                    sheets.len()
                )))
            };
        }
        if let Some(name) = &req.sheet_name {
            let wanted = self.workbook.config.normalize(name);
            return sheets
                .iter()
                .find(|s| self.workbook.config.normalize(&s.name) == wanted)
                .map(|s| s.index)
                .ok_or_else(|| ExcelError::config(format!("no sheet named '{}'", name)));
        }
        if sheets.is_empty() {
            return Err(ExcelError::config("workbook has no sheets"));
        }
        Ok(0)
    }

    /// Select a sheet, building and caching its holder on first use.
    /// Idempotent: the same physical sheet always yields the same holder.
    pub fn select_sheet<T: Record>(&mut self, req: &ReadSheet) -> Result<&ReadSheetHolder> {
        let sheet_no = self.resolve_sheet(req)?;
        if !self.sheets.contains_key(&sheet_no) {
            let holder = self.build_sheet_holder::<T>(sheet_no, req)?;
            self.sheets.insert(sheet_no, holder);
        }
        self.current_sheet = Some(sheet_no);
        self.sheets
            .get(&sheet_no)
            .ok_or_else(|| ExcelError::config("sheet holder missing after selection"))
    }

    /// Mark a sheet as being walked. Fails if it was already walked.
    pub fn begin_sheet(&mut self, sheet_no: usize) -> Result<()> {
        if !self.workbook.has_read_sheet.insert(sheet_no) {
            return Err(ExcelError::DuplicateSheetRead { sheet_no });
        }
        self.current_sheet = Some(sheet_no);
        self.row = None;
        self.next_row = 0;
        tracing::debug!(sheet_no, "begin sheet");
        Ok(())
    }

    fn build_sheet_holder<T: Record>(&mut self, sheet_no: usize, req: &ReadSheet) -> Result<ReadSheetHolder> {
        let config = self.workbook.config.overlay(&req.config);
        let converters = self.workbook.converters.extended(&req.converters);
        let fields = self.workbook.fields_of::<T>();

        let head = if !fields.is_empty() {
            if req.head.is_some() || self.workbook.head.is_some() {
                tracing::debug!(sheet_no, "typed record: literal head ignored");
            }
            HeadProperty::from_layout(&FieldLayout::build(&fields)?)
        } else {
            match req.head.as_ref().or(self.workbook.head.as_ref()) {
                Some(grid) => HeadProperty::from_literal(grid),
                None => HeadProperty::none(),
            }
        };

        let head_row_number = req
            .head_row_number
            .or(self.workbook.head_row_number)
            .unwrap_or(if head.has_head() { head.head_row_number } else { 1 });

        let sheet_name = self
            .workbook
            .sheets
            .get(sheet_no)
            .map(|s| s.name.clone())
            .unwrap_or_default();
        let use_1904 = config.resolve_1904(self.workbook.source_date_1904);

        Ok(ReadSheetHolder {
            sheet_no,
            sheet_name,
            config,
            head_row_number,
            converters,
            head,
            num_rows: req.num_rows,
            head_width: None,
            use_1904,
            ended: false,
            data_rows: 0,
        })
    }

    pub(crate) fn start_row(&mut self, row_index: usize) {
        self.next_row = row_index + 1;
        self.row = Some(RowHolder::new(row_index));
    }

    /// Close the current row; cells arriving without a row start open the
    /// next one.
    pub(crate) fn clear_row(&mut self) {
        self.row = None;
    }

    /// Resolve a raw adapter value and store it in the current row.
    pub(crate) fn push_cell(
        &mut self,
        column: usize,
        raw: RawValue,
        format: Option<DataFormat>,
        formula: Option<String>,
    ) -> Result<()> {
        if self.row.is_none() {
            self.start_row(self.next_row);
        }
        let value = match raw {
            RawValue::Empty => CellValue::Empty,
            RawValue::Text(s) => CellValue::String(self.config().normalize_text(&s)),
            RawValue::Number(v) => CellValue::Number(Number::from_raw(v)),
            RawValue::Boolean(b) => CellValue::Boolean(b),
            RawValue::Error(e) => CellValue::Error(e),
            RawValue::Date(dt) => CellValue::Date(dt),
            RawValue::SharedString(i) => match self.shared_value(i)? {
                Some(s) => CellValue::String(self.config().normalize_text(&s)),
                None => {
                    tracing::warn!(index = i, "shared value missing, cell read as empty");
                    CellValue::Empty
                }
            },
        };
        if let Some(row) = self.row.as_mut() {
            let cell = CellData::new(row.row_index, column, value)
                .with_format(format)
                .with_formula(formula);
            row.cells.insert(column, cell);
        }
        Ok(())
    }

    pub fn shared_value(&mut self, index: usize) -> Result<Option<String>> {
        match self.workbook.cache.as_mut() {
            Some(cache) => cache.get(index),
            None => Err(ExcelError::config("value cache already released")),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Release the value cache and field caches. Every step runs; the first
    /// failure is returned. Safe to call more than once.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let mut guard = ReleaseGuard::new();
        let cache = self.workbook.cache.take();
        guard.attempt("value cache", || match cache {
            Some(mut cache) => cache.destroy(),
            None => Ok(()),
        });
        guard.attempt("field cache", || {
            self.workbook.field_cache.clear();
            Ok(())
        });
        self.row = None;
        self.current_sheet = None;
        guard.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemorySource;
    use crate::record::{RowMap, RowValues, TargetType};
    use crate::error::BoxError;

    struct Named {
        _name: String,
    }

    impl Record for Named {
        fn fields() -> Vec<FieldSpec> {
            vec![FieldSpec::new("name", TargetType::String).label("Name")]
        }

        fn from_values(mut values: RowValues) -> Result<Self, BoxError> {
            Ok(Named {
                _name: values.take_or_default("name")?,
            })
        }

        fn to_values(&self) -> RowValues {
            RowValues::new()
        }
    }

    fn context() -> ReadContext {
        let mut source = MemorySource::new()
            .sheet("First", vec![])
            .sheet("Second", vec![])
            .with_shared(vec!["a".into(), "b".into()]);
        ReadContext::new(ReadWorkbook::default(), &mut source).unwrap()
    }

    #[test]
    fn test_select_by_name_after_index_is_cached() {
        let mut ctx = context();
        let first = ctx.select_sheet::<RowMap>(&ReadSheet::index(1)).unwrap() as *const ReadSheetHolder;
        let second = ctx.select_sheet::<RowMap>(&ReadSheet::named("Second")).unwrap() as *const ReadSheetHolder;
        assert_eq!(first, second);
        assert_eq!(ctx.sheet().unwrap().sheet_name, "Second");
    }

    #[test]
    fn test_begin_same_sheet_twice_is_duplicate() {
        let mut ctx = context();
        ctx.select_sheet::<RowMap>(&ReadSheet::index(0)).unwrap();
        ctx.begin_sheet(0).unwrap();
        ctx.select_sheet::<RowMap>(&ReadSheet::named("First")).unwrap();
        assert!(matches!(
            ctx.begin_sheet(0),
            Err(ExcelError::DuplicateSheetRead { sheet_no: 0 })
        ));
    }

    #[test]
    fn test_unknown_sheet_is_config_error() {
        let mut ctx = context();
        assert!(matches!(
            ctx.select_sheet::<RowMap>(&ReadSheet::index(5)),
            Err(ExcelError::Config(_))
        ));
        assert!(matches!(
            ctx.select_sheet::<RowMap>(&ReadSheet::named("Nope")),
            Err(ExcelError::Config(_))
        ));
    }

    #[test]
    fn test_sheet_override_does_not_leak_to_workbook() {
        let mut ctx = context();
        let mut req = ReadSheet::index(0);
        req.config.auto_trim = Some(false);
        ctx.select_sheet::<RowMap>(&req).unwrap();
        assert!(!ctx.config().auto_trim);
        assert!(ctx.workbook().config.auto_trim);

        ctx.select_sheet::<RowMap>(&ReadSheet::index(1)).unwrap();
        assert!(ctx.config().auto_trim);
    }

    #[test]
    fn test_typed_head_row_number_from_fields() {
        let mut ctx = context();
        let holder = ctx.select_sheet::<Named>(&ReadSheet::index(0)).unwrap();
        assert!(holder.is_typed());
        assert_eq!(holder.head_row_number, 1);
        assert_eq!(ctx.workbook().field_cache_len(), 1);
    }

    #[test]
    fn test_shared_values_and_trim() {
        let mut ctx = context();
        ctx.select_sheet::<RowMap>(&ReadSheet::index(0)).unwrap();
        ctx.begin_sheet(0).unwrap();
        ctx.start_row(0);
        ctx.push_cell(0, RawValue::SharedString(1), None, None).unwrap();
        ctx.push_cell(1, RawValue::Text("  x ".into()), None, None).unwrap();
        ctx.push_cell(2, RawValue::SharedString(99), None, None).unwrap();
        let row = ctx.row().unwrap();
        assert_eq!(row.cells[&0].value, CellValue::String("b".into()));
        assert_eq!(row.cells[&1].value, CellValue::String("x".into()));
        assert!(row.cells[&2].is_empty());
    }

    #[test]
    fn test_finish_is_idempotent() {
        let mut ctx = context();
        ctx.finish().unwrap();
        ctx.finish().unwrap();
        assert!(ctx.is_finished());
        assert!(ctx.shared_value(0).is_err());
    }
}
