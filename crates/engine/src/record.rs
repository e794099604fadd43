//! Record binding without reflection.
//!
//! A record type describes its columns through [`Record::fields`] and moves
//! data in and out through [`RowValues`]. Types that return no fields are
//! "untyped": their rows are positional (column → value), like [`RowMap`].

use std::any::TypeId;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;

use crate::cell::{CellData, CellKind};
use crate::convert::Converter;
use crate::error::{BoxError, ExcelError, Result};
use crate::style::CellStyle;

/// The Rust-side type a cell binds to; the other half of a converter key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TargetType {
    String,
    Bool,
    I8,
    I16,
    I32,
    I64,
    U64,
    F32,
    F64,
    Date,
    DateTime,
    /// The raw cell, unconverted
    CellData,
    /// A user type handled by a registered converter
    Custom(&'static str),
}

impl TargetType {
    /// Cell kind this target is written as when nothing else is configured.
    pub fn natural_kind(&self) -> Option<CellKind> {
        match self {
            TargetType::String => Some(CellKind::String),
            TargetType::Bool => Some(CellKind::Boolean),
            TargetType::I8
            | TargetType::I16
            | TargetType::I32
            | TargetType::I64
            | TargetType::U64
            | TargetType::F32
            | TargetType::F64 => Some(CellKind::Number),
            TargetType::Date | TargetType::DateTime => Some(CellKind::Date),
            TargetType::CellData | TargetType::Custom(_) => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        self.natural_kind() == Some(CellKind::Number)
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TargetType::String => "String",
            TargetType::Bool => "bool",
            TargetType::I8 => "i8",
            TargetType::I16 => "i16",
            TargetType::I32 => "i32",
            TargetType::I64 => "i64",
            TargetType::U64 => "u64",
            TargetType::F32 => "f32",
            TargetType::F64 => "f64",
            TargetType::Date => "NaiveDate",
            TargetType::DateTime => "NaiveDateTime",
            TargetType::CellData => "CellData",
            TargetType::Custom(name) => name,
        };
        f.write_str(name)
    }
}

/// A bound value, between cells and record fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    String(String),
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Cell(Box<CellData>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Target used to write this value when no field metadata exists.
    pub fn target_type(&self) -> Option<TargetType> {
        match self {
            Value::Null => None,
            Value::String(_) => Some(TargetType::String),
            Value::Bool(_) => Some(TargetType::Bool),
            Value::Int(_) => Some(TargetType::I64),
            Value::UInt(_) => Some(TargetType::U64),
            Value::Float(_) => Some(TargetType::F64),
            Value::Date(_) => Some(TargetType::Date),
            Value::DateTime(_) => Some(TargetType::DateTime),
            Value::Cell(_) => Some(TargetType::CellData),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::String(s) => f.write_str(s),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::UInt(u) => write!(f, "{}", u),
            Value::Float(v) => write!(f, "{}", v),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::DateTime(d) => write!(f, "{}", d.format("%Y-%m-%d %H:%M:%S")),
            Value::Cell(c) => write!(f, "{}", c.value),
        }
    }
}

macro_rules! value_from {
    ($($t:ty => $variant:ident as $conv:ty),* $(,)?) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::$variant(<$conv>::from(v))
            }
        })*
    };
}

value_from! {
    String => String as String,
    &str => String as String,
    bool => Bool as bool,
    i8 => Int as i64,
    i16 => Int as i64,
    i32 => Int as i64,
    i64 => Int as i64,
    u8 => UInt as u64,
    u16 => UInt as u64,
    u32 => UInt as u64,
    u64 => UInt as u64,
    f32 => Float as f64,
    f64 => Float as f64,
    NaiveDate => Date as NaiveDate,
    NaiveDateTime => DateTime as NaiveDateTime,
}

impl From<CellData> for Value {
    fn from(v: CellData) -> Self {
        Value::Cell(Box::new(v))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Extraction of a field value out of a [`Value`].
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self, BoxError>;
}

fn mismatch(expected: &str, got: &Value) -> BoxError {
    format!("expected {}, got {:?}", expected, got).into()
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self, BoxError> {
        Ok(value)
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self, BoxError> {
        match value {
            Value::String(s) => Ok(s),
            Value::Null => Err(mismatch("String", &value)),
            other => Ok(other.to_string()),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self, BoxError> {
        match value {
            Value::Bool(b) => Ok(b),
            other => Err(mismatch("bool", &other)),
        }
    }
}

macro_rules! int_from_value {
    ($($t:ty),*) => {
        $(impl FromValue for $t {
            fn from_value(value: Value) -> Result<Self, BoxError> {
                match value {
                    Value::Int(i) => <$t>::try_from(i).map_err(|e| e.into()),
                    Value::UInt(u) => <$t>::try_from(u).map_err(|e| e.into()),
                    other => Err(mismatch(stringify!($t), &other)),
                }
            }
        })*
    };
}

int_from_value!(i8, i16, i32, i64, u8, u16, u32, u64);

impl FromValue for f64 {
    fn from_value(value: Value) -> Result<Self, BoxError> {
        match value {
            Value::Float(v) => Ok(v),
            Value::Int(i) => Ok(i as f64),
            Value::UInt(u) => Ok(u as f64),
            other => Err(mismatch("f64", &other)),
        }
    }
}

impl FromValue for f32 {
    fn from_value(value: Value) -> Result<Self, BoxError> {
        f64::from_value(value).map(|v| v as f32)
    }
}

impl FromValue for NaiveDate {
    fn from_value(value: Value) -> Result<Self, BoxError> {
        match value {
            Value::Date(d) => Ok(d),
            Value::DateTime(dt) => Ok(dt.date()),
            other => Err(mismatch("NaiveDate", &other)),
        }
    }
}

impl FromValue for NaiveDateTime {
    fn from_value(value: Value) -> Result<Self, BoxError> {
        match value {
            Value::DateTime(dt) => Ok(dt),
            Value::Date(d) => d
                .and_hms_opt(0, 0, 0)
                .ok_or_else(|| mismatch("NaiveDateTime", &Value::Date(d))),
            other => Err(mismatch("NaiveDateTime", &other)),
        }
    }
}

impl FromValue for CellData {
    fn from_value(value: Value) -> Result<Self, BoxError> {
        match value {
            Value::Cell(c) => Ok(*c),
            other => Err(mismatch("CellData", &other)),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self, BoxError> {
        match value {
            Value::Null => Ok(None),
            v => T::from_value(v).map(Some),
        }
    }
}

/// Repeat a block every `each_row` rows across `column_extend` columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopMerge {
    pub each_row: usize,
    pub column_extend: usize,
}

/// Column metadata for one field of a record type.
#[derive(Clone)]
pub struct FieldSpec {
    pub name: &'static str,
    pub target: TargetType,
    /// Header labels, one per header row. Empty means "use the field name".
    pub labels: Vec<String>,
    pub index: Option<usize>,
    pub order: i32,
    pub ignore: bool,
    pub converter: Option<Arc<dyn Converter>>,
    /// Number or date pattern used by converters, e.g. `yyyy-MM-dd` or `#,##0.00`
    pub format: Option<String>,
    /// Write this field as a different cell kind (e.g. numbers as text)
    pub write_as: Option<CellKind>,
    pub column_width: Option<f64>,
    pub loop_merge: Option<LoopMerge>,
    pub head_style: Option<CellStyle>,
    pub content_style: Option<CellStyle>,
}

impl fmt::Debug for FieldSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldSpec")
            .field("name", &self.name)
            .field("target", &self.target)
            .field("labels", &self.labels)
            .field("index", &self.index)
            .field("order", &self.order)
            .field("ignore", &self.ignore)
            .field("converter", &self.converter.is_some())
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

impl FieldSpec {
    pub fn new(name: &'static str, target: TargetType) -> Self {
        FieldSpec {
            name,
            target,
            labels: Vec::new(),
            index: None,
            order: i32::MAX,
            ignore: false,
            converter: None,
            format: None,
            write_as: None,
            column_width: None,
            loop_merge: None,
            head_style: None,
            content_style: None,
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.labels.push(label.into());
        self
    }

    pub fn labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn index(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }

    pub fn order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn ignore(mut self) -> Self {
        self.ignore = true;
        self
    }

    pub fn converter(mut self, converter: Arc<dyn Converter>) -> Self {
        self.converter = Some(converter);
        self
    }

    pub fn format(mut self, pattern: impl Into<String>) -> Self {
        self.format = Some(pattern.into());
        self
    }

    pub fn write_as(mut self, kind: CellKind) -> Self {
        self.write_as = Some(kind);
        self
    }

    pub fn column_width(mut self, width: f64) -> Self {
        self.column_width = Some(width);
        self
    }

    pub fn loop_merge(mut self, each_row: usize, column_extend: usize) -> Self {
        self.loop_merge = Some(LoopMerge {
            each_row,
            column_extend,
        });
        self
    }

    pub fn head_style(mut self, style: CellStyle) -> Self {
        self.head_style = Some(style);
        self
    }

    pub fn content_style(mut self, style: CellStyle) -> Self {
        self.content_style = Some(style);
        self
    }

    /// Labels matched by name when reading (explicit labels, no index).
    pub fn force_name(&self) -> bool {
        !self.labels.is_empty()
    }

    pub fn force_index(&self) -> bool {
        self.index.is_some()
    }

    pub fn effective_labels(&self) -> Vec<String> {
        if self.labels.is_empty() {
            vec![self.name.to_string()]
        } else {
            self.labels.clone()
        }
    }
}

/// Values moving between a record and one row.
///
/// Typed records use named fields; untyped rows use positions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowValues {
    fields: BTreeMap<&'static str, Value>,
    positional: BTreeMap<usize, Value>,
}

impl RowValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, field: &'static str, value: impl Into<Value>) -> &mut Self {
        self.fields.insert(field, value.into());
        self
    }

    pub fn with(mut self, field: &'static str, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    pub fn set_position(&mut self, position: usize, value: impl Into<Value>) -> &mut Self {
        self.positional.insert(position, value.into());
        self
    }

    pub fn field(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn contains_field(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// Remove a field and extract it; a missing field reads as `Null`.
    pub fn take<T: FromValue>(&mut self, field: &str) -> Result<T, BoxError> {
        let value = self.fields.remove(field).unwrap_or_default();
        T::from_value(value).map_err(|e| format!("field '{}': {}", field, e).into())
    }

    /// Like [`take`](Self::take) but a missing or null field yields `T::default()`.
    pub fn take_or_default<T: FromValue + Default>(&mut self, field: &str) -> Result<T, BoxError> {
        match self.fields.remove(field) {
            None | Some(Value::Null) => Ok(T::default()),
            Some(v) => T::from_value(v).map_err(|e| format!("field '{}': {}", field, e).into()),
        }
    }

    pub fn positional(&self) -> &BTreeMap<usize, Value> {
        &self.positional
    }

    pub fn into_positional(self) -> BTreeMap<usize, Value> {
        self.positional
    }

    pub fn fields(&self) -> impl Iterator<Item = (&'static str, &Value)> {
        self.fields.iter().map(|(k, v)| (*k, v))
    }
}

/// A row type the engine can bind to and from.
pub trait Record: Sized + 'static {
    /// Column metadata; empty for untyped rows.
    fn fields() -> Vec<FieldSpec> {
        Vec::new()
    }

    fn from_values(values: RowValues) -> Result<Self, BoxError>;

    fn to_values(&self) -> RowValues;
}

/// Untyped row: column index → value.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RowMap(pub BTreeMap<usize, Value>);

impl RowMap {
    pub fn get(&self, column: usize) -> Option<&Value> {
        self.0.get(&column)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.0.values()
    }
}

impl FromIterator<(usize, Value)> for RowMap {
    fn from_iter<I: IntoIterator<Item = (usize, Value)>>(iter: I) -> Self {
        RowMap(iter.into_iter().collect())
    }
}

impl Record for RowMap {
    fn from_values(values: RowValues) -> Result<Self, BoxError> {
        Ok(RowMap(values.into_positional()))
    }

    fn to_values(&self) -> RowValues {
        RowValues {
            fields: BTreeMap::new(),
            positional: self.0.clone(),
        }
    }
}

impl Record for Vec<Value> {
    fn from_values(values: RowValues) -> Result<Self, BoxError> {
        let positional = values.into_positional();
        let width = positional.keys().next_back().map_or(0, |k| k + 1);
        let mut out = vec![Value::Null; width];
        for (k, v) in positional {
            out[k] = v;
        }
        Ok(out)
    }

    fn to_values(&self) -> RowValues {
        RowValues {
            fields: BTreeMap::new(),
            positional: self.iter().cloned().enumerate().collect(),
        }
    }
}

/// Write-side column selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnFilter {
    pub include_indexes: Option<BTreeSet<usize>>,
    pub include_names: Option<Vec<String>>,
    pub exclude_indexes: BTreeSet<usize>,
    pub exclude_names: BTreeSet<String>,
    /// Lay included fields out in `include_names` order
    pub order_by_include: bool,
}

impl ColumnFilter {
    pub fn is_empty(&self) -> bool {
        *self == ColumnFilter::default()
    }

    fn keeps(&self, column: usize, name: &str) -> bool {
        if self.exclude_indexes.contains(&column) || self.exclude_names.contains(name) {
            return false;
        }
        let by_index = self.include_indexes.as_ref().map(|s| s.contains(&column));
        let by_name = self
            .include_names
            .as_ref()
            .map(|names| names.iter().any(|n| n == name));
        match (by_index, by_name) {
            (None, None) => true,
            (a, b) => a.unwrap_or(false) || b.unwrap_or(false),
        }
    }
}

/// Column assignment for a record type: column → field.
#[derive(Debug, Clone, Default)]
pub struct FieldLayout {
    pub columns: BTreeMap<usize, FieldSpec>,
}

impl FieldLayout {
    /// Explicit indexes first; the rest fill free columns by `order`,
    /// then declaration order.
    pub fn build(fields: &[FieldSpec]) -> Result<FieldLayout> {
        let mut columns: BTreeMap<usize, FieldSpec> = BTreeMap::new();
        let mut floating: Vec<&FieldSpec> = Vec::new();

        for field in fields.iter().filter(|f| !f.ignore) {
            match field.index {
                Some(index) => {
                    if let Some(existing) = columns.get(&index) {
                        return Err(ExcelError::config(format!(
                            "fields '{}' and '{}' share column index {}",
                            existing.name, field.name, index
                        )));
                    }
                    columns.insert(index, field.clone());
                }
                None => floating.push(field),
            }
        }

        floating.sort_by_key(|f| f.order);
        let mut next = 0;
        for field in floating {
            while columns.contains_key(&next) {
                next += 1;
            }
            columns.insert(next, field.clone());
            next += 1;
        }

        Ok(FieldLayout { columns })
    }

    /// Layout after applying a write-side filter. Dropped columns close up
    /// unless the remaining field pins an explicit index.
    pub fn build_filtered(fields: &[FieldSpec], filter: &ColumnFilter) -> Result<FieldLayout> {
        let full = FieldLayout::build(fields)?;
        if filter.is_empty() {
            return Ok(full);
        }

        let mut kept: Vec<FieldSpec> = full
            .columns
            .into_iter()
            .filter(|(column, field)| filter.keeps(*column, field.name))
            .map(|(_, field)| field)
            .collect();

        if filter.order_by_include {
            if let Some(names) = &filter.include_names {
                kept.sort_by_key(|f| {
                    names
                        .iter()
                        .position(|n| n == f.name)
                        .unwrap_or(usize::MAX)
                });
                let columns = kept
                    .into_iter()
                    .enumerate()
                    .map(|(i, mut f)| {
                        f.index = Some(i);
                        (i, f)
                    })
                    .collect();
                return Ok(FieldLayout { columns });
            }
        }

        // Already in column order; floating fields get consecutive order keys
        for (i, field) in kept.iter_mut().enumerate() {
            if field.index.is_none() {
                field.order = i as i32;
            }
        }
        FieldLayout::build(&kept)
    }

    pub fn field(&self, column: usize) -> Option<&FieldSpec> {
        self.columns.get(&column)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Field metadata per record type, keyed by type identity.
///
/// Replaces implicit global state: the owner decides the lifetime and must
/// call [`clear`](Self::clear) when the workbook closes.
#[derive(Debug, Default)]
pub struct FieldCache {
    entries: HashMap<TypeId, Arc<Vec<FieldSpec>>>,
}

/// A field cache shared between workbook instances.
pub type SharedFieldCache = Arc<Mutex<FieldCache>>;

impl FieldCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fields_of<T: Record>(&mut self) -> Arc<Vec<FieldSpec>> {
        self.entries
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Arc::new(T::fields()))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
