//! Converter registry: (target type × cell kind) → bidirectional converter.
//!
//! The read path turns a [`CellData`] into a [`Value`] for a record field;
//! the write path turns a [`Value`] into a [`WriteCellData`]. A converter
//! bound on a field overrides the registry lookup. User converters shadow
//! built-ins registered under the same key.

mod builtin;
pub mod format;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::cell::{CellData, CellKind, WriteCellData};
use crate::config::GlobalConfiguration;
use crate::error::{BoxError, DataConvertError, ExcelError, Result};
use crate::record::{TargetType, Value};

pub use builtin::{
    BoolConverter, CellDataConverter, DateConverter, NumberConverter, StringConverter,
};

/// Everything a converter may consult besides the value itself.
#[derive(Debug, Clone, Copy)]
pub struct ConvertContext<'a> {
    pub config: &'a GlobalConfiguration,
    pub use_1904: bool,
    /// Field-level number/date pattern
    pub format: Option<&'a str>,
    pub row: usize,
    pub column: usize,
}

impl<'a> ConvertContext<'a> {
    pub fn new(config: &'a GlobalConfiguration, use_1904: bool) -> Self {
        ConvertContext {
            config,
            use_1904,
            format: None,
            row: 0,
            column: 0,
        }
    }

    pub fn at(mut self, row: usize, column: usize) -> Self {
        self.row = row;
        self.column = column;
        self
    }

    pub fn with_format(mut self, format: Option<&'a str>) -> Self {
        self.format = format;
        self
    }
}

pub trait Converter: Send + Sync {
    fn target(&self) -> TargetType;

    /// Cell kind read from / written to. `None` matches any kind.
    fn cell_kind(&self) -> Option<CellKind>;

    /// Whether EMPTY cells are handed to this converter instead of binding
    /// to null.
    fn accepts_empty(&self) -> bool {
        false
    }

    fn to_value(&self, cell: &CellData, _ctx: &ConvertContext<'_>) -> Result<Value, BoxError> {
        Err(format!("{} cannot be read into {}", cell.kind(), self.target()).into())
    }

    fn to_cell(&self, value: &Value, _ctx: &ConvertContext<'_>) -> Result<WriteCellData, BoxError> {
        Err(format!("{:?} cannot be written from {}", value, self.target()).into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConverterKey {
    pub target: TargetType,
    pub kind: Option<CellKind>,
}

impl ConverterKey {
    pub fn new(target: TargetType, kind: Option<CellKind>) -> Self {
        ConverterKey { target, kind }
    }

    pub fn of(converter: &dyn Converter) -> Self {
        ConverterKey::new(converter.target(), converter.cell_kind())
    }
}

impl fmt::Display for ConverterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Some(kind) => write!(f, "{}×{}", self.target, kind),
            None => write!(f, "{}×ANY", self.target),
        }
    }
}

#[derive(Clone, Default)]
pub struct ConverterRegistry {
    read: HashMap<ConverterKey, Arc<dyn Converter>>,
    write: HashMap<ConverterKey, Arc<dyn Converter>>,
}

impl fmt::Debug for ConverterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConverterRegistry")
            .field("read", &self.read.len())
            .field("write", &self.write.len())
            .finish()
    }
}

impl ConverterRegistry {
    /// An empty registry with no built-ins.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in converter set.
    pub fn with_defaults() -> Self {
        let mut registry = Self::default();
        builtin::register_defaults(&mut registry);
        registry
    }

    /// Register for both directions; replaces any converter under the same key.
    pub fn register(&mut self, converter: Arc<dyn Converter>) {
        self.register_read(converter.clone());
        self.register_write(converter);
    }

    pub fn register_read(&mut self, converter: Arc<dyn Converter>) {
        self.read.insert(ConverterKey::of(converter.as_ref()), converter);
    }

    pub fn register_write(&mut self, converter: Arc<dyn Converter>) {
        self.write.insert(ConverterKey::of(converter.as_ref()), converter);
    }

    /// A copy of `self` with `extra` layered on top.
    pub fn extended(&self, extra: &[Arc<dyn Converter>]) -> Self {
        let mut out = self.clone();
        for c in extra {
            out.register(c.clone());
        }
        out
    }

    pub fn lookup_read(&self, target: TargetType, kind: CellKind) -> Option<&Arc<dyn Converter>> {
        self.read
            .get(&ConverterKey::new(target, Some(kind)))
            .or_else(|| self.read.get(&ConverterKey::new(target, None)))
    }

    /// `kind = None` asks for the target's natural cell kind.
    pub fn lookup_write(
        &self,
        target: TargetType,
        kind: Option<CellKind>,
    ) -> Option<&Arc<dyn Converter>> {
        let kind = kind.or_else(|| target.natural_kind());
        self.write
            .get(&ConverterKey::new(target, kind))
            .or_else(|| self.write.get(&ConverterKey::new(target, None)))
    }

    pub fn read_len(&self) -> usize {
        self.read.len()
    }

    pub fn write_len(&self) -> usize {
        self.write.len()
    }

    /// Bind one cell to `target`.
    ///
    /// Order: raw-cell target short-circuits; the field converter overrides
    /// the registry; EMPTY cells bind to null unless the converter accepts
    /// them; no converter is [`ExcelError::ConverterNotFound`]; converter
    /// failures become [`ExcelError::DataConvert`].
    pub fn convert_cell(
        &self,
        cell: &CellData,
        target: TargetType,
        field_converter: Option<&Arc<dyn Converter>>,
        ctx: &ConvertContext<'_>,
    ) -> Result<Value> {
        if target == TargetType::CellData && field_converter.is_none() {
            return Ok(Value::Cell(Box::new(cell.clone())));
        }

        let kind = cell.kind();
        let converter = field_converter.or_else(|| self.lookup_read(target, kind));

        if kind == CellKind::Empty && !converter.is_some_and(|c| c.accepts_empty()) {
            return Ok(Value::Null);
        }

        let Some(converter) = converter else {
            return Err(ExcelError::ConverterNotFound {
                row: ctx.row,
                column: ctx.column,
                kind,
                target,
            });
        };

        converter.to_value(cell, ctx).map_err(|source| {
            ExcelError::DataConvert(DataConvertError {
                row: ctx.row,
                column: ctx.column,
                cell: Box::new(cell.clone()),
                target,
                source,
            })
        })
    }

    /// Convert one value to a write cell. Nulls become empty cells.
    pub fn convert_value(
        &self,
        value: &Value,
        target: Option<TargetType>,
        write_as: Option<CellKind>,
        field_converter: Option<&Arc<dyn Converter>>,
        ctx: &ConvertContext<'_>,
    ) -> Result<WriteCellData> {
        if let Some(converter) = field_converter {
            return converter
                .to_cell(value, ctx)
                .map_err(|source| write_error(value, converter.target(), ctx, source));
        }

        let target = match (value, target) {
            (Value::Null, _) => return Ok(WriteCellData::empty()),
            (Value::Cell(cell), _) => return Ok(WriteCellData::from_read(cell)),
            (_, Some(t)) => t,
            (v, None) => match v.target_type() {
                Some(t) => t,
                None => return Ok(WriteCellData::empty()),
            },
        };

        let Some(converter) = self.lookup_write(target, write_as) else {
            return Err(ExcelError::ConverterNotFound {
                row: ctx.row,
                column: ctx.column,
                kind: write_as
                    .or_else(|| target.natural_kind())
                    .unwrap_or(CellKind::Empty),
                target,
            });
        };
        converter
            .to_cell(value, ctx)
            .map_err(|source| write_error(value, target, ctx, source))
    }
}

fn write_error(value: &Value, target: TargetType, ctx: &ConvertContext<'_>, source: BoxError) -> ExcelError {
    let shown = CellData::new(
        ctx.row,
        ctx.column,
        crate::cell::CellValue::String(value.to_string()),
    );
    ExcelError::DataConvert(DataConvertError {
        row: ctx.row,
        column: ctx.column,
        cell: Box::new(shown),
        target,
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellValue;

    struct YesNo;

    impl Converter for YesNo {
        fn target(&self) -> TargetType {
            TargetType::Bool
        }

        fn cell_kind(&self) -> Option<CellKind> {
            Some(CellKind::String)
        }

        fn to_value(&self, cell: &CellData, _ctx: &ConvertContext<'_>) -> Result<Value, BoxError> {
            match cell.value.as_str() {
                Some("yes") => Ok(Value::Bool(true)),
                Some("no") => Ok(Value::Bool(false)),
                other => Err(format!("not yes/no: {:?}", other).into()),
            }
        }
    }

    struct DefaultOnEmpty;

    impl Converter for DefaultOnEmpty {
        fn target(&self) -> TargetType {
            TargetType::I32
        }

        fn cell_kind(&self) -> Option<CellKind> {
            None
        }

        fn accepts_empty(&self) -> bool {
            true
        }

        fn to_value(&self, cell: &CellData, _ctx: &ConvertContext<'_>) -> Result<Value, BoxError> {
            Ok(if cell.is_empty() { Value::Int(-1) } else { Value::Int(1) })
        }
    }

    fn ctx(config: &GlobalConfiguration) -> ConvertContext<'_> {
        ConvertContext::new(config, false).at(4, 2)
    }

    #[test]
    fn test_user_converter_shadows_builtin() {
        let config = GlobalConfiguration::default();
        let mut registry = ConverterRegistry::with_defaults();
        let cell = CellData::new(4, 2, CellValue::String("yes".into()));
        // Built-in text → bool only recognises "true"
        assert_eq!(
            registry
                .convert_cell(&cell, TargetType::Bool, None, &ctx(&config))
                .unwrap(),
            Value::Bool(false)
        );

        registry.register_read(Arc::new(YesNo));
        let v = registry
            .convert_cell(&cell, TargetType::Bool, None, &ctx(&config))
            .unwrap();
        assert_eq!(v, Value::Bool(true));
    }

    #[test]
    fn test_field_converter_overrides_lookup() {
        let config = GlobalConfiguration::default();
        let registry = ConverterRegistry::with_defaults();
        let field: Arc<dyn Converter> = Arc::new(YesNo);
        let cell = CellData::new(4, 2, CellValue::String("no".into()));
        let v = registry
            .convert_cell(&cell, TargetType::Bool, Some(&field), &ctx(&config))
            .unwrap();
        assert_eq!(v, Value::Bool(false));
    }

    #[test]
    fn test_empty_binds_to_null_unless_accepted() {
        let config = GlobalConfiguration::default();
        let registry = ConverterRegistry::with_defaults();
        let empty = CellData::new(4, 2, CellValue::Empty);
        assert_eq!(
            registry
                .convert_cell(&empty, TargetType::I32, None, &ctx(&config))
                .unwrap(),
            Value::Null
        );
        // Even a target with no converter at all binds EMPTY to null
        assert_eq!(
            registry
                .convert_cell(&empty, TargetType::Custom("Money"), None, &ctx(&config))
                .unwrap(),
            Value::Null
        );

        let field: Arc<dyn Converter> = Arc::new(DefaultOnEmpty);
        assert_eq!(
            registry
                .convert_cell(&empty, TargetType::I32, Some(&field), &ctx(&config))
                .unwrap(),
            Value::Int(-1)
        );
    }

    #[test]
    fn test_missing_converter_tagged_with_position() {
        let config = GlobalConfiguration::default();
        let registry = ConverterRegistry::with_defaults();
        let cell = CellData::new(4, 2, CellValue::Boolean(true));
        let err = registry
            .convert_cell(&cell, TargetType::Custom("Money"), None, &ctx(&config))
            .unwrap_err();
        match err {
            ExcelError::ConverterNotFound { row, column, kind, .. } => {
                assert_eq!((row, column, kind), (4, 2, CellKind::Boolean));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_failure_wrapped_with_cell() {
        let config = GlobalConfiguration::default();
        let registry = ConverterRegistry::with_defaults();
        let cell = CellData::new(4, 2, CellValue::String("abc".into()));
        let err = registry
            .convert_cell(&cell, TargetType::I32, None, &ctx(&config))
            .unwrap_err();
        match err {
            ExcelError::DataConvert(e) => {
                assert_eq!((e.row, e.column), (4, 2));
                assert_eq!(e.cell.value, CellValue::String("abc".into()));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_cell_data_target_passthrough() {
        let config = GlobalConfiguration::default();
        let registry = ConverterRegistry::empty();
        let cell = CellData::new(0, 0, CellValue::Empty);
        let v = registry
            .convert_cell(&cell, TargetType::CellData, None, &ctx(&config))
            .unwrap();
        assert!(matches!(v, Value::Cell(_)));
    }

    #[test]
    fn test_write_lookup_by_value_type() {
        let config = GlobalConfiguration::default();
        let registry = ConverterRegistry::with_defaults();
        let cell = registry
            .convert_value(&Value::Int(7), None, None, None, &ctx(&config))
            .unwrap();
        assert_eq!(cell.value, CellValue::number(7.0));

        let as_text = registry
            .convert_value(
                &Value::Int(7),
                Some(TargetType::I64),
                Some(CellKind::String),
                None,
                &ctx(&config),
            )
            .unwrap();
        assert_eq!(as_text.value, CellValue::String("7".into()));

        let null = registry
            .convert_value(&Value::Null, Some(TargetType::I64), None, None, &ctx(&config))
            .unwrap();
        assert!(null.value.is_empty());
    }
}
