// Built-in converters: every target type against the cell kinds it can come from

use std::sync::Arc;

use chrono::NaiveDateTime;

use super::format::{self, format_cell_number, format_date, format_number, parse_date, parse_number};
use super::{ConvertContext, Converter, ConverterRegistry};
use crate::cell::{CellData, CellKind, CellValue, Number, WriteCellData};
use crate::error::BoxError;
use crate::numeric;
use crate::record::{TargetType, Value};
use crate::style::CellStyle;

const NUMERIC_TARGETS: [TargetType; 7] = [
    TargetType::I8,
    TargetType::I16,
    TargetType::I32,
    TargetType::I64,
    TargetType::U64,
    TargetType::F32,
    TargetType::F64,
];

pub(super) fn register_defaults(registry: &mut ConverterRegistry) {
    for kind in [
        CellKind::String,
        CellKind::Number,
        CellKind::Boolean,
        CellKind::Error,
        CellKind::Date,
        CellKind::RichText,
    ] {
        registry.register(Arc::new(StringConverter { kind }));
    }

    for target in NUMERIC_TARGETS {
        for kind in [CellKind::Number, CellKind::String, CellKind::Boolean] {
            registry.register(Arc::new(NumberConverter { target, kind }));
        }
    }

    for kind in [CellKind::Boolean, CellKind::Number, CellKind::String] {
        registry.register(Arc::new(BoolConverter { kind }));
    }

    for target in [TargetType::Date, TargetType::DateTime] {
        for kind in [CellKind::Number, CellKind::String, CellKind::Date] {
            registry.register(Arc::new(DateConverter { target, kind }));
        }
    }

    registry.register(Arc::new(CellDataConverter));
}

fn value_as_f64(value: &Value) -> Result<f64, BoxError> {
    match value {
        Value::Int(i) => Ok(*i as f64),
        Value::UInt(u) => Ok(*u as f64),
        Value::Float(f) => Ok(*f),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => parse_number(s, None),
        other => Err(format!("{:?} is not numeric", other).into()),
    }
}

fn value_as_datetime(value: &Value) -> Result<NaiveDateTime, BoxError> {
    match value {
        Value::DateTime(dt) => Ok(*dt),
        Value::Date(d) => d
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| format!("invalid date {}", d).into()),
        Value::String(s) => parse_date(s, None),
        other => Err(format!("{:?} is not a date", other).into()),
    }
}

/// Bind a corrected number to a numeric target. Integers truncate toward
/// zero and must fit the target range.
fn number_to_value(v: f64, target: TargetType) -> Result<Value, BoxError> {
    if !v.is_finite() {
        return Err(format!("{} is not finite", v).into());
    }
    let t = v.trunc();
    let out_of_range = || -> BoxError { format!("{} does not fit {}", v, target).into() };
    let int_bounds = |min: f64, max: f64| -> Result<Value, BoxError> {
        if t < min || t > max {
            Err(out_of_range())
        } else {
            Ok(Value::Int(t as i64))
        }
    };
    match target {
        TargetType::F64 | TargetType::F32 => Ok(Value::Float(v)),
        TargetType::I8 => int_bounds(i8::MIN as f64, i8::MAX as f64),
        TargetType::I16 => int_bounds(i16::MIN as f64, i16::MAX as f64),
        TargetType::I32 => int_bounds(i32::MIN as f64, i32::MAX as f64),
        TargetType::I64 => int_bounds(i64::MIN as f64, i64::MAX as f64),
        TargetType::U64 => {
            if t < 0.0 || t > u64::MAX as f64 {
                Err(out_of_range())
            } else {
                Ok(Value::UInt(t as u64))
            }
        }
        other => Err(format!("{} is not numeric", other).into()),
    }
}

fn parse_bool_text(s: &str) -> bool {
    s.trim().eq_ignore_ascii_case("true")
}

fn number_cell(v: f64, pattern: Option<&str>) -> WriteCellData {
    let mut cell = WriteCellData::new(CellValue::Number(Number::exact(v)));
    if let Some(p) = pattern {
        cell.style = Some(CellStyle::new().with_number_format(p));
    }
    cell
}

/// Text fields.
#[derive(Debug, Clone, Copy)]
pub struct StringConverter {
    pub kind: CellKind,
}

impl Converter for StringConverter {
    fn target(&self) -> TargetType {
        TargetType::String
    }

    fn cell_kind(&self) -> Option<CellKind> {
        Some(self.kind)
    }

    fn to_value(&self, cell: &CellData, ctx: &ConvertContext<'_>) -> Result<Value, BoxError> {
        let text = match &cell.value {
            CellValue::String(s) | CellValue::Error(s) => s.clone(),
            CellValue::RichText(r) => r.text.clone(),
            CellValue::Boolean(b) => b.to_string(),
            CellValue::Date(d) => format_date(*d, ctx.format),
            CellValue::Number(n) => match ctx.format {
                Some(p) if cell.is_date_formatted() => {
                    let dt = numeric::serial_to_datetime(n.value, ctx.use_1904)
                        .ok_or_else(|| format!("{} is not a valid date serial", n.value))?;
                    format_date(dt, Some(p))
                }
                Some(p) => format_number(n.value, Some(p), ctx.config.use_scientific_format),
                None => format_cell_number(
                    *n,
                    cell.data_format.as_ref(),
                    ctx.use_1904,
                    ctx.config.use_scientific_format,
                ),
            },
            CellValue::Empty => return Ok(Value::Null),
        };
        Ok(Value::String(text))
    }

    fn to_cell(&self, value: &Value, ctx: &ConvertContext<'_>) -> Result<WriteCellData, BoxError> {
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let cell = match self.kind {
            CellKind::Number => number_cell(parse_number(&text, ctx.format)?, ctx.format),
            CellKind::Boolean => WriteCellData::new(CellValue::Boolean(parse_bool_text(&text))),
            CellKind::Error => WriteCellData::new(CellValue::Error(text)),
            CellKind::Date => {
                let dt = parse_date(&text, ctx.format)?;
                let mut cell = WriteCellData::new(CellValue::Date(dt));
                cell.style = Some(
                    CellStyle::new()
                        .with_number_format(ctx.format.unwrap_or(format::DEFAULT_DATE_PATTERN)),
                );
                cell
            }
            CellKind::RichText => {
                WriteCellData::new(CellValue::RichText(crate::cell::RichText::new(text)))
            }
            _ => WriteCellData::string(text),
        };
        Ok(cell)
    }
}

/// Integer and floating-point fields.
#[derive(Debug, Clone, Copy)]
pub struct NumberConverter {
    pub target: TargetType,
    pub kind: CellKind,
}

impl Converter for NumberConverter {
    fn target(&self) -> TargetType {
        self.target
    }

    fn cell_kind(&self) -> Option<CellKind> {
        Some(self.kind)
    }

    fn to_value(&self, cell: &CellData, ctx: &ConvertContext<'_>) -> Result<Value, BoxError> {
        let v = match &cell.value {
            CellValue::Number(n) => n.value,
            CellValue::Boolean(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            CellValue::String(s) => numeric::correct_precision(parse_number(s, ctx.format)?),
            other => return Err(format!("{} is not numeric", other.kind()).into()),
        };
        number_to_value(v, self.target)
    }

    fn to_cell(&self, value: &Value, ctx: &ConvertContext<'_>) -> Result<WriteCellData, BoxError> {
        let v = value_as_f64(value)?;
        Ok(match self.kind {
            CellKind::String => WriteCellData::string(format_number(
                v,
                ctx.format,
                ctx.config.use_scientific_format,
            )),
            CellKind::Boolean => WriteCellData::new(CellValue::Boolean(v == 1.0)),
            _ => number_cell(v, ctx.format),
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BoolConverter {
    pub kind: CellKind,
}

impl Converter for BoolConverter {
    fn target(&self) -> TargetType {
        TargetType::Bool
    }

    fn cell_kind(&self) -> Option<CellKind> {
        Some(self.kind)
    }

    fn to_value(&self, cell: &CellData, _ctx: &ConvertContext<'_>) -> Result<Value, BoxError> {
        match &cell.value {
            CellValue::Boolean(b) => Ok(Value::Bool(*b)),
            CellValue::Number(n) => Ok(Value::Bool(n.value == 1.0)),
            CellValue::String(s) => Ok(Value::Bool(parse_bool_text(s))),
            other => Err(format!("{} is not a boolean", other.kind()).into()),
        }
    }

    fn to_cell(&self, value: &Value, _ctx: &ConvertContext<'_>) -> Result<WriteCellData, BoxError> {
        let b = match value {
            Value::Bool(b) => *b,
            Value::String(s) => parse_bool_text(s),
            other => value_as_f64(other)? == 1.0,
        };
        Ok(match self.kind {
            CellKind::Number => number_cell(if b { 1.0 } else { 0.0 }, None),
            CellKind::String => WriteCellData::string(b.to_string()),
            _ => WriteCellData::new(CellValue::Boolean(b)),
        })
    }
}

/// `NaiveDate` and `NaiveDateTime` fields.
#[derive(Debug, Clone, Copy)]
pub struct DateConverter {
    pub target: TargetType,
    pub kind: CellKind,
}

impl DateConverter {
    fn bind(&self, dt: NaiveDateTime) -> Value {
        match self.target {
            TargetType::Date => Value::Date(dt.date()),
            _ => Value::DateTime(dt),
        }
    }

    fn default_cell_format(&self) -> &'static str {
        match self.target {
            TargetType::Date => "yyyy-mm-dd",
            _ => "yyyy-mm-dd hh:mm:ss",
        }
    }
}

impl Converter for DateConverter {
    fn target(&self) -> TargetType {
        self.target
    }

    fn cell_kind(&self) -> Option<CellKind> {
        Some(self.kind)
    }

    fn to_value(&self, cell: &CellData, ctx: &ConvertContext<'_>) -> Result<Value, BoxError> {
        let dt = match &cell.value {
            CellValue::Date(dt) => *dt,
            CellValue::Number(n) => numeric::serial_to_datetime(n.value, ctx.use_1904)
                .ok_or_else(|| format!("{} is not a valid date serial", n.value))?,
            CellValue::String(s) => parse_date(s, ctx.format)?,
            other => return Err(format!("{} is not a date", other.kind()).into()),
        };
        Ok(self.bind(dt))
    }

    fn to_cell(&self, value: &Value, ctx: &ConvertContext<'_>) -> Result<WriteCellData, BoxError> {
        let dt = value_as_datetime(value)?;
        Ok(match self.kind {
            CellKind::String => {
                let pattern = ctx.format.or(match self.target {
                    TargetType::Date => Some("yyyy-MM-dd"),
                    _ => None,
                });
                WriteCellData::string(format_date(dt, pattern))
            }
            CellKind::Number => number_cell(
                numeric::datetime_to_serial(dt, ctx.use_1904),
                Some(ctx.format.unwrap_or(self.default_cell_format())),
            ),
            _ => WriteCellData::new(CellValue::Date(dt)).with_style(
                CellStyle::new().with_number_format(ctx.format.unwrap_or(self.default_cell_format())),
            ),
        })
    }
}

/// Raw cells pass through untouched, EMPTY included.
#[derive(Debug, Clone, Copy)]
pub struct CellDataConverter;

impl Converter for CellDataConverter {
    fn target(&self) -> TargetType {
        TargetType::CellData
    }

    fn cell_kind(&self) -> Option<CellKind> {
        None
    }

    fn accepts_empty(&self) -> bool {
        true
    }

    fn to_value(&self, cell: &CellData, _ctx: &ConvertContext<'_>) -> Result<Value, BoxError> {
        Ok(Value::Cell(Box::new(cell.clone())))
    }

    fn to_cell(&self, value: &Value, _ctx: &ConvertContext<'_>) -> Result<WriteCellData, BoxError> {
        match value {
            Value::Cell(cell) => Ok(WriteCellData::from_read(cell)),
            other => Err(format!("{:?} is not a cell", other).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::DataFormat;
    use crate::config::GlobalConfiguration;
    use chrono::NaiveDate;

    fn read(
        registry: &ConverterRegistry,
        value: CellValue,
        target: TargetType,
    ) -> crate::error::Result<Value> {
        let config = GlobalConfiguration::default();
        let ctx = ConvertContext::new(&config, false);
        registry.convert_cell(&CellData::new(0, 0, value), target, None, &ctx)
    }

    #[test]
    fn test_full_default_set_registered() {
        let registry = ConverterRegistry::with_defaults();
        // 6 string + 21 numeric + 3 bool + 6 date + 1 raw cell
        assert_eq!(registry.read_len(), 37);
        assert_eq!(registry.write_len(), 37);
    }

    #[test]
    fn test_numbers_from_every_kind() {
        let r = ConverterRegistry::with_defaults();
        assert_eq!(
            read(&r, CellValue::number(42.9), TargetType::I32).unwrap(),
            Value::Int(42)
        );
        assert_eq!(
            read(&r, CellValue::String("17".into()), TargetType::I64).unwrap(),
            Value::Int(17)
        );
        assert_eq!(
            read(&r, CellValue::Boolean(true), TargetType::U64).unwrap(),
            Value::UInt(1)
        );
        assert_eq!(
            read(&r, CellValue::String("0.1".into()), TargetType::F64).unwrap(),
            Value::Float(0.1)
        );
        assert!(read(&r, CellValue::number(300.0), TargetType::I8).is_err());
        assert!(read(&r, CellValue::number(-1.0), TargetType::U64).is_err());
    }

    #[test]
    fn test_corrected_value_used_for_binding() {
        let r = ConverterRegistry::with_defaults();
        let raw = CellValue::Number(Number::from_raw(2087.0249999999996));
        assert_eq!(read(&r, raw, TargetType::F64).unwrap(), Value::Float(2087.025));
    }

    #[test]
    fn test_strings_from_every_kind() {
        let r = ConverterRegistry::with_defaults();
        assert_eq!(
            read(&r, CellValue::number(3.0), TargetType::String).unwrap(),
            Value::String("3".into())
        );
        assert_eq!(
            read(&r, CellValue::Boolean(false), TargetType::String).unwrap(),
            Value::String("false".into())
        );
        assert_eq!(
            read(&r, CellValue::Error("#N/A".into()), TargetType::String).unwrap(),
            Value::String("#N/A".into())
        );
    }

    #[test]
    fn test_date_serial_respects_epoch() {
        let r = ConverterRegistry::with_defaults();
        let config = GlobalConfiguration::default();
        let cell = CellData::new(0, 0, CellValue::number(0.0));
        let ctx = ConvertContext::new(&config, true);
        let v = r.convert_cell(&cell, TargetType::Date, None, &ctx).unwrap();
        assert_eq!(v, Value::Date(NaiveDate::from_ymd_opt(1904, 1, 1).unwrap()));

        let ctx = ConvertContext::new(&config, false);
        let cell = CellData::new(0, 0, CellValue::number(1.0));
        let v = r.convert_cell(&cell, TargetType::Date, None, &ctx).unwrap();
        assert_eq!(v, Value::Date(NaiveDate::from_ymd_opt(1900, 1, 1).unwrap()));
    }

    #[test]
    fn test_date_formatted_number_to_string() {
        let r = ConverterRegistry::with_defaults();
        let config = GlobalConfiguration::default();
        let ctx = ConvertContext::new(&config, false);
        let cell = CellData::new(0, 0, CellValue::number(45292.0))
            .with_format(Some(DataFormat::new(14, "yyyy-mm-dd")));
        let v = r.convert_cell(&cell, TargetType::String, None, &ctx).unwrap();
        assert_eq!(v, Value::String("2024-01-01".into()));

        let ctx = ctx.with_format(Some("dd/MM/yyyy"));
        let v = r.convert_cell(&cell, TargetType::String, None, &ctx).unwrap();
        assert_eq!(v, Value::String("01/01/2024".into()));
    }

    #[test]
    fn test_bool_text_is_lenient() {
        let r = ConverterRegistry::with_defaults();
        assert_eq!(
            read(&r, CellValue::String("TRUE".into()), TargetType::Bool).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            read(&r, CellValue::String("maybe".into()), TargetType::Bool).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_write_dates() {
        let r = ConverterRegistry::with_defaults();
        let config = GlobalConfiguration::default();
        let ctx = ConvertContext::new(&config, false);
        let d = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let cell = r
            .convert_value(&Value::Date(d), Some(TargetType::Date), None, None, &ctx)
            .unwrap();
        assert!(matches!(cell.value, CellValue::Date(_)));
        assert_eq!(
            cell.style.and_then(|s| s.number_format).as_deref(),
            Some("yyyy-mm-dd")
        );

        let text = r
            .convert_value(
                &Value::Date(d),
                Some(TargetType::Date),
                Some(CellKind::String),
                None,
                &ctx,
            )
            .unwrap();
        assert_eq!(text.value, CellValue::String("2024-01-01".into()));
    }
}
