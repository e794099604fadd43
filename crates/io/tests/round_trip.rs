// Write with ExcelWriter, read back with ExcelReader

use std::collections::BTreeMap;

use chrono::NaiveDate;
use pretty_assertions::assert_eq;
use sheetstream_engine::error::BoxError;
use sheetstream_engine::events::{CellExtra, ExtraKind, ExtraSet};
use sheetstream_engine::read::{CollectingListener, ReadContext, ReadListener, ReadSheet, ReadWorkbook};
use sheetstream_engine::record::{FieldSpec, Record, RowMap, RowValues, TargetType, Value};
use sheetstream_engine::write::{SinkOutput, WriteBasic, WriteSheet};
use sheetstream_engine::{CellKind, CellRange};
use sheetstream_io::writer::write_sync;
use sheetstream_io::{read_sync, ExcelFormat, ExcelReader, ExcelWriter, ReadOptions, WriteOptions};

#[derive(Debug, Clone, PartialEq)]
struct Employee {
    name: String,
    age: i32,
    salary: f64,
    hired: NaiveDate,
}

impl Record for Employee {
    fn fields() -> Vec<FieldSpec> {
        vec![
            FieldSpec::new("name", TargetType::String).label("Name"),
            FieldSpec::new("age", TargetType::I32).label("Age"),
            FieldSpec::new("salary", TargetType::F64).label("Salary"),
            FieldSpec::new("hired", TargetType::Date).label("Hired"),
        ]
    }

    fn from_values(mut values: RowValues) -> Result<Self, BoxError> {
        Ok(Employee {
            name: values.take("name")?,
            age: values.take("age")?,
            salary: values.take("salary")?,
            hired: values.take("hired")?,
        })
    }

    fn to_values(&self) -> RowValues {
        RowValues::new()
            .with("name", self.name.clone())
            .with("age", self.age)
            .with("salary", self.salary)
            .with("hired", self.hired)
    }
}

fn staff() -> Vec<Employee> {
    vec![
        Employee {
            name: "Ada".into(),
            age: 36,
            salary: 5200.5,
            hired: NaiveDate::from_ymd_opt(2021, 3, 1).unwrap(),
        },
        Employee {
            name: "Linus".into(),
            age: 29,
            salary: 4100.0,
            hired: NaiveDate::from_ymd_opt(2024, 2, 29).unwrap(),
        },
    ]
}

#[test]
fn test_xlsx_typed_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("staff.xlsx");
    write_sync(&path, &WriteSheet::named("Staff"), &staff(), WriteOptions::default()).unwrap();

    let rows: Vec<Employee> = read_sync(&path, ReadOptions::default()).unwrap();
    assert_eq!(rows, staff());
}

#[test]
fn test_csv_typed_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("staff.csv");
    write_sync(&path, &WriteSheet::index(0), &staff(), WriteOptions::default()).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.starts_with("Name,Age,Salary,Hired\n"));

    let rows: Vec<Employee> = read_sync(&path, ReadOptions::default()).unwrap();
    assert_eq!(rows, staff());
}

#[test]
fn test_reader_picks_sheet_by_name() {
    let mut writer = ExcelWriter::in_memory(WriteOptions::default()).unwrap();
    writer.write(&WriteSheet::named("First"), None, &staff()[..1]).unwrap();
    writer.write(&WriteSheet::named("Second"), None, &staff()[1..]).unwrap();
    let Some(SinkOutput::Bytes(bytes)) = writer.finish().unwrap() else {
        panic!("expected in-memory xlsx");
    };

    let mut reader = ExcelReader::from_bytes(bytes, ReadOptions::default()).unwrap();
    assert_eq!(reader.format(), ExcelFormat::Xlsx);
    let names: Vec<_> = reader.sheet_list().iter().map(|s| s.name.clone()).collect();
    assert_eq!(names, vec!["First", "Second"]);

    let mut collect = CollectingListener::<Employee>::new();
    reader
        .read_sheet(ReadSheet::named("Second"), &mut [&mut collect])
        .unwrap();
    reader.finish().unwrap();
    assert_eq!(collect.rows(), &staff()[1..]);
}

#[derive(Default)]
struct Extras(Vec<CellExtra>);

impl ReadListener<RowMap> for Extras {
    fn invoke(&mut self, _data: &RowMap, _ctx: &ReadContext) -> Result<(), BoxError> {
        Ok(())
    }

    fn extra(&mut self, extra: &CellExtra, _ctx: &ReadContext) -> Result<(), BoxError> {
        self.0.push(extra.clone());
        Ok(())
    }
}

#[test]
fn test_merged_head_reported_as_extra() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("merged.xlsx");
    let head = vec![
        vec!["Person".to_string(), "Name".to_string()],
        vec!["Person".to_string(), "Age".to_string()],
    ];
    let sheet = WriteSheet::named("People").with(WriteBasic::default().head(head));
    let row = RowMap(BTreeMap::from([(0, Value::from("Ada")), (1, Value::from(36))]));
    write_sync(&path, &sheet, &[row], WriteOptions::default()).unwrap();

    let mut reader = ExcelReader::open(
        &path,
        ReadOptions {
            workbook: ReadWorkbook {
                extra_read: ExtraSet::none().with(ExtraKind::Merge),
                head_row_number: Some(2),
                ..Default::default()
            },
            ..Default::default()
        },
    )
    .unwrap();
    let mut extras = Extras::default();
    reader.read_all(&mut [&mut extras]).unwrap();
    reader.finish().unwrap();

    assert_eq!(extras.0.len(), 1);
    assert_eq!(extras.0[0].kind, ExtraKind::Merge);
    assert_eq!(extras.0[0].range, CellRange::new(0, 0, 0, 1));
}

#[test]
fn test_untyped_read_of_csv_with_semicolons() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.txt");
    std::fs::write(&path, "k;v\none;1\ntwo;\n").unwrap();

    let rows: Vec<RowMap> = read_sync(&path, ReadOptions::default()).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get(1), Some(&Value::String("1".into())));
    assert!(matches!(rows[1].get(1), None | Some(Value::Null)));
}

#[derive(Debug, Clone, PartialEq)]
struct Stamp {
    day: NaiveDate,
}

impl Record for Stamp {
    fn fields() -> Vec<FieldSpec> {
        vec![FieldSpec::new("day", TargetType::Date)
            .label("Day")
            .write_as(CellKind::Number)]
    }

    fn from_values(mut values: RowValues) -> Result<Self, BoxError> {
        Ok(Stamp { day: values.take("day")? })
    }

    fn to_values(&self) -> RowValues {
        RowValues::new().with("day", self.day)
    }
}

#[test]
fn test_xlsx_serial_dates_ignore_1904_windowing() {
    let stamps = vec![Stamp {
        day: NaiveDate::from_ymd_opt(2021, 3, 1).unwrap(),
    }];
    let mut options = WriteOptions::default();
    options.workbook.basic.config.use_1904_windowing = Some(true);
    let mut writer = ExcelWriter::in_memory(options).unwrap();
    writer.write(&WriteSheet::index(0), None, &stamps).unwrap();
    let Some(SinkOutput::Bytes(bytes)) = writer.finish().unwrap() else {
        panic!("expected in-memory xlsx");
    };

    // The package declares 1900 dates, so the serial must count from 1900
    let mut reader = ExcelReader::from_bytes(bytes, ReadOptions::default()).unwrap();
    let mut collect = CollectingListener::<Stamp>::new();
    reader.read_all(&mut [&mut collect]).unwrap();
    reader.finish().unwrap();
    assert_eq!(collect.rows(), &stamps[..]);
}
