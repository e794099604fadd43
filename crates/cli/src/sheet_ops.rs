//! `sheets`, `dump` and `convert`: drivers over the streaming reader and writer.
//!
//! Rows are read in map mode. Nothing holds a whole sheet: `dump` prints each
//! row as it arrives and `convert` forwards rows to the writer in batches.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use serde_json::{json, Map, Value as JsonValue};
use sheetstream_config::Settings;
use sheetstream_engine::config::ReadDefaultReturn;
use sheetstream_engine::error::BoxError;
use sheetstream_engine::read::{ReadContext, ReadListener, ReadSheet};
use sheetstream_engine::record::RowMap;
use sheetstream_engine::write::{WriteBasic, WriteSheet};
use sheetstream_io::csv::CsvOptions;
use sheetstream_io::{ExcelFormat, ExcelReader, ExcelWriter, ReadOptions, WriteOptions};

use crate::CliError;

const CONVERT_BATCH: usize = 1000;

/// A sheet named on the command line: all digits is an index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SheetSelector {
    Index(usize),
    Name(String),
}

impl SheetSelector {
    pub fn parse(s: &str) -> Self {
        match s.parse::<usize>() {
            Ok(index) => SheetSelector::Index(index),
            Err(_) => SheetSelector::Name(s.to_string()),
        }
    }

    fn read_sheet(&self) -> ReadSheet {
        match self {
            SheetSelector::Index(i) => ReadSheet::index(*i),
            SheetSelector::Name(n) => ReadSheet::named(n.clone()),
        }
    }
}

fn csv_options(settings: &Settings) -> Result<CsvOptions, CliError> {
    Ok(CsvOptions {
        delimiter: settings.csv_delimiter()?,
        bom: settings.csv.bom,
    })
}

fn read_options(settings: &Settings) -> Result<ReadOptions, CliError> {
    Ok(ReadOptions {
        format: None,
        csv: csv_options(settings)?,
        workbook: settings.read_workbook(),
    })
}

pub fn cmd_sheets(file: &Path, json: bool, settings: &Settings, out: &mut dyn Write) -> Result<(), CliError> {
    let mut reader = ExcelReader::open(file, read_options(settings)?)?;
    if json {
        let entries: Vec<JsonValue> = reader
            .sheet_list()
            .iter()
            .map(|s| json!({ "index": s.index, "name": s.name, "visibility": s.visibility() }))
            .collect();
        serde_json::to_writer_pretty(&mut *out, &entries).map_err(|e| CliError::io(e.to_string()))?;
        writeln!(out)?;
    } else {
        for sheet in reader.sheet_list() {
            writeln!(out, "{}\t{}\t{}", sheet.index, sheet.name, sheet.visibility())?;
        }
    }
    reader.finish()?;
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct DumpOptions {
    pub sheet: Option<SheetSelector>,
    pub head_rows: Option<usize>,
    pub limit: Option<usize>,
    pub json: bool,
}

enum DumpOut<'w> {
    Csv(csv::Writer<&'w mut dyn Write>),
    Json(&'w mut dyn Write),
}

/// Prints rows as they are analysed.
struct DumpListener<'w> {
    out: DumpOut<'w>,
    labels: BTreeMap<usize, String>,
    limit: Option<usize>,
    written: usize,
}

impl DumpListener<'_> {
    fn write_fields(&mut self, fields: Vec<String>) -> Result<(), BoxError> {
        if let DumpOut::Csv(w) = &mut self.out {
            w.write_record(&fields)?;
        }
        Ok(())
    }

    fn finish(self) -> Result<(), CliError> {
        if let DumpOut::Csv(mut w) = self.out {
            w.flush()?;
        }
        Ok(())
    }
}

fn dense(row: &BTreeMap<usize, String>) -> Vec<String> {
    let width = row.keys().next_back().map_or(0, |c| c + 1);
    (0..width)
        .map(|c| row.get(&c).cloned().unwrap_or_default())
        .collect()
}

impl ReadListener<RowMap> for DumpListener<'_> {
    fn invoke_head(&mut self, head: &BTreeMap<usize, String>, _ctx: &ReadContext) -> Result<(), BoxError> {
        // The last header row names the columns
        for (column, label) in head {
            if !label.is_empty() {
                self.labels.insert(*column, label.clone());
            }
        }
        self.write_fields(dense(head))
    }

    fn invoke(&mut self, data: &RowMap, ctx: &ReadContext) -> Result<(), BoxError> {
        match &mut self.out {
            DumpOut::Csv(w) => {
                let row: BTreeMap<usize, String> = data.0.iter().map(|(c, v)| (*c, v.to_string())).collect();
                w.write_record(dense(&row))?;
            }
            DumpOut::Json(w) => {
                let mut cells = Map::new();
                for (column, value) in &data.0 {
                    let key = self
                        .labels
                        .get(column)
                        .cloned()
                        .unwrap_or_else(|| column.to_string());
                    cells.insert(key, serde_json::to_value(value)?);
                }
                let line = json!({
                    "row": ctx.row().map(|r| r.row_index),
                    "cells": cells,
                });
                serde_json::to_writer(&mut **w, &line)?;
                writeln!(w)?;
            }
        }
        self.written += 1;
        Ok(())
    }

    fn has_next(&self, _ctx: &ReadContext) -> bool {
        self.limit.map_or(true, |limit| self.written < limit)
    }
}

pub fn cmd_dump(file: &Path, options: &DumpOptions, settings: &Settings, out: &mut dyn Write) -> Result<(), CliError> {
    let mut reader = ExcelReader::open(file, read_options(settings)?)?;

    let mut request = options
        .sheet
        .as_ref()
        .map_or_else(ReadSheet::default, SheetSelector::read_sheet);
    if let Some(rows) = options.head_rows {
        request = request.head_row_number(rows);
    }

    let mut listener = DumpListener {
        out: if options.json {
            DumpOut::Json(out)
        } else {
            DumpOut::Csv(csv::WriterBuilder::new().flexible(true).from_writer(out))
        },
        labels: BTreeMap::new(),
        limit: options.limit,
        written: 0,
    };
    if options.limit != Some(0) {
        reader.read_sheet(request, &mut [&mut listener])?;
    }
    reader.finish()?;
    listener.finish()?;
    Ok(())
}

/// Forwards analysed rows to the writer, one output sheet per input sheet.
struct ConvertListener<'a> {
    writer: &'a mut ExcelWriter,
    head_rows: Vec<BTreeMap<usize, String>>,
    batch: Vec<RowMap>,
    sheet_written: bool,
    rows: usize,
}

impl ConvertListener<'_> {
    fn flush(&mut self, ctx: &ReadContext) -> Result<(), BoxError> {
        let name = ctx
            .sheet()
            .map(|s| s.sheet_name.clone())
            .unwrap_or_else(|| "Sheet1".to_string());
        let basic = if self.head_rows.is_empty() {
            WriteBasic::default().need_head(false)
        } else {
            let width = self
                .head_rows
                .iter()
                .filter_map(|r| r.keys().next_back())
                .max()
                .map_or(0, |c| c + 1);
            let columns = (0..width)
                .map(|c| {
                    self.head_rows
                        .iter()
                        .map(|r| r.get(&c).cloned().unwrap_or_default())
                        .collect()
                })
                .collect();
            WriteBasic::default().head(columns)
        };
        let sheet = WriteSheet::named(name).with(basic);
        self.writer.write(&sheet, None, &self.batch)?;
        self.rows += self.batch.len();
        self.batch.clear();
        self.sheet_written = true;
        Ok(())
    }
}

impl ReadListener<RowMap> for ConvertListener<'_> {
    fn invoke_head(&mut self, head: &BTreeMap<usize, String>, _ctx: &ReadContext) -> Result<(), BoxError> {
        self.head_rows.push(head.clone());
        Ok(())
    }

    fn invoke(&mut self, data: &RowMap, ctx: &ReadContext) -> Result<(), BoxError> {
        self.batch.push(data.clone());
        if self.batch.len() >= CONVERT_BATCH {
            self.flush(ctx)?;
        }
        Ok(())
    }

    fn after_all_analysed(&mut self, ctx: &ReadContext) -> Result<(), BoxError> {
        if !self.batch.is_empty() || !self.sheet_written {
            self.flush(ctx)?;
        }
        self.head_rows.clear();
        self.sheet_written = false;
        Ok(())
    }
}

/// Returns the number of data rows written.
pub fn cmd_convert(
    input: &Path,
    output: &Path,
    sheet: Option<&SheetSelector>,
    settings: &Settings,
) -> Result<usize, CliError> {
    let mut read = read_options(settings)?;
    read.workbook.read_default_return = ReadDefaultReturn::ActualData;
    let mut reader = ExcelReader::open(input, read)?;

    let write = WriteOptions {
        format: None,
        csv: csv_options(settings)?,
        workbook: settings.write_workbook(),
    };
    let mut writer = ExcelWriter::create(output, write)?;
    let to_csv = writer.format() == ExcelFormat::Csv;

    let mut listener = ConvertListener {
        writer: &mut writer,
        head_rows: Vec::new(),
        batch: Vec::new(),
        sheet_written: false,
        rows: 0,
    };
    match sheet {
        Some(selector) => reader.read_sheet(selector.read_sheet(), &mut [&mut listener])?,
        // Text output holds a single sheet
        None if to_csv => reader.read_sheet(ReadSheet::index(0), &mut [&mut listener])?,
        None => reader.read_all(&mut [&mut listener])?,
    }
    let rows = listener.rows;
    reader.finish()?;
    writer.finish()?;
    tracing::debug!(rows, output = %output.display(), "converted");
    Ok(rows)
}
