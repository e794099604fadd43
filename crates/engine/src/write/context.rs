//! Write-side holders: Workbook → Sheet → Table.
//!
//! Sheet and table holders are created on first selection and reused after.
//! A table shares its sheet's row cursor. Teardown always runs every release
//! step and reports the first failure.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, PoisonError};

use crate::config::{CacheLocation, GlobalConfiguration};
use crate::convert::ConverterRegistry;
use crate::error::{ExcelError, ReleaseGuard, Result};
use crate::head::HeadProperty;
use crate::record::{FieldCache, FieldLayout, FieldSpec, Record, SharedFieldCache};
use crate::write::builtin::{DefaultStyle, LoopMergeStrategy};
use crate::write::handler::{
    HandlerChain, HandlerRegistry, HandlerScope, SheetHookContext, WorkbookHookContext, WriteHandler,
};
use crate::write::sink::{SheetHandle, SheetSink, SinkOutput};
use crate::write::{EncryptionStep, WriteBasic, WriteParams, WriteSheet, WriteTable, WriteWorkbook};

pub struct WriteSheetHolder {
    pub sheet_no: usize,
    pub sheet_name: String,
    pub handle: SheetHandle,
    pub config: GlobalConfiguration,
    pub params: WriteParams,
    pub converters: ConverterRegistry,
    pub head: HeadProperty,
    /// Last physical row written, if any
    pub(crate) last_row: Option<usize>,
    /// True during the first `write` call that created the sheet
    pub(crate) is_new: bool,
    pub(crate) tables: BTreeMap<usize, WriteTableHolder>,
}

impl WriteSheetHolder {
    pub fn last_row(&self) -> Option<usize> {
        self.last_row
    }

    pub fn table(&self, table_no: usize) -> Option<&WriteTableHolder> {
        self.tables.get(&table_no)
    }
}

pub struct WriteTableHolder {
    pub table_no: usize,
    pub config: GlobalConfiguration,
    pub params: WriteParams,
    pub converters: ConverterRegistry,
    pub head: HeadProperty,
}

/// Resolved state of the current write position.
pub(crate) struct Target {
    pub handle: SheetHandle,
    pub sheet_no: usize,
    pub table_no: Option<usize>,
    pub config: GlobalConfiguration,
    pub params: WriteParams,
    pub converters: ConverterRegistry,
    pub head: HeadProperty,
}

pub struct WriteContext {
    pub(crate) sink: Box<dyn SheetSink>,
    pub(crate) config: GlobalConfiguration,
    params: WriteParams,
    converters: ConverterRegistry,
    pub(crate) handlers: HandlerRegistry,
    pub(crate) sheets: BTreeMap<usize, WriteSheetHolder>,
    pub(crate) current_sheet: Option<usize>,
    pub(crate) current_table: Option<usize>,
    /// Handlers active at the current position
    pub(crate) chain: HandlerChain,
    write_excel_on_exception: bool,
    password: Option<String>,
    encryption: Option<Box<dyn EncryptionStep>>,
    field_cache: FieldCache,
    shared_field_cache: Option<SharedFieldCache>,
    pub(crate) failed: bool,
    finished: bool,
}

impl WriteContext {
    /// Set up the workbook holder and run the workbook creation hooks.
    pub fn new(sink: Box<dyn SheetSink>, options: WriteWorkbook) -> Result<Self> {
        if options.password.is_some() && options.encryption.is_none() {
            return Err(ExcelError::config("a password needs an encryption step"));
        }
        let config = options.global.overlay(&options.basic.config);
        let params = WriteParams::default().overlay(&options.basic);
        let converters = ConverterRegistry::with_defaults().extended(&options.basic.converters);

        let mut handlers = HandlerRegistry::new();
        if params.use_default_style {
            handlers.register(HandlerScope::Workbook, Arc::new(DefaultStyle::new()));
        }
        for handler in &options.basic.handlers {
            handlers.register(HandlerScope::Workbook, handler.clone());
        }

        let mut ctx = WriteContext {
            sink,
            config,
            params,
            converters,
            chain: handlers.chain(None, None),
            handlers,
            sheets: BTreeMap::new(),
            current_sheet: None,
            current_table: None,
            write_excel_on_exception: options.write_excel_on_exception,
            password: options.password,
            encryption: options.encryption,
            field_cache: FieldCache::new(),
            shared_field_cache: options.shared_field_cache,
            failed: false,
            finished: false,
        };

        let chain = ctx.chain.clone();
        ctx.workbook_hooks(&chain, false)?;
        tracing::debug!(
            format = ctx.sink.format(),
            handlers = ctx.handlers.len(),
            "write context initialised"
        );
        Ok(ctx)
    }

    pub fn sink(&self) -> &dyn SheetSink {
        self.sink.as_ref()
    }

    pub fn config(&self) -> &GlobalConfiguration {
        &self.config
    }

    pub fn sheet(&self, sheet_no: usize) -> Option<&WriteSheetHolder> {
        self.sheets.get(&sheet_no)
    }

    pub fn current_sheet(&self) -> Option<&WriteSheetHolder> {
        self.current_sheet.and_then(|s| self.sheets.get(&s))
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn fields_of<T: Record>(&mut self) -> Vec<FieldSpec> {
        match self.config.field_cache_location {
            CacheLocation::None => T::fields(),
            CacheLocation::Memory if self.shared_field_cache.is_some() => self
                .shared_field_cache
                .as_ref()
                .map(|shared| {
                    let mut cache = shared.lock().unwrap_or_else(PoisonError::into_inner);
                    cache.fields_of::<T>().as_ref().clone()
                })
                .unwrap_or_else(T::fields),
            _ => self.field_cache.fields_of::<T>().as_ref().clone(),
        }
    }

    /// Typed records lay out their fields; untyped rows use the literal head.
    fn build_head<T: Record>(&mut self, params: &WriteParams) -> Result<HeadProperty> {
        let fields = self.fields_of::<T>();
        if !fields.is_empty() {
            let layout = FieldLayout::build_filtered(&fields, &params.filter)?;
            return Ok(HeadProperty::from_layout(&layout));
        }
        Ok(match &params.head {
            Some(grid) => HeadProperty::from_literal(grid),
            None => HeadProperty::none(),
        })
    }

    fn register_level(&mut self, scope: HandlerScope, basic: &WriteBasic, head: &HeadProperty) -> Result<()> {
        for handler in &basic.handlers {
            self.handlers.register(scope, handler.clone());
        }
        for head in head.heads.values() {
            if let Some(lm) = head.field.as_ref().and_then(|f| f.loop_merge) {
                self.handlers.register(
                    scope,
                    Arc::new(LoopMergeStrategy::new(lm.each_row, lm.column_extend, head.column_index)?),
                );
            }
        }
        Ok(())
    }

    fn resolve_sheet_no(&self, req: &WriteSheet) -> usize {
        if let Some(no) = req.sheet_no {
            return no;
        }
        match &req.sheet_name {
            Some(name) => self
                .sheets
                .values()
                .find(|s| &s.sheet_name == name)
                .map(|s| s.sheet_no)
                .unwrap_or_else(|| self.sheets.keys().next_back().map_or(0, |k| k + 1)),
            None => 0,
        }
    }

    /// Select or create a sheet. A new sheet replays the workbook hooks for
    /// its own handlers, runs the sheet creation hooks and, unless a table
    /// will supply the head, writes its head. Returns whether it was new.
    pub(crate) fn select_sheet<T: Record>(&mut self, req: &WriteSheet, init_head: bool) -> Result<bool> {
        let sheet_no = self.resolve_sheet_no(req);
        self.current_table = None;

        if let Some(holder) = self.sheets.get_mut(&sheet_no) {
            holder.is_new = false;
            self.current_sheet = Some(sheet_no);
            self.chain = self.handlers.chain(Some(sheet_no), None);
            return Ok(false);
        }

        let sheet_name = req
            .sheet_name
            .clone()
            .unwrap_or_else(|| sheet_no.to_string());
        let config = self.config.overlay(&req.basic.config);
        let params = self.params.overlay(&req.basic);
        let converters = self.converters.extended(&req.basic.converters);
        let head = self.build_head::<T>(&params)?;
        self.register_level(HandlerScope::Sheet(sheet_no), &req.basic, &head)?;

        let own = self.handlers.own(HandlerScope::Sheet(sheet_no));
        self.workbook_hooks(&own, true)?;

        let chain = self.handlers.chain(Some(sheet_no), None);
        self.sheet_hooks(&chain, None, sheet_no, &sheet_name, None, &head, false, SheetStage::Before)?;
        let handle = self.sink.create_sheet(sheet_no, &sheet_name)?;
        self.sheet_hooks(&chain, Some(handle), sheet_no, &sheet_name, None, &head, false, SheetStage::After)?;
        tracing::debug!(sheet_no, sheet_name = %sheet_name, "sheet created");

        self.sheets.insert(
            sheet_no,
            WriteSheetHolder {
                sheet_no,
                sheet_name,
                handle,
                config,
                params,
                converters,
                head,
                last_row: None,
                is_new: true,
                tables: BTreeMap::new(),
            },
        );
        self.current_sheet = Some(sheet_no);
        self.chain = chain;

        if init_head {
            let target = self.target()?;
            self.init_head(&target)?;
        }
        Ok(true)
    }

    /// Select or create a table inside the current sheet. A new table
    /// replays workbook and sheet hooks for its own handlers, then writes
    /// its head at the sheet's next row.
    pub(crate) fn select_table<T: Record>(&mut self, req: &WriteTable) -> Result<()> {
        let sheet_no = self
            .current_sheet
            .ok_or_else(|| ExcelError::config("select a sheet before a table"))?;
        let table_no = req.table_no;
        let exists = self
            .sheets
            .get(&sheet_no)
            .is_some_and(|s| s.tables.contains_key(&table_no));

        self.current_table = Some(table_no);
        if exists {
            self.chain = self.handlers.chain(Some(sheet_no), Some(table_no));
            return Ok(());
        }

        let (config, params, converters, handle, sheet_name) = {
            let sheet = self
                .sheets
                .get(&sheet_no)
                .ok_or_else(|| ExcelError::config("current sheet holder missing"))?;
            (
                sheet.config.overlay(&req.basic.config),
                sheet.params.overlay(&req.basic),
                sheet.converters.extended(&req.basic.converters),
                sheet.handle,
                sheet.sheet_name.clone(),
            )
        };
        let head = self.build_head::<T>(&params)?;
        let scope = HandlerScope::Table(sheet_no, table_no);
        self.register_level(scope, &req.basic, &head)?;

        let own = self.handlers.own(scope);
        self.workbook_hooks(&own, true)?;
        self.sheet_hooks(&own, Some(handle), sheet_no, &sheet_name, Some(table_no), &head, true, SheetStage::Before)?;
        self.sheet_hooks(&own, Some(handle), sheet_no, &sheet_name, Some(table_no), &head, true, SheetStage::After)?;

        if let Some(sheet) = self.sheets.get_mut(&sheet_no) {
            sheet.tables.insert(
                table_no,
                WriteTableHolder {
                    table_no,
                    config,
                    params,
                    converters,
                    head,
                },
            );
        }
        self.chain = self.handlers.chain(Some(sheet_no), Some(table_no));
        tracing::debug!(sheet_no, table_no, "table created");

        let target = self.target()?;
        self.init_head(&target)
    }

    /// Snapshot of the most specific holder at the current position.
    pub(crate) fn target(&self) -> Result<Target> {
        let sheet = self
            .current_sheet()
            .ok_or_else(|| ExcelError::config("no sheet selected"))?;
        let table = self.current_table.and_then(|t| sheet.tables.get(&t));
        Ok(match table {
            Some(table) => Target {
                handle: sheet.handle,
                sheet_no: sheet.sheet_no,
                table_no: Some(table.table_no),
                config: table.config.clone(),
                params: table.params.clone(),
                converters: table.converters.clone(),
                head: table.head.clone(),
            },
            None => Target {
                handle: sheet.handle,
                sheet_no: sheet.sheet_no,
                table_no: None,
                config: sheet.config.clone(),
                params: sheet.params.clone(),
                converters: sheet.converters.clone(),
                head: sheet.head.clone(),
            },
        })
    }

    fn workbook_hooks(&mut self, chain: &[Arc<dyn WriteHandler>], supplementary: bool) -> Result<()> {
        for handler in chain {
            handler.before_workbook_create(&mut WorkbookHookContext {
                sink: self.sink.as_mut(),
                config: &self.config,
                supplementary,
            })?;
        }
        for handler in chain {
            handler.after_workbook_create(&mut WorkbookHookContext {
                sink: self.sink.as_mut(),
                config: &self.config,
                supplementary,
            })?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn sheet_hooks(
        &mut self,
        chain: &[Arc<dyn WriteHandler>],
        sheet: Option<SheetHandle>,
        sheet_no: usize,
        sheet_name: &str,
        table_no: Option<usize>,
        head: &HeadProperty,
        supplementary: bool,
        stage: SheetStage,
    ) -> Result<()> {
        for handler in chain {
            let mut ctx = SheetHookContext {
                sink: self.sink.as_mut(),
                sheet,
                sheet_no,
                sheet_name,
                table_no,
                head,
                supplementary,
            };
            match stage {
                SheetStage::Before => handler.before_sheet_create(&mut ctx)?,
                SheetStage::After => handler.after_sheet_create(&mut ctx)?,
                SheetStage::Dispose => handler.after_sheet_dispose(&mut ctx)?,
            }
        }
        Ok(())
    }

    /// Run `after_sheet_dispose` for the current position and close the
    /// sheet's first write.
    pub(crate) fn dispose_sheet(&mut self) -> Result<()> {
        let target = self.target()?;
        let name = self
            .current_sheet()
            .map(|s| s.sheet_name.clone())
            .unwrap_or_default();
        let chain = self.chain.clone();
        self.sheet_hooks(
            &chain,
            Some(target.handle),
            target.sheet_no,
            &name,
            target.table_no,
            &target.head,
            false,
            SheetStage::Dispose,
        )?;
        if let Some(sheet) = self.sheets.get_mut(&target.sheet_no) {
            sheet.is_new = false;
        }
        Ok(())
    }

    /// Produce the output. With `on_exception` (or after a failed write) the
    /// output is discarded unless `write_excel_on_exception` is set. Every
    /// release step runs; the first failure is returned. Calling again
    /// returns `Ok(None)`.
    pub fn finish(&mut self, on_exception: bool) -> Result<Option<SinkOutput>> {
        if self.finished {
            return Ok(None);
        }
        self.finished = true;
        let failed = on_exception || self.failed;
        let keep = !failed || self.write_excel_on_exception;
        let mut guard = ReleaseGuard::new();
        let mut output = None;

        if !failed {
            let chain = self.handlers.chain(None, None);
            let sink = self.sink.as_mut();
            let config = &self.config;
            guard.attempt("workbook dispose hooks", || {
                for handler in &chain {
                    handler.after_workbook_dispose(&mut WorkbookHookContext {
                        sink: &mut *sink,
                        config,
                        supplementary: false,
                    })?;
                }
                Ok(())
            });
        }

        if keep {
            let sink = self.sink.as_mut();
            let password = self.password.as_deref();
            let step = self.encryption.as_deref();
            let slot = &mut output;
            guard.attempt("sink finish", || {
                let produced = sink.finish()?;
                *slot = Some(encrypt_output(produced, password, step)?);
                Ok(())
            });
        } else {
            tracing::warn!("write failed, output discarded");
            let sink = self.sink.as_mut();
            guard.attempt("sink discard", || sink.discard());
        }

        guard.attempt("field cache", || {
            self.field_cache.clear();
            Ok(())
        });
        self.chain.clear();
        guard.finish()?;
        Ok(output)
    }
}

impl Drop for WriteContext {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let failed = self.failed;
        if let Err(e) = self.finish(failed) {
            tracing::warn!(error = %e, "write teardown failed");
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum SheetStage {
    Before,
    After,
    Dispose,
}

fn encrypt_output(
    output: SinkOutput,
    password: Option<&str>,
    step: Option<&dyn EncryptionStep>,
) -> Result<SinkOutput> {
    let (Some(password), Some(step)) = (password, step) else {
        return Ok(output);
    };
    let encrypt = |plain: Vec<u8>| step.encrypt(plain, password).map_err(std::io::Error::other);
    match output {
        SinkOutput::Bytes(bytes) => Ok(SinkOutput::Bytes(encrypt(bytes)?)),
        SinkOutput::File(path) => {
            let plain = std::fs::read(&path)?;
            std::fs::write(&path, encrypt(plain)?)?;
            Ok(SinkOutput::File(path))
        }
        SinkOutput::Memory(_) => Err(ExcelError::config("in-memory output cannot be encrypted")),
    }
}

/// Field names a record type declares, ignored ones included.
pub(crate) fn declared_fields<T: Record>() -> HashSet<&'static str> {
    T::fields().iter().map(|f| f.name).collect()
}
