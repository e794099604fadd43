// sheetstream CLI - list, dump and convert spreadsheets without loading them whole

mod exit_codes;
mod sheet_ops;

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use sheetstream_config::{Settings, SettingsError};
use sheetstream_engine::ExcelError;

use exit_codes::{excel_exit_code, EXIT_ERROR, EXIT_IO, EXIT_SUCCESS, EXIT_USAGE};
use sheet_ops::{DumpOptions, SheetSelector};

#[derive(Parser)]
#[command(name = "sheetstream")]
#[command(about = "Streaming reader and writer for xlsx, xls and csv files")]
#[command(long_version = long_version())]
#[command(version)]
struct Cli {
    /// Settings file (defaults to the user config directory)
    #[arg(long, global = true, env = "SHEETSTREAM_SETTINGS")]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the sheets of a workbook
    #[command(after_help = "\
Examples:
  sheetstream sheets report.xlsx
  sheetstream sheets legacy.xls --json")]
    Sheets {
        file: PathBuf,

        /// Print a JSON array instead of tab-separated lines
        #[arg(long)]
        json: bool,
    },

    /// Print the rows of one sheet as CSV or JSON lines
    #[command(after_help = "\
Examples:
  sheetstream dump report.xlsx --sheet Summary --limit 20
  sheetstream dump report.xlsx --sheet 2 --head-rows 2 --json")]
    Dump {
        file: PathBuf,

        /// Sheet index (0-based) or name; the first sheet by default
        #[arg(long)]
        sheet: Option<String>,

        /// Number of header rows above the data
        #[arg(long)]
        head_rows: Option<usize>,

        /// Stop after this many data rows
        #[arg(long)]
        limit: Option<usize>,

        /// One JSON object per row, keyed by header label
        #[arg(long)]
        json: bool,
    },

    /// Convert between formats; the output extension picks the format
    #[command(after_help = "\
Examples:
  sheetstream convert data.csv data.xlsx
  sheetstream convert legacy.xls summary.csv --sheet Summary")]
    Convert {
        input: PathBuf,
        output: PathBuf,

        /// Only this sheet (index or name); csv output takes the first sheet otherwise
        #[arg(long)]
        sheet: Option<String>,

        /// Suppress the row count on stderr
        #[arg(long, short = 'q')]
        quiet: bool,
    },
}

fn long_version() -> &'static str {
    concat!(
        env!("CARGO_PKG_VERSION"),
        " (",
        env!("GIT_COMMIT_HASH"),
        ", ",
        env!("SHEETSTREAM_BUILD_PROFILE"),
        ")",
        "\nengine:  sheetstream-engine ",
        env!("CARGO_PKG_VERSION"),
    )
}

#[derive(Debug)]
pub struct CliError {
    pub code: u8,
    pub message: String,
    pub hint: Option<String>,
}

impl CliError {
    pub fn args(msg: impl Into<String>) -> Self {
        Self {
            code: EXIT_USAGE,
            message: msg.into(),
            hint: None,
        }
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self {
            code: EXIT_IO,
            message: msg.into(),
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl From<ExcelError> for CliError {
    fn from(err: ExcelError) -> Self {
        let hint = match &err {
            ExcelError::Config(msg) if msg.contains("no sheet") => {
                Some("run `sheetstream sheets <file>` to list sheet names".to_string())
            }
            ExcelError::Adapter { .. } => Some("the file may be damaged or not a spreadsheet".to_string()),
            _ => None,
        };
        CliError {
            code: excel_exit_code(&err),
            message: err.to_string(),
            hint,
        }
    }
}

impl From<SettingsError> for CliError {
    fn from(err: SettingsError) -> Self {
        CliError::args(err.to_string()).with_hint("check the settings file or pass --settings")
    }
}

impl From<io::Error> for CliError {
    fn from(err: io::Error) -> Self {
        // Downstream pipe closed (e.g. `| head`)
        if err.kind() == io::ErrorKind::BrokenPipe {
            return CliError {
                code: EXIT_SUCCESS,
                message: String::new(),
                hint: None,
            };
        }
        CliError::io(err.to_string())
    }
}

impl From<csv::Error> for CliError {
    fn from(err: csv::Error) -> Self {
        match err.into_kind() {
            csv::ErrorKind::Io(io) => io.into(),
            other => CliError {
                code: EXIT_ERROR,
                message: format!("{:?}", other),
                hint: None,
            },
        }
    }
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("SHEETSTREAM_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn load_settings(path: Option<&Path>) -> Result<Settings, CliError> {
    match path {
        Some(path) => Ok(Settings::load_from(path)?),
        None => Ok(Settings::load()),
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let settings = load_settings(cli.settings.as_deref())?;
    let stdout = io::stdout();
    let mut out = stdout.lock();

    match cli.command {
        Commands::Sheets { file, json } => sheet_ops::cmd_sheets(&file, json, &settings, &mut out)?,
        Commands::Dump {
            file,
            sheet,
            head_rows,
            limit,
            json,
        } => {
            let options = DumpOptions {
                sheet: sheet.as_deref().map(SheetSelector::parse),
                head_rows,
                limit,
                json,
            };
            sheet_ops::cmd_dump(&file, &options, &settings, &mut out)?;
        }
        Commands::Convert {
            input,
            output,
            sheet,
            quiet,
        } => {
            if input == output {
                return Err(CliError::args("input and output are the same file"));
            }
            let selector = sheet.as_deref().map(SheetSelector::parse);
            let rows = sheet_ops::cmd_convert(&input, &output, selector.as_ref(), &settings)?;
            if !quiet {
                eprintln!("wrote {} row(s) to {}", rows, output.display());
            }
        }
    }
    out.flush()?;
    Ok(())
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(CliError { code, message, hint }) => {
            if !message.is_empty() {
                eprintln!("error: {}", message);
            }
            if let Some(hint) = hint {
                eprintln!("hint:  {}", hint);
            }
            ExitCode::from(code)
        }
    }
}
