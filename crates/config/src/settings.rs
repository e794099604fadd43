// Reader and writer defaults
// Loaded from ~/.config/sheetstream/settings.toml (or settings.json)

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sheetstream_engine::cache::{SimpleCacheSelector, DEFAULT_MAX_MEMORY_BYTES, DEFAULT_SPILL_BATCH_SIZE};
use sheetstream_engine::config::GlobalConfiguration;
use sheetstream_engine::read::ReadWorkbook;
use sheetstream_engine::write::{WriteBasic, WriteWorkbook};
use thiserror::Error;

const APP_DIR: &str = "sheetstream";
const TOML_FILE: &str = "settings.toml";
const JSON_FILE: &str = "settings.json";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("csv.delimiter must be a single ASCII character, got {0:?}")]
    Delimiter(String),

    #[error("serializing settings: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReadSettings {
    pub auto_trim: bool,
    pub auto_strip: bool,
    /// Unset: follow the flag stored in the file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_1904_windowing: Option<bool>,
    pub locale: String,
    pub use_scientific_format: bool,
    /// Unset: derived from the head (1 without one)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head_row_number: Option<usize>,
    pub ignore_empty_row: bool,
    pub ignore_hidden_sheet: bool,
}

impl Default for ReadSettings {
    fn default() -> Self {
        let global = GlobalConfiguration::default();
        Self {
            auto_trim: global.auto_trim,
            auto_strip: global.auto_strip,
            use_1904_windowing: global.use_1904_windowing,
            locale: global.locale,
            use_scientific_format: global.use_scientific_format,
            head_row_number: None,
            ignore_empty_row: true,
            ignore_hidden_sheet: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheSettings {
    /// Shared-string tables above this size spill to disk
    pub max_memory_bytes: u64,
    pub spill_batch_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spill_dir: Option<PathBuf>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_memory_bytes: DEFAULT_MAX_MEMORY_BYTES,
            spill_batch_size: DEFAULT_SPILL_BATCH_SIZE,
            spill_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WriteSettings {
    pub auto_merge_head: bool,
    pub use_default_style: bool,
}

impl Default for WriteSettings {
    fn default() -> Self {
        Self {
            auto_merge_head: true,
            use_default_style: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CsvSettings {
    /// Unset: sniffed on read, comma on write
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delimiter: Option<String>,
    pub bom: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub read: ReadSettings,
    pub cache: CacheSettings,
    pub write: WriteSettings,
    pub csv: CsvSettings,
}

impl Settings {
    /// Directory holding the settings file
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }

    /// The settings file in `dir`; TOML is preferred when both exist.
    pub fn find_in(dir: &Path) -> Option<PathBuf> {
        [TOML_FILE, JSON_FILE]
            .into_iter()
            .map(|name| dir.join(name))
            .find(|p| p.is_file())
    }

    /// Load settings from the user's config directory, falling back to
    /// defaults when the file is missing or unreadable.
    pub fn load() -> Self {
        let Some(path) = Self::find_in(&Self::config_dir()) else {
            return Self::default();
        };
        match Self::load_from(&path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(error = %e, "using default settings");
                Self::default()
            }
        }
    }

    /// Load one file; the format follows its extension.
    pub fn load_from(path: &Path) -> Result<Self, SettingsError> {
        let contents = fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let parse_error = |message: String| SettingsError::Parse {
            path: path.to_path_buf(),
            message,
        };

        let is_json = path
            .extension()
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let settings: Settings = if is_json {
            // Strip comments (lines starting with //)
            let cleaned: String = contents
                .lines()
                .filter(|line| !line.trim().starts_with("//"))
                .collect::<Vec<_>>()
                .join("\n");
            serde_json::from_str(&cleaned).map_err(|e| parse_error(e.to_string()))?
        } else {
            toml::from_str(&contents).map_err(|e| parse_error(e.to_string()))?
        };

        settings.csv_delimiter()?;
        tracing::debug!(path = %path.display(), "loaded settings");
        Ok(settings)
    }

    /// Save as TOML, creating the directory if needed
    pub fn save_to(&self, path: &Path) -> Result<(), SettingsError> {
        let io_error = |source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        let text = toml::to_string_pretty(self)?;
        fs::write(path, text).map_err(io_error)
    }

    pub fn csv_delimiter(&self) -> Result<Option<u8>, SettingsError> {
        let Some(text) = &self.csv.delimiter else {
            return Ok(None);
        };
        let value = match text.as_str() {
            "\\t" | "tab" => "\t",
            other => other,
        };
        match value.as_bytes() {
            [b] if b.is_ascii() => Ok(Some(*b)),
            _ => Err(SettingsError::Delimiter(text.clone())),
        }
    }

    pub fn global_configuration(&self) -> GlobalConfiguration {
        GlobalConfiguration {
            auto_trim: self.read.auto_trim,
            auto_strip: self.read.auto_strip,
            use_1904_windowing: self.read.use_1904_windowing,
            locale: self.read.locale.clone(),
            use_scientific_format: self.read.use_scientific_format,
            ..GlobalConfiguration::default()
        }
    }

    pub fn cache_selector(&self) -> SimpleCacheSelector {
        SimpleCacheSelector {
            max_memory_bytes: self.cache.max_memory_bytes,
            batch_size: self.cache.spill_batch_size.max(1),
            spill_dir: self.cache.spill_dir.clone(),
        }
    }

    pub fn read_workbook(&self) -> ReadWorkbook {
        ReadWorkbook {
            global: self.global_configuration(),
            head_row_number: self.read.head_row_number,
            ignore_empty_row: self.read.ignore_empty_row,
            ignore_hidden_sheet: self.read.ignore_hidden_sheet,
            cache_selector: Box::new(self.cache_selector()),
            ..ReadWorkbook::default()
        }
    }

    pub fn write_workbook(&self) -> WriteWorkbook {
        WriteWorkbook {
            basic: WriteBasic::default()
                .automatic_merge_head(self.write.auto_merge_head)
                .use_default_style(self.write.use_default_style),
            global: self.global_configuration(),
            ..WriteWorkbook::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_match_engine() {
        let settings = Settings::default();
        assert_eq!(settings.global_configuration(), GlobalConfiguration::default());
        assert_eq!(settings.csv_delimiter().unwrap(), None);
        assert!(settings.read.ignore_empty_row);
    }

    #[test]
    fn test_toml_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(TOML_FILE);
        fs::write(
            &path,
            r#"
[read]
autoStrip = true
use1904Windowing = true
headRowNumber = 2
ignoreHiddenSheet = true

[cache]
maxMemoryBytes = 1024

[csv]
delimiter = ";"
"#,
        )
        .unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert!(settings.read.auto_strip);
        assert!(settings.read.auto_trim);
        assert_eq!(settings.read.locale, "en-US");
        assert_eq!(settings.cache.spill_batch_size, DEFAULT_SPILL_BATCH_SIZE);
        assert_eq!(settings.csv_delimiter().unwrap(), Some(b';'));

        let read = settings.read_workbook();
        assert_eq!(read.head_row_number, Some(2));
        assert!(read.ignore_hidden_sheet);
        assert_eq!(read.global.use_1904_windowing, Some(true));
        assert_eq!(settings.cache_selector().max_memory_bytes, 1024);
    }

    #[test]
    fn test_json_with_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(JSON_FILE);
        fs::write(
            &path,
            r#"{
    // writer defaults
    "write": { "autoMergeHead": false },
    "csv": { "delimiter": "tab" }
}"#,
        )
        .unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert!(!settings.write.auto_merge_head);
        assert!(settings.write.use_default_style);
        assert_eq!(settings.csv_delimiter().unwrap(), Some(b'\t'));
        assert_eq!(settings.write_workbook().basic.automatic_merge_head, Some(false));
    }

    #[test]
    fn test_bad_delimiter_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(TOML_FILE);
        fs::write(&path, "[csv]\ndelimiter = \"::\"\n").unwrap();
        assert!(matches!(Settings::load_from(&path), Err(SettingsError::Delimiter(_))));
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(TOML_FILE);
        fs::write(&path, "[read\n").unwrap();
        let err = Settings::load_from(&path).unwrap_err();
        assert!(err.to_string().contains(TOML_FILE));
    }

    #[test]
    fn test_toml_preferred_and_saved_file_reloads() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Settings::find_in(dir.path()), None);

        let mut settings = Settings::default();
        settings.read.locale = "de-DE".into();
        settings.csv.bom = true;
        let path = dir.path().join("nested").join(TOML_FILE);
        settings.save_to(&path).unwrap();
        fs::write(dir.path().join("nested").join(JSON_FILE), "{}").unwrap();

        let found = Settings::find_in(&dir.path().join("nested")).unwrap();
        assert_eq!(found, path);
        assert_eq!(Settings::load_from(&found).unwrap(), settings);
    }
}
