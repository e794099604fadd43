// Process-wide defaults and per-holder overrides

use serde::{Deserialize, Serialize};

/// Where record field metadata is cached between rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheLocation {
    /// Owned by the workbook holder, cleared at close.
    #[default]
    Holder,
    /// A caller-supplied cache shared by several workbook instances.
    Memory,
    /// Recomputed on every lookup.
    None,
}

/// What untyped (map) rows contain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadDefaultReturn {
    /// Every cell converted to text.
    #[default]
    String,
    /// Numbers, booleans, dates and text as their natural values.
    ActualData,
    /// The raw cell, including format and formula.
    CellData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfiguration {
    /// Trim ASCII whitespace and control characters off string cells
    pub auto_trim: bool,
    /// Strip Unicode whitespace off string cells (wins over `auto_trim`)
    pub auto_strip: bool,
    /// `None` means use the flag recorded in the source file
    pub use_1904_windowing: Option<bool>,
    /// BCP-47 tag, e.g. `en-US`
    pub locale: String,
    /// Render large/small numbers in scientific notation when converting to text
    pub use_scientific_format: bool,
    pub field_cache_location: CacheLocation,
}

impl Default for GlobalConfiguration {
    fn default() -> Self {
        Self {
            auto_trim: true,
            auto_strip: false,
            use_1904_windowing: None,
            locale: "en-US".to_string(),
            use_scientific_format: false,
            field_cache_location: CacheLocation::Holder,
        }
    }
}

impl GlobalConfiguration {
    /// Apply trim/strip normalization to text coming out of a cell.
    pub fn normalize_text(&self, text: &str) -> String {
        self.normalize(text).to_string()
    }

    pub fn normalize<'a>(&self, text: &'a str) -> &'a str {
        if self.auto_strip {
            text.trim()
        } else if self.auto_trim {
            text.trim_matches(|c: char| c <= ' ')
        } else {
            text
        }
    }

    /// Resolve the epoch flag against what the source declares.
    pub fn resolve_1904(&self, source_flag: Option<bool>) -> bool {
        self.use_1904_windowing
            .or(source_flag)
            .unwrap_or(false)
    }

    /// A copy of `self` with every field set in `delta` overridden.
    pub fn overlay(&self, delta: &HolderConfig) -> GlobalConfiguration {
        GlobalConfiguration {
            auto_trim: delta.auto_trim.unwrap_or(self.auto_trim),
            auto_strip: delta.auto_strip.unwrap_or(self.auto_strip),
            use_1904_windowing: delta.use_1904_windowing.or(self.use_1904_windowing),
            locale: delta.locale.clone().unwrap_or_else(|| self.locale.clone()),
            use_scientific_format: delta
                .use_scientific_format
                .unwrap_or(self.use_scientific_format),
            field_cache_location: delta
                .field_cache_location
                .unwrap_or(self.field_cache_location),
        }
    }
}

/// Configuration delta owned by one holder level. Unset fields inherit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HolderConfig {
    pub auto_trim: Option<bool>,
    pub auto_strip: Option<bool>,
    pub use_1904_windowing: Option<bool>,
    pub locale: Option<String>,
    pub use_scientific_format: Option<bool>,
    pub field_cache_location: Option<CacheLocation>,
}

impl HolderConfig {
    pub fn is_empty(&self) -> bool {
        *self == HolderConfig::default()
    }

    /// Resolve a chain ordered most specific first (Table, Sheet, Workbook)
    /// against the process defaults.
    pub fn resolve(chain: &[&HolderConfig], base: &GlobalConfiguration) -> GlobalConfiguration {
        chain
            .iter()
            .rev()
            .fold(base.clone(), |acc, delta| acc.overlay(delta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let g = GlobalConfiguration::default();
        assert!(g.auto_trim);
        assert!(!g.auto_strip);
        assert_eq!(g.use_1904_windowing, None);
        assert!(!g.use_scientific_format);
    }

    #[test]
    fn test_normalize() {
        let mut g = GlobalConfiguration::default();
        assert_eq!(g.normalize(" a\t"), "a");
        assert_eq!(g.normalize("\u{3000}a\u{3000}"), "\u{3000}a\u{3000}");
        g.auto_strip = true;
        assert_eq!(g.normalize("\u{3000}a\u{3000}"), "a");
        g.auto_strip = false;
        g.auto_trim = false;
        assert_eq!(g.normalize(" a "), " a ");
    }

    #[test]
    fn test_most_specific_wins() {
        let base = GlobalConfiguration::default();
        let workbook = HolderConfig {
            locale: Some("de-DE".into()),
            auto_trim: Some(false),
            ..Default::default()
        };
        let sheet = HolderConfig {
            auto_trim: Some(true),
            ..Default::default()
        };
        let table = HolderConfig {
            use_scientific_format: Some(true),
            ..Default::default()
        };

        let resolved = HolderConfig::resolve(&[&table, &sheet, &workbook], &base);
        assert!(resolved.auto_trim);
        assert!(resolved.use_scientific_format);
        assert_eq!(resolved.locale, "de-DE");

        // A sibling without the table delta does not see it
        let sibling = HolderConfig::resolve(&[&sheet, &workbook], &base);
        assert!(!sibling.use_scientific_format);
    }

    #[test]
    fn test_resolve_1904() {
        let mut g = GlobalConfiguration::default();
        assert!(!g.resolve_1904(None));
        assert!(g.resolve_1904(Some(true)));
        g.use_1904_windowing = Some(false);
        assert!(!g.resolve_1904(Some(true)));
    }
}
