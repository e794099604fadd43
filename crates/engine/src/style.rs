// Write-side cell decoration: fonts, fills, alignment, borders, number formats

use serde::{Deserialize, Serialize};

/// Horizontal text alignment
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum Alignment {
    #[default]
    General,
    Left,
    Center,
    Right,
}

/// Vertical text alignment
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum VerticalAlignment {
    Top,
    #[default]
    Middle,
    Bottom,
}

/// Border line weight, applied to all four edges
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum BorderStyle {
    #[default]
    None,
    Thin,
    Medium,
    Thick,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Font {
    pub name: Option<String>,
    pub size: Option<f64>,
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
    pub strikethrough: bool,
    /// RGB as 0xRRGGBB
    pub color: Option<u32>,
}

/// Full cell style. Every field is optional so styles can be layered:
/// `merge` lets a more specific style override only what it sets.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CellStyle {
    pub font: Option<Font>,
    /// Solid fill foreground, 0xRRGGBB
    pub fill: Option<u32>,
    pub horizontal: Option<Alignment>,
    pub vertical: Option<VerticalAlignment>,
    pub wrap: Option<bool>,
    pub border: Option<BorderStyle>,
    /// Spreadsheet number format pattern, e.g. `0.00` or `yyyy-mm-dd`
    pub number_format: Option<String>,
}

impl CellStyle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_font(mut self, font: Font) -> Self {
        self.font = Some(font);
        self
    }

    pub fn with_fill(mut self, rgb: u32) -> Self {
        self.fill = Some(rgb);
        self
    }

    pub fn with_alignment(mut self, horizontal: Alignment, vertical: VerticalAlignment) -> Self {
        self.horizontal = Some(horizontal);
        self.vertical = Some(vertical);
        self
    }

    pub fn with_border(mut self, border: BorderStyle) -> Self {
        self.border = Some(border);
        self
    }

    pub fn with_number_format(mut self, format: impl Into<String>) -> Self {
        self.number_format = Some(format.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == CellStyle::default()
    }

    /// Overlay `other` onto `self`: fields set in `other` win.
    pub fn merge(&mut self, other: &CellStyle) {
        if other.font.is_some() {
            self.font = other.font.clone();
        }
        if other.fill.is_some() {
            self.fill = other.fill;
        }
        if other.horizontal.is_some() {
            self.horizontal = other.horizontal;
        }
        if other.vertical.is_some() {
            self.vertical = other.vertical;
        }
        if other.wrap.is_some() {
            self.wrap = other.wrap;
        }
        if other.border.is_some() {
            self.border = other.border;
        }
        if other.number_format.is_some() {
            self.number_format = other.number_format.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_keeps_unset_fields() {
        let mut base = CellStyle::new()
            .with_fill(0xFFFFFF)
            .with_number_format("0.00");
        let over = CellStyle::new().with_fill(0x000000);
        base.merge(&over);
        assert_eq!(base.fill, Some(0x000000));
        assert_eq!(base.number_format.as_deref(), Some("0.00"));
    }

    #[test]
    fn test_default_style_is_empty() {
        assert!(CellStyle::default().is_empty());
        assert!(!CellStyle::new().with_border(BorderStyle::Thin).is_empty());
    }
}
