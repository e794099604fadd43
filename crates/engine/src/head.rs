// Header model: one Head per logical column, plus the merged-label layout

use std::collections::{BTreeMap, HashSet};

use crate::cell::CellRange;
use crate::record::{FieldLayout, FieldSpec};

/// Where a head map came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeadKind {
    #[default]
    None,
    /// A literal label grid
    Literal,
    /// Built from a record type's fields
    Typed,
}

#[derive(Debug, Clone)]
pub struct Head {
    pub column_index: usize,
    /// One label per header row, already padded
    pub labels: Vec<String>,
    pub field: Option<FieldSpec>,
    pub force_index: bool,
    pub force_name: bool,
}

impl Head {
    pub fn field_name(&self) -> Option<&'static str> {
        self.field.as_ref().map(|f| f.name)
    }

    pub fn last_label(&self) -> &str {
        self.labels.last().map(String::as_str).unwrap_or("")
    }
}

#[derive(Debug, Clone, Default)]
pub struct HeadProperty {
    pub kind: HeadKind,
    pub heads: BTreeMap<usize, Head>,
    pub head_row_number: usize,
}

impl HeadProperty {
    pub fn none() -> Self {
        Self::default()
    }

    /// Build from a label grid: one inner list per column.
    pub fn from_literal(grid: &[Vec<String>]) -> Self {
        let heads = grid
            .iter()
            .enumerate()
            .map(|(column, labels)| {
                (
                    column,
                    Head {
                        column_index: column,
                        labels: labels.clone(),
                        field: None,
                        force_index: false,
                        force_name: false,
                    },
                )
            })
            .collect();
        let mut prop = HeadProperty {
            kind: HeadKind::Literal,
            heads,
            head_row_number: 0,
        };
        prop.pad_labels();
        prop
    }

    pub fn from_layout(layout: &FieldLayout) -> Self {
        let heads = layout
            .columns
            .iter()
            .map(|(column, field)| {
                (
                    *column,
                    Head {
                        column_index: *column,
                        labels: field.effective_labels(),
                        force_index: field.force_index(),
                        force_name: field.force_name(),
                        field: Some(field.clone()),
                    },
                )
            })
            .collect();
        let mut prop = HeadProperty {
            kind: HeadKind::Typed,
            heads,
            head_row_number: 0,
        };
        prop.pad_labels();
        prop
    }

    pub fn has_head(&self) -> bool {
        self.kind != HeadKind::None && !self.heads.is_empty()
    }

    /// Header rows = longest label list; shorter lists repeat their last label.
    fn pad_labels(&mut self) {
        self.head_row_number = self
            .heads
            .values()
            .map(|h| h.labels.len())
            .max()
            .unwrap_or(0);
        for head in self.heads.values_mut() {
            let last = head.labels.last().cloned().unwrap_or_default();
            while head.labels.len() < self.head_row_number {
                head.labels.push(last.clone());
            }
        }
    }

    pub fn head(&self, column: usize) -> Option<&Head> {
        self.heads.get(&column)
    }

    /// Head bound to a field name.
    pub fn head_for_field(&self, name: &str) -> Option<&Head> {
        self.heads.values().find(|h| h.field_name() == Some(name))
    }

    pub fn last_column(&self) -> Option<usize> {
        self.heads.keys().next_back().copied()
    }

    /// Rebind name-matched heads to the columns whose (normalized) label in
    /// the last header row equals their last label. Name-matched heads with
    /// no matching column are dropped.
    pub fn rematch_by_name(&mut self, last_row: &BTreeMap<usize, String>) {
        if self.kind != HeadKind::Typed {
            return;
        }
        let old = std::mem::take(&mut self.heads);
        let mut rebuilt = BTreeMap::new();
        for (column, mut head) in old {
            if head.force_index || !head.force_name {
                rebuilt.insert(column, head);
                continue;
            }
            let wanted = head.last_label().to_string();
            let found = last_row
                .iter()
                .find(|(_, label)| !label.is_empty() && **label == wanted)
                .map(|(c, _)| *c);
            match found {
                Some(c) => {
                    head.column_index = c;
                    rebuilt.insert(c, head);
                }
                None => {
                    tracing::debug!(label = %wanted, "head label not found in header row, dropped");
                }
            }
        }
        self.heads = rebuilt;
    }

    /// Regions to merge in the header block, relative to its first row.
    ///
    /// A label spreads right over equal labels in the same row, then down
    /// while every cell of that span repeats it.
    pub fn head_cell_ranges(&self) -> Vec<CellRange> {
        let heads: Vec<&Head> = self.heads.values().collect();
        let rows = self.head_row_number;
        let mut taken: HashSet<(usize, usize)> = HashSet::new();
        let mut ranges = Vec::new();

        for i in 0..heads.len() {
            for j in 0..rows {
                if !taken.insert((i, j)) {
                    continue;
                }
                let name = &heads[i].labels[j];
                let mut last_col = i;
                for (k, other) in heads.iter().enumerate().skip(i + 1) {
                    if other.labels[j] == *name && !taken.contains(&(k, j)) {
                        taken.insert((k, j));
                        last_col = k;
                    } else {
                        break;
                    }
                }

                let mut last_row = j;
                'down: for k in (j + 1)..rows {
                    let mut row_cells = Vec::new();
                    for (l, head) in heads.iter().enumerate().take(last_col + 1).skip(i) {
                        if head.labels[k] == *name && !taken.contains(&(l, k)) {
                            row_cells.push((l, k));
                        } else {
                            break 'down;
                        }
                    }
                    taken.extend(row_cells);
                    last_row = k;
                }

                if last_row == j && last_col == i {
                    continue;
                }
                ranges.push(CellRange::new(
                    j,
                    last_row,
                    heads[i].column_index,
                    heads[last_col].column_index,
                ));
            }
        }
        ranges
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::TargetType;

    fn grid(cols: &[&[&str]]) -> Vec<Vec<String>> {
        cols.iter()
            .map(|c| c.iter().map(|s| s.to_string()).collect())
            .collect()
    }

    #[test]
    fn test_literal_padding_repeats_last() {
        let prop = HeadProperty::from_literal(&grid(&[&["A", "B", "C"], &["X"], &["P", "Q"]]));
        assert_eq!(prop.head_row_number, 3);
        assert_eq!(prop.heads[&1].labels, vec!["X", "X", "X"]);
        assert_eq!(prop.heads[&2].labels, vec!["P", "Q", "Q"]);
    }

    #[test]
    fn test_typed_head_defaults_to_field_name() {
        let layout = FieldLayout::build(&[
            FieldSpec::new("id", TargetType::I64),
            FieldSpec::new("name", TargetType::String).labels(["Person", "Name"]),
        ])
        .unwrap();
        let prop = HeadProperty::from_layout(&layout);
        assert_eq!(prop.kind, HeadKind::Typed);
        assert_eq!(prop.head_row_number, 2);
        assert_eq!(prop.heads[&0].labels, vec!["id", "id"]);
        assert!(!prop.heads[&0].force_name);
        assert!(prop.heads[&1].force_name);
    }

    #[test]
    fn test_merge_ranges() {
        // | Person       | Id |
        // | First | Last | Id |
        let prop = HeadProperty::from_literal(&grid(&[
            &["Person", "First"],
            &["Person", "Last"],
            &["Id"],
        ]));
        let ranges = prop.head_cell_ranges();
        assert_eq!(
            ranges,
            vec![CellRange::new(0, 0, 0, 1), CellRange::new(0, 1, 2, 2)]
        );
    }

    #[test]
    fn test_no_ranges_for_distinct_labels() {
        let prop = HeadProperty::from_literal(&grid(&[&["a"], &["b"]]));
        assert!(prop.head_cell_ranges().is_empty());
    }

    #[test]
    fn test_rematch_by_name() {
        let layout = FieldLayout::build(&[
            FieldSpec::new("name", TargetType::String).label("Name"),
            FieldSpec::new("age", TargetType::I32).label("Age"),
            FieldSpec::new("pinned", TargetType::String).index(5),
            FieldSpec::new("gone", TargetType::String).label("Missing"),
        ])
        .unwrap();
        let mut prop = HeadProperty::from_layout(&layout);
        let row: BTreeMap<usize, String> =
            [(0, "Age".to_string()), (3, "Name".to_string())].into_iter().collect();
        prop.rematch_by_name(&row);

        assert_eq!(prop.heads[&0].field_name(), Some("age"));
        assert_eq!(prop.heads[&3].field_name(), Some("name"));
        assert_eq!(prop.heads[&5].field_name(), Some("pinned"));
        assert!(prop.head_for_field("gone").is_none());
    }
}
