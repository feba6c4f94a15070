//! Per-entity outcome counters for a run, rendered as a plain text table.

use std::{collections::BTreeMap, fmt::Write as _};

use crate::entity::EntityType;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityCounts {
    /// Payloads produced by the transform stage.
    pub built: usize,
    /// Payloads discarded before persistence, one message each.
    pub dropped: Vec<String>,
    pub created: usize,
    pub updated: usize,
    /// UPDATE targets with no cached id or no stored row, and CREATE keys
    /// that were already cached.
    pub skipped: usize,
    /// Payloads in batches that were rolled back.
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    entries: BTreeMap<EntityType, EntityCounts>,
}

impl LoadReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&mut self, entity_type: EntityType) -> &mut EntityCounts {
        self.entries.entry(entity_type).or_default()
    }

    pub fn get(&self, entity_type: EntityType) -> Option<&EntityCounts> {
        self.entries.get(&entity_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityType, &EntityCounts)> {
        self.entries.iter().map(|(ty, counts)| (*ty, counts))
    }

    pub fn total_failed(&self) -> usize {
        self.entries.values().map(|c| c.failed).sum()
    }

    pub fn total_dropped(&self) -> usize {
        self.entries.values().map(|c| c.dropped.len()).sum()
    }

    pub fn render(&self) -> String {
        let headers = ["entity", "built", "dropped", "created", "updated", "skipped", "failed"]
            .map(String::from)
            .to_vec();
        let rows = self
            .entries
            .iter()
            .map(|(ty, c)| {
                vec![
                    ty.to_string(),
                    c.built.to_string(),
                    c.dropped.len().to_string(),
                    c.created.to_string(),
                    c.updated.to_string(),
                    c.skipped.to_string(),
                    c.failed.to_string(),
                ]
            })
            .collect::<Vec<_>>();
        render_table(&headers, &rows)
    }
}

/// Left-aligns the first column and right-aligns the rest, two spaces apart.
pub fn render_table(headers: &[String], rows: &[Vec<String>]) -> String {
    let mut widths = headers.iter().map(|h| display_width(h)).collect::<Vec<_>>();
    for row in rows {
        for (idx, cell) in row.iter().enumerate().take(widths.len()) {
            widths[idx] = widths[idx].max(display_width(cell));
        }
    }

    let mut output = String::new();
    let _ = writeln!(output, "{}", format_row(headers, &widths));
    let rule = widths.iter().map(|w| "-".repeat(*w)).collect::<Vec<_>>();
    let _ = writeln!(output, "{}", format_row(&rule, &widths));
    for row in rows {
        let _ = writeln!(output, "{}", format_row(row, &widths));
    }
    output
}

fn format_row(values: &[String], widths: &[usize]) -> String {
    let line = values
        .iter()
        .zip(widths)
        .enumerate()
        .map(|(idx, (value, &width))| {
            let cell = value.replace(['\n', '\r', '\t'], " ");
            if idx == 0 {
                format!("{cell:<width$}")
            } else {
                format!("{cell:>width$}")
            }
        })
        .collect::<Vec<_>>()
        .join("  ");
    line.trim_end().to_string()
}

fn display_width(value: &str) -> usize {
    value.chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_one_line_per_entity_type() {
        let mut report = LoadReport::new();
        report.entry(EntityType::Participant).created = 12;
        report.entry(EntityType::Participant).built = 12;
        report
            .entry(EntityType::Diagnosis)
            .dropped
            .push("missing participant".into());
        let rendered = report.render();
        let lines: Vec<_> = rendered.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("entity"));
        assert!(lines[1].starts_with("---"));
        assert!(lines[2].starts_with("participant"));
        assert!(lines[3].starts_with("diagnosis"));
        assert_eq!(report.total_dropped(), 1);
    }

    #[test]
    fn numeric_columns_are_right_aligned() {
        let rendered = render_table(
            &["name".into(), "count".into()],
            &[vec!["a".into(), "7".into()]],
        );
        assert!(rendered.lines().nth(2).unwrap().ends_with("    7"));
    }
}
