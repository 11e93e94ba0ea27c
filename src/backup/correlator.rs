use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, error, info};

use crate::postgres::decoder::{parse_relation, split_segment};
use crate::postgres::TableRef;

/// Recovers the set of tables touched in a raw capture file.
///
/// Each line is searched for the marker word (`table` in `test_decoding`
/// output); the relation that follows it, up to the next unquoted `:`, is
/// the affected table. Lines without the marker are ignored.
#[derive(Debug, Clone)]
pub struct CdcLogCorrelator {
    marker: String,
}

impl Default for CdcLogCorrelator {
    fn default() -> Self {
        Self::new("table")
    }
}

impl CdcLogCorrelator {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }

    /// Reads `path` and extracts its affected tables. An unreadable file is
    /// logged and yields an empty set.
    pub async fn extract_affected_tables(&self, path: &Path) -> BTreeSet<TableRef> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let tables = self.extract_from_text(&String::from_utf8_lossy(&bytes));
                info!(path = ?path, tables = tables.len(), "Correlated capture file");
                tables
            }
            Err(e) => {
                error!("Error parsing CDC file {:?}: {}", path, e);
                BTreeSet::new()
            }
        }
    }

    pub fn extract_from_text(&self, text: &str) -> BTreeSet<TableRef> {
        text.lines()
            .filter_map(|line| self.extract_from_line(line))
            .collect()
    }

    fn extract_from_line(&self, line: &str) -> Option<TableRef> {
        let rest = self.after_marker(line)?;
        let (relation, _) = split_segment(rest);

        let parsed = parse_relation(relation.trim()).or_else(|| {
            let token = rest.split_whitespace().next()?.trim_end_matches(':');
            parse_relation(token)
        });

        match parsed {
            Some((Some(schema), name)) => Some(TableRef::qualified(schema, name)),
            Some((None, name)) => Some(TableRef::new(name)),
            None => {
                debug!(line = %line, "Marker without a usable relation");
                None
            }
        }
    }

    /// Text following the first standalone occurrence of the marker.
    fn after_marker<'a>(&self, line: &'a str) -> Option<&'a str> {
        line.match_indices(self.marker.as_str())
            .find(|(idx, _)| {
                let before = line[..*idx].chars().next_back();
                let after = line[idx + self.marker.len()..].chars().next();
                before.map_or(true, char::is_whitespace) && after.map_or(false, char::is_whitespace)
            })
            .map(|(idx, _)| line[idx + self.marker.len()..].trim_start())
            .filter(|rest| !rest.is_empty())
    }
}
