use postgres_protocol::escape::escape_identifier;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
    #[default]
    Unknown,
}

impl ChangeOperation {
    pub fn from_keyword(keyword: &str) -> Self {
        match keyword {
            "INSERT" => ChangeOperation::Insert,
            "UPDATE" => ChangeOperation::Update,
            "DELETE" => ChangeOperation::Delete,
            _ => ChangeOperation::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOperation::Insert => "INSERT",
            ChangeOperation::Update => "UPDATE",
            ChangeOperation::Delete => "DELETE",
            ChangeOperation::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row-level change recovered from one decoded stream message.
///
/// An empty `table` means the message carried nothing actionable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub table: String,
    pub operation: ChangeOperation,
    pub values: BTreeMap<String, String>,
}

impl ChangeEvent {
    pub fn is_actionable(&self) -> bool {
        !self.table.is_empty()
    }

    pub fn table_ref(&self) -> Option<TableRef> {
        if self.table.is_empty() {
            return None;
        }
        Some(TableRef {
            schema: self.schema.clone(),
            name: self.table.clone(),
        })
    }
}

/// A possibly schema-qualified table name as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableRef {
    pub schema: Option<String>,
    pub name: String,
}

impl TableRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
        }
    }

    pub fn qualified(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: Some(schema.into()),
            name: name.into(),
        }
    }

    /// Quoted identifier safe to interpolate into SQL.
    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", escape_identifier(schema), escape_identifier(&self.name)),
            None => escape_identifier(&self.name),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// One decoded message pulled from the replication slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalMessage {
    /// Log position of the record, in `X/X` form
    pub lsn: Option<String>,
    pub xid: Option<u32>,
    pub data: String,
}

impl WalMessage {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            lsn: None,
            xid: None,
            data: data.into(),
        }
    }

    pub fn with_lsn(mut self, lsn: impl Into<String>) -> Self {
        self.lsn = Some(lsn.into());
        self
    }

    pub fn with_xid(mut self, xid: u32) -> Self {
        self.xid = Some(xid);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_ref_display() {
        assert_eq!(TableRef::qualified("public", "orders").to_string(), "public.orders");
        assert_eq!(TableRef::new("orders").to_string(), "orders");
    }

    #[test]
    fn test_table_ref_quoting() {
        assert_eq!(TableRef::qualified("public", "orders").quoted(), "\"public\".\"orders\"");
        assert_eq!(TableRef::new("we\"ird").quoted(), "\"we\"\"ird\"");
    }

    #[test]
    fn test_operation_keywords() {
        assert_eq!(ChangeOperation::from_keyword("INSERT"), ChangeOperation::Insert);
        assert_eq!(ChangeOperation::from_keyword("TRUNCATE"), ChangeOperation::Unknown);
        assert_eq!(ChangeOperation::Delete.to_string(), "DELETE");
    }

    #[test]
    fn test_actionable() {
        assert!(!ChangeEvent::default().is_actionable());
        let event = ChangeEvent {
            table: "orders".to_string(),
            ..Default::default()
        };
        assert_eq!(event.table_ref(), Some(TableRef::new("orders")));
    }
}
