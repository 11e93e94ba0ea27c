use super::types::WalMessage;

/// Builds `test_decoding` formatted messages with advancing LSNs.
pub struct MockMessageBuilder {
    lsn: std::cell::Cell<u64>,
    xid: u32,
}

impl MockMessageBuilder {
    pub fn new() -> Self {
        Self {
            lsn: std::cell::Cell::new(0x16B_3748),
            xid: 700,
        }
    }

    pub fn with_xid(mut self, xid: u32) -> Self {
        self.xid = xid;
        self
    }

    fn next(&self, data: String) -> WalMessage {
        let lsn = self.lsn.get();
        self.lsn.set(lsn + 0x38);
        WalMessage::new(data)
            .with_lsn(format!("{:X}/{:X}", lsn >> 32, lsn & 0xFFFF_FFFF))
            .with_xid(self.xid)
    }

    pub fn begin_message(&self) -> WalMessage {
        self.next(format!("BEGIN {}", self.xid))
    }

    pub fn commit_message(&self) -> WalMessage {
        self.next(format!("COMMIT {}", self.xid))
    }

    /// `columns` are `(name, type, value)`; text values are quoted the way the server does.
    pub fn insert_message(&self, schema: &str, table: &str, columns: &[(&str, &str, &str)]) -> WalMessage {
        self.change_message(schema, table, "INSERT", columns)
    }

    pub fn change_message(
        &self,
        schema: &str,
        table: &str,
        operation: &str,
        columns: &[(&str, &str, &str)],
    ) -> WalMessage {
        let rendered: Vec<String> = columns
            .iter()
            .map(|(name, ty, value)| {
                if ty.contains("int") || *ty == "boolean" || *ty == "numeric" {
                    format!("{}[{}]:{}", name, ty, value)
                } else {
                    format!("{}[{}]:'{}'", name, ty, value.replace('\'', "''"))
                }
            })
            .collect();
        self.next(format!(
            "table {}.{}: {}: {}",
            schema,
            table,
            operation,
            rendered.join(" ")
        ))
    }

    /// A full transaction: BEGIN, one INSERT per table, COMMIT.
    pub fn transaction(&self, tables: &[&str]) -> Vec<WalMessage> {
        let mut messages = vec![self.begin_message()];
        for (idx, table) in tables.iter().enumerate() {
            let id = (idx + 1).to_string();
            messages.push(self.insert_message("public", table, &[("id", "integer", &id)]));
        }
        messages.push(self.commit_message());
        messages
    }
}

impl Default for MockMessageBuilder {
    fn default() -> Self {
        Self::new()
    }
}
