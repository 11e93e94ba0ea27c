use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{trace, warn};

use super::types::{ChangeEvent, ChangeOperation};

/// Something the parser could not make sense of in one segment of a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseIssue {
    #[error("empty message")]
    EmptyMessage,
    #[error("relation header has no table name")]
    MissingRelation,
    #[error("unrecognised relation header '{0}'")]
    UnexpectedHeader(String),
    #[error("missing operation keyword")]
    MissingOperation,
    #[error("missing column segment")]
    MissingColumns,
    #[error("no column[value] pairs found")]
    NoColumnValues,
    #[error("unterminated '[' after column '{column}'")]
    UnterminatedBracket { column: String },
    #[error("unterminated quoted value for column '{column}'")]
    UnterminatedQuote { column: String },
    #[error("unexpected token '{0}'")]
    StrayToken(String),
}

impl ParseIssue {
    /// Issues that make the whole message non-actionable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ParseIssue::EmptyMessage
                | ParseIssue::MissingRelation
                | ParseIssue::UnexpectedHeader(_)
                | ParseIssue::MissingOperation
                | ParseIssue::MissingColumns
                | ParseIssue::NoColumnValues
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedChange {
    pub event: ChangeEvent,
    pub issues: Vec<ParseIssue>,
}

/// Returns `true` for transaction framing (`BEGIN`, `COMMIT`) and empty
/// messages, which carry no row change.
pub fn is_framing_message(raw: &str) -> bool {
    match raw.split_whitespace().next() {
        None => true,
        Some(first) => first == "BEGIN" || first == "COMMIT",
    }
}

/// Turns one line of `test_decoding` style output into a [`ChangeEvent`].
///
/// Accepted shape:
///
/// ```text
/// [table] <schema.>relation: OPERATION: col[value] col[type]:'quoted value' ...
/// ```
#[derive(Debug, Clone, Default)]
pub struct ChangeEventParser;

impl ChangeEventParser {
    pub fn new() -> Self {
        Self
    }

    /// Parses a message, logging every issue. Never fails: malformed input
    /// yields an event with an empty table.
    pub fn parse(&self, raw: &str) -> ChangeEvent {
        let parsed = self.parse_detailed(raw);
        for issue in &parsed.issues {
            warn!(raw = %raw, "Error parsing change data: {}", issue);
        }
        parsed.event
    }

    pub fn parse_detailed(&self, raw: &str) -> ParsedChange {
        let mut issues = Vec::new();
        let mut event = ChangeEvent::default();

        let line = raw.trim();
        if line.is_empty() {
            issues.push(ParseIssue::EmptyMessage);
            return ParsedChange { event, issues };
        }

        let (header, rest) = split_segment(line);

        match relation_token(header.trim()) {
            Ok(token) => match parse_relation(token) {
                Some((schema, table)) => {
                    event.schema = schema;
                    event.table = table;
                }
                None => issues.push(ParseIssue::UnexpectedHeader(header.trim().to_string())),
            },
            Err(issue) => issues.push(issue),
        }

        let (operation, columns) = match rest {
            Some(rest) => split_segment(rest),
            None => ("", None),
        };
        let operation = operation.trim();
        if operation.is_empty() {
            issues.push(ParseIssue::MissingOperation);
        } else {
            event.operation = ChangeOperation::from_keyword(operation);
        }

        match columns {
            Some(columns) => {
                let markers = parse_columns(columns, &mut event.values, &mut issues);
                if event.values.is_empty() && markers == 0 {
                    issues.push(ParseIssue::NoColumnValues);
                }
            }
            None => issues.push(ParseIssue::MissingColumns),
        }

        if issues.iter().any(ParseIssue::is_fatal) {
            event.schema = None;
            event.table.clear();
        }

        trace!(table = %event.table, operation = %event.operation, "Parsed change");
        ParsedChange { event, issues }
    }
}

/// Splits at the first `:` that is not inside a double-quoted identifier.
pub(crate) fn split_segment(input: &str) -> (&str, Option<&str>) {
    let mut in_quotes = false;
    for (idx, c) in input.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ':' if !in_quotes => return (&input[..idx], Some(&input[idx + 1..])),
            _ => {}
        }
    }
    (input, None)
}

/// Picks the relation token out of the header: the second token when a
/// keyword such as `table` precedes it, otherwise the only token.
fn relation_token(header: &str) -> Result<&str, ParseIssue> {
    if header.is_empty() {
        return Err(ParseIssue::MissingRelation);
    }
    let mut in_quotes = false;
    for (idx, c) in header.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                let rest = header[idx..].trim();
                return if rest.is_empty() {
                    Err(ParseIssue::MissingRelation)
                } else {
                    Ok(rest)
                };
            }
            _ => {}
        }
    }
    Ok(header)
}

/// Splits `schema.table` (either part optionally double-quoted) into its
/// components. Anything longer keeps the last two parts.
pub(crate) fn parse_relation(token: &str) -> Option<(Option<String>, String)> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = token.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            '.' if !in_quotes => parts.push(std::mem::take(&mut current)),
            c if c.is_whitespace() && !in_quotes => return None,
            c => current.push(c),
        }
    }
    parts.push(current);

    if in_quotes || parts.iter().any(String::is_empty) {
        return None;
    }
    let table = parts.pop()?;
    let schema = parts.pop();
    Some((schema, table))
}

struct Cursor<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn eat_whitespace(&mut self) {
        self.take_while(char::is_whitespace);
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> &'a str {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if !pred(c) {
                break;
            }
            self.bump();
        }
        &self.src[start..self.pos]
    }
}

/// Collects `name[value]` and `name[type]:value` pairs. Returns how many
/// parenthesised markers such as `(no-tuple-data)` were seen.
fn parse_columns(
    segment: &str,
    values: &mut BTreeMap<String, String>,
    issues: &mut Vec<ParseIssue>,
) -> usize {
    let mut cursor = Cursor::new(segment);
    let mut markers = 0;

    loop {
        cursor.eat_whitespace();
        let Some(next) = cursor.peek() else {
            break;
        };

        if next == '(' {
            let marker = cursor.take_while(|c| c != ')');
            if cursor.bump().is_some() {
                markers += 1;
            } else {
                issues.push(ParseIssue::StrayToken(marker.to_string()));
            }
            continue;
        }

        let name = match read_column_name(&mut cursor) {
            Some(name) => name,
            None => {
                let token = cursor.take_while(|c| !c.is_whitespace());
                issues.push(ParseIssue::StrayToken(token.to_string()));
                continue;
            }
        };

        if cursor.peek() != Some('[') {
            // Section labels such as `old-key:` / `new-tuple:` in UPDATEs.
            if !name.ends_with(':') {
                issues.push(ParseIssue::StrayToken(name));
            }
            continue;
        }
        cursor.bump();

        let Some(inner) = read_bracketed(&mut cursor) else {
            issues.push(ParseIssue::UnterminatedBracket { column: name });
            break;
        };

        if cursor.peek() == Some(':') {
            cursor.bump();
            match read_value(&mut cursor) {
                Some(value) => {
                    values.insert(name, value);
                }
                None => {
                    issues.push(ParseIssue::UnterminatedQuote { column: name });
                    break;
                }
            }
        } else {
            values.insert(name, inner.to_string());
        }
    }

    markers
}

fn read_column_name(cursor: &mut Cursor<'_>) -> Option<String> {
    if cursor.peek() != Some('"') {
        let name = cursor.take_while(|c| c != '[' && !c.is_whitespace());
        return (!name.is_empty()).then(|| name.to_string());
    }

    cursor.bump();
    let mut name = String::new();
    loop {
        match cursor.bump()? {
            '"' if cursor.peek() == Some('"') => {
                cursor.bump();
                name.push('"');
            }
            '"' => return Some(name),
            c => name.push(c),
        }
    }
}

/// Reads up to the matching `]`, allowing nested brackets (`text[]`).
fn read_bracketed<'a>(cursor: &mut Cursor<'a>) -> Option<&'a str> {
    let start = cursor.pos;
    let mut depth = 1usize;
    loop {
        match cursor.bump()? {
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&cursor.src[start..cursor.pos - 1]);
                }
            }
            _ => {}
        }
    }
}

fn read_value(cursor: &mut Cursor<'_>) -> Option<String> {
    if cursor.peek() != Some('\'') {
        return Some(cursor.take_while(|c| !c.is_whitespace()).to_string());
    }

    cursor.bump();
    let mut value = String::new();
    loop {
        match cursor.bump()? {
            '\'' if cursor.peek() == Some('\'') => {
                cursor.bump();
                value.push('\'');
            }
            '\'' => return Some(value),
            c => value.push(c),
        }
    }
}
