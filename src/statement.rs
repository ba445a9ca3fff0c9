//! Prepared statement descriptions and command tags.
use crate::message::{FieldDescription, Oid};

/// Description of a prepared statement, as reported by the backend.
///
/// Immutable once returned.
#[derive(Debug, Clone)]
pub struct StatementDescription {
    /// Statement name; empty for the unnamed statement.
    pub name: String,
    /// The SQL text the statement was parsed from.
    pub sql: String,
    /// Parameter data type OIDs.
    pub param_oids: Vec<Oid>,
    /// Result columns; empty when the statement returns no rows.
    pub fields: Vec<FieldDescription>,
}

/// The status tag reported by `CommandComplete`.
///
/// Usually a single word identifying the completed SQL command, optionally
/// followed by counters, e.g. `SELECT 5` or `INSERT 0 1`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandTag(String);

impl CommandTag {
    pub(crate) fn new(tag: String) -> Self {
        Self(tag)
    }

    /// The raw tag text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Number of rows the command affected.
    ///
    /// Parsed from the trailing decimal of the tag; zero when the tag
    /// carries no count (`BEGIN`, `CREATE TABLE`, ...).
    pub fn rows_affected(&self) -> u64 {
        self.0
            .rsplit(' ')
            .next()
            .and_then(|count| count.parse().ok())
            .unwrap_or(0)
    }
}

impl std::fmt::Display for CommandTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<str> for CommandTag {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for CommandTag {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}
