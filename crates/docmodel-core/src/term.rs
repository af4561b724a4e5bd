//! The opaque query term tree.
//!
//! A [`Term`] is the executable artifact the query builder produces and the
//! driver consumes; it is to this layer what SQL text is to a relational
//! driver. Terms are plain data: the builder folds its operation list into
//! one, and a driver interprets it however its backend requires.
//!
//! Per-row sub-queries (the populate expander's lookups) reference fields of
//! the row being processed via [`KeyExpr::Field`]; drivers resolve those
//! against the current row while interpreting `Merge`/`MapMerge`/`DoMerge`
//! entries.

use crate::schema::IndexDef;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A key operand: a literal value, or a field of the row currently being
/// processed by an enclosing merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KeyExpr {
    /// A literal key value.
    Literal(Value),
    /// The named field of the enclosing row.
    Field(String),
}

impl KeyExpr {
    /// Literal from anything JSON-convertible.
    #[must_use]
    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    /// Field reference.
    #[must_use]
    pub fn field(name: impl Into<String>) -> Self {
        Self::Field(name.into())
    }
}

/// A named sub-query merged into each produced record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeEntry {
    /// Property the sub-query result lands under.
    pub property: String,
    /// The sub-query, evaluated once per row with `KeyExpr::Field`
    /// references bound to that row.
    pub term: Term,
}

/// The query term tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Term {
    /// A whole table.
    Table { name: String },
    /// Create a table.
    TableCreate { name: String },
    /// List table names.
    TableList,
    /// Drop a table.
    TableDrop { name: String },
    /// Create a secondary index on a table term.
    IndexCreate { source: Box<Term>, index: IndexDef },
    /// List index names of a table term.
    IndexList { source: Box<Term> },
    /// Wait until the table's indexes are ready.
    IndexWait { source: Box<Term> },
    /// Point lookup by primary key.
    Get { source: Box<Term>, key: KeyExpr },
    /// Range lookup by key(s), optionally via a secondary index.
    GetAll {
        source: Box<Term>,
        keys: Vec<KeyExpr>,
        index: Option<String>,
    },
    /// Keep rows matching an object predicate (null matches absent-or-null).
    Filter { source: Box<Term>, predicate: Value },
    /// Insert one or more documents.
    Insert { source: Box<Term>, documents: Vec<Value> },
    /// Patch the selected record(s).
    Update { source: Box<Term>, patch: Value },
    /// Delete the selected record(s).
    Delete { source: Box<Term> },
    /// Keep only the named fields.
    Pluck { source: Box<Term>, fields: Vec<String> },
    /// Drop the named fields.
    Without { source: Box<Term>, fields: Vec<String> },
    /// Merge a static document into the result.
    Merge { source: Box<Term>, document: Value },
    /// Map each row to itself merged with per-row sub-query results.
    MapMerge { source: Box<Term>, entries: Vec<MergeEntry> },
    /// Scalar variant of `MapMerge` for single-record sources; null
    /// records pass through unmerged (the populate null guard).
    DoMerge { source: Box<Term>, entries: Vec<MergeEntry> },
    /// Replace each row by a point lookup of `table` keyed by the row's
    /// `field` value (the join-table hop of a many-to-many expansion).
    MapGet {
        source: Box<Term>,
        table: String,
        field: String,
    },
    /// Extract a single field.
    GetField { source: Box<Term>, field: String },
    /// The nth element of a sequence.
    Nth { source: Box<Term>, index: i64 },
    /// Substitute a default when the source produces null or is empty.
    Default { source: Box<Term>, value: Value },
    /// Force a stream/selection into a materialized array.
    CoerceToArray { source: Box<Term> },
    /// Count the produced records.
    Count { source: Box<Term> },
    /// Sort by a field.
    OrderBy {
        source: Box<Term>,
        field: String,
        descending: bool,
    },
    /// Truncate to the first `count` records.
    Limit { source: Box<Term>, count: u64 },
    /// Skip the first `count` records.
    Skip { source: Box<Term>, count: u64 },
    /// Subscribe to live changes of the selected records.
    Changes { source: Box<Term> },
}

impl Term {
    /// Table term shorthand.
    #[must_use]
    pub fn table(name: impl Into<String>) -> Self {
        Self::Table { name: name.into() }
    }

    /// The table name this term ultimately reads or writes, if any.
    #[must_use]
    pub fn table_name(&self) -> Option<&str> {
        match self {
            Self::Table { name } | Self::TableCreate { name } | Self::TableDrop { name } => {
                Some(name)
            }
            Self::TableList => None,
            Self::IndexCreate { source, .. }
            | Self::IndexList { source }
            | Self::IndexWait { source }
            | Self::Get { source, .. }
            | Self::GetAll { source, .. }
            | Self::Filter { source, .. }
            | Self::Insert { source, .. }
            | Self::Update { source, .. }
            | Self::Delete { source }
            | Self::Pluck { source, .. }
            | Self::Without { source, .. }
            | Self::Merge { source, .. }
            | Self::MapMerge { source, .. }
            | Self::DoMerge { source, .. }
            | Self::MapGet { source, .. }
            | Self::GetField { source, .. }
            | Self::Nth { source, .. }
            | Self::Default { source, .. }
            | Self::CoerceToArray { source }
            | Self::Count { source }
            | Self::OrderBy { source, .. }
            | Self::Limit { source, .. }
            | Self::Skip { source, .. }
            | Self::Changes { source } => source.table_name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn table_name_walks_to_the_root() {
        let term = Term::Filter {
            source: Box::new(Term::GetAll {
                source: Box::new(Term::table("Quote")),
                keys: vec![KeyExpr::literal("x")],
                index: Some("assetId".to_string()),
            }),
            predicate: json!({"symbol": "AAPL"}),
        };
        assert_eq!(term.table_name(), Some("Quote"));
        assert_eq!(Term::TableList.table_name(), None);
    }

    #[test]
    fn terms_round_trip_through_serde() {
        let term = Term::DoMerge {
            source: Box::new(Term::Get {
                source: Box::new(Term::table("Asset")),
                key: KeyExpr::literal("a1"),
            }),
            entries: vec![MergeEntry {
                property: "quotes".to_string(),
                term: Term::CoerceToArray {
                    source: Box::new(Term::GetAll {
                        source: Box::new(Term::table("Quote")),
                        keys: vec![KeyExpr::field("id")],
                        index: Some("assetId".to_string()),
                    }),
                },
            }],
        };
        let encoded = serde_json::to_string(&term).unwrap();
        let decoded: Term = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, term);
    }
}
