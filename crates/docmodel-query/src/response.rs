//! Interpretation of raw driver results.
//!
//! The driver hands back an untyped [`RawResult`]; what the caller should
//! see depends on what the chain asked for. A keyed document becomes a
//! single record, a feed stays a feed, row sets become record lists and
//! anything else passes through untouched.

use serde_json::Value;

use docmodel_core::{ChangeFeed, RawResult, WriteResult};

use crate::verb::Verb;

/// A driver result sorted into the form model code consumes.
pub enum Response {
    /// One addressable document (an object carrying an `id`).
    Record(Value),
    /// Zero or more documents.
    Records(Vec<Value>),
    /// A live change feed.
    Feed(ChangeFeed),
    /// The summary of a write.
    Write(WriteResult),
    /// A scalar or keyless object, passed through as-is.
    Atom(Value),
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Record(v) => f.debug_tuple("Record").field(v).finish(),
            Self::Records(v) => f.debug_tuple("Records").field(&v.len()).finish(),
            Self::Feed(_) => f.write_str("Feed"),
            Self::Write(w) => f.debug_tuple("Write").field(w).finish(),
            Self::Atom(v) => f.debug_tuple("Atom").field(v).finish(),
        }
    }
}

/// Classify a raw result given the verb that ended the chain.
pub fn classify(last_verb: Option<Verb>, raw: RawResult) -> Response {
    match raw {
        RawResult::Feed(feed) => {
            debug_assert_eq!(last_verb, Some(Verb::Changes));
            Response::Feed(feed)
        }
        RawResult::Write(result) => Response::Write(result),
        RawResult::Rows(rows) => Response::Records(rows),
        RawResult::Atom(value) => {
            if value.as_object().is_some_and(|obj| obj.contains_key("id")) {
                Response::Record(value)
            } else {
                Response::Atom(value)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keyed_object_is_a_record() {
        let raw = RawResult::Atom(json!({"id": "u1", "name": "ada"}));
        assert!(matches!(classify(Some(Verb::Get), raw), Response::Record(_)));
    }

    #[test]
    fn keyless_object_passes_through() {
        let raw = RawResult::Atom(json!({"inserted": 1}));
        assert!(matches!(classify(Some(Verb::Nth), raw), Response::Atom(_)));
        let count = RawResult::Atom(json!(3));
        assert!(matches!(classify(Some(Verb::Count), count), Response::Atom(_)));
    }

    #[test]
    fn rows_become_records() {
        let raw = RawResult::Rows(vec![json!({"id": "a"}), json!({"id": "b"})]);
        match classify(Some(Verb::Filter), raw) {
            Response::Records(rows) => assert_eq!(rows.len(), 2),
            other => panic!("expected records, got {other:?}"),
        }
    }

    #[test]
    fn write_summary_is_preserved() {
        let raw = RawResult::Write(WriteResult::inserted_with_key("k1"));
        match classify(Some(Verb::Insert), raw) {
            Response::Write(w) => {
                assert_eq!(w.inserted, 1);
                assert_eq!(w.generated_keys, vec!["k1".to_string()]);
            }
            other => panic!("expected write, got {other:?}"),
        }
    }
}
