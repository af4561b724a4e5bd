//! Immutable, shape-tracked query chains.
//!
//! A [`Chain`] records the operations applied so far together with the
//! result shape after each one. Every builder method validates its verb
//! against [`transition`] and returns a NEW chain, so a partially built
//! query can be forked freely; the original is never mutated.

use std::collections::BTreeMap;

use serde_json::Value;

use docmodel_core::{Error, IndexDef, KeyExpr, MergeEntry, Result, Term, TransitionError};

use crate::shape::{transition, Shape};
use crate::verb::Verb;

/// One recorded operation with its arguments.
#[derive(Debug, Clone)]
enum Op {
    Table { name: String },
    TableCreate { name: String },
    TableDrop { name: String },
    IndexCreate { index: IndexDef },
    IndexList,
    IndexWait,
    Get { key: KeyExpr },
    GetAll { keys: Vec<KeyExpr>, index: Option<String> },
    Filter { predicate: Value },
    Insert { documents: Vec<Value> },
    Update { patch: Value },
    Delete,
    Pluck { fields: Vec<String> },
    Without { fields: Vec<String> },
    Merge { document: Value },
    MapMerge { entries: Vec<MergeEntry> },
    DoMerge { entries: Vec<MergeEntry> },
    GetField { field: String },
    Nth { index: i64 },
    Count,
    OrderBy { field: String, descending: bool },
    Limit { count: u64 },
    Skip { count: u64 },
    Changes,
}

impl Op {
    fn verb(&self) -> Verb {
        match self {
            Op::Table { .. } => Verb::Table,
            Op::TableCreate { .. } => Verb::TableCreate,
            Op::TableDrop { .. } => Verb::TableDrop,
            Op::IndexCreate { .. } => Verb::IndexCreate,
            Op::IndexList => Verb::IndexList,
            Op::IndexWait => Verb::IndexWait,
            Op::Get { .. } => Verb::Get,
            Op::GetAll { .. } => Verb::GetAll,
            Op::Filter { .. } => Verb::Filter,
            Op::Insert { .. } => Verb::Insert,
            Op::Update { .. } => Verb::Update,
            Op::Delete => Verb::Delete,
            Op::Pluck { .. } => Verb::Pluck,
            Op::Without { .. } => Verb::Without,
            Op::Merge { .. } => Verb::Merge,
            Op::MapMerge { .. } => Verb::Map,
            Op::DoMerge { .. } => Verb::Do,
            Op::GetField { .. } => Verb::GetField,
            Op::Nth { .. } => Verb::Nth,
            Op::Count => Verb::Count,
            Op::OrderBy { .. } => Verb::OrderBy,
            Op::Limit { .. } => Verb::Limit,
            Op::Skip { .. } => Verb::Skip,
            Op::Changes => Verb::Changes,
        }
    }
}

/// An immutable query chain rooted at a table.
///
/// `shapes` always holds one more entry than `ops`: the shape before the
/// first operation (the expression root) followed by the shape after each
/// recorded operation.
#[derive(Debug, Clone)]
pub struct Chain {
    ops: Vec<Op>,
    shapes: Vec<Shape>,
    notes: BTreeMap<String, Value>,
}

impl Chain {
    /// Start a chain over a whole table.
    pub fn table(name: impl Into<String>) -> Self {
        Self {
            ops: vec![Op::Table { name: name.into() }],
            shapes: vec![Shape::Root, Shape::Table],
            notes: BTreeMap::new(),
        }
    }

    /// Start a table-creation chain.
    pub fn table_create(name: impl Into<String>) -> Self {
        Self {
            ops: vec![Op::TableCreate { name: name.into() }],
            shapes: vec![Shape::Root, Shape::Object],
            notes: BTreeMap::new(),
        }
    }

    /// Start a table-drop chain.
    pub fn table_drop(name: impl Into<String>) -> Self {
        Self {
            ops: vec![Op::TableDrop { name: name.into() }],
            shapes: vec![Shape::Root, Shape::Object],
            notes: BTreeMap::new(),
        }
    }

    /// The shape the chain would produce if run now.
    pub fn shape(&self) -> Shape {
        *self.shapes.last().unwrap_or(&Shape::Root)
    }

    /// The last verb applied, if any.
    pub fn last_verb(&self) -> Option<Verb> {
        self.ops.last().map(Op::verb)
    }

    /// Number of operations recorded so far.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Whether any recorded verb is a write or schema operation.
    pub fn has_write_or_ddl(&self) -> bool {
        self.ops
            .iter()
            .any(|op| op.verb().rejects_late_filter() || matches!(op, Op::Update { .. } | Op::Delete))
    }

    /// Read an annotation left on the chain.
    pub fn note(&self, key: &str) -> Option<&Value> {
        self.notes.get(key)
    }

    /// Return a copy of the chain carrying an extra annotation. Notes ride
    /// along through every later operation and survive filter splicing.
    pub fn with_note(&self, key: impl Into<String>, value: Value) -> Self {
        let mut next = self.clone();
        next.notes.insert(key.into(), value);
        next
    }

    fn push(&self, op: Op) -> Result<Self> {
        let from = self.shape();
        let verb = op.verb();
        let Some(to) = transition(from, verb) else {
            return Err(Error::Transition(TransitionError {
                shape: from.name(),
                verb: verb.name(),
            }));
        };
        let mut next = self.clone();
        next.ops.push(op);
        next.shapes.push(to);
        Ok(next)
    }

    pub fn get(&self, key: impl Into<Value>) -> Result<Self> {
        self.push(Op::Get {
            key: KeyExpr::literal(key),
        })
    }

    pub fn get_all(&self, keys: Vec<Value>, index: Option<String>) -> Result<Self> {
        self.push(Op::GetAll {
            keys: keys.into_iter().map(KeyExpr::Literal).collect(),
            index,
        })
    }

    pub fn filter(&self, predicate: Value) -> Result<Self> {
        self.push(Op::Filter { predicate })
    }

    pub fn insert(&self, documents: Vec<Value>) -> Result<Self> {
        self.push(Op::Insert { documents })
    }

    pub fn update(&self, patch: Value) -> Result<Self> {
        self.push(Op::Update { patch })
    }

    pub fn delete(&self) -> Result<Self> {
        self.push(Op::Delete)
    }

    pub fn pluck(&self, fields: Vec<String>) -> Result<Self> {
        self.push(Op::Pluck { fields })
    }

    pub fn without(&self, fields: Vec<String>) -> Result<Self> {
        self.push(Op::Without { fields })
    }

    pub fn merge(&self, document: Value) -> Result<Self> {
        self.push(Op::Merge { document })
    }

    /// Merge per-row sub-query results into every produced row.
    pub fn map_merge(&self, entries: Vec<MergeEntry>) -> Result<Self> {
        self.push(Op::MapMerge { entries })
    }

    /// Merge sub-query results into a single produced record. A null
    /// record passes through untouched.
    pub fn do_merge(&self, entries: Vec<MergeEntry>) -> Result<Self> {
        self.push(Op::DoMerge { entries })
    }

    pub fn get_field(&self, field: impl Into<String>) -> Result<Self> {
        self.push(Op::GetField {
            field: field.into(),
        })
    }

    pub fn nth(&self, index: i64) -> Result<Self> {
        self.push(Op::Nth { index })
    }

    pub fn count(&self) -> Result<Self> {
        self.push(Op::Count)
    }

    pub fn order_by(&self, field: impl Into<String>, descending: bool) -> Result<Self> {
        self.push(Op::OrderBy {
            field: field.into(),
            descending,
        })
    }

    pub fn limit(&self, count: u64) -> Result<Self> {
        self.push(Op::Limit { count })
    }

    pub fn skip(&self, count: u64) -> Result<Self> {
        self.push(Op::Skip { count })
    }

    pub fn changes(&self) -> Result<Self> {
        self.push(Op::Changes)
    }

    pub fn index_create(&self, index: IndexDef) -> Result<Self> {
        self.push(Op::IndexCreate { index })
    }

    pub fn index_list(&self) -> Result<Self> {
        self.push(Op::IndexList)
    }

    pub fn index_wait(&self) -> Result<Self> {
        self.push(Op::IndexWait)
    }

    /// Splice a filter in from the right.
    ///
    /// Walks the recorded shapes backwards to the last point where the
    /// chain still produced a filterable sequence and inserts the predicate
    /// there, so reductions and projections applied later still see only
    /// matching rows. Update and delete chains stay filterable, narrowing
    /// what they touch; chains containing an insert or schema verb (see
    /// [`Verb::rejects_late_filter`]) are returned unchanged.
    pub fn tap_filter_right(&self, predicate: Value) -> Self {
        if self.ops.iter().any(|op| op.verb().rejects_late_filter()) {
            return self.clone();
        }
        // A filter spliced after a projection could never see the fields it
        // matches on, so projection outputs are skipped even when their
        // shape is still filterable.
        let mut insert_at = None;
        for i in (0..self.shapes.len()).rev() {
            if i > 0 && matches!(self.ops[i - 1], Op::Pluck { .. } | Op::Without { .. }) {
                continue;
            }
            if self.shapes[i].is_filterable() {
                insert_at = Some(i);
                break;
            }
        }
        let Some(at) = insert_at else {
            return self.clone();
        };
        // shapes[at] is the state entering ops[at], so the filter lands
        // between ops[at - 1] and ops[at].
        let mut next = self.clone();
        let spliced = transition(self.shapes[at], Verb::Filter)
            .unwrap_or(self.shapes[at]);
        next.ops.insert(at, Op::Filter { predicate });
        next.shapes.insert(at + 1, spliced);
        next
    }

    /// Fold the recorded operations into an executable term tree.
    pub fn to_term(&self) -> Result<Term> {
        let mut ops = self.ops.iter();
        let mut term = match ops.next() {
            Some(Op::Table { name }) => Term::Table { name: name.clone() },
            Some(Op::TableCreate { name }) => Term::TableCreate { name: name.clone() },
            Some(Op::TableDrop { name }) => Term::TableDrop { name: name.clone() },
            Some(other) => {
                return Err(Error::Custom(format!(
                    "query chain must start at a table, not '{}'",
                    other.verb()
                )))
            }
            None => return Err(Error::Custom("empty query chain".into())),
        };
        for op in ops {
            let source = Box::new(term);
            term = match op.clone() {
                Op::Table { .. } | Op::TableCreate { .. } | Op::TableDrop { .. } => {
                    return Err(Error::Custom(
                        "table term in non-root position".into(),
                    ))
                }
                Op::IndexCreate { index } => Term::IndexCreate { source, index },
                Op::IndexList => Term::IndexList { source },
                Op::IndexWait => Term::IndexWait { source },
                Op::Get { key } => Term::Get { source, key },
                Op::GetAll { keys, index } => Term::GetAll { source, keys, index },
                Op::Filter { predicate } => Term::Filter { source, predicate },
                Op::Insert { documents } => Term::Insert { source, documents },
                Op::Update { patch } => Term::Update { source, patch },
                Op::Delete => Term::Delete { source },
                Op::Pluck { fields } => Term::Pluck { source, fields },
                Op::Without { fields } => Term::Without { source, fields },
                Op::Merge { document } => Term::Merge { source, document },
                Op::MapMerge { entries } => Term::MapMerge { source, entries },
                Op::DoMerge { entries } => Term::DoMerge { source, entries },
                Op::GetField { field } => Term::GetField { source, field },
                Op::Nth { index } => Term::Nth { source, index },
                Op::Count => Term::Count { source },
                Op::OrderBy { field, descending } => Term::OrderBy {
                    source,
                    field,
                    descending,
                },
                Op::Limit { count } => Term::Limit { source, count },
                Op::Skip { count } => Term::Skip { source, count },
                Op::Changes => Term::Changes { source },
            };
        }
        Ok(term)
    }
}
