//! Model-scoped queries.
//!
//! A `ModelQuery` wraps a [`Chain`] rooted at the model's table and runs
//! it through the registry's driver, interpreting the raw result by the
//! chain's final shape. Relation expansion and `before_run` hook rewrites
//! are applied at run time, in that order, so a hook always sees the
//! finished chain.

use std::collections::BTreeMap;
use std::sync::Arc;

use asupersync::{Cx, Outcome};
use serde_json::Value;
use tracing::debug;

use docmodel_core::{Error, Result, WriteResult};
use docmodel_query::{Chain, Response, Shape, classify};

use crate::change::ChangeCursor;
use crate::database::Database;
use crate::instance::Instance;
use crate::namespace::Namespace;
use crate::populate::PopulateSpec;
use crate::try_outcome;

/// The interpreted result of a query run.
#[derive(Debug)]
pub enum QueryResult {
    /// A single document, or `None` when the selection was empty.
    One(Option<Instance>),
    /// A materialized sequence of documents.
    Many(Vec<Instance>),
    /// A live change subscription.
    Feed(ChangeCursor),
    /// A write acknowledgement.
    Write(WriteResult),
    /// A scalar or non-document value (counts, extracted fields).
    Raw(Value),
}

/// A query against one model.
pub struct ModelQuery {
    db: Database,
    namespace: Arc<Namespace>,
    chain: Chain,
    populate: Option<PopulateSpec>,
}

impl std::fmt::Debug for ModelQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelQuery")
            .field("model", &self.namespace.model())
            .field("ops", &self.chain.len())
            .finish_non_exhaustive()
    }
}

impl ModelQuery {
    pub(crate) fn new(db: Database, namespace: Arc<Namespace>) -> Self {
        let chain = Chain::table(namespace.model());
        Self {
            db,
            namespace,
            chain,
            populate: None,
        }
    }

    /// The chain's current result shape.
    #[must_use]
    pub fn shape(&self) -> Shape {
        self.chain.shape()
    }

    pub fn get(self, key: impl Into<Value>) -> Result<Self> {
        self.step(|chain| chain.get(key))
    }

    pub fn get_all(self, keys: Vec<Value>, index: Option<String>) -> Result<Self> {
        self.step(|chain| chain.get_all(keys, index))
    }

    pub fn filter(self, predicate: Value) -> Result<Self> {
        self.step(|chain| chain.filter(predicate))
    }

    pub fn insert(self, documents: Vec<Value>) -> Result<Self> {
        self.step(|chain| chain.insert(documents))
    }

    pub fn update(self, patch: Value) -> Result<Self> {
        self.step(|chain| chain.update(patch))
    }

    pub fn delete(self) -> Result<Self> {
        self.step(Chain::delete)
    }

    pub fn pluck(self, fields: Vec<String>) -> Result<Self> {
        self.step(|chain| chain.pluck(fields))
    }

    pub fn without(self, fields: Vec<String>) -> Result<Self> {
        self.step(|chain| chain.without(fields))
    }

    pub fn merge(self, document: Value) -> Result<Self> {
        self.step(|chain| chain.merge(document))
    }

    pub fn get_field(self, field: impl Into<String>) -> Result<Self> {
        self.step(|chain| chain.get_field(field))
    }

    pub fn nth(self, index: i64) -> Result<Self> {
        self.step(|chain| chain.nth(index))
    }

    pub fn count(self) -> Result<Self> {
        self.step(Chain::count)
    }

    pub fn order_by(self, field: impl Into<String>, descending: bool) -> Result<Self> {
        self.step(|chain| chain.order_by(field, descending))
    }

    pub fn limit(self, count: u64) -> Result<Self> {
        self.step(|chain| chain.limit(count))
    }

    pub fn skip(self, count: u64) -> Result<Self> {
        self.step(|chain| chain.skip(count))
    }

    pub fn changes(self) -> Result<Self> {
        self.step(Chain::changes)
    }

    /// Attach an advisory note hooks can read (and act on) at run time.
    #[must_use]
    pub fn with_note(mut self, key: impl Into<String>, value: Value) -> Self {
        self.chain = self.chain.with_note(key, value);
        self
    }

    /// Expand the given relations into every produced document.
    #[must_use]
    pub fn populate(mut self, spec: PopulateSpec) -> Self {
        self.populate = Some(spec);
        self
    }

    /// Execute the chain and interpret the result by its final shape.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(model = self.namespace.model()))]
    pub async fn run(self, cx: &Cx) -> Outcome<QueryResult, Error> {
        let mut chain = self.chain;

        if let Some(spec) = &self.populate {
            let mut path = std::collections::BTreeSet::from([self.namespace.model().to_string()]);
            let entries =
                match crate::populate::expansion_entries(&self.db, &self.namespace, spec, &mut path)
                {
                    Ok(entries) => entries,
                    Err(err) => return Outcome::Err(err),
                };
            if !entries.is_empty() {
                let merged = if chain.shape() == Shape::SingleSelection {
                    chain.do_merge(entries)
                } else {
                    chain.map_merge(entries)
                };
                chain = match merged {
                    Ok(chain) => chain,
                    Err(err) => return Outcome::Err(err),
                };
            }
        }

        for hook in self.namespace.hooks() {
            chain = hook.before_run(chain);
        }

        let term = match chain.to_term() {
            Ok(term) => term,
            Err(err) => return Outcome::Err(err),
        };
        debug!(ops = chain.len(), verb = ?chain.last_verb(), "executing chain");
        let raw = try_outcome!(self.db.driver().execute(cx, &term).await);
        let response = classify(chain.last_verb(), raw);
        let result = match response {
            Response::Record(document) => {
                let mut cache = BTreeMap::new();
                match Instance::hydrate(&self.db, &self.namespace, document, &mut cache) {
                    Ok(instance) => QueryResult::One(Some(instance)),
                    Err(err) => return Outcome::Err(err),
                }
            }
            Response::Records(rows) => {
                if rows.iter().all(Value::is_object) {
                    let mut cache = BTreeMap::new();
                    let mut instances = Vec::with_capacity(rows.len());
                    for row in rows {
                        match Instance::hydrate(&self.db, &self.namespace, row, &mut cache) {
                            Ok(instance) => instances.push(instance),
                            Err(err) => return Outcome::Err(err),
                        }
                    }
                    QueryResult::Many(instances)
                } else {
                    QueryResult::Raw(Value::Array(rows))
                }
            }
            Response::Feed(feed) => QueryResult::Feed(ChangeCursor::new(
                self.db.clone(),
                self.namespace.clone(),
                feed,
            )),
            Response::Write(result) => QueryResult::Write(result),
            Response::Atom(value) => QueryResult::Raw(value),
        };
        Outcome::Ok(result)
    }

    /// Run a chain expected to produce at most one document.
    pub async fn run_one(self, cx: &Cx) -> Outcome<Option<Instance>, Error> {
        match try_outcome!(self.run(cx).await) {
            QueryResult::One(instance) => Outcome::Ok(instance),
            QueryResult::Raw(Value::Null) => Outcome::Ok(None),
            other => Outcome::Err(Error::driver(format!(
                "expected a single record, got {other:?}"
            ))),
        }
    }

    /// Run a chain expected to produce a sequence of documents.
    pub async fn run_many(self, cx: &Cx) -> Outcome<Vec<Instance>, Error> {
        match try_outcome!(self.run(cx).await) {
            QueryResult::Many(instances) => Outcome::Ok(instances),
            QueryResult::One(Some(instance)) => Outcome::Ok(vec![instance]),
            QueryResult::One(None) | QueryResult::Raw(Value::Null) => Outcome::Ok(Vec::new()),
            other => Outcome::Err(Error::driver(format!(
                "expected a sequence of records, got {other:?}"
            ))),
        }
    }

    /// Run a chain ending in `changes`.
    pub async fn run_feed(self, cx: &Cx) -> Outcome<ChangeCursor, Error> {
        match try_outcome!(self.run(cx).await) {
            QueryResult::Feed(cursor) => Outcome::Ok(cursor),
            other => Outcome::Err(Error::driver(format!(
                "expected a change feed, got {other:?}"
            ))),
        }
    }

    /// Run a write chain and return its acknowledgement.
    pub async fn run_write(self, cx: &Cx) -> Outcome<WriteResult, Error> {
        match try_outcome!(self.run(cx).await) {
            QueryResult::Write(result) => Outcome::Ok(result),
            other => Outcome::Err(Error::driver(format!(
                "expected a write acknowledgement, got {other:?}"
            ))),
        }
    }

    fn step(mut self, op: impl FnOnce(&Chain) -> Result<Chain>) -> Result<Self> {
        self.chain = op(&self.chain)?;
        Ok(self)
    }
}
