//! An in-memory [`Driver`] implementation.
//!
//! Tables are plain ordered maps of JSON documents keyed by `id`. The
//! driver interprets the whole [`Term`] tree, including per-row merge
//! sub-queries and secondary-index lookups, and backs change feeds with
//! per-subscription event queues filled synchronously as writes land.
//!
//! Feeds are poll-based: [`ChangeFeed::next`] drains queued events and
//! resolves `None` when nothing is pending or the feed was closed.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use asupersync::{Cx, Outcome};
use serde_json::{Map, Value, json};
use tracing::{debug, trace};

use docmodel_core::{
    ChangeFeed, ChangeSource, Driver, Error, IndexDef, KeyExpr, RawChange, RawResult, Result,
    Term, WriteResult,
};

#[derive(Default)]
struct FeedState {
    events: VecDeque<RawChange>,
    closed: bool,
}

struct FeedHandle {
    /// Conjunction of row predicates; empty means every change matches.
    predicates: Vec<Value>,
    state: Arc<Mutex<FeedState>>,
}

#[derive(Default)]
struct TableData {
    docs: BTreeMap<String, Value>,
    indexes: BTreeMap<String, IndexDef>,
    feeds: Vec<FeedHandle>,
}

impl TableData {
    fn publish(&mut self, change: &RawChange) {
        self.feeds.retain(|feed| {
            let Ok(mut state) = feed.state.lock() else {
                return false;
            };
            if state.closed {
                return false;
            }
            let doc = change.new_val.as_ref().or(change.old_val.as_ref());
            let matches = doc.is_some_and(|doc| {
                feed.predicates
                    .iter()
                    .all(|pred| matches_predicate(doc, pred))
            });
            if matches {
                trace!(?change, "feed event queued");
                state.events.push_back(change.clone());
            }
            true
        });
    }
}

struct MemoryChangeSource {
    state: Arc<Mutex<FeedState>>,
}

impl ChangeSource for MemoryChangeSource {
    fn next_change<'a>(
        &'a mut self,
        _cx: &'a Cx,
    ) -> Pin<Box<dyn Future<Output = Outcome<Option<RawChange>, Error>> + Send + 'a>> {
        Box::pin(async move {
            match self.state.lock() {
                Ok(mut state) => Outcome::Ok(state.events.pop_front()),
                Err(_) => Outcome::Err(Error::driver("change feed mutex poisoned")),
            }
        })
    }

    fn close(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
            state.events.clear();
        }
    }
}

#[derive(Default)]
struct Store {
    tables: BTreeMap<String, TableData>,
    next_id: u64,
}

impl Store {
    fn table(&self, name: &str) -> Result<&TableData> {
        self.tables
            .get(name)
            .ok_or_else(|| Error::driver(format!("table '{name}' does not exist")))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut TableData> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| Error::driver(format!("table '{name}' does not exist")))
    }

    fn fresh_id(&mut self) -> String {
        self.next_id += 1;
        format!("{:08x}", self.next_id)
    }
}

/// What a sub-term evaluated to, before conversion to a [`RawResult`].
///
/// Addressable forms (`Table`, `Selection`, `Single`) keep the table name
/// and row ids so writes applied on top of them can mutate the store.
enum Evaluated {
    Table(String),
    Selection {
        table: String,
        ids: Vec<String>,
        predicates: Vec<Value>,
    },
    Single {
        table: String,
        id: String,
    },
    Rows(Vec<Value>),
    Atom(Value),
    Write(WriteResult),
    Feed(ChangeFeed),
}

/// A volatile driver keeping every document in process memory.
#[derive(Default)]
pub struct MemoryDriver {
    store: Arc<Mutex<Store>>,
}

impl MemoryDriver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Store>> {
        self.store
            .lock()
            .map_err(|_| Error::driver("memory store mutex poisoned"))
    }

    /// All documents of a table in id order. Missing tables yield an
    /// empty list. Intended for assertions in tests.
    #[must_use]
    pub fn dump(&self, table: &str) -> Vec<Value> {
        self.store
            .lock()
            .ok()
            .and_then(|store| {
                store
                    .tables
                    .get(table)
                    .map(|data| data.docs.values().cloned().collect())
            })
            .unwrap_or_default()
    }
}

impl Driver for MemoryDriver {
    fn ensure_table(
        &self,
        _cx: &Cx,
        name: &str,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        async move {
            let mut store = match self.lock() {
                Ok(store) => store,
                Err(err) => return Outcome::Err(err),
            };
            if !store.tables.contains_key(name) {
                debug!(table = name, "creating table");
                store.tables.insert(name.to_string(), TableData::default());
            }
            Outcome::Ok(())
        }
    }

    fn ensure_index(
        &self,
        _cx: &Cx,
        table: &str,
        index: &IndexDef,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        async move {
            let mut store = match self.lock() {
                Ok(store) => store,
                Err(err) => return Outcome::Err(err),
            };
            let name = match index.effective_name(table) {
                Ok(name) => name,
                Err(err) => return Outcome::Err(err),
            };
            let data = store
                .tables
                .entry(table.to_string())
                .or_insert_with(TableData::default);
            if !data.indexes.contains_key(&name) {
                debug!(table, index = %name, "creating index");
                data.indexes.insert(name, index.clone());
            }
            Outcome::Ok(())
        }
    }

    fn execute(
        &self,
        _cx: &Cx,
        term: &Term,
    ) -> impl Future<Output = Outcome<RawResult, Error>> + Send {
        async move {
            debug!(table = ?term.table_name(), "executing term");
            let mut store = match self.lock() {
                Ok(store) => store,
                Err(err) => return Outcome::Err(err),
            };
            let evaluated = match eval(&mut store, term, None) {
                Ok(evaluated) => evaluated,
                Err(err) => return Outcome::Err(err),
            };
            let raw = match evaluated {
                Evaluated::Atom(value) => RawResult::Atom(value),
                Evaluated::Single { table, id } => {
                    let doc = match store.table(&table) {
                        Ok(data) => data.docs.get(&id).cloned().unwrap_or(Value::Null),
                        Err(err) => return Outcome::Err(err),
                    };
                    RawResult::Atom(doc)
                }
                Evaluated::Write(result) => RawResult::Write(result),
                Evaluated::Feed(feed) => RawResult::Feed(feed),
                other => match materialize(&store, other) {
                    Ok(rows) => RawResult::Rows(rows),
                    Err(err) => return Outcome::Err(err),
                },
            };
            Outcome::Ok(raw)
        }
    }
}

fn resolve_key(key: &KeyExpr, row: Option<&Value>) -> Value {
    match key {
        KeyExpr::Literal(value) => value.clone(),
        KeyExpr::Field(name) => row
            .and_then(|row| row.get(name))
            .cloned()
            .unwrap_or(Value::Null),
    }
}

fn value_to_key(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(Error::driver(format!(
            "unsupported primary key type: {other}"
        ))),
    }
}

fn value_at_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Object predicate match. A null predicate value matches a field that is
/// null or absent; nested objects recurse; anything else compares equal.
fn matches_predicate(doc: &Value, predicate: &Value) -> bool {
    let Some(entries) = predicate.as_object() else {
        return doc == predicate;
    };
    entries.iter().all(|(key, expected)| {
        let actual = doc.get(key);
        match expected {
            Value::Null => actual.is_none_or(Value::is_null),
            Value::Object(_) => actual.is_some_and(|actual| matches_predicate(actual, expected)),
            other => actual == Some(other),
        }
    })
}

fn deep_merge(base: Value, patch: &Value) -> Value {
    match (base, patch) {
        (Value::Object(mut base), Value::Object(patch)) => {
            for (key, value) in patch {
                let merged = match base.remove(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value.clone(),
                };
                base.insert(key.clone(), merged);
            }
            Value::Object(base)
        }
        (_, patch) => patch.clone(),
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn cmp_values(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn index_key(doc: &Value, index: &IndexDef) -> Value {
    if index.properties.len() == 1 {
        value_at_path(doc, &index.properties[0])
            .cloned()
            .unwrap_or(Value::Null)
    } else {
        Value::Array(
            index
                .properties
                .iter()
                .map(|p| value_at_path(doc, p).cloned().unwrap_or(Value::Null))
                .collect(),
        )
    }
}

fn index_matches(doc: &Value, index: &IndexDef, key: &Value) -> bool {
    let value = index_key(doc, index);
    if index.multi {
        value.as_array().is_some_and(|items| items.contains(key))
    } else {
        &value == key
    }
}

/// The ids a write-capable evaluation addresses, with their table.
fn selected(store: &Store, evaluated: &Evaluated) -> Result<(String, Vec<String>)> {
    match evaluated {
        Evaluated::Table(name) => {
            let data = store.table(name)?;
            Ok((name.clone(), data.docs.keys().cloned().collect()))
        }
        Evaluated::Selection { table, ids, .. } => Ok((table.clone(), ids.clone())),
        Evaluated::Single { table, id } => Ok((table.clone(), vec![id.clone()])),
        _ => Err(Error::driver("write applied to a non-addressable source")),
    }
}

fn materialize(store: &Store, evaluated: Evaluated) -> Result<Vec<Value>> {
    match evaluated {
        Evaluated::Table(name) => Ok(store.table(&name)?.docs.values().cloned().collect()),
        Evaluated::Selection { table, ids, .. } => {
            let data = store.table(&table)?;
            Ok(ids
                .iter()
                .filter_map(|id| data.docs.get(id).cloned())
                .collect())
        }
        Evaluated::Rows(rows) => Ok(rows),
        Evaluated::Atom(Value::Array(items)) => Ok(items),
        Evaluated::Atom(Value::Null) => Ok(Vec::new()),
        Evaluated::Single { .. } | Evaluated::Atom(_) => {
            Err(Error::driver("single value used where a sequence is required"))
        }
        Evaluated::Write(_) | Evaluated::Feed(_) => {
            Err(Error::driver("write or feed used where a sequence is required"))
        }
    }
}

fn value_of(store: &Store, evaluated: Evaluated) -> Result<Value> {
    match evaluated {
        Evaluated::Atom(value) => Ok(value),
        Evaluated::Single { table, id } => Ok(store
            .table(&table)?
            .docs
            .get(&id)
            .cloned()
            .unwrap_or(Value::Null)),
        Evaluated::Rows(rows) => Ok(Value::Array(rows)),
        other @ (Evaluated::Table(_) | Evaluated::Selection { .. }) => {
            Ok(Value::Array(materialize(store, other)?))
        }
        Evaluated::Write(_) | Evaluated::Feed(_) => {
            Err(Error::driver("write or feed used where a value is required"))
        }
    }
}

fn merge_entries(
    store: &mut Store,
    record: Value,
    entries: &[docmodel_core::MergeEntry],
) -> Result<Value> {
    let mut merged = record;
    for entry in entries {
        let sub = eval(store, &entry.term, Some(&merged))?;
        let value = value_of(store, sub)?;
        if let Value::Object(map) = &mut merged {
            map.insert(entry.property.clone(), value);
        }
    }
    Ok(merged)
}

#[allow(clippy::too_many_lines)]
fn eval(store: &mut Store, term: &Term, row: Option<&Value>) -> Result<Evaluated> {
    match term {
        Term::Table { name } => {
            store.table(name)?;
            Ok(Evaluated::Table(name.clone()))
        }
        Term::TableCreate { name } => {
            if store.tables.contains_key(name) {
                return Err(Error::driver(format!("table '{name}' already exists")));
            }
            store.tables.insert(name.clone(), TableData::default());
            Ok(Evaluated::Atom(json!({ "tables_created": 1 })))
        }
        Term::TableDrop { name } => {
            store
                .tables
                .remove(name)
                .ok_or_else(|| Error::driver(format!("table '{name}' does not exist")))?;
            Ok(Evaluated::Atom(json!({ "tables_dropped": 1 })))
        }
        Term::TableList => Ok(Evaluated::Atom(Value::Array(
            store.tables.keys().cloned().map(Value::String).collect(),
        ))),
        Term::IndexCreate { source, index } => {
            let Evaluated::Table(table) = eval(store, source, row)? else {
                return Err(Error::driver("indexCreate requires a table"));
            };
            let name = index.effective_name(&table)?;
            let data = store.table_mut(&table)?;
            if data.indexes.contains_key(&name) {
                return Err(Error::driver(format!(
                    "index '{name}' already exists on table '{table}'"
                )));
            }
            data.indexes.insert(name, index.clone());
            Ok(Evaluated::Atom(json!({ "created": 1 })))
        }
        Term::IndexList { source } => {
            let Evaluated::Table(table) = eval(store, source, row)? else {
                return Err(Error::driver("indexList requires a table"));
            };
            let names: Vec<Value> = store
                .table(&table)?
                .indexes
                .keys()
                .map(|name| Value::String(name.clone()))
                .collect();
            Ok(Evaluated::Atom(Value::Array(names)))
        }
        Term::IndexWait { source } => {
            let Evaluated::Table(table) = eval(store, source, row)? else {
                return Err(Error::driver("indexWait requires a table"));
            };
            let ready: Vec<Value> = store
                .table(&table)?
                .indexes
                .keys()
                .map(|name| json!({ "index": name, "ready": true }))
                .collect();
            Ok(Evaluated::Atom(Value::Array(ready)))
        }
        Term::Get { source, key } => {
            let Evaluated::Table(table) = eval(store, source, row)? else {
                return Err(Error::driver("get requires a table"));
            };
            let id = value_to_key(&resolve_key(key, row))?;
            Ok(Evaluated::Single { table, id })
        }
        Term::GetAll { source, keys, index } => {
            let Evaluated::Table(table) = eval(store, source, row)? else {
                return Err(Error::driver("getAll requires a table"));
            };
            let keys: Vec<Value> = keys.iter().map(|k| resolve_key(k, row)).collect();
            let data = store.table(&table)?;
            let ids = match index.as_deref() {
                None | Some("id") => {
                    let mut ids = Vec::new();
                    for key in &keys {
                        let id = value_to_key(key)?;
                        if data.docs.contains_key(&id) {
                            ids.push(id);
                        }
                    }
                    ids
                }
                Some(name) => {
                    let index = data.indexes.get(name).ok_or_else(|| {
                        Error::driver(format!("index '{name}' not found on table '{table}'"))
                    })?;
                    data.docs
                        .iter()
                        .filter(|(_, doc)| keys.iter().any(|key| index_matches(doc, index, key)))
                        .map(|(id, _)| id.clone())
                        .collect()
                }
            };
            Ok(Evaluated::Selection {
                table,
                ids,
                predicates: Vec::new(),
            })
        }
        Term::Filter { source, predicate } => match eval(store, source, row)? {
            Evaluated::Table(table) => {
                let data = store.table(&table)?;
                let ids = data
                    .docs
                    .iter()
                    .filter(|(_, doc)| matches_predicate(doc, predicate))
                    .map(|(id, _)| id.clone())
                    .collect();
                Ok(Evaluated::Selection {
                    table,
                    ids,
                    predicates: vec![predicate.clone()],
                })
            }
            Evaluated::Selection {
                table,
                ids,
                mut predicates,
            } => {
                let data = store.table(&table)?;
                let ids = ids
                    .into_iter()
                    .filter(|id| {
                        data.docs
                            .get(id)
                            .is_some_and(|doc| matches_predicate(doc, predicate))
                    })
                    .collect();
                predicates.push(predicate.clone());
                Ok(Evaluated::Selection {
                    table,
                    ids,
                    predicates,
                })
            }
            other => {
                let rows = materialize(store, other)?;
                Ok(Evaluated::Rows(
                    rows.into_iter()
                        .filter(|doc| matches_predicate(doc, predicate))
                        .collect(),
                ))
            }
        },
        Term::Insert { source, documents } => {
            let Evaluated::Table(table) = eval(store, source, row)? else {
                return Err(Error::driver("insert requires a table"));
            };
            let mut result = WriteResult::default();
            for document in documents {
                let Some(fields) = document.as_object() else {
                    result.errors += 1;
                    result
                        .first_error
                        .get_or_insert_with(|| "inserted document is not an object".into());
                    continue;
                };
                let (id, generated) = match fields.get("id") {
                    Some(value) if !value.is_null() => (value_to_key(value)?, false),
                    _ => (store.fresh_id(), true),
                };
                let data = store.table_mut(&table)?;
                if data.docs.contains_key(&id) {
                    result.errors += 1;
                    result.first_error.get_or_insert_with(|| {
                        format!("duplicate primary key '{id}' in table '{table}'")
                    });
                    continue;
                }
                let mut doc = document.clone();
                if let Value::Object(map) = &mut doc {
                    map.insert("id".into(), Value::String(id.clone()));
                }
                data.docs.insert(id.clone(), doc.clone());
                data.publish(&RawChange {
                    old_val: None,
                    new_val: Some(doc),
                });
                result.inserted += 1;
                if generated {
                    result.generated_keys.push(id);
                }
            }
            Ok(Evaluated::Write(result))
        }
        Term::Update { source, patch } => {
            let evaluated = eval(store, source, row)?;
            let (table, ids) = selected(store, &evaluated)?;
            if !patch.is_object() {
                return Err(Error::driver("update patch must be an object"));
            }
            let mut result = WriteResult::default();
            let data = store.table_mut(&table)?;
            for id in ids {
                let Some(old) = data.docs.get(&id).cloned() else {
                    result.skipped += 1;
                    continue;
                };
                let new = deep_merge(old.clone(), patch);
                if new == old {
                    result.unchanged += 1;
                    continue;
                }
                data.docs.insert(id, new.clone());
                data.publish(&RawChange {
                    old_val: Some(old),
                    new_val: Some(new),
                });
                result.replaced += 1;
            }
            Ok(Evaluated::Write(result))
        }
        Term::Delete { source } => {
            let evaluated = eval(store, source, row)?;
            let (table, ids) = selected(store, &evaluated)?;
            let mut result = WriteResult::default();
            let data = store.table_mut(&table)?;
            for id in ids {
                let Some(old) = data.docs.remove(&id) else {
                    result.skipped += 1;
                    continue;
                };
                data.publish(&RawChange {
                    old_val: Some(old),
                    new_val: None,
                });
                result.deleted += 1;
            }
            Ok(Evaluated::Write(result))
        }
        Term::Pluck { source, fields } => {
            let evaluated = eval(store, source, row)?;
            let project = |doc: Value| -> Value {
                let Value::Object(map) = doc else { return doc };
                let mut kept = Map::new();
                for field in fields {
                    if let Some(value) = map.get(field) {
                        kept.insert(field.clone(), value.clone());
                    }
                }
                Value::Object(kept)
            };
            match evaluated {
                single @ Evaluated::Single { .. } => {
                    let value = value_of(store, single)?;
                    Ok(Evaluated::Atom(if value.is_null() {
                        value
                    } else {
                        project(value)
                    }))
                }
                Evaluated::Atom(value) if !value.is_array() => {
                    Ok(Evaluated::Atom(project(value)))
                }
                other => {
                    let rows = materialize(store, other)?;
                    Ok(Evaluated::Rows(rows.into_iter().map(project).collect()))
                }
            }
        }
        Term::Without { source, fields } => {
            let evaluated = eval(store, source, row)?;
            let strip = |doc: Value| -> Value {
                let Value::Object(mut map) = doc else { return doc };
                for field in fields {
                    map.remove(field);
                }
                Value::Object(map)
            };
            match evaluated {
                single @ (Evaluated::Single { .. } | Evaluated::Atom(_)) => {
                    let value = value_of(store, single)?;
                    Ok(Evaluated::Atom(strip(value)))
                }
                other => {
                    let rows = materialize(store, other)?;
                    Ok(Evaluated::Rows(rows.into_iter().map(strip).collect()))
                }
            }
        }
        Term::Merge { source, document } => {
            let evaluated = eval(store, source, row)?;
            match evaluated {
                single @ (Evaluated::Single { .. } | Evaluated::Atom(_)) => {
                    let value = value_of(store, single)?;
                    Ok(Evaluated::Atom(deep_merge(value, document)))
                }
                other => {
                    let rows = materialize(store, other)?;
                    Ok(Evaluated::Rows(
                        rows.into_iter()
                            .map(|doc| deep_merge(doc, document))
                            .collect(),
                    ))
                }
            }
        }
        Term::MapMerge { source, entries } => {
            let evaluated = eval(store, source, row)?;
            let rows = materialize(store, evaluated)?;
            let mut merged = Vec::with_capacity(rows.len());
            for record in rows {
                merged.push(merge_entries(store, record, entries)?);
            }
            Ok(Evaluated::Rows(merged))
        }
        Term::DoMerge { source, entries } => {
            let evaluated = eval(store, source, row)?;
            let record = value_of(store, evaluated)?;
            if record.is_null() {
                return Ok(Evaluated::Atom(Value::Null));
            }
            Ok(Evaluated::Atom(merge_entries(store, record, entries)?))
        }
        Term::MapGet {
            source,
            table,
            field,
        } => {
            let evaluated = eval(store, source, row)?;
            let rows = materialize(store, evaluated)?;
            let data = store.table(table)?;
            let mut looked_up = Vec::with_capacity(rows.len());
            for join_row in rows {
                let key = join_row.get(field.as_str()).cloned().unwrap_or(Value::Null);
                if key.is_null() {
                    continue;
                }
                let id = value_to_key(&key)?;
                if let Some(doc) = data.docs.get(&id) {
                    looked_up.push(doc.clone());
                }
            }
            Ok(Evaluated::Rows(looked_up))
        }
        Term::GetField { source, field } => {
            let evaluated = eval(store, source, row)?;
            let value = value_of(store, evaluated)?;
            Ok(Evaluated::Atom(
                value.get(field).cloned().unwrap_or(Value::Null),
            ))
        }
        Term::Nth { source, index } => {
            let evaluated = eval(store, source, row)?;
            let rows = materialize(store, evaluated)?;
            let position = if *index < 0 {
                rows.len() as i64 + index
            } else {
                *index
            };
            usize::try_from(position)
                .ok()
                .and_then(|at| rows.get(at).cloned())
                .map(Evaluated::Atom)
                .ok_or_else(|| Error::driver(format!("index {index} out of bounds")))
        }
        Term::Default { source, value } => {
            // default absorbs missing-value errors (out-of-range nth,
            // absent fields), not just nulls, matching the protocol term
            // it mirrors.
            let current = match eval(store, source, row) {
                Ok(evaluated) => value_of(store, evaluated).unwrap_or(Value::Null),
                Err(_) => Value::Null,
            };
            Ok(Evaluated::Atom(if current.is_null() {
                value.clone()
            } else {
                current
            }))
        }
        Term::CoerceToArray { source } => {
            let evaluated = eval(store, source, row)?;
            Ok(Evaluated::Rows(materialize(store, evaluated)?))
        }
        Term::Count { source } => {
            let evaluated = eval(store, source, row)?;
            let rows = materialize(store, evaluated)?;
            Ok(Evaluated::Atom(json!(rows.len())))
        }
        Term::OrderBy {
            source,
            field,
            descending,
        } => {
            let evaluated = eval(store, source, row)?;
            let mut rows = materialize(store, evaluated)?;
            rows.sort_by(|a, b| {
                let left = a.get(field).unwrap_or(&Value::Null);
                let right = b.get(field).unwrap_or(&Value::Null);
                let ordering = cmp_values(left, right);
                if *descending { ordering.reverse() } else { ordering }
            });
            Ok(Evaluated::Rows(rows))
        }
        Term::Limit { source, count } => {
            let evaluated = eval(store, source, row)?;
            let mut rows = materialize(store, evaluated)?;
            rows.truncate(usize::try_from(*count).unwrap_or(usize::MAX));
            Ok(Evaluated::Rows(rows))
        }
        Term::Skip { source, count } => {
            let evaluated = eval(store, source, row)?;
            let rows = materialize(store, evaluated)?;
            let skip = usize::try_from(*count).unwrap_or(usize::MAX).min(rows.len());
            Ok(Evaluated::Rows(rows[skip..].to_vec()))
        }
        Term::Changes { source } => {
            let (table, predicates) = match eval(store, source, row)? {
                Evaluated::Table(table) => (table, Vec::new()),
                Evaluated::Selection {
                    table, predicates, ..
                } => (table, predicates),
                Evaluated::Single { table, id } => {
                    (table, vec![json!({ "id": id })])
                }
                _ => return Err(Error::driver("changes requires an addressable source")),
            };
            let state = Arc::new(Mutex::new(FeedState::default()));
            store.table_mut(&table)?.feeds.push(FeedHandle {
                predicates,
                state: Arc::clone(&state),
            });
            Ok(Evaluated::Feed(ChangeFeed::new(Box::new(
                MemoryChangeSource { state },
            ))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;

    fn unwrap_outcome<T, E: std::fmt::Debug>(outcome: Outcome<T, E>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => panic!("unexpected error: {e:?}"),
            Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
            Outcome::Panicked(p) => panic!("panicked: {p:?}"),
        }
    }

    fn block_on<F: Future>(future: F) -> F::Output {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        rt.block_on(future)
    }

    fn seeded_driver(cx: &Cx) -> MemoryDriver {
        let driver = MemoryDriver::new();
        block_on(async {
            unwrap_outcome(driver.ensure_table(cx, "User").await);
            let insert = Term::Insert {
                source: Box::new(Term::table("User")),
                documents: vec![
                    json!({"id": "u1", "name": "ada", "age": 36}),
                    json!({"id": "u2", "name": "grace", "age": 45}),
                ],
            };
            unwrap_outcome(driver.execute(cx, &insert).await);
        });
        driver
    }

    #[test]
    fn insert_generates_ids_when_missing() {
        let cx = Cx::for_testing();
        block_on(async {
            let driver = MemoryDriver::new();
            unwrap_outcome(driver.ensure_table(&cx, "User").await);
            let insert = Term::Insert {
                source: Box::new(Term::table("User")),
                documents: vec![json!({"name": "ada"})],
            };
            let raw = unwrap_outcome(driver.execute(&cx, &insert).await);
            let RawResult::Write(result) = raw else {
                panic!("expected write result");
            };
            assert_eq!(result.inserted, 1);
            assert_eq!(result.generated_keys.len(), 1);

            let docs = driver.dump("User");
            assert_eq!(docs.len(), 1);
            assert_eq!(
                docs[0].get("id").and_then(Value::as_str),
                Some(result.generated_keys[0].as_str())
            );
        });
    }

    #[test]
    fn duplicate_primary_key_is_a_write_error() {
        let cx = Cx::for_testing();
        let driver = seeded_driver(&cx);
        block_on(async {
            let insert = Term::Insert {
                source: Box::new(Term::table("User")),
                documents: vec![json!({"id": "u1", "name": "other"})],
            };
            let raw = unwrap_outcome(driver.execute(&cx, &insert).await);
            let RawResult::Write(result) = raw else {
                panic!("expected write result");
            };
            assert_eq!(result.errors, 1);
            assert!(result.first_error.as_deref().unwrap().contains("u1"));
        });
    }

    #[test]
    fn table_list_names_every_table() {
        let cx = Cx::for_testing();
        let driver = seeded_driver(&cx);
        block_on(async {
            unwrap_outcome(driver.ensure_table(&cx, "Post").await);
            let raw = unwrap_outcome(driver.execute(&cx, &Term::TableList).await);
            let RawResult::Atom(Value::Array(names)) = raw else {
                panic!("expected an array of table names");
            };
            let mut names: Vec<&str> = names.iter().filter_map(Value::as_str).collect();
            names.sort_unstable();
            assert_eq!(names, ["Post", "User"]);
        });
    }

    #[test]
    fn get_returns_null_for_missing_rows() {
        let cx = Cx::for_testing();
        let driver = seeded_driver(&cx);
        block_on(async {
            let get = Term::Get {
                source: Box::new(Term::table("User")),
                key: KeyExpr::literal("u1"),
            };
            let raw = unwrap_outcome(driver.execute(&cx, &get).await);
            assert_eq!(
                raw.as_atom().and_then(|v| v.get("name")),
                Some(&json!("ada"))
            );

            let missing = Term::Get {
                source: Box::new(Term::table("User")),
                key: KeyExpr::literal("nope"),
            };
            let raw = unwrap_outcome(driver.execute(&cx, &missing).await);
            assert_eq!(raw.as_atom(), Some(&Value::Null));
        });
    }

    #[test]
    fn get_all_uses_secondary_indexes() {
        let cx = Cx::for_testing();
        let driver = seeded_driver(&cx);
        block_on(async {
            unwrap_outcome(driver.ensure_index(&cx, "User", &IndexDef::on("name")).await);
            let get_all = Term::GetAll {
                source: Box::new(Term::table("User")),
                keys: vec![KeyExpr::literal("grace")],
                index: Some("name".into()),
            };
            let raw = unwrap_outcome(driver.execute(&cx, &get_all).await);
            let rows = raw.as_rows().unwrap();
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].get("id"), Some(&json!("u2")));
        });
    }

    #[test]
    fn filter_null_matches_absent_fields() {
        let cx = Cx::for_testing();
        let driver = seeded_driver(&cx);
        block_on(async {
            let filter = Term::Filter {
                source: Box::new(Term::table("User")),
                predicate: json!({"deletedAt": null}),
            };
            let raw = unwrap_outcome(driver.execute(&cx, &filter).await);
            assert_eq!(raw.as_rows().map(<[Value]>::len), Some(2));
        });
    }

    #[test]
    fn update_counts_unchanged_rows() {
        let cx = Cx::for_testing();
        let driver = seeded_driver(&cx);
        block_on(async {
            let update = Term::Update {
                source: Box::new(Term::Get {
                    source: Box::new(Term::table("User")),
                    key: KeyExpr::literal("u1"),
                }),
                patch: json!({"name": "ada"}),
            };
            let raw = unwrap_outcome(driver.execute(&cx, &update).await);
            let RawResult::Write(result) = raw else {
                panic!("expected write result");
            };
            assert_eq!(result.unchanged, 1);
            assert_eq!(result.replaced, 0);

            let update = Term::Update {
                source: Box::new(Term::Get {
                    source: Box::new(Term::table("User")),
                    key: KeyExpr::literal("u1"),
                }),
                patch: json!({"age": 37}),
            };
            let raw = unwrap_outcome(driver.execute(&cx, &update).await);
            let RawResult::Write(result) = raw else {
                panic!("expected write result");
            };
            assert_eq!(result.replaced, 1);
        });
    }

    #[test]
    fn order_by_limit_and_nth() {
        let cx = Cx::for_testing();
        let driver = seeded_driver(&cx);
        block_on(async {
            let term = Term::Nth {
                source: Box::new(Term::OrderBy {
                    source: Box::new(Term::table("User")),
                    field: "age".into(),
                    descending: true,
                }),
                index: 0,
            };
            let raw = unwrap_outcome(driver.execute(&cx, &term).await);
            assert_eq!(
                raw.as_atom().and_then(|v| v.get("name")),
                Some(&json!("grace"))
            );

            let term = Term::Limit {
                source: Box::new(Term::OrderBy {
                    source: Box::new(Term::table("User")),
                    field: "age".into(),
                    descending: false,
                }),
                count: 1,
            };
            let raw = unwrap_outcome(driver.execute(&cx, &term).await);
            let rows = raw.as_rows().unwrap();
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].get("name"), Some(&json!("ada")));
        });
    }

    #[test]
    fn map_merge_resolves_per_row_fields() {
        let cx = Cx::for_testing();
        let driver = seeded_driver(&cx);
        block_on(async {
            unwrap_outcome(driver.ensure_table(&cx, "Post").await);
            unwrap_outcome(
                driver
                    .ensure_index(&cx, "Post", &IndexDef::on("authorId"))
                    .await,
            );
            let insert = Term::Insert {
                source: Box::new(Term::table("Post")),
                documents: vec![
                    json!({"id": "p1", "authorId": "u1", "title": "one"}),
                    json!({"id": "p2", "authorId": "u1", "title": "two"}),
                    json!({"id": "p3", "authorId": "u2", "title": "three"}),
                ],
            };
            unwrap_outcome(driver.execute(&cx, &insert).await);

            let term = Term::MapMerge {
                source: Box::new(Term::table("User")),
                entries: vec![docmodel_core::MergeEntry {
                    property: "posts".into(),
                    term: Term::CoerceToArray {
                        source: Box::new(Term::GetAll {
                            source: Box::new(Term::table("Post")),
                            keys: vec![KeyExpr::field("id")],
                            index: Some("authorId".into()),
                        }),
                    },
                }],
            };
            let raw = unwrap_outcome(driver.execute(&cx, &term).await);
            let rows = raw.as_rows().unwrap();
            assert_eq!(rows.len(), 2);
            let ada = rows.iter().find(|r| r.get("id") == Some(&json!("u1"))).unwrap();
            assert_eq!(ada.get("posts").and_then(Value::as_array).map(Vec::len), Some(2));
            let grace = rows.iter().find(|r| r.get("id") == Some(&json!("u2"))).unwrap();
            assert_eq!(grace.get("posts").and_then(Value::as_array).map(Vec::len), Some(1));
        });
    }

    #[test]
    fn do_merge_passes_null_through() {
        let cx = Cx::for_testing();
        let driver = seeded_driver(&cx);
        block_on(async {
            let term = Term::DoMerge {
                source: Box::new(Term::Get {
                    source: Box::new(Term::table("User")),
                    key: KeyExpr::literal("missing"),
                }),
                entries: vec![docmodel_core::MergeEntry {
                    property: "anything".into(),
                    term: Term::table("User"),
                }],
            };
            let raw = unwrap_outcome(driver.execute(&cx, &term).await);
            assert_eq!(raw.as_atom(), Some(&Value::Null));
        });
    }

    #[test]
    fn change_feed_delivers_inserts_updates_and_deletes() {
        let cx = Cx::for_testing();
        let driver = seeded_driver(&cx);
        block_on(async {
            let changes = Term::Changes {
                source: Box::new(Term::table("User")),
            };
            let raw = unwrap_outcome(driver.execute(&cx, &changes).await);
            let RawResult::Feed(mut feed) = raw else {
                panic!("expected a feed");
            };

            let insert = Term::Insert {
                source: Box::new(Term::table("User")),
                documents: vec![json!({"id": "u3", "name": "lin"})],
            };
            unwrap_outcome(driver.execute(&cx, &insert).await);

            let change = unwrap_outcome(feed.next(&cx).await).expect("pending change");
            assert!(change.old_val.is_none());
            assert_eq!(
                change.new_val.as_ref().and_then(|v| v.get("name")),
                Some(&json!("lin"))
            );

            let delete = Term::Delete {
                source: Box::new(Term::Get {
                    source: Box::new(Term::table("User")),
                    key: KeyExpr::literal("u3"),
                }),
            };
            unwrap_outcome(driver.execute(&cx, &delete).await);

            let change = unwrap_outcome(feed.next(&cx).await).expect("pending change");
            assert!(change.new_val.is_none());

            feed.close();
            assert!(unwrap_outcome(feed.next(&cx).await).is_none());
        });
    }

    #[test]
    fn single_selection_feed_only_sees_its_row() {
        let cx = Cx::for_testing();
        let driver = seeded_driver(&cx);
        block_on(async {
            let changes = Term::Changes {
                source: Box::new(Term::Get {
                    source: Box::new(Term::table("User")),
                    key: KeyExpr::literal("u1"),
                }),
            };
            let raw = unwrap_outcome(driver.execute(&cx, &changes).await);
            let RawResult::Feed(mut feed) = raw else {
                panic!("expected a feed");
            };

            let update_other = Term::Update {
                source: Box::new(Term::Get {
                    source: Box::new(Term::table("User")),
                    key: KeyExpr::literal("u2"),
                }),
                patch: json!({"age": 46}),
            };
            unwrap_outcome(driver.execute(&cx, &update_other).await);
            assert!(unwrap_outcome(feed.next(&cx).await).is_none());

            let update_mine = Term::Update {
                source: Box::new(Term::Get {
                    source: Box::new(Term::table("User")),
                    key: KeyExpr::literal("u1"),
                }),
                patch: json!({"age": 37}),
            };
            unwrap_outcome(driver.execute(&cx, &update_mine).await);
            let change = unwrap_outcome(feed.next(&cx).await).expect("pending change");
            assert_eq!(
                change.new_val.as_ref().and_then(|v| v.get("age")),
                Some(&json!(37))
            );
        });
    }
}
