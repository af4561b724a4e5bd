//! Model instances: document rows with identity, dirty tracking, and an
//! in-memory relation graph.
//!
//! An `Instance` is a shared handle; clones observe the same state. Saving,
//! deleting, and populating live in sibling modules and work through the
//! `pub(crate)` accessors here.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use asupersync::{Cx, Outcome};
use serde_json::{Map, Value};
use tracing::debug;

use docmodel_core::{Error, KeyExpr, Result, Term};

use crate::database::Database;
use crate::namespace::{Namespace, RelationRef};
use crate::try_outcome;

pub(crate) struct InstanceData {
    pub db: Database,
    pub namespace: Arc<Namespace>,
    /// Current column values, coerced to their declared kinds.
    pub values: Map<String, Value>,
    /// Columns changed since the last flush, as an update patch.
    pub pending: Map<String, Value>,
    /// Prior values of pending columns, for failed-save diagnostics.
    pub old_values: Map<String, Value>,
    /// Assigned HasOne/BelongsTo targets, by relation property.
    pub single_relations: BTreeMap<String, Instance>,
    /// Assigned HasMany/ManyToMany targets, by relation property.
    pub many_relations: BTreeMap<String, Vec<Instance>>,
    /// Whether this instance is backed by a persisted row.
    pub saved: bool,
}

/// A handle on one document of a model. Cheap to clone; all clones share
/// state, so a save observed through one handle is visible through all.
#[derive(Clone)]
pub struct Instance {
    data: Arc<RwLock<InstanceData>>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.read() {
            Ok(data) => f
                .debug_struct("Instance")
                .field("model", &data.namespace.model())
                .field("id", &data.values.get("id"))
                .field("saved", &data.saved)
                .finish_non_exhaustive(),
            Err(_) => f.debug_struct("Instance").finish_non_exhaustive(),
        }
    }
}

impl Instance {
    pub(crate) fn new(db: Database, namespace: Arc<Namespace>) -> Self {
        Self {
            data: Arc::new(RwLock::new(InstanceData {
                db,
                namespace,
                values: Map::new(),
                pending: Map::new(),
                old_values: Map::new(),
                single_relations: BTreeMap::new(),
                many_relations: BTreeMap::new(),
                saved: false,
            })),
        }
    }

    /// Build an instance graph from a raw document.
    ///
    /// Relation properties found in the document become nested instances;
    /// `cache` keys instances by `<Model><id>` so a row appearing several
    /// times in one result (including through a cycle) hydrates once. The
    /// instance registers in the cache before its relations hydrate.
    pub(crate) fn hydrate(
        db: &Database,
        namespace: &Arc<Namespace>,
        document: Value,
        cache: &mut BTreeMap<String, Instance>,
    ) -> Result<Instance> {
        let Value::Object(mut fields) = document else {
            return Err(Error::Serde(format!(
                "expected a {} document, got {document}",
                namespace.model()
            )));
        };

        let cache_key = fields
            .get("id")
            .and_then(Value::as_str)
            .map(|id| format!("{}{id}", namespace.model()));
        if let Some(key) = &cache_key {
            if let Some(existing) = cache.get(key) {
                return Ok(existing.clone());
            }
        }

        let instance = Self::new(db.clone(), namespace.clone());
        if let Some(key) = cache_key {
            cache.insert(key, instance.clone());
        }

        let mut nested: Vec<(String, Value)> = Vec::new();
        fields.retain(|name, value| {
            if namespace.relation(name).is_some() {
                nested.push((name.clone(), value.take()));
                false
            } else {
                true
            }
        });

        {
            let mut data = instance.write()?;
            data.values = fields;
            data.saved = true;
        }

        for (property, value) in nested {
            if value.is_null() {
                continue;
            }
            let relation = namespace
                .relation(&property)
                .ok_or_else(|| Error::relation(namespace.model(), &property, "unknown relation"))?;
            match relation {
                RelationRef::BelongsTo(rel) | RelationRef::HasOne(rel) => {
                    let target_ns = db.namespace(&rel.target_model)?;
                    let target = Self::hydrate(db, &target_ns, value, cache)?;
                    instance.write()?.single_relations.insert(property, target);
                }
                RelationRef::HasMany(rel) => {
                    let target_ns = db.namespace(&rel.target_model)?;
                    let targets = hydrate_list(db, &target_ns, value, cache)?;
                    instance.write()?.many_relations.insert(property, targets);
                }
                RelationRef::ManyToMany(rel) => {
                    let target_ns = db.namespace(&rel.target_model)?;
                    let targets = hydrate_list(db, &target_ns, value, cache)?;
                    instance.write()?.many_relations.insert(property, targets);
                }
            }
        }
        Ok(instance)
    }

    /// The model name.
    pub fn model(&self) -> String {
        self.read()
            .map(|data| data.namespace.model().to_string())
            .unwrap_or_default()
    }

    /// The primary key, once assigned or adopted from an insert.
    pub fn id(&self) -> Option<String> {
        self.read()
            .ok()?
            .values
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// True until the first successful save.
    pub fn is_new(&self) -> bool {
        self.read().map(|data| !data.saved).unwrap_or(true)
    }

    /// Current value of a column.
    pub fn get(&self, property: &str) -> Option<Value> {
        self.read().ok()?.values.get(property).cloned()
    }

    /// Assign a column, coercing to its declared kind and recording the
    /// change for the next save.
    pub fn set(&self, property: &str, value: Value) -> Result<()> {
        let mut data = self.write()?;
        let coerced = if property == "id" {
            match value {
                Value::String(s) => Value::String(s),
                Value::Number(n) => Value::String(n.to_string()),
                other => return Err(Error::coercion("id", "string", &other)),
            }
        } else {
            if data.namespace.relation(property).is_some() {
                let model = data.namespace.model().to_string();
                return Err(Error::relation(
                    model,
                    property,
                    "relations are assigned through set_relation / add_relation",
                ));
            }
            let def = data.namespace.property(property).ok_or_else(|| {
                Error::relation(
                    data.namespace.model().to_string(),
                    property,
                    "property is not declared in the schema",
                )
            })?;
            def.coerce(Some(&value))?
        };

        if data.values.get(property) == Some(&coerced) {
            return Ok(());
        }
        let previous = data.values.get(property).cloned().unwrap_or(Value::Null);
        data.old_values.entry(property.to_string()).or_insert(previous);
        data.pending.insert(property.to_string(), coerced.clone());
        data.values.insert(property.to_string(), coerced);
        Ok(())
    }

    /// Assign many columns at once.
    pub fn assign(&self, document: Value) -> Result<()> {
        let Value::Object(fields) = document else {
            return Err(Error::Serde(format!("expected an object, got {document}")));
        };
        for (property, value) in fields {
            self.set(&property, value)?;
        }
        Ok(())
    }

    /// Attach a single-valued relation target (HasOne or BelongsTo).
    pub fn set_relation(&self, property: &str, target: &Instance) -> Result<()> {
        let mut data = self.write()?;
        let model = data.namespace.model().to_string();
        let target_model = match data.namespace.relation(property) {
            Some(RelationRef::BelongsTo(rel) | RelationRef::HasOne(rel)) => {
                rel.target_model.clone()
            }
            Some(_) => {
                return Err(Error::relation(
                    model,
                    property,
                    "collection relations take add_relation, not set_relation",
                ));
            }
            None => return Err(Error::relation(model, property, "unknown relation")),
        };
        if target.model() != target_model {
            return Err(Error::relation(
                model,
                property,
                format!("expected a {target_model} instance, got {}", target.model()),
            ));
        }
        data.single_relations.insert(property.to_string(), target.clone());
        Ok(())
    }

    /// Append a target to a collection relation (HasMany or ManyToMany).
    pub fn add_relation(&self, property: &str, target: &Instance) -> Result<()> {
        let mut data = self.write()?;
        let model = data.namespace.model().to_string();
        let target_model = match data.namespace.relation(property) {
            Some(RelationRef::HasMany(rel)) => rel.target_model.clone(),
            Some(RelationRef::ManyToMany(rel)) => rel.target_model.clone(),
            Some(_) => {
                return Err(Error::relation(
                    model,
                    property,
                    "single relations take set_relation, not add_relation",
                ));
            }
            None => return Err(Error::relation(model, property, "unknown relation")),
        };
        if target.model() != target_model {
            return Err(Error::relation(
                model,
                property,
                format!("expected a {target_model} instance, got {}", target.model()),
            ));
        }
        data.many_relations
            .entry(property.to_string())
            .or_default()
            .push(target.clone());
        Ok(())
    }

    /// Detach a relation target. For single relations the target argument
    /// is ignored; for collections the matching handle is removed.
    pub fn remove_relation(&self, property: &str, target: Option<&Instance>) -> Result<()> {
        let mut data = self.write()?;
        if data.single_relations.remove(property).is_some() {
            return Ok(());
        }
        if let Some(list) = data.many_relations.get_mut(property) {
            match target {
                Some(instance) => list.retain(|t| t.ptr() != instance.ptr()),
                None => list.clear(),
            }
            return Ok(());
        }
        let model = data.namespace.model().to_string();
        Err(Error::relation(model, property, "no relation assigned under this property"))
    }

    /// The assigned single-relation target, if any.
    pub fn relation_instance(&self, property: &str) -> Option<Instance> {
        self.read().ok()?.single_relations.get(property).cloned()
    }

    /// The assigned collection-relation targets.
    pub fn relation_list(&self, property: &str) -> Vec<Instance> {
        self.read()
            .ok()
            .and_then(|data| data.many_relations.get(property).cloned())
            .unwrap_or_default()
    }

    /// Serialize the instance and its assigned relation graph to JSON.
    ///
    /// Private columns are omitted. A relation edge pointing back into an
    /// instance already on the serialization path is skipped instead of
    /// recursing forever.
    pub fn to_value(&self) -> Result<Value> {
        let mut visited = HashSet::new();
        self.serialize_inner(&mut visited)
    }

    fn serialize_inner(&self, visited: &mut HashSet<usize>) -> Result<Value> {
        visited.insert(self.ptr());
        let (mut out, singles, manies) = {
            let data = self.read()?;
            let mut out = data.values.clone();
            for def in data.namespace.filter_schema(crate::namespace::SchemaFlag::Private) {
                out.remove(&def.name);
            }
            (
                out,
                data.single_relations.clone(),
                data.many_relations.clone(),
            )
        };
        for (property, target) in singles {
            if visited.contains(&target.ptr()) {
                continue;
            }
            out.insert(property, target.serialize_inner(visited)?);
        }
        for (property, targets) in manies {
            let mut items = Vec::with_capacity(targets.len());
            for target in targets {
                if visited.contains(&target.ptr()) {
                    continue;
                }
                items.push(target.serialize_inner(visited)?);
            }
            out.insert(property, Value::Array(items));
        }
        visited.remove(&self.ptr());
        Ok(Value::Object(out))
    }

    /// Re-fetch the backing row and replace local column values. Pending
    /// changes and assigned relations are discarded.
    pub async fn reload(&self, cx: &Cx) -> Outcome<(), Error> {
        let (db, table, id) = match self.persisted_identity("reload") {
            Ok(parts) => parts,
            Err(err) => return Outcome::Err(err),
        };
        let term = Term::Get {
            source: Box::new(Term::table(&table)),
            key: KeyExpr::literal(id.clone()),
        };
        let raw = try_outcome!(db.driver().execute(cx, &term).await);
        let document = match raw {
            docmodel_core::RawResult::Atom(Value::Object(fields)) => fields,
            docmodel_core::RawResult::Atom(Value::Null) => {
                return Outcome::Err(Error::driver(format!(
                    "{table} row '{id}' no longer exists"
                )));
            }
            other => {
                return Outcome::Err(Error::driver(format!(
                    "unexpected reload result: {other:?}"
                )));
            }
        };
        let outcome = self.write().map(|mut data| {
            data.values = document;
            data.pending.clear();
            data.old_values.clear();
            data.single_relations.clear();
            data.many_relations.clear();
            data.saved = true;
        });
        debug!(model = %table, id = %id, "reloaded");
        match outcome {
            Ok(()) => Outcome::Ok(()),
            Err(err) => Outcome::Err(err),
        }
    }

    /// Delete the backing row. The in-memory values survive, but the
    /// instance reverts to unsaved.
    pub async fn delete(&self, cx: &Cx) -> Outcome<(), Error> {
        let (db, table, id) = match self.persisted_identity("delete") {
            Ok(parts) => parts,
            Err(err) => return Outcome::Err(err),
        };
        let hooks = match self.read() {
            Ok(data) => data.namespace.hooks().to_vec(),
            Err(err) => return Outcome::Err(err),
        };
        // A soft-delete hook turns the delete into a save of its marker
        // column instead of a hard row removal.
        for hook in &hooks {
            match hook.before_delete(self) {
                Ok(true) => {}
                Ok(false) => return crate::save::save(self, cx).await,
                Err(err) => return Outcome::Err(err),
            }
        }
        let term = Term::Delete {
            source: Box::new(Term::Get {
                source: Box::new(Term::table(&table)),
                key: KeyExpr::literal(id.clone()),
            }),
        };
        let raw = try_outcome!(db.driver().execute(cx, &term).await);
        if let docmodel_core::RawResult::Write(result) = &raw {
            if result.errors > 0 {
                return Outcome::Err(Error::driver(
                    result.first_error.clone().unwrap_or_else(|| "delete failed".into()),
                ));
            }
        }
        debug!(model = %table, id = %id, "deleted");
        match self.write() {
            Ok(mut data) => {
                data.saved = false;
                Outcome::Ok(())
            }
            Err(err) => Outcome::Err(err),
        }
    }

    /// Persist this instance and its assigned relation graph.
    pub async fn save(&self, cx: &Cx) -> Outcome<(), Error> {
        crate::save::save(self, cx).await
    }

    /// Expand relation properties into the instance graph by query.
    pub async fn populate(&self, cx: &Cx, spec: &crate::populate::PopulateSpec) -> Outcome<(), Error> {
        crate::populate::populate(self, cx, spec).await
    }

    fn persisted_identity(&self, operation: &'static str) -> Result<(Database, String, String)> {
        let data = self.read()?;
        let model = data.namespace.model().to_string();
        let Some(id) = data.values.get("id").and_then(Value::as_str) else {
            return Err(Error::NotPersisted { model, operation });
        };
        Ok((data.db.clone(), model, id.to_string()))
    }

    pub(crate) fn ptr(&self) -> usize {
        Arc::as_ptr(&self.data) as usize
    }

    pub(crate) fn read(&self) -> Result<RwLockReadGuard<'_, InstanceData>> {
        self.data
            .read()
            .map_err(|_| Error::Custom("instance lock poisoned".into()))
    }

    pub(crate) fn write(&self) -> Result<RwLockWriteGuard<'_, InstanceData>> {
        self.data
            .write()
            .map_err(|_| Error::Custom("instance lock poisoned".into()))
    }
}

fn hydrate_list(
    db: &Database,
    namespace: &Arc<Namespace>,
    value: Value,
    cache: &mut BTreeMap<String, Instance>,
) -> Result<Vec<Instance>> {
    let Value::Array(items) = value else {
        return Err(Error::Serde(format!(
            "expected an array of {} documents, got {value}",
            namespace.model()
        )));
    };
    items
        .into_iter()
        .map(|item| Instance::hydrate(db, namespace, item, cache))
        .collect()
}
