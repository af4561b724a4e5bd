//! Relation expansion: compiling the relation graph into merge sub-queries.
//!
//! Populating turns relation metadata into per-row lookup terms that the
//! driver evaluates in one round trip. Single-valued relations become a
//! null-guarded point lookup; collections become index range lookups, with
//! a join-table hop for many-to-many.

use std::collections::{BTreeMap, BTreeSet};

use asupersync::{Cx, Outcome};
use serde_json::Value;

use docmodel_core::{Error, KeyExpr, MergeEntry, RawResult, Result, Term};

use crate::database::Database;
use crate::instance::Instance;
use crate::namespace::{Namespace, RelationRef};
use crate::try_outcome;

/// Which relations to expand, and how deep.
#[derive(Debug, Clone)]
pub enum PopulateSpec {
    /// Expand every relation, recursively. A model already expanded on the
    /// current path is still linked but not expanded again.
    All,
    /// Expand exactly the named relations, each with its own sub-spec.
    Tree(BTreeMap<String, PopulateSpec>),
    /// Expand this relation but nothing beneath it.
    Stop,
}

impl PopulateSpec {
    /// Expand the named relations one level deep.
    #[must_use]
    pub fn only(properties: &[&str]) -> Self {
        Self::Tree(
            properties
                .iter()
                .map(|&p| (p.to_string(), Self::Stop))
                .collect(),
        )
    }

    /// Add a named relation with a nested sub-spec.
    #[must_use]
    pub fn with(self, property: impl Into<String>, child: PopulateSpec) -> Self {
        let mut tree = match self {
            Self::Tree(tree) => tree,
            _ => BTreeMap::new(),
        };
        tree.insert(property.into(), child);
        Self::Tree(tree)
    }

    fn child(&self, property: &str) -> Option<&PopulateSpec> {
        match self {
            Self::All => Some(self),
            Self::Tree(tree) => tree.get(property),
            Self::Stop => None,
        }
    }
}

/// Compile the spec into merge entries against a model's relations, in
/// declaration-kind order: BelongsTo, HasOne, HasMany, ManyToMany.
///
/// `path` holds the model names currently being expanded; a relation back
/// into one of them is emitted without nesting, which is what keeps a
/// cyclic relation graph from expanding forever.
pub(crate) fn expansion_entries(
    db: &Database,
    namespace: &Namespace,
    spec: &PopulateSpec,
    path: &mut BTreeSet<String>,
) -> Result<Vec<MergeEntry>> {
    let mut entries = Vec::new();
    let properties: Vec<String> = namespace
        .belongs_to()
        .iter()
        .map(|r| r.property.clone())
        .chain(namespace.has_one().iter().map(|r| r.property.clone()))
        .chain(namespace.has_many().iter().map(|r| r.property.clone()))
        .chain(namespace.many_to_many().iter().map(|r| r.property.clone()))
        .collect();

    for property in properties {
        let Some(child) = spec.child(&property) else {
            continue;
        };
        let relation = namespace
            .relation(&property)
            .ok_or_else(|| Error::relation(namespace.model(), &property, "unknown relation"))?;

        let (target_model, lookup, single) = match relation {
            RelationRef::BelongsTo(rel) | RelationRef::HasOne(rel) => {
                let lookup = Term::Default {
                    source: Box::new(Term::Nth {
                        source: Box::new(Term::CoerceToArray {
                            source: Box::new(Term::GetAll {
                                source: Box::new(Term::table(&rel.target_model)),
                                keys: vec![KeyExpr::field(&rel.key)],
                                index: Some(rel.foreign_key.clone()),
                            }),
                        }),
                        index: 0,
                    }),
                    value: Value::Null,
                };
                (rel.target_model.clone(), lookup, true)
            }
            RelationRef::HasMany(rel) => {
                let lookup = Term::CoerceToArray {
                    source: Box::new(Term::GetAll {
                        source: Box::new(Term::table(&rel.target_model)),
                        keys: vec![KeyExpr::field("id")],
                        index: Some(rel.key.clone()),
                    }),
                };
                (rel.target_model.clone(), lookup, false)
            }
            RelationRef::ManyToMany(rel) => {
                let lookup = Term::CoerceToArray {
                    source: Box::new(Term::MapGet {
                        source: Box::new(Term::GetAll {
                            source: Box::new(Term::table(&rel.join_table)),
                            keys: vec![KeyExpr::field("id")],
                            index: Some(rel.my_key.clone()),
                        }),
                        table: rel.target_model.clone(),
                        field: rel.their_key.clone(),
                    }),
                };
                (rel.target_model.clone(), lookup, false)
            }
        };

        let nested = if path.contains(&target_model) {
            Vec::new()
        } else {
            let target_ns = db.namespace(&target_model)?;
            path.insert(target_model.clone());
            let nested = expansion_entries(db, &target_ns, child, path)?;
            path.remove(&target_model);
            nested
        };

        let term = if nested.is_empty() {
            lookup
        } else if single {
            Term::DoMerge {
                source: Box::new(lookup),
                entries: nested,
            }
        } else {
            Term::MapMerge {
                source: Box::new(lookup),
                entries: nested,
            }
        };
        entries.push(MergeEntry { property, term });
    }
    Ok(entries)
}

/// Expand relations of one persisted instance in place.
pub(crate) async fn populate(
    instance: &Instance,
    cx: &Cx,
    spec: &PopulateSpec,
) -> Outcome<(), Error> {
    let (db, namespace, id) = {
        let data = match instance.read() {
            Ok(data) => data,
            Err(err) => return Outcome::Err(err),
        };
        let model = data.namespace.model().to_string();
        let Some(id) = data.values.get("id").and_then(Value::as_str) else {
            return Outcome::Err(Error::NotPersisted {
                model,
                operation: "populate",
            });
        };
        (data.db.clone(), data.namespace.clone(), id.to_string())
    };

    let mut path = BTreeSet::from([namespace.model().to_string()]);
    let entries = match expansion_entries(&db, &namespace, spec, &mut path) {
        Ok(entries) => entries,
        Err(err) => return Outcome::Err(err),
    };
    if entries.is_empty() {
        return Outcome::Ok(());
    }

    let term = Term::DoMerge {
        source: Box::new(Term::Get {
            source: Box::new(Term::table(namespace.model())),
            key: KeyExpr::literal(id.clone()),
        }),
        entries,
    };
    let raw = try_outcome!(db.driver().execute(cx, &term).await);
    let document = match raw {
        RawResult::Atom(Value::Object(fields)) => fields,
        RawResult::Atom(Value::Null) => {
            return Outcome::Err(Error::driver(format!(
                "{} row '{id}' no longer exists",
                namespace.model()
            )));
        }
        other => {
            return Outcome::Err(Error::driver(format!(
                "unexpected populate result: {other:?}"
            )));
        }
    };

    // Cycles in the result hydrate back to this very instance.
    let mut cache = BTreeMap::from([(format!("{}{id}", namespace.model()), instance.clone())]);
    for (property, value) in document {
        let Some(relation) = namespace.relation(&property) else {
            continue;
        };
        let outcome = match relation {
            RelationRef::BelongsTo(rel) | RelationRef::HasOne(rel) => {
                attach_single(instance, &db, &rel.target_model, &property, value, &mut cache)
            }
            RelationRef::HasMany(rel) => {
                attach_many(instance, &db, &rel.target_model, &property, value, &mut cache)
            }
            RelationRef::ManyToMany(rel) => {
                attach_many(instance, &db, &rel.target_model, &property, value, &mut cache)
            }
        };
        if let Err(err) = outcome {
            return Outcome::Err(err);
        }
    }
    Outcome::Ok(())
}

fn attach_single(
    instance: &Instance,
    db: &Database,
    target_model: &str,
    property: &str,
    value: Value,
    cache: &mut BTreeMap<String, Instance>,
) -> Result<()> {
    if value.is_null() {
        instance.write()?.single_relations.remove(property);
        return Ok(());
    }
    let target_ns = db.namespace(target_model)?;
    let target = Instance::hydrate(db, &target_ns, value, cache)?;
    instance
        .write()?
        .single_relations
        .insert(property.to_string(), target);
    Ok(())
}

fn attach_many(
    instance: &Instance,
    db: &Database,
    target_model: &str,
    property: &str,
    value: Value,
    cache: &mut BTreeMap<String, Instance>,
) -> Result<()> {
    let Value::Array(items) = value else {
        return Err(Error::Serde(format!(
            "expected an array under '{property}', got {value}"
        )));
    };
    let target_ns = db.namespace(target_model)?;
    let targets = items
        .into_iter()
        .map(|item| Instance::hydrate(db, &target_ns, item, cache))
        .collect::<Result<Vec<_>>>()?;
    instance
        .write()?
        .many_relations
        .insert(property.to_string(), targets);
    Ok(())
}
