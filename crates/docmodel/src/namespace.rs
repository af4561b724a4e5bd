//! Resolved per-model metadata.
//!
//! A `Namespace` is what a [`ModelDef`](crate::ModelDef) becomes after
//! connect-time resolution: flattened schema (own properties, hook
//! fragments, synthesized foreign keys), resolved relations sorted by
//! kind, and the ordered hook list.

use std::sync::Arc;

use docmodel_core::{
    IndexDef, ManyRelation, ManyToManyRelation, PropertyDef, SingleRelation,
};

use crate::hooks::ModelHooks;

/// Boolean schema flags [`Namespace::filter_schema`] can select on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaFlag {
    Unique,
    Private,
}

/// A resolved relation, borrowed from its namespace.
#[derive(Debug, Clone, Copy)]
pub enum RelationRef<'a> {
    BelongsTo(&'a SingleRelation),
    HasOne(&'a SingleRelation),
    HasMany(&'a ManyRelation),
    ManyToMany(&'a ManyToManyRelation),
}

pub struct Namespace {
    pub(crate) model: String,
    pub(crate) properties: Vec<PropertyDef>,
    pub(crate) indexes: Vec<IndexDef>,
    pub(crate) belongs_to: Vec<SingleRelation>,
    pub(crate) has_one: Vec<SingleRelation>,
    pub(crate) has_many: Vec<ManyRelation>,
    pub(crate) many_to_many: Vec<ManyToManyRelation>,
    pub(crate) hooks: Vec<Arc<dyn ModelHooks>>,
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("model", &self.model)
            .field("properties", &self.properties.len())
            .field("belongs_to", &self.belongs_to.len())
            .field("has_one", &self.has_one.len())
            .field("has_many", &self.has_many.len())
            .field("many_to_many", &self.many_to_many.len())
            .finish_non_exhaustive()
    }
}

impl Namespace {
    /// The model name; also the backing table name.
    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn properties(&self) -> &[PropertyDef] {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDef> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn indexes(&self) -> &[IndexDef] {
        &self.indexes
    }

    /// Schema entries whose given boolean flag is set.
    pub fn filter_schema(&self, flag: SchemaFlag) -> Vec<&PropertyDef> {
        self.properties
            .iter()
            .filter(|p| match flag {
                SchemaFlag::Unique => p.unique,
                SchemaFlag::Private => p.private,
            })
            .collect()
    }

    /// Look up the relation exposed under a property name.
    pub fn relation(&self, property: &str) -> Option<RelationRef<'_>> {
        if let Some(rel) = self.belongs_to.iter().find(|r| r.property == property) {
            return Some(RelationRef::BelongsTo(rel));
        }
        if let Some(rel) = self.has_one.iter().find(|r| r.property == property) {
            return Some(RelationRef::HasOne(rel));
        }
        if let Some(rel) = self.has_many.iter().find(|r| r.property == property) {
            return Some(RelationRef::HasMany(rel));
        }
        if let Some(rel) = self.many_to_many.iter().find(|r| r.property == property) {
            return Some(RelationRef::ManyToMany(rel));
        }
        None
    }

    pub fn belongs_to(&self) -> &[SingleRelation] {
        &self.belongs_to
    }

    pub fn has_one(&self) -> &[SingleRelation] {
        &self.has_one
    }

    pub fn has_many(&self) -> &[ManyRelation] {
        &self.has_many
    }

    pub fn many_to_many(&self) -> &[ManyToManyRelation] {
        &self.many_to_many
    }

    pub(crate) fn hooks(&self) -> &[Arc<dyn ModelHooks>] {
        &self.hooks
    }
}
