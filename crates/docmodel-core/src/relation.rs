//! Relation metadata.
//!
//! Models declare relations in raw form ([`RelationDecl`]); the registry
//! resolves them across all registered models into concrete descriptors with
//! synthesized key names, join tables, and indexes. Resolved descriptors are
//! immutable after `connect`.

use crate::schema::{capitalize, lcfirst};
use serde::{Deserialize, Serialize};

/// The kind of a declared relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationKind {
    /// This model stores a foreign key pointing at one target instance.
    HasOne,
    /// The owning direction of a HasOne; key naming is namespaced by the
    /// target model so several belongsTo relations to the same target do
    /// not collide.
    BelongsTo,
    /// The inverse side: the target model stores the foreign key. A pair of
    /// mutual HasMany declarations is reclassified as many-to-many during
    /// resolution.
    HasMany,
}

/// A raw relation declaration on a model definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationDecl {
    pub kind: RelationKind,
    /// The property name the related value is exposed under.
    pub property: String,
    /// The target model name.
    pub target_model: String,
    /// The target column the foreign key addresses (HasOne/BelongsTo).
    /// Defaults to `id`.
    pub foreign_key: String,
    /// The primary key used to derive the synthesized column (HasMany).
    /// Defaults to `id`.
    pub primary_key: String,
}

impl RelationDecl {
    /// Declare a HasOne relation.
    #[must_use]
    pub fn has_one(property: impl Into<String>, target_model: impl Into<String>) -> Self {
        Self {
            kind: RelationKind::HasOne,
            property: property.into(),
            target_model: target_model.into(),
            foreign_key: "id".to_string(),
            primary_key: "id".to_string(),
        }
    }

    /// Declare a BelongsTo relation.
    #[must_use]
    pub fn belongs_to(property: impl Into<String>, target_model: impl Into<String>) -> Self {
        Self {
            kind: RelationKind::BelongsTo,
            ..Self::has_one(property, target_model)
        }
    }

    /// Declare a HasMany relation.
    #[must_use]
    pub fn has_many(property: impl Into<String>, target_model: impl Into<String>) -> Self {
        Self {
            kind: RelationKind::HasMany,
            ..Self::has_one(property, target_model)
        }
    }

    /// Override the foreign key column (HasOne/BelongsTo).
    #[must_use]
    pub fn foreign_key(mut self, key: impl Into<String>) -> Self {
        self.foreign_key = key.into();
        self
    }

    /// Override the primary key (HasMany).
    #[must_use]
    pub fn primary_key(mut self, key: impl Into<String>) -> Self {
        self.primary_key = key.into();
        self
    }

    /// The synthesized key property name for a HasOne declaration:
    /// `<lcfirst(property)><Capitalize(foreignKey)>`.
    #[must_use]
    pub fn has_one_key(&self) -> String {
        format!("{}{}", lcfirst(&self.property), capitalize(&self.foreign_key))
    }

    /// The synthesized key property name for a BelongsTo declaration:
    /// `<lcfirst(targetModel)><Capitalize(property)><Capitalize(foreignKey)>`.
    #[must_use]
    pub fn belongs_to_key(&self) -> String {
        format!(
            "{}{}{}",
            lcfirst(&self.target_model),
            capitalize(&self.property),
            capitalize(&self.foreign_key)
        )
    }

    /// The synthesized foreign-key column name a plain HasMany puts on the
    /// target model: `<lcfirst(declaringModel)><Capitalize(primaryKey)>`.
    #[must_use]
    pub fn has_many_key(&self, declaring_model: &str) -> String {
        format!("{}{}", lcfirst(declaring_model), capitalize(&self.primary_key))
    }
}

/// A resolved single-valued relation (HasOne or BelongsTo).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleRelation {
    /// Property name the related instance is exposed under.
    pub property: String,
    /// The foreign-key column on the declaring model.
    pub key: String,
    /// The target column the key addresses (usually `id`).
    pub foreign_key: String,
    /// Target model name.
    pub target_model: String,
}

/// A resolved plain HasMany relation: the target model holds the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManyRelation {
    /// Property name the related collection is exposed under.
    pub property: String,
    /// The foreign-key column on the *target* model.
    pub key: String,
    /// Target model name.
    pub target_model: String,
}

/// A resolved many-to-many relation materialized via a join table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManyToManyRelation {
    /// Property name on the declaring model.
    pub property: String,
    /// Property name on the target model pointing back.
    pub foreign_property: String,
    /// Join-table column holding the declaring model's id.
    pub my_key: String,
    /// Join-table column holding the target model's id.
    pub their_key: String,
    /// Join table name (deterministic, independent of declaration order).
    pub join_table: String,
    /// Target model name.
    pub target_model: String,
}

/// Deterministic join table name for a many-to-many pair:
/// lexicographic sort of `<Model>_<property>` halves, joined by `__`.
#[must_use]
pub fn join_table_name(model_a: &str, property_a: &str, model_b: &str, property_b: &str) -> String {
    let mut halves = [
        format!("{model_a}_{property_a}"),
        format!("{model_b}_{property_b}"),
    ];
    halves.sort();
    halves.join("__")
}

/// Deterministic join-row id: sorted pair of ids joined by `_`.
///
/// Identical whichever side initiates the link, which makes link insertion
/// idempotent.
#[must_use]
pub fn join_row_id(id_a: &str, id_b: &str) -> String {
    let mut pair = [id_a, id_b];
    pair.sort_unstable();
    pair.join("_")
}
