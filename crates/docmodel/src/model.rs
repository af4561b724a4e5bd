//! Model definitions: the registration-time builder.

use std::sync::Arc;

use docmodel_core::{IndexDef, PropertyDef, RelationDecl};

use crate::hooks::ModelHooks;

/// A model declaration, accumulated through the builder and handed to
/// [`Database::register`](crate::Database::register). Schema fragments from
/// hooks are flattened in at registration; relation declarations are
/// resolved against every other registered model at connect time.
#[derive(Clone)]
pub struct ModelDef {
    name: String,
    properties: Vec<PropertyDef>,
    relations: Vec<RelationDecl>,
    indexes: Vec<IndexDef>,
    hooks: Vec<Arc<dyn ModelHooks>>,
}

impl std::fmt::Debug for ModelDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelDef")
            .field("name", &self.name)
            .field("properties", &self.properties.len())
            .field("relations", &self.relations.len())
            .field("indexes", &self.indexes.len())
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

impl ModelDef {
    /// Start a definition. The model name doubles as the table name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Vec::new(),
            relations: Vec::new(),
            indexes: Vec::new(),
            hooks: Vec::new(),
        }
    }

    /// Add a schema property.
    #[must_use]
    pub fn property(mut self, property: PropertyDef) -> Self {
        self.properties.push(property);
        self
    }

    /// Declare a relation to another model.
    #[must_use]
    pub fn relation(mut self, relation: RelationDecl) -> Self {
        self.relations.push(relation);
        self
    }

    /// Add a secondary index.
    #[must_use]
    pub fn index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }

    /// Attach a lifecycle hook. Hooks run in the order they were attached.
    #[must_use]
    pub fn hooks(mut self, hooks: Arc<dyn ModelHooks>) -> Self {
        self.hooks.push(hooks);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        String,
        Vec<PropertyDef>,
        Vec<RelationDecl>,
        Vec<IndexDef>,
        Vec<Arc<dyn ModelHooks>>,
    ) {
        (
            self.name,
            self.properties,
            self.relations,
            self.indexes,
            self.hooks,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docmodel_core::PropertyKind;

    #[test]
    fn builder_accumulates_in_order() {
        let def = ModelDef::new("User")
            .property(PropertyDef::new("name", PropertyKind::String))
            .property(PropertyDef::new("age", PropertyKind::Number))
            .relation(RelationDecl::has_many("posts", "Post"))
            .index(IndexDef::on("name"));

        assert_eq!(def.name(), "User");
        let (_, properties, relations, indexes, hooks) = def.into_parts();
        assert_eq!(properties.len(), 2);
        assert_eq!(properties[0].name, "name");
        assert_eq!(relations.len(), 1);
        assert_eq!(indexes.len(), 1);
        assert!(hooks.is_empty());
    }
}
