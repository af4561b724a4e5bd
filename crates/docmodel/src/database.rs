//! The registry instance and its lifecycle.
//!
//! `Database` owns the driver and the model registry. Definitions are
//! registered up front; `connect` resolves the relation graph, synthesizes
//! foreign-key columns and join tables, issues DDL through the driver, and
//! runs model setup hooks. Everything after that goes through queries and
//! instances holding a cloned handle.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use asupersync::{Cx, Outcome};
use tracing::{debug, info};

use docmodel_core::{
    Driver, Error, IndexDef, ManyRelation, ManyToManyRelation, PropertyDef, RawResult,
    RegistrationErrorKind, RelationDecl, RelationKind, Result, SingleRelation, Term,
    join_table_name, lcfirst,
};

use crate::instance::Instance;
use crate::model::ModelDef;
use crate::namespace::Namespace;
use crate::query::ModelQuery;
use crate::try_outcome;

/// Object-safe driver facade so `Database` does not carry the driver type.
pub(crate) trait DynDriver: Send + Sync {
    fn ensure_table<'a>(
        &'a self,
        cx: &'a Cx,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Outcome<(), Error>> + Send + 'a>>;

    fn ensure_index<'a>(
        &'a self,
        cx: &'a Cx,
        table: &'a str,
        index: &'a IndexDef,
    ) -> Pin<Box<dyn Future<Output = Outcome<(), Error>> + Send + 'a>>;

    fn execute<'a>(
        &'a self,
        cx: &'a Cx,
        term: &'a Term,
    ) -> Pin<Box<dyn Future<Output = Outcome<RawResult, Error>> + Send + 'a>>;
}

impl<D: Driver> DynDriver for D {
    fn ensure_table<'a>(
        &'a self,
        cx: &'a Cx,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Outcome<(), Error>> + Send + 'a>> {
        Box::pin(Driver::ensure_table(self, cx, name))
    }

    fn ensure_index<'a>(
        &'a self,
        cx: &'a Cx,
        table: &'a str,
        index: &'a IndexDef,
    ) -> Pin<Box<dyn Future<Output = Outcome<(), Error>> + Send + 'a>> {
        Box::pin(Driver::ensure_index(self, cx, table, index))
    }

    fn execute<'a>(
        &'a self,
        cx: &'a Cx,
        term: &'a Term,
    ) -> Pin<Box<dyn Future<Output = Outcome<RawResult, Error>> + Send + 'a>> {
        Box::pin(Driver::execute(self, cx, term))
    }
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Create tables and indexes for registered models during `connect`.
    /// Disable when the schema is managed out of band; relation resolution
    /// still runs.
    pub auto_ddl: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { auto_ddl: true }
    }
}

#[derive(Default)]
struct Registry {
    pending: Vec<ModelDef>,
    namespaces: BTreeMap<String, Arc<Namespace>>,
    connected: bool,
}

pub(crate) struct Shared {
    driver: Box<dyn DynDriver>,
    config: DatabaseConfig,
    registry: RwLock<Registry>,
}

/// A handle on the registry and driver. Cheap to clone; all clones share
/// the same registry state.
#[derive(Clone)]
pub struct Database {
    inner: Arc<Shared>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

/// One physical table to create at connect, with its secondary indexes.
#[derive(Debug)]
struct TablePlan {
    table: String,
    indexes: Vec<IndexDef>,
}

impl Database {
    pub fn new(driver: impl Driver + 'static) -> Self {
        Self::with_config(driver, DatabaseConfig::default())
    }

    pub fn with_config(driver: impl Driver + 'static, config: DatabaseConfig) -> Self {
        Self {
            inner: Arc::new(Shared {
                driver: Box::new(driver),
                config,
                registry: RwLock::new(Registry::default()),
            }),
        }
    }

    pub(crate) fn driver(&self) -> &dyn DynDriver {
        self.inner.driver.as_ref()
    }

    /// Queue a model definition for resolution at [`connect`](Self::connect).
    pub fn register(&self, def: ModelDef) -> Result<()> {
        let mut registry = self.write_registry()?;
        if registry.connected {
            return Err(Error::registration(
                def.name(),
                RegistrationErrorKind::DuplicateModel,
                "models cannot be registered after connect",
            ));
        }
        if registry.pending.iter().any(|d| d.name() == def.name()) {
            return Err(Error::registration(
                def.name(),
                RegistrationErrorKind::DuplicateModel,
                format!("model '{}' is already registered", def.name()),
            ));
        }
        debug!(model = def.name(), "model registered");
        registry.pending.push(def);
        Ok(())
    }

    /// Resolve all registered definitions, create tables and indexes, and
    /// run setup hooks. Any failure aborts the connect and leaves the
    /// registry unconnected.
    #[tracing::instrument(level = "info", skip(self, cx))]
    pub async fn connect(&self, cx: &Cx) -> Outcome<(), Error> {
        let defs = {
            let mut registry = match self.write_registry() {
                Ok(registry) => registry,
                Err(err) => return Outcome::Err(err),
            };
            if registry.connected {
                return Outcome::Err(Error::Custom("database is already connected".into()));
            }
            std::mem::take(&mut registry.pending)
        };

        let (namespaces, plans) = match resolve(defs) {
            Ok(resolved) => resolved,
            Err(err) => return Outcome::Err(err),
        };

        if self.inner.config.auto_ddl {
            for plan in &plans {
                try_outcome!(self.inner.driver.ensure_table(cx, &plan.table).await);
                for index in &plan.indexes {
                    try_outcome!(self.inner.driver.ensure_index(cx, &plan.table, index).await);
                }
            }
        }

        for namespace in namespaces.values() {
            for hook in namespace.hooks() {
                if let Err(err) = hook.setup(namespace.model()) {
                    return Outcome::Err(err);
                }
            }
        }

        let mut registry = match self.write_registry() {
            Ok(registry) => registry,
            Err(err) => return Outcome::Err(err),
        };
        info!(models = namespaces.len(), tables = plans.len(), "connected");
        registry.namespaces = namespaces;
        registry.connected = true;
        Outcome::Ok(())
    }

    /// Drop the resolved registry. Queries and instances created before
    /// disconnect fail on their next namespace lookup.
    pub fn disconnect(&self) {
        if let Ok(mut registry) = self.inner.registry.write() {
            registry.namespaces.clear();
            registry.pending.clear();
            registry.connected = false;
            info!("disconnected");
        }
    }

    /// The resolved namespace of a model.
    pub fn namespace(&self, model: &str) -> Result<Arc<Namespace>> {
        let registry = self.read_registry()?;
        if !registry.connected {
            return Err(Error::registration(
                model,
                RegistrationErrorKind::NotConnected,
                "database is not connected",
            ));
        }
        registry.namespaces.get(model).cloned().ok_or_else(|| {
            Error::registration(
                model,
                RegistrationErrorKind::MissingTargetModel,
                format!("model '{model}' is not registered"),
            )
        })
    }

    /// A fresh, unpersisted instance of a model.
    pub fn create(&self, model: &str) -> Result<Instance> {
        let namespace = self.namespace(model)?;
        Ok(Instance::new(self.clone(), namespace))
    }

    /// A query rooted at the model's whole table.
    pub fn query(&self, model: &str) -> Result<ModelQuery> {
        let namespace = self.namespace(model)?;
        Ok(ModelQuery::new(self.clone(), namespace))
    }

    fn read_registry(&self) -> Result<std::sync::RwLockReadGuard<'_, Registry>> {
        self.inner
            .registry
            .read()
            .map_err(|_| Error::Custom("registry lock poisoned".into()))
    }

    fn write_registry(&self) -> Result<std::sync::RwLockWriteGuard<'_, Registry>> {
        self.inner
            .registry
            .write()
            .map_err(|_| Error::Custom("registry lock poisoned".into()))
    }
}

struct Draft {
    name: String,
    properties: Vec<PropertyDef>,
    indexes: Vec<IndexDef>,
    relations: Vec<RelationDecl>,
    hooks: Vec<Arc<dyn crate::hooks::ModelHooks>>,
    belongs_to: Vec<SingleRelation>,
    has_one: Vec<SingleRelation>,
    has_many: Vec<ManyRelation>,
    many_to_many: Vec<ManyToManyRelation>,
}

/// Add a synthesized foreign-key column plus its index. An identical
/// synthesized column from another relation is tolerated; colliding with a
/// hand-declared property is a registration error.
fn add_synthesized(draft: &mut Draft, key: &str) -> Result<()> {
    if let Some(existing) = draft.properties.iter().find(|p| p.name == key) {
        if existing.synthesized {
            return Ok(());
        }
        return Err(Error::registration(
            &draft.name,
            RegistrationErrorKind::KeyCollision,
            format!("synthesized key '{key}' collides with declared property"),
        ));
    }
    draft.properties.push(PropertyDef::foreign_key(key));
    draft.indexes.push(IndexDef::on(key));
    Ok(())
}

fn resolve(defs: Vec<ModelDef>) -> Result<(BTreeMap<String, Arc<Namespace>>, Vec<TablePlan>)> {
    let mut drafts: Vec<Draft> = Vec::with_capacity(defs.len());
    for def in defs {
        let (name, own_properties, relations, indexes, hooks) = def.into_parts();
        // Hook schema fragments first, own properties after; a later
        // declaration of the same name replaces the earlier one.
        let mut properties: Vec<PropertyDef> = Vec::new();
        let mut all_indexes: Vec<IndexDef> = Vec::new();
        for hook in &hooks {
            for property in hook.schema() {
                upsert_property(&mut properties, property);
            }
            all_indexes.extend(hook.indexes());
        }
        for property in own_properties {
            upsert_property(&mut properties, property);
        }
        all_indexes.extend(indexes);
        drafts.push(Draft {
            name,
            properties,
            indexes: all_indexes,
            relations,
            hooks,
            belongs_to: Vec::new(),
            has_one: Vec::new(),
            has_many: Vec::new(),
            many_to_many: Vec::new(),
        });
    }

    let index_of: BTreeMap<String, usize> = drafts
        .iter()
        .enumerate()
        .map(|(i, d)| (d.name.clone(), i))
        .collect();

    // Every relation target must itself be registered.
    for draft in &drafts {
        for relation in &draft.relations {
            if !index_of.contains_key(&relation.target_model) {
                return Err(Error::registration(
                    &draft.name,
                    RegistrationErrorKind::MissingTargetModel,
                    format!(
                        "relation '{}' targets unregistered model '{}'",
                        relation.property, relation.target_model
                    ),
                ));
            }
        }
    }

    // A HasMany pair pointing at each other is a many-to-many; the first
    // declared reverse relation wins when several could match.
    let mut consumed: BTreeSet<(usize, usize)> = BTreeSet::new();
    let mut join_tables: BTreeMap<String, Vec<IndexDef>> = BTreeMap::new();
    let mut resolved_m2m: Vec<(usize, ManyToManyRelation)> = Vec::new();
    for i in 0..drafts.len() {
        for a in 0..drafts[i].relations.len() {
            if drafts[i].relations[a].kind != RelationKind::HasMany || consumed.contains(&(i, a)) {
                continue;
            }
            let j = index_of[&drafts[i].relations[a].target_model];
            let reverse = drafts[j].relations.iter().enumerate().find(|(b, r)| {
                r.kind == RelationKind::HasMany
                    && r.target_model == drafts[i].name
                    && !consumed.contains(&(j, *b))
                    && !(i == j && a == *b)
            });
            let Some((b, _)) = reverse else { continue };
            consumed.insert((i, a));
            consumed.insert((j, b));

            let (model_a, prop_a) = (drafts[i].name.clone(), drafts[i].relations[a].property.clone());
            let (model_b, prop_b) = (drafts[j].name.clone(), drafts[j].relations[b].property.clone());
            let join_table = join_table_name(&model_a, &prop_a, &model_b, &prop_b);
            let key_a = format!("{}Id", lcfirst(&model_a));
            let key_b = format!("{}Id", lcfirst(&model_b));
            debug!(
                join_table = %join_table,
                left = %model_a, right = %model_b,
                "reclassified mutual hasMany as many-to-many"
            );
            join_tables
                .entry(join_table.clone())
                .or_insert_with(|| vec![IndexDef::on(key_a.clone()), IndexDef::on(key_b.clone())]);
            resolved_m2m.push((
                i,
                ManyToManyRelation {
                    property: prop_a.clone(),
                    foreign_property: prop_b.clone(),
                    my_key: key_a.clone(),
                    their_key: key_b.clone(),
                    join_table: join_table.clone(),
                    target_model: model_b.clone(),
                },
            ));
            resolved_m2m.push((
                j,
                ManyToManyRelation {
                    property: prop_b,
                    foreign_property: prop_a,
                    my_key: key_b,
                    their_key: key_a,
                    join_table,
                    target_model: model_a,
                },
            ));
        }
    }
    for (at, relation) in resolved_m2m {
        drafts[at].many_to_many.push(relation);
    }

    // Single-valued relations synthesize their key on the declaring model;
    // plain HasMany synthesizes the back-pointing key on the target.
    for i in 0..drafts.len() {
        for a in 0..drafts[i].relations.len() {
            let relation = drafts[i].relations[a].clone();
            match relation.kind {
                RelationKind::HasOne => {
                    let key = relation.has_one_key();
                    add_synthesized(&mut drafts[i], &key)?;
                    drafts[i].has_one.push(SingleRelation {
                        property: relation.property,
                        key,
                        foreign_key: relation.foreign_key,
                        target_model: relation.target_model,
                    });
                }
                RelationKind::BelongsTo => {
                    let key = relation.belongs_to_key();
                    add_synthesized(&mut drafts[i], &key)?;
                    drafts[i].belongs_to.push(SingleRelation {
                        property: relation.property,
                        key,
                        foreign_key: relation.foreign_key,
                        target_model: relation.target_model,
                    });
                }
                RelationKind::HasMany => {
                    if consumed.contains(&(i, a)) {
                        continue;
                    }
                    let key = relation.has_many_key(&drafts[i].name);
                    let j = index_of[&relation.target_model];
                    add_synthesized(&mut drafts[j], &key)?;
                    drafts[i].has_many.push(ManyRelation {
                        property: relation.property,
                        key,
                        target_model: relation.target_model,
                    });
                }
            }
        }
    }

    // Indexes may only reference declared (or synthesized) columns; the
    // head segment of a dotted path is what must exist.
    for draft in &drafts {
        for index in &draft.indexes {
            for path in &index.properties {
                let head = path.split('.').next().unwrap_or(path);
                if head != "id" && !draft.properties.iter().any(|p| p.name == head) {
                    return Err(Error::registration(
                        &draft.name,
                        RegistrationErrorKind::UnknownIndexProperty,
                        format!("index references undeclared property '{path}'"),
                    ));
                }
            }
        }
    }

    let mut namespaces = BTreeMap::new();
    let mut plans = Vec::new();
    for draft in drafts {
        plans.push(TablePlan {
            table: draft.name.clone(),
            indexes: draft.indexes.clone(),
        });
        namespaces.insert(
            draft.name.clone(),
            Arc::new(Namespace {
                model: draft.name,
                properties: draft.properties,
                indexes: draft.indexes,
                belongs_to: draft.belongs_to,
                has_one: draft.has_one,
                has_many: draft.has_many,
                many_to_many: draft.many_to_many,
                hooks: draft.hooks,
            }),
        );
    }
    for (table, indexes) in join_tables {
        plans.push(TablePlan { table, indexes });
    }
    Ok((namespaces, plans))
}

fn upsert_property(properties: &mut Vec<PropertyDef>, property: PropertyDef) {
    if let Some(existing) = properties.iter_mut().find(|p| p.name == property.name) {
        *existing = property;
    } else {
        properties.push(property);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docmodel_core::PropertyKind;

    fn def(name: &str) -> ModelDef {
        ModelDef::new(name).property(PropertyDef::new("name", PropertyKind::String))
    }

    #[test]
    fn has_one_synthesizes_key_on_declarer() {
        let character = def("Character").relation(RelationDecl::has_one("equippedWeapon", "Weapon"));
        let weapon = def("Weapon");
        let (namespaces, _) = resolve(vec![character, weapon]).unwrap();

        let ns = &namespaces["Character"];
        let key = ns.property("equippedWeaponId").expect("synthesized key");
        assert!(key.synthesized);
        assert!(key.allow_null);
        assert_eq!(ns.has_one()[0].key, "equippedWeaponId");
        assert!(ns.indexes().iter().any(|i| i.properties == ["equippedWeaponId"]));
    }

    #[test]
    fn belongs_to_key_carries_target_model_prefix() {
        let post = def("Post").relation(RelationDecl::belongs_to("author", "User"));
        let user = def("User");
        let (namespaces, _) = resolve(vec![post, user]).unwrap();
        assert_eq!(namespaces["Post"].belongs_to()[0].key, "userAuthorId");
        assert!(namespaces["Post"].property("userAuthorId").is_some());
    }

    #[test]
    fn plain_has_many_synthesizes_on_target() {
        let user = def("User").relation(RelationDecl::has_many("posts", "Post"));
        let post = def("Post");
        let (namespaces, _) = resolve(vec![user, post]).unwrap();
        assert_eq!(namespaces["User"].has_many()[0].key, "userId");
        assert!(namespaces["Post"].property("userId").is_some());
        assert!(namespaces["User"].property("userId").is_none());
    }

    #[test]
    fn mutual_has_many_becomes_many_to_many() {
        let post = def("Post").relation(RelationDecl::has_many("tags", "Tag"));
        let tag = def("Tag").relation(RelationDecl::has_many("posts", "Post"));
        let (namespaces, plans) = resolve(vec![post, tag]).unwrap();

        let m2m = &namespaces["Post"].many_to_many()[0];
        assert_eq!(m2m.join_table, "Post_tags__Tag_posts");
        assert_eq!(m2m.my_key, "postId");
        assert_eq!(m2m.their_key, "tagId");
        assert_eq!(m2m.foreign_property, "posts");
        assert_eq!(namespaces["Tag"].many_to_many()[0].their_key, "postId");

        // Neither side grows a synthesized hasMany key.
        assert!(namespaces["Post"].property("tagId").is_none());
        assert!(namespaces["Tag"].property("postId").is_none());

        let join_plan = plans
            .iter()
            .find(|p| p.table == "Post_tags__Tag_posts")
            .expect("join table planned");
        assert_eq!(join_plan.indexes.len(), 2);
    }

    #[test]
    fn missing_target_model_aborts_resolution() {
        let user = def("User").relation(RelationDecl::has_many("posts", "Post"));
        let err = resolve(vec![user]).unwrap_err();
        match err {
            Error::Registration(e) => {
                assert_eq!(e.kind, RegistrationErrorKind::MissingTargetModel);
            }
            other => panic!("expected registration error, got {other:?}"),
        }
    }

    #[test]
    fn synthesized_key_collision_with_declared_property_fails() {
        let character = def("Character")
            .property(PropertyDef::new("equippedWeaponId", PropertyKind::Number))
            .relation(RelationDecl::has_one("equippedWeapon", "Weapon"));
        let weapon = def("Weapon");
        let err = resolve(vec![character, weapon]).unwrap_err();
        match err {
            Error::Registration(e) => assert_eq!(e.kind, RegistrationErrorKind::KeyCollision),
            other => panic!("expected registration error, got {other:?}"),
        }
    }

    #[test]
    fn indexes_must_reference_declared_properties() {
        let user = def("User").index(IndexDef::on("ghost"));
        let err = resolve(vec![user]).unwrap_err();
        match err {
            Error::Registration(e) => {
                assert_eq!(e.kind, RegistrationErrorKind::UnknownIndexProperty);
            }
            other => panic!("expected registration error, got {other:?}"),
        }
    }

    #[test]
    fn hook_schema_fragments_flatten_with_last_wins() {
        struct Stamps;
        impl crate::hooks::ModelHooks for Stamps {
            fn schema(&self) -> Vec<PropertyDef> {
                vec![
                    PropertyDef::new("created", PropertyKind::Date),
                    PropertyDef::new("name", PropertyKind::Number),
                ]
            }
        }
        let user = ModelDef::new("User")
            .hooks(Arc::new(Stamps))
            .property(PropertyDef::new("name", PropertyKind::String));
        let (namespaces, _) = resolve(vec![user]).unwrap();
        let ns = &namespaces["User"];
        assert!(ns.property("created").is_some());
        // The model's own declaration came later and wins.
        assert_eq!(ns.property("name").unwrap().kind, PropertyKind::String);
    }
}
