//! The recursive save algorithm.
//!
//! Saving an instance persists its assigned relation graph in dependency
//! order: BelongsTo targets first (their ids land in the owner's insert),
//! then the own row, then HasOne targets with a follow-up key update, then
//! HasMany children and ManyToMany join rows. A relation edge pointing at
//! an instance already on the save stack is deferred and flushed by the
//! root call once every row has an id, which is what lets mutual relations
//! save without looping.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;

use asupersync::{Cx, Outcome};
use serde_json::{Map, Value, json};
use tracing::debug;

use docmodel_core::{Error, KeyExpr, RawResult, Result, Term, WriteResult, join_row_id};

use crate::instance::Instance;
use crate::try_outcome;

/// A foreign-key assignment that could not happen during the recursive
/// walk because its target was still mid-save.
struct PendingLink {
    owner: Instance,
    key: String,
    target: Instance,
}

/// A join row whose other side was still mid-save.
struct PendingJoin {
    join_table: String,
    my_key: String,
    their_key: String,
    left: Instance,
    right: Instance,
}

#[derive(Default)]
struct SaveContext {
    /// Pointers of instances currently being saved, for cycle detection.
    stack: HashSet<usize>,
    links: Vec<PendingLink>,
    joins: Vec<PendingJoin>,
}

#[tracing::instrument(level = "debug", skip(instance, cx), fields(model = %instance.model()))]
pub(crate) async fn save(instance: &Instance, cx: &Cx) -> Outcome<(), Error> {
    let mut context = SaveContext::default();
    try_outcome!(save_inner(instance, cx, &mut context).await);

    // Every row now has an id; flush the deferred edges.
    for link in std::mem::take(&mut context.links) {
        let id = match link.target.id() {
            Some(id) => id,
            None => {
                return Outcome::Err(Error::Custom(format!(
                    "deferred relation target of {} was never assigned an id",
                    link.owner.model()
                )));
            }
        };
        if let Err(err) = link.owner.set(&link.key, json!(id)) {
            return Outcome::Err(err);
        }
        try_outcome!(flush_update(&link.owner, cx).await);
    }
    for join in std::mem::take(&mut context.joins) {
        try_outcome!(insert_join_row(cx, &join).await);
    }
    Outcome::Ok(())
}

fn save_inner<'a>(
    instance: &'a Instance,
    cx: &'a Cx,
    context: &'a mut SaveContext,
) -> Pin<Box<dyn Future<Output = Outcome<(), Error>> + Send + 'a>> {
    Box::pin(async move {
        if context.stack.contains(&instance.ptr()) {
            return Outcome::Ok(());
        }
        context.stack.insert(instance.ptr());

        let (namespace, hooks) = match instance.read() {
            Ok(data) => (data.namespace.clone(), data.namespace.hooks().to_vec()),
            Err(err) => return Outcome::Err(err),
        };
        for hook in &hooks {
            if let Err(err) = hook.before_save(instance) {
                return Outcome::Err(err);
            }
        }

        // BelongsTo targets first so the owner's insert already carries
        // their keys.
        for rel in namespace.belongs_to() {
            let Some(target) = instance.relation_instance(&rel.property) else {
                continue;
            };
            if context.stack.contains(&target.ptr()) {
                context.links.push(PendingLink {
                    owner: instance.clone(),
                    key: rel.key.clone(),
                    target,
                });
                continue;
            }
            try_outcome!(save_inner(&target, cx, context).await);
            let value = target.get(&rel.foreign_key).unwrap_or(Value::Null);
            if let Err(err) = instance.set(&rel.key, value) {
                return Outcome::Err(err);
            }
        }

        let was_new = instance.is_new();
        if was_new {
            for hook in &hooks {
                if let Err(err) = hook.before_create(instance) {
                    return Outcome::Err(err);
                }
            }
            try_outcome!(insert_own_row(instance, cx).await);
            for hook in &hooks {
                if let Err(err) = hook.after_create(instance) {
                    return Outcome::Err(err);
                }
            }
        } else {
            try_outcome!(flush_update(instance, cx).await);
        }

        // HasOne targets need their own id before the owner's key can be
        // written, so the key lands in a follow-up update.
        for rel in namespace.has_one() {
            let Some(target) = instance.relation_instance(&rel.property) else {
                continue;
            };
            if context.stack.contains(&target.ptr()) {
                context.links.push(PendingLink {
                    owner: instance.clone(),
                    key: rel.key.clone(),
                    target,
                });
                continue;
            }
            try_outcome!(save_inner(&target, cx, context).await);
            let value = target.get(&rel.foreign_key).unwrap_or(Value::Null);
            if let Err(err) = instance.set(&rel.key, value) {
                return Outcome::Err(err);
            }
            try_outcome!(flush_update(instance, cx).await);
        }

        // HasMany children point back via the key synthesized onto them.
        let own_id = instance.id();
        for rel in namespace.has_many() {
            for target in instance.relation_list(&rel.property) {
                let Some(id) = &own_id else {
                    return Outcome::Err(Error::Custom(format!(
                        "saved {} row has no id to hand to its children",
                        namespace.model()
                    )));
                };
                if let Err(err) = target.set(&rel.key, json!(id)) {
                    return Outcome::Err(err);
                }
                if context.stack.contains(&target.ptr()) {
                    continue;
                }
                try_outcome!(save_inner(&target, cx, context).await);
            }
        }

        for rel in namespace.many_to_many() {
            for target in instance.relation_list(&rel.property) {
                if context.stack.contains(&target.ptr()) {
                    context.joins.push(PendingJoin {
                        join_table: rel.join_table.clone(),
                        my_key: rel.my_key.clone(),
                        their_key: rel.their_key.clone(),
                        left: instance.clone(),
                        right: target,
                    });
                    continue;
                }
                try_outcome!(save_inner(&target, cx, context).await);
                let join = PendingJoin {
                    join_table: rel.join_table.clone(),
                    my_key: rel.my_key.clone(),
                    their_key: rel.their_key.clone(),
                    left: instance.clone(),
                    right: target,
                };
                try_outcome!(insert_join_row(cx, &join).await);
            }
        }

        for hook in &hooks {
            if let Err(err) = hook.after_save(instance) {
                return Outcome::Err(err);
            }
        }
        context.stack.remove(&instance.ptr());
        debug!(model = namespace.model(), new = was_new, "saved");
        Outcome::Ok(())
    })
}

/// Insert the instance's own row and adopt the generated id.
async fn insert_own_row(instance: &Instance, cx: &Cx) -> Outcome<(), Error> {
    let (db, table, document) = match prepare_insert(instance) {
        Ok(parts) => parts,
        Err(err) => return Outcome::Err(err),
    };
    let term = Term::Insert {
        source: Box::new(Term::table(&table)),
        documents: vec![Value::Object(document)],
    };
    let raw = try_outcome!(db.driver().execute(cx, &term).await);
    let result = match expect_write(raw) {
        Ok(result) => result,
        Err(err) => return Outcome::Err(err),
    };
    if result.errors > 0 {
        return Outcome::Err(Error::driver(
            result.first_error.unwrap_or_else(|| "insert failed".into()),
        ));
    }
    match instance.write() {
        Ok(mut data) => {
            if let Some(key) = result.generated_keys.first() {
                data.values.insert("id".to_string(), json!(key));
            }
            data.pending.clear();
            data.old_values.clear();
            data.saved = true;
            Outcome::Ok(())
        }
        Err(err) => Outcome::Err(err),
    }
}

fn prepare_insert(instance: &Instance) -> Result<(crate::database::Database, String, Map<String, Value>)> {
    let data = instance.read()?;
    let table = data.namespace.model().to_string();
    // Schema columns only; defaults fill in, required-but-absent errors out.
    let mut document = Map::new();
    if let Some(id) = data.values.get("id") {
        document.insert("id".to_string(), id.clone());
    }
    for def in data.namespace.properties() {
        let value = def.coerce(data.values.get(&def.name))?;
        document.insert(def.name.clone(), value);
    }
    Ok((data.db.clone(), table, document))
}

/// Push the pending patch as an update, if there is one.
async fn flush_update(instance: &Instance, cx: &Cx) -> Outcome<(), Error> {
    // The pending set survives until the write is acknowledged, so a
    // failed save still shows what was about to change.
    let (db, table, id, patch) = {
        let data = match instance.read() {
            Ok(data) => data,
            Err(err) => return Outcome::Err(err),
        };
        if data.pending.is_empty() {
            return Outcome::Ok(());
        }
        let Some(id) = data.values.get("id").and_then(Value::as_str).map(str::to_string) else {
            return Outcome::Err(Error::NotPersisted {
                model: data.namespace.model().to_string(),
                operation: "update",
            });
        };
        let patch = data.pending.clone();
        (data.db.clone(), data.namespace.model().to_string(), id, patch)
    };
    let term = Term::Update {
        source: Box::new(Term::Get {
            source: Box::new(Term::table(&table)),
            key: KeyExpr::literal(id),
        }),
        patch: Value::Object(patch),
    };
    let raw = try_outcome!(db.driver().execute(cx, &term).await);
    let result = match expect_write(raw) {
        Ok(result) => result,
        Err(err) => return Outcome::Err(err),
    };
    if result.errors > 0 {
        return Outcome::Err(Error::driver(
            result.first_error.unwrap_or_else(|| "update failed".into()),
        ));
    }
    match instance.write() {
        Ok(mut data) => {
            data.pending.clear();
            data.old_values.clear();
            Outcome::Ok(())
        }
        Err(err) => Outcome::Err(err),
    }
}

/// Insert one join row. The row id is the direction-independent pair id,
/// so re-linking the same pair hits the duplicate-key path and is treated
/// as already linked.
async fn insert_join_row(cx: &Cx, join: &PendingJoin) -> Outcome<(), Error> {
    let (db, left_id, right_id) = {
        let db = match join.left.read() {
            Ok(data) => data.db.clone(),
            Err(err) => return Outcome::Err(err),
        };
        let (Some(left_id), Some(right_id)) = (join.left.id(), join.right.id()) else {
            return Outcome::Err(Error::Custom(
                "both sides of a many-to-many link must be saved before linking".into(),
            ));
        };
        (db, left_id, right_id)
    };
    let mut row = Map::new();
    row.insert("id".to_string(), json!(join_row_id(&left_id, &right_id)));
    row.insert(join.my_key.clone(), json!(left_id));
    row.insert(join.their_key.clone(), json!(right_id));
    let term = Term::Insert {
        source: Box::new(Term::table(&join.join_table)),
        documents: vec![Value::Object(row)],
    };
    let raw = try_outcome!(db.driver().execute(cx, &term).await);
    let result = match expect_write(raw) {
        Ok(result) => result,
        Err(err) => return Outcome::Err(err),
    };
    if result.errors > 0 {
        let message = result.first_error.unwrap_or_else(|| "join insert failed".into());
        if message.contains("duplicate primary key") {
            // The pair is already linked.
            return Outcome::Ok(());
        }
        return Outcome::Err(Error::driver(message));
    }
    Outcome::Ok(())
}

fn expect_write(raw: RawResult) -> Result<WriteResult> {
    match raw {
        RawResult::Write(result) => Ok(result),
        other => Err(Error::driver(format!("expected a write result, got {other:?}"))),
    }
}
