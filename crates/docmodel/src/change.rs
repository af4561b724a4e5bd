//! Model-level change events.
//!
//! A [`ChangeCursor`] wraps the driver's raw feed and hydrates both sides
//! of each event into instances, so feed consumers work with the same
//! handle type the rest of the layer produces.

use std::collections::BTreeMap;
use std::sync::Arc;

use asupersync::{Cx, Outcome};
use serde_json::{Map, Value};

use docmodel_core::{ChangeFeed, Error, RawChange};

use crate::database::Database;
use crate::instance::Instance;
use crate::namespace::Namespace;
use crate::try_outcome;

/// One document transition observed on a feed.
pub struct Change {
    /// The document before the transition; `None` for an insert.
    pub old: Option<Instance>,
    /// The document after the transition; `None` for a delete.
    pub new: Option<Instance>,
    old_raw: Option<Value>,
    new_raw: Option<Value>,
    namespace: Arc<Namespace>,
}

impl std::fmt::Debug for Change {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Change")
            .field("model", &self.namespace.model())
            .field("old", &self.old_raw)
            .field("new", &self.new_raw)
            .finish()
    }
}

impl Change {
    /// The minimal document describing this transition.
    ///
    /// An insert yields the new document, a delete the old one. An update
    /// yields the id plus every schema column whose value changed.
    #[must_use]
    pub fn diff(&self) -> Value {
        match (&self.old_raw, &self.new_raw) {
            (_, None) => self.old_raw.clone().unwrap_or(Value::Null),
            (None, Some(new)) => new.clone(),
            (Some(old), Some(new)) => {
                let mut diff = Map::new();
                if let Some(id) = new.get("id") {
                    diff.insert("id".to_string(), id.clone());
                }
                for def in self.namespace.properties() {
                    let before = old.get(&def.name);
                    let after = new.get(&def.name);
                    if before != after {
                        diff.insert(
                            def.name.clone(),
                            after.cloned().unwrap_or(Value::Null),
                        );
                    }
                }
                Value::Object(diff)
            }
        }
    }
}

/// A live cursor of hydrated change events.
pub struct ChangeCursor {
    db: Database,
    namespace: Arc<Namespace>,
    feed: ChangeFeed,
}

impl std::fmt::Debug for ChangeCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeCursor")
            .field("model", &self.namespace.model())
            .finish_non_exhaustive()
    }
}

impl ChangeCursor {
    pub(crate) fn new(db: Database, namespace: Arc<Namespace>, feed: ChangeFeed) -> Self {
        Self { db, namespace, feed }
    }

    /// The next pending change, or `None` when nothing is queued or the
    /// feed is closed.
    pub async fn next(&mut self, cx: &Cx) -> Outcome<Option<Change>, Error> {
        let raw = try_outcome!(self.feed.next(cx).await);
        let Some(RawChange { old_val, new_val }) = raw else {
            return Outcome::Ok(None);
        };
        let change = match self.hydrate_change(old_val, new_val) {
            Ok(change) => change,
            Err(err) => return Outcome::Err(err),
        };
        Outcome::Ok(Some(change))
    }

    /// Close the underlying feed.
    pub fn close(&mut self) {
        self.feed.close();
    }

    fn hydrate_change(
        &self,
        old_val: Option<Value>,
        new_val: Option<Value>,
    ) -> Result<Change, Error> {
        let mut cache = BTreeMap::new();
        let old = old_val
            .clone()
            .filter(|v| !v.is_null())
            .map(|v| Instance::hydrate(&self.db, &self.namespace, v, &mut cache))
            .transpose()?;
        // The two sides stay distinct handles even for the same row.
        let mut cache = BTreeMap::new();
        let new = new_val
            .clone()
            .filter(|v| !v.is_null())
            .map(|v| Instance::hydrate(&self.db, &self.namespace, v, &mut cache))
            .transpose()?;
        Ok(Change {
            old,
            new,
            old_raw: old_val.filter(|v| !v.is_null()),
            new_raw: new_val.filter(|v| !v.is_null()),
            namespace: self.namespace.clone(),
        })
    }
}
