//! The driver trait: the external execution collaborator.
//!
//! This layer never talks to a backend directly; it hands a [`Term`] to a
//! `Driver` and interprets what comes back. All operations are async, take a
//! `Cx` capability context, and return `Outcome` for cancel-correctness.
//!
//! DDL helpers (`ensure_table` / `ensure_index`) are idempotent
//! create-if-missing operations with a "wait until ready" barrier, safe
//! under concurrent duplicate registration attempts.

use crate::error::Error;
use crate::schema::IndexDef;
use crate::term::Term;
use asupersync::{Cx, Outcome};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;

/// A write acknowledgement from the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteResult {
    pub inserted: u64,
    pub replaced: u64,
    pub unchanged: u64,
    pub deleted: u64,
    pub skipped: u64,
    pub errors: u64,
    /// First error message when `errors > 0`.
    pub first_error: Option<String>,
    /// Ids generated for inserted documents that carried none.
    pub generated_keys: Vec<String>,
}

impl WriteResult {
    /// One successful insert with an id generated by the backend.
    #[must_use]
    pub fn inserted_with_key(key: impl Into<String>) -> Self {
        Self {
            inserted: 1,
            generated_keys: vec![key.into()],
            ..Self::default()
        }
    }

    /// A failed write carrying its first error.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            errors: 1,
            first_error: Some(message.into()),
            ..Self::default()
        }
    }
}

/// One raw change event from a live subscription.
///
/// Control messages (`{state: ...}`) are elided by drivers; only document
/// transitions surface here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    pub old_val: Option<Value>,
    pub new_val: Option<Value>,
}

/// Object-safe source of raw change events backing a [`ChangeFeed`].
pub trait ChangeSource: Send {
    /// Next change event; `None` when the feed is closed or no event is
    /// currently pending.
    fn next_change<'a>(
        &'a mut self,
        cx: &'a Cx,
    ) -> Pin<Box<dyn Future<Output = Outcome<Option<RawChange>, Error>> + Send + 'a>>;

    /// Close the feed, releasing backend resources.
    fn close(&mut self);
}

/// A live cursor of raw change events.
pub struct ChangeFeed {
    inner: Box<dyn ChangeSource>,
}

impl std::fmt::Debug for ChangeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeed").finish_non_exhaustive()
    }
}

impl ChangeFeed {
    /// Wrap a driver-supplied change source.
    #[must_use]
    pub fn new(inner: Box<dyn ChangeSource>) -> Self {
        Self { inner }
    }

    /// Await the next raw change event.
    pub async fn next(&mut self, cx: &Cx) -> Outcome<Option<RawChange>, Error> {
        self.inner.next_change(cx).await
    }

    /// Close the feed.
    pub fn close(&mut self) {
        self.inner.close();
    }
}

/// A raw execution result, before shape-driven interpretation.
#[derive(Debug)]
pub enum RawResult {
    /// A single JSON value (object, scalar, or null).
    Atom(Value),
    /// A materialized sequence of documents.
    Rows(Vec<Value>),
    /// A write acknowledgement.
    Write(WriteResult),
    /// A live change subscription.
    Feed(ChangeFeed),
}

impl RawResult {
    /// The atom value, if this is one.
    #[must_use]
    pub fn as_atom(&self) -> Option<&Value> {
        match self {
            Self::Atom(value) => Some(value),
            _ => None,
        }
    }

    /// The rows, if this is a materialized sequence.
    #[must_use]
    pub fn as_rows(&self) -> Option<&[Value]> {
        match self {
            Self::Rows(rows) => Some(rows),
            _ => None,
        }
    }
}

/// A backend capable of executing terms.
///
/// Implementations must be `Send + Sync`; the registry issues DDL through
/// the `ensure_*` helpers during `connect` and everything else through
/// [`execute`](Driver::execute).
pub trait Driver: Send + Sync {
    /// Idempotently create a table and wait until it is ready.
    fn ensure_table(
        &self,
        cx: &Cx,
        name: &str,
    ) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Idempotently create a secondary index and wait until it is ready.
    fn ensure_index(
        &self,
        cx: &Cx,
        table: &str,
        index: &IndexDef,
    ) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Execute a term and return the raw result.
    fn execute(
        &self,
        cx: &Cx,
        term: &Term,
    ) -> impl Future<Output = Outcome<RawResult, Error>> + Send;
}
