//! Declarative models over document stores.
//!
//! This crate is the top layer of docmodel: a [`Database`] registry that
//! resolves model definitions into namespaces, [`Instance`] handles with
//! dirty tracking and a recursive relation-aware save, query execution
//! with relation expansion, and hydrated live change feeds.
//!
//! A model is declared once, registered, and resolved at connect time:
//!
//! ```no_run
//! use docmodel::{Database, ModelDef, PropertyDef, PropertyKind, RelationDecl};
//! use docmodel_memory::MemoryDriver;
//!
//! let db = Database::new(MemoryDriver::new());
//! db.register(
//!     ModelDef::new("Character")
//!         .property(PropertyDef::new("name", PropertyKind::String))
//!         .relation(RelationDecl::has_one("equippedWeapon", "Weapon")),
//! )?;
//! db.register(
//!     ModelDef::new("Weapon").property(PropertyDef::new("name", PropertyKind::String)),
//! )?;
//! # Ok::<(), docmodel::Error>(())
//! ```

/// Propagate the non-`Ok` arms of an [`asupersync::Outcome`].
macro_rules! try_outcome {
    ($expr:expr) => {
        match $expr {
            ::asupersync::Outcome::Ok(value) => value,
            ::asupersync::Outcome::Err(err) => return ::asupersync::Outcome::Err(err),
            ::asupersync::Outcome::Cancelled(reason) => {
                return ::asupersync::Outcome::Cancelled(reason);
            }
            ::asupersync::Outcome::Panicked(payload) => {
                return ::asupersync::Outcome::Panicked(payload);
            }
        }
    };
}
pub(crate) use try_outcome;

pub mod change;
pub mod database;
pub mod hooks;
pub mod instance;
pub mod model;
pub mod namespace;
pub mod populate;
pub mod query;
mod save;

pub use change::{Change, ChangeCursor};
pub use database::{Database, DatabaseConfig};
pub use hooks::ModelHooks;
pub use instance::Instance;
pub use model::ModelDef;
pub use namespace::{Namespace, RelationRef, SchemaFlag};
pub use populate::PopulateSpec;
pub use query::{ModelQuery, QueryResult};

pub use docmodel_core::{
    Driver, Error, IndexDef, PropertyDef, PropertyKind, RelationDecl, Result, WriteResult,
};
pub use docmodel_query::{Chain, Shape, Verb};
