//! Core types and traits for docmodel.
//!
//! This crate defines the vocabulary shared by the query builder and the
//! model layer: schema and relation metadata, the opaque query [`Term`]
//! tree, the [`Driver`] trait for the external execution collaborator, and
//! the workspace-wide [`Error`] type.
//!
//! Nothing here talks to a backend; higher layers build terms, a driver
//! executes them.

pub mod driver;
pub mod error;
pub mod relation;
pub mod schema;
pub mod term;

pub use driver::{ChangeFeed, ChangeSource, Driver, RawChange, RawResult, WriteResult};
pub use error::{
    CoercionError, DriverError, Error, RegistrationError, RegistrationErrorKind, RelationError,
    Result, TransitionError,
};
pub use relation::{
    ManyRelation, ManyToManyRelation, RelationDecl, RelationKind, SingleRelation, join_row_id,
    join_table_name,
};
pub use schema::{IndexDef, PropertyDef, PropertyKind, capitalize, coerce_point, lcfirst};
pub use term::{KeyExpr, MergeEntry, Term};
