//! Shape-tracked immutable query chains.
//!
//! This crate provides the query-building half of docmodel: a closed
//! [`Verb`] vocabulary, the [`Shape`] state machine saying which verb is
//! legal where, the persistent [`Chain`] builder, and [`classify`] for
//! sorting raw driver results into records, record lists, feeds and write
//! summaries.

pub mod chain;
pub mod response;
pub mod shape;
pub mod verb;

pub use chain::Chain;
pub use response::{classify, Response};
pub use shape::{transition, Shape};
pub use verb::Verb;
