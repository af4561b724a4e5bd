//! Model lifecycle hooks.
//!
//! Cross-cutting model capabilities (timestamps, soft delete, uniqueness
//! checks) are expressed as an ordered list of [`ModelHooks`]
//! implementations attached to a model definition. Hooks run in
//! registration order at every call site.

use docmodel_core::{IndexDef, PropertyDef, Result};
use docmodel_query::Chain;

use crate::instance::Instance;

/// Lifecycle extension points for a model. All methods default to no-ops;
/// implement only the ones a capability needs.
///
/// Hooks are synchronous: they may rewrite chains, mutate the instance
/// through its public mutators, or veto an operation by returning an error.
pub trait ModelHooks: Send + Sync {
    /// Schema properties this hook contributes, flattened into the model's
    /// schema at registration. A later declaration of the same property
    /// name wins.
    fn schema(&self) -> Vec<PropertyDef> {
        Vec::new()
    }

    /// Secondary indexes this hook contributes.
    fn indexes(&self) -> Vec<IndexDef> {
        Vec::new()
    }

    /// Runs once per model when the registry connects, after tables and
    /// indexes exist.
    fn setup(&self, model: &str) -> Result<()> {
        let _ = model;
        Ok(())
    }

    /// Runs before every save, insert or update alike.
    fn before_save(&self, instance: &Instance) -> Result<()> {
        let _ = instance;
        Ok(())
    }

    /// Runs after a save completed and pending values were flushed.
    fn after_save(&self, instance: &Instance) -> Result<()> {
        let _ = instance;
        Ok(())
    }

    /// Runs before the first insert of an instance, after `before_save`.
    fn before_create(&self, instance: &Instance) -> Result<()> {
        let _ = instance;
        Ok(())
    }

    /// Runs right after the first insert adopted its id.
    fn after_create(&self, instance: &Instance) -> Result<()> {
        let _ = instance;
        Ok(())
    }

    /// Runs before a hard delete. Returning `Ok(false)` claims the delete:
    /// the row is saved instead of removed, which is how a soft-delete hook
    /// converts removal into marking. `Ok(true)` lets the hard delete run.
    fn before_delete(&self, instance: &Instance) -> Result<bool> {
        let _ = instance;
        Ok(true)
    }

    /// May rewrite a chain immediately before execution. The soft-delete
    /// pattern taps an exclusion filter in here unless the chain carries a
    /// note opting out.
    fn before_run(&self, chain: Chain) -> Chain {
        chain
    }
}
