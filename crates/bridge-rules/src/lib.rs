//! Trigger rules for the agent bridge
//!
//! A rule watches a single entity for state transitions and carries a
//! message to deliver when it fires. Rules live in a single JSON file
//! managed by [`RuleStore`]; matching is a pure predicate on
//! [`Rule`] with no I/O.

mod rule;
mod store;

pub use rule::{Rule, RuleInput};
pub use store::{RuleStore, StoreError, StoreResult};
