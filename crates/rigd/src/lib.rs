//! Scenario execution engine for the rig testbed.
//!
//! Turns a declarative plan of actions into a coordinated execution over the
//! control-plane store: dependency validation, logical and time scheduling,
//! lifecycle classification and reduction, and the reconciliation loops that
//! tie them together.

pub mod alerts;
pub mod classifier;
pub mod clock;
pub mod cron;
pub mod exec;
pub mod executors;
pub mod expressions;
pub mod group;
pub mod management;
pub mod persistence;
pub mod reconciler;
pub mod reducer;
pub mod registry;
pub mod schedule;
pub mod scheduler;
pub mod store;
pub mod template;
pub mod validate;

pub use alerts::*;
pub use classifier::*;
pub use clock::*;
pub use reconciler::*;
pub use reducer::*;
pub use scheduler::*;
pub use store::*;
