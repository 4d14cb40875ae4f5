//! Ingestion pipeline, dispatcher and reconciliation scheduler.

pub mod deferred;
pub mod dispatcher;
pub mod hierarchy;
pub mod listener;
pub mod pipeline;
pub mod reconcile;

#[cfg(test)]
mod testing;

pub use deferred::DeferredQueue;
pub use dispatcher::Dispatcher;
pub use hierarchy::{compute_team_counts, recompute_hierarchy};
pub use listener::{LiveListener, LiveSource};
pub use pipeline::{Applied, Pipeline};
pub use reconcile::{BatchReport, ReconcileConfig, Reconciler, next_daily_run};
