//! Cluster-side scheduling for fractional accelerator sharing.
//!
//! The plugin scores nodes by card headroom, runs the two-phase reserve
//! protocol (cluster reservation, device pick, node reservation with
//! compensating release on any failure) and releases reservations when a
//! cycle aborts or the pod is bound. The cluster capacity manager is
//! polymorphic over an in-memory store and a durable REST-backed store with
//! a reconciler that maintains per-node aggregates.

pub mod aggregate;
pub mod capacity;
pub mod client;
pub mod context;
pub mod durable;
pub mod errors;
pub mod picker;
pub mod plugin;
pub mod reconcile;
pub mod reserve;
pub mod score;

#[cfg(test)]
pub(crate) mod mock;

pub use capacity::CapacityManager;
pub use capacity::InMemoryCapacityManager;
pub use client::NodeClient;
pub use client::RetryPolicy;
pub use client::UdsNodeClient;
pub use context::CapacityBackend;
pub use context::SchedulerContext;
pub use durable::RestCapacityManager;
pub use errors::ScheduleError;
pub use plugin::CycleState;
pub use plugin::PhaseStatus;
pub use plugin::SchedulingPlugin;
pub use reconcile::Reconciler;
