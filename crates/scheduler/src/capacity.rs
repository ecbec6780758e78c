//! Cluster-level capacity manager.
//!
//! The manager is a gate, not the admission authority: the authoritative
//! per-card accounting lives on each node. The in-memory implementation
//! just records which pods hold cluster-level reservations; the durable
//! implementation (see [`crate::durable`]) persists them for a reconciler
//! to merge into per-node aggregates.

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use error_stack::Report;
use tracing::debug;

use crate::errors::CapacityError;

/// Cluster-wide reservation operations, polymorphic over the backing store.
#[async_trait]
pub trait CapacityManager: Send + Sync {
    /// Record a reservation for `pod_key` on `node_name`.
    async fn reserve(
        &self,
        pod_key: &str,
        node_name: &str,
        num_cards: u32,
        percent: u8,
    ) -> Result<(), Report<CapacityError>>;

    /// Drop a previous reservation. Releasing a reservation that does not
    /// exist is a no-op.
    async fn release(&self, pod_key: &str, node_name: &str) -> Result<(), Report<CapacityError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingReservation {
    pub num_cards: u32,
    pub percent: u8,
}

/// In-memory manager for single-instance schedulers. Performs no capacity
/// enforcement of its own; admission happens at the node accountant.
#[derive(Debug, Default)]
pub struct InMemoryCapacityManager {
    /// node name -> pod key -> reservation
    reservations: DashMap<String, HashMap<String, PendingReservation>>,
}

impl InMemoryCapacityManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reservation currently recorded for a pod, if any.
    pub fn get(&self, pod_key: &str, node_name: &str) -> Option<PendingReservation> {
        self.reservations
            .get(node_name)
            .and_then(|pods| pods.get(pod_key).copied())
    }

    /// Number of pods holding reservations on a node.
    pub fn reserved_pods(&self, node_name: &str) -> usize {
        self.reservations
            .get(node_name)
            .map(|pods| pods.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl CapacityManager for InMemoryCapacityManager {
    async fn reserve(
        &self,
        pod_key: &str,
        node_name: &str,
        num_cards: u32,
        percent: u8,
    ) -> Result<(), Report<CapacityError>> {
        self.reservations
            .entry(node_name.to_string())
            .or_default()
            .insert(
                pod_key.to_string(),
                PendingReservation { num_cards, percent },
            );
        debug!(pod = %pod_key, node = %node_name, cards = num_cards, percent = percent, "Cluster reservation recorded");
        Ok(())
    }

    async fn release(&self, pod_key: &str, node_name: &str) -> Result<(), Report<CapacityError>> {
        let emptied = if let Some(mut pods) = self.reservations.get_mut(node_name) {
            pods.remove(pod_key);
            pods.is_empty()
        } else {
            false
        };
        if emptied {
            self.reservations
                .remove_if(node_name, |_, pods| pods.is_empty());
        }
        debug!(pod = %pod_key, node = %node_name, "Cluster reservation released");
        Ok(())
    }
}
