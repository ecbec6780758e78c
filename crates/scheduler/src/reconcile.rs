//! Reservation reconciler for the durable backend.
//!
//! Watches persistent reservations, merges each into its node's aggregate
//! and records the outcome on the reservation status. Aggregate updates are
//! compare-and-swap against a version counter; conflicting writers retry,
//! so concurrent merges serialize without a lock across processes.

use api_types::CardAggregate;
use api_types::NodeAggregate;
use api_types::Reservation;
use api_types::ReservationPhase;
use async_trait::async_trait;
use dashmap::DashMap;
use error_stack::Report;
use tracing::info;
use tracing::warn;

use crate::aggregate;
use crate::errors::StoreBackendError;

/// Versioned access to aggregates and reservation statuses.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Load a node's aggregate with its version, `None` when absent.
    async fn get_aggregate(
        &self,
        node_name: &str,
    ) -> Result<Option<(NodeAggregate, u64)>, Report<StoreBackendError>>;

    /// Store an aggregate. `expected_version` of `None` creates the object;
    /// otherwise the write only succeeds when the stored version still
    /// matches, failing with [`StoreBackendError::Conflict`].
    async fn put_aggregate(
        &self,
        node_name: &str,
        aggregate: NodeAggregate,
        expected_version: Option<u64>,
    ) -> Result<(), Report<StoreBackendError>>;

    /// Record the reconciliation outcome on the reservation object.
    async fn update_reservation_status(
        &self,
        reservation: &Reservation,
        phase: ReservationPhase,
        message: &str,
    ) -> Result<(), Report<StoreBackendError>>;
}

/// In-memory [`ReservationStore`], used by tests and single-process runs.
#[derive(Debug, Default)]
pub struct InMemoryReservationStore {
    aggregates: DashMap<String, (NodeAggregate, u64)>,
    statuses: DashMap<String, (ReservationPhase, String)>,
}

impl InMemoryReservationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status_of(&self, pod_key: &str) -> Option<(ReservationPhase, String)> {
        self.statuses.get(pod_key).map(|entry| entry.clone())
    }

    pub fn aggregate_of(&self, node_name: &str) -> Option<NodeAggregate> {
        self.aggregates
            .get(node_name)
            .map(|entry| entry.0.clone())
    }
}

#[async_trait]
impl ReservationStore for InMemoryReservationStore {
    async fn get_aggregate(
        &self,
        node_name: &str,
    ) -> Result<Option<(NodeAggregate, u64)>, Report<StoreBackendError>> {
        Ok(self.aggregates.get(node_name).map(|entry| entry.clone()))
    }

    async fn put_aggregate(
        &self,
        node_name: &str,
        aggregate: NodeAggregate,
        expected_version: Option<u64>,
    ) -> Result<(), Report<StoreBackendError>> {
        use dashmap::mapref::entry::Entry;

        match self.aggregates.entry(node_name.to_string()) {
            Entry::Occupied(mut entry) => {
                let version = entry.get().1;
                if expected_version != Some(version) {
                    return Err(Report::new(StoreBackendError::Conflict));
                }
                entry.insert((aggregate, version + 1));
            }
            Entry::Vacant(entry) => {
                if expected_version.is_some() {
                    return Err(Report::new(StoreBackendError::Conflict));
                }
                entry.insert((aggregate, 1));
            }
        }
        Ok(())
    }

    async fn update_reservation_status(
        &self,
        reservation: &Reservation,
        phase: ReservationPhase,
        message: &str,
    ) -> Result<(), Report<StoreBackendError>> {
        self.statuses.insert(
            reservation.spec.pod_key.clone(),
            (phase, message.to_string()),
        );
        Ok(())
    }
}

/// Merges reservations into node aggregates.
pub struct Reconciler<S> {
    store: S,
    max_attempts: u32,
}

impl<S: ReservationStore> Reconciler<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            max_attempts: 5,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Reconcile one reservation: load (or seed) the node aggregate, merge,
    /// CAS the result back and stamp the reservation phase.
    ///
    /// Returns the phase recorded on the reservation.
    ///
    /// # Errors
    ///
    /// - [`StoreBackendError`] when the store keeps conflicting past the
    ///   retry budget or fails outright
    pub async fn reconcile(
        &self,
        reservation: &Reservation,
    ) -> Result<ReservationPhase, Report<StoreBackendError>> {
        let spec = &reservation.spec;
        if spec.node_name.is_empty() {
            // Nothing to aggregate yet; the reservation stays pending.
            return Ok(ReservationPhase::Pending);
        }

        for attempt in 1..=self.max_attempts {
            let existing = self.store.get_aggregate(&spec.node_name).await?;
            let (current, version) = match existing {
                Some((aggregate, version)) => (aggregate, Some(version)),
                None => (seed_aggregate(&spec.node_name, spec.num_cards), None),
            };

            match aggregate::merge(&current, spec) {
                Ok(mut updated) => {
                    updated.status.last_updated = chrono::Utc::now().to_rfc3339();
                    match self
                        .store
                        .put_aggregate(&spec.node_name, updated, version)
                        .await
                    {
                        Ok(()) => {
                            self.store
                                .update_reservation_status(
                                    reservation,
                                    ReservationPhase::Reserved,
                                    "merged into node aggregate",
                                )
                                .await?;
                            info!(pod = %spec.pod_key, node = %spec.node_name, "Reservation reserved");
                            return Ok(ReservationPhase::Reserved);
                        }
                        Err(err) if matches!(err.current_context(), StoreBackendError::Conflict) => {
                            warn!(
                                pod = %spec.pod_key,
                                node = %spec.node_name,
                                attempt = attempt,
                                "Aggregate conflict, retrying merge"
                            );
                            continue;
                        }
                        Err(err) => return Err(err),
                    }
                }
                Err(merge_err) => {
                    let message = merge_err.current_context().to_string();
                    self.store
                        .update_reservation_status(reservation, ReservationPhase::Failed, &message)
                        .await?;
                    info!(pod = %spec.pod_key, node = %spec.node_name, reason = %message, "Reservation failed");
                    return Ok(ReservationPhase::Failed);
                }
            }
        }

        Err(Report::new(StoreBackendError::Conflict))
    }

    /// Drop a pod's reservations from its node aggregate, CAS-retried.
    pub async fn remove(
        &self,
        node_name: &str,
        pod_key: &str,
    ) -> Result<(), Report<StoreBackendError>> {
        for _ in 1..=self.max_attempts {
            let Some((current, version)) = self.store.get_aggregate(node_name).await? else {
                return Ok(());
            };
            let mut updated = aggregate::remove(&current, pod_key);
            updated.status.last_updated = chrono::Utc::now().to_rfc3339();
            match self
                .store
                .put_aggregate(node_name, updated, Some(version))
                .await
            {
                Ok(()) => return Ok(()),
                Err(err) if matches!(err.current_context(), StoreBackendError::Conflict) => {
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        Err(Report::new(StoreBackendError::Conflict))
    }
}

/// Baseline aggregate for a node seen for the first time: `num_cards`
/// untouched cards, so the very reservation that created it can merge.
fn seed_aggregate(node_name: &str, num_cards: u32) -> NodeAggregate {
    let mut node = NodeAggregate::default();
    node.spec.node_name = node_name.to_string();
    let count = num_cards.max(1);
    node.status.devices = (0..count)
        .map(|i| CardAggregate {
            id: format!("GPU-{i}"),
            reservations: Vec::new(),
            total_reserved_percent: 0,
        })
        .collect();
    node
}

#[cfg(test)]
mod tests {
    use api_types::ReservationSpec;
    use similar_asserts::assert_eq;

    use super::*;

    fn reservation(pod_key: &str, node: &str, num_cards: u32, percent: u8) -> Reservation {
        Reservation {
            spec: ReservationSpec {
                pod_key: pod_key.to_string(),
                node_name: node.to_string(),
                num_cards,
                percent_per_card: percent,
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn reconcile_seeds_and_reserves() {
        let reconciler = Reconciler::new(InMemoryReservationStore::new());
        let phase = reconciler
            .reconcile(&reservation("ns/p1", "node-a", 2, 30))
            .await
            .unwrap();
        assert_eq!(phase, ReservationPhase::Reserved);

        let aggregate = reconciler.store().aggregate_of("node-a").unwrap();
        assert_eq!(aggregate.status.devices.len(), 2);
        assert_eq!(aggregate.status.devices[0].total_reserved_percent, 30);
        assert_eq!(aggregate.status.devices[1].total_reserved_percent, 30);
        assert!(!aggregate.status.last_updated.is_empty());
    }

    #[tokio::test]
    async fn reconcile_marks_failed_on_insufficient_capacity() {
        let store = InMemoryReservationStore::new();
        // Pre-fill both cards to 90%.
        let mut node = NodeAggregate::default();
        node.spec.node_name = "node-a".to_string();
        node.status.devices = vec![
            CardAggregate {
                id: "GPU-0".to_string(),
                reservations: Vec::new(),
                total_reserved_percent: 90,
            },
            CardAggregate {
                id: "GPU-1".to_string(),
                reservations: Vec::new(),
                total_reserved_percent: 90,
            },
        ];
        store.put_aggregate("node-a", node, None).await.unwrap();

        let reconciler = Reconciler::new(store);
        let phase = reconciler
            .reconcile(&reservation("ns/p1", "node-a", 2, 20))
            .await
            .unwrap();
        assert_eq!(phase, ReservationPhase::Failed);

        // State unchanged, failure recorded.
        let aggregate = reconciler.store().aggregate_of("node-a").unwrap();
        assert_eq!(aggregate.status.devices[0].total_reserved_percent, 90);
        let (status, message) = reconciler.store().status_of("ns/p1").unwrap();
        assert_eq!(status, ReservationPhase::Failed);
        assert!(message.contains("insufficient capacity"));
    }

    #[tokio::test]
    async fn reconcile_without_node_stays_pending() {
        let reconciler = Reconciler::new(InMemoryReservationStore::new());
        let phase = reconciler
            .reconcile(&reservation("ns/p1", "", 1, 10))
            .await
            .unwrap();
        assert_eq!(phase, ReservationPhase::Pending);
    }

    #[tokio::test]
    async fn remove_returns_capacity() {
        let reconciler = Reconciler::new(InMemoryReservationStore::new());
        reconciler
            .reconcile(&reservation("ns/p1", "node-a", 1, 40))
            .await
            .unwrap();
        reconciler.remove("node-a", "ns/p1").await.unwrap();

        let aggregate = reconciler.store().aggregate_of("node-a").unwrap();
        assert_eq!(aggregate.status.devices[0].total_reserved_percent, 0);
        assert!(aggregate.status.devices[0].reservations.is_empty());
    }

    #[tokio::test]
    async fn cas_conflict_is_retried() {
        // A store whose first put always conflicts.
        struct FlakyStore {
            inner: InMemoryReservationStore,
            failed_once: std::sync::atomic::AtomicBool,
        }

        #[async_trait]
        impl ReservationStore for FlakyStore {
            async fn get_aggregate(
                &self,
                node_name: &str,
            ) -> Result<Option<(NodeAggregate, u64)>, Report<StoreBackendError>> {
                self.inner.get_aggregate(node_name).await
            }

            async fn put_aggregate(
                &self,
                node_name: &str,
                aggregate: NodeAggregate,
                expected_version: Option<u64>,
            ) -> Result<(), Report<StoreBackendError>> {
                if !self.failed_once.swap(true, std::sync::atomic::Ordering::SeqCst) {
                    return Err(Report::new(StoreBackendError::Conflict));
                }
                self.inner
                    .put_aggregate(node_name, aggregate, expected_version)
                    .await
            }

            async fn update_reservation_status(
                &self,
                reservation: &Reservation,
                phase: ReservationPhase,
                message: &str,
            ) -> Result<(), Report<StoreBackendError>> {
                self.inner
                    .update_reservation_status(reservation, phase, message)
                    .await
            }
        }

        let reconciler = Reconciler::new(FlakyStore {
            inner: InMemoryReservationStore::new(),
            failed_once: std::sync::atomic::AtomicBool::new(false),
        });
        let phase = reconciler
            .reconcile(&reservation("ns/p1", "node-a", 1, 10))
            .await
            .unwrap();
        assert_eq!(phase, ReservationPhase::Reserved);
    }
}
