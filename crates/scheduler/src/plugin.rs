//! Scheduling glue: phase handlers and the per-cycle scratch state.
//!
//! The host scheduler invokes the plugin at PreFilter, Filter, Score,
//! Reserve, Unreserve and PostBind with a per-cycle [`CycleState`]. The
//! parsed request, the chosen pod key and the selected cards travel between
//! phases under well-known state keys.

use std::any::Any;
use std::collections::BTreeMap;
use std::collections::HashMap;

use api_types::PodKey;
use api_types::ShareRequest;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::context::SchedulerContext;
use crate::reserve::reserve_flow;
use crate::reserve::unreserve_flow;
use crate::score::score_node;

/// Well-known cycle-state keys.
pub mod state_keys {
    /// Parsed [`api_types::ShareRequest`].
    pub const SHARE_REQUEST: &str = "cardshare/request";
    /// [`api_types::PodKey`] of the reservation made in the Reserve phase.
    pub const POD_RESERVATION: &str = "cardshare/pod-reservation";
    /// [`super::CardAllocationInfo`] written by the Reserve phase.
    pub const CARD_ALLOCATION: &str = "cardshare/allocation";
}

/// Typed scratch map shared between the phases of one scheduling cycle.
#[derive(Default)]
pub struct CycleState {
    entries: HashMap<&'static str, Box<dyn Any + Send + Sync>>,
}

impl CycleState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write<T: Any + Send + Sync>(&mut self, key: &'static str, value: T) {
        self.entries.insert(key, Box::new(value));
    }

    pub fn read<T: Any>(&self, key: &str) -> Option<&T> {
        self.entries.get(key).and_then(|v| v.downcast_ref())
    }
}

/// Node and cards chosen for a pod during Reserve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardAllocationInfo {
    pub node_name: String,
    pub selected_cards: Vec<String>,
    pub percent_per_card: u8,
}

/// Outcome of a phase, as reported to the host scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseStatus {
    Success,
    /// Capacity shortfall; the pod should wait for another cycle.
    Unschedulable(String),
    /// Internal fault; the cycle is aborted.
    Error(String),
}

/// The card-sharing scheduler plugin.
pub struct SchedulingPlugin {
    ctx: SchedulerContext,
}

impl SchedulingPlugin {
    pub fn new(ctx: SchedulerContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &SchedulerContext {
        &self.ctx
    }

    /// Parse the share request from the workload's annotations. Workloads
    /// without (or with unparsable) share annotations pass through
    /// untouched; real admission happens in Reserve.
    pub fn pre_filter(
        &self,
        state: &mut CycleState,
        annotations: &BTreeMap<String, String>,
    ) -> PhaseStatus {
        match ShareRequest::from_annotations(annotations) {
            Ok(Some(request)) => {
                debug!(cards = request.num_cards, percent = request.percent_per_card, "Share request parsed");
                state.write(state_keys::SHARE_REQUEST, request);
            }
            Ok(None) => {}
            Err(err) => {
                warn!("Ignoring malformed share annotations: {err:?}");
            }
        }
        PhaseStatus::Success
    }

    /// No per-node hard checks; admission is deferred to Reserve.
    pub fn filter(&self) -> PhaseStatus {
        PhaseStatus::Success
    }

    /// Rank the node by headroom for the request's top-N cards. Errors
    /// score 0 so one unreachable accountant never blocks scheduling.
    pub async fn score(&self, state: &CycleState, node: &str) -> u8 {
        let Some(request) = state.read::<ShareRequest>(state_keys::SHARE_REQUEST) else {
            return 0;
        };
        match score_node(self.ctx.client.as_ref(), node, request.num_cards as usize).await {
            Ok(score) => score,
            Err(err) => {
                debug!(node = %node, "Scoring failed, returning 0: {err}");
                0
            }
        }
    }

    /// Run the two-phase reserve for the chosen node.
    pub async fn reserve(
        &self,
        state: &mut CycleState,
        pod_key: &PodKey,
        node: &str,
    ) -> PhaseStatus {
        let Some(request) = state.read::<ShareRequest>(state_keys::SHARE_REQUEST).copied() else {
            return PhaseStatus::Success;
        };

        match reserve_flow(&self.ctx, pod_key, &request, node).await {
            Ok(devices) => {
                info!(pod = %pod_key, node = %node, cards = ?devices, "Reserve complete");
                state.write(state_keys::POD_RESERVATION, pod_key.clone());
                state.write(
                    state_keys::CARD_ALLOCATION,
                    CardAllocationInfo {
                        node_name: node.to_string(),
                        selected_cards: devices,
                        percent_per_card: request.percent_per_card,
                    },
                );
                PhaseStatus::Success
            }
            Err(err) => {
                let context = err.current_context();
                warn!(pod = %pod_key, node = %node, "Reserve failed: {err:?}");
                if context.is_unschedulable() {
                    PhaseStatus::Unschedulable(context.to_string())
                } else {
                    PhaseStatus::Error(context.to_string())
                }
            }
        }
    }

    /// Compensate a failed cycle: release the pod's node reservation.
    /// Failures are logged, not propagated; the next cycle retries.
    pub async fn unreserve(&self, state: &CycleState, node: &str) {
        let Some(pod_key) = state.read::<PodKey>(state_keys::POD_RESERVATION) else {
            return;
        };
        if let Err(err) = unreserve_flow(&self.ctx, pod_key, node).await {
            warn!(pod = %pod_key, node = %node, "Unreserve failed: {err:?}");
        }
    }

    /// The pod is bound: compact the cluster-side pending marker. The node
    /// ledger keeps its debit until pod exit triggers `/unreserve`.
    pub async fn post_bind(&self, state: &CycleState, node: &str) {
        let Some(pod_key) = state.read::<PodKey>(state_keys::POD_RESERVATION) else {
            return;
        };
        if let Err(err) = self.ctx.capacity.release(pod_key.as_str(), node).await {
            warn!(pod = %pod_key, node = %node, "PostBind release failed: {err:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use api_types::CARDS_ANNOTATION;
    use api_types::PERCENT_ANNOTATION;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::client::RetryPolicy;
    use crate::mock::MockCapacityManager;
    use crate::mock::MockNodeClient;

    fn annotations(cards: &str, percent: &str) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert(CARDS_ANNOTATION.to_string(), cards.to_string());
        map.insert(PERCENT_ANNOTATION.to_string(), percent.to_string());
        map
    }

    fn plugin(capacity: Arc<MockCapacityManager>, client: Arc<MockNodeClient>) -> SchedulingPlugin {
        SchedulingPlugin::new(
            SchedulerContext::new(capacity, client).with_retry(RetryPolicy {
                attempts: 3,
                backoff: std::time::Duration::from_millis(1),
            }),
        )
    }

    #[test(tokio::test)]
    async fn full_cycle_threads_state_between_phases() {
        let capacity = Arc::new(MockCapacityManager::new());
        let client = Arc::new(MockNodeClient::with_status([("g0", 100), ("g1", 80)]));
        let plugin = plugin(capacity.clone(), client.clone());

        let mut state = CycleState::new();
        assert_eq!(
            plugin.pre_filter(&mut state, &annotations("2", "30")),
            PhaseStatus::Success
        );
        assert_eq!(plugin.filter(), PhaseStatus::Success);

        assert_eq!(plugin.score(&state, "node-a").await, 90);

        let pod_key = PodKey::from("ns/p1");
        assert_eq!(
            plugin.reserve(&mut state, &pod_key, "node-a").await,
            PhaseStatus::Success
        );

        let allocation = state
            .read::<CardAllocationInfo>(state_keys::CARD_ALLOCATION)
            .unwrap();
        assert_eq!(allocation.node_name, "node-a");
        assert_eq!(allocation.selected_cards.len(), 2);
        assert_eq!(allocation.percent_per_card, 30);

        plugin.post_bind(&state, "node-a").await;
        assert_eq!(
            capacity.release_calls(),
            vec![("ns/p1".to_string(), "node-a".to_string())]
        );
    }

    #[test(tokio::test)]
    async fn pods_without_annotations_pass_through() {
        let capacity = Arc::new(MockCapacityManager::new());
        let client = Arc::new(MockNodeClient::with_status([("g0", 100)]));
        let plugin = plugin(capacity.clone(), client.clone());

        let mut state = CycleState::new();
        assert_eq!(
            plugin.pre_filter(&mut state, &BTreeMap::new()),
            PhaseStatus::Success
        );
        assert_eq!(plugin.score(&state, "node-a").await, 0);
        assert_eq!(
            plugin
                .reserve(&mut state, &PodKey::from("ns/p1"), "node-a")
                .await,
            PhaseStatus::Success
        );
        // No reservation was attempted anywhere.
        assert!(capacity.reserve_calls().is_empty());
        assert!(client.reserve_calls().is_empty());
    }

    #[test(tokio::test)]
    async fn capacity_shortfall_is_unschedulable() {
        let capacity = Arc::new(MockCapacityManager::new());
        let client = Arc::new(MockNodeClient::with_status([("g0", 10)]));
        let plugin = plugin(capacity, client);

        let mut state = CycleState::new();
        plugin.pre_filter(&mut state, &annotations("1", "30"));

        match plugin
            .reserve(&mut state, &PodKey::from("ns/p1"), "node-a")
            .await
        {
            PhaseStatus::Unschedulable(_) => {}
            other => panic!("expected unschedulable, got {other:?}"),
        }
        // Failed reserve leaves no state for later phases.
        assert!(state.read::<PodKey>(state_keys::POD_RESERVATION).is_none());
    }

    #[test(tokio::test)]
    async fn persistent_node_failure_is_an_error() {
        let capacity = Arc::new(MockCapacityManager::new());
        let client = Arc::new(MockNodeClient::with_status([("g0", 100)]).failing_reserve());
        let plugin = plugin(capacity, client);

        let mut state = CycleState::new();
        plugin.pre_filter(&mut state, &annotations("1", "30"));

        match plugin
            .reserve(&mut state, &PodKey::from("ns/p1"), "node-a")
            .await
        {
            PhaseStatus::Error(_) => {}
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test(tokio::test)]
    async fn unreserve_releases_the_node_reservation() {
        let capacity = Arc::new(MockCapacityManager::new());
        let client = Arc::new(MockNodeClient::with_status([("g0", 100)]));
        let plugin = plugin(capacity, client.clone());

        let mut state = CycleState::new();
        plugin.pre_filter(&mut state, &annotations("1", "30"));
        plugin
            .reserve(&mut state, &PodKey::from("ns/p1"), "node-a")
            .await;

        plugin.unreserve(&state, "node-a").await;
        assert_eq!(client.unreserve_calls(), vec!["ns/p1".to_string()]);
    }

    #[test(tokio::test)]
    async fn scoring_errors_return_zero() {
        let capacity = Arc::new(MockCapacityManager::new());
        let client = Arc::new(MockNodeClient::failing());
        let plugin = plugin(capacity, client);

        let mut state = CycleState::new();
        plugin.pre_filter(&mut state, &annotations("1", "30"));
        assert_eq!(plugin.score(&state, "node-a").await, 0);
    }
}
