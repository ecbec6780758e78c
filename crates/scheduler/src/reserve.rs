//! Two-phase reserve orchestration.
//!
//! Reserve order is cluster first, then pick, then node; any later failure
//! compensates by releasing the cluster reservation, so a failed cycle
//! leaves no residual state on either side. Node calls retry with linear
//! backoff; the sleeps race the cycle's cancellation token, and a
//! cancelled cycle stops immediately without issuing further compensations.

use api_types::PodKey;
use api_types::ShareRequest;
use error_stack::Report;
use tracing::info;
use tracing::warn;

use crate::client::NodeClient;
use crate::client::RetryPolicy;
use crate::context::SchedulerContext;
use crate::errors::ScheduleError;
use crate::picker::pick_devices;

/// Reserve percent on a node's cards with bounded retry.
pub async fn reserve_with_retry(
    client: &dyn NodeClient,
    policy: &RetryPolicy,
    cancel: &tokio_util::sync::CancellationToken,
    node: &str,
    pod_key: &str,
    devices: &[String],
    percent: u8,
) -> Result<(), Report<ScheduleError>> {
    let mut last_err = None;
    for attempt in 1..=policy.attempts {
        match client.reserve(node, pod_key, devices, percent).await {
            Ok(()) => {
                info!(pod = %pod_key, node = %node, attempt = attempt, "Node reserve succeeded");
                return Ok(());
            }
            Err(err) => {
                warn!(pod = %pod_key, node = %node, attempt = attempt, "Node reserve attempt failed: {err}");
                last_err = Some(err);
            }
        }
        if attempt < policy.attempts {
            tokio::select! {
                () = tokio::time::sleep(policy.delay_after(attempt)) => {}
                () = cancel.cancelled() => {
                    return Err(Report::new(ScheduleError::Cancelled));
                }
            }
        }
    }
    let mut report = Report::new(ScheduleError::NodeReserveFailed);
    if let Some(err) = last_err {
        report = report.attach_printable(format!("last attempt: {err}"));
    }
    Err(report)
}

/// Release a pod's pending node reservation with bounded retry.
pub async fn unreserve_with_retry(
    client: &dyn NodeClient,
    policy: &RetryPolicy,
    cancel: &tokio_util::sync::CancellationToken,
    node: &str,
    pod_key: &str,
) -> Result<(), Report<ScheduleError>> {
    let mut last_err = None;
    for attempt in 1..=policy.attempts {
        match client.unreserve(node, pod_key).await {
            Ok(()) => {
                info!(pod = %pod_key, node = %node, attempt = attempt, "Node unreserve succeeded");
                return Ok(());
            }
            Err(err) => {
                warn!(pod = %pod_key, node = %node, attempt = attempt, "Node unreserve attempt failed: {err}");
                last_err = Some(err);
            }
        }
        if attempt < policy.attempts {
            tokio::select! {
                () = tokio::time::sleep(policy.delay_after(attempt)) => {}
                () = cancel.cancelled() => {
                    return Err(Report::new(ScheduleError::Cancelled));
                }
            }
        }
    }
    let mut report = Report::new(ScheduleError::NodeUnreserveFailed);
    if let Some(err) = last_err {
        report = report.attach_printable(format!("last attempt: {err}"));
    }
    Err(report)
}

/// Compensation: drop the cluster-level reservation, best-effort.
async fn release_cluster_reservation(ctx: &SchedulerContext, pod_key: &PodKey, node: &str) {
    if let Err(err) = ctx.capacity.release(pod_key.as_str(), node).await {
        warn!(pod = %pod_key, node = %node, "Cluster release failed (will be retried by the next cycle): {err:?}");
    }
}

/// The reserve flow: cluster reserve, pick devices, node reserve.
///
/// Returns the picked card IDs on success. On failure at any step the
/// cluster reservation is released and nothing is left on the node.
///
/// # Errors
///
/// - [`ScheduleError::ReservationRejected`] when the capacity manager refuses
/// - [`ScheduleError::NoDevices`] when the picker comes up short
/// - [`ScheduleError::NodeReserveFailed`] when the node keeps refusing
/// - [`ScheduleError::Cancelled`] when the cycle is cancelled mid-retry
pub async fn reserve_flow(
    ctx: &SchedulerContext,
    pod_key: &PodKey,
    request: &ShareRequest,
    node: &str,
) -> Result<Vec<String>, Report<ScheduleError>> {
    if let Err(err) = ctx
        .capacity
        .reserve(
            pod_key.as_str(),
            node,
            request.num_cards,
            request.percent_per_card,
        )
        .await
    {
        warn!(pod = %pod_key, node = %node, "Cluster reservation rejected: {err:?}");
        return Err(Report::new(ScheduleError::ReservationRejected));
    }

    let devices = match pick_devices(
        ctx.client.as_ref(),
        node,
        request.num_cards as usize,
        request.percent_per_card,
    )
    .await
    {
        Ok(devices) => devices,
        Err(err) => {
            warn!(pod = %pod_key, node = %node, "Device pick failed, rolling back cluster reservation");
            release_cluster_reservation(ctx, pod_key, node).await;
            return Err(err);
        }
    };

    if let Err(err) = reserve_with_retry(
        ctx.client.as_ref(),
        &ctx.retry,
        &ctx.cancel,
        node,
        pod_key.as_str(),
        &devices,
        request.percent_per_card,
    )
    .await
    {
        if matches!(err.current_context(), ScheduleError::Cancelled) {
            // A cancelled cycle aborts immediately; compensations already
            // issued by earlier failure paths stand.
            return Err(err);
        }
        warn!(pod = %pod_key, node = %node, "Node reserve failed, rolling back cluster reservation");
        release_cluster_reservation(ctx, pod_key, node).await;
        return Err(err);
    }

    Ok(devices)
}

/// Unreserve symmetry: release the pod's pending node reservation.
pub async fn unreserve_flow(
    ctx: &SchedulerContext,
    pod_key: &PodKey,
    node: &str,
) -> Result<(), Report<ScheduleError>> {
    unreserve_with_retry(
        ctx.client.as_ref(),
        &ctx.retry,
        &ctx.cancel,
        node,
        pod_key.as_str(),
    )
    .await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::mock::MockCapacityManager;
    use crate::mock::MockNodeClient;

    fn request() -> ShareRequest {
        ShareRequest {
            num_cards: 1,
            percent_per_card: 30,
        }
    }

    fn context(capacity: Arc<MockCapacityManager>, client: Arc<MockNodeClient>) -> SchedulerContext {
        SchedulerContext {
            capacity,
            client,
            retry: RetryPolicy {
                attempts: 3,
                backoff: std::time::Duration::from_millis(1),
            },
            cancel: tokio_util::sync::CancellationToken::new(),
        }
    }

    #[test(tokio::test)]
    async fn happy_path_reserves_on_both_levels() {
        let capacity = Arc::new(MockCapacityManager::new());
        let client = Arc::new(MockNodeClient::with_status([("g0", 100), ("g1", 40)]));
        let ctx = context(capacity.clone(), client.clone());

        let devices = reserve_flow(&ctx, &PodKey::from("ns/p1"), &request(), "node-a")
            .await
            .unwrap();
        assert_eq!(devices, vec!["g0".to_string()]);
        assert_eq!(capacity.reserve_calls(), vec![("ns/p1".to_string(), "node-a".to_string())]);
        assert!(capacity.release_calls().is_empty());
        assert_eq!(client.reserve_calls().len(), 1);
    }

    #[test(tokio::test)]
    async fn rejected_cluster_reservation_stops_the_flow() {
        let capacity = Arc::new(MockCapacityManager::rejecting());
        let client = Arc::new(MockNodeClient::with_status([("g0", 100)]));
        let ctx = context(capacity.clone(), client.clone());

        let err = reserve_flow(&ctx, &PodKey::from("ns/p1"), &request(), "node-a")
            .await
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            ScheduleError::ReservationRejected
        ));
        // Neither the picker nor the node saw the request.
        assert!(client.status_calls() == 0);
        assert!(client.reserve_calls().is_empty());
    }

    #[test(tokio::test)]
    async fn pick_failure_rolls_back_cluster_reservation() {
        let capacity = Arc::new(MockCapacityManager::new());
        // Only 10% free: picker cannot satisfy 30%.
        let client = Arc::new(MockNodeClient::with_status([("g0", 10)]));
        let ctx = context(capacity.clone(), client.clone());

        let err = reserve_flow(&ctx, &PodKey::from("ns/p1"), &request(), "node-a")
            .await
            .unwrap_err();
        assert!(matches!(err.current_context(), ScheduleError::NoDevices { .. }));
        assert_eq!(
            capacity.release_calls(),
            vec![("ns/p1".to_string(), "node-a".to_string())]
        );
        assert!(client.reserve_calls().is_empty());
    }

    #[test(tokio::test)]
    async fn node_reserve_failure_retries_then_rolls_back() {
        let capacity = Arc::new(MockCapacityManager::new());
        let client = Arc::new(MockNodeClient::with_status([("g0", 100)]).failing_reserve());
        let ctx = context(capacity.clone(), client.clone());

        let err = reserve_flow(&ctx, &PodKey::from("ns/p1"), &request(), "node-a")
            .await
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            ScheduleError::NodeReserveFailed
        ));
        // All three attempts were made before compensating.
        assert_eq!(client.reserve_calls().len(), 3);
        assert_eq!(
            capacity.release_calls(),
            vec![("ns/p1".to_string(), "node-a".to_string())]
        );
    }

    #[test(tokio::test)]
    async fn cancellation_aborts_between_attempts() {
        let capacity = Arc::new(MockCapacityManager::new());
        let client = Arc::new(MockNodeClient::with_status([("g0", 100)]).failing_reserve());
        let mut ctx = context(capacity.clone(), client.clone());
        ctx.retry = RetryPolicy {
            attempts: 3,
            backoff: std::time::Duration::from_secs(30),
        };
        ctx.cancel.cancel();

        let err = reserve_flow(&ctx, &PodKey::from("ns/p1"), &request(), "node-a")
            .await
            .unwrap_err();
        assert!(matches!(err.current_context(), ScheduleError::Cancelled));
        // Cancelled mid-retry: only the first attempt happened, and no
        // further compensation was issued.
        assert_eq!(client.reserve_calls().len(), 1);
        assert!(capacity.release_calls().is_empty());
    }

    #[test(tokio::test)]
    async fn unreserve_flow_calls_node() {
        let capacity = Arc::new(MockCapacityManager::new());
        let client = Arc::new(MockNodeClient::with_status([("g0", 100)]));
        let ctx = context(capacity, client.clone());

        unreserve_flow(&ctx, &PodKey::from("ns/p1"), "node-a")
            .await
            .unwrap();
        assert_eq!(client.unreserve_calls(), vec!["ns/p1".to_string()]);
    }
}
