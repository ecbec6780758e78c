//! Restart reconciliation.
//!
//! The ledger is process-local, so a restarted accountant comes up with
//! every card at full capacity while containers on this node may still be
//! running against earlier allocations. Before the socket starts serving,
//! this module lists the live pods scheduled to this node, re-reserves the
//! percent recorded in their share annotations against the cards named by
//! the assigned-cards annotation, and finalizes immediately so the debit
//! lands as committed, not pending.

use api_types::ShareRequest;
use api_types::ASSIGNED_CARDS_ANNOTATION;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Api;
use kube::Client;
use tracing::info;
use tracing::warn;

use crate::config::DaemonArgs;
use crate::errors::AccountantError;
use crate::registry::DeviceRegistry;
use crate::store::CardStore;

async fn build_client(args: &DaemonArgs) -> Result<Client, Report<AccountantError>> {
    match &args.kubeconfig {
        Some(path) => {
            let kubeconfig =
                Kubeconfig::read_from(path).change_context(AccountantError::ReplayFailed {
                    message: format!("failed to read kubeconfig {}", path.display()),
                })?;
            let config =
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .change_context(AccountantError::ReplayFailed {
                        message: "failed to build config from kubeconfig".to_string(),
                    })?;
            Client::try_from(config).change_context(AccountantError::ReplayFailed {
                message: "failed to create client from kubeconfig".to_string(),
            })
        }
        None => Client::try_default()
            .await
            .change_context(AccountantError::ReplayFailed {
                message: "failed to create in-cluster client".to_string(),
            }),
    }
}

/// Replay the committed reservations of live pods into a fresh ledger.
///
/// Returns the number of pods replayed. Pods without share annotations, or
/// without an assigned-cards annotation, are skipped; assigned cards that no
/// longer exist on this node are logged and skipped.
///
/// # Errors
///
/// - [`AccountantError::ReplayFailed`] if the pod list cannot be fetched
pub async fn replay_live_pods(
    args: &DaemonArgs,
    store: &CardStore,
    registry: &DeviceRegistry,
) -> Result<usize, Report<AccountantError>> {
    let client = build_client(args).await?;
    let pods: Api<Pod> = Api::all(client);

    let params = ListParams::default()
        .fields(&format!("spec.nodeName={},status.phase=Running", args.node_name));
    let list = pods
        .list(&params)
        .await
        .change_context(AccountantError::ReplayFailed {
            message: format!("failed to list pods on node {}", args.node_name),
        })?;

    let mut replayed = 0usize;
    for pod in list {
        let Some(annotations) = pod.metadata.annotations.as_ref() else {
            continue;
        };
        let request = match ShareRequest::from_annotations(annotations) {
            Ok(Some(request)) => request,
            Ok(None) => continue,
            Err(err) => {
                warn!(pod = ?pod.metadata.name, "Skipping pod with bad share annotations: {err:?}");
                continue;
            }
        };
        let Some(assigned) = annotations.get(ASSIGNED_CARDS_ANNOTATION) else {
            continue;
        };

        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
        let name = pod.metadata.name.as_deref().unwrap_or_default();
        let pod_key = format!("{namespace}/{name}");

        let mut cards = Vec::new();
        for index in assigned.split(',').filter(|s| !s.is_empty()) {
            match registry.by_index(index) {
                Some(device) => cards.push(device.base_id.clone()),
                None => {
                    warn!(pod = %pod_key, index = %index, "Assigned card no longer present, skipping");
                }
            }
        }
        if cards.is_empty() {
            continue;
        }

        store.reserve(&pod_key, &cards, request.percent_per_card)?;
        store.finalize(&cards)?;
        replayed += 1;
        info!(
            pod = %pod_key,
            cards = cards.len(),
            percent = request.percent_per_card,
            "Replayed committed reservation"
        );
    }

    Ok(replayed)
}
