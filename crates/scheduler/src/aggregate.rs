//! Node aggregate bookkeeping: merging reservations into per-node state
//! and removing them again, enforcing the 100%-per-card ceiling.

use api_types::CardReservation;
use api_types::NodeAggregate;
use api_types::ReservationSpec;
use error_stack::Report;

use crate::errors::MergeError;

/// Merge a reservation into a node aggregate, returning the updated copy.
///
/// Candidate cards are those whose reserved total stays within 100% after
/// the reservation; the first `num_cards` candidates (aggregate order, which
/// is deterministic for a given object) receive the reservation. On any
/// failure the input aggregate is untouched.
///
/// # Errors
///
/// - [`MergeError::NodeMismatch`] if the aggregate belongs to another node
/// - [`MergeError::InsufficientCapacity`] if too few cards have headroom
pub fn merge(
    node: &NodeAggregate,
    spec: &ReservationSpec,
) -> Result<NodeAggregate, Report<MergeError>> {
    if !node.spec.node_name.is_empty()
        && !spec.node_name.is_empty()
        && node.spec.node_name != spec.node_name
    {
        return Err(Report::new(MergeError::NodeMismatch {
            aggregate: node.spec.node_name.clone(),
            reservation: spec.node_name.clone(),
        }));
    }

    let percent = u32::from(spec.percent_per_card);
    let candidates: Vec<usize> = node
        .status
        .devices
        .iter()
        .enumerate()
        .filter(|(_, card)| card.total_reserved_percent + percent <= 100)
        .map(|(i, _)| i)
        .collect();

    if (candidates.len() as u32) < spec.num_cards {
        return Err(Report::new(MergeError::InsufficientCapacity {
            needed: spec.num_cards,
            candidates: candidates.len(),
        }));
    }

    let mut updated = node.clone();
    for idx in candidates.into_iter().take(spec.num_cards as usize) {
        let card = &mut updated.status.devices[idx];
        card.reservations.push(CardReservation {
            pod_key: spec.pod_key.clone(),
            percent: spec.percent_per_card,
        });
        card.total_reserved_percent += percent;
    }

    Ok(updated)
}

/// Remove every reservation of `pod_key` from the aggregate, clamping the
/// per-card totals at zero.
pub fn remove(node: &NodeAggregate, pod_key: &str) -> NodeAggregate {
    let mut updated = node.clone();
    for card in &mut updated.status.devices {
        let mut removed = 0u32;
        card.reservations.retain(|reservation| {
            if reservation.pod_key == pod_key {
                removed += u32::from(reservation.percent);
                false
            } else {
                true
            }
        });
        card.total_reserved_percent = card.total_reserved_percent.saturating_sub(removed);
    }
    updated
}
