//! Device picker: choose cards on a node for a share request.

use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;

use crate::client::NodeClient;
use crate::errors::ScheduleError;

/// Pick `num_cards` cards on `node` whose remaining percent covers the
/// request. The status snapshot iterates in card-ID order, so ties break
/// the same way on every call and agree with scoring.
///
/// # Errors
///
/// - [`ScheduleError::NoDevices`] when the snapshot cannot be fetched or
///   fewer than `num_cards` cards meet the bar
pub async fn pick_devices(
    client: &dyn NodeClient,
    node: &str,
    num_cards: usize,
    percent: u8,
) -> Result<Vec<String>, Report<ScheduleError>> {
    let status = client
        .status(node)
        .await
        .change_context(ScheduleError::NoDevices {
            needed: num_cards,
            found: 0,
        })?;

    let picked: Vec<String> = status
        .iter()
        .filter(|(_, remaining)| **remaining >= percent)
        .take(num_cards)
        .map(|(id, _)| id.clone())
        .collect();

    if picked.len() < num_cards {
        return Err(Report::new(ScheduleError::NoDevices {
            needed: num_cards,
            found: picked.len(),
        }));
    }

    debug!(node = %node, cards = ?picked, percent = percent, "Picked devices");
    Ok(picked)
}
