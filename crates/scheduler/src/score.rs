//! Node scoring: average remaining percent across the top-N cards.

use error_stack::Report;
use error_stack::ResultExt;

use crate::client::NodeClient;
use crate::errors::ScheduleError;

/// Score a node for a request of `num_cards` cards: the integer mean of the
/// N largest remaining percents, clamped to 0..=100. Nodes reporting fewer
/// than N cards are insufficient.
pub async fn score_node(
    client: &dyn NodeClient,
    node: &str,
    num_cards: usize,
) -> Result<u8, Report<ScheduleError>> {
    let status = client
        .status(node)
        .await
        .change_context(ScheduleError::Insufficient {
            needed: num_cards,
            have: 0,
        })?;

    if status.len() < num_cards {
        return Err(Report::new(ScheduleError::Insufficient {
            needed: num_cards,
            have: status.len(),
        }));
    }

    let mut remaining: Vec<u32> = status.values().map(|r| u32::from(*r)).collect();
    remaining.sort_unstable_by(|a, b| b.cmp(a));

    let sum: u32 = remaining.iter().take(num_cards).sum();
    let avg = sum / num_cards as u32;
    Ok(avg.min(100) as u8)
}
