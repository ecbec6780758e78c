//! Replica-slot placement over physical cards.
//!
//! Two policies are offered. The packed policy is capacity-aware best-fit:
//! it fills cards before opening new ones, preserving whole cards for large
//! future requests. The distributed companion ranks cards by how many of
//! their replicas are already taken and consumes the most-loaded card first,
//! re-ranking after every pick. Both are deterministic: groups iterate in
//! base-ID order and each group's replica IDs are sorted ascending, so two
//! instances given identical state reach identical decisions.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use api_types::AnnotatedId;
use error_stack::Report;

use crate::errors::AllocError;
use crate::registry::DeviceRegistry;

/// Pluggable ordering hook for topology-aware placement. The in-repo
/// implementation has no link information and falls back to packing.
pub trait TopologyPolicy: Send + Sync {
    fn allocate(
        &self,
        registry: &DeviceRegistry,
        available: &[String],
        required: &[String],
        size: usize,
    ) -> Result<Vec<String>, Report<AllocError>>;
}

/// Topology fallback that delegates to best-fit packing.
#[derive(Debug, Default)]
pub struct PackedFallbackTopology;

impl TopologyPolicy for PackedFallbackTopology {
    fn allocate(
        &self,
        registry: &DeviceRegistry,
        available: &[String],
        required: &[String],
        size: usize,
    ) -> Result<Vec<String>, Report<AllocError>> {
        packed_alloc(registry, available, required, size)
    }
}

/// Candidate replica IDs: available minus required, registry-known only,
/// deduplicated, grouped by base card in deterministic order.
fn candidate_groups(
    registry: &DeviceRegistry,
    available: &[String],
    required: &[String],
) -> BTreeMap<String, Vec<String>> {
    let required: BTreeSet<&str> = required.iter().map(String::as_str).collect();
    let mut seen = BTreeSet::new();
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for id in available {
        if required.contains(id.as_str()) || !seen.insert(id.as_str()) {
            continue;
        }
        if registry.resolve(id).is_none() {
            continue;
        }
        let base = AnnotatedId::from(id.as_str()).base().to_string();
        groups.entry(base).or_default().push(id.clone());
    }
    for ids in groups.values_mut() {
        ids.sort();
    }
    groups
}

fn required_counts(required: &[String]) -> BTreeMap<String, usize> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for id in required {
        *counts
            .entry(AnnotatedId::from(id.as_str()).base().to_string())
            .or_default() += 1;
    }
    counts
}

/// Capacity-aware best-fit packing.
///
/// Returns `size` replica IDs including `required`, never assigning more
/// replicas to a card than its capacity (counting the required set). When
/// the full request cannot be met the result is best-effort, except that a
/// request with zero allocatable slots fails with [`AllocError::NoCapacity`].
pub fn packed_alloc(
    registry: &DeviceRegistry,
    available: &[String],
    required: &[String],
    size: usize,
) -> Result<Vec<String>, Report<AllocError>> {
    let needed = size.saturating_sub(required.len());
    if needed == 0 {
        return Ok(required.to_vec());
    }

    let mut groups = candidate_groups(registry, available, required);
    let req_count = required_counts(required);

    let capacity: BTreeMap<String, usize> = groups
        .keys()
        .map(|base| (base.clone(), registry.replicas_of(base) as usize))
        .collect();
    let mut used: BTreeMap<String, usize> = req_count;

    let total_allocatable: usize = groups
        .iter()
        .map(|(base, ids)| {
            let rem_cap = capacity[base].saturating_sub(*used.get(base).unwrap_or(&0));
            ids.len().min(rem_cap)
        })
        .sum();
    if total_allocatable == 0 {
        return Err(Report::new(AllocError::NoCapacity));
    }

    // Single-base fast path: a card that satisfies the whole remainder with
    // minimal leftover wins outright.
    let mut best: Option<(&String, usize)> = None;
    for (base, ids) in &groups {
        let rem_cap = capacity[base].saturating_sub(*used.get(base).unwrap_or(&0));
        let max_alloc = ids.len().min(rem_cap);
        if max_alloc >= needed {
            let leftover = max_alloc - needed;
            let better = match best {
                None => true,
                Some((best_base, best_leftover)) => {
                    leftover < best_leftover || (leftover == best_leftover && base < best_base)
                }
            };
            if better {
                best = Some((base, leftover));
            }
        }
    }
    if let Some((base, _)) = best {
        let mut out = required.to_vec();
        out.extend_from_slice(&groups[base][..needed]);
        return Ok(out);
    }

    // Iterative best-fit: repeatedly take from the card whose remaining
    // capacity after the grab is smallest; ties prefer the larger grab,
    // then the smaller base ID. Stops best-effort when nothing is left.
    let mut remaining = needed;
    let mut selected = Vec::new();
    while remaining > 0 {
        let mut chosen: Option<(String, usize, usize)> = None; // (base, alloc, leftover)
        for (base, ids) in &groups {
            let rem_cap = capacity[base].saturating_sub(*used.get(base).unwrap_or(&0));
            let alloc = ids.len().min(rem_cap).min(remaining);
            if alloc == 0 {
                continue;
            }
            let leftover = rem_cap - alloc;
            let better = match &chosen {
                None => true,
                Some((chosen_base, chosen_alloc, chosen_leftover)) => {
                    leftover < *chosen_leftover
                        || (leftover == *chosen_leftover && alloc > *chosen_alloc)
                        || (leftover == *chosen_leftover
                            && alloc == *chosen_alloc
                            && base < chosen_base)
                }
            };
            if better {
                chosen = Some((base.clone(), alloc, leftover));
            }
        }
        let Some((base, alloc, _)) = chosen else {
            break;
        };
        let ids = groups.get_mut(&base).expect("chosen base exists");
        selected.extend(ids.drain(..alloc));
        *used.entry(base).or_default() += alloc;
        remaining -= alloc;
    }

    let mut out = required.to_vec();
    out.extend(selected);
    Ok(out)
}

/// Imbalance-first placement: candidates are re-ranked after every pick by
/// how many of the card's replicas are already taken (most-taken first,
/// base ID as the tie-break), so partially drained cards are topped up
/// before untouched ones.
pub fn distributed_alloc(
    registry: &DeviceRegistry,
    available: &[String],
    required: &[String],
    size: usize,
) -> Result<Vec<String>, Report<AllocError>> {
    let needed = size.saturating_sub(required.len());
    if needed == 0 {
        return Ok(required.to_vec());
    }

    let groups = candidate_groups(registry, available, required);
    let mut candidates: Vec<String> = groups.values().flatten().cloned().collect();
    if candidates.len() < needed {
        return Err(Report::new(AllocError::InsufficientReplicas {
            needed,
            available: candidates.len(),
        }));
    }

    // Per-base replica bookkeeping: total slots the registry publishes,
    // available slots among the candidates.
    let mut avail_count: BTreeMap<String, i64> = BTreeMap::new();
    for id in &candidates {
        *avail_count
            .entry(AnnotatedId::from(id.as_str()).base().to_string())
            .or_default() += 1;
    }
    let total_count: BTreeMap<String, i64> = avail_count
        .keys()
        .map(|base| {
            let total = registry
                .ids()
                .filter(|id| AnnotatedId::from(*id).base() == base)
                .count() as i64;
            (base.clone(), total)
        })
        .collect();

    let mut selected = Vec::with_capacity(needed);
    for _ in 0..needed {
        candidates.sort_by(|a, b| {
            let a_id = AnnotatedId::from(a.as_str());
            let b_id = AnnotatedId::from(b.as_str());
            let a_diff = total_count[a_id.base()] - avail_count[a_id.base()];
            let b_diff = total_count[b_id.base()] - avail_count[b_id.base()];
            b_diff.cmp(&a_diff).then_with(|| a.cmp(b))
        });
        let picked = candidates.remove(0);
        let picked_id = AnnotatedId::from(picked.as_str());
        *avail_count
            .get_mut(picked_id.base())
            .expect("picked base tracked") -= 1;
        selected.push(picked);
    }

    let mut out = required.to_vec();
    out.extend(selected);
    Ok(out)
}
