//! Authoritative per-card accounting state for one node.
//!
//! The store owns two maps guarded by a single reader/writer lock: the
//! remaining-percent ledger and the table of pending (not yet finalized)
//! reservations per pod. Reads take the read lock; reserve, unreserve and
//! finalize serialize on the write lock, so a single call is atomic across
//! every card it touches.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::RwLock;

use api_types::StatusResponse;
use error_stack::Report;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::errors::AccountantError;

/// Full capacity of a card.
pub const TOTAL_PERCENT: u8 = 100;

struct StoreInner {
    /// Card ID -> remaining percent, 0..=100.
    ledger: HashMap<String, u8>,
    /// Pod key -> card ID -> percent reserved but not yet finalized.
    pending: HashMap<String, HashMap<String, u8>>,
}

/// Node-local ledger plus pending-reservation table.
pub struct CardStore {
    inner: RwLock<StoreInner>,
}

impl CardStore {
    /// Create a store with every listed card at its full capacity.
    pub fn new<I, S>(cards: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ledger = cards
            .into_iter()
            .map(|id| (id.into(), TOTAL_PERCENT))
            .collect();
        Self {
            inner: RwLock::new(StoreInner {
                ledger,
                pending: HashMap::new(),
            }),
        }
    }

    /// Create a store with explicit remaining percents (tests, emulation).
    pub fn with_remaining<I, S>(cards: I) -> Self
    where
        I: IntoIterator<Item = (S, u8)>,
        S: Into<String>,
    {
        let ledger = cards
            .into_iter()
            .map(|(id, rem)| (id.into(), rem.min(TOTAL_PERCENT)))
            .collect();
        Self {
            inner: RwLock::new(StoreInner {
                ledger,
                pending: HashMap::new(),
            }),
        }
    }

    /// Snapshot of the ledger for `/status`. No side effects.
    pub fn snapshot(&self) -> Result<StatusResponse, Report<AccountantError>> {
        let inner = self
            .inner
            .read()
            .map_err(|_| Report::new(AccountantError::LockPoisoned))?;
        Ok(inner
            .ledger
            .iter()
            .map(|(id, rem)| (id.clone(), *rem))
            .collect())
    }

    /// Reserve up to `percent` on each listed card for `pod_key`.
    ///
    /// Each card grants `min(percent, remaining)`: a 30% request against a
    /// 20%-free card yields a 20% grant and leaves the card at 0. Grants
    /// accumulate when the same pod reserves the same card again. Cards
    /// unknown to the ledger grant nothing. The whole call is atomic across
    /// all listed cards.
    ///
    /// Returns the per-card grants actually applied.
    pub fn reserve(
        &self,
        pod_key: &str,
        devices: &[String],
        percent: u8,
    ) -> Result<BTreeMap<String, u8>, Report<AccountantError>> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| Report::new(AccountantError::LockPoisoned))?;

        let mut grants = BTreeMap::new();
        for device in devices {
            let Some(remaining) = inner.ledger.get_mut(device) else {
                warn!(device = %device, pod = %pod_key, "Reserve for unknown card, skipping");
                continue;
            };
            let grant = percent.min(*remaining);
            if grant == 0 {
                debug!(device = %device, pod = %pod_key, "Card exhausted, zero grant");
                continue;
            }
            *remaining -= grant;
            *inner
                .pending
                .entry(pod_key.to_string())
                .or_default()
                .entry(device.clone())
                .or_insert(0) += grant;
            grants.insert(device.clone(), grant);
        }

        info!(pod = %pod_key, requested = percent, ?grants, "Reservation applied");
        Ok(grants)
    }

    /// Return every still-pending percent of `pod_key` to the ledger and
    /// drop the pod's entry. Idempotent: a pod with no pending entries is a
    /// no-op, and percent consumed by finalization is not returned here.
    ///
    /// Returns the total percent credited back.
    pub fn unreserve(&self, pod_key: &str) -> Result<u32, Report<AccountantError>> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| Report::new(AccountantError::LockPoisoned))?;

        let Some(entries) = inner.pending.remove(pod_key) else {
            debug!(pod = %pod_key, "Unreserve without pending entries");
            return Ok(0);
        };

        let mut credited = 0u32;
        for (device, amount) in entries {
            if let Some(remaining) = inner.ledger.get_mut(&device) {
                *remaining = remaining.saturating_add(amount).min(TOTAL_PERCENT);
                credited += u32::from(amount);
            }
        }

        info!(pod = %pod_key, credited = credited, "Reservation released");
        Ok(credited)
    }

    /// Consume the pending entries for the given cards without crediting the
    /// ledger: the debit taken at reserve time stands, the reservation has
    /// become a real in-flight allocation. Entries already consumed are a
    /// no-op, so finalizing the same set twice changes nothing.
    ///
    /// Returns how many (pod, card) entries were consumed.
    pub fn finalize(&self, devices: &[String]) -> Result<usize, Report<AccountantError>> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| Report::new(AccountantError::LockPoisoned))?;

        let mut consumed = 0usize;
        for device in devices {
            // Bounded by the number of concurrently pending pods.
            let owner = inner
                .pending
                .iter()
                .find(|(_, cards)| cards.contains_key(device))
                .map(|(pod, _)| pod.clone());
            let Some(pod) = owner else {
                continue;
            };
            if let Some(cards) = inner.pending.get_mut(&pod) {
                cards.remove(device);
                consumed += 1;
                if cards.is_empty() {
                    inner.pending.remove(&pod);
                }
                debug!(pod = %pod, device = %device, "Pending entry finalized");
            }
        }

        Ok(consumed)
    }

    /// Pending percent for one pod (introspection and tests).
    pub fn pending_for(&self, pod_key: &str) -> Result<BTreeMap<String, u8>, Report<AccountantError>> {
        let inner = self
            .inner
            .read()
            .map_err(|_| Report::new(AccountantError::LockPoisoned))?;
        Ok(inner
            .pending
            .get(pod_key)
            .map(|cards| cards.iter().map(|(d, p)| (d.clone(), *p)).collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn remaining(store: &CardStore, device: &str) -> u8 {
        *store.snapshot().unwrap().get(device).unwrap()
    }

    /// Pending plus remaining must always add back to the full card.
    fn assert_conserved(store: &CardStore, device: &str, committed: u32) {
        let snapshot = store.snapshot().unwrap();
        let rem = u32::from(*snapshot.get(device).unwrap());
        let inner = store.inner.read().unwrap();
        let pending: u32 = inner
            .pending
            .values()
            .filter_map(|cards| cards.get(device))
            .map(|p| u32::from(*p))
            .sum();
        assert_eq!(rem + pending + committed, u32::from(TOTAL_PERCENT));
    }

    #[test]
    fn reserve_allocate_unreserve_lifecycle() {
        let store = CardStore::new(["dev0"]);

        let grants = store
            .reserve("ns/p1", &["dev0".to_string()], 30)
            .unwrap();
        assert_eq!(grants.get("dev0"), Some(&30));
        assert_eq!(remaining(&store, "dev0"), 70);
        assert_eq!(store.pending_for("ns/p1").unwrap().get("dev0"), Some(&30));
        assert_conserved(&store, "dev0", 0);

        let consumed = store.finalize(&["dev0".to_string()]).unwrap();
        assert_eq!(consumed, 1);
        assert_eq!(remaining(&store, "dev0"), 70);
        assert!(store.pending_for("ns/p1").unwrap().is_empty());

        // After full finalization the ledger must not move.
        store.unreserve("ns/p1").unwrap();
        assert_eq!(remaining(&store, "dev0"), 70);
    }

    #[test]
    fn overflow_reservations_grant_partially() {
        let store = CardStore::with_remaining([("dev0", 50)]);

        store.reserve("ns/p1", &["dev0".to_string()], 30).unwrap();
        assert_eq!(remaining(&store, "dev0"), 20);

        let grants = store
            .reserve("ns/p2", &["dev0".to_string()], 30)
            .unwrap();
        assert_eq!(grants.get("dev0"), Some(&20));
        assert_eq!(remaining(&store, "dev0"), 0);
        assert_eq!(store.pending_for("ns/p2").unwrap().get("dev0"), Some(&20));

        let credited = store.unreserve("ns/p1").unwrap();
        assert_eq!(credited, 30);
        assert_eq!(remaining(&store, "dev0"), 30);
    }

    #[test]
    fn partial_finalize_leaves_other_cards_pending() {
        let store = CardStore::new(["dev0", "dev1"]);

        store
            .reserve("ns/px", &["dev0".to_string(), "dev1".to_string()], 30)
            .unwrap();
        assert_eq!(remaining(&store, "dev0"), 70);
        assert_eq!(remaining(&store, "dev1"), 70);

        store.finalize(&["dev0".to_string()]).unwrap();
        let pending = store.pending_for("ns/px").unwrap();
        assert!(!pending.contains_key("dev0"));
        assert_eq!(pending.get("dev1"), Some(&30));
        assert_eq!(remaining(&store, "dev0"), 70);
        assert_eq!(remaining(&store, "dev1"), 70);
    }

    #[test]
    fn double_reserve_accumulates() {
        let store = CardStore::new(["dev0"]);

        store.reserve("ns/pd", &["dev0".to_string()], 20).unwrap();
        store.reserve("ns/pd", &["dev0".to_string()], 15).unwrap();

        assert_eq!(store.pending_for("ns/pd").unwrap().get("dev0"), Some(&35));
        assert_eq!(remaining(&store, "dev0"), 65);
        assert_conserved(&store, "dev0", 0);
    }

    #[test]
    fn finalize_is_idempotent() {
        let store = CardStore::new(["dev0"]);
        store.reserve("ns/p1", &["dev0".to_string()], 40).unwrap();

        assert_eq!(store.finalize(&["dev0".to_string()]).unwrap(), 1);
        assert_eq!(store.finalize(&["dev0".to_string()]).unwrap(), 0);
        assert_eq!(remaining(&store, "dev0"), 60);
        assert_conserved(&store, "dev0", 40);
    }

    #[test]
    fn unreserve_is_idempotent() {
        let store = CardStore::new(["dev0"]);
        assert_eq!(store.unreserve("ns/ghost").unwrap(), 0);
        assert_eq!(remaining(&store, "dev0"), 100);
    }

    #[test]
    fn unknown_card_grants_nothing() {
        let store = CardStore::new(["dev0"]);
        let grants = store
            .reserve("ns/p1", &["missing".to_string(), "dev0".to_string()], 10)
            .unwrap();
        assert_eq!(grants.len(), 1);
        assert_eq!(grants.get("dev0"), Some(&10));
    }

    #[test]
    fn reserve_never_debits_below_zero() {
        let store = CardStore::with_remaining([("dev0", 5)]);
        let grants = store
            .reserve("ns/p1", &["dev0".to_string()], 100)
            .unwrap();
        assert_eq!(grants.get("dev0"), Some(&5));
        assert_eq!(remaining(&store, "dev0"), 0);

        // A second reservation on an exhausted card grants nothing at all.
        let grants = store.reserve("ns/p2", &["dev0".to_string()], 1).unwrap();
        assert!(grants.is_empty());
        assert!(store.pending_for("ns/p2").unwrap().is_empty());
    }
}
