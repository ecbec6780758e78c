//! Card registry: the devices this node exposes, with replica expansion.
//!
//! A card configured with R replica slots is published as R annotated IDs
//! (`uuid::0` .. `uuid::R-1`); the registry resolves either form back to the
//! owning device.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use api_types::AnnotatedId;
use tracing::info;

use crate::config::CardConfig;
use crate::config::DaemonArgs;
use crate::config::DeviceIdStrategy;

/// One resolvable device entry.
#[derive(Debug, Clone)]
pub struct Device {
    /// Identifier this entry is published under (annotated when replicated).
    pub id: String,
    /// Base card identifier with any replica suffix stripped.
    pub base_id: String,
    /// Host device index, as the runtime spells it.
    pub index: String,
    /// Replica capacity of the owning card.
    pub replicas: u32,
}

/// All devices on this node, keyed by published identifier.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<String, Device>,
}

impl DeviceRegistry {
    /// Build the registry from the card seed file, expanding replicas
    /// according to the daemon configuration.
    pub fn from_config(args: &DaemonArgs, cards: &[CardConfig]) -> Self {
        let mut devices = BTreeMap::new();
        for card in cards {
            let replicas = args.replicas_for(card);
            if replicas > 1 {
                for replica in 0..replicas {
                    let id = AnnotatedId::new(&card.uuid, replica).to_string();
                    devices.insert(
                        id.clone(),
                        Device {
                            id,
                            base_id: card.uuid.clone(),
                            index: card.index.to_string(),
                            replicas,
                        },
                    );
                }
            } else {
                devices.insert(
                    card.uuid.clone(),
                    Device {
                        id: card.uuid.clone(),
                        base_id: card.uuid.clone(),
                        index: card.index.to_string(),
                        replicas: 1,
                    },
                );
            }
        }
        info!(entries = devices.len(), cards = cards.len(), "Card registry built");
        Self { devices }
    }

    #[cfg(test)]
    pub(crate) fn from_devices(devices: Vec<Device>) -> Self {
        Self {
            devices: devices.into_iter().map(|d| (d.id.clone(), d)).collect(),
        }
    }

    /// Resolve a published or base identifier to its device.
    pub fn resolve(&self, id: &str) -> Option<&Device> {
        if let Some(device) = self.devices.get(id) {
            return Some(device);
        }
        let base = AnnotatedId::from(id).base().to_string();
        self.devices.values().find(|d| d.base_id == base)
    }

    /// Every published identifier, in deterministic order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }

    /// Unique base card identifiers, in deterministic order.
    pub fn base_ids(&self) -> BTreeSet<&str> {
        self.devices.values().map(|d| d.base_id.as_str()).collect()
    }

    /// Replica capacity of the card owning `id`, 1 when unknown.
    pub fn replicas_of(&self, id: &str) -> u32 {
        self.resolve(id).map(|d| d.replicas).unwrap_or(1)
    }

    /// Look a device up by host index.
    pub fn by_index(&self, index: &str) -> Option<&Device> {
        self.devices.values().find(|d| d.index == index)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Reduce the annotated IDs of an allocate request to the identifier form
/// the runtime expects: unique base UUIDs, or unique host indices.
pub fn unique_device_ids(
    registry: &DeviceRegistry,
    ids: &[String],
    strategy: DeviceIdStrategy,
) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for id in ids {
        let key = match strategy {
            DeviceIdStrategy::Uuid => AnnotatedId::from(id.as_str()).base().to_string(),
            DeviceIdStrategy::Index => match registry.resolve(id) {
                Some(device) => device.index.clone(),
                None => continue,
            },
        };
        if seen.insert(key.clone()) {
            out.push(key);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn replicated_registry() -> DeviceRegistry {
        let mut devices = Vec::new();
        for (idx, base) in ["GPU-a", "GPU-b"].iter().enumerate() {
            for replica in 0..3 {
                devices.push(Device {
                    id: AnnotatedId::new(base, replica).to_string(),
                    base_id: base.to_string(),
                    index: idx.to_string(),
                    replicas: 3,
                });
            }
        }
        DeviceRegistry::from_devices(devices)
    }

    #[test]
    fn resolve_annotated_and_base() {
        let registry = replicated_registry();
        assert_eq!(registry.resolve("GPU-a::1").unwrap().index, "0");
        assert_eq!(registry.resolve("GPU-b").unwrap().index, "1");
        assert!(registry.resolve("GPU-x").is_none());
    }

    #[test]
    fn unique_ids_by_uuid() {
        let registry = replicated_registry();
        let ids = vec![
            "GPU-a::0".to_string(),
            "GPU-a::1".to_string(),
            "GPU-b::2".to_string(),
        ];
        let unique = unique_device_ids(&registry, &ids, DeviceIdStrategy::Uuid);
        assert_eq!(unique, vec!["GPU-a".to_string(), "GPU-b".to_string()]);
    }

    #[test]
    fn unique_ids_by_index_skip_unknown() {
        let registry = replicated_registry();
        let ids = vec![
            "GPU-b::0".to_string(),
            "GPU-b::1".to_string(),
            "GPU-x::0".to_string(),
        ];
        let unique = unique_device_ids(&registry, &ids, DeviceIdStrategy::Index);
        assert_eq!(unique, vec!["1".to_string()]);
    }
}
