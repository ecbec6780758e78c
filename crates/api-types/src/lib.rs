//! Shared API type definitions
//!
//! This crate contains the type definitions shared between the node-local
//! accountant and the cluster-side scheduler: card identifiers, workload
//! share requests parsed from pod annotations, the local-socket wire bodies,
//! the durable reservation objects, and the container allocation response.

use std::collections::BTreeMap;

use core::error::Error;

use error_stack::Report;
use serde::Deserialize;
use serde::Serialize;

/// Domain prefix for cardshare annotations.
pub const CARDSHARE_DOMAIN: &str = "cardshare.io";

/// Annotation carrying the number of requested cards.
pub const CARDS_ANNOTATION: &str = "cardshare.io/cards";

/// Annotation carrying the per-card percentage.
pub const PERCENT_ANNOTATION: &str = "cardshare.io/percent";

/// Annotation written back with the host indices assigned to a container.
pub const ASSIGNED_CARDS_ANNOTATION: &str = "cardshare.io/assigned-cards";

/// Annotation mirroring the relative-index to card mapping.
pub const CARD_DEVICE_MAP_ANNOTATION: &str = "cardshare.io/card-device-map";

/// Separator between a card's base ID and its replica index.
const REPLICA_SEPARATOR: &str = "::";

/// Errors raised while interpreting workload metadata.
#[derive(Debug, derive_more::Display)]
pub enum AnnotationError {
    #[display("Invalid annotation value for {key}: {value}")]
    InvalidValue { key: String, value: String },
    #[display("Annotation {key} out of range: {value}")]
    OutOfRange { key: String, value: String },
}

impl Error for AnnotationError {}

/// One replica slot of a physical card, encoded `base::replicaIndex`.
///
/// Equality is literal; equality modulo [`AnnotatedId::base`] groups the
/// replicas of the same card. IDs without the separator refer to the whole
/// card and have no annotation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnnotatedId(String);

impl AnnotatedId {
    /// Build an annotated ID from a base card ID and a replica index.
    pub fn new(base: &str, replica: u32) -> Self {
        Self(format!("{base}{REPLICA_SEPARATOR}{replica}"))
    }

    /// The base card ID with any replica suffix stripped.
    pub fn base(&self) -> &str {
        match self.0.split_once(REPLICA_SEPARATOR) {
            Some((base, _)) => base,
            None => &self.0,
        }
    }

    /// Whether this ID carries a replica suffix.
    pub fn has_annotation(&self) -> bool {
        self.0.contains(REPLICA_SEPARATOR)
    }

    /// The replica index, when present and numeric.
    pub fn replica_index(&self) -> Option<u32> {
        self.0
            .split_once(REPLICA_SEPARATOR)
            .and_then(|(_, idx)| idx.parse().ok())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AnnotatedId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for AnnotatedId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for AnnotatedId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// `namespace/name` identifier for a workload instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PodKey(String);

impl PodKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self(format!("{namespace}/{name}"))
    }

    /// The namespace part; `default` when the key has no separator.
    pub fn namespace(&self) -> &str {
        match self.0.split_once('/') {
            Some((ns, _)) => ns,
            None => "default",
        }
    }

    /// The name part.
    pub fn name(&self) -> &str {
        match self.0.split_once('/') {
            Some((_, name)) => name,
            None => &self.0,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PodKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PodKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for PodKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// How many cards and what percent per card a workload requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareRequest {
    /// Number of cards, at least 1.
    pub num_cards: u32,
    /// Percent reserved on each card, 1..=100.
    pub percent_per_card: u8,
}

impl ShareRequest {
    /// Parse a share request from a pod's annotations.
    ///
    /// Returns `Ok(None)` when either annotation is missing; workloads
    /// without both annotations do not participate in card sharing.
    ///
    /// # Errors
    ///
    /// - [`AnnotationError::InvalidValue`] if a value is not an integer
    /// - [`AnnotationError::OutOfRange`] for zero cards or percent outside 1..=100
    pub fn from_annotations(
        annotations: &BTreeMap<String, String>,
    ) -> Result<Option<Self>, Report<AnnotationError>> {
        let (Some(cards), Some(percent)) = (
            annotations.get(CARDS_ANNOTATION),
            annotations.get(PERCENT_ANNOTATION),
        ) else {
            return Ok(None);
        };

        let num_cards: u32 = cards.parse().map_err(|_| {
            Report::new(AnnotationError::InvalidValue {
                key: CARDS_ANNOTATION.to_string(),
                value: cards.clone(),
            })
        })?;
        if num_cards == 0 {
            return Err(Report::new(AnnotationError::OutOfRange {
                key: CARDS_ANNOTATION.to_string(),
                value: cards.clone(),
            }));
        }

        let percent_per_card: u8 = percent.parse().map_err(|_| {
            Report::new(AnnotationError::InvalidValue {
                key: PERCENT_ANNOTATION.to_string(),
                value: percent.clone(),
            })
        })?;
        if percent_per_card == 0 || percent_per_card > 100 {
            return Err(Report::new(AnnotationError::OutOfRange {
                key: PERCENT_ANNOTATION.to_string(),
                value: percent.clone(),
            }));
        }

        Ok(Some(Self {
            num_cards,
            percent_per_card,
        }))
    }
}

/// `GET /status` response: card ID to remaining percent.
pub type StatusResponse = BTreeMap<String, u8>;

/// `POST /reserve` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveRequest {
    pub pod_key: String,
    pub devices: Vec<String>,
    pub percent: u8,
}

/// `POST /unreserve` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreserveRequest {
    pub pod_key: String,
}

/// Phase of a cluster-level reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReservationPhase {
    #[default]
    Pending,
    Reserved,
    Released,
    Failed,
}

impl std::fmt::Display for ReservationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Object metadata carried by the durable reservation objects.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectMeta {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

/// Desired reservation fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationSpec {
    #[serde(default)]
    pub pod_key: String,
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub num_cards: u32,
    #[serde(default)]
    pub percent_per_card: u8,
}

/// Observed reservation state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationStatus {
    #[serde(default)]
    pub phase: ReservationPhase,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_update_time: String,
}

/// A cluster-level reservation owned by the capacity manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ReservationSpec,
    #[serde(default)]
    pub status: ReservationStatus,
}

/// A single pod's hold on one card inside a node aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardReservation {
    pub pod_key: String,
    pub percent: u8,
}

/// Per-card entry of a node aggregate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardAggregate {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reservations: Vec<CardReservation>,
    #[serde(default)]
    pub total_reserved_percent: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeAggregateSpec {
    #[serde(default)]
    pub node_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeAggregateStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<CardAggregate>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_updated: String,
}

/// Per-node object listing all reservations and each card's reserved total.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeAggregate {
    #[serde(default)]
    pub spec: NodeAggregateSpec,
    #[serde(default)]
    pub status: NodeAggregateStatus,
}

/// A bind-mounted directory handed to the container runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountSpec {
    pub container_path: String,
    pub host_path: String,
    pub read_only: bool,
}

/// A device node exposed to the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceNodeSpec {
    pub container_path: String,
    pub host_path: String,
    pub permissions: String,
}

/// Everything a container runtime needs to wire an allocation into a
/// container: environment variables, informational annotations, directory
/// mounts and device nodes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerAllocation {
    pub envs: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub mounts: Vec<MountSpec>,
    pub devices: Vec<DeviceNodeSpec>,
}
