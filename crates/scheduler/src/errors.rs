//! Error taxonomy of the scheduling side.
//!
//! Transport-level failures are retried by the client layer and never
//! surface directly; everything else maps to a phase status: capacity
//! shortfalls make the pod unschedulable, internal faults abort the cycle.

use core::error::Error;

/// Transport and protocol errors talking to a node accountant. These are
/// the retriable kind; after the retry budget they surface as
/// [`ScheduleError::NodeReserveFailed`].
#[derive(Debug, derive_more::Display)]
pub enum ClientError {
    #[display("Transport error: {message}")]
    Transport { message: String },
    #[display("Node returned status {status}")]
    Http { status: u16 },
    #[display("Failed to decode node response: {message}")]
    Decode { message: String },
    #[display("Request deadline exceeded")]
    DeadlineExceeded,
}

impl Error for ClientError {}

/// Errors from the cluster capacity manager.
#[derive(Debug, derive_more::Display)]
pub enum CapacityError {
    #[display("Reservation rejected: {message}")]
    Rejected { message: String },
    #[display("Capacity backend error: {message}")]
    Backend { message: String },
}

impl Error for CapacityError {}

/// Errors from merging a reservation into a node aggregate.
#[derive(Debug, derive_more::Display)]
pub enum MergeError {
    #[display("node mismatch: aggregate for {aggregate} vs reservation for {reservation}")]
    NodeMismatch {
        aggregate: String,
        reservation: String,
    },
    #[display("insufficient capacity: need {needed} cards, have {candidates} candidates")]
    InsufficientCapacity { needed: u32, candidates: usize },
}

impl Error for MergeError {}

/// Errors from the durable reservation store backend.
#[derive(Debug, derive_more::Display)]
pub enum StoreBackendError {
    #[display("aggregate version conflict")]
    Conflict,
    #[display("store backend error: {message}")]
    Backend { message: String },
}

impl Error for StoreBackendError {}

/// Errors surfaced to the scheduling glue.
#[derive(Debug, derive_more::Display)]
pub enum ScheduleError {
    #[display("cluster reservation rejected")]
    ReservationRejected,
    #[display("no devices: need {needed}, found {found}")]
    NoDevices { needed: usize, found: usize },
    #[display("insufficient cards on node: need {needed}, have {have}")]
    Insufficient { needed: usize, have: usize },
    #[display("node reserve failed after retries")]
    NodeReserveFailed,
    #[display("node unreserve failed after retries")]
    NodeUnreserveFailed,
    #[display("operation cancelled")]
    Cancelled,
}

impl ScheduleError {
    /// Capacity shortfalls make the pod unschedulable; everything else is
    /// an internal fault of the cycle.
    pub fn is_unschedulable(&self) -> bool {
        matches!(
            self,
            Self::ReservationRejected | Self::NoDevices { .. } | Self::Insufficient { .. }
        )
    }
}

impl Error for ScheduleError {}
