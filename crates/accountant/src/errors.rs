use core::error::Error;

/// Accountant errors
#[derive(Debug, derive_more::Display)]
pub enum AccountantError {
    #[display("Store lock poisoned")]
    LockPoisoned,
    #[display("Server error: {message}")]
    ServerError { message: String },
    #[display("Replay failed: {message}")]
    ReplayFailed { message: String },
}

impl Error for AccountantError {}

/// Allocation errors surfaced by the replica allocators.
#[derive(Debug, PartialEq, Eq, derive_more::Display)]
pub enum AllocError {
    #[display("unable to allocate any replica slots to satisfy request")]
    NoCapacity,
    #[display("not enough available replicas: need {needed}, have {available}")]
    InsufficientReplicas { needed: usize, available: usize },
}

impl Error for AllocError {}
