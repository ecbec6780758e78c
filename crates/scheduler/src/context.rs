//! Dependency bundle threaded through the scheduling phases.
//!
//! Everything the flows touch arrives through this context, so tests swap
//! in mocks and nothing reaches for process globals.

use std::sync::Arc;

use error_stack::Report;
use tokio_util::sync::CancellationToken;

use crate::capacity::CapacityManager;
use crate::capacity::InMemoryCapacityManager;
use crate::client::NodeClient;
use crate::client::RetryPolicy;
use crate::durable::RestCapacityManager;
use crate::errors::CapacityError;

/// Which capacity-manager backing to run with.
pub enum CapacityBackend {
    /// Single-instance scheduler, reservations held in process memory.
    InMemory,
    /// Reservations persisted to a REST-style object store.
    Durable {
        base_url: String,
        token: Option<String>,
    },
}

/// Injected collaborators of one scheduler instance.
pub struct SchedulerContext {
    /// Cluster-level reservation gate.
    pub capacity: Arc<dyn CapacityManager>,
    /// Client talking to the per-node accountants.
    pub client: Arc<dyn NodeClient>,
    /// Retry policy for node reserve/unreserve calls.
    pub retry: RetryPolicy,
    /// Cancellation for the whole scheduler; retry sleeps race this.
    pub cancel: CancellationToken,
}

impl SchedulerContext {
    pub fn new(capacity: Arc<dyn CapacityManager>, client: Arc<dyn NodeClient>) -> Self {
        Self {
            capacity,
            client,
            retry: RetryPolicy::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Build a context from the recognized configuration options: the
    /// capacity backend and the node-call retry budget.
    ///
    /// # Errors
    ///
    /// - [`CapacityError::Backend`] if the durable backend client cannot be
    ///   built
    pub fn from_config(
        backend: CapacityBackend,
        client: Arc<dyn NodeClient>,
        retry_attempts: u32,
    ) -> Result<Self, Report<CapacityError>> {
        let capacity: Arc<dyn CapacityManager> = match backend {
            CapacityBackend::InMemory => Arc::new(InMemoryCapacityManager::new()),
            CapacityBackend::Durable { base_url, token } => {
                Arc::new(RestCapacityManager::new(&base_url, token)?)
            }
        };
        Ok(Self::new(capacity, client).with_retry(RetryPolicy::new(retry_attempts)))
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::mock::MockNodeClient;

    #[test]
    fn from_config_applies_retry_budget() {
        let ctx = SchedulerContext::from_config(
            CapacityBackend::InMemory,
            Arc::new(MockNodeClient::with_status([("g0", 100)])),
            5,
        )
        .unwrap();
        assert_eq!(ctx.retry.attempts, 5);
    }

    #[test]
    fn durable_backend_builds() {
        let ctx = SchedulerContext::from_config(
            CapacityBackend::Durable {
                base_url: "https://control-plane:6443".to_string(),
                token: Some("secret".to_string()),
            },
            Arc::new(MockNodeClient::with_status([("g0", 100)])),
            3,
        );
        assert!(ctx.is_ok());
    }
}
