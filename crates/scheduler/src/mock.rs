//! Test doubles for the scheduler's injected collaborators.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use api_types::StatusResponse;
use async_trait::async_trait;
use error_stack::Report;

use crate::capacity::CapacityManager;
use crate::client::NodeClient;
use crate::errors::CapacityError;
use crate::errors::ClientError;

/// Scripted node client recording every call.
pub(crate) struct MockNodeClient {
    status: Option<StatusResponse>,
    fail_reserve: bool,
    status_calls: AtomicUsize,
    reserve_calls: Mutex<Vec<(String, String, Vec<String>, u8)>>,
    unreserve_calls: Mutex<Vec<String>>,
}

impl MockNodeClient {
    pub(crate) fn with_status<const N: usize>(cards: [(&str, u8); N]) -> Self {
        Self {
            status: Some(
                cards
                    .into_iter()
                    .map(|(id, rem)| (id.to_string(), rem))
                    .collect(),
            ),
            fail_reserve: false,
            status_calls: AtomicUsize::new(0),
            reserve_calls: Mutex::new(Vec::new()),
            unreserve_calls: Mutex::new(Vec::new()),
        }
    }

    /// A client whose status endpoint is unreachable.
    pub(crate) fn failing() -> Self {
        Self {
            status: None,
            fail_reserve: false,
            status_calls: AtomicUsize::new(0),
            reserve_calls: Mutex::new(Vec::new()),
            unreserve_calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing_reserve(mut self) -> Self {
        self.fail_reserve = true;
        self
    }

    pub(crate) fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn reserve_calls(&self) -> Vec<(String, String, Vec<String>, u8)> {
        self.reserve_calls.lock().expect("mock lock").clone()
    }

    pub(crate) fn unreserve_calls(&self) -> Vec<String> {
        self.unreserve_calls.lock().expect("mock lock").clone()
    }
}

#[async_trait]
impl NodeClient for MockNodeClient {
    async fn status(&self, _node: &str) -> Result<StatusResponse, Report<ClientError>> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        match &self.status {
            Some(status) => Ok(status.clone()),
            None => Err(Report::new(ClientError::Transport {
                message: "mock status unavailable".to_string(),
            })),
        }
    }

    async fn reserve(
        &self,
        node: &str,
        pod_key: &str,
        devices: &[String],
        percent: u8,
    ) -> Result<(), Report<ClientError>> {
        self.reserve_calls.lock().expect("mock lock").push((
            node.to_string(),
            pod_key.to_string(),
            devices.to_vec(),
            percent,
        ));
        if self.fail_reserve {
            return Err(Report::new(ClientError::Http { status: 500 }));
        }
        Ok(())
    }

    async fn unreserve(&self, _node: &str, pod_key: &str) -> Result<(), Report<ClientError>> {
        self.unreserve_calls
            .lock()
            .expect("mock lock")
            .push(pod_key.to_string());
        Ok(())
    }
}

/// Capacity manager double recording reserve/release pairs.
pub(crate) struct MockCapacityManager {
    reject: bool,
    reserve_calls: Mutex<Vec<(String, String)>>,
    release_calls: Mutex<Vec<(String, String)>>,
}

impl MockCapacityManager {
    pub(crate) fn new() -> Self {
        Self {
            reject: false,
            reserve_calls: Mutex::new(Vec::new()),
            release_calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn rejecting() -> Self {
        Self {
            reject: true,
            ..Self::new()
        }
    }

    pub(crate) fn reserve_calls(&self) -> Vec<(String, String)> {
        self.reserve_calls.lock().expect("mock lock").clone()
    }

    pub(crate) fn release_calls(&self) -> Vec<(String, String)> {
        self.release_calls.lock().expect("mock lock").clone()
    }
}

#[async_trait]
impl CapacityManager for MockCapacityManager {
    async fn reserve(
        &self,
        pod_key: &str,
        node_name: &str,
        _num_cards: u32,
        _percent: u8,
    ) -> Result<(), Report<CapacityError>> {
        if self.reject {
            return Err(Report::new(CapacityError::Rejected {
                message: "mock rejection".to_string(),
            }));
        }
        self.reserve_calls
            .lock()
            .expect("mock lock")
            .push((pod_key.to_string(), node_name.to_string()));
        Ok(())
    }

    async fn release(&self, pod_key: &str, node_name: &str) -> Result<(), Report<CapacityError>> {
        self.release_calls
            .lock()
            .expect("mock lock")
            .push((pod_key.to_string(), node_name.to_string()));
        Ok(())
    }
}
