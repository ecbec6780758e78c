//! Node accountant client.
//!
//! Talks HTTP/1 to a node's accountant over its filesystem socket. Each
//! request opens a fresh connection with an overall deadline; the
//! scheduler mounts the per-node socket paths, so the resolver maps a node
//! name to the path to dial.

use std::path::PathBuf;
use std::time::Duration;

use api_types::ReserveRequest;
use api_types::StatusResponse;
use api_types::UnreserveRequest;
use async_trait::async_trait;
use bytes::Bytes;
use error_stack::Report;
use error_stack::ResultExt;
use http_body_util::BodyExt;
use http_body_util::Full;
use hyper::client::conn::http1;
use hyper::header::CONTENT_TYPE;
use hyper::header::HOST;
use hyper::Method;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tracing::debug;

use crate::errors::ClientError;

/// Default filesystem endpoint of a node's accountant socket, as mounted
/// into the scheduler.
pub const DEFAULT_SOCKET_PATH: &str = "/var/lib/kubelet/device-plugins/card-accountant.sock";

/// Scheduler-side view of one node accountant.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Fetch the node's remaining-percent snapshot.
    async fn status(&self, node: &str) -> Result<StatusResponse, Report<ClientError>>;

    /// Reserve percent for a pod on the listed cards.
    async fn reserve(
        &self,
        node: &str,
        pod_key: &str,
        devices: &[String],
        percent: u8,
    ) -> Result<(), Report<ClientError>>;

    /// Release a pod's pending reservation.
    async fn unreserve(&self, node: &str, pod_key: &str) -> Result<(), Report<ClientError>>;
}

/// Maps a node name to the socket path to dial.
pub type SocketResolver = Box<dyn Fn(&str) -> PathBuf + Send + Sync>;

/// HTTP-over-unix-socket implementation of [`NodeClient`].
pub struct UdsNodeClient {
    socket_for: SocketResolver,
    request_timeout: Duration,
}

impl Default for UdsNodeClient {
    fn default() -> Self {
        Self::new()
    }
}

impl UdsNodeClient {
    /// Client dialing the well-known socket path on every node.
    pub fn new() -> Self {
        Self {
            socket_for: Box::new(|_| PathBuf::from(DEFAULT_SOCKET_PATH)),
            request_timeout: Duration::from_secs(3),
        }
    }

    /// Client with a custom node-to-socket mapping (tests, multi-node
    /// simulation against local sockets).
    pub fn with_socket_resolver(socket_for: SocketResolver) -> Self {
        Self {
            socket_for,
            request_timeout: Duration::from_secs(3),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    async fn request(
        &self,
        node: &str,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Bytes, Report<ClientError>> {
        let socket = (self.socket_for)(node);
        debug!(node = %node, path = %path, socket = %socket.display(), "Dialing node accountant");

        let fut = async {
            let stream = UnixStream::connect(&socket)
                .await
                .map_err(|e| ClientError::Transport {
                    message: format!("connect {}: {e}", socket.display()),
                })?;
            let io = TokioIo::new(stream);
            let (mut sender, conn) =
                http1::handshake(io)
                    .await
                    .map_err(|e| ClientError::Transport {
                        message: format!("handshake: {e}"),
                    })?;
            // Drive the connection until the response is finished.
            tokio::spawn(async move {
                let _ = conn.await;
            });

            let request = Request::builder()
                .method(method)
                .uri(path)
                .header(HOST, "accountant")
                .header(CONTENT_TYPE, "application/json")
                .body(Full::new(Bytes::from(body.unwrap_or_default())))
                .map_err(|e| ClientError::Transport {
                    message: format!("build request: {e}"),
                })?;

            let response = sender
                .send_request(request)
                .await
                .map_err(|e| ClientError::Transport {
                    message: format!("send request: {e}"),
                })?;
            let status = response.status();
            if !status.is_success() {
                return Err(ClientError::Http {
                    status: status.as_u16(),
                });
            }
            let collected =
                response
                    .into_body()
                    .collect()
                    .await
                    .map_err(|e| ClientError::Transport {
                        message: format!("read body: {e}"),
                    })?;
            Ok(collected.to_bytes())
        };

        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(result) => result.map_err(Report::new),
            Err(_) => Err(Report::new(ClientError::DeadlineExceeded)),
        }
    }
}

#[async_trait]
impl NodeClient for UdsNodeClient {
    async fn status(&self, node: &str) -> Result<StatusResponse, Report<ClientError>> {
        let body = self.request(node, Method::GET, "/status", None).await?;
        serde_json::from_slice(&body).change_context(ClientError::Decode {
            message: "status body is not a card map".to_string(),
        })
    }

    async fn reserve(
        &self,
        node: &str,
        pod_key: &str,
        devices: &[String],
        percent: u8,
    ) -> Result<(), Report<ClientError>> {
        let payload = ReserveRequest {
            pod_key: pod_key.to_string(),
            devices: devices.to_vec(),
            percent,
        };
        let body = serde_json::to_vec(&payload).change_context(ClientError::Decode {
            message: "failed to encode reserve request".to_string(),
        })?;
        self.request(node, Method::POST, "/reserve", Some(body))
            .await?;
        Ok(())
    }

    async fn unreserve(&self, node: &str, pod_key: &str) -> Result<(), Report<ClientError>> {
        let payload = UnreserveRequest {
            pod_key: pod_key.to_string(),
        };
        let body = serde_json::to_vec(&payload).change_context(ClientError::Decode {
            message: "failed to encode unreserve request".to_string(),
        })?;
        self.request(node, Method::POST, "/unreserve", Some(body))
            .await?;
        Ok(())
    }
}

/// Bounded retry policy for node calls: `attempts` tries with linearly
/// increasing backoff (`backoff * attempt`).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            ..Self::default()
        }
    }

    /// Backoff before the next try after `attempt` (1-based) failed.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff * attempt
    }
}
