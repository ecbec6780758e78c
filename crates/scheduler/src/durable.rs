//! Durable capacity manager backed by a REST-style object store.
//!
//! Each reserve creates a persistent `Reservation` object in the pod's
//! namespace; the reconciler (see [`crate::reconcile`]) merges accepted
//! reservations into per-node aggregates. Release deletes the object and
//! tolerates it being gone already.

use api_types::ObjectMeta;
use api_types::PodKey;
use api_types::Reservation;
use api_types::ReservationSpec;
use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use reqwest::StatusCode;
use tracing::info;

use crate::capacity::CapacityManager;
use crate::errors::CapacityError;

/// API group the reservation objects live under.
pub const RESERVATION_GROUP: &str = "cardshare.io";

/// API version of the reservation objects.
pub const RESERVATION_VERSION: &str = "v1";

/// REST-backed [`CapacityManager`].
pub struct RestCapacityManager {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl RestCapacityManager {
    /// Build a manager against `base_url` (e.g. the API server host), with
    /// an optional bearer token.
    ///
    /// # Errors
    ///
    /// - [`CapacityError::Backend`] if the HTTP client cannot be built
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, Report<CapacityError>> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .change_context(CapacityError::Backend {
                message: "failed to build HTTP client".to_string(),
            })?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn collection_url(&self, namespace: &str) -> String {
        format!(
            "{}/apis/{}/{}/namespaces/{}/reservations",
            self.base_url, RESERVATION_GROUP, RESERVATION_VERSION, namespace
        )
    }

    fn object_url(&self, namespace: &str, name: &str) -> String {
        format!("{}/{}", self.collection_url(namespace), name)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl CapacityManager for RestCapacityManager {
    async fn reserve(
        &self,
        pod_key: &str,
        node_name: &str,
        num_cards: u32,
        percent: u8,
    ) -> Result<(), Report<CapacityError>> {
        let key = PodKey::from(pod_key);
        let body = Reservation {
            api_version: format!("{RESERVATION_GROUP}/{RESERVATION_VERSION}"),
            kind: "Reservation".to_string(),
            metadata: ObjectMeta {
                // The pod name keeps the objects human-friendly.
                name: key.name().to_string(),
                namespace: key.namespace().to_string(),
            },
            spec: ReservationSpec {
                pod_key: pod_key.to_string(),
                node_name: node_name.to_string(),
                num_cards,
                percent_per_card: percent,
            },
            status: Default::default(),
        };

        let response = self
            .authorize(self.http.post(self.collection_url(key.namespace())))
            .json(&body)
            .send()
            .await
            .change_context(CapacityError::Backend {
                message: "reservation create request failed".to_string(),
            })?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => {
                info!(pod = %pod_key, node = %node_name, "Durable reservation created");
                Ok(())
            }
            status => {
                let detail = response.text().await.unwrap_or_default();
                Err(Report::new(CapacityError::Rejected {
                    message: format!("reservation create failed: status={status} body={detail}"),
                }))
            }
        }
    }

    async fn release(&self, pod_key: &str, _node_name: &str) -> Result<(), Report<CapacityError>> {
        let key = PodKey::from(pod_key);
        let response = self
            .authorize(self.http.delete(self.object_url(key.namespace(), key.name())))
            .send()
            .await
            .change_context(CapacityError::Backend {
                message: "reservation delete request failed".to_string(),
            })?;

        match response.status() {
            StatusCode::OK | StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(()),
            status => {
                let detail = response.text().await.unwrap_or_default();
                Err(Report::new(CapacityError::Backend {
                    message: format!("reservation delete failed: status={status} body={detail}"),
                }))
            }
        }
    }
}
