//! The cluster API client used against a real control plane.

use std::{fs, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    cluster::{ApiStatus, ClusterClient, ClusterError, ConfigMap, NetworkPolicy, ObjectList, Pod},
    AirlockResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The API server address when running inside the cluster
pub const IN_CLUSTER_API_URL: &str = "https://kubernetes.default.svc";

/// Where the service account token is mounted inside a pod
pub const SERVICE_ACCOUNT_TOKEN_PATH: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// Where the cluster CA certificate is mounted inside a pod
pub const SERVICE_ACCOUNT_CA_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

/// Maximum number of retries for transient API failures
const MAX_API_RETRIES: u32 = 3;

/// Per-request timeout for API calls
const API_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A [`ClusterClient`] speaking to the cluster's REST API.
///
/// Transient failures are retried with exponential backoff; 404 and 409 pass through untouched
/// so callers see the idempotence and compare-and-swap outcomes they expect.
#[derive(Debug)]
pub struct HttpCluster {
    /// The HTTP client with retry middleware.
    client: ClientWithMiddleware,

    /// The API server base URL, without a trailing slash.
    base_url: String,

    /// The bearer token presented on every request, if any.
    token: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HttpCluster {
    /// Creates a client for the given API server URL without authentication.
    ///
    /// Useful against `kubectl proxy` or a local test API server.
    pub fn new(api_url: &str) -> AirlockResult<Self> {
        let client = Client::builder().timeout(API_REQUEST_TIMEOUT).build()?;
        Ok(Self::with_parts(api_url, client, None))
    }

    /// Creates a client from the service account mounted into the controller's own pod.
    pub fn in_cluster() -> AirlockResult<Self> {
        let token = fs::read_to_string(SERVICE_ACCOUNT_TOKEN_PATH)?;
        let ca = fs::read(SERVICE_ACCOUNT_CA_PATH)?;

        let client = Client::builder()
            .timeout(API_REQUEST_TIMEOUT)
            .add_root_certificate(reqwest::Certificate::from_pem(&ca)?)
            .build()?;

        Ok(Self::with_parts(
            IN_CLUSTER_API_URL,
            client,
            Some(token.trim().to_string()),
        ))
    }

    fn with_parts(api_url: &str, client: Client, token: Option<String>) -> Self {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(MAX_API_RETRIES);
        let client = ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Self {
            client,
            base_url: api_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn request(&self, method: Method, url: &str) -> reqwest_middleware::RequestBuilder {
        let mut builder = self.client.request(method, url);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    fn pods_url(&self, namespace: &str) -> String {
        format!("{}/api/v1/namespaces/{}/pods", self.base_url, namespace)
    }

    fn config_maps_url(&self, namespace: &str) -> String {
        format!("{}/api/v1/namespaces/{}/configmaps", self.base_url, namespace)
    }

    fn network_policies_url(&self, namespace: &str) -> String {
        format!(
            "{}/apis/networking.k8s.io/v1/namespaces/{}/networkpolicies",
            self.base_url, namespace
        )
    }

    async fn create_object<T>(&self, url: &str, body: &T, kind: &str, name: &str) -> AirlockResult<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let response = self.request(Method::POST, url).json(body).send().await?;
        Self::decode_object(response, kind, name).await
    }

    async fn get_object<T>(&self, url: &str, kind: &str, name: &str) -> AirlockResult<T>
    where
        T: DeserializeOwned,
    {
        let response = self.request(Method::GET, url).send().await?;
        Self::decode_object(response, kind, name).await
    }

    async fn replace_object<T>(
        &self,
        url: &str,
        body: &T,
        kind: &str,
        name: &str,
    ) -> AirlockResult<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let response = self.request(Method::PUT, url).json(body).send().await?;
        Self::decode_object(response, kind, name).await
    }

    async fn list_objects<T>(&self, url: &str, label_selector: &str) -> AirlockResult<Vec<T>>
    where
        T: DeserializeOwned,
    {
        let response = self
            .request(Method::GET, url)
            .query(&[("labelSelector", label_selector)])
            .send()
            .await?;
        let list: ObjectList<T> = Self::decode_object(response, "List", "").await?;
        Ok(list.items)
    }

    async fn delete_object(&self, url: &str, kind: &str, name: &str) -> AirlockResult<bool> {
        let response = self.request(Method::DELETE, url).send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(true);
        }
        if status == StatusCode::NOT_FOUND {
            return Ok(false);
        }

        Err(Self::api_error(response, kind, name).await.into())
    }

    async fn decode_object<T>(
        response: reqwest::Response,
        kind: &str,
        name: &str,
    ) -> AirlockResult<T>
    where
        T: DeserializeOwned,
    {
        if response.status().is_success() {
            return Ok(response.json().await?);
        }
        Err(Self::api_error(response, kind, name).await.into())
    }

    async fn api_error(response: reqwest::Response, kind: &str, name: &str) -> ClusterError {
        let status = response.status().as_u16();
        let detail: ApiStatus = response.json().await.unwrap_or_default();
        classify_failure(status, detail, kind, name)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Maps an API failure status to the closed [`ClusterError`] taxonomy.
///
/// 409 means "already exists" on create and "stale resource version" on replace; the API's
/// `reason` field tells them apart.
fn classify_failure(status: u16, detail: ApiStatus, kind: &str, name: &str) -> ClusterError {
    match status {
        404 => ClusterError::NotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        },
        409 if detail.reason.as_deref() == Some("AlreadyExists") => ClusterError::AlreadyExists {
            kind: kind.to_string(),
            name: name.to_string(),
        },
        409 => ClusterError::Conflict {
            kind: kind.to_string(),
            name: name.to_string(),
        },
        code => ClusterError::Api {
            status: code,
            message: detail
                .message
                .unwrap_or_else(|| format!("request failed with status {}", code)),
        },
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ClusterClient for HttpCluster {
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> AirlockResult<Pod> {
        self.create_object(&self.pods_url(namespace), pod, "Pod", &pod.metadata.name)
            .await
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> AirlockResult<Pod> {
        let url = format!("{}/{}", self.pods_url(namespace), name);
        self.get_object(&url, "Pod", name).await
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> AirlockResult<Vec<Pod>> {
        self.list_objects(&self.pods_url(namespace), label_selector)
            .await
    }

    async fn update_pod(&self, namespace: &str, pod: &Pod) -> AirlockResult<Pod> {
        let url = format!("{}/{}", self.pods_url(namespace), pod.metadata.name);
        self.replace_object(&url, pod, "Pod", &pod.metadata.name)
            .await
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> AirlockResult<bool> {
        let url = format!("{}/{}", self.pods_url(namespace), name);
        self.delete_object(&url, "Pod", name).await
    }

    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> AirlockResult<ConfigMap> {
        self.create_object(
            &self.config_maps_url(namespace),
            config_map,
            "ConfigMap",
            &config_map.metadata.name,
        )
        .await
    }

    async fn list_config_maps(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> AirlockResult<Vec<ConfigMap>> {
        self.list_objects(&self.config_maps_url(namespace), label_selector)
            .await
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> AirlockResult<bool> {
        let url = format!("{}/{}", self.config_maps_url(namespace), name);
        self.delete_object(&url, "ConfigMap", name).await
    }

    async fn get_network_policy(
        &self,
        namespace: &str,
        name: &str,
    ) -> AirlockResult<NetworkPolicy> {
        let url = format!("{}/{}", self.network_policies_url(namespace), name);
        self.get_object(&url, "NetworkPolicy", name).await
    }

    async fn create_network_policy(
        &self,
        namespace: &str,
        policy: &NetworkPolicy,
    ) -> AirlockResult<NetworkPolicy> {
        self.create_object(
            &self.network_policies_url(namespace),
            policy,
            "NetworkPolicy",
            &policy.metadata.name,
        )
        .await
    }

    async fn delete_network_policy(&self, namespace: &str, name: &str) -> AirlockResult<bool> {
        let url = format!("{}/{}", self.network_policies_url(namespace), name);
        self.delete_object(&url, "NetworkPolicy", name).await
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
