//! The controller REST API server.

use std::{collections::BTreeMap, net::SocketAddr, sync::Arc};

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tokio::sync::broadcast;
use tracing::{error, info};
use typed_builder::TypedBuilder;

use crate::{
    claim::ClaimCoordinator,
    cluster::{ClusterClient, ClusterError},
    config::{AirlockConfig, DEFAULT_TIER},
    lifecycle::LifecycleSupervisor,
    sandbox::{managed_selector, Sandbox, SandboxState},
    server::data::{
        ClaimRequest, ClaimResponse, ControllerStatusResponse, ErrorResponse, ErrorType,
        ReleaseRequest, ReleaseResponse, SandboxListResponse, SandboxSummary, TierStatus,
    },
    utils::validate_safe_ident,
    AirlockError, AirlockResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The airlock controller API server.
#[derive(Clone, TypedBuilder)]
pub struct ControllerServer {
    /// Claims and releases sandboxes.
    coordinator: Arc<ClaimCoordinator>,

    /// Reports stuck teardowns on the status endpoint.
    supervisor: Arc<LifecycleSupervisor>,

    /// The cluster API, read for listings and status.
    cluster: Arc<dyn ClusterClient>,

    /// The controller configuration.
    config: AirlockConfig,
}

/// Type alias for the standard API response
type ApiResponse<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ControllerServer {
    /// Builds the router serving the controller API.
    pub fn router(&self) -> Router {
        let state = Arc::new(self.clone());

        let mut app = Router::new()
            .route("/sandboxes/claim", post(claim))
            .route("/sandboxes/{sandbox_id}/release", post(release))
            .route("/sandboxes", get(list_sandboxes))
            .route("/sandboxes/{sandbox_id}", get(get_sandbox))
            .route("/status", get(status))
            .with_state(state.clone());

        if state.config.get_server().get_api_key().is_some() {
            info!("server running in secure mode with API key authentication");
            app = app.layer(middleware::from_fn_with_state(state, auth_middleware));
        }

        // Liveness stays open so probes work in secure mode.
        app.route("/health", get(health))
    }

    /// Starts the server and runs it until the shutdown signal fires.
    pub async fn serve(&self, mut shutdown: broadcast::Receiver<()>) -> AirlockResult<()> {
        let addr = self.addr()?;
        let app = self.router();

        info!("server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await?;

        Ok(())
    }

    /// The address to listen on, from the server configuration.
    fn addr(&self) -> AirlockResult<SocketAddr> {
        let server = self.config.get_server();
        format!("{}:{}", server.get_host(), server.get_port())
            .parse()
            .map_err(|_| {
                AirlockError::ConfigValidation(format!(
                    "invalid server address '{}:{}'",
                    server.get_host(),
                    server.get_port()
                ))
            })
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Middleware
//--------------------------------------------------------------------------------------------------

/// Authentication middleware comparing the Bearer token against the configured API key
async fn auth_middleware(
    State(state): State<Arc<ControllerServer>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    let expected = state.config.get_server().get_api_key().as_deref();
    match (presented, expected) {
        (Some(presented), Some(expected)) if presented == expected => next.run(req).await,
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse::new(
                401,
                "Missing or invalid Bearer token".to_string(),
                ErrorType::AuthenticationError,
            )),
        )
            .into_response(),
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Handlers
//--------------------------------------------------------------------------------------------------

/// Handler for claiming a sandbox
async fn claim(
    State(state): State<Arc<ControllerServer>>,
    Json(request): Json<ClaimRequest>,
) -> ApiResponse<ClaimResponse> {
    info!("received claim request: {:?}", request);
    let tier = request.tier.as_deref().unwrap_or(DEFAULT_TIER);

    let grant = state
        .coordinator
        .claim(&request.tenant_id, &request.thread_id, tier)
        .await
        .map_err(|e| respond_err("claim", e))?;

    let control_port = *state.config.get_sandbox().get_control_port();
    Ok(Json(ClaimResponse::from_grant(&grant, control_port)))
}

/// Handler for releasing a sandbox
async fn release(
    State(state): State<Arc<ControllerServer>>,
    Path(sandbox_id): Path<String>,
    Json(request): Json<ReleaseRequest>,
) -> ApiResponse<ReleaseResponse> {
    info!(
        "received release request for '{}': {:?}",
        sandbox_id, request
    );

    let released = state
        .coordinator
        .release(&sandbox_id, request.outcome)
        .await
        .map_err(|e| respond_err("release", e))?;

    Ok(Json(ReleaseResponse {
        sandbox_id,
        outcome: request.outcome,
        found: released.is_some(),
    }))
}

/// Handler for listing every managed sandbox
async fn list_sandboxes(
    State(state): State<Arc<ControllerServer>>,
) -> ApiResponse<SandboxListResponse> {
    let pods = state
        .cluster
        .list_pods(state.coordinator.namespace(), &managed_selector())
        .await
        .map_err(|e| respond_err("list sandboxes", e))?;

    let sandboxes = pods
        .iter()
        .filter_map(|pod| Sandbox::from_pod(pod).ok())
        .map(|sandbox| SandboxSummary::from_sandbox(&sandbox))
        .collect();

    Ok(Json(SandboxListResponse { sandboxes }))
}

/// Handler for fetching one sandbox
async fn get_sandbox(
    State(state): State<Arc<ControllerServer>>,
    Path(sandbox_id): Path<String>,
) -> ApiResponse<SandboxSummary> {
    validate_safe_ident("sandbox_id", &sandbox_id).map_err(|e| respond_err("get sandbox", e))?;

    let pod = state
        .cluster
        .get_pod(state.coordinator.namespace(), &sandbox_id)
        .await
        .map_err(|e| respond_err("get sandbox", e))?;
    let sandbox = Sandbox::from_pod(&pod).map_err(|e| respond_err("get sandbox", e))?;

    Ok(Json(SandboxSummary::from_sandbox(&sandbox)))
}

/// Handler for the liveness probe
async fn health() -> &'static str {
    "ok"
}

/// Handler for the controller status endpoint
async fn status(
    State(state): State<Arc<ControllerServer>>,
) -> ApiResponse<ControllerStatusResponse> {
    let pods = state
        .cluster
        .list_pods(state.coordinator.namespace(), &managed_selector())
        .await
        .map_err(|e| respond_err("status", e))?;

    // Seed from the configured tiers so empty pools still show up.
    let mut tiers: BTreeMap<String, TierStatus> = state
        .config
        .get_pool()
        .get_tiers()
        .iter()
        .map(|(name, tier)| {
            (
                name.clone(),
                TierStatus {
                    tier: name.clone(),
                    target: *tier.get_target(),
                    unclaimed: 0,
                    provisioning: 0,
                    bound: 0,
                },
            )
        })
        .collect();

    for pod in &pods {
        let Ok(sandbox) = Sandbox::from_pod(pod) else {
            continue;
        };
        let entry = tiers
            .entry(sandbox.get_tier().clone())
            .or_insert_with(|| TierStatus {
                tier: sandbox.get_tier().clone(),
                target: 0,
                unclaimed: 0,
                provisioning: 0,
                bound: 0,
            });
        match sandbox.get_state() {
            SandboxState::Provisioning => entry.provisioning += 1,
            SandboxState::Unclaimed => entry.unclaimed += 1,
            state if state.is_bound() => entry.bound += 1,
            _ => {}
        }
    }

    Ok(Json(ControllerStatusResponse {
        tiers: tiers.into_values().collect(),
        bound_threads: state.coordinator.registry().bound_count().await,
        stuck_teardowns: state.supervisor.stuck_sandboxes().await,
    }))
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Maps an error to the HTTP status and error type it is reported as.
fn classify(err: &AirlockError) -> (StatusCode, ErrorType) {
    match err {
        AirlockError::ClaimConflict { .. } => (StatusCode::CONFLICT, ErrorType::ClaimConflict),
        AirlockError::PoolExhausted { .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, ErrorType::PoolExhausted)
        }
        AirlockError::ValidationError(_) | AirlockError::PathValidation(_) => {
            (StatusCode::BAD_REQUEST, ErrorType::ValidationError)
        }
        AirlockError::InvalidStateTransition { .. } => (StatusCode::CONFLICT, ErrorType::SandboxError),
        AirlockError::TokenRejected(_) => (StatusCode::UNAUTHORIZED, ErrorType::AuthenticationError),
        AirlockError::Cluster(ClusterError::NotFound { .. }) => {
            (StatusCode::NOT_FOUND, ErrorType::NotFound)
        }
        AirlockError::DeadlineExceeded { .. } => (StatusCode::GONE, ErrorType::SandboxError),
        AirlockError::ProvisioningFailed(_) | AirlockError::TeardownStuck { .. } => {
            (StatusCode::INTERNAL_SERVER_ERROR, ErrorType::SandboxError)
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, ErrorType::InternalError),
    }
}

/// Converts an error into the response a handler returns.
fn respond_err(operation: &str, err: AirlockError) -> (StatusCode, Json<ErrorResponse>) {
    let (status, error_type) = classify(&err);
    if status.is_server_error() {
        error!("{} failed: {}", operation, err);
    }

    let body = ErrorResponse::new(status.as_u16(), format!("{} failed", operation), error_type)
        .with_details(err.to_string());
    (status, Json(body))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::http::Method;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::{
        claim::{ClaimDelivery, NoopDelivery, ThreadRegistry},
        cluster::MemCluster,
        config::{PoolConfig, ProvisioningConfig, SandboxConfig, ServerConfig, TierConfig},
        pool::WarmPool,
        provision::Provisioner,
        token::{generate_signing_key, TokenIssuer},
    };

    use super::*;

    async fn spawn_health_server() -> anyhow::Result<u16> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let app = Router::new().route("/health", get(|| async { "ok" }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Ok(port)
    }

    async fn server_stack(
        target: u32,
        api_key: Option<String>,
    ) -> anyhow::Result<(Arc<MemCluster>, ControllerServer)> {
        let port = spawn_health_server().await?;
        let server_config = match api_key {
            Some(key) => ServerConfig::builder().api_key(key).build(),
            None => ServerConfig::builder().build(),
        };
        let config = AirlockConfig::builder()
            .pool(
                PoolConfig::builder()
                    .tiers(HashMap::from([(
                        "standard".to_string(),
                        TierConfig::builder().target(target).build(),
                    )]))
                    .build(),
            )
            .sandbox(SandboxConfig::builder().control_port(port).build())
            .provisioning(
                ProvisioningConfig::builder()
                    .timeout_secs(5)
                    .poll_initial_ms(10)
                    .poll_max_ms(50)
                    .build(),
            )
            .server(server_config)
            .build();

        let cluster = Arc::new(MemCluster::new());
        let issuer = Arc::new(TokenIssuer::new(
            &generate_signing_key()?,
            config.get_sandbox().deadline(),
        )?);
        let provisioner = Arc::new(Provisioner::new(
            cluster.clone() as Arc<dyn ClusterClient>,
            config.clone(),
            issuer.verify_key_hex(),
        )?);
        let pool = Arc::new(WarmPool::new(
            cluster.clone() as Arc<dyn ClusterClient>,
            provisioner.clone(),
            config.clone(),
        ));
        pool.ensure_capacity().await?;

        let registry = Arc::new(ThreadRegistry::new());
        let coordinator = Arc::new(
            ClaimCoordinator::builder()
                .cluster(cluster.clone() as Arc<dyn ClusterClient>)
                .provisioner(provisioner.clone())
                .pool(pool.clone())
                .registry(registry.clone())
                .issuer(issuer.clone())
                .delivery(Arc::new(NoopDelivery) as Arc<dyn ClaimDelivery>)
                .config(config.clone())
                .build(),
        );
        let supervisor = Arc::new(
            LifecycleSupervisor::builder()
                .cluster(cluster.clone() as Arc<dyn ClusterClient>)
                .provisioner(provisioner)
                .registry(registry)
                .issuer(issuer)
                .pool(pool)
                .config(config.clone())
                .build(),
        );

        let server = ControllerServer::builder()
            .coordinator(coordinator)
            .supervisor(supervisor)
            .cluster(cluster.clone() as Arc<dyn ClusterClient>)
            .config(config)
            .build();

        Ok((cluster, server))
    }

    async fn request(
        router: &Router,
        method: Method,
        uri: &str,
        body: Option<Value>,
        bearer: Option<&str>,
    ) -> anyhow::Result<(StatusCode, Value)> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&json)?))?,
            None => builder.body(Body::empty())?,
        };

        let response = router.clone().oneshot(request).await?;
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };

        Ok((status, value))
    }

    #[test_log::test(tokio::test)]
    async fn test_claim_endpoint_grants_a_sandbox() -> anyhow::Result<()> {
        let (_cluster, server) = server_stack(1, None).await?;
        let router = server.router();

        let (status, body) = request(
            &router,
            Method::POST,
            "/sandboxes/claim",
            Some(json!({ "tenant_id": "acme", "thread_id": "incident-7" })),
            None,
        )
        .await?;

        assert_eq!(status, StatusCode::OK, "claim failed: {}", body);
        assert_eq!(body["tier"], "standard");
        assert!(
            body["sandbox_id"]
                .as_str()
                .unwrap_or_default()
                .starts_with("sbx-"),
            "unexpected sandbox id: {}",
            body["sandbox_id"]
        );
        assert!(
            !body["token"].as_str().unwrap_or_default().is_empty(),
            "response must carry the claim token"
        );
        assert!(
            body["endpoint"]
                .as_str()
                .unwrap_or_default()
                .starts_with("http://"),
            "response must carry the control endpoint: {}",
            body["endpoint"]
        );
        assert!(
            body["expires_at"].is_string(),
            "response must carry the deadline"
        );

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_second_claim_for_same_thread_is_a_conflict() -> anyhow::Result<()> {
        let (_cluster, server) = server_stack(2, None).await?;
        let router = server.router();
        let claim_body = json!({ "tenant_id": "acme", "thread_id": "incident-7" });

        let (status, _) = request(
            &router,
            Method::POST,
            "/sandboxes/claim",
            Some(claim_body.clone()),
            None,
        )
        .await?;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = request(
            &router,
            Method::POST,
            "/sandboxes/claim",
            Some(claim_body),
            None,
        )
        .await?;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error_type"], "claim_conflict");
        assert_eq!(body["code"], 409);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_bad_identifier_is_rejected() -> anyhow::Result<()> {
        let (cluster, server) = server_stack(0, None).await?;
        let router = server.router();
        let before = cluster.op_count();

        let (status, body) = request(
            &router,
            Method::POST,
            "/sandboxes/claim",
            Some(json!({ "tenant_id": "acme corp", "thread_id": "incident-7" })),
            None,
        )
        .await?;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_type"], "validation_error");
        assert_eq!(
            cluster.op_count(),
            before,
            "a rejected identifier must not reach the cluster"
        );

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_empty_pool_returns_service_unavailable() -> anyhow::Result<()> {
        let (_cluster, server) = server_stack(0, None).await?;
        let router = server.router();

        let (status, body) = request(
            &router,
            Method::POST,
            "/sandboxes/claim",
            Some(json!({ "tenant_id": "acme", "thread_id": "incident-7" })),
            None,
        )
        .await?;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error_type"], "pool_exhausted");

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_release_round_trip() -> anyhow::Result<()> {
        let (_cluster, server) = server_stack(1, None).await?;
        let router = server.router();

        let (_, claim_body) = request(
            &router,
            Method::POST,
            "/sandboxes/claim",
            Some(json!({ "tenant_id": "acme", "thread_id": "incident-7" })),
            None,
        )
        .await?;
        let sandbox_id = claim_body["sandbox_id"].as_str().unwrap_or_default();

        let uri = format!("/sandboxes/{}/release", sandbox_id);
        let (status, body) = request(
            &router,
            Method::POST,
            &uri,
            Some(json!({ "outcome": "completed" })),
            None,
        )
        .await?;
        assert_eq!(status, StatusCode::OK, "release failed: {}", body);
        assert_eq!(body["sandbox_id"], sandbox_id);
        assert_eq!(body["outcome"], "completed");
        assert_eq!(body["found"], true);

        let (status, body) = request(
            &router,
            Method::POST,
            &uri,
            Some(json!({ "outcome": "completed" })),
            None,
        )
        .await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["found"], false, "a repeated release finds nothing");

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_get_sandbox_and_listing() -> anyhow::Result<()> {
        let (_cluster, server) = server_stack(1, None).await?;
        let router = server.router();

        let (_, claim_body) = request(
            &router,
            Method::POST,
            "/sandboxes/claim",
            Some(json!({ "tenant_id": "acme", "thread_id": "incident-7" })),
            None,
        )
        .await?;
        let sandbox_id = claim_body["sandbox_id"].as_str().unwrap_or_default();

        let (status, body) = request(
            &router,
            Method::GET,
            &format!("/sandboxes/{}", sandbox_id),
            None,
            None,
        )
        .await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "claimed");
        assert_eq!(body["tenant_id"], "acme");
        assert_eq!(body["thread_id"], "incident-7");

        let (status, body) = request(&router, Method::GET, "/sandboxes", None, None).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body["sandboxes"].as_array().map(|list| list.len()),
            Some(1),
            "listing must show the claimed sandbox"
        );

        let (status, body) = request(
            &router,
            Method::GET,
            "/sandboxes/sbx-missing",
            None,
            None,
        )
        .await?;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error_type"], "not_found");

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_status_reports_pool_occupancy() -> anyhow::Result<()> {
        let (_cluster, server) = server_stack(2, None).await?;
        let router = server.router();

        let (_, _) = request(
            &router,
            Method::POST,
            "/sandboxes/claim",
            Some(json!({ "tenant_id": "acme", "thread_id": "incident-7" })),
            None,
        )
        .await?;

        let (status, body) = request(&router, Method::GET, "/status", None, None).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tiers"][0]["tier"], "standard");
        assert_eq!(body["tiers"][0]["target"], 2);
        assert_eq!(body["tiers"][0]["unclaimed"], 1);
        assert_eq!(body["tiers"][0]["bound"], 1);
        assert_eq!(body["bound_threads"], 1);
        assert_eq!(
            body["stuck_teardowns"].as_array().map(|list| list.len()),
            Some(0)
        );

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_api_key_gates_every_route() -> anyhow::Result<()> {
        let (_cluster, server) = server_stack(0, Some("sk-airlock-test".to_string())).await?;
        let router = server.router();

        let (status, body) = request(&router, Method::GET, "/status", None, None).await?;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error_type"], "authentication_error");

        let (status, _) = request(&router, Method::GET, "/status", None, Some("wrong-key")).await?;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = request(
            &router,
            Method::GET,
            "/status",
            None,
            Some("sk-airlock-test"),
        )
        .await?;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = request(&router, Method::GET, "/health", None, None).await?;
        assert_eq!(status, StatusCode::OK, "liveness must stay open");

        Ok(())
    }
}
