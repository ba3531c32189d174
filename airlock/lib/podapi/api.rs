//! The control endpoint served inside every sandbox pod.
//!
//! This is the only way anything enters or leaves a sandbox. The claim token arrives here over
//! `POST /claim`; it is held in memory only, never written to disk or exported through the
//! process environment. Everything except `/health` and the single-use downloads demands a
//! token bound to this exact sandbox.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::{
    claim::ClaimHandoff,
    podapi::files::ArtifactRegistry,
    server::{ErrorResponse, ErrorType},
    token::{TokenClaims, TokenVerifier},
    utils::validate_safe_ident,
    AirlockError, AirlockResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The control endpoint of one sandbox.
pub struct ControlEndpoint {
    /// The sandbox this endpoint speaks for.
    sandbox_id: String,

    /// The port to listen on.
    port: u16,

    /// Verifies claim tokens against the controller's published public key.
    verifier: TokenVerifier,

    /// Registered artifact downloads.
    artifacts: ArtifactRegistry,

    /// The id of the claim token this sandbox is bound to, once delivered.
    bound: Mutex<Option<String>>,
}

/// Response body for a claim handoff
#[derive(Debug, Serialize)]
pub struct BindResponse {
    /// The sandbox that accepted the binding
    pub sandbox_id: String,

    /// Whether the sandbox is bound after this request
    pub bound: bool,
}

/// Request body for submitting an investigation
#[derive(Debug, Deserialize)]
pub struct InvestigateRequest {
    /// Free-form payload for the in-pod investigation loop
    pub payload: serde_json::Value,
}

/// Response body acknowledging an investigation submission
#[derive(Debug, Serialize)]
pub struct InvestigateResponse {
    /// The sandbox that accepted the payload
    pub sandbox_id: String,

    /// Whether the payload was accepted
    pub accepted: bool,
}

/// Request body for registering an artifact download
#[derive(Debug, Deserialize)]
pub struct RegisterFileRequest {
    /// The artifact path, relative to or inside the artifacts root
    pub path: String,
}

/// Response body carrying a minted download token
#[derive(Debug, Serialize)]
pub struct RegisterFileResponse {
    /// The single-use token redeeming the download
    pub download_token: String,
}

/// Type alias for the standard API response
type ApiResponse<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ControlEndpoint {
    /// Creates the control endpoint for one sandbox.
    pub fn new(
        sandbox_id: String,
        port: u16,
        verifier: TokenVerifier,
        artifacts_root: &str,
    ) -> AirlockResult<Self> {
        validate_safe_ident("sandbox_id", &sandbox_id)?;

        Ok(Self {
            sandbox_id,
            port,
            verifier,
            artifacts: ArtifactRegistry::new(artifacts_root)?,
            bound: Mutex::new(None),
        })
    }

    /// Builds the router serving the control endpoint.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/claim", post(claim))
            .route("/investigate", post(investigate))
            .route("/files", post(register_file))
            .route("/files/{token}", get(download_file))
            .route("/health", get(health))
            .with_state(self)
    }

    /// Starts the endpoint and runs it until the shutdown signal fires.
    pub async fn serve(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> AirlockResult<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!(
            "control endpoint for '{}' listening on {}",
            self.sandbox_id, addr
        );

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, self.router().into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await?;

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Handlers
//--------------------------------------------------------------------------------------------------

/// Handler for the claim token handoff
async fn claim(
    State(state): State<Arc<ControlEndpoint>>,
    Json(handoff): Json<ClaimHandoff>,
) -> ApiResponse<BindResponse> {
    let claims = state
        .verifier
        .verify(&handoff.token, &state.sandbox_id)
        .map_err(token_rejected)?;

    let mut bound = state.bound.lock().await;
    match bound.as_deref() {
        None => {
            *bound = Some(claims.jti.clone());
            info!(
                "bound to thread '{}' of tenant '{}' via token '{}'",
                claims.thread, claims.tenant, claims.jti
            );
            Ok(Json(BindResponse {
                sandbox_id: state.sandbox_id.clone(),
                bound: true,
            }))
        }
        // Redelivery of the token we already hold is idempotent.
        Some(jti) if jti == claims.jti => Ok(Json(BindResponse {
            sandbox_id: state.sandbox_id.clone(),
            bound: true,
        })),
        Some(_) => {
            warn!("refused second claim binding for '{}'", state.sandbox_id);
            Err((
                StatusCode::CONFLICT,
                Json(ErrorResponse::new(
                    409,
                    "sandbox is already bound to another claim".to_string(),
                    ErrorType::ClaimConflict,
                )),
            ))
        }
    }
}

/// Handler for submitting an investigation payload
async fn investigate(
    State(state): State<Arc<ControlEndpoint>>,
    headers: HeaderMap,
    Json(request): Json<InvestigateRequest>,
) -> ApiResponse<InvestigateResponse> {
    let claims = authorize(&state, &headers).await?;

    debug!("investigation payload: {}", request.payload);
    info!(
        "accepted investigation payload for thread '{}' of tenant '{}'",
        claims.thread, claims.tenant
    );

    Ok(Json(InvestigateResponse {
        sandbox_id: state.sandbox_id.clone(),
        accepted: true,
    }))
}

/// Handler for registering an artifact download
async fn register_file(
    State(state): State<Arc<ControlEndpoint>>,
    headers: HeaderMap,
    Json(request): Json<RegisterFileRequest>,
) -> ApiResponse<RegisterFileResponse> {
    authorize(&state, &headers).await?;

    let download_token = state.artifacts.register(&request.path).await.map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(
                ErrorResponse::new(
                    400,
                    "artifact path rejected".to_string(),
                    ErrorType::ValidationError,
                )
                .with_details(e.to_string()),
            ),
        )
    })?;

    Ok(Json(RegisterFileResponse { download_token }))
}

/// Handler for redeeming a single-use download token
async fn download_file(
    State(state): State<Arc<ControlEndpoint>>,
    Path(token): Path<String>,
) -> Response {
    let Some(path) = state.artifacts.take(&token).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(
                404,
                "download token is unknown, used, or expired".to_string(),
                ErrorType::NotFound,
            )),
        )
            .into_response();
    };

    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            bytes,
        )
            .into_response(),
        Err(e) => {
            warn!("artifact '{}' could not be read: {}", path, e);
            (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse::new(
                    404,
                    "artifact not found".to_string(),
                    ErrorType::NotFound,
                )),
            )
                .into_response()
        }
    }
}

/// Handler for the liveness probe
async fn health() -> &'static str {
    "ok"
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Verifies the bearer token and requires it to be the one this sandbox is bound to.
async fn authorize(
    state: &ControlEndpoint,
    headers: &HeaderMap,
) -> Result<TokenClaims, (StatusCode, Json<ErrorResponse>)> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse::new(
                    401,
                    "Missing or invalid Bearer token".to_string(),
                    ErrorType::AuthenticationError,
                )),
            )
        })?;

    let claims = state
        .verifier
        .verify(token, &state.sandbox_id)
        .map_err(token_rejected)?;

    let bound = state.bound.lock().await;
    match bound.as_deref() {
        Some(jti) if jti == claims.jti => Ok(claims),
        Some(_) => Err(token_rejected(AirlockError::TokenRejected(
            "token is not the one this sandbox is bound to".to_string(),
        ))),
        None => Err(token_rejected(AirlockError::TokenRejected(
            "sandbox is not bound yet".to_string(),
        ))),
    }
}

/// Converts a token verification failure into the 401 a handler returns.
fn token_rejected(err: AirlockError) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(
            ErrorResponse::new(
                401,
                "claim token rejected".to_string(),
                ErrorType::AuthenticationError,
            )
            .with_details(err.to_string()),
        ),
    )
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Method, http::Request};
    use chrono::Duration;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::token::{generate_signing_key, MintedToken, TokenIssuer};

    use super::*;

    const SANDBOX_ID: &str = "sbx-0abc1234";

    struct PodFixture {
        issuer: TokenIssuer,
        router: Router,
        artifacts_dir: tempfile::TempDir,
    }

    fn fixture() -> anyhow::Result<PodFixture> {
        let issuer = TokenIssuer::new(&generate_signing_key()?, Duration::seconds(600))?;
        let verifier = TokenVerifier::from_hex(&issuer.verify_key_hex())?;
        let artifacts_dir = tempfile::tempdir()?;
        let root = artifacts_dir
            .path()
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("non-utf8 temp dir"))?
            .to_string();

        let endpoint = Arc::new(ControlEndpoint::new(
            SANDBOX_ID.to_string(),
            0,
            verifier,
            &root,
        )?);

        Ok(PodFixture {
            issuer,
            router: endpoint.router(),
            artifacts_dir,
        })
    }

    fn mint(fixture: &PodFixture) -> anyhow::Result<MintedToken> {
        Ok(fixture.issuer.mint(SANDBOX_ID, "acme", "incident-42")?)
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

    async fn bind(fixture: &PodFixture) -> anyhow::Result<MintedToken> {
        let minted = mint(fixture)?;
        let (status, _) = request(
            &fixture.router,
            Method::POST,
            "/claim",
            Some(json!({ "token": minted.get_token() })),
            None,
        )
        .await?;
        anyhow::ensure!(status == StatusCode::OK, "bind failed: {}", status);
        Ok(minted)
    }

    #[test_log::test(tokio::test)]
    async fn test_first_bind_wins_redelivery_is_idempotent() -> anyhow::Result<()> {
        let fixture = fixture()?;
        let minted = bind(&fixture).await?;

        // The same token again is an idempotent redelivery.
        let (status, body) = request(
            &fixture.router,
            Method::POST,
            "/claim",
            Some(json!({ "token": minted.get_token() })),
            None,
        )
        .await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["bound"], true);

        // A different token for the same sandbox is refused.
        let other = mint(&fixture)?;
        let (status, body) = request(
            &fixture.router,
            Method::POST,
            "/claim",
            Some(json!({ "token": other.get_token() })),
            None,
        )
        .await?;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error_type"], "claim_conflict");

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_foreign_and_garbage_tokens_never_bind() -> anyhow::Result<()> {
        let fixture = fixture()?;

        let foreign = fixture.issuer.mint("sbx-99999999", "acme", "incident-42")?;
        let (status, body) = request(
            &fixture.router,
            Method::POST,
            "/claim",
            Some(json!({ "token": foreign.get_token() })),
            None,
        )
        .await?;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error_type"], "authentication_error");

        let (status, _) = request(
            &fixture.router,
            Method::POST,
            "/claim",
            Some(json!({ "token": "not.a.token" })),
            None,
        )
        .await?;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_investigate_demands_the_bound_token() -> anyhow::Result<()> {
        let fixture = fixture()?;
        let payload = json!({ "payload": { "incident": "db-outage" } });

        // Before any binding, nothing gets in.
        let early = mint(&fixture)?;
        let (status, _) = request(
            &fixture.router,
            Method::POST,
            "/investigate",
            Some(payload.clone()),
            Some(early.get_token()),
        )
        .await?;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let minted = bind(&fixture).await?;
        let (status, body) = request(
            &fixture.router,
            Method::POST,
            "/investigate",
            Some(payload.clone()),
            Some(minted.get_token()),
        )
        .await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accepted"], true);

        // A second valid token for this sandbox is still not the bound one.
        let other = mint(&fixture)?;
        let (status, _) = request(
            &fixture.router,
            Method::POST,
            "/investigate",
            Some(payload),
            Some(other.get_token()),
        )
        .await?;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_artifact_download_is_single_use() -> anyhow::Result<()> {
        let fixture = fixture()?;
        let minted = bind(&fixture).await?;

        std::fs::write(
            fixture.artifacts_dir.path().join("report.json"),
            br#"{"finding":"oom"}"#,
        )?;

        let (status, body) = request(
            &fixture.router,
            Method::POST,
            "/files",
            Some(json!({ "path": "report.json" })),
            Some(minted.get_token()),
        )
        .await?;
        assert_eq!(status, StatusCode::OK, "registration failed: {}", body);
        let token = body["download_token"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        assert!(!token.is_empty());

        let uri = format!("/files/{}", token);
        let response = fixture
            .router
            .clone()
            .oneshot(Request::builder().uri(&uri).body(Body::empty())?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
        assert_eq!(bytes.to_vec(), br#"{"finding":"oom"}"#.to_vec());

        let (status, _) = request(&fixture.router, Method::GET, &uri, None, None).await?;
        assert_eq!(status, StatusCode::NOT_FOUND, "tokens are single use");

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_artifact_traversal_is_rejected() -> anyhow::Result<()> {
        let fixture = fixture()?;
        let minted = bind(&fixture).await?;

        let (status, body) = request(
            &fixture.router,
            Method::POST,
            "/files",
            Some(json!({ "path": "../../etc/passwd" })),
            Some(minted.get_token()),
        )
        .await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_type"], "validation_error");

        // Registration itself demands the bound token.
        let (status, _) = request(
            &fixture.router,
            Method::POST,
            "/files",
            Some(json!({ "path": "report.json" })),
            None,
        )
        .await?;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        Ok(())
    }
}
