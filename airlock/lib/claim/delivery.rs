//! Delivery of minted claim tokens to sandbox control endpoints.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    config::DeliveryConfig, sandbox::Sandbox, token::MintedToken, AirlockError, AirlockResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The body handed to a sandbox's `/claim` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimHandoff {
    /// The signed claim token.
    pub token: String,
}

/// Delivers a minted claim token to the sandbox it is scoped to.
#[async_trait]
pub trait ClaimDelivery: Send + Sync {
    /// Presents the token at the sandbox's control endpoint.
    ///
    /// Implementations must be idempotent for the same token: a retry after a lost response
    /// lands on a sandbox that already accepted it.
    async fn deliver(&self, sandbox: &Sandbox, token: &MintedToken) -> AirlockResult<()>;
}

/// Accepts every token without contacting the pod.
///
/// Used with the in-memory cluster mode, where no control endpoint exists to deliver to.
#[derive(Debug, Default, Clone)]
pub struct NoopDelivery;

/// Delivers claim tokens over HTTP to the pod's control endpoint.
#[derive(Debug, Clone)]
pub struct HttpClaimDelivery {
    /// The HTTP client, capped at the configured per-attempt timeout.
    client: reqwest::Client,

    /// The control endpoint port on every sandbox pod.
    control_port: u16,

    /// Extra attempts after the first. Bounded at one.
    retries: u32,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HttpClaimDelivery {
    /// Creates a delivery client from the delivery section of the configuration.
    pub fn new(config: &DeliveryConfig, control_port: u16) -> AirlockResult<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout()).build()?;

        Ok(Self {
            client,
            control_port,
            retries: *config.get_retries(),
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ClaimDelivery for NoopDelivery {
    async fn deliver(&self, sandbox: &Sandbox, _token: &MintedToken) -> AirlockResult<()> {
        debug!(
            "accepting claim token for '{}' without delivery",
            sandbox.get_sandbox_id()
        );
        Ok(())
    }
}

#[async_trait]
impl ClaimDelivery for HttpClaimDelivery {
    async fn deliver(&self, sandbox: &Sandbox, token: &MintedToken) -> AirlockResult<()> {
        let sandbox_id = sandbox.get_sandbox_id();
        let endpoint = sandbox.control_endpoint(self.control_port).ok_or_else(|| {
            AirlockError::ProvisioningFailed(format!(
                "sandbox '{}' has no pod address to deliver to",
                sandbox_id
            ))
        })?;
        let url = format!("{}/claim", endpoint);
        let handoff = ClaimHandoff {
            token: token.get_token().clone(),
        };

        let mut last_failure = None;
        for attempt in 0..=self.retries {
            if attempt > 0 {
                debug!("retrying token delivery to '{}'", sandbox_id);
            }

            match self.client.post(&url).json(&handoff).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(());
                    }

                    let detail = response.text().await.unwrap_or_default();
                    let failure = format!(
                        "sandbox '{}' refused its claim token ({}): {}",
                        sandbox_id, status, detail
                    );
                    // No retry can fix a 4xx; a 409 in particular means the pod is already
                    // bound to another token.
                    if status.is_client_error() {
                        return Err(AirlockError::ProvisioningFailed(failure));
                    }
                    last_failure = Some(failure);
                }
                Err(e) => {
                    last_failure = Some(format!(
                        "delivering claim token to '{}': {}",
                        sandbox_id, e
                    ));
                }
            }
        }

        Err(AirlockError::ProvisioningFailed(last_failure.unwrap_or_else(
            || format!("delivering claim token to '{}'", sandbox_id),
        )))
    }
}
