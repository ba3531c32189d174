//! Creation, readiness, and deletion of sandbox resource sets.

use std::{sync::Arc, time::Duration};

use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::{
    cluster::{ClusterClient, ClusterError, Pod},
    config::AirlockConfig,
    provision::{
        config_map_name, egress_policy, sandbox_config_map, sandbox_pod, EGRESS_POLICY_NAME,
    },
    sandbox::{update_sandbox, Sandbox, SandboxState},
    utils::{random_name, Backoff},
    AirlockError, AirlockResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Prefix for generated sandbox names
const SANDBOX_NAME_PREFIX: &str = "sbx";

/// Timeout for a single control endpoint health check
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(3);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Creates and deletes the cluster objects that constitute sandboxes.
///
/// A sandbox's resource set is created and destroyed as a unit: if any member fails to create,
/// the members already created are rolled back in the same call. Nothing here leaves an orphan
/// behind on the happy or the failure path.
pub struct Provisioner {
    /// The cluster API.
    cluster: Arc<dyn ClusterClient>,

    /// The controller configuration.
    config: AirlockConfig,

    /// The hex-encoded public key published into each sandbox's config object.
    verify_key_hex: String,

    /// The client used for control endpoint health checks.
    health_client: reqwest::Client,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Provisioner {
    /// Creates a provisioner.
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        config: AirlockConfig,
        verify_key_hex: String,
    ) -> AirlockResult<Self> {
        let health_client = reqwest::Client::builder()
            .timeout(HEALTH_CHECK_TIMEOUT)
            .build()?;

        Ok(Self {
            cluster,
            config,
            verify_key_hex,
            health_client,
        })
    }

    /// The namespace sandboxes are provisioned in.
    pub fn namespace(&self) -> &str {
        self.config.get_cluster().get_namespace()
    }

    /// Provisions one sandbox in the given tier and waits for it to become claimable.
    ///
    /// On any failure after object creation, the resource set is rolled back before the error
    /// is returned.
    pub async fn provision(&self, tier: &str) -> AirlockResult<Sandbox> {
        let image = self.tier_image(tier)?;
        let sandbox_id = random_name(SANDBOX_NAME_PREFIX);
        debug!("provisioning sandbox '{}' in tier '{}'", sandbox_id, tier);

        self.ensure_egress_policy().await?;
        self.create_resource_set(&sandbox_id, tier, image).await?;

        match self.finish_provisioning(&sandbox_id).await {
            Ok(sandbox) => {
                info!("sandbox '{}' ready in tier '{}'", sandbox_id, tier);
                Ok(sandbox)
            }
            Err(e) => {
                warn!(
                    "sandbox '{}' never became claimable, rolling back: {}",
                    sandbox_id, e
                );
                if let Err(rollback) = self.delete_resource_set(&sandbox_id).await {
                    error!("rollback of sandbox '{}' failed: {}", sandbox_id, rollback);
                }
                Err(e)
            }
        }
    }

    /// Ensures the namespace-shared egress policy exists.
    pub async fn ensure_egress_policy(&self) -> AirlockResult<()> {
        let namespace = self.namespace();

        match self
            .cluster
            .get_network_policy(namespace, EGRESS_POLICY_NAME)
            .await
        {
            Ok(_) => return Ok(()),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let policy = egress_policy(namespace, self.config.get_egress());
        match self.cluster.create_network_policy(namespace, &policy).await {
            Ok(_) => {
                info!(
                    "created egress policy '{}' in namespace '{}'",
                    EGRESS_POLICY_NAME, namespace
                );
                Ok(())
            }
            // Another controller replica creating it concurrently is fine.
            Err(AirlockError::Cluster(ClusterError::AlreadyExists { .. })) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Deletes a sandbox's resource set. Resources already gone count as deleted.
    ///
    /// Both members are attempted even when the first fails; the first failure is returned.
    /// The egress policy is namespace-shared and never deleted here.
    pub async fn delete_resource_set(&self, sandbox_id: &str) -> AirlockResult<()> {
        let namespace = self.namespace();
        let mut first_error = None;

        match self.cluster.delete_pod(namespace, sandbox_id).await {
            Ok(true) => debug!("deleted pod '{}'", sandbox_id),
            Ok(false) => {}
            Err(e) => first_error = Some(e),
        }

        match self
            .cluster
            .delete_config_map(namespace, &config_map_name(sandbox_id))
            .await
        {
            Ok(true) => debug!("deleted config object of '{}'", sandbox_id),
            Ok(false) => {}
            Err(e) => first_error = first_error.or(Some(e)),
        }

        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    fn tier_image(&self, tier: &str) -> AirlockResult<&str> {
        let tier_config = self
            .config
            .get_pool()
            .get_tiers()
            .get(tier)
            .ok_or_else(|| AirlockError::ValidationError(format!("unknown pool tier '{}'", tier)))?;

        Ok(tier_config
            .get_image()
            .as_deref()
            .unwrap_or(self.config.get_sandbox().get_image().as_str()))
    }

    async fn create_resource_set(
        &self,
        sandbox_id: &str,
        tier: &str,
        image: &str,
    ) -> AirlockResult<()> {
        let namespace = self.namespace();

        let config_map = sandbox_config_map(sandbox_id, namespace, &self.verify_key_hex);
        self.cluster
            .create_config_map(namespace, &config_map)
            .await
            .map_err(|e| {
                AirlockError::ProvisioningFailed(format!(
                    "creating config object of '{}': {}",
                    sandbox_id, e
                ))
            })?;

        let pod = sandbox_pod(sandbox_id, namespace, tier, image, self.config.get_sandbox());
        if let Err(e) = self.cluster.create_pod(namespace, &pod).await {
            warn!(
                "pod create for sandbox '{}' failed, rolling back config object: {}",
                sandbox_id, e
            );
            if let Err(rollback) = self
                .cluster
                .delete_config_map(namespace, &config_map_name(sandbox_id))
                .await
            {
                error!(
                    "rollback of config object of '{}' failed: {}",
                    sandbox_id, rollback
                );
            }
            return Err(AirlockError::ProvisioningFailed(format!(
                "creating pod of '{}': {}",
                sandbox_id, e
            )));
        }

        Ok(())
    }

    async fn finish_provisioning(&self, sandbox_id: &str) -> AirlockResult<Sandbox> {
        self.wait_ready(sandbox_id).await?;
        update_sandbox(&*self.cluster, self.namespace(), sandbox_id, |s| {
            s.transition_to(SandboxState::Unclaimed)
        })
        .await
    }

    /// Polls the pod with bounded exponential backoff until it runs and its control endpoint
    /// answers, or the provisioning timeout passes.
    async fn wait_ready(&self, sandbox_id: &str) -> AirlockResult<()> {
        let namespace = self.namespace();
        let provisioning = self.config.get_provisioning();
        let deadline = Instant::now() + provisioning.timeout();
        let mut backoff = Backoff::new(provisioning.poll_initial(), provisioning.poll_max());

        loop {
            let pod = self.cluster.get_pod(namespace, sandbox_id).await?;
            if pod.is_running() && self.control_endpoint_healthy(&pod).await {
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(AirlockError::ProvisioningFailed(format!(
                    "sandbox '{}' did not become ready within {}s",
                    sandbox_id,
                    provisioning.get_timeout_secs()
                )));
            }

            sleep(backoff.next_delay()).await;
        }
    }

    async fn control_endpoint_healthy(&self, pod: &Pod) -> bool {
        let ip = match pod.status.as_ref().and_then(|s| s.pod_ip.as_deref()) {
            Some(ip) => ip,
            None => return false,
        };

        let url = format!(
            "http://{}:{}/health",
            ip,
            self.config.get_sandbox().get_control_port()
        );
        match self.health_client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("control endpoint of '{}' not ready: {}", pod.metadata.name, e);
                false
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
