//! Per-thread claim exclusivity.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{AirlockError, AirlockResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A committed tenant/thread binding observed in the cluster.
#[derive(Debug, Clone)]
pub struct ThreadBinding {
    /// The tenant the sandbox is bound to.
    pub tenant_id: String,

    /// The investigation thread the sandbox is bound to.
    pub thread_id: String,

    /// The bound sandbox.
    pub sandbox_id: String,
}

/// Tracks which investigation thread holds which sandbox.
///
/// The registry is the claim fast path only. The cluster stays the ledger of record;
/// [`ThreadRegistry::reconcile`] merges the bindings read from it back in after a restart or
/// on every supervisor sweep.
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    holds: Mutex<HashMap<(String, String), Hold>>,

    /// Bumped on every commit; tells [`reconcile`](Self::reconcile) which holds are newer than
    /// the cluster listing it is merging.
    generation: AtomicU64,
}

#[derive(Debug, Clone)]
struct Hold {
    /// Unset while the claim is still in flight.
    sandbox_id: Option<String>,
    phase: HoldPhase,
    /// The registry generation the hold was written at.
    generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HoldPhase {
    Reserved,
    Committed,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ThreadRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves the thread for an in-flight claim.
    ///
    /// Fails with [`AirlockError::ClaimConflict`] if the thread already holds or is claiming a
    /// sandbox. A successful reservation must be resolved with [`commit`](Self::commit) or
    /// [`abort`](Self::abort).
    pub async fn reserve(&self, tenant_id: &str, thread_id: &str) -> AirlockResult<()> {
        let mut holds = self.holds.lock().await;
        let key = (tenant_id.to_string(), thread_id.to_string());

        if let Some(hold) = holds.get(&key) {
            return Err(AirlockError::ClaimConflict {
                tenant_id: tenant_id.to_string(),
                thread_id: thread_id.to_string(),
                sandbox_id: hold
                    .sandbox_id
                    .clone()
                    .unwrap_or_else(|| "in flight".to_string()),
            });
        }

        holds.insert(
            key,
            Hold {
                sandbox_id: None,
                phase: HoldPhase::Reserved,
                generation: self.generation.load(Ordering::SeqCst),
            },
        );
        Ok(())
    }

    /// Commits a reservation to the sandbox the claim bound.
    pub async fn commit(&self, tenant_id: &str, thread_id: &str, sandbox_id: &str) {
        let mut holds = self.holds.lock().await;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        holds.insert(
            (tenant_id.to_string(), thread_id.to_string()),
            Hold {
                sandbox_id: Some(sandbox_id.to_string()),
                phase: HoldPhase::Committed,
                generation,
            },
        );
    }

    /// Drops a reservation after a failed claim, freeing the thread.
    pub async fn abort(&self, tenant_id: &str, thread_id: &str) {
        let mut holds = self.holds.lock().await;
        holds.remove(&(tenant_id.to_string(), thread_id.to_string()));
    }

    /// Releases the thread's hold, but only if it still points at `sandbox_id`.
    ///
    /// The guard matters during teardown races: a thread that already claimed a replacement
    /// sandbox must not lose its new hold to the old sandbox's cleanup.
    pub async fn release(&self, tenant_id: &str, thread_id: &str, sandbox_id: &str) -> bool {
        let mut holds = self.holds.lock().await;
        let key = (tenant_id.to_string(), thread_id.to_string());

        match holds.get(&key) {
            Some(hold) if hold.sandbox_id.as_deref() == Some(sandbox_id) => {
                holds.remove(&key);
                true
            }
            Some(_) => {
                debug!(
                    "thread '{}' of tenant '{}' no longer holds '{}', leaving its hold in place",
                    thread_id, tenant_id, sandbox_id
                );
                false
            }
            None => false,
        }
    }

    /// The sandbox currently held by the thread, if any.
    pub async fn held_sandbox(&self, tenant_id: &str, thread_id: &str) -> Option<String> {
        let holds = self.holds.lock().await;
        holds
            .get(&(tenant_id.to_string(), thread_id.to_string()))
            .and_then(|hold| hold.sandbox_id.clone())
    }

    /// The number of committed holds.
    pub async fn bound_count(&self) -> usize {
        let holds = self.holds.lock().await;
        holds
            .values()
            .filter(|hold| hold.phase == HoldPhase::Committed)
            .count()
    }

    /// The current commit generation.
    ///
    /// A sweep reads this before it lists the cluster and hands the value to
    /// [`reconcile`](Self::reconcile) as the cutoff. Commits landing after the read carry a
    /// higher generation, which is how the merge can tell them from holds the listing should
    /// have shown.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Merges the bindings read from the cluster into the committed holds.
    ///
    /// `cutoff` is the [`generation`](Self::generation) read before the listing. A committed
    /// hold at or below the cutoff was visible to the listing, so it survives only if the
    /// bindings still name its thread; a hold above the cutoff was written while the listing
    /// was in flight and is kept as is. Reservations always survive. A sweep therefore never
    /// opens a window for a duplicate claim, on either side of the commit.
    pub async fn reconcile(&self, bindings: Vec<ThreadBinding>, cutoff: u64) {
        let mut holds = self.holds.lock().await;
        holds.retain(|_, hold| hold.phase == HoldPhase::Reserved || hold.generation > cutoff);

        for binding in bindings {
            let key = (binding.tenant_id, binding.thread_id);
            if let Some(hold) = holds.get(&key) {
                // The surviving hold postdates the listing; it wins over the stale binding.
                if hold.phase == HoldPhase::Committed
                    && hold.sandbox_id.as_deref() != Some(binding.sandbox_id.as_str())
                {
                    warn!(
                        "thread '{}' of tenant '{}' holds '{}' but the cluster listed '{}'",
                        key.1,
                        key.0,
                        hold.sandbox_id.as_deref().unwrap_or("in flight"),
                        binding.sandbox_id
                    );
                }
                continue;
            }

            holds.insert(
                key,
                Hold {
                    sandbox_id: Some(binding.sandbox_id),
                    phase: HoldPhase::Committed,
                    generation: cutoff,
                },
            );
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
