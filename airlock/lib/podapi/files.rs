//! Single-use artifact downloads out of the sandbox.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use tokio::sync::Mutex;

use crate::{
    utils::{normalize_path, resolve_within_root},
    AirlockResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How long a minted download token stays redeemable.
const DOWNLOAD_TOKEN_TTL: Duration = Duration::from_secs(300);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Artifact paths registered for download, keyed by single-use token.
///
/// Every registered path is resolved against the artifacts root first, so a download token can
/// never name a file outside it.
pub struct ArtifactRegistry {
    /// The normalized artifacts root.
    root: String,

    /// Registered downloads not yet redeemed.
    pending: Mutex<HashMap<String, PendingDownload>>,
}

/// One registered download.
struct PendingDownload {
    /// The resolved path inside the artifacts root.
    path: String,

    /// When the token lapses.
    expires_at: Instant,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ArtifactRegistry {
    /// Creates a registry confined to `root`, which must be an absolute path.
    pub fn new(root: &str) -> AirlockResult<Self> {
        Ok(Self {
            root: normalize_path(root, true)?,
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// The artifacts root every registered path is confined to.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Registers a path for download and mints the single-use token redeeming it.
    ///
    /// The path must resolve inside the artifacts root; traversal out of it is rejected before
    /// a token is minted. Lapsed tokens are purged here, since a token that is never redeemed
    /// has no other removal path.
    pub async fn register(&self, requested: &str) -> AirlockResult<String> {
        let path = resolve_within_root(&self.root, requested)?;
        let token = uuid::Uuid::new_v4().to_string();
        let now = Instant::now();

        let mut pending = self.pending.lock().await;
        pending.retain(|_, download| download.expires_at > now);
        pending.insert(
            token.clone(),
            PendingDownload {
                path,
                expires_at: now + DOWNLOAD_TOKEN_TTL,
            },
        );

        Ok(token)
    }

    /// Redeems a download token and returns the path it was minted for.
    ///
    /// Each token redeems exactly once and lapses after `DOWNLOAD_TOKEN_TTL`.
    pub async fn take(&self, token: &str) -> Option<String> {
        let mut pending = self.pending.lock().await;
        let download = pending.remove(token)?;
        if Instant::now() > download.expires_at {
            return None;
        }
        Some(download.path)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
