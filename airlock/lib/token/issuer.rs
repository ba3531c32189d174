//! Minting, verification, and revocation of claim tokens.
//!
//! A claim token is a short-lived Ed25519-signed JWT scoped to exactly one sandbox, tenant, and
//! investigation thread. The controller holds the signing key; sandboxes receive only the raw
//! public key (via their config object) and verify with [`TokenVerifier`].

use std::{collections::HashSet, fs, path::Path};

use chrono::{DateTime, Duration, TimeZone, Utc};
use getset::Getters;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use ring::{rand::SystemRandom, signature::Ed25519KeyPair};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::{AirlockError, AirlockResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The claims carried inside a claim token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// The sandbox the token is scoped to.
    pub sub: String,

    /// The tenant the sandbox is bound to.
    pub tenant: String,

    /// The investigation thread the sandbox is bound to.
    pub thread: String,

    /// The unique token id, used for revocation.
    pub jti: String,

    /// When the token was issued, as a Unix timestamp.
    pub iat: i64,

    /// When the token expires, as a Unix timestamp.
    pub exp: i64,
}

/// A freshly minted claim token.
#[derive(Debug, Clone, Getters)]
#[getset(get = "pub with_prefix")]
pub struct MintedToken {
    /// The encoded token in compact JWS form.
    token: String,

    /// The token's unique id.
    token_id: String,

    /// When the token expires.
    expires_at: DateTime<Utc>,
}

/// Mints and fully verifies claim tokens. Lives in the controller.
///
/// Revocation is by token id: revoked ids are refused by [`TokenIssuer::verify`] even while the
/// signature is still valid.
pub struct TokenIssuer {
    /// The Ed25519 signing key.
    encoding_key: EncodingKey,

    /// The raw 32-byte public key.
    verify_key: Vec<u8>,

    /// The verification half of the key.
    decoding_key: DecodingKey,

    /// The validation rules applied on verify.
    validation: Validation,

    /// How long minted tokens live.
    ttl: Duration,

    /// Ids of revoked tokens.
    revoked: RwLock<HashSet<String>>,
}

/// Verifies claim tokens from the public key alone. Lives inside the sandbox.
pub struct TokenVerifier {
    /// The verification key.
    decoding_key: DecodingKey,

    /// The validation rules applied on verify.
    validation: Validation,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl TokenIssuer {
    /// Creates an issuer from a PKCS#8-encoded Ed25519 signing key.
    pub fn new(signing_key: &[u8], ttl: Duration) -> AirlockResult<Self> {
        let pair = Ed25519KeyPair::from_pkcs8(signing_key).map_err(|e| {
            AirlockError::custom(anyhow::anyhow!("invalid signing key: {}", e))
        })?;
        let verify_key = ring::signature::KeyPair::public_key(&pair).as_ref().to_vec();

        Ok(Self {
            encoding_key: EncodingKey::from_ed_der(signing_key),
            decoding_key: DecodingKey::from_ed_der(&verify_key),
            validation: token_validation(),
            verify_key,
            ttl,
            revoked: RwLock::new(HashSet::new()),
        })
    }

    /// Creates an issuer from the signing key stored at `path`, generating one if absent.
    pub fn from_key_file(path: impl AsRef<Path>, ttl: Duration) -> AirlockResult<Self> {
        let signing_key = load_or_create_signing_key(path)?;
        Self::new(&signing_key, ttl)
    }

    /// The raw public key as hex, for publication into sandbox config objects.
    pub fn verify_key_hex(&self) -> String {
        hex::encode(&self.verify_key)
    }

    /// Mints a token scoped to `(sandbox_id, tenant_id, thread_id)` with the configured TTL.
    pub fn mint(
        &self,
        sandbox_id: &str,
        tenant_id: &str,
        thread_id: &str,
    ) -> AirlockResult<MintedToken> {
        self.mint_with_ttl(sandbox_id, tenant_id, thread_id, self.ttl)
    }

    /// Mints a token with an explicit TTL.
    pub fn mint_with_ttl(
        &self,
        sandbox_id: &str,
        tenant_id: &str,
        thread_id: &str,
        ttl: Duration,
    ) -> AirlockResult<MintedToken> {
        let issued_at = Utc::now();
        let expires_at = issued_at + ttl;
        let token_id = uuid::Uuid::new_v4().to_string();

        let claims = TokenClaims {
            sub: sandbox_id.to_string(),
            tenant: tenant_id.to_string(),
            thread: thread_id.to_string(),
            jti: token_id.clone(),
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
        };

        let token = encode(&Header::new(Algorithm::EdDSA), &claims, &self.encoding_key)?;
        let expires_at = Utc
            .timestamp_opt(claims.exp, 0)
            .single()
            .unwrap_or(expires_at);

        Ok(MintedToken {
            token,
            token_id,
            expires_at,
        })
    }

    /// Verifies a token: signature, expiry, sandbox scope, and revocation.
    pub async fn verify(&self, token: &str, expected_sandbox_id: &str) -> AirlockResult<TokenClaims> {
        let claims = decode_claims(token, &self.decoding_key, &self.validation, expected_sandbox_id)?;

        if self.revoked.read().await.contains(&claims.jti) {
            return Err(AirlockError::TokenRejected(format!(
                "token '{}' has been revoked",
                claims.jti
            )));
        }

        Ok(claims)
    }

    /// Revokes a token by id. Verification of that token fails from now on.
    pub async fn revoke(&self, token_id: &str) {
        self.revoked.write().await.insert(token_id.to_string());
    }
}

impl TokenVerifier {
    /// Creates a verifier from the raw 32-byte public key.
    pub fn new(verify_key: &[u8]) -> Self {
        Self {
            decoding_key: DecodingKey::from_ed_der(verify_key),
            validation: token_validation(),
        }
    }

    /// Creates a verifier from a hex-encoded public key, as published to sandboxes.
    pub fn from_hex(verify_key_hex: &str) -> AirlockResult<Self> {
        let verify_key = hex::decode(verify_key_hex.trim()).map_err(|e| {
            AirlockError::ValidationError(format!("invalid verify key hex: {}", e))
        })?;
        Ok(Self::new(&verify_key))
    }

    /// Verifies a token's signature, expiry, and sandbox scope.
    pub fn verify(&self, token: &str, expected_sandbox_id: &str) -> AirlockResult<TokenClaims> {
        decode_claims(token, &self.decoding_key, &self.validation, expected_sandbox_id)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Generates a fresh PKCS#8-encoded Ed25519 signing key.
pub fn generate_signing_key() -> AirlockResult<Vec<u8>> {
    let document = Ed25519KeyPair::generate_pkcs8(&SystemRandom::new())
        .map_err(|e| AirlockError::custom(anyhow::anyhow!("signing key generation failed: {}", e)))?;
    Ok(document.as_ref().to_vec())
}

/// Loads the hex-encoded signing key at `path`, creating and persisting one if absent.
pub fn load_or_create_signing_key(path: impl AsRef<Path>) -> AirlockResult<Vec<u8>> {
    let path = path.as_ref();

    if path.exists() {
        let contents = fs::read_to_string(path)?;
        return hex::decode(contents.trim()).map_err(|e| {
            AirlockError::ValidationError(format!(
                "signing key file '{}' is not valid hex: {}",
                path.display(),
                e
            ))
        });
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let signing_key = generate_signing_key()?;
    fs::write(path, hex::encode(&signing_key))?;
    Ok(signing_key)
}

fn token_validation() -> Validation {
    let mut validation = Validation::new(Algorithm::EdDSA);
    validation.leeway = 0;
    validation
}

fn decode_claims(
    token: &str,
    decoding_key: &DecodingKey,
    validation: &Validation,
    expected_sandbox_id: &str,
) -> AirlockResult<TokenClaims> {
    let data = decode::<TokenClaims>(token, decoding_key, validation)
        .map_err(|e| AirlockError::TokenRejected(format!("claim token failed verification: {}", e)))?;

    if data.claims.sub != expected_sandbox_id {
        return Err(AirlockError::TokenRejected(format!(
            "token is scoped to sandbox '{}', not '{}'",
            data.claims.sub, expected_sandbox_id
        )));
    }

    Ok(data.claims)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
