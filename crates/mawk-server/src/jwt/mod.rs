//! JWT decoding for inbound requests and signing for outbound responses.
//!
//! ## Module Structure
//!
//! - `mod.rs`: algorithm registry, [`SigningKey`] and [`JwtError`]
//! - `inbound`: token lookup, verification and the tolerated/fatal decision
//! - `outbound`: claim templates and signed token placement

mod inbound;
mod outbound;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey};
use std::fmt;
use tracing::info;

pub use inbound::{decode_inbound, InboundOutcome, VALIDATION_HEADER};
pub use outbound::OutboundJwt;

use crate::config::JwtSigningConfig;
use crate::expression::{Context, EvalError, Template};

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("unsupported jwt algorithm {0:?}")]
    UnsupportedAlgorithm(String),
    #[error("jwt {name:?}: invalid key material: {message}")]
    Key { name: String, message: String },
    #[error("jwt {name:?}: {source}")]
    Template {
        name: String,
        #[source]
        source: EvalError,
    },
    #[error("jwt token not found")]
    MissingToken,
    #[error("jwt {0:?}: no signing key on this listener")]
    UnknownKey(String),
    #[error("jwt {0:?}: no public key configured for verification")]
    NoVerificationKey(String),
    #[error("jwt decode failed: {0}")]
    Decode(#[source] jsonwebtoken::errors::Error),
    #[error("jwt issued in the future")]
    IssuedInFuture,
    #[error("jwt encode failed: {0}")]
    Encode(#[source] jsonwebtoken::errors::Error),
}

/// Look up an algorithm by its JOSE name (`HS256`, `RS512`, `EdDSA`, ...).
pub fn algorithm_from_name(name: &str) -> Option<Algorithm> {
    let name = name.trim();
    name.parse::<Algorithm>()
        .ok()
        .or_else(|| name.to_ascii_uppercase().parse::<Algorithm>().ok())
        .or_else(|| name.eq_ignore_ascii_case("eddsa").then_some(Algorithm::EdDSA))
}

pub fn is_symmetric(algorithm: Algorithm) -> bool {
    matches!(
        algorithm,
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
    )
}

/// Signing and verification material for one listener.
///
/// Read-only once built. `Debug` never prints key material.
pub struct SigningKey {
    name: String,
    algorithm: Algorithm,
    encoding: EncodingKey,
    decoding: Option<DecodingKey>,
    material: String,
}

impl SigningKey {
    /// Build from config, evaluating the key templates (typically `env(..)`
    /// or `file(..)`) against `ctx`.
    pub fn from_config(config: &JwtSigningConfig, ctx: &Context) -> Result<Self, JwtError> {
        let algorithm = algorithm_from_name(&config.algorithm)
            .ok_or_else(|| JwtError::UnsupportedAlgorithm(config.algorithm.clone()))?;
        let render = |field: &Option<String>| -> Result<Option<String>, JwtError> {
            field
                .as_deref()
                .map(|raw| {
                    Template::parse(raw)
                        .and_then(|t| t.render_string(ctx))
                        .map_err(|source| JwtError::Template {
                            name: config.name.clone(),
                            source,
                        })
                })
                .transpose()
        };
        let key_err = |message: String| JwtError::Key {
            name: config.name.clone(),
            message,
        };

        let key = if is_symmetric(algorithm) {
            let secret = render(&config.secret)?
                .ok_or_else(|| key_err("missing secret".to_string()))?;
            Self {
                name: config.name.clone(),
                algorithm,
                encoding: EncodingKey::from_secret(secret.as_bytes()),
                decoding: Some(DecodingKey::from_secret(secret.as_bytes())),
                material: secret,
            }
        } else {
            let private = render(&config.private_key)?
                .ok_or_else(|| key_err("missing private_key".to_string()))?;
            let public = render(&config.public_key)?;
            let pem = private.as_bytes();
            let encoding = match algorithm {
                Algorithm::ES256 | Algorithm::ES384 => EncodingKey::from_ec_pem(pem),
                Algorithm::EdDSA => EncodingKey::from_ed_pem(pem),
                _ => EncodingKey::from_rsa_pem(pem),
            }
            .map_err(|e| key_err(e.to_string()))?;
            let decoding = public
                .map(|public| {
                    let pem = public.as_bytes();
                    match algorithm {
                        Algorithm::ES256 | Algorithm::ES384 => DecodingKey::from_ec_pem(pem),
                        Algorithm::EdDSA => DecodingKey::from_ed_pem(pem),
                        _ => DecodingKey::from_rsa_pem(pem),
                    }
                    .map_err(|e| key_err(e.to_string()))
                })
                .transpose()?;
            Self {
                name: config.name.clone(),
                algorithm,
                encoding,
                decoding,
                material: private,
            }
        };

        info!(name = %key.name, algorithm = ?key.algorithm, "jwt signing key loaded");
        Ok(key)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub(crate) fn encoding(&self) -> &EncodingKey {
        &self.encoding
    }

    pub(crate) fn decoding(&self) -> Option<&DecodingKey> {
        self.decoding.as_ref()
    }

    /// The secret or private key PEM. Only ever copied into a token when the
    /// outbound payload names the internal key claim.
    pub(crate) fn material(&self) -> &str {
        &self.material
    }

    /// Claim name that receives [`Self::material`] when declared in a payload.
    pub fn internal_key_claim(&self) -> String {
        format!("$._internal.{}.key", self.name)
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("name", &self.name)
            .field("algorithm", &self.algorithm)
            .field("verifies", &self.decoding.is_some())
            .finish_non_exhaustive()
    }
}
