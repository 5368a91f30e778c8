use jsonwebtoken::Validation;
use serde_json::{Map, Value};
use std::collections::HashSet;
use tracing::{debug, warn};

use super::{JwtError, SigningKey};
use crate::config::{InboundJwtConfig, JwtInput};
use crate::expression::{stringify, RequestFacts};

/// Response header reporting the verification result when a policy asks for it.
pub const VALIDATION_HEADER: &str = "x-jwt-validation";

/// Result of applying an inbound policy to a request.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundOutcome {
    /// No token and nothing demanded one.
    Absent,
    /// Verified token. `report` is set when the policy asked for the result
    /// header.
    Valid {
        claims: Map<String, Value>,
        report: bool,
    },
    /// Verification failed, but the policy only asked to be told.
    Tolerated,
    /// Verified token whose claims differ from the policy's constraints.
    Mismatch,
}

impl InboundOutcome {
    /// Value for [`VALIDATION_HEADER`], if one should be sent.
    pub fn header_value(&self) -> Option<&'static str> {
        match self {
            InboundOutcome::Valid { report: true, .. } => Some("valid"),
            InboundOutcome::Tolerated => Some("invalid"),
            _ => None,
        }
    }

    pub fn claims(&self) -> Option<&Map<String, Value>> {
        match self {
            InboundOutcome::Valid { claims, .. } => Some(claims),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            InboundOutcome::Absent => "absent",
            InboundOutcome::Valid { .. } => "valid",
            InboundOutcome::Tolerated => "tolerated",
            InboundOutcome::Mismatch => "mismatch",
        }
    }
}

fn locate_token(policy: &InboundJwtConfig, facts: &RequestFacts) -> Option<String> {
    let token = match policy.input {
        JwtInput::Auth => {
            let value = facts.header("authorization")?;
            let (scheme, token) = value.trim().split_once(' ')?;
            if !scheme.eq_ignore_ascii_case(&policy.key) {
                return None;
            }
            token.trim().to_string()
        }
        JwtInput::Cookie => facts.cookie(&policy.key)?,
        JwtInput::Header => facts.header(&policy.key)?.trim().to_string(),
        JwtInput::Query => facts.query_value(&policy.key)?.to_string(),
    };
    (!token.is_empty()).then_some(token)
}

fn verify(token: &str, key: &SigningKey) -> Result<Map<String, Value>, JwtError> {
    let decoding = key
        .decoding()
        .ok_or_else(|| JwtError::NoVerificationKey(key.name().to_string()))?;

    let mut validation = Validation::new(key.algorithm());
    validation.required_spec_claims = HashSet::new();
    validation.leeway = 0;
    validation.validate_exp = true;
    validation.validate_nbf = true;
    validation.validate_aud = false;

    let data = jsonwebtoken::decode::<Map<String, Value>>(token, decoding, &validation)
        .map_err(JwtError::Decode)?;

    if let Some(iat) = data.claims.get("iat").and_then(Value::as_i64) {
        if iat > chrono::Utc::now().timestamp() {
            return Err(JwtError::IssuedInFuture);
        }
    }
    Ok(data.claims)
}

fn claims_match(policy: &InboundJwtConfig, claims: &Map<String, Value>) -> bool {
    policy
        .claims
        .iter()
        .all(|(name, expected)| claims.get(name).is_some_and(|v| stringify(v) == *expected))
}

/// Apply `policy` to a request.
///
/// One rule covers every token location: a missing or unverifiable token is
/// tolerated only when the policy asks for validation and does not require
/// the token. Otherwise a missing token passes as [`InboundOutcome::Absent`]
/// unless required, and an unverifiable one is an error.
///
/// `key` is only consulted once a token is found; a token with no key to
/// check it against counts as unverifiable.
pub fn decode_inbound(
    policy: &InboundJwtConfig,
    facts: &RequestFacts,
    key: Option<&SigningKey>,
) -> Result<InboundOutcome, JwtError> {
    let tolerant = policy.validate && !policy.required;

    let Some(token) = locate_token(policy, facts) else {
        if policy.required {
            return Err(JwtError::MissingToken);
        }
        return Ok(if policy.validate {
            InboundOutcome::Tolerated
        } else {
            InboundOutcome::Absent
        });
    };

    let verified = key
        .ok_or_else(|| JwtError::UnknownKey(policy.name.clone()))
        .and_then(|key| verify(&token, key));
    match verified {
        Ok(claims) => {
            if !claims_match(policy, &claims) {
                debug!(jwt = %policy.name, "jwt claims do not match constraints");
                return Ok(InboundOutcome::Mismatch);
            }
            Ok(InboundOutcome::Valid {
                claims,
                report: policy.validate,
            })
        }
        Err(err) if tolerant => {
            warn!(jwt = %policy.name, error = %err, "jwt validation failed, tolerated");
            Ok(InboundOutcome::Tolerated)
        }
        Err(err) => Err(err),
    }
}
