use jsonwebtoken::Header;
use serde_json::{Map, Value};

use super::{JwtError, SigningKey};
use crate::config::{JwtOutput, OutboundJwtConfig};
use crate::expression::{Context, EvalError, Template};

/// Registered claims that must be numeric dates.
const DATE_CLAIMS: [&str; 3] = ["exp", "nbf", "iat"];

/// A compiled outbound token descriptor.
#[derive(Debug, Clone)]
pub struct OutboundJwt {
    name: String,
    output: JwtOutput,
    key: String,
    claims: Vec<(&'static str, Template)>,
    roles: Vec<String>,
    auth_type: Vec<String>,
    payload: Vec<(String, Template)>,
}

impl OutboundJwt {
    pub fn compile(config: &OutboundJwtConfig) -> Result<Self, EvalError> {
        let registered = [
            ("sub", &config.sub),
            ("iss", &config.iss),
            ("aud", &config.aud),
            ("exp", &config.exp),
            ("nbf", &config.nbf),
            ("iat", &config.iat),
            ("jti", &config.jti),
        ];
        let mut claims = Vec::new();
        for (name, source) in registered {
            if let Some(source) = source {
                claims.push((name, Template::parse(source)?));
            }
        }
        let payload = config
            .payload
            .iter()
            .map(|(k, v)| Ok((k.clone(), Template::parse(v)?)))
            .collect::<Result<_, EvalError>>()?;

        Ok(Self {
            name: config.name.clone(),
            output: config.output,
            key: config.key.clone(),
            claims,
            roles: config.roles.clone(),
            auth_type: config.auth_type.clone(),
            payload,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn output(&self) -> JwtOutput {
        self.output
    }

    /// Header or cookie name the token is written under.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Evaluate the claim set against the request context.
    ///
    /// A payload entry named after the signing key's internal claim receives
    /// the key material itself, whatever value was configured for it.
    pub fn claims(&self, ctx: &Context, key: &SigningKey) -> Result<Map<String, Value>, JwtError> {
        let template_err = |source| JwtError::Template {
            name: self.name.clone(),
            source,
        };
        let mut out = Map::new();

        for (name, template) in &self.claims {
            let value = template.render(ctx).map_err(template_err)?;
            out.insert((*name).to_string(), normalize_claim(name, value));
        }
        if !self.roles.is_empty() {
            out.insert("roles".into(), string_array(&self.roles));
        }
        if !self.auth_type.is_empty() {
            out.insert("auth_type".into(), string_array(&self.auth_type));
        }

        let internal = key.internal_key_claim();
        for (name, template) in &self.payload {
            if *name == internal {
                out.insert(name.clone(), Value::String(key.material().to_string()));
            } else {
                out.insert(name.clone(), template.render(ctx).map_err(template_err)?);
            }
        }
        Ok(out)
    }

    pub fn sign(&self, ctx: &Context, key: &SigningKey) -> Result<String, JwtError> {
        let claims = self.claims(ctx, key)?;
        jsonwebtoken::encode(&Header::new(key.algorithm()), &claims, key.encoding())
            .map_err(JwtError::Encode)
    }
}

fn string_array(items: &[String]) -> Value {
    Value::Array(items.iter().cloned().map(Value::String).collect())
}

/// Date claims become integers; other numeric-looking strings stay strings.
fn normalize_claim(name: &str, value: Value) -> Value {
    if !DATE_CLAIMS.contains(&name) {
        return value;
    }
    match &value {
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or(value),
        Value::Number(n) => n
            .as_f64()
            .map(|f| Value::from(f.trunc() as i64))
            .unwrap_or(value),
        _ => value,
    }
}
