use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

use super::HeaderValues;
use crate::sequencer::OrderPolicy;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    pub path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cors: Option<CorsConfig>,

    /// Forward every matched request to a listener proxy target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<RouteProxyConfig>,

    #[serde(default)]
    pub requests: Vec<RequestConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CorsConfig {
    #[serde(default = "default_allow_origin")]
    pub allow_origin: String,
    #[serde(default)]
    pub allow_methods: Vec<String>,
    #[serde(default)]
    pub allow_headers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<u64>,
    #[serde(default)]
    pub allow_credentials: bool,
}

fn default_allow_origin() -> String {
    "*".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteProxyConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, HeaderValues>,
}

/// One method handler on a route.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RequestConfig {
    /// `get`, `post`, or several joined with `|`.
    pub method: String,

    #[serde(default)]
    pub order: OrderPolicy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticker: Option<TickerConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt: Option<InboundJwtConfig>,

    /// Required request headers. `*` accepts any value.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, HeaderValues>,

    /// Required posted form fields. `*` accepts any value.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub post_values: BTreeMap<String, String>,

    #[serde(default)]
    pub responses: Vec<ResponseConfig>,
}

impl RequestConfig {
    pub fn methods(&self) -> impl Iterator<Item = String> + '_ {
        self.method
            .split('|')
            .map(|m| m.trim().to_ascii_uppercase())
            .filter(|m| !m.is_empty())
    }
}

/// Repeat policy consumed by push-style plugins.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TickerConfig {
    pub time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<TickerLimit>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TickerLimit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loops: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JwtInput {
    Auth,
    Cookie,
    Header,
    Query,
}

/// Where an inbound token is read from and what it must satisfy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InboundJwtConfig {
    pub name: String,
    pub input: JwtInput,
    /// Scheme for `auth`, otherwise the cookie/header/query name.
    pub key: String,
    #[serde(default)]
    pub validate: bool,
    #[serde(default)]
    pub required: bool,
    /// Claims that must equal the given values.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub claims: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResponseConfig {
    /// Numeric status, or the name of a listener proxy target.
    #[serde(default, deserialize_with = "string_or_number")]
    pub status: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, HeaderValues>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt: Option<OutboundJwtConfig>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }
    Ok(Option::<Raw>::deserialize(deserializer)?.map(|raw| match raw {
        Raw::Number(n) => n.to_string(),
        Raw::Text(s) => s,
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JwtOutput {
    Header,
    Cookie,
    Body,
}

/// Claims of an issued token. Every string is a template.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutboundJwtConfig {
    pub name: String,
    pub output: JwtOutput,
    #[serde(default)]
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub auth_type: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub payload: BTreeMap<String, String>,
}

/// Reply used when routing finds no path or no method.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FallbackConfig {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, HeaderValues>,
}
