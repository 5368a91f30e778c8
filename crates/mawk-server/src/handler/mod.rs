//! Per-request state machine.
//!
//! A [`RequestHandler`] is one compiled method handler of a route. Handling a
//! request walks a fixed sequence of [`Step`]s; every step returns an
//! [`Outcome`] naming the next step or ending the request, and the driver in
//! [`RequestHandler::handle`] loops until one of them does.
//!
//! ## Module Structure
//!
//! - `mod.rs`: compiled descriptors, [`HandlerError`] and the step driver
//! - `scope`: per-request values injected by the listener
//! - `proxy`: delegation to upstream targets
//! - `response`: response builders

mod proxy;
pub mod response;
mod scope;

use bytes::Bytes;
use hyper::header::{HeaderMap, SET_COOKIE};
use hyper::{Method, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub use proxy::ProxyTarget;
pub use response::HttpResponse;
pub use scope::{ProxyTable, RequestScope};

use crate::config::{
    ConfigError, HeaderValues, InboundJwtConfig, JwtOutput, RequestConfig, ResponseConfig,
    RouteProxyConfig, TickerConfig,
};
use crate::duration::parse_duration;
use crate::expression::{Context, EvalError, FunctionTable, RequestFacts, Template, ValueTemplate};
use crate::jwt::{decode_inbound, InboundOutcome, JwtError, OutboundJwt, VALIDATION_HEADER};
use crate::metrics;
use crate::plugin::{HookError, PluginRegistry};
use crate::sequencer::{time_seed, OrderPolicy, Sequencer};
use response::{append_header, build_response_with_headers, plain};

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("expression error: {0}")]
    Expression(#[from] EvalError),
    #[error("hook rejected request: {0}")]
    Hook(#[from] HookError),
    #[error(transparent)]
    Jwt(#[from] JwtError),
    #[error("no signing key {0:?} on this listener")]
    MissingSigningKey(String),
    #[error("no proxy target {0:?} on this listener")]
    UnknownProxy(String),
    #[error("proxy {target:?} failed: {source}")]
    Proxy {
        target: String,
        #[source]
        source: reqwest::Error,
    },
}

impl HandlerError {
    pub fn status(&self) -> StatusCode {
        match self {
            HandlerError::Expression(_) => StatusCode::BAD_REQUEST,
            HandlerError::Jwt(JwtError::Template { .. }) => StatusCode::BAD_REQUEST,
            HandlerError::Hook(hook) => hook.status,
            HandlerError::Jwt(_) | HandlerError::MissingSigningKey(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            HandlerError::UnknownProxy(_) | HandlerError::Proxy { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn into_response(self) -> HttpResponse {
        match self {
            HandlerError::Hook(hook) => plain(hook.status, &format!("{}\n", hook.message)),
            other => match other.status() {
                StatusCode::BAD_REQUEST => response::bad_request(),
                StatusCode::BAD_GATEWAY => response::bad_gateway(),
                _ => response::internal_error(),
            },
        }
    }
}

/// What a handler made of a request.
#[derive(Debug)]
pub enum Handled {
    Response(HttpResponse),
    /// The request did not satisfy this handler; the next candidate may try.
    NotFound,
}

/// Status of a compiled response: a code, or the name of a proxy target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusSpec {
    Code(StatusCode),
    Proxy(String),
}

impl StatusSpec {
    /// All-digit values are status codes and must be valid ones; anything
    /// else names a proxy target.
    pub fn parse(raw: Option<&str>) -> Result<Self, String> {
        let raw = raw.map(str::trim).unwrap_or_default();
        if raw.is_empty() {
            return Ok(StatusSpec::Code(StatusCode::OK));
        }
        if !raw.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(StatusSpec::Proxy(raw.to_string()));
        }
        raw.parse::<u16>()
            .ok()
            .and_then(|n| StatusCode::from_u16(n).ok())
            .map(StatusSpec::Code)
            .ok_or_else(|| format!("bad status {raw}"))
    }
}

#[derive(Debug, Clone)]
pub struct CompiledResponse {
    status: StatusSpec,
    headers: Vec<(String, Template)>,
    body: Option<ValueTemplate>,
    jwt: Option<OutboundJwt>,
}

impl CompiledResponse {
    pub fn compile(config: &ResponseConfig, context: &str) -> Result<Self, ConfigError> {
        let template_err = |source| ConfigError::Template {
            context: context.to_string(),
            source,
        };
        Ok(Self {
            status: StatusSpec::parse(config.status.as_deref())
                .map_err(|e| ConfigError::Invalid(format!("{context}: {e}")))?,
            headers: compile_headers(&config.headers).map_err(template_err)?,
            body: config
                .body
                .as_ref()
                .map(ValueTemplate::compile)
                .transpose()
                .map_err(template_err)?,
            jwt: config
                .jwt
                .as_ref()
                .map(OutboundJwt::compile)
                .transpose()
                .map_err(template_err)?,
        })
    }

    pub fn status(&self) -> &StatusSpec {
        &self.status
    }
}

fn compile_headers(
    headers: &std::collections::BTreeMap<String, HeaderValues>,
) -> Result<Vec<(String, Template)>, EvalError> {
    let mut out = Vec::new();
    for (name, values) in headers {
        for value in values.values() {
            out.push((name.clone(), Template::parse(value)?));
        }
    }
    Ok(out)
}

fn render_headers(
    headers: &[(String, Template)],
    ctx: &Context,
) -> Result<Vec<(String, String)>, EvalError> {
    headers
        .iter()
        .map(|(name, template)| Ok((name.clone(), template.render_string(ctx)?)))
        .collect()
}

/// Route-level delegation: every matched request goes to this target.
#[derive(Debug, Clone)]
struct RouteProxy {
    name: String,
    headers: Vec<(String, String)>,
}

impl From<&RouteProxyConfig> for RouteProxy {
    fn from(config: &RouteProxyConfig) -> Self {
        let headers = config
            .headers
            .iter()
            .flat_map(|(k, v)| v.values().into_iter().map(move |v| (k.clone(), v.to_string())))
            .collect();
        Self {
            name: config.name.clone(),
            headers,
        }
    }
}

/// One compiled method handler with its response rotation state.
#[derive(Debug)]
pub struct RequestHandler {
    methods: Vec<Method>,
    sequencer: Sequencer,
    responses: Vec<CompiledResponse>,
    delay: Option<Duration>,
    ticker: Option<TickerConfig>,
    jwt: Option<InboundJwtConfig>,
    headers: Vec<(String, Vec<String>)>,
    post_values: Vec<(String, String)>,
    route_proxy: Option<RouteProxy>,
    functions: Arc<FunctionTable>,
    plugins: Arc<PluginRegistry>,
}

impl RequestHandler {
    pub fn compile(
        config: &RequestConfig,
        route_path: &str,
        route_proxy: Option<&RouteProxyConfig>,
        functions: Arc<FunctionTable>,
        plugins: Arc<PluginRegistry>,
    ) -> Result<Self, ConfigError> {
        let methods = config
            .methods()
            .map(|m| {
                Method::from_bytes(m.as_bytes()).map_err(|_| {
                    ConfigError::Invalid(format!("route {route_path}: invalid method {m:?}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let delay = config
            .delay
            .as_deref()
            .filter(|d| !d.trim().is_empty())
            .map(parse_duration)
            .transpose()
            .map_err(|e| ConfigError::Invalid(format!("route {route_path}: {e}")))?;

        let responses = config
            .responses
            .iter()
            .enumerate()
            .map(|(i, r)| {
                CompiledResponse::compile(r, &format!("route {route_path} response {i}"))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let seed = config.seed.unwrap_or_else(time_seed);
        let sequencer = Sequencer::new(config.order, responses.len(), seed);
        debug!(
            path = %route_path,
            method = %config.method,
            order = %config.order,
            responses = responses.len(),
            seed,
            "compiled request handler"
        );

        Ok(Self {
            methods,
            sequencer,
            responses,
            delay,
            ticker: config.ticker.clone(),
            jwt: config.jwt.clone(),
            headers: config
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.values().into_iter().map(String::from).collect()))
                .collect(),
            post_values: config
                .post_values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            route_proxy: route_proxy.map(RouteProxy::from),
            functions,
            plugins,
        })
    }

    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    pub fn order(&self) -> OrderPolicy {
        self.sequencer.policy()
    }

    /// Repeat policy, read by push-style plugins.
    pub fn ticker(&self) -> Option<&TickerConfig> {
        self.ticker.as_ref()
    }

    /// Run the state machine for one request.
    pub async fn handle(
        &self,
        facts: &RequestFacts,
        scope: &RequestScope,
    ) -> Result<Handled, HandlerError> {
        let mut exchange = Exchange::default();
        let mut step = Step::Match;
        loop {
            let outcome = match step {
                Step::Match => self.match_request(facts),
                Step::RouteProxy => self.route_proxy(facts, scope).await,
                Step::Select => self.select(&mut exchange),
                Step::PreHooks => self.pre_hooks(facts).await,
                Step::Delay => self.delay().await,
                Step::ResolveStatus => self.resolve_status(&exchange, facts, scope).await,
                Step::DecodeJwt => self.decode_jwt(&mut exchange, facts, scope),
                Step::BuildContext => self.build_context(&mut exchange, facts),
                Step::ApplyHeaders => self.apply_headers(&mut exchange),
                Step::ResolveOutput => self.resolve_output(&mut exchange, scope),
                Step::Write => self.write(&mut exchange),
            };
            match outcome {
                Outcome::Continue(next) => step = next,
                Outcome::Done(response) => return Ok(Handled::Response(response)),
                Outcome::NotFound => return Ok(Handled::NotFound),
                Outcome::Fail(err) => return Err(err),
            }
        }
    }

    fn match_request(&self, facts: &RequestFacts) -> Outcome {
        for (name, expected) in &self.headers {
            let actual = facts.header_values(name);
            if actual.len() != expected.len() {
                debug!(header = %name, "required header count differs");
                return Outcome::NotFound;
            }
            if !expected
                .iter()
                .all(|want| want == "*" || actual.contains(&want.as_str()))
            {
                debug!(header = %name, "required header value missing");
                return Outcome::NotFound;
            }
        }
        for (name, expected) in &self.post_values {
            if expected != "*" && facts.form_value(name) != Some(expected.as_str()) {
                debug!(field = %name, "required post value missing");
                return Outcome::NotFound;
            }
        }
        if self.route_proxy.is_some() {
            Outcome::Continue(Step::RouteProxy)
        } else {
            Outcome::Continue(Step::Select)
        }
    }

    async fn route_proxy(&self, facts: &RequestFacts, scope: &RequestScope) -> Outcome {
        let Some(route_proxy) = &self.route_proxy else {
            return Outcome::Continue(Step::Select);
        };
        let Some(target) = scope.proxy(&route_proxy.name) else {
            return Outcome::Fail(HandlerError::UnknownProxy(route_proxy.name.clone()));
        };
        match target.forward(facts, &route_proxy.headers).await {
            Ok(response) => Outcome::Done(response),
            Err(err) => Outcome::Fail(err),
        }
    }

    fn select(&self, exchange: &mut Exchange) -> Outcome {
        match self.sequencer.next_index() {
            Some(index) => {
                exchange.selected = Some(index);
                Outcome::Continue(Step::PreHooks)
            }
            None => Outcome::NotFound,
        }
    }

    async fn pre_hooks(&self, facts: &RequestFacts) -> Outcome {
        match self.plugins.before_request(facts).await {
            Ok(()) => Outcome::Continue(Step::Delay),
            Err(err) => Outcome::Fail(err.into()),
        }
    }

    async fn delay(&self) -> Outcome {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Outcome::Continue(Step::ResolveStatus)
    }

    fn selected(&self, exchange: &Exchange) -> &CompiledResponse {
        // select runs before every step that reads the choice
        &self.responses[exchange.selected.unwrap_or_default()]
    }

    async fn resolve_status(
        &self,
        exchange: &Exchange,
        facts: &RequestFacts,
        scope: &RequestScope,
    ) -> Outcome {
        let response = self.selected(exchange);
        let name = match &response.status {
            StatusSpec::Code(_) => return Outcome::Continue(Step::DecodeJwt),
            StatusSpec::Proxy(name) => name,
        };
        let Some(target) = scope.proxy(name) else {
            return Outcome::Fail(HandlerError::UnknownProxy(name.clone()));
        };
        let ctx = Context::new(
            facts.variables(None, &self.plugins.variables()),
            self.functions.clone(),
        );
        let headers = match render_headers(&response.headers, &ctx) {
            Ok(headers) => headers,
            Err(err) => return Outcome::Fail(err.into()),
        };
        match target.forward(facts, &headers).await {
            Ok(response) => Outcome::Done(response),
            Err(err) => Outcome::Fail(err),
        }
    }

    fn decode_jwt(
        &self,
        exchange: &mut Exchange,
        facts: &RequestFacts,
        scope: &RequestScope,
    ) -> Outcome {
        let Some(policy) = &self.jwt else {
            return Outcome::Continue(Step::BuildContext);
        };
        match decode_inbound(policy, facts, scope.signing_key(&policy.name)) {
            Ok(InboundOutcome::Mismatch) => {
                metrics::record_jwt_outcome(InboundOutcome::Mismatch.label());
                Outcome::NotFound
            }
            Ok(outcome) => {
                metrics::record_jwt_outcome(outcome.label());
                exchange.inbound = outcome;
                Outcome::Continue(Step::BuildContext)
            }
            Err(err) => {
                metrics::record_jwt_outcome("rejected");
                warn!(jwt = %policy.name, error = %err, "jwt rejected");
                Outcome::Fail(err.into())
            }
        }
    }

    fn build_context(&self, exchange: &mut Exchange, facts: &RequestFacts) -> Outcome {
        let vars = facts.variables(exchange.inbound.claims(), &self.plugins.variables());
        exchange.context = Some(Context::new(vars, self.functions.clone()));
        Outcome::Continue(Step::ApplyHeaders)
    }

    fn apply_headers(&self, exchange: &mut Exchange) -> Outcome {
        let response = self.selected(exchange);
        let Some(ctx) = exchange.context.as_ref() else {
            return Outcome::Continue(Step::BuildContext);
        };
        let rendered = match render_headers(&response.headers, ctx) {
            Ok(rendered) => rendered,
            Err(err) => return Outcome::Fail(err.into()),
        };
        for (name, value) in rendered {
            append_header(&mut exchange.headers, &name, &value);
        }
        if let Some(result) = exchange.inbound.header_value() {
            append_header(&mut exchange.headers, VALIDATION_HEADER, result);
        }
        Outcome::Continue(Step::ResolveOutput)
    }

    fn resolve_output(&self, exchange: &mut Exchange, scope: &RequestScope) -> Outcome {
        let response = self.selected(exchange);
        let Some(ctx) = exchange.context.as_ref() else {
            return Outcome::Continue(Step::BuildContext);
        };

        if let Some(jwt) = &response.jwt {
            let Some(key) = scope.signing_key(jwt.name()) else {
                return Outcome::Fail(HandlerError::MissingSigningKey(jwt.name().to_string()));
            };
            let token = match jwt.sign(ctx, key) {
                Ok(token) => token,
                Err(err) => return Outcome::Fail(err.into()),
            };
            match jwt.output() {
                JwtOutput::Header => {
                    append_header(&mut exchange.headers, jwt.key(), &token);
                }
                JwtOutput::Cookie => {
                    let cookie = format!("{}={token}", jwt.key());
                    append_header(&mut exchange.headers, SET_COOKIE.as_str(), &cookie);
                }
                JwtOutput::Body => exchange.body = Bytes::from(token),
            }
            return Outcome::Continue(Step::Write);
        }

        if let Some(body) = &response.body {
            let value = match body.render(ctx) {
                Ok(value) => value,
                Err(err) => return Outcome::Fail(err.into()),
            };
            exchange.body = match value {
                Value::String(text) => Bytes::from(text),
                other => Bytes::from(other.to_string()),
            };
        }
        Outcome::Continue(Step::Write)
    }

    fn write(&self, exchange: &mut Exchange) -> Outcome {
        let status = match self.selected(exchange).status {
            StatusSpec::Code(code) => code,
            StatusSpec::Proxy(_) => StatusCode::OK,
        };
        Outcome::Done(build_response_with_headers(
            status,
            std::mem::take(&mut exchange.headers),
            std::mem::take(&mut exchange.body),
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Match,
    RouteProxy,
    Select,
    PreHooks,
    Delay,
    ResolveStatus,
    DecodeJwt,
    BuildContext,
    ApplyHeaders,
    ResolveOutput,
    Write,
}

enum Outcome {
    Continue(Step),
    Done(HttpResponse),
    NotFound,
    Fail(HandlerError),
}

/// Values carried between steps of one request.
struct Exchange {
    selected: Option<usize>,
    inbound: InboundOutcome,
    context: Option<Context>,
    headers: HeaderMap,
    body: Bytes,
}

impl Default for Exchange {
    fn default() -> Self {
        Self {
            selected: None,
            inbound: InboundOutcome::Absent,
            context: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}
