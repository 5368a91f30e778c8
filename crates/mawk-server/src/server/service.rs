//! Listener middleware around the route table.

use futures::FutureExt;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::HOST;
use hyper::{Method, Request, Version};
use std::convert::Infallible;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};

use super::auth;
use super::ListenerPlan;
use crate::expression::RequestFacts;
use crate::handler::response::{self, append_header, plain, HttpResponse};
use crate::handler::RequestScope;
use crate::metrics;
use crate::plugin::PluginRegistry;
use crate::recovery::panic_message;
use crate::reload::{reload_error_lines, ErrorKind, ErrorLog, ReloadStatus, RELOAD_ERROR_HEADER};
use crate::router::RouteTable;

const STATS_PATH: &str = "/_internal/server/stats";

/// Everything a listener's requests read. Replaced wholesale on reload.
#[derive(Debug)]
pub struct ServiceState {
    pub plan: Arc<ListenerPlan>,
    pub routes: Arc<RouteTable>,
    pub plugins: Arc<PluginRegistry>,
    pub status: Arc<ReloadStatus>,
    pub errors: Arc<ErrorLog>,
}

/// Serve one request, recovering from panics.
pub async fn handle(req: Request<Incoming>, state: Arc<ServiceState>) -> Result<HttpResponse, Infallible> {
    let start = Instant::now();
    let method = req.method().clone();

    let response = match AssertUnwindSafe(serve(req, &state)).catch_unwind().await {
        Ok(response) => response,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(server = %state.plan.name, panic = %message, "request handler panicked");
            metrics::record_panic();
            state.errors.record(ErrorKind::Panic, &message);
            response::internal_error()
        }
    };

    metrics::record_request(
        &state.plan.name,
        method.as_str(),
        response.status().as_u16(),
        start.elapsed().as_secs_f64() * 1000.0,
    );
    Ok(response)
}

async fn serve(req: Request<Incoming>, state: &ServiceState) -> HttpResponse {
    let plan = &state.plan;

    if plan.http2_only && req.version() != Version::HTTP_2 {
        return response::upgrade_required();
    }
    if let Some(basic) = &plan.basic_auth {
        if !auth::authorized(basic, req.headers()) {
            debug!(server = %plan.name, "basic auth rejected");
            return response::unauthorized(basic.realm.as_deref());
        }
    }

    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(error = %e, "failed to read request body");
            return response::bad_request();
        }
    };
    let base_url = format!(
        "{}://{}",
        plan.scheme,
        parts
            .headers
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .unwrap_or(&plan.host)
    );
    let facts = RequestFacts::from_parts(&parts, body);

    let mut response = match internal(&facts, state) {
        Some(response) => response,
        None => {
            let mut scope = RequestScope::new(
                plan.name.clone(),
                plan.signing.clone(),
                plan.proxies.clone(),
            );
            state.routes.dispatch(facts.clone(), &mut scope).await
        }
    };

    if !state.status.is_valid() {
        for line in reload_error_lines(&state.status, &base_url) {
            append_header(response.headers_mut(), RELOAD_ERROR_HEADER, &line);
        }
    }

    state.plugins.after_request(&facts, response.status()).await;
    response
}

/// The fixed endpoints served ahead of the route table.
fn internal(facts: &RequestFacts, state: &ServiceState) -> Option<HttpResponse> {
    if facts.method != Method::GET {
        return None;
    }
    match facts.path.as_str() {
        crate::reload::ERRORS_PATH => Some(plain(hyper::StatusCode::OK, &state.errors.render())),
        STATS_PATH => {
            let body = format!("addr: {}\n{}", state.plan.host, metrics::collect_metrics());
            Some(plain(hyper::StatusCode::OK, &body))
        }
        _ => None,
    }
}
