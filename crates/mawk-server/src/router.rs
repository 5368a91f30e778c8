//! Compiled route table shared by every listener.
//!
//! Paths are matched with `matchit`. Several request descriptors may share a
//! path and method; they are tried in configuration order and a "not found"
//! from one hands the request to the next.

use hyper::header::HeaderMap;
use hyper::{Method, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{Config, ConfigError, CorsConfig, FallbackConfig};
use crate::expression::{FunctionTable, RequestFacts};
use crate::handler::response::{self, append_header, build_response_with_headers, set_header};
use crate::handler::{Handled, HttpResponse, RequestHandler, RequestScope};
use crate::plugin::PluginRegistry;

#[derive(Debug)]
struct Route {
    pattern: String,
    cors: Option<CorsConfig>,
    handlers: HashMap<Method, Vec<Arc<RequestHandler>>>,
}

/// Reply for unmatched paths or methods.
#[derive(Debug, Clone)]
struct Fallback {
    status: StatusCode,
    body: String,
    headers: Vec<(String, String)>,
}

impl Fallback {
    fn from_config(config: &FallbackConfig, what: &str) -> Result<Self, ConfigError> {
        let status = StatusCode::from_u16(config.status)
            .map_err(|_| ConfigError::Invalid(format!("{what}: bad status {}", config.status)))?;
        let headers = config
            .headers
            .iter()
            .flat_map(|(k, v)| v.values().into_iter().map(move |v| (k.clone(), v.to_string())))
            .collect();
        Ok(Self {
            status,
            body: config
                .body
                .as_ref()
                .map(|b| format!("{b}\n"))
                .unwrap_or_default(),
            headers,
        })
    }

    fn respond(&self) -> HttpResponse {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            append_header(&mut headers, name, value);
        }
        build_response_with_headers(self.status, headers, self.body.clone())
    }
}

#[derive(Debug)]
pub struct RouteTable {
    router: matchit::Router<usize>,
    routes: Vec<Route>,
    not_found: Option<Fallback>,
    method_not_allowed: Option<Fallback>,
}

impl RouteTable {
    pub fn build(
        config: &Config,
        functions: Arc<FunctionTable>,
        plugins: Arc<PluginRegistry>,
    ) -> Result<Self, ConfigError> {
        let mut router = matchit::Router::new();
        let mut routes: Vec<Route> = Vec::new();
        let mut by_pattern: HashMap<String, usize> = HashMap::new();

        for route_config in &config.routes {
            let pattern = to_matchit_pattern(&route_config.path);
            let index = match by_pattern.get(&pattern) {
                Some(index) => *index,
                None => {
                    router.insert(pattern.clone(), routes.len()).map_err(|e| {
                        ConfigError::Invalid(format!("route {:?}: {e}", route_config.path))
                    })?;
                    by_pattern.insert(pattern.clone(), routes.len());
                    routes.push(Route {
                        pattern: pattern.clone(),
                        cors: None,
                        handlers: HashMap::new(),
                    });
                    routes.len() - 1
                }
            };

            let route = &mut routes[index];
            if route.cors.is_none() {
                route.cors = route_config.cors.clone();
            }
            for request in &route_config.requests {
                let handler = Arc::new(RequestHandler::compile(
                    request,
                    &route_config.path,
                    route_config.proxy.as_ref(),
                    functions.clone(),
                    plugins.clone(),
                )?);
                for method in handler.methods() {
                    route
                        .handlers
                        .entry(method.clone())
                        .or_default()
                        .push(handler.clone());
                }
            }
        }

        debug!(routes = routes.len(), "route table built");
        Ok(Self {
            router,
            routes,
            not_found: config
                .not_found
                .as_ref()
                .map(|f| Fallback::from_config(f, "not_found"))
                .transpose()?,
            method_not_allowed: config
                .method_not_allowed
                .as_ref()
                .map(|f| Fallback::from_config(f, "method_not_allowed"))
                .transpose()?,
        })
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|r| r.pattern.as_str())
    }

    pub fn not_found(&self) -> HttpResponse {
        match &self.not_found {
            Some(fallback) => fallback.respond(),
            None => response::not_found(),
        }
    }

    fn method_not_allowed(&self) -> HttpResponse {
        match &self.method_not_allowed {
            Some(fallback) => fallback.respond(),
            None => response::build_response(StatusCode::METHOD_NOT_ALLOWED, ""),
        }
    }

    /// Route a request and run its candidates until one answers.
    pub async fn dispatch(&self, facts: RequestFacts, scope: &mut RequestScope) -> HttpResponse {
        let Ok(matched) = self.router.at(&facts.path) else {
            return self.not_found();
        };
        let route = &self.routes[*matched.value];
        let params: Vec<(String, String)> = matched
            .params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        if facts.method == Method::OPTIONS {
            if let Some(cors) = &route.cors {
                let mut preflight = response::build_response(StatusCode::OK, "");
                apply_cors(preflight.headers_mut(), cors);
                return preflight;
            }
        }

        let mut response = match route.handlers.get(&facts.method) {
            None => self.method_not_allowed(),
            Some(handlers) => {
                let facts = facts.with_url_params(params);
                scope.load_candidates(handlers);
                self.try_candidates(&facts, scope).await
            }
        };
        if let Some(cors) = &route.cors {
            apply_cors(response.headers_mut(), cors);
        }
        response
    }

    async fn try_candidates(&self, facts: &RequestFacts, scope: &mut RequestScope) -> HttpResponse {
        while let Some(candidate) = scope.next_candidate() {
            match candidate.handle(facts, scope).await {
                Ok(Handled::Response(response)) => return response,
                Ok(Handled::NotFound) => {
                    debug!(
                        path = %facts.path,
                        remaining = scope.remaining_candidates(),
                        "candidate declined request"
                    );
                }
                Err(err) => {
                    warn!(path = %facts.path, error = %err, "request failed");
                    return err.into_response();
                }
            }
        }
        self.not_found()
    }
}

fn apply_cors(headers: &mut HeaderMap, cors: &CorsConfig) {
    set_header(headers, "access-control-allow-origin", &cors.allow_origin);
    if !cors.allow_methods.is_empty() {
        set_header(
            headers,
            "access-control-allow-methods",
            &cors.allow_methods.join(", "),
        );
    }
    if !cors.allow_headers.is_empty() {
        set_header(
            headers,
            "access-control-allow-headers",
            &cors.allow_headers.join(", "),
        );
    }
    if cors.allow_credentials {
        set_header(headers, "access-control-allow-credentials", "true");
    }
    if let Some(max_age) = cors.max_age {
        set_header(headers, "access-control-allow-max-age", &max_age.to_string());
    }
}

/// Translate `{name}`, `{name:regex}` and trailing `*` segments to matchit
/// syntax. Regex constraints are dropped.
fn to_matchit_pattern(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut chars = path.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '{' => {
                let mut name = String::new();
                let mut depth = 1;
                let mut in_constraint = false;
                for c in chars.by_ref() {
                    match c {
                        '{' => depth += 1,
                        '}' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        ':' if depth == 1 => in_constraint = true,
                        _ if !in_constraint => name.push(c),
                        _ => {}
                    }
                }
                out.push('{');
                out.push_str(&name);
                out.push('}');
            }
            '*' if chars.peek().is_none() => out.push_str("{*wildcard}"),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::builtin_functions;
    use crate::handler::response::body_string;
    use bytes::Bytes;
    use hyper::Request;
    use std::path::Path;

    fn table(yaml: &str) -> RouteTable {
        let config = Config::from_yaml_str(yaml).unwrap();
        RouteTable::build(
            &config,
            Arc::new(builtin_functions(Path::new("."))),
            Arc::new(PluginRegistry::new()),
        )
        .unwrap()
    }

    fn scope() -> RequestScope {
        RequestScope::new(Arc::from("default"), None, Arc::new(HashMap::new()))
    }

    fn request(method: Method, uri: &str, headers: &[(&str, &str)]) -> RequestFacts {
        let mut builder = Request::builder().method(method).uri(uri);
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        let (parts, _) = builder.body(()).unwrap().into_parts();
        RequestFacts::from_parts(&parts, Bytes::new())
    }

    const TWO_CANDIDATES: &str = r#"
routes:
  - path: /items/{id}
    cors:
      allow_methods: [GET, POST]
      allow_headers: [x-mode]
      max_age: 600
    requests:
      - method: get
        headers:
          x-mode: special
        responses:
          - body: "special ${url.id}"
      - method: get
        responses:
          - body: "plain ${url.id}"
"#;

    #[tokio::test]
    async fn test_header_mismatch_falls_through_to_next_candidate() {
        let routes = table(TWO_CANDIDATES);

        let response = routes
            .dispatch(request(Method::GET, "/items/7", &[]), &mut scope())
            .await;
        assert_eq!(body_string(response).await, "plain 7");

        let response = routes
            .dispatch(
                request(Method::GET, "/items/7", &[("x-mode", "special")]),
                &mut scope(),
            )
            .await;
        assert_eq!(response.headers()["access-control-allow-origin"], "*");
        assert_eq!(body_string(response).await, "special 7");
    }

    #[tokio::test]
    async fn test_all_candidates_declining_is_not_found() {
        let routes = table(
            r#"
routes:
  - path: /only
    requests:
      - method: get
        headers:
          x-a: "1"
        responses:
          - body: a
      - method: get
        headers:
          x-b: "1"
        responses:
          - body: b
"#,
        );
        let response = routes
            .dispatch(request(Method::GET, "/only", &[]), &mut scope())
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_string(response).await, "404 page not found\n");
    }

    #[tokio::test]
    async fn test_cors_preflight() {
        let routes = table(TWO_CANDIDATES);
        let response = routes
            .dispatch(request(Method::OPTIONS, "/items/1", &[]), &mut scope())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers["access-control-allow-methods"], "GET, POST");
        assert_eq!(headers["access-control-allow-headers"], "x-mode");
        assert_eq!(headers["access-control-allow-max-age"], "600");
        assert!(headers.get("access-control-allow-credentials").is_none());
    }

    #[tokio::test]
    async fn test_method_not_allowed_and_custom_not_found() {
        let routes = table(
            r#"
not_found:
  status: 404
  body: nothing here
  headers:
    x-fallback: "yes"
routes:
  - path: /thing
    requests:
      - method: get
        responses:
          - body: thing
"#,
        );
        let response = routes
            .dispatch(request(Method::DELETE, "/thing", &[]), &mut scope())
            .await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(body_string(response).await, "");

        let response = routes
            .dispatch(request(Method::GET, "/missing", &[]), &mut scope())
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()["x-fallback"], "yes");
        assert_eq!(body_string(response).await, "nothing here\n");
    }

    #[tokio::test]
    async fn test_same_path_routes_merge() {
        let routes = table(
            r#"
routes:
  - path: /merged
    requests:
      - method: get
        responses:
          - body: got
  - path: /merged
    requests:
      - method: post|put
        responses:
          - body: changed
"#,
        );
        assert_eq!(routes.len(), 1);
        let response = routes
            .dispatch(request(Method::PUT, "/merged", &[]), &mut scope())
            .await;
        assert_eq!(body_string(response).await, "changed");
    }

    #[test]
    fn test_pattern_translation() {
        assert_eq!(to_matchit_pattern("/a/{id}"), "/a/{id}");
        assert_eq!(to_matchit_pattern("/a/{id:[0-9]{2}}/b"), "/a/{id}/b");
        assert_eq!(to_matchit_pattern("/static/*"), "/static/{*wildcard}");
    }
}
