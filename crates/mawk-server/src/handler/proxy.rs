//! Delegation of a request to a configured upstream.

use bytes::Bytes;
use hyper::header::{HeaderMap, CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::debug;

use super::response::{build_response_with_headers, set_header, HttpResponse};
use super::HandlerError;
use crate::config::ProxyTargetConfig;
use crate::expression::RequestFacts;
use crate::metrics;

/// Global HTTP client for proxy requests
static HTTP_CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

fn get_http_client() -> &'static reqwest::Client {
    HTTP_CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new())
    })
}

/// A named upstream on a listener.
#[derive(Debug, Clone)]
pub struct ProxyTarget {
    pub name: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl From<&ProxyTargetConfig> for ProxyTarget {
    fn from(config: &ProxyTargetConfig) -> Self {
        let headers = config
            .headers
            .iter()
            .flat_map(|(k, v)| v.values().into_iter().map(move |v| (k.clone(), v.to_string())))
            .collect();
        Self {
            name: config.name.clone(),
            url: config.url.trim_end_matches('/').to_string(),
            headers,
        }
    }
}

/// Hop-by-hop headers plus those the client recomputes.
const SKIPPED_REQUEST_HEADERS: [&str; 10] = [
    "host",
    "content-length",
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Inbound headers worth forwarding. Names listed in `Connection` are
/// hop-by-hop for this request too.
fn forwardable_headers(inbound: &HeaderMap) -> HeaderMap {
    let listed: Vec<String> = inbound
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .collect();

    let mut headers = HeaderMap::new();
    for (name, value) in inbound {
        let name_str = name.as_str();
        if SKIPPED_REQUEST_HEADERS.contains(&name_str) || listed.iter().any(|l| l == name_str) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

impl ProxyTarget {
    /// Forward `facts` upstream.
    ///
    /// Header precedence, lowest first: the inbound request, this target's
    /// configured headers, then `overrides` (route or response headers).
    pub async fn forward(
        &self,
        facts: &RequestFacts,
        overrides: &[(String, String)],
    ) -> Result<HttpResponse, HandlerError> {
        let client = get_http_client();
        let target_url = format!("{}{}", self.url, facts.path_and_query());

        let mut headers = forwardable_headers(&facts.headers);
        for (name, value) in self.headers.iter().chain(overrides.iter()) {
            set_header(&mut headers, name, value);
        }

        debug!(target = %self.name, url = %target_url, "proxy request");
        let start = Instant::now();
        let response = client
            .request(facts.method.clone(), &target_url)
            .headers(headers)
            .body(facts.body.clone())
            .send()
            .await
            .map_err(|source| HandlerError::Proxy {
                target: self.name.clone(),
                source,
            })?;

        let status = response.status();
        let mut response_headers = HeaderMap::new();
        for (name, value) in response.headers() {
            if name != CONTENT_LENGTH && name != TRANSFER_ENCODING && name != CONNECTION {
                response_headers.append(name.clone(), value.clone());
            }
        }
        let body: Bytes = response.bytes().await.map_err(|source| HandlerError::Proxy {
            target: self.name.clone(),
            source,
        })?;

        metrics::record_proxy_call(&self.name, status.as_u16(), start.elapsed().as_secs_f64() * 1000.0);
        Ok(build_response_with_headers(status, response_headers, body))
    }
}
