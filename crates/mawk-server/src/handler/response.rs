//! Response builders shared by the request handlers, the router and the
//! listener middleware.

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, WWW_AUTHENTICATE};
use hyper::{Response, StatusCode};

pub type HttpResponse = Response<Full<Bytes>>;

pub const NOT_FOUND_BODY: &str = "404 page not found\n";

/// Build an HTTP response with the given status and body.
///
/// This function handles the unlikely case where Response::builder() fails
/// by returning a minimal 500 error response.
pub fn build_response(status: StatusCode, body: impl Into<Bytes>) -> HttpResponse {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .unwrap_or_else(|_| fallback())
}

/// Build an HTTP response carrying `headers`.
pub fn build_response_with_headers(
    status: StatusCode,
    headers: HeaderMap,
    body: impl Into<Bytes>,
) -> HttpResponse {
    let mut response = build_response(status, body);
    *response.headers_mut() = headers;
    response
}

fn fallback() -> HttpResponse {
    let mut response = Response::new(Full::new(Bytes::from("Internal server error\n")));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

/// `text/plain` reply with the status' canonical body text.
pub fn plain(status: StatusCode, body: &str) -> HttpResponse {
    let mut headers = HeaderMap::new();
    headers.insert(
        hyper::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    build_response_with_headers(status, headers, body.to_string())
}

pub fn not_found() -> HttpResponse {
    plain(StatusCode::NOT_FOUND, NOT_FOUND_BODY)
}

pub fn bad_request() -> HttpResponse {
    plain(StatusCode::BAD_REQUEST, "Bad Request\n")
}

pub fn internal_error() -> HttpResponse {
    plain(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error\n")
}

pub fn bad_gateway() -> HttpResponse {
    plain(StatusCode::BAD_GATEWAY, "Bad Gateway\n")
}

pub fn upgrade_required() -> HttpResponse {
    plain(StatusCode::UPGRADE_REQUIRED, "Upgrade Required\n")
}

pub fn unauthorized(realm: Option<&str>) -> HttpResponse {
    let mut response = plain(StatusCode::UNAUTHORIZED, "Unauthorized\n");
    if let Some(realm) = realm {
        if let Ok(value) = HeaderValue::from_str(&format!("Basic realm=\"{realm}\"")) {
            response.headers_mut().insert(WWW_AUTHENTICATE, value);
        }
    }
    response
}

/// Append a header, skipping names or values that are not valid HTTP.
pub fn append_header(headers: &mut HeaderMap, name: &str, value: &str) -> bool {
    match (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        (Ok(name), Ok(value)) => {
            headers.append(name, value);
            true
        }
        _ => {
            tracing::warn!(header = %name, "skipping invalid header");
            false
        }
    }
}

/// Insert a header, replacing earlier values of the same name.
pub fn set_header(headers: &mut HeaderMap, name: &str, value: &str) -> bool {
    match (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        (Ok(name), Ok(value)) => {
            headers.insert(name, value);
            true
        }
        _ => {
            tracing::warn!(header = %name, "skipping invalid header");
            false
        }
    }
}

#[cfg(test)]
pub(crate) async fn body_string(response: HttpResponse) -> String {
    use http_body_util::BodyExt;
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}
